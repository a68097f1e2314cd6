use std::collections::BTreeMap;

use serde::Deserialize;

use crate::{
  error::{Error, Result},
  policy::RoleType,
};

pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
pub const WATCH_FILTER_LABEL: &str = "cluster.x-k8s.io/watch-filter";
pub const WATCH_FILTER_VALUE: &str = "capi";
pub const ROLE_LABEL: &str = "cluster.x-k8s.io/role";

/// Issuer domain the cluster used before its current one
pub const PREVIOUS_IRSA_DOMAIN_ANNOTATION: &str =
  "capa-iam-operator.giantswarm.io/previous-irsa-domain";

pub const FINALIZER_PREFIX: &str = "capa-iam-controller.finalizers.giantswarm.io/";

pub fn finalizer_name(role_type: RoleType) -> String {
  format!("{FINALIZER_PREFIX}{}", role_type.as_str())
}

/// Role type a finalizer of ours stands for, `None` for foreign finalizers
pub fn role_type_from_finalizer(finalizer: &str) -> Option<RoleType> {
  let suffix = finalizer.strip_prefix(FINALIZER_PREFIX)?;
  [RoleType::ControlPlane, RoleType::Bastion, RoleType::Irsa]
    .into_iter()
    .find(|rt| rt.as_str() == suffix)
}

pub fn has_capi_watch_label(labels: &BTreeMap<String, String>) -> bool {
  labels.get(WATCH_FILTER_LABEL).map(String::as_str) == Some(WATCH_FILTER_VALUE)
}

pub fn cluster_name(labels: &BTreeMap<String, String>) -> Option<&str> {
  labels
    .get(CLUSTER_NAME_LABEL)
    .map(String::as_str)
    .filter(|n| !n.is_empty())
}

pub fn role_type(labels: &BTreeMap<String, String>) -> Option<RoleType> {
  labels.get(ROLE_LABEL).and_then(|v| RoleType::from_label(v))
}

/// Account id is the fifth field of `arn:partition:iam::account:role/name`
pub fn account_id_from_arn(arn: &str) -> Result<String> {
  match arn.split(':').collect::<Vec<_>>().as_slice() {
    ["arn", _, _, _, account, ..] if !account.is_empty() => Ok(account.to_string()),
    _ => Err(Error::configuration(arn, "not a valid role arn")),
  }
}

/// Domain an OIDC provider ARN was registered for
pub fn domain_from_oidc_provider_arn(arn: &str) -> Option<&str> {
  arn
    .split_once(":oidc-provider/")
    .map(|(_, domain)| domain)
    .filter(|d| !d.is_empty())
}

pub fn cluster_values_name(cluster_name: &str) -> String {
  format!("{cluster_name}-cluster-values")
}

pub fn cloudfront_secret_name(cluster_name: &str) -> String {
  format!("{cluster_name}-irsa-cloudfront")
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClusterValues {
  base_domain: Option<String>,
}

/// Read `baseDomain` out of the YAML stored in a cluster-values config map
pub fn base_domain_from_values(values: &str) -> Result<Option<String>> {
  let parsed: ClusterValues = serde_yaml::from_str(values)
    .map_err(|e| Error::configuration("cluster-values", format!("invalid values yaml: {e}")))?;
  Ok(parsed.base_domain.filter(|d| !d.is_empty()))
}

/// Default issuer domain of a self-managed control plane
pub fn irsa_domain(cluster_name: &str, base_domain: &str) -> String {
  format!("irsa.{cluster_name}.{base_domain}")
}

#[cfg(test)]
mod tests {
  use super::*;

  fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  #[test]
  fn reads_cluster_labels() {
    let l = labels(&[
      (CLUSTER_NAME_LABEL, "cluster1"),
      (WATCH_FILTER_LABEL, "capi"),
      (ROLE_LABEL, "bastion"),
    ]);
    assert!(has_capi_watch_label(&l));
    assert_eq!(cluster_name(&l), Some("cluster1"));
    assert_eq!(role_type(&l), Some(RoleType::Bastion));

    let l = labels(&[(ROLE_LABEL, "worker"), (CLUSTER_NAME_LABEL, "")]);
    assert!(!has_capi_watch_label(&l));
    assert_eq!(cluster_name(&l), None);
    assert_eq!(role_type(&l), None);
  }

  #[test]
  fn finalizers_are_per_role_type() {
    assert_eq!(
      finalizer_name(RoleType::ControlPlane),
      "capa-iam-controller.finalizers.giantswarm.io/control-plane"
    );
    assert_ne!(
      finalizer_name(RoleType::Bastion),
      finalizer_name(RoleType::Irsa)
    );
  }

  #[test]
  fn finalizers_map_back_to_role_types() {
    for rt in [RoleType::ControlPlane, RoleType::Bastion, RoleType::Irsa] {
      assert_eq!(role_type_from_finalizer(&finalizer_name(rt)), Some(rt));
    }
    assert_eq!(role_type_from_finalizer("other.io/control-plane"), None);
    assert_eq!(
      role_type_from_finalizer("capa-iam-controller.finalizers.giantswarm.io/worker"),
      None
    );
  }

  #[test]
  fn parses_account_ids() {
    assert_eq!(
      account_id_from_arn("arn:aws:iam::123456789012:role/capa-controller").unwrap(),
      "123456789012"
    );
    assert!(account_id_from_arn("arn:aws:iam:::role/x").is_err());
    assert!(account_id_from_arn("garbage").is_err());
  }

  #[test]
  fn oidc_domain_from_arn() {
    assert_eq!(
      domain_from_oidc_provider_arn(
        "arn:aws:iam::123456789012:oidc-provider/oidc.eks.eu-west-1.amazonaws.com/id/ABC"
      ),
      Some("oidc.eks.eu-west-1.amazonaws.com/id/ABC")
    );
    assert_eq!(domain_from_oidc_provider_arn("arn:aws:iam::1:role/x"), None);
  }

  #[test]
  fn base_domain_from_cluster_values() {
    let values = "baseDomain: cluster1.example.com\nprovider: capa\n";
    assert_eq!(
      base_domain_from_values(values).unwrap().as_deref(),
      Some("cluster1.example.com")
    );
    assert_eq!(base_domain_from_values("provider: capa").unwrap(), None);
    assert_eq!(
      irsa_domain("cluster1", "example.com"),
      "irsa.cluster1.example.com"
    );
  }
}
