use std::collections::BTreeMap;

use log::{info, warn};

use crate::{
  error::{Error, Result},
  iam::IamSynchronizer,
  policy::{
    oidc_provider_arn, partition, trusted_domains, IrsaDomain, PermissionSet, PolicyBuilder,
    RoleSpec, RoleType, STS_AUDIENCE,
  },
};

/// One entry of the workload identity catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadIdentity {
  pub name: &'static str,
  /// appended to `<cluster>-` to form the role name
  pub role_suffix: &'static str,
  pub namespace: &'static str,
  pub service_account: &'static str,
  pub permissions: PermissionSet,
}

/// Fixed table of workload identities every control plane gets
#[derive(Debug, Clone)]
pub struct IrsaCatalog {
  workloads: Vec<WorkloadIdentity>,
}

impl IrsaCatalog {
  pub fn new(workloads: Vec<WorkloadIdentity>) -> Self {
    Self { workloads }
  }

  pub fn standard() -> Self {
    Self::new(vec![
      WorkloadIdentity {
        name: "external-dns",
        role_suffix: "Route53Manager-Role",
        namespace: "kube-system",
        service_account: "external-dns",
        permissions: PermissionSet::Route53Records,
      },
      WorkloadIdentity {
        name: "cert-manager",
        role_suffix: "CertManager-Role",
        namespace: "kube-system",
        service_account: "cert-manager-app",
        permissions: PermissionSet::Route53Dns01,
      },
    ])
  }

  pub fn workloads(&self) -> &[WorkloadIdentity] {
    &self.workloads
  }
}

/// What the IRSA roles of one cluster are derived from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrsaCluster {
  pub cluster_name: String,
  pub region: String,
  pub account_id: String,
  pub custom_tags: BTreeMap<String, String>,
}

/// Who registers the cluster's OIDC provider in IAM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OidcProviderOwner {
  /// self-managed control plane, the operator registers it
  Operator,
  /// EKS registers it together with the control plane
  ControlPlane,
}

/// A catalog entry rendered for one cluster
#[derive(Debug, Clone)]
pub struct IrsaBinding {
  pub workload: &'static str,
  pub spec: RoleSpec,
  pub policy_name: String,
  pub policy_document: String,
  namespace: &'static str,
  service_account: &'static str,
}

impl IrsaBinding {
  fn new(workload: &WorkloadIdentity, cluster: &IrsaCluster) -> Result<Self> {
    let spec = RoleSpec {
      role_name: format!("{}-{}", cluster.cluster_name, workload.role_suffix),
      role_type: RoleType::Irsa,
      cluster_name: cluster.cluster_name.clone(),
      region: cluster.region.clone(),
      account_id: cluster.account_id.clone(),
      custom_tags: cluster.custom_tags.clone(),
    };
    PolicyBuilder::new(&spec)?;
    Ok(Self {
      workload: workload.name,
      policy_name: spec.policy_name(),
      policy_document: workload
        .permissions
        .document(partition(&cluster.region))
        .to_json(),
      spec,
      namespace: workload.namespace,
      service_account: workload.service_account,
    })
  }

  pub fn role_name(&self) -> &str {
    &self.spec.role_name
  }

  pub fn trust_policy(&self, domains: &[&str]) -> Result<String> {
    PolicyBuilder::new(&self.spec)?.irsa_trust_policy(self.namespace, self.service_account, domains)
  }
}

fn trusts(trust_policy: &str, domain: &str) -> bool {
  trusted_domains(trust_policy)
    .map(|domains| domains.iter().any(|d| d == domain))
    .unwrap_or(false)
}

pub struct IrsaManager<'a> {
  sync: &'a IamSynchronizer,
  catalog: &'a IrsaCatalog,
}

impl<'a> IrsaManager<'a> {
  pub fn new(sync: &'a IamSynchronizer, catalog: &'a IrsaCatalog) -> Self {
    Self { sync, catalog }
  }

  pub fn bindings(&self, cluster: &IrsaCluster) -> Result<Vec<IrsaBinding>> {
    self
      .catalog
      .workloads()
      .iter()
      .map(|w| IrsaBinding::new(w, cluster))
      .collect()
  }

  /// Converge every catalog role onto `domain`.
  ///
  /// Without a known issuer domain nothing is created, the caller is expected to requeue.
  pub async fn reconcile(
    &self,
    cluster: &IrsaCluster,
    domain: Option<&IrsaDomain>,
    owner: OidcProviderOwner,
  ) -> Result<()> {
    let domain = domain.filter(|d| !d.current.is_empty()).ok_or_else(|| {
      Error::configuration(
        cluster.cluster_name.clone(),
        "oidc issuer domain is not known yet",
      )
    })?;
    let bindings = self.bindings(cluster)?;

    if owner == OidcProviderOwner::Operator {
      let tags = self
        .sync
        .tag_policy()
        .desired(&cluster.cluster_name, &cluster.custom_tags);
      self
        .sync
        .ensure_oidc_provider(&domain.current, &[STS_AUDIENCE.to_string()], &tags)
        .await?;
    }

    for binding in &bindings {
      self.reconcile_binding(binding, domain).await?;
    }
    Ok(())
  }

  async fn reconcile_binding(&self, binding: &IrsaBinding, domain: &IrsaDomain) -> Result<()> {
    let current = domain.current.as_str();
    let final_trust = binding.trust_policy(&[current])?;

    // make before break: while the role does not trust the new issuer yet it keeps the old one
    let transitional = match domain.rotating_from() {
      Some(previous) => match self.sync.get_role(binding.role_name()).await? {
        Some(role) if !trusts(&role.trust_policy, current) => {
          Some(binding.trust_policy(&[current, previous])?)
        }
        _ => None,
      },
      None => None,
    };

    let first_trust = transitional.as_deref().unwrap_or(&final_trust);
    self
      .sync
      .ensure_role_with_trust(&binding.spec, first_trust)
      .await?;
    let tags = self
      .sync
      .tag_policy()
      .desired(&binding.spec.cluster_name, &binding.spec.custom_tags);
    self
      .sync
      .ensure_instance_profile(binding.role_name(), &tags)
      .await?;
    self
      .sync
      .ensure_inline_policy(
        binding.role_name(),
        &binding.policy_name,
        &binding.policy_document,
      )
      .await?;

    if transitional.is_some() {
      let confirmed = self
        .sync
        .get_role(binding.role_name())
        .await?
        .is_some_and(|role| trusts(&role.trust_policy, current));
      if !confirmed {
        return Err(Error::TrustNotConfirmed {
          role: binding.role_name().to_string(),
          domain: current.to_string(),
        });
      }
      self
        .sync
        .ensure_role_with_trust(&binding.spec, &final_trust)
        .await?;
      info!(
        "rotated {} role {} to issuer {}",
        binding.workload,
        binding.role_name(),
        current
      );
    }
    Ok(())
  }

  /// Delete every catalog role, then the provider registrations of the known domains
  pub async fn delete(&self, cluster: &IrsaCluster, domain: Option<&IrsaDomain>) -> Result<()> {
    for binding in self.bindings(cluster)? {
      self.sync.delete_role(binding.role_name()).await?;
    }

    let Some(domain) = domain.filter(|d| !d.current.is_empty()) else {
      warn!(
        "issuer domain of cluster {} unknown, leaving its oidc provider alone",
        cluster.cluster_name
      );
      return Ok(());
    };
    let partition = partition(&cluster.region);
    for d in std::iter::once(domain.current.as_str()).chain(domain.rotating_from()) {
      self
        .sync
        .delete_oidc_provider(&oidc_provider_arn(partition, &cluster.account_id, d))
        .await?;
    }
    Ok(())
  }
}
