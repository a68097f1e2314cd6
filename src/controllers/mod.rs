use std::sync::Arc;

use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::{
  api::{Api, ListParams},
  runtime::controller::Action,
  Client, Resource, ResourceExt,
};
use log::{debug, warn};
use tokio_util::sync::CancellationToken;

use crate::{
  capa::{AWSCluster, AWSClusterRoleIdentity, IdentityRef},
  config::OperatorConfig,
  error::{Error, Result},
  iam::{aws::SessionResolver, IamSynchronizer, RemoteCalls},
  irsa::IrsaCatalog,
  key::{self, CLUSTER_NAME_LABEL},
  tags::TagPolicy,
};

pub mod machine_template;
pub mod managed_control_plane;

const ROLE_IDENTITY_KIND: &str = "AWSClusterRoleIdentity";

/// Shared by every reconcile of both controllers
pub struct Context {
  pub client: Client,
  pub config: OperatorConfig,
  pub sessions: Arc<dyn SessionResolver>,
  pub catalog: IrsaCatalog,
  pub tags: TagPolicy,
  /// cancelled on shutdown, every reconcile works on a child of it
  pub shutdown: CancellationToken,
}

/// IAM access to one cluster's account
pub struct ClusterSession {
  pub sync: IamSynchronizer,
  pub account_id: String,
}

impl Context {
  pub fn new(
    client: Client,
    config: OperatorConfig,
    sessions: Arc<dyn SessionResolver>,
    shutdown: CancellationToken,
  ) -> Self {
    Self {
      client,
      config,
      sessions,
      catalog: IrsaCatalog::standard(),
      tags: TagPolicy::standard(),
      shutdown,
    }
  }

  /// Remote call wrapper for one reconcile, cancelled together with the operator
  pub fn remote_calls(&self) -> RemoteCalls {
    RemoteCalls::new(
      self.shutdown.child_token(),
      self.config.remote_call_timeout(),
    )
  }

  /// Assume the identity role behind `identity_ref` in `region`
  pub async fn cluster_session(
    &self,
    calls: &RemoteCalls,
    identity_ref: Option<&IdentityRef>,
    region: &str,
    owner: &str,
  ) -> Result<ClusterSession> {
    let identity = identity_name(identity_ref, owner)?;
    let identities = Api::<AWSClusterRoleIdentity>::all(self.client.clone());
    let role_arn = calls
      .run_kube("get", identity, identities.get_opt(identity))
      .await?
      .map(|i| i.spec.role_arn)
      .filter(|arn| !arn.is_empty())
      .ok_or_else(|| Error::configuration(identity, "cluster role identity has no role arn"))?;
    let account_id = key::account_id_from_arn(&role_arn)?;

    let client = self.sessions.iam_client(&role_arn, region).await?;
    Ok(ClusterSession {
      sync: IamSynchronizer::new(client, calls.clone(), self.tags.clone()),
      account_id,
    })
  }

  /// The single AWSCluster labelled with `cluster_name` in `namespace`
  pub async fn aws_cluster(
    &self,
    calls: &RemoteCalls,
    namespace: &str,
    cluster_name: &str,
  ) -> Result<AWSCluster> {
    let clusters = Api::<AWSCluster>::namespaced(self.client.clone(), namespace);
    let params = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
    let list = calls
      .run_kube(
        "list",
        &format!("AWSCluster {namespace}/{cluster_name}"),
        clusters.list(&params),
      )
      .await?;
    single_cluster(list.items, cluster_name)
  }

  /// Issuer domain of a self-managed control plane, `None` while it can't be derived
  pub async fn self_managed_irsa_domain(
    &self,
    calls: &RemoteCalls,
    namespace: &str,
    cluster_name: &str,
  ) -> Result<Option<String>> {
    let secret_name = key::cloudfront_secret_name(cluster_name);
    let secrets = Api::<Secret>::namespaced(self.client.clone(), namespace);
    let secret = calls
      .run_kube("get", &secret_name, secrets.get_opt(&secret_name))
      .await?;
    let cloudfront_domain = secret
      .as_ref()
      .and_then(|s| s.data.as_ref())
      .and_then(|d| d.get("domain"))
      .map(|v| String::from_utf8_lossy(&v.0).into_owned());

    let values_name = key::cluster_values_name(cluster_name);
    let config_maps = Api::<ConfigMap>::namespaced(self.client.clone(), namespace);
    let values = calls
      .run_kube("get", &values_name, config_maps.get_opt(&values_name))
      .await?
      .and_then(|cm| cm.data)
      .and_then(|mut d| d.remove("values"));

    current_irsa_domain(cluster_name, cloudfront_domain, values.as_deref())
  }
}

fn identity_name<'a>(identity_ref: Option<&'a IdentityRef>, owner: &str) -> Result<&'a str> {
  let identity = identity_ref
    .ok_or_else(|| Error::configuration(owner, "no identityRef set"))?;
  match identity.kind.as_deref() {
    None | Some(ROLE_IDENTITY_KIND) if !identity.name.is_empty() => Ok(&identity.name),
    None | Some(ROLE_IDENTITY_KIND) => Err(Error::configuration(owner, "identityRef has no name")),
    Some(other) => Err(Error::configuration(
      owner,
      format!("identityRef kind {other} is not supported, expected {ROLE_IDENTITY_KIND}"),
    )),
  }
}

fn single_cluster(mut items: Vec<AWSCluster>, cluster_name: &str) -> Result<AWSCluster> {
  match items.len() {
    1 => Ok(items.remove(0)),
    n => Err(Error::configuration(
      cluster_name,
      format!("expected 1 AWSCluster but found {n}"),
    )),
  }
}

/// The cloudfront domain wins over the one derived from the base domain
fn current_irsa_domain(
  cluster_name: &str,
  cloudfront_domain: Option<String>,
  values: Option<&str>,
) -> Result<Option<String>> {
  if let Some(domain) = cloudfront_domain.filter(|d| !d.trim().is_empty()) {
    return Ok(Some(domain.trim().to_string()));
  }
  let Some(values) = values else {
    return Ok(None);
  };
  Ok(
    key::base_domain_from_values(values)?
      .map(|base| key::irsa_domain(cluster_name, &base)),
  )
}

pub fn error_policy<K: Resource>(obj: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action {
  let delay = ctx.config.error_requeue(err.is_retryable());
  if err.is_retryable() {
    debug!("reconcile of {} failed, retrying in {:?}: {}", obj.name_any(), delay, err);
  } else {
    warn!("reconcile of {} failed ({:?}), retrying in {:?}: {}", obj.name_any(), err.kind(), delay, err);
  }
  Action::requeue(delay)
}
