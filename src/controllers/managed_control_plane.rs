use std::{sync::Arc, time::Duration};

use kube::{runtime::controller::Action, Api, Resource, ResourceExt};
use log::{debug, info};

use super::Context;
use crate::{
  capa::AWSManagedControlPlane,
  error::{Error, Result},
  finalizer::{FinalizerCoordinator, ObjectStore},
  irsa::{IrsaCluster, IrsaManager, OidcProviderOwner},
  key,
  policy::{IrsaDomain, RoleType},
};

/// How long to wait for CAPA to fill in the control plane role and issuer
const NOT_READY_REQUEUE: Duration = Duration::from_secs(60);

fn oidc_domain(cp: &AWSManagedControlPlane) -> Option<IrsaDomain> {
  cp.oidc_provider_arn()
    .and_then(key::domain_from_oidc_provider_arn)
    .map(|domain| IrsaDomain::new(domain, None))
}

fn irsa_cluster(cp: &AWSManagedControlPlane, cluster_name: &str, account_id: &str) -> IrsaCluster {
  IrsaCluster {
    cluster_name: cluster_name.to_string(),
    region: cp.spec.region.clone(),
    account_id: account_id.to_string(),
    custom_tags: cp.spec.additional_tags.clone().unwrap_or_default(),
  }
}

pub async fn reconcile(cp: Arc<AWSManagedControlPlane>, ctx: Arc<Context>) -> Result<Action> {
  let name = cp.name_any();
  let finalizer = key::finalizer_name(RoleType::Irsa);
  let deleting = cp.meta().deletion_timestamp.is_some();
  // once our finalizer is on, deletion runs whatever the labels say now
  if deleting && !cp.finalizers().contains(&finalizer) {
    return Ok(Action::await_change());
  }
  if !deleting && !key::has_capi_watch_label(cp.labels()) {
    debug!(
      "{} has no {}={} label, ignoring",
      name,
      key::WATCH_FILTER_LABEL,
      key::WATCH_FILTER_VALUE
    );
    return Ok(Action::await_change());
  }
  let namespace = cp
    .namespace()
    .ok_or_else(|| Error::configuration(&name, "AWSManagedControlPlane is not namespaced"))?;
  let cluster_name = key::cluster_name(cp.labels())
    .ok_or_else(|| {
      Error::configuration(&name, format!("missing {} label", key::CLUSTER_NAME_LABEL))
    })?
    .to_string();
  let coordinator = FinalizerCoordinator::new(finalizer, ctx.config.finalizer_max_attempts);
  let calls = ctx.remote_calls();
  let control_planes = ObjectStore::new(
    Api::<AWSManagedControlPlane>::namespaced(ctx.client.clone(), &namespace),
    calls.clone(),
  );

  if deleting {
    let session = ctx
      .cluster_session(&calls, cp.spec.identity_ref.as_ref(), &cp.spec.region, &name)
      .await?;
    IrsaManager::new(&session.sync, &ctx.catalog)
      .delete(
        &irsa_cluster(&cp, &cluster_name, &session.account_id),
        oidc_domain(&cp).as_ref(),
      )
      .await?;
    coordinator.remove(&control_planes, &name).await?;
    info!("released irsa roles of cluster {}", cluster_name);
    return Ok(Action::await_change());
  }

  if cp.spec.role_name.as_deref().unwrap_or_default().is_empty() {
    info!("{} has no spec.roleName yet, waiting for role creation", name);
    return Ok(Action::requeue(NOT_READY_REQUEUE));
  }
  coordinator.add(&control_planes, &name).await?;

  let Some(domain) = oidc_domain(&cp) else {
    info!("{} has no oidc provider yet, waiting", name);
    return Ok(Action::requeue(NOT_READY_REQUEUE));
  };
  let session = ctx
    .cluster_session(&calls, cp.spec.identity_ref.as_ref(), &cp.spec.region, &name)
    .await?;
  IrsaManager::new(&session.sync, &ctx.catalog)
    .reconcile(
      &irsa_cluster(&cp, &cluster_name, &session.account_id),
      Some(&domain),
      OidcProviderOwner::ControlPlane,
    )
    .await?;
  info!(
    "reconciled irsa roles of cluster {} for issuer {}",
    cluster_name, domain.current
  );
  Ok(Action::requeue(ctx.config.requeue_after()))
}
