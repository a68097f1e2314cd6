use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::{runtime::controller::Action, Api, Resource, ResourceExt};
use log::{debug, info};

use super::{ClusterSession, Context};
use crate::{
  capa::{AWSCluster, AWSMachineTemplate},
  error::{Error, Result},
  finalizer::{FinalizerCoordinator, ObjectStore, VersionedObjects},
  guard::{RoleReference, RoleReferences, SharedRoleGuard, TemplateReferences},
  iam::{IamSynchronizer, RemoteCalls},
  irsa::{IrsaCatalog, IrsaCluster, IrsaManager, OidcProviderOwner},
  key,
  policy::{IrsaDomain, RoleSpec, RoleType},
};

/// What a template asks this operator to manage
#[derive(Debug, PartialEq, Eq)]
struct NodeRole<'a> {
  role_type: RoleType,
  role_name: &'a str,
}

/// `None` for templates that carry no role of ours
fn node_role(template: &AWSMachineTemplate) -> Option<NodeRole<'_>> {
  let name = template.name_any();
  let labels = template.labels();
  if !key::has_capi_watch_label(labels) {
    debug!(
      "{} has no {}={} label, ignoring",
      name,
      key::WATCH_FILTER_LABEL,
      key::WATCH_FILTER_VALUE
    );
    return None;
  }
  let Some(role_type) = key::role_type(labels) else {
    debug!("{} is neither control-plane nor bastion, ignoring", name);
    return None;
  };
  let Some(role_name) = template.instance_profile() else {
    info!("{} has no iamInstanceProfile, not managing a role", name);
    return None;
  };
  Some(NodeRole {
    role_type,
    role_name,
  })
}

/// Node role types whose finalizer the template still carries, whatever its labels say now
fn held_role_types(template: &AWSMachineTemplate) -> Vec<RoleType> {
  template
    .finalizers()
    .iter()
    .filter_map(|f| key::role_type_from_finalizer(f))
    .filter(|rt| *rt != RoleType::Irsa)
    .collect()
}

fn irsa_domain(template: &AWSMachineTemplate, current: Option<String>) -> Option<IrsaDomain> {
  let previous = template
    .annotations()
    .get(key::PREVIOUS_IRSA_DOMAIN_ANNOTATION)
    .map(String::as_str);
  current.map(|c| IrsaDomain::new(&c, previous))
}

fn namespace_and_cluster(template: &AWSMachineTemplate) -> Result<(String, String)> {
  let name = template.name_any();
  let namespace = template
    .namespace()
    .ok_or_else(|| Error::configuration(&name, "AWSMachineTemplate is not namespaced"))?;
  let cluster_name = key::cluster_name(template.labels())
    .ok_or_else(|| {
      Error::configuration(&name, format!("missing {} label", key::CLUSTER_NAME_LABEL))
    })?
    .to_string();
  Ok((namespace, cluster_name))
}

pub async fn reconcile(template: Arc<AWSMachineTemplate>, ctx: Arc<Context>) -> Result<Action> {
  if template.meta().deletion_timestamp.is_some() {
    let held = held_role_types(&template);
    if held.is_empty() {
      return Ok(Action::await_change());
    }
    let calls = ctx.remote_calls();
    for role_type in held {
      cleanup(&template, role_type, &ctx, &calls).await?;
    }
    return Ok(Action::await_change());
  }

  let Some(role) = node_role(&template) else {
    return Ok(Action::await_change());
  };
  apply(&template, &role, &ctx).await
}

async fn session_for(
  ctx: &Context,
  calls: &RemoteCalls,
  aws_cluster: &AWSCluster,
) -> Result<ClusterSession> {
  ctx
    .cluster_session(
      calls,
      aws_cluster.spec.identity_ref.as_ref(),
      &aws_cluster.spec.region,
      &aws_cluster.name_any(),
    )
    .await
}

fn irsa_cluster(cluster_name: &str, aws_cluster: &AWSCluster, account_id: &str) -> IrsaCluster {
  IrsaCluster {
    cluster_name: cluster_name.to_string(),
    region: aws_cluster.spec.region.clone(),
    account_id: account_id.to_string(),
    custom_tags: aws_cluster.spec.additional_tags.clone().unwrap_or_default(),
  }
}

async fn apply(template: &AWSMachineTemplate, role: &NodeRole<'_>, ctx: &Context) -> Result<Action> {
  let (namespace, cluster_name) = namespace_and_cluster(template)?;
  let coordinator = FinalizerCoordinator::new(
    key::finalizer_name(role.role_type),
    ctx.config.finalizer_max_attempts,
  );
  let calls = ctx.remote_calls();

  let templates = ObjectStore::new(
    Api::<AWSMachineTemplate>::namespaced(ctx.client.clone(), &namespace),
    calls.clone(),
  );
  coordinator.add(&templates, &template.name_any()).await?;

  let aws_cluster = ctx.aws_cluster(&calls, &namespace, &cluster_name).await?;
  let clusters = ObjectStore::new(
    Api::<AWSCluster>::namespaced(ctx.client.clone(), &namespace),
    calls.clone(),
  );
  coordinator.add(&clusters, &aws_cluster.name_any()).await?;

  let session = session_for(ctx, &calls, &aws_cluster).await?;
  let spec = RoleSpec {
    role_name: role.role_name.to_string(),
    role_type: role.role_type,
    cluster_name: cluster_name.clone(),
    region: aws_cluster.spec.region.clone(),
    account_id: session.account_id.clone(),
    custom_tags: aws_cluster.spec.additional_tags.clone().unwrap_or_default(),
  };
  let arn = session.sync.reconcile_node_role(&spec).await?;
  info!(
    "reconciled {} role {} of cluster {} ({})",
    role.role_type, role.role_name, cluster_name, arn
  );

  if role.role_type == RoleType::ControlPlane && ctx.config.enable_irsa_roles {
    let current = ctx
      .self_managed_irsa_domain(&calls, &namespace, &cluster_name)
      .await?;
    let domain = irsa_domain(template, current);
    IrsaManager::new(&session.sync, &ctx.catalog)
      .reconcile(
        &irsa_cluster(&cluster_name, &aws_cluster, &session.account_id),
        domain.as_ref(),
        OidcProviderOwner::Operator,
      )
      .await?;
    info!("reconciled irsa roles of cluster {}", cluster_name);
  }

  Ok(Action::requeue(ctx.config.requeue_after()))
}

/// IRSA roles removed together with a control plane role
struct IrsaTarget<'a> {
  catalog: &'a IrsaCatalog,
  cluster: IrsaCluster,
  domain: Option<IrsaDomain>,
}

/// Deletion of one node role on behalf of one template
struct RoleRelease<'a, R> {
  role_name: &'a str,
  requester: RoleReference,
  guard: &'a SharedRoleGuard<R>,
  sync: &'a IamSynchronizer,
  irsa: Option<IrsaTarget<'a>>,
  coordinator: &'a FinalizerCoordinator,
  /// objects carrying the finalizer, released in this order
  holders: &'a [(&'a dyn VersionedObjects, String)],
}

impl<R: RoleReferences> RoleRelease<'_, R> {
  /// Delete the role unless another live object claims it, then release the finalizers.
  /// Returns whether the role was deleted.
  async fn run(&self) -> Result<bool> {
    let delete = self
      .guard
      .may_delete(self.role_name, &self.requester)
      .await?;
    if delete {
      self.sync.delete_role(self.role_name).await?;
      if let Some(irsa) = &self.irsa {
        IrsaManager::new(self.sync, irsa.catalog)
          .delete(&irsa.cluster, irsa.domain.as_ref())
          .await?;
      }
    }
    release_finalizers(self.coordinator, self.holders).await?;
    Ok(delete)
  }
}

async fn release_finalizers(
  coordinator: &FinalizerCoordinator,
  holders: &[(&dyn VersionedObjects, String)],
) -> Result<()> {
  for (objects, name) in holders {
    coordinator.remove(*objects, name).await?;
  }
  Ok(())
}

async fn cleanup(
  template: &AWSMachineTemplate,
  role_type: RoleType,
  ctx: &Context,
  calls: &RemoteCalls,
) -> Result<()> {
  let name = template.name_any();
  let (namespace, cluster_name) = namespace_and_cluster(template)?;
  let coordinator = FinalizerCoordinator::new(
    key::finalizer_name(role_type),
    ctx.config.finalizer_max_attempts,
  );
  let aws_cluster = ctx.aws_cluster(calls, &namespace, &cluster_name).await?;

  let clusters = ObjectStore::new(
    Api::<AWSCluster>::namespaced(ctx.client.clone(), &namespace),
    calls.clone(),
  );
  let values = ObjectStore::new(
    Api::<ConfigMap>::namespaced(ctx.client.clone(), &namespace),
    calls.clone(),
  );
  let templates = ObjectStore::new(
    Api::<AWSMachineTemplate>::namespaced(ctx.client.clone(), &namespace),
    calls.clone(),
  );
  // the template goes last, once it is released nothing retries the others
  let holders: [(&dyn VersionedObjects, String); 3] = [
    (&clusters, aws_cluster.name_any()),
    (&values, key::cluster_values_name(&cluster_name)),
    (&templates, name.clone()),
  ];

  let Some(role_name) = template.instance_profile() else {
    info!(
      "{} no longer names an instance profile, releasing its {} finalizer only",
      name, role_type
    );
    return release_finalizers(&coordinator, &holders).await;
  };

  let session = session_for(ctx, calls, &aws_cluster).await?;
  let irsa = if role_type == RoleType::ControlPlane && ctx.config.enable_irsa_roles {
    let current = ctx
      .self_managed_irsa_domain(calls, &namespace, &cluster_name)
      .await?;
    Some(IrsaTarget {
      catalog: &ctx.catalog,
      cluster: irsa_cluster(&cluster_name, &aws_cluster, &session.account_id),
      domain: irsa_domain(template, current),
    })
  } else {
    None
  };

  let guard = SharedRoleGuard::new(TemplateReferences::new(ctx.client.clone(), calls.clone()));
  let deleted = RoleRelease {
    role_name,
    requester: RoleReference::for_object(template),
    guard: &guard,
    sync: &session.sync,
    irsa,
    coordinator: &coordinator,
    holders: &holders,
  }
  .run()
  .await?;
  info!(
    "released {} role {} of cluster {} (deleted: {})",
    role_type, role_name, cluster_name, deleted
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use std::{collections::BTreeMap, time::Duration};

  use mockall::predicate::eq;
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::{
    capa::AWSMachineTemplateSpec,
    finalizer::{MockVersionedObjects, ObjectVersion, DEFAULT_MAX_ATTEMPTS},
    guard::MockRoleReferences,
    iam::fake::FakeIam,
    tags::TagPolicy,
  };

  const ROLE: &str = "cluster1-ControlPlane-Role";

  fn template(labels: &[(&str, &str)], profile: Option<&str>) -> AWSMachineTemplate {
    let mut t = AWSMachineTemplate::new("cluster1-control-plane", AWSMachineTemplateSpec::default());
    t.metadata.namespace = Some("org-a".to_string());
    t.metadata.labels = Some(
      labels
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect::<BTreeMap<_, _>>(),
    );
    t.spec.template.spec.iam_instance_profile = profile.map(str::to_string);
    t
  }

  fn reference(name: &str, deleting: bool) -> RoleReference {
    RoleReference {
      namespace: "org-a".to_string(),
      name: name.to_string(),
      uid: Some(format!("uid-{name}")),
      deleting,
    }
  }

  fn guard_with(refs: Vec<RoleReference>) -> SharedRoleGuard<MockRoleReferences> {
    let mut mock = MockRoleReferences::new();
    mock
      .expect_role_references()
      .with(eq(ROLE))
      .returning(move |_| Ok(refs.clone()));
    SharedRoleGuard::new(mock)
  }

  /// An object that must have our finalizer removed exactly once
  fn holder(name: &'static str) -> MockVersionedObjects {
    let finalizer = key::finalizer_name(RoleType::ControlPlane);
    let mut store = MockVersionedObjects::new();
    store.expect_fetch().with(eq(name)).times(1).returning(move |_| {
      Ok(Some(ObjectVersion {
        resource_version: "1".to_string(),
        finalizers: vec![finalizer.clone(), "other/finalizer".to_string()],
      }))
    });
    store
      .expect_write_finalizers()
      .with(eq(name), eq("1"), eq(vec!["other/finalizer".to_string()]))
      .times(1)
      .returning(|_, _, _| Ok(()));
    store
  }

  async fn synced_role(fake: &Arc<FakeIam>) -> IamSynchronizer {
    let sync = IamSynchronizer::new(
      fake.clone(),
      RemoteCalls::new(CancellationToken::new(), Duration::from_secs(5)),
      TagPolicy::standard(),
    );
    sync
      .reconcile_node_role(&RoleSpec {
        role_name: ROLE.to_string(),
        role_type: RoleType::ControlPlane,
        cluster_name: "cluster1".to_string(),
        region: "eu-west-1".to_string(),
        account_id: "123456789012".to_string(),
        custom_tags: BTreeMap::new(),
      })
      .await
      .unwrap();
    fake.clear_calls();
    sync
  }

  async fn release(
    sync: &IamSynchronizer,
    guard: &SharedRoleGuard<MockRoleReferences>,
    requester: &str,
    holders: &[(&dyn VersionedObjects, String)],
  ) -> bool {
    let coordinator = FinalizerCoordinator::new(
      key::finalizer_name(RoleType::ControlPlane),
      DEFAULT_MAX_ATTEMPTS,
    );
    RoleRelease {
      role_name: ROLE,
      requester: reference(requester, true),
      guard,
      sync,
      irsa: None,
      coordinator: &coordinator,
      holders,
    }
    .run()
    .await
    .unwrap()
  }

  fn delete_calls(fake: &FakeIam) -> usize {
    fake
      .calls()
      .iter()
      .filter(|c| **c == format!("DeleteRole {ROLE}"))
      .count()
  }

  #[test]
  fn picks_up_labelled_control_plane_templates() {
    let t = template(
      &[
        (key::WATCH_FILTER_LABEL, "capi"),
        (key::ROLE_LABEL, "control-plane"),
        (key::CLUSTER_NAME_LABEL, "cluster1"),
      ],
      Some(ROLE),
    );
    assert_eq!(
      node_role(&t),
      Some(NodeRole {
        role_type: RoleType::ControlPlane,
        role_name: ROLE,
      })
    );
  }

  #[test]
  fn ignores_foreign_templates() {
    let no_filter = template(&[(key::ROLE_LABEL, "bastion")], Some("r"));
    assert_eq!(node_role(&no_filter), None);

    let worker = template(
      &[(key::WATCH_FILTER_LABEL, "capi"), (key::ROLE_LABEL, "worker")],
      Some("r"),
    );
    assert_eq!(node_role(&worker), None);

    let no_profile = template(
      &[(key::WATCH_FILTER_LABEL, "capi"), (key::ROLE_LABEL, "bastion")],
      Some(""),
    );
    assert_eq!(node_role(&no_profile), None);
  }

  #[test]
  fn finalizers_drive_deletion_after_labels_changed() {
    // labels and instance profile were edited away after the finalizer was added
    let mut t = template(&[], None);
    t.metadata.finalizers = Some(vec![
      "other/finalizer".to_string(),
      key::finalizer_name(RoleType::Bastion),
      key::finalizer_name(RoleType::Irsa),
    ]);
    assert_eq!(node_role(&t), None);
    assert_eq!(held_role_types(&t), vec![RoleType::Bastion]);

    assert!(held_role_types(&template(&[], None)).is_empty());
  }

  #[test]
  fn missing_cluster_label_is_a_configuration_error() {
    let t = template(&[(key::ROLE_LABEL, "bastion")], Some("r"));
    let err = namespace_and_cluster(&t).unwrap_err();
    assert!(!err.is_retryable());

    let t = template(&[(key::CLUSTER_NAME_LABEL, "cluster1")], Some("r"));
    assert_eq!(
      namespace_and_cluster(&t).unwrap(),
      ("org-a".to_string(), "cluster1".to_string())
    );
  }

  #[test]
  fn previous_domain_comes_from_annotation() {
    let mut t = template(&[], None);
    t.metadata.annotations = Some(BTreeMap::from([(
      key::PREVIOUS_IRSA_DOMAIN_ANNOTATION.to_string(),
      "old.example.com".to_string(),
    )]));
    let domain = irsa_domain(&t, Some("https://new.example.com".to_string())).unwrap();
    assert_eq!(domain.current, "new.example.com");
    assert_eq!(domain.rotating_from(), Some("old.example.com"));

    assert_eq!(irsa_domain(&t, None), None);
  }

  #[tokio::test]
  async fn role_still_claimed_is_kept_but_finalizers_released() {
    let fake = Arc::new(FakeIam::default());
    let sync = synced_role(&fake).await;
    let before = fake.role(ROLE).unwrap();

    let guard = guard_with(vec![reference("a", true), reference("b", false)]);
    let cluster = holder("cluster1");
    let values = holder("cluster1-cluster-values");
    let template = holder("a");
    let holders: [(&dyn VersionedObjects, String); 3] = [
      (&cluster, "cluster1".to_string()),
      (&values, "cluster1-cluster-values".to_string()),
      (&template, "a".to_string()),
    ];

    assert!(!release(&sync, &guard, "a", &holders).await);
    assert_eq!(fake.mutating_calls(), Vec::<String>::new());
    assert_eq!(fake.role(ROLE), Some(before));
  }

  #[tokio::test]
  async fn last_owner_deletes_the_role_once() {
    let fake = Arc::new(FakeIam::default());
    let sync = synced_role(&fake).await;

    // a goes first while b is live
    let guard = guard_with(vec![reference("a", true), reference("b", false)]);
    let a = holder("a");
    let holders: [(&dyn VersionedObjects, String); 1] = [(&a, "a".to_string())];
    assert!(!release(&sync, &guard, "a", &holders).await);
    assert!(fake.role(ROLE).is_some());

    // then b, with a already gone
    let guard = guard_with(vec![reference("b", true)]);
    let b = holder("b");
    let holders: [(&dyn VersionedObjects, String); 1] = [(&b, "b".to_string())];
    assert!(release(&sync, &guard, "b", &holders).await);
    assert!(fake.role(ROLE).is_none());
    assert_eq!(fake.profile_roles(ROLE), None);
    assert_eq!(delete_calls(&fake), 1);
  }

  #[tokio::test]
  async fn owners_deleted_together_remove_the_role_once() {
    let fake = Arc::new(FakeIam::default());
    let sync = synced_role(&fake).await;

    for requester in ["a", "b"] {
      let guard = guard_with(vec![reference("a", true), reference("b", true)]);
      let store = holder(requester);
      let holders: [(&dyn VersionedObjects, String); 1] = [(&store, requester.to_string())];
      assert!(release(&sync, &guard, requester, &holders).await);
    }
    assert!(fake.role(ROLE).is_none());
    assert_eq!(delete_calls(&fake), 1);
  }
}
