use async_trait::async_trait;
use kube::{api::ListParams, Api, Resource, ResourceExt};
use log::info;

use crate::{
  capa::AWSMachineTemplate,
  error::Result,
  iam::RemoteCalls,
};

/// An object naming a role in its spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleReference {
  pub namespace: String,
  pub name: String,
  pub uid: Option<String>,
  /// the object is itself on its way out
  pub deleting: bool,
}

impl RoleReference {
  pub fn for_object<K: Resource>(obj: &K) -> Self {
    Self {
      namespace: obj.namespace().unwrap_or_default(),
      name: obj.name_any(),
      uid: obj.uid(),
      deleting: obj.meta().deletion_timestamp.is_some(),
    }
  }

  fn same_object(&self, other: &RoleReference) -> bool {
    match (&self.uid, &other.uid) {
      (Some(a), Some(b)) => a == b,
      _ => self.namespace == other.namespace && self.name == other.name,
    }
  }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoleReferences: Send + Sync {
  /// Every tracked object whose spec names `role_name`
  async fn role_references(&self, role_name: &str) -> Result<Vec<RoleReference>>;
}

/// Machine templates across all namespaces, matched on their instance profile
pub struct TemplateReferences {
  api: Api<AWSMachineTemplate>,
  calls: RemoteCalls,
}

impl TemplateReferences {
  pub fn new(client: kube::Client, calls: RemoteCalls) -> Self {
    Self {
      api: Api::all(client),
      calls,
    }
  }
}

#[async_trait]
impl RoleReferences for TemplateReferences {
  async fn role_references(&self, role_name: &str) -> Result<Vec<RoleReference>> {
    let templates = self
      .calls
      .run_kube(
        "list",
        "AWSMachineTemplate",
        self.api.list(&ListParams::default()),
      )
      .await?;
    Ok(
      templates
        .items
        .iter()
        .filter(|t| t.instance_profile() == Some(role_name))
        .map(RoleReference::for_object)
        .collect(),
    )
  }
}

/// Keeps a role alive while another object still claims it.
///
/// The check is read-then-act: a reference created after [`SharedRoleGuard::may_delete`]
/// looked but before the role is deleted is not seen.
pub struct SharedRoleGuard<R> {
  references: R,
}

impl<R: RoleReferences> SharedRoleGuard<R> {
  pub fn new(references: R) -> Self {
    Self { references }
  }

  /// Whether `requester` is the last live object claiming `role_name`.
  ///
  /// Objects that are being deleted themselves do not hold the role, otherwise two
  /// owners deleted together would each leave the role to the other.
  pub async fn may_delete(&self, role_name: &str, requester: &RoleReference) -> Result<bool> {
    let holders: Vec<_> = self
      .references
      .role_references(role_name)
      .await?
      .into_iter()
      .filter(|r| !r.same_object(requester) && !r.deleting)
      .collect();
    if let Some(holder) = holders.first() {
      info!(
        "role {} is still used by {}/{} ({} reference(s)), keeping it",
        role_name,
        holder.namespace,
        holder.name,
        holders.len()
      );
      return Ok(false);
    }
    Ok(true)
  }
}
