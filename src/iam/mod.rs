use std::{collections::BTreeMap, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::{
  error::{Error, IamError, Result},
  policy::{semantically_equal, PolicyBuilder, RoleSpec},
  tags::{missing_tags, TagPolicy},
};

pub mod aws;
#[cfg(test)]
pub(crate) mod fake;

/// Remote view of a role, read fresh on every reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedRole {
  pub name: String,
  pub arn: String,
  /// decoded JSON, as returned by the API
  pub trust_policy: String,
  pub tags: BTreeMap<String, String>,
}

/// A role together with the dependents that keep it from being deleted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedRole {
  pub role: ManagedRole,
  /// policy name to decoded document
  pub inline_policies: BTreeMap<String, String>,
  /// names of the instance profiles the role is attached to
  pub instance_profiles: Vec<String>,
}

impl ObservedRole {
  pub fn has_instance_profile(&self) -> bool {
    !self.instance_profiles.is_empty()
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceProfile {
  pub name: String,
  pub roles: Vec<String>,
}

/// The subset of the IAM API the operator calls.
///
/// Implementations report absent entities as [`IamError::NotFound`] and
/// duplicate creates as [`IamError::AlreadyExists`].
#[async_trait]
pub trait IamApi: Send + Sync {
  async fn get_role(&self, name: &str) -> Result<ManagedRole, IamError>;
  async fn create_role(
    &self,
    name: &str,
    trust_policy: &str,
    tags: &BTreeMap<String, String>,
  ) -> Result<ManagedRole, IamError>;
  async fn update_assume_role_policy(&self, name: &str, trust_policy: &str) -> Result<(), IamError>;
  async fn tag_role(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<(), IamError>;
  async fn delete_role(&self, name: &str) -> Result<(), IamError>;

  async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, IamError>;
  async fn get_role_policy(&self, role: &str, policy: &str) -> Result<String, IamError>;
  async fn put_role_policy(&self, role: &str, policy: &str, document: &str) -> Result<(), IamError>;
  async fn delete_role_policy(&self, role: &str, policy: &str) -> Result<(), IamError>;

  async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile, IamError>;
  async fn create_instance_profile(
    &self,
    name: &str,
    tags: &BTreeMap<String, String>,
  ) -> Result<InstanceProfile, IamError>;
  async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<(), IamError>;
  async fn remove_role_from_instance_profile(&self, profile: &str, role: &str)
    -> Result<(), IamError>;
  async fn delete_instance_profile(&self, name: &str) -> Result<(), IamError>;
  async fn list_instance_profiles_for_role(&self, role: &str)
    -> Result<Vec<InstanceProfile>, IamError>;

  /// Returns the ARN of the new provider
  async fn create_open_id_connect_provider(
    &self,
    url: &str,
    client_ids: &[String],
    tags: &BTreeMap<String, String>,
  ) -> Result<String, IamError>;
  async fn delete_open_id_connect_provider(&self, arn: &str) -> Result<(), IamError>;
}

/// Wraps every remote call of one reconcile with its cancellation signal and a per-call timeout.
///
/// Both IAM and Kubernetes API calls go through it, so a cancelled reconcile stops at
/// the next call whichever side it talks to.
#[derive(Debug, Clone)]
pub struct RemoteCalls {
  cancel: CancellationToken,
  timeout: Duration,
}

impl RemoteCalls {
  pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
    Self { cancel, timeout }
  }

  pub async fn run<T, F>(&self, operation: &'static str, resource: &str, call: F) -> Result<T>
  where
    F: Future<Output = Result<T, IamError>>,
  {
    self
      .guarded(operation, resource, call, |e| Error::iam(operation, resource, e))
      .await
  }

  pub async fn run_kube<T, F>(&self, operation: &'static str, resource: &str, call: F) -> Result<T>
  where
    F: Future<Output = Result<T, kube::Error>>,
  {
    self
      .guarded(operation, resource, call, |e| Error::kube(operation, resource, e))
      .await
  }

  async fn guarded<T, E, F>(
    &self,
    operation: &'static str,
    resource: &str,
    call: F,
    wrap: impl FnOnce(E) -> Error,
  ) -> Result<T>
  where
    F: Future<Output = Result<T, E>>,
  {
    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(Error::Cancelled {
        operation,
        resource: resource.to_string(),
      }),
      res = tokio::time::timeout(self.timeout, call) => match res {
        Ok(res) => res.map_err(wrap),
        Err(_) => Err(Error::Timeout {
          operation,
          resource: resource.to_string(),
          timeout: self.timeout,
        }),
      },
    }
  }
}

fn found<T>(res: Result<T>) -> Result<Option<T>> {
  match res {
    Ok(v) => Ok(Some(v)),
    Err(e) if e.is_not_found() => Ok(None),
    Err(e) => Err(e),
  }
}

fn ignore_not_found<T: Default>(res: Result<T>) -> Result<T> {
  match res {
    Err(e) if e.is_not_found() => Ok(T::default()),
    other => other,
  }
}

/// Diffs desired against observed IAM state and issues the minimal set of calls
#[derive(Clone)]
pub struct IamSynchronizer {
  client: Arc<dyn IamApi>,
  calls: RemoteCalls,
  tags: TagPolicy,
}

impl IamSynchronizer {
  pub fn new(client: Arc<dyn IamApi>, calls: RemoteCalls, tags: TagPolicy) -> Self {
    Self {
      client,
      calls,
      tags,
    }
  }

  pub fn tag_policy(&self) -> &TagPolicy {
    &self.tags
  }

  pub async fn get_role(&self, name: &str) -> Result<Option<ManagedRole>> {
    found(self.calls.run("GetRole", name, self.client.get_role(name)).await)
  }

  /// Ensure a node role with the trust policy of its role type, returns the ARN
  pub async fn ensure_role(&self, spec: &RoleSpec) -> Result<String> {
    let trust = PolicyBuilder::new(spec)?.trust_policy()?;
    self.ensure_role_with_trust(spec, &trust).await
  }

  /// Ensure the role exists with exactly `trust_policy` and carries the tag set of `spec`
  pub async fn ensure_role_with_trust(&self, spec: &RoleSpec, trust_policy: &str) -> Result<String> {
    let name = spec.role_name.as_str();
    let tags = self.tags.desired(&spec.cluster_name, &spec.custom_tags);

    let observed = match self.get_role(name).await? {
      Some(role) => role,
      None => {
        let created = self
          .calls
          .run(
            "CreateRole",
            name,
            self.client.create_role(name, trust_policy, &tags),
          )
          .await;
        match created {
          Ok(role) => {
            info!("created role {} for cluster {}", name, spec.cluster_name);
            return Ok(role.arn);
          }
          // someone else won the race, converge on what they created
          Err(e) if e.is_already_exists() => {
            debug!("role {} appeared concurrently, converging", name);
            self
              .get_role(name)
              .await?
              .ok_or_else(|| Error::iam("GetRole", name, IamError::NotFound))?
          }
          Err(e) => return Err(e),
        }
      }
    };

    if !semantically_equal(&observed.trust_policy, trust_policy) {
      self
        .calls
        .run(
          "UpdateAssumeRolePolicy",
          name,
          self.client.update_assume_role_policy(name, trust_policy),
        )
        .await?;
      info!("updated trust policy of role {}", name);
    }

    let drift = missing_tags(&tags, &observed.tags);
    if !drift.is_empty() {
      self
        .calls
        .run("TagRole", name, self.client.tag_role(name, &drift))
        .await?;
      info!("updated {} tag(s) on role {}", drift.len(), name);
    }

    Ok(observed.arn)
  }

  /// Create the instance profile named after the role and attach the role to it
  pub async fn ensure_instance_profile(
    &self,
    role_name: &str,
    tags: &BTreeMap<String, String>,
  ) -> Result<()> {
    let existing = found(
      self
        .calls
        .run(
          "GetInstanceProfile",
          role_name,
          self.client.get_instance_profile(role_name),
        )
        .await,
    )?;

    let profile = match existing {
      Some(profile) => profile,
      None => {
        let created = self
          .calls
          .run(
            "CreateInstanceProfile",
            role_name,
            self.client.create_instance_profile(role_name, tags),
          )
          .await;
        match created {
          Ok(profile) => {
            info!("created instance profile {}", role_name);
            profile
          }
          Err(e) if e.is_already_exists() => {
            self
              .calls
              .run(
                "GetInstanceProfile",
                role_name,
                self.client.get_instance_profile(role_name),
              )
              .await?
          }
          Err(e) => return Err(e),
        }
      }
    };

    if profile.roles.iter().any(|r| r == role_name) {
      return Ok(());
    }

    let added = self
      .calls
      .run(
        "AddRoleToInstanceProfile",
        role_name,
        self.client.add_role_to_instance_profile(role_name, role_name),
      )
      .await;
    match added {
      Ok(()) => {
        info!("attached role {} to its instance profile", role_name);
        Ok(())
      }
      Err(e) if e.is_already_exists() => Ok(()),
      Err(e) => Err(e),
    }
  }

  /// Put the inline policy unless an equivalent document is already attached
  pub async fn ensure_inline_policy(
    &self,
    role_name: &str,
    policy_name: &str,
    document: &str,
  ) -> Result<()> {
    let names = self
      .calls
      .run(
        "ListRolePolicies",
        role_name,
        self.client.list_role_policies(role_name),
      )
      .await?;

    if names.iter().any(|n| n == policy_name) {
      let current = found(
        self
          .calls
          .run(
            "GetRolePolicy",
            role_name,
            self.client.get_role_policy(role_name, policy_name),
          )
          .await,
      )?;
      if current.is_some_and(|doc| semantically_equal(&doc, document)) {
        return Ok(());
      }
    }

    self
      .calls
      .run(
        "PutRolePolicy",
        role_name,
        self.client.put_role_policy(role_name, policy_name, document),
      )
      .await?;
    info!("put inline policy {} on role {}", policy_name, role_name);
    Ok(())
  }

  /// Ensure role, instance profile and inline policy of a node role
  pub async fn reconcile_node_role(&self, spec: &RoleSpec) -> Result<String> {
    let permissions = PolicyBuilder::new(spec)?.permission_policy()?;
    let arn = self.ensure_role(spec).await?;
    let tags = self.tags.desired(&spec.cluster_name, &spec.custom_tags);
    self.ensure_instance_profile(&spec.role_name, &tags).await?;
    self
      .ensure_inline_policy(&spec.role_name, &spec.policy_name(), &permissions)
      .await?;
    Ok(arn)
  }

  /// Read the role with its inline policies and instance profile attachments
  pub async fn observe_role(&self, role_name: &str) -> Result<Option<ObservedRole>> {
    let Some(role) = self.get_role(role_name).await? else {
      return Ok(None);
    };

    let names = ignore_not_found(
      self
        .calls
        .run(
          "ListRolePolicies",
          role_name,
          self.client.list_role_policies(role_name),
        )
        .await,
    )?;
    let mut inline_policies = BTreeMap::new();
    for policy in names {
      let document = found(
        self
          .calls
          .run(
            "GetRolePolicy",
            role_name,
            self.client.get_role_policy(role_name, &policy),
          )
          .await,
      )?;
      if let Some(document) = document {
        inline_policies.insert(policy, document);
      }
    }

    let instance_profiles = ignore_not_found(
      self
        .calls
        .run(
          "ListInstanceProfilesForRole",
          role_name,
          self.client.list_instance_profiles_for_role(role_name),
        )
        .await,
    )?
    .into_iter()
    .map(|p| p.name)
    .collect();

    Ok(Some(ObservedRole {
      role,
      inline_policies,
      instance_profiles,
    }))
  }

  /// Remove inline policies, instance profile and the role itself.
  ///
  /// Every step treats "not found" as done, so a half finished deletion resumes cleanly.
  pub async fn delete_role(&self, role_name: &str) -> Result<()> {
    let Some(observed) = self.observe_role(role_name).await? else {
      debug!("role {} is already gone", role_name);
      return Ok(());
    };

    for policy in observed.inline_policies.keys() {
      ignore_not_found(
        self
          .calls
          .run(
            "DeleteRolePolicy",
            role_name,
            self.client.delete_role_policy(role_name, policy),
          )
          .await,
      )?;
      debug!("deleted inline policy {} of role {}", policy, role_name);
    }

    for profile in &observed.instance_profiles {
      ignore_not_found(
        self
          .calls
          .run(
            "RemoveRoleFromInstanceProfile",
            profile,
            self
              .client
              .remove_role_from_instance_profile(profile, role_name),
          )
          .await,
      )?;
    }
    ignore_not_found(
      self
        .calls
        .run(
          "DeleteInstanceProfile",
          role_name,
          self.client.delete_instance_profile(role_name),
        )
        .await,
    )?;

    ignore_not_found(
      self
        .calls
        .run("DeleteRole", role_name, self.client.delete_role(role_name))
        .await,
    )?;
    info!("deleted role {}", role_name);
    Ok(())
  }

  /// Register `https://<domain>` as identity provider, an existing registration counts as success
  pub async fn ensure_oidc_provider(
    &self,
    domain: &str,
    client_ids: &[String],
    tags: &BTreeMap<String, String>,
  ) -> Result<()> {
    let url = format!("https://{domain}");
    let created = self
      .calls
      .run(
        "CreateOpenIDConnectProvider",
        domain,
        self
          .client
          .create_open_id_connect_provider(&url, client_ids, tags),
      )
      .await;
    match created {
      Ok(arn) => {
        info!("registered oidc provider {}", arn);
        Ok(())
      }
      Err(e) if e.is_already_exists() => Ok(()),
      Err(e) => Err(e),
    }
  }

  pub async fn delete_oidc_provider(&self, arn: &str) -> Result<()> {
    ignore_not_found(
      self
        .calls
        .run(
          "DeleteOpenIDConnectProvider",
          arn,
          self.client.delete_open_id_connect_provider(arn),
        )
        .await,
    )?;
    info!("deleted oidc provider {}", arn);
    Ok(())
  }
}
