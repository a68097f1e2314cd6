use std::{
  collections::BTreeMap,
  sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use super::{IamApi, InstanceProfile, ManagedRole};
use crate::error::IamError;

pub const ACCOUNT_ID: &str = "123456789012";

#[derive(Debug, Clone, Default)]
struct Role {
  trust_policy: String,
  tags: BTreeMap<String, String>,
  policies: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
  roles: BTreeMap<String, Role>,
  profiles: BTreeMap<String, Vec<String>>,
  oidc_providers: BTreeMap<String, String>,
  calls: Vec<String>,
  trust_history: BTreeMap<String, Vec<String>>,
  failures: BTreeMap<&'static str, IamError>,
  race_create: Option<(String, String)>,
  stalled: Option<&'static str>,
  drop_trust_updates: bool,
}

/// In-memory IAM recording every call it receives
#[derive(Debug, Default)]
pub struct FakeIam {
  state: Mutex<State>,
}

fn role_arn(name: &str) -> String {
  format!("arn:aws:iam::{ACCOUNT_ID}:role/{name}")
}

impl FakeIam {
  fn lock(&self) -> MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  /// Record the call and hand back an injected failure, if any
  fn enter(&self, op: &'static str, resource: &str) -> Result<(), IamError> {
    let mut state = self.lock();
    state.calls.push(format!("{op} {resource}"));
    match state.failures.remove(op) {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  fn is_stalled(&self, op: &'static str) -> bool {
    self.lock().stalled == Some(op)
  }

  pub fn insert_role(&self, name: &str, trust_policy: &str, tags: BTreeMap<String, String>) {
    let mut state = self.lock();
    state
      .trust_history
      .entry(name.to_string())
      .or_default()
      .push(trust_policy.to_string());
    state.roles.insert(
      name.to_string(),
      Role {
        trust_policy: trust_policy.to_string(),
        tags,
        policies: BTreeMap::new(),
      },
    );
  }

  pub fn insert_oidc_provider(&self, domain: &str) {
    self.lock().oidc_providers.insert(
      format!("arn:aws:iam::{ACCOUNT_ID}:oidc-provider/{domain}"),
      format!("https://{domain}"),
    );
  }

  /// The next CreateRole of `name` finds the role already created by someone else
  pub fn race_create_role(&self, name: &str, trust_policy: &str) {
    self.lock().race_create = Some((name.to_string(), trust_policy.to_string()));
  }

  pub fn fail_next(&self, op: &'static str, err: IamError) {
    self.lock().failures.insert(op, err);
  }

  /// Calls of `op` never complete
  pub fn stall(&self, op: &'static str) {
    self.lock().stalled = Some(op);
  }

  /// UpdateAssumeRolePolicy succeeds without changing the stored trust, like a write
  /// that has not propagated yet
  pub fn drop_trust_updates(&self) {
    self.lock().drop_trust_updates = true;
  }

  pub fn role(&self, name: &str) -> Option<ManagedRole> {
    self.lock().roles.get(name).map(|r| ManagedRole {
      name: name.to_string(),
      arn: role_arn(name),
      trust_policy: r.trust_policy.clone(),
      tags: r.tags.clone(),
    })
  }

  pub fn inline_policies(&self, role: &str) -> BTreeMap<String, String> {
    self
      .lock()
      .roles
      .get(role)
      .map(|r| r.policies.clone())
      .unwrap_or_default()
  }

  pub fn profile_roles(&self, profile: &str) -> Option<Vec<String>> {
    self.lock().profiles.get(profile).cloned()
  }

  pub fn oidc_providers(&self) -> Vec<String> {
    self.lock().oidc_providers.keys().cloned().collect()
  }

  /// Every trust policy the role has had, in order
  pub fn trust_history(&self, role: &str) -> Vec<String> {
    self
      .lock()
      .trust_history
      .get(role)
      .cloned()
      .unwrap_or_default()
  }

  pub fn calls(&self) -> Vec<String> {
    self.lock().calls.clone()
  }

  pub fn mutating_calls(&self) -> Vec<String> {
    self
      .calls()
      .into_iter()
      .filter(|c| !c.starts_with("Get") && !c.starts_with("List"))
      .collect()
  }

  pub fn clear_calls(&self) {
    self.lock().calls.clear();
  }

  fn set_trust(state: &mut State, name: &str, trust_policy: &str) {
    if let Some(role) = state.roles.get_mut(name) {
      role.trust_policy = trust_policy.to_string();
    }
    state
      .trust_history
      .entry(name.to_string())
      .or_default()
      .push(trust_policy.to_string());
  }
}

#[async_trait]
impl IamApi for FakeIam {
  async fn get_role(&self, name: &str) -> Result<ManagedRole, IamError> {
    self.enter("GetRole", name)?;
    if self.is_stalled("GetRole") {
      std::future::pending::<()>().await;
    }
    self.role(name).ok_or(IamError::NotFound)
  }

  async fn create_role(
    &self,
    name: &str,
    trust_policy: &str,
    tags: &BTreeMap<String, String>,
  ) -> Result<ManagedRole, IamError> {
    self.enter("CreateRole", name)?;
    let raced = {
      let mut state = self.lock();
      match state.race_create.take() {
        Some((raced, trust)) if raced == name => Some(trust),
        other => {
          state.race_create = other;
          None
        }
      }
    };
    if let Some(trust) = raced {
      self.insert_role(name, &trust, BTreeMap::new());
      return Err(IamError::AlreadyExists);
    }
    if self.lock().roles.contains_key(name) {
      return Err(IamError::AlreadyExists);
    }
    self.insert_role(name, trust_policy, tags.clone());
    self.role(name).ok_or(IamError::NotFound)
  }

  async fn update_assume_role_policy(&self, name: &str, trust_policy: &str) -> Result<(), IamError> {
    self.enter("UpdateAssumeRolePolicy", name)?;
    let mut state = self.lock();
    if !state.roles.contains_key(name) {
      return Err(IamError::NotFound);
    }
    if !state.drop_trust_updates {
      Self::set_trust(&mut state, name, trust_policy);
    }
    Ok(())
  }

  async fn tag_role(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<(), IamError> {
    self.enter("TagRole", name)?;
    let mut state = self.lock();
    let role = state.roles.get_mut(name).ok_or(IamError::NotFound)?;
    role.tags.extend(tags.clone());
    Ok(())
  }

  async fn delete_role(&self, name: &str) -> Result<(), IamError> {
    self.enter("DeleteRole", name)?;
    let mut state = self.lock();
    let role = state.roles.get(name).ok_or(IamError::NotFound)?;
    let attached = state.profiles.values().any(|roles| roles.iter().any(|r| r == name));
    if !role.policies.is_empty() || attached {
      return Err(IamError::Service {
        code: "DeleteConflict".to_string(),
        message: "role still has dependents".to_string(),
      });
    }
    state.roles.remove(name);
    Ok(())
  }

  async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, IamError> {
    self.enter("ListRolePolicies", role)?;
    let state = self.lock();
    let role = state.roles.get(role).ok_or(IamError::NotFound)?;
    Ok(role.policies.keys().cloned().collect())
  }

  async fn get_role_policy(&self, role: &str, policy: &str) -> Result<String, IamError> {
    self.enter("GetRolePolicy", role)?;
    let state = self.lock();
    state
      .roles
      .get(role)
      .and_then(|r| r.policies.get(policy))
      .cloned()
      .ok_or(IamError::NotFound)
  }

  async fn put_role_policy(&self, role: &str, policy: &str, document: &str) -> Result<(), IamError> {
    self.enter("PutRolePolicy", role)?;
    let mut state = self.lock();
    let role = state.roles.get_mut(role).ok_or(IamError::NotFound)?;
    role.policies.insert(policy.to_string(), document.to_string());
    Ok(())
  }

  async fn delete_role_policy(&self, role: &str, policy: &str) -> Result<(), IamError> {
    self.enter("DeleteRolePolicy", role)?;
    let mut state = self.lock();
    let role = state.roles.get_mut(role).ok_or(IamError::NotFound)?;
    role.policies.remove(policy).map(|_| ()).ok_or(IamError::NotFound)
  }

  async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile, IamError> {
    self.enter("GetInstanceProfile", name)?;
    let state = self.lock();
    state
      .profiles
      .get(name)
      .map(|roles| InstanceProfile {
        name: name.to_string(),
        roles: roles.clone(),
      })
      .ok_or(IamError::NotFound)
  }

  async fn create_instance_profile(
    &self,
    name: &str,
    _tags: &BTreeMap<String, String>,
  ) -> Result<InstanceProfile, IamError> {
    self.enter("CreateInstanceProfile", name)?;
    let mut state = self.lock();
    if state.profiles.contains_key(name) {
      return Err(IamError::AlreadyExists);
    }
    state.profiles.insert(name.to_string(), Vec::new());
    Ok(InstanceProfile {
      name: name.to_string(),
      roles: Vec::new(),
    })
  }

  async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<(), IamError> {
    self.enter("AddRoleToInstanceProfile", profile)?;
    let mut state = self.lock();
    if !state.roles.contains_key(role) {
      return Err(IamError::NotFound);
    }
    let roles = state.profiles.get_mut(profile).ok_or(IamError::NotFound)?;
    if roles.iter().any(|r| r == role) {
      return Err(IamError::AlreadyExists);
    }
    roles.push(role.to_string());
    Ok(())
  }

  async fn remove_role_from_instance_profile(
    &self,
    profile: &str,
    role: &str,
  ) -> Result<(), IamError> {
    self.enter("RemoveRoleFromInstanceProfile", profile)?;
    let mut state = self.lock();
    let roles = state.profiles.get_mut(profile).ok_or(IamError::NotFound)?;
    let before = roles.len();
    roles.retain(|r| r != role);
    if roles.len() == before {
      return Err(IamError::NotFound);
    }
    Ok(())
  }

  async fn delete_instance_profile(&self, name: &str) -> Result<(), IamError> {
    self.enter("DeleteInstanceProfile", name)?;
    self
      .lock()
      .profiles
      .remove(name)
      .map(|_| ())
      .ok_or(IamError::NotFound)
  }

  async fn list_instance_profiles_for_role(
    &self,
    role: &str,
  ) -> Result<Vec<InstanceProfile>, IamError> {
    self.enter("ListInstanceProfilesForRole", role)?;
    let state = self.lock();
    if !state.roles.contains_key(role) {
      return Err(IamError::NotFound);
    }
    Ok(
      state
        .profiles
        .iter()
        .filter(|(_, roles)| roles.iter().any(|r| r == role))
        .map(|(name, roles)| InstanceProfile {
          name: name.clone(),
          roles: roles.clone(),
        })
        .collect(),
    )
  }

  async fn create_open_id_connect_provider(
    &self,
    url: &str,
    _client_ids: &[String],
    _tags: &BTreeMap<String, String>,
  ) -> Result<String, IamError> {
    self.enter("CreateOpenIDConnectProvider", url)?;
    let domain = url.trim_start_matches("https://");
    let arn = format!("arn:aws:iam::{ACCOUNT_ID}:oidc-provider/{domain}");
    let mut state = self.lock();
    if state.oidc_providers.contains_key(&arn) {
      return Err(IamError::AlreadyExists);
    }
    state.oidc_providers.insert(arn.clone(), url.to_string());
    Ok(arn)
  }

  async fn delete_open_id_connect_provider(&self, arn: &str) -> Result<(), IamError> {
    self.enter("DeleteOpenIDConnectProvider", arn)?;
    self
      .lock()
      .oidc_providers
      .remove(arn)
      .map(|_| ())
      .ok_or(IamError::NotFound)
  }
}
