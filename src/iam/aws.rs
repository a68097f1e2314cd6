use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use aws_config::{sts::AssumeRoleProvider, SdkConfig};
use aws_sdk_iam::{
  config::{retry::RetryConfig, SharedCredentialsProvider},
  error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
  types::{InstanceProfile as SdkInstanceProfile, Role, Tag},
  Client,
};
use aws_types::region::Region;
use log::debug;

use super::{IamApi, InstanceProfile, ManagedRole};
use crate::error::{Error, IamError, Result};

const SESSION_NAME: &str = "capa-iam-operator";

fn classify<E, R>(err: SdkError<E, R>) -> IamError
where
  E: ProvideErrorMetadata + std::error::Error + 'static,
  R: std::fmt::Debug,
{
  if matches!(
    err,
    SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_)
  ) {
    return IamError::Transient(DisplayErrorContext(&err).to_string());
  }
  let (code, message) = match err.as_service_error() {
    Some(service) => (
      service.code().unwrap_or("Unknown").to_string(),
      service.message().unwrap_or_default().to_string(),
    ),
    None => (
      "Unknown".to_string(),
      DisplayErrorContext(&err).to_string(),
    ),
  };
  match code.as_str() {
    "NoSuchEntity" => IamError::NotFound,
    "EntityAlreadyExists" => IamError::AlreadyExists,
    "Throttling" | "ThrottlingException" | "RequestLimitExceeded" | "ServiceFailure"
    | "ServiceUnavailable" => IamError::Transient(format!("{code}: {message}")),
    _ => IamError::Service { code, message },
  }
}

/// IAM hands policy documents back URL-encoded
fn decode_document(document: &str) -> Result<String, IamError> {
  urlencoding::decode(document)
    .map(|d| d.into_owned())
    .map_err(|e| IamError::Service {
      code: "MalformedPolicyDocument".to_string(),
      message: e.to_string(),
    })
}

fn sdk_tags(tags: &BTreeMap<String, String>) -> Result<Vec<Tag>, IamError> {
  tags
    .iter()
    .map(|(k, v)| {
      Tag::builder()
        .key(k)
        .value(v)
        .build()
        .map_err(|e| IamError::Service {
          code: "InvalidInput".to_string(),
          message: e.to_string(),
        })
    })
    .collect()
}

fn managed_role(role: &Role) -> Result<ManagedRole, IamError> {
  let trust_policy = match role.assume_role_policy_document() {
    Some(doc) => decode_document(doc)?,
    None => String::new(),
  };
  Ok(ManagedRole {
    name: role.role_name().to_string(),
    arn: role.arn().to_string(),
    trust_policy,
    tags: role
      .tags()
      .iter()
      .map(|t| (t.key().to_string(), t.value().to_string()))
      .collect(),
  })
}

fn instance_profile(profile: &SdkInstanceProfile) -> InstanceProfile {
  InstanceProfile {
    name: profile.instance_profile_name().to_string(),
    roles: profile
      .roles()
      .iter()
      .map(|r| r.role_name().to_string())
      .collect(),
  }
}

fn missing(what: &str) -> IamError {
  IamError::Service {
    code: "IncompleteResponse".to_string(),
    message: format!("response carried no {what}"),
  }
}

pub struct AwsIam {
  client: Client,
}

impl AwsIam {
  pub fn new(client: Client) -> Self {
    Self { client }
  }
}

#[async_trait]
impl IamApi for AwsIam {
  async fn get_role(&self, name: &str) -> Result<ManagedRole, IamError> {
    let out = self
      .client
      .get_role()
      .role_name(name)
      .send()
      .await
      .map_err(classify)?;
    managed_role(out.role().ok_or_else(|| missing("role"))?)
  }

  async fn create_role(
    &self,
    name: &str,
    trust_policy: &str,
    tags: &BTreeMap<String, String>,
  ) -> Result<ManagedRole, IamError> {
    let out = self
      .client
      .create_role()
      .role_name(name)
      .assume_role_policy_document(trust_policy)
      .set_tags(Some(sdk_tags(tags)?))
      .send()
      .await
      .map_err(classify)?;
    managed_role(out.role().ok_or_else(|| missing("role"))?)
  }

  async fn update_assume_role_policy(&self, name: &str, trust_policy: &str) -> Result<(), IamError> {
    self
      .client
      .update_assume_role_policy()
      .role_name(name)
      .policy_document(trust_policy)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn tag_role(&self, name: &str, tags: &BTreeMap<String, String>) -> Result<(), IamError> {
    self
      .client
      .tag_role()
      .role_name(name)
      .set_tags(Some(sdk_tags(tags)?))
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn delete_role(&self, name: &str) -> Result<(), IamError> {
    self
      .client
      .delete_role()
      .role_name(name)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn list_role_policies(&self, role: &str) -> Result<Vec<String>, IamError> {
    let mut names = Vec::new();
    let mut marker = None;
    loop {
      let out = self
        .client
        .list_role_policies()
        .role_name(role)
        .set_marker(marker.take())
        .send()
        .await
        .map_err(classify)?;
      names.extend(out.policy_names().iter().cloned());
      match out.marker() {
        Some(next) if out.is_truncated() => marker = Some(next.to_string()),
        _ => break,
      }
    }
    Ok(names)
  }

  async fn get_role_policy(&self, role: &str, policy: &str) -> Result<String, IamError> {
    let out = self
      .client
      .get_role_policy()
      .role_name(role)
      .policy_name(policy)
      .send()
      .await
      .map_err(classify)?;
    decode_document(out.policy_document())
  }

  async fn put_role_policy(&self, role: &str, policy: &str, document: &str) -> Result<(), IamError> {
    self
      .client
      .put_role_policy()
      .role_name(role)
      .policy_name(policy)
      .policy_document(document)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn delete_role_policy(&self, role: &str, policy: &str) -> Result<(), IamError> {
    self
      .client
      .delete_role_policy()
      .role_name(role)
      .policy_name(policy)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn get_instance_profile(&self, name: &str) -> Result<InstanceProfile, IamError> {
    let out = self
      .client
      .get_instance_profile()
      .instance_profile_name(name)
      .send()
      .await
      .map_err(classify)?;
    Ok(instance_profile(
      out
        .instance_profile()
        .ok_or_else(|| missing("instance profile"))?,
    ))
  }

  async fn create_instance_profile(
    &self,
    name: &str,
    tags: &BTreeMap<String, String>,
  ) -> Result<InstanceProfile, IamError> {
    let out = self
      .client
      .create_instance_profile()
      .instance_profile_name(name)
      .set_tags(Some(sdk_tags(tags)?))
      .send()
      .await
      .map_err(classify)?;
    Ok(instance_profile(
      out
        .instance_profile()
        .ok_or_else(|| missing("instance profile"))?,
    ))
  }

  async fn add_role_to_instance_profile(&self, profile: &str, role: &str) -> Result<(), IamError> {
    self
      .client
      .add_role_to_instance_profile()
      .instance_profile_name(profile)
      .role_name(role)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn remove_role_from_instance_profile(
    &self,
    profile: &str,
    role: &str,
  ) -> Result<(), IamError> {
    self
      .client
      .remove_role_from_instance_profile()
      .instance_profile_name(profile)
      .role_name(role)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn delete_instance_profile(&self, name: &str) -> Result<(), IamError> {
    self
      .client
      .delete_instance_profile()
      .instance_profile_name(name)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }

  async fn list_instance_profiles_for_role(
    &self,
    role: &str,
  ) -> Result<Vec<InstanceProfile>, IamError> {
    let mut profiles = Vec::new();
    let mut marker = None;
    loop {
      let out = self
        .client
        .list_instance_profiles_for_role()
        .role_name(role)
        .set_marker(marker.take())
        .send()
        .await
        .map_err(classify)?;
      profiles.extend(out.instance_profiles().iter().map(instance_profile));
      match out.marker() {
        Some(next) if out.is_truncated() => marker = Some(next.to_string()),
        _ => break,
      }
    }
    Ok(profiles)
  }

  async fn create_open_id_connect_provider(
    &self,
    url: &str,
    client_ids: &[String],
    tags: &BTreeMap<String, String>,
  ) -> Result<String, IamError> {
    let out = self
      .client
      .create_open_id_connect_provider()
      .url(url)
      .set_client_id_list(Some(client_ids.to_vec()))
      .set_tags(Some(sdk_tags(tags)?))
      .send()
      .await
      .map_err(classify)?;
    out
      .open_id_connect_provider_arn()
      .map(str::to_string)
      .ok_or_else(|| missing("provider arn"))
  }

  async fn delete_open_id_connect_provider(&self, arn: &str) -> Result<(), IamError> {
    self
      .client
      .delete_open_id_connect_provider()
      .open_id_connect_provider_arn(arn)
      .send()
      .await
      .map_err(classify)?;
    Ok(())
  }
}

/// Yields an IAM client acting as the cluster's identity role
#[async_trait]
pub trait SessionResolver: Send + Sync {
  async fn iam_client(&self, role_arn: &str, region: &str) -> Result<Arc<dyn IamApi>>;
}

fn iam_config(
  base: &SdkConfig,
  region: Region,
  credentials: SharedCredentialsProvider,
) -> aws_sdk_iam::Config {
  aws_sdk_iam::config::Builder::from(base)
    .region(region)
    .credentials_provider(credentials)
    // failed calls are retried by requeueing the reconcile
    .retry_config(RetryConfig::disabled())
    .build()
}

/// Assumes the identity role on top of the operator's own credentials
pub struct AssumeRoleSessions {
  base: SdkConfig,
}

impl AssumeRoleSessions {
  pub async fn from_env() -> Self {
    Self {
      base: aws_config::load_from_env().await,
    }
  }
}

#[async_trait]
impl SessionResolver for AssumeRoleSessions {
  async fn iam_client(&self, role_arn: &str, region: &str) -> Result<Arc<dyn IamApi>> {
    if role_arn.is_empty() || region.is_empty() {
      return Err(Error::Session {
        role_arn: role_arn.to_string(),
        region: region.to_string(),
        message: "role arn and region are required".to_string(),
      });
    }
    let region = Region::new(region.to_string());
    let credentials = AssumeRoleProvider::builder(role_arn)
      .configure(&self.base)
      .region(region.clone())
      .session_name(SESSION_NAME)
      .build()
      .await;
    let config = iam_config(&self.base, region, SharedCredentialsProvider::new(credentials));
    debug!("assuming {} for iam calls", role_arn);
    Ok(Arc::new(AwsIam::new(Client::from_conf(config))))
  }
}
