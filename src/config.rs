use std::{path::Path, time::Duration};

use serde::Deserialize;

use crate::{
  error::{Error, Result},
  finalizer::DEFAULT_MAX_ATTEMPTS,
};

/// Env var naming an optional YAML file with [`OperatorConfig`] overrides
pub const CONFIG_PATH_ENV: &str = "CAPA_IAM_OPERATOR_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct OperatorConfig {
  /// Create the per-workload IRSA roles of control plane clusters
  pub enable_irsa_roles: bool,
  pub finalizer_max_attempts: u32,
  /// Upper bound for a single IAM call
  pub remote_call_timeout_secs: u64,
  /// Resync interval after a successful reconcile
  pub requeue_after_secs: u64,
  /// Requeue delay after a retryable failure
  pub error_requeue_secs: u64,
}

impl Default for OperatorConfig {
  fn default() -> Self {
    Self {
      enable_irsa_roles: true,
      finalizer_max_attempts: DEFAULT_MAX_ATTEMPTS,
      remote_call_timeout_secs: 30,
      requeue_after_secs: 300,
      error_requeue_secs: 60,
    }
  }
}

impl OperatorConfig {
  pub fn from_yaml(yaml: &str) -> Result<Self> {
    serde_yaml::from_str::<Option<Self>>(yaml)
      .map(Option::unwrap_or_default)
      .map_err(|e| Error::configuration("operator config", e.to_string()))
  }

  pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let yaml = std::fs::read_to_string(path)
      .map_err(|e| Error::configuration(path.display().to_string(), e.to_string()))?;
    Self::from_yaml(&yaml)
  }

  /// Defaults, overridden by the file named in `CAPA_IAM_OPERATOR_CONFIG` if set
  pub fn from_env() -> Result<Self> {
    match std::env::var_os(CONFIG_PATH_ENV) {
      Some(path) if !path.is_empty() => Self::from_file(path),
      _ => Ok(Self::default()),
    }
  }

  pub fn remote_call_timeout(&self) -> Duration {
    Duration::from_secs(self.remote_call_timeout_secs)
  }

  pub fn requeue_after(&self) -> Duration {
    Duration::from_secs(self.requeue_after_secs)
  }

  pub fn error_requeue(&self, retryable: bool) -> Duration {
    let secs = if retryable {
      self.error_requeue_secs
    } else {
      self.error_requeue_secs.saturating_mul(5)
    };
    Duration::from_secs(secs)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_file_keeps_defaults() {
    let config = OperatorConfig::from_yaml("enableIrsaRoles: false\nerrorRequeueSecs: 10\n").unwrap();
    assert!(!config.enable_irsa_roles);
    assert_eq!(config.finalizer_max_attempts, 5);
    assert_eq!(config.error_requeue(true), Duration::from_secs(10));
    assert_eq!(config.error_requeue(false), Duration::from_secs(50));
  }

  #[test]
  fn huge_requeue_delay_saturates() {
    let config = OperatorConfig {
      error_requeue_secs: u64::MAX,
      ..OperatorConfig::default()
    };
    assert_eq!(config.error_requeue(false), Duration::from_secs(u64::MAX));
  }

  #[test]
  fn empty_file_is_default() {
    assert_eq!(OperatorConfig::from_yaml("").unwrap(), OperatorConfig::default());
  }

  #[test]
  fn unknown_keys_are_rejected() {
    let err = OperatorConfig::from_yaml("enableIrsa: true").unwrap_err();
    assert!(!err.is_retryable());
  }

  #[test]
  fn missing_file_is_a_configuration_error() {
    assert!(OperatorConfig::from_file("/nonexistent/capa-iam-operator.yaml").is_err());
  }
}
