use std::time::Duration;

use thiserror::Error;

/// Failure reported by the remote IAM API, before operation context is attached
#[derive(Debug, Error)]
pub enum IamError {
  #[error("no such entity")]
  NotFound,
  #[error("entity already exists")]
  AlreadyExists,
  #[error("transient failure: {0}")]
  Transient(String),
  #[error("{code}: {message}")]
  Service { code: String, message: String },
}

/// How the caller should treat an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  NotFound,
  AlreadyExists,
  Conflict,
  Configuration,
  Transient,
  Cancelled,
  Fatal,
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("iam {operation} failed for {resource}: {source}")]
  Iam {
    operation: &'static str,
    resource: String,
    #[source]
    source: IamError,
  },

  #[error("kubernetes {operation} failed for {resource}: {source}")]
  Kube {
    operation: &'static str,
    resource: String,
    #[source]
    source: kube::Error,
  },

  #[error("configuration error for {resource}: {message}")]
  Configuration { resource: String, message: String },

  #[error("finalizer {finalizer} on {resource} still conflicting after {attempts} attempts")]
  RetriesExhausted {
    finalizer: String,
    resource: String,
    attempts: u32,
  },

  #[error("{operation} on {resource} was cancelled")]
  Cancelled {
    operation: &'static str,
    resource: String,
  },

  #[error("{operation} on {resource} timed out after {timeout:?}")]
  Timeout {
    operation: &'static str,
    resource: String,
    timeout: Duration,
  },

  #[error("trust policy of {role} does not yet include {domain}")]
  TrustNotConfirmed { role: String, domain: String },

  #[error("invalid policy document for {resource}: {source}")]
  PolicyDocument {
    resource: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("could not build aws session for {role_arn} in {region}: {message}")]
  Session {
    role_arn: String,
    region: String,
    message: String,
  },
}

impl Error {
  pub fn iam(operation: &'static str, resource: impl Into<String>, source: IamError) -> Self {
    Self::Iam {
      operation,
      resource: resource.into(),
      source,
    }
  }

  pub fn kube(operation: &'static str, resource: impl Into<String>, source: kube::Error) -> Self {
    Self::Kube {
      operation,
      resource: resource.into(),
      source,
    }
  }

  pub fn configuration(resource: impl Into<String>, message: impl Into<String>) -> Self {
    Self::Configuration {
      resource: resource.into(),
      message: message.into(),
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Iam { source, .. } => match source {
        IamError::NotFound => ErrorKind::NotFound,
        IamError::AlreadyExists => ErrorKind::AlreadyExists,
        IamError::Transient(_) => ErrorKind::Transient,
        IamError::Service { .. } => ErrorKind::Fatal,
      },
      Self::Kube { source, .. } => match source {
        kube::Error::Api(resp) => match resp.code {
          404 => ErrorKind::NotFound,
          // 422 is what a failed json-patch `test` precondition comes back as
          409 | 422 => ErrorKind::Conflict,
          429 | 500..=599 => ErrorKind::Transient,
          _ => ErrorKind::Fatal,
        },
        _ => ErrorKind::Transient,
      },
      Self::Configuration { .. } => ErrorKind::Configuration,
      Self::RetriesExhausted { .. } => ErrorKind::Fatal,
      Self::Cancelled { .. } => ErrorKind::Cancelled,
      Self::Timeout { .. } | Self::TrustNotConfirmed { .. } => ErrorKind::Transient,
      Self::PolicyDocument { .. } => ErrorKind::Fatal,
      Self::Session { .. } => ErrorKind::Fatal,
    }
  }

  pub fn is_not_found(&self) -> bool {
    self.kind() == ErrorKind::NotFound
  }

  pub fn is_already_exists(&self) -> bool {
    self.kind() == ErrorKind::AlreadyExists
  }

  pub fn is_conflict(&self) -> bool {
    matches!(self, Self::Kube { .. }) && self.kind() == ErrorKind::Conflict
  }

  /// Whether requeueing the reconcile soon is likely to make progress
  pub fn is_retryable(&self) -> bool {
    match self.kind() {
      ErrorKind::Transient | ErrorKind::Conflict | ErrorKind::Cancelled => true,
      // configuration only heals once some other controller fills in the object
      ErrorKind::Configuration
      | ErrorKind::NotFound
      | ErrorKind::AlreadyExists
      | ErrorKind::Fatal => false,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
