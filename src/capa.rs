use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct IdentityRef {
  pub kind: Option<String>,
  pub name: String,
}

/// Infrastructure of one workload cluster
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "infrastructure.cluster.x-k8s.io",
  version = "v1beta2",
  kind = "AWSCluster",
  namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AWSClusterSpec {
  /// Region the cluster runs in
  #[serde(default)]
  pub region: String,
  /// Identity used to talk to the cluster's AWS account
  pub identity_ref: Option<IdentityRef>,
  /// Tags to put on every AWS resource of the cluster
  pub additional_tags: Option<BTreeMap<String, String>>,
}

/// Role the operator assumes to manage a cluster's account
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "infrastructure.cluster.x-k8s.io",
  version = "v1beta2",
  kind = "AWSClusterRoleIdentity"
)]
pub struct AWSClusterRoleIdentitySpec {
  #[serde(rename = "roleARN", default)]
  pub role_arn: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AWSMachineSpec {
  /// Instance profile, and therefore role, the machines run with
  pub iam_instance_profile: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct AWSMachineTemplateResource {
  #[serde(default)]
  pub spec: AWSMachineSpec,
}

/// Machine template of control plane or bastion nodes
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "infrastructure.cluster.x-k8s.io",
  version = "v1beta2",
  kind = "AWSMachineTemplate",
  namespaced
)]
pub struct AWSMachineTemplateSpec {
  #[serde(default)]
  pub template: AWSMachineTemplateResource,
}

impl AWSMachineTemplate {
  pub fn instance_profile(&self) -> Option<&str> {
    self
      .spec
      .template
      .spec
      .iam_instance_profile
      .as_deref()
      .filter(|p| !p.is_empty())
  }
}

/// EKS managed control plane
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
  group = "controlplane.cluster.x-k8s.io",
  version = "v1beta2",
  kind = "AWSManagedControlPlane",
  namespaced,
  status = "AWSManagedControlPlaneStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct AWSManagedControlPlaneSpec {
  #[serde(default)]
  pub region: String,
  /// Name of the EKS control plane role, set once CAPA created it
  pub role_name: Option<String>,
  pub identity_ref: Option<IdentityRef>,
  pub additional_tags: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AWSManagedControlPlaneStatus {
  pub oidc_provider: Option<OIDCProviderStatus>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OIDCProviderStatus {
  #[serde(default)]
  pub arn: String,
}

impl AWSManagedControlPlane {
  pub fn oidc_provider_arn(&self) -> Option<&str> {
    self
      .status
      .as_ref()
      .and_then(|s| s.oidc_provider.as_ref())
      .map(|p| p.arn.as_str())
      .filter(|arn| !arn.is_empty())
  }
}
