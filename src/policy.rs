use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub const POLICY_VERSION: &str = "2012-10-17";

/// Client id registered on OIDC providers and used as token audience
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// Which kind of role a reconcile manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleType {
  ControlPlane,
  Bastion,
  Irsa,
}

impl RoleType {
  pub fn as_str(&self) -> &'static str {
    match self {
      RoleType::ControlPlane => "control-plane",
      RoleType::Bastion => "bastion",
      RoleType::Irsa => "irsa",
    }
  }

  /// Parse the value of the role classification label
  pub fn from_label(value: &str) -> Option<Self> {
    match value {
      "control-plane" => Some(RoleType::ControlPlane),
      "bastion" => Some(RoleType::Bastion),
      _ => None,
    }
  }
}

impl std::fmt::Display for RoleType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Desired state of one role, recomputed from the triggering object on every reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleSpec {
  pub role_name: String,
  pub role_type: RoleType,
  pub cluster_name: String,
  pub region: String,
  pub account_id: String,
  pub custom_tags: BTreeMap<String, String>,
}

impl RoleSpec {
  /// Name of the inline policy carrying this role's permissions
  pub fn policy_name(&self) -> String {
    match self.role_type {
      RoleType::ControlPlane => format!("control-plane-{}-policy", self.cluster_name),
      RoleType::Bastion => format!("bastion-{}-policy", self.cluster_name),
      RoleType::Irsa => format!("{}-policy", self.role_name),
    }
  }

  pub fn partition(&self) -> &'static str {
    partition(&self.region)
  }
}

/// Issuer domains of the cluster's service account tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrsaDomain {
  pub current: String,
  pub previous: Option<String>,
}

impl IrsaDomain {
  pub fn new(current: &str, previous: Option<&str>) -> Self {
    let current = normalize_domain(current);
    let previous = previous
      .map(normalize_domain)
      .filter(|p| !p.is_empty() && *p != current);
    Self { current, previous }
  }

  /// The previous issuer still has to be rotated out
  pub fn rotating_from(&self) -> Option<&str> {
    self.previous.as_deref()
  }
}

/// Strip scheme and trailing slash so `https://x/` and `x` compare equal
pub fn normalize_domain(domain: &str) -> String {
  let trimmed = domain.trim();
  trimmed
    .strip_prefix("https://")
    .unwrap_or(trimmed)
    .trim_end_matches('/')
    .to_string()
}

pub fn partition(region: &str) -> &'static str {
  if region.starts_with("cn-") {
    "aws-cn"
  } else {
    "aws"
  }
}

fn ec2_principal(region: &str) -> &'static str {
  if region.starts_with("cn-") {
    "ec2.amazonaws.com.cn"
  } else {
    "ec2.amazonaws.com"
  }
}

pub fn oidc_provider_arn(partition: &str, account_id: &str, domain: &str) -> String {
  format!("arn:{partition}:iam::{account_id}:oidc-provider/{domain}")
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PolicyDocument {
  pub version: &'static str,
  pub statement: Vec<Statement>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Statement {
  pub effect: &'static str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub principal: Option<Principal>,
  pub action: OneOrMany,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub resource: Option<OneOrMany>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub condition: Option<BTreeMap<&'static str, BTreeMap<String, String>>>,
}

#[derive(Debug, Clone, Serialize)]
pub enum Principal {
  Service(String),
  Federated(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OneOrMany {
  One(String),
  Many(Vec<String>),
}

impl OneOrMany {
  fn many(items: &[&str]) -> Self {
    OneOrMany::Many(items.iter().map(|s| s.to_string()).collect())
  }
}

impl PolicyDocument {
  fn new(statement: Vec<Statement>) -> Self {
    Self {
      version: POLICY_VERSION,
      statement,
    }
  }

  pub fn to_json(&self) -> String {
    // only strings and maps in here, serialization cannot fail
    serde_json::to_string(self).unwrap_or_default()
  }
}

fn allow(actions: &[&str], resource: OneOrMany) -> Statement {
  Statement {
    effect: "Allow",
    principal: None,
    action: OneOrMany::many(actions),
    resource: Some(resource),
    condition: None,
  }
}

/// Fixed permission sets the catalog can hand out to workload identities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionSet {
  /// external-dns: manage records in any hosted zone
  Route53Records,
  /// cert-manager: answer DNS-01 challenges
  Route53Dns01,
}

impl PermissionSet {
  pub fn document(&self, partition: &str) -> PolicyDocument {
    let hosted_zones = OneOrMany::One(format!("arn:{partition}:route53:::hostedzone/*"));
    match self {
      PermissionSet::Route53Records => PolicyDocument::new(vec![
        allow(&["route53:ChangeResourceRecordSets"], hosted_zones),
        allow(
          &[
            "route53:ListHostedZones",
            "route53:ListResourceRecordSets",
            "route53:ListTagsForResource",
          ],
          OneOrMany::One("*".to_string()),
        ),
      ]),
      PermissionSet::Route53Dns01 => PolicyDocument::new(vec![
        allow(
          &["route53:GetChange"],
          OneOrMany::One(format!("arn:{partition}:route53:::change/*")),
        ),
        allow(
          &[
            "route53:ChangeResourceRecordSets",
            "route53:ListResourceRecordSets",
          ],
          hosted_zones,
        ),
        allow(
          &["route53:ListHostedZonesByName"],
          OneOrMany::One("*".to_string()),
        ),
      ]),
    }
  }
}

/// Renders the documents for one validated [`RoleSpec`].
///
/// Identical input yields byte-identical JSON.
#[derive(Debug)]
pub struct PolicyBuilder<'a> {
  spec: &'a RoleSpec,
}

impl<'a> PolicyBuilder<'a> {
  pub fn new(spec: &'a RoleSpec) -> Result<Self> {
    let required = [
      ("account id", &spec.account_id),
      ("region", &spec.region),
      ("cluster name", &spec.cluster_name),
      ("role name", &spec.role_name),
    ];
    for (field, value) in required {
      if value.trim().is_empty() {
        return Err(Error::configuration(
          spec.role_name.clone(),
          format!("{field} must not be empty"),
        ));
      }
    }
    Ok(Self { spec })
  }

  /// Trust policy of a node role; IRSA roles need [`Self::irsa_trust_policy`]
  pub fn trust_policy(&self) -> Result<String> {
    match self.spec.role_type {
      RoleType::ControlPlane | RoleType::Bastion => Ok(
        PolicyDocument::new(vec![Statement {
          effect: "Allow",
          principal: Some(Principal::Service(ec2_principal(&self.spec.region).to_string())),
          action: OneOrMany::One("sts:AssumeRole".to_string()),
          resource: None,
          condition: None,
        }])
        .to_json(),
      ),
      RoleType::Irsa => Err(Error::configuration(
        self.spec.role_name.clone(),
        "irsa trust policy needs an issuer domain",
      )),
    }
  }

  /// Web identity trust for `namespace:service_account`, one statement per issuer domain
  pub fn irsa_trust_policy(
    &self,
    namespace: &str,
    service_account: &str,
    domains: &[&str],
  ) -> Result<String> {
    if domains.is_empty() || domains.iter().any(|d| d.trim().is_empty()) {
      return Err(Error::configuration(
        self.spec.role_name.clone(),
        "irsa issuer domain is not known yet",
      ));
    }
    let subject = format!("system:serviceaccount:{namespace}:{service_account}");
    let statement = domains
      .iter()
      .map(|domain| Statement {
        effect: "Allow",
        principal: Some(Principal::Federated(oidc_provider_arn(
          self.spec.partition(),
          &self.spec.account_id,
          domain,
        ))),
        action: OneOrMany::One("sts:AssumeRoleWithWebIdentity".to_string()),
        resource: None,
        condition: Some(BTreeMap::from([(
          "StringEquals",
          BTreeMap::from([(format!("{domain}:sub"), subject.clone())]),
        )])),
      })
      .collect();
    Ok(PolicyDocument::new(statement).to_json())
  }

  /// Inline permission document for node roles
  pub fn permission_policy(&self) -> Result<String> {
    let doc = match self.spec.role_type {
      RoleType::ControlPlane => PolicyDocument::new(vec![
        allow(
          &[
            "autoscaling:DescribeAutoScalingGroups",
            "autoscaling:DescribeLaunchConfigurations",
            "autoscaling:DescribeTags",
            "ec2:AttachVolume",
            "ec2:AuthorizeSecurityGroupIngress",
            "ec2:CreateRoute",
            "ec2:CreateSecurityGroup",
            "ec2:CreateTags",
            "ec2:CreateVolume",
            "ec2:DeleteRoute",
            "ec2:DeleteSecurityGroup",
            "ec2:DeleteVolume",
            "ec2:DescribeAvailabilityZones",
            "ec2:DescribeInstances",
            "ec2:DescribeRegions",
            "ec2:DescribeRouteTables",
            "ec2:DescribeSecurityGroups",
            "ec2:DescribeSubnets",
            "ec2:DescribeVolumes",
            "ec2:DescribeVpcs",
            "ec2:DetachVolume",
            "ec2:ModifyInstanceAttribute",
            "ec2:ModifyVolume",
            "ec2:RevokeSecurityGroupIngress",
            "elasticloadbalancing:*",
            "kms:DescribeKey",
          ],
          OneOrMany::One("*".to_string()),
        ),
        allow(
          &["iam:CreateServiceLinkedRole"],
          OneOrMany::One(format!(
            "arn:{}:iam::{}:role/aws-service-role/elasticloadbalancing.amazonaws.com/*",
            self.spec.partition(),
            self.spec.account_id
          )),
        ),
      ]),
      RoleType::Bastion => PolicyDocument::new(vec![allow(
        &["ec2:DescribeInstances", "ec2:DescribeRegions"],
        OneOrMany::One("*".to_string()),
      )]),
      RoleType::Irsa => {
        return Err(Error::configuration(
          self.spec.role_name.clone(),
          "irsa permissions come from the workload catalog",
        ))
      }
    };
    Ok(doc.to_json())
  }
}

/// Compare two policy documents the way IAM evaluates them, not byte by byte
pub fn semantically_equal(left: &str, right: &str) -> bool {
  match (
    serde_json::from_str::<Value>(left),
    serde_json::from_str::<Value>(right),
  ) {
    (Ok(l), Ok(r)) => canonical(l) == canonical(r),
    _ => false,
  }
}

fn canonical(value: Value) -> Value {
  match value {
    Value::Object(map) => Value::Object(
      map
        .into_iter()
        .map(|(k, v)| {
          let v = match k.as_str() {
            "Action" | "NotAction" | "Resource" | "NotResource" => match v {
              Value::String(s) => Value::Array(vec![Value::String(s)]),
              other => other,
            },
            _ => v,
          };
          (k, canonical(v))
        })
        .collect(),
    ),
    Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
    other => other,
  }
}

/// Issuer domains a trust policy federates with
pub fn trusted_domains(trust_policy: &str) -> Result<Vec<String>, serde_json::Error> {
  let doc: Value = serde_json::from_str(trust_policy)?;
  let statements = match doc.get("Statement") {
    Some(Value::Array(items)) => items.iter().collect(),
    Some(single @ Value::Object(_)) => vec![single],
    _ => Vec::new(),
  };
  let mut domains = Vec::new();
  for statement in statements {
    let federated = match statement.get("Principal").and_then(|p| p.get("Federated")) {
      Some(Value::String(s)) => vec![s.as_str()],
      Some(Value::Array(items)) => items.iter().filter_map(Value::as_str).collect(),
      _ => continue,
    };
    for arn in federated {
      if let Some((_, domain)) = arn.split_once(":oidc-provider/") {
        domains.push(domain.to_string());
      }
    }
  }
  Ok(domains)
}
