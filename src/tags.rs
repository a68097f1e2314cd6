use std::collections::BTreeMap;

/// Ownership markers stamped on every resource this operator creates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagPolicy {
  owned_key: String,
  cluster_key_prefix: String,
}

impl TagPolicy {
  pub fn new(owned_key: impl Into<String>, cluster_key_prefix: impl Into<String>) -> Self {
    Self {
      owned_key: owned_key.into(),
      cluster_key_prefix: cluster_key_prefix.into(),
    }
  }

  /// The keys cluster-api-provider-aws and the old controller agree on
  pub fn standard() -> Self {
    Self::new(
      "capi-iam-controller/owned",
      "sigs.k8s.io/cluster-api-provider-aws/cluster/",
    )
  }

  pub fn owned_key(&self) -> &str {
    &self.owned_key
  }

  pub fn cluster_key(&self, cluster_name: &str) -> String {
    format!("{}{}", self.cluster_key_prefix, cluster_name)
  }

  /// Tag set every managed resource of `cluster_name` must carry.
  ///
  /// Custom tags never override the two ownership markers.
  pub fn desired(
    &self,
    cluster_name: &str,
    custom_tags: &BTreeMap<String, String>,
  ) -> BTreeMap<String, String> {
    let mut tags = custom_tags.clone();
    tags.insert(self.owned_key.clone(), String::new());
    tags.insert(self.cluster_key(cluster_name), "owned".to_string());
    tags
  }
}

impl Default for TagPolicy {
  fn default() -> Self {
    Self::standard()
  }
}

/// Desired tags that are missing from or differ on the remote resource
pub fn missing_tags(
  desired: &BTreeMap<String, String>,
  observed: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
  desired
    .iter()
    .filter(|(k, v)| observed.get(*k) != Some(*v))
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect()
}
