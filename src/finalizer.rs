use std::fmt::Debug;

use async_trait::async_trait;
use json_patch::{AddOperation, PatchOperation, TestOperation};
use kube::{
  api::{Patch, PatchParams},
  Api, Resource, ResourceExt,
};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;

use crate::{
  error::{Error, Result},
  iam::RemoteCalls,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// The parts of an object the coordinator reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectVersion {
  pub resource_version: String,
  pub finalizers: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionedObjects: Send + Sync {
  /// `None` once the object is gone
  async fn fetch(&self, name: &str) -> Result<Option<ObjectVersion>>;

  /// Replace the finalizer list, failing with a conflict unless the object is
  /// still at `resource_version`
  async fn write_finalizers(
    &self,
    name: &str,
    resource_version: &str,
    finalizers: Vec<String>,
  ) -> Result<()>;
}

/// [`VersionedObjects`] over one kind, every call bound to the reconcile's [`RemoteCalls`]
pub struct ObjectStore<K> {
  api: Api<K>,
  calls: RemoteCalls,
}

impl<K> ObjectStore<K> {
  pub fn new(api: Api<K>, calls: RemoteCalls) -> Self {
    Self { api, calls }
  }
}

#[async_trait]
impl<K> VersionedObjects for ObjectStore<K>
where
  K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
  async fn fetch(&self, name: &str) -> Result<Option<ObjectVersion>> {
    let obj = self
      .calls
      .run_kube("get", name, self.api.get_opt(name))
      .await?;
    Ok(obj.map(|o| ObjectVersion {
      resource_version: o.resource_version().unwrap_or_default(),
      finalizers: o.finalizers().to_vec(),
    }))
  }

  async fn write_finalizers(
    &self,
    name: &str,
    resource_version: &str,
    finalizers: Vec<String>,
  ) -> Result<()> {
    let patch = Patch::<()>::Json(json_patch::Patch(vec![
      PatchOperation::Test(TestOperation {
        path: "/metadata/resourceVersion".to_string(),
        value: resource_version.into(),
      }),
      PatchOperation::Add(AddOperation {
        path: "/metadata/finalizers".to_string(),
        value: finalizers.into(),
      }),
    ]));
    self
      .calls
      .run_kube(
        "patch finalizers",
        name,
        self.api.patch(name, &PatchParams::default(), &patch),
      )
      .await?;
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
  Add,
  Remove,
}

/// Adds and releases one finalizer under optimistic concurrency.
///
/// Every write carries the resource version it was computed from. A write that
/// loses the race is recomputed from a fresh read, up to `max_attempts`.
pub struct FinalizerCoordinator {
  finalizer: String,
  max_attempts: u32,
}

impl FinalizerCoordinator {
  pub fn new(finalizer: impl Into<String>, max_attempts: u32) -> Self {
    Self {
      finalizer: finalizer.into(),
      max_attempts: max_attempts.max(1),
    }
  }

  pub fn finalizer(&self) -> &str {
    &self.finalizer
  }

  /// Mark `name` so it is not removed before cleanup ran
  pub async fn add(&self, objects: &dyn VersionedObjects, name: &str) -> Result<()> {
    self.transition(objects, name, Transition::Add).await
  }

  /// Release `name` once cleanup has succeeded
  pub async fn remove(&self, objects: &dyn VersionedObjects, name: &str) -> Result<()> {
    self.transition(objects, name, Transition::Remove).await
  }

  async fn transition(
    &self,
    objects: &dyn VersionedObjects,
    name: &str,
    transition: Transition,
  ) -> Result<()> {
    for attempt in 1..=self.max_attempts {
      let Some(current) = objects.fetch(name).await? else {
        debug!("{} is gone, nothing to do for {}", name, self.finalizer);
        return Ok(());
      };
      let present = current.finalizers.iter().any(|f| f == &self.finalizer);
      let finalizers = match (transition, present) {
        (Transition::Add, true) | (Transition::Remove, false) => return Ok(()),
        (Transition::Add, false) => {
          let mut f = current.finalizers;
          f.push(self.finalizer.clone());
          f
        }
        (Transition::Remove, true) => current
          .finalizers
          .into_iter()
          .filter(|f| f != &self.finalizer)
          .collect(),
      };

      match objects
        .write_finalizers(name, &current.resource_version, finalizers)
        .await
      {
        Ok(()) => {
          info!("{:?} finalizer {} on {}", transition, self.finalizer, name);
          return Ok(());
        }
        Err(e) if e.is_not_found() => {
          debug!("{} vanished while writing {}", name, self.finalizer);
          return Ok(());
        }
        Err(e) if e.is_conflict() => {
          warn!(
            "conflict writing finalizer {} on {} (attempt {}/{})",
            self.finalizer, name, attempt, self.max_attempts
          );
        }
        Err(e) => return Err(e),
      }
    }
    Err(Error::RetriesExhausted {
      finalizer: self.finalizer.clone(),
      resource: name.to_string(),
      attempts: self.max_attempts,
    })
  }
}
