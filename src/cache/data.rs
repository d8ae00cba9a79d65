//! Singleton resources: one value, no key space.
//!
//! A data resource is a map resource with the single key `()`, so it shares
//! the freshness contract, deduplication and change events of map
//! resources.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use color_eyre::Result;
use futures::future::BoxFuture;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::includes::Includes;
use super::key::ResourceKey;
use super::map::CachedMapResource;
use super::metadata::EntryMetadata;
use super::traits::{DataLoader, MapLoader, Resource, ResourceEvent};
use super::tracker::UseTracker;
use crate::error::ResourceError;

struct SingletonLoader<L>(L);

#[async_trait]
impl<T, L> MapLoader<(), T> for SingletonLoader<L>
where
  T: Send + 'static,
  L: DataLoader<T>,
{
  async fn load(&self, _key: &ResourceKey<()>, includes: &Includes) -> Result<Vec<((), T)>> {
    Ok(vec![((), self.0.load(includes).await?)])
  }
}

/// Sync tasks are stopped when the last handle to the resource goes away.
#[derive(Default)]
struct SyncTasks(Mutex<Vec<JoinHandle<()>>>);

impl SyncTasks {
  fn push(&self, handle: JoinHandle<()>) {
    self
      .0
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .push(handle);
  }
}

impl Drop for SyncTasks {
  fn drop(&mut self) {
    let handles = self.0.get_mut().unwrap_or_else(PoisonError::into_inner);
    for handle in handles.drain(..) {
      handle.abort();
    }
  }
}

/// Cache of a single value, e.g. server settings.
pub struct CachedDataResource<T> {
  map: CachedMapResource<(), T>,
  syncs: Arc<SyncTasks>,
}

impl<T> CachedDataResource<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(name: impl Into<String>, loader: impl DataLoader<T>) -> Self {
    Self {
      map: CachedMapResource::new(name, SingletonLoader(loader)),
      syncs: Arc::new(SyncTasks::default()),
    }
  }

  /// The loaded value, if any. Never triggers a load.
  pub fn data(&self) -> Option<T> {
    self.map.get(&())
  }

  /// Local write of authoritative data.
  pub fn set(&self, value: T) {
    self.map.set((), value);
  }

  pub fn clear(&self) {
    self.map.clear();
  }

  pub fn metadata(&self) -> Option<EntryMetadata> {
    self.map.metadata(&())
  }

  /// Mark this resource outdated whenever `source` changes its data, and
  /// refresh it right away if it has consumers.
  ///
  /// Propagation is one-directional; syncing two resources to each other
  /// would refresh forever.
  pub fn sync<R: Resource>(&self, source: &R) {
    let mut events = source.subscribe();
    let source_name = source.name().to_string();
    let target = self.map.downgrade();

    let handle = tokio::spawn(async move {
      loop {
        match events.recv().await {
          Ok(event) if !event.changes_data() => continue,
          Ok(_) | Err(RecvError::Lagged(_)) => {}
          Err(RecvError::Closed) => break,
        }
        let Some(target) = target.upgrade() else {
          break;
        };

        debug!(source = %source_name, target = %target.name(), "dependency changed");
        target.mark_outdated(());
        if !target.tracker().is_used(&ResourceKey::Single(())) {
          continue;
        }
        let includes = target
          .metadata(&())
          .map(|meta| meta.includes().clone())
          .unwrap_or_default();
        if let Err(error) = target.refresh((), &includes).await {
          warn!(target = %target.name(), %error, "refresh after dependency change failed");
        }
      }
    });
    self.syncs.push(handle);
  }
}

impl<T> Resource for CachedDataResource<T>
where
  T: Clone + Send + Sync + 'static,
{
  type Key = ();
  type Data = T;

  fn name(&self) -> &str {
    self.map.name()
  }

  fn is_outdated(&self, key: &ResourceKey<()>, includes: &Includes) -> bool {
    self.map.is_outdated(key, includes)
  }

  fn is_loaded(&self, key: &ResourceKey<()>, includes: &Includes) -> bool {
    self.map.is_loaded(key, includes)
  }

  fn is_loading(&self, key: &ResourceKey<()>) -> bool {
    self.map.is_loading(key)
  }

  fn error(&self, key: &ResourceKey<()>) -> Option<ResourceError> {
    self.map.error(key)
  }

  fn load(&self, key: impl Into<ResourceKey<()>>, includes: &Includes) -> BoxFuture<'static, Result<(), ResourceError>> {
    self.map.load(key, includes)
  }

  fn refresh(&self, key: impl Into<ResourceKey<()>>, includes: &Includes) -> BoxFuture<'static, Result<(), ResourceError>> {
    self.map.refresh(key, includes)
  }

  fn mark_outdated(&self, key: impl Into<ResourceKey<()>>) {
    self.map.mark_outdated(key);
  }

  fn read(&self, _key: &ResourceKey<()>) -> Option<T> {
    self.data()
  }

  fn tracker(&self) -> &UseTracker<()> {
    self.map.tracker()
  }

  fn subscribe(&self) -> broadcast::Receiver<ResourceEvent<()>> {
    self.map.subscribe()
  }
}

impl<T> Clone for CachedDataResource<T> {
  fn clone(&self) -> Self {
    Self {
      map: self.map.clone(),
      syncs: Arc::clone(&self.syncs),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::time::Duration;

  #[derive(Clone, Default)]
  struct Counter {
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
  }

  impl Counter {
    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl DataLoader<usize> for Counter {
    async fn load(&self, _includes: &Includes) -> Result<usize> {
      if self.failing.load(Ordering::SeqCst) {
        return Err(eyre!("unavailable"));
      }
      Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
    }
  }

  fn settle() -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(30))
  }

  #[tokio::test]
  async fn test_load_and_mark_outdated() {
    let counter = Counter::default();
    let settings = CachedDataResource::new("settings", counter.clone());
    assert!(settings.is_outdated(&ResourceKey::Single(()), &Includes::new()));
    assert_eq!(settings.data(), None);

    settings.load((), &Includes::new()).await.unwrap();
    assert_eq!(settings.data(), Some(1));
    settings.load((), &Includes::new()).await.unwrap();
    assert_eq!(counter.calls(), 1);

    settings.mark_outdated(());
    assert_eq!(settings.data(), Some(1));
    assert!(settings.is_outdated(&ResourceKey::Single(()), &Includes::new()));
    settings.load((), &Includes::new()).await.unwrap();
    assert_eq!(settings.data(), Some(2));
  }

  #[tokio::test]
  async fn test_error_keeps_last_value() {
    let counter = Counter::default();
    let settings = CachedDataResource::new("settings", counter.clone());
    settings.load((), &Includes::new()).await.unwrap();

    counter.failing.store(true, Ordering::SeqCst);
    let result = settings.refresh((), &Includes::new()).await;
    assert!(result.is_err());
    assert!(settings.error(&ResourceKey::Single(())).is_some());
    assert_eq!(settings.data(), Some(1));
  }

  #[tokio::test]
  async fn test_sync_marks_outdated_without_consumers() {
    let session = CachedDataResource::new("session", Counter::default());
    let settings_counter = Counter::default();
    let settings = CachedDataResource::new("settings", settings_counter.clone());
    settings.sync(&session);
    settings.load((), &Includes::new()).await.unwrap();

    session.load((), &Includes::new()).await.unwrap();
    settle().await;

    assert!(settings.is_outdated(&ResourceKey::Single(()), &Includes::new()));
    assert_eq!(settings_counter.calls(), 1);
  }

  #[tokio::test]
  async fn test_sync_refreshes_used_resource() {
    let session = CachedDataResource::new("session", Counter::default());
    let settings_counter = Counter::default();
    let settings = CachedDataResource::new("settings", settings_counter.clone());
    settings.sync(&session);
    settings.load((), &Includes::new()).await.unwrap();
    let id = settings.tracker().use_key(ResourceKey::Single(()));

    session.set(7);
    settle().await;

    assert_eq!(settings_counter.calls(), 2);
    assert!(!settings.is_outdated(&ResourceKey::Single(()), &Includes::new()));
    assert_eq!(settings.data(), Some(2));
    settings.tracker().free(&ResourceKey::Single(()), id);
  }
}
