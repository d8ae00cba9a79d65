//! Core traits and types for resources.

use async_trait::async_trait;
use color_eyre::Result;
use futures::future::BoxFuture;
use tokio::sync::broadcast;

use super::includes::Includes;
use super::key::{CacheKey, ResourceKey};
use super::tracker::UseTracker;
use crate::error::ResourceError;

/// Fetches entries of a map resource from the backend.
///
/// The resource decides how results land in the cache: a load of the
/// "all" alias replaces the cache, anything else is merged key by key.
#[async_trait]
pub trait MapLoader<K, V>: Send + Sync + 'static {
  async fn load(&self, key: &ResourceKey<K>, includes: &Includes) -> Result<Vec<(K, V)>>;

  /// Combine a freshly written value with the one already cached.
  fn merge(&self, _previous: Option<&V>, next: V) -> V {
    next
  }

  /// Reject malformed keys before any request is made.
  fn validate_key(&self, _key: &K) -> bool {
    true
  }
}

/// Fetches the value of a singleton resource.
#[async_trait]
pub trait DataLoader<T>: Send + Sync + 'static {
  async fn load(&self, includes: &Includes) -> Result<T>;
}

/// Change notification published by a resource.
#[derive(Debug, Clone)]
pub enum ResourceEvent<K> {
  /// A load started for `key`.
  Loading { key: ResourceKey<K> },
  /// A load finished and wrote `keys`.
  Loaded { key: ResourceKey<K>, keys: Vec<K> },
  /// Entries were written locally.
  Updated { keys: Vec<K> },
  /// Entries were marked outdated without touching their data.
  Outdated { keys: Vec<K> },
  Deleted { keys: Vec<K> },
  Failed {
    key: ResourceKey<K>,
    error: ResourceError,
  },
  Cleared,
}

impl<K> ResourceEvent<K> {
  /// True for events after which readers may see different data.
  pub fn changes_data(&self) -> bool {
    matches!(
      self,
      Self::Loaded { .. } | Self::Updated { .. } | Self::Deleted { .. } | Self::Cleared
    )
  }
}

/// Freshness contract shared by map and data resources.
///
/// Resources are cheap handles over shared state; clones see the same cache.
pub trait Resource: Clone + Send + Sync + 'static {
  type Key: CacheKey;
  /// What a consumer reads for a key.
  type Data: Clone + Send + 'static;

  fn name(&self) -> &str;

  /// True if never loaded, marked outdated, or `includes` exceeds what was loaded.
  fn is_outdated(&self, key: &ResourceKey<Self::Key>, includes: &Includes) -> bool;

  fn is_loaded(&self, key: &ResourceKey<Self::Key>, includes: &Includes) -> bool;

  fn is_loading(&self, key: &ResourceKey<Self::Key>) -> bool;

  fn error(&self, key: &ResourceKey<Self::Key>) -> Option<ResourceError>;

  /// Load `key` if it is outdated. Identical concurrent loads share one fetch.
  ///
  /// Bookkeeping happens before this returns, so `is_loading` is true as
  /// soon as the future exists.
  fn load(
    &self,
    key: impl Into<ResourceKey<Self::Key>>,
    includes: &Includes,
  ) -> BoxFuture<'static, Result<(), ResourceError>>;

  /// Load `key` regardless of freshness.
  fn refresh(
    &self,
    key: impl Into<ResourceKey<Self::Key>>,
    includes: &Includes,
  ) -> BoxFuture<'static, Result<(), ResourceError>>;

  fn mark_outdated(&self, key: impl Into<ResourceKey<Self::Key>>);

  /// Pure read; never triggers a load.
  fn read(&self, key: &ResourceKey<Self::Key>) -> Option<Self::Data>;

  fn tracker(&self) -> &UseTracker<Self::Key>;

  fn subscribe(&self) -> broadcast::Receiver<ResourceEvent<Self::Key>>;
}
