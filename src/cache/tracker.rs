//! Reference counting of resource consumers.
//!
//! A consumer registers interest in a key and gets a [`UseId`] back. While a
//! key has at least one use it is never purged from its resource.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use tracing::trace;

use super::key::{CacheKey, ResourceKey};

/// Opaque handle for one registered use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UseId(u64);

impl UseId {
  fn next() -> Self {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    Self(COUNTER.fetch_add(1, Ordering::Relaxed))
  }
}

impl fmt::Display for UseId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "use-{}", self.0)
  }
}

pub struct UseTracker<K> {
  uses: Mutex<HashMap<ResourceKey<K>, HashSet<UseId>>>,
}

impl<K: CacheKey> UseTracker<K> {
  pub fn new() -> Self {
    Self {
      uses: Mutex::new(HashMap::new()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceKey<K>, HashSet<UseId>>> {
    self.uses.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register interest in `key`.
  pub fn use_key(&self, key: ResourceKey<K>) -> UseId {
    let id = UseId::next();
    trace!(%id, ?key, "use");
    self.lock().entry(key).or_default().insert(id);
    id
  }

  /// Drop a registered use. Returns false if `id` was not registered for `key`.
  pub fn free(&self, key: &ResourceKey<K>, id: UseId) -> bool {
    let mut uses = self.lock();
    let Some(ids) = uses.get_mut(key) else {
      return false;
    };
    let removed = ids.remove(&id);
    if ids.is_empty() {
      uses.remove(key);
    }
    trace!(%id, ?key, removed, "free");
    removed
  }

  pub fn has_use_id(&self, id: UseId) -> bool {
    self.lock().values().any(|ids| ids.contains(&id))
  }

  pub fn is_used(&self, key: &ResourceKey<K>) -> bool {
    self.lock().contains_key(key)
  }

  pub fn use_count(&self, key: &ResourceKey<K>) -> usize {
    self.lock().get(key).map_or(0, HashSet::len)
  }

  /// Every key with at least one use.
  pub fn tracked_keys(&self) -> Vec<ResourceKey<K>> {
    self.lock().keys().cloned().collect()
  }
}

impl<K: CacheKey> Default for UseTracker<K> {
  fn default() -> Self {
    Self::new()
  }
}
