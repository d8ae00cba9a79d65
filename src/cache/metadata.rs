//! Freshness bookkeeping shared by every resource.
//!
//! `ResourceState` tracks, per key and per alias, whether data was loaded,
//! with which includes, whether it is outdated or loading, and the last
//! error. It also owns the in-flight load table used for deduplication and
//! the write stamps that keep stale loads from overwriting newer writes.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};

use super::includes::Includes;
use super::key::{CacheKey, ResourceAlias, ResourceKey};
use crate::error::ResourceError;

/// Bookkeeping attached to a key or alias.
#[derive(Debug, Clone)]
pub struct EntryMetadata {
  loaded: bool,
  outdated: bool,
  loading: usize,
  includes: Includes,
  error: Option<ResourceError>,
  loaded_at: Option<DateTime<Utc>>,
}

impl Default for EntryMetadata {
  fn default() -> Self {
    Self {
      loaded: false,
      outdated: true,
      loading: 0,
      includes: Includes::default(),
      error: None,
      loaded_at: None,
    }
  }
}

impl EntryMetadata {
  pub fn is_loaded(&self) -> bool {
    self.loaded
  }

  pub fn is_outdated(&self) -> bool {
    self.outdated
  }

  pub fn is_loading(&self) -> bool {
    self.loading > 0
  }

  pub fn includes(&self) -> &Includes {
    &self.includes
  }

  pub fn error(&self) -> Option<&ResourceError> {
    self.error.as_ref()
  }

  pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
    self.loaded_at
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum MetaKey<K> {
  Key(K),
  Alias(ResourceAlias),
}

/// Identity of a load for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LoadSignature<K> {
  pub key: ResourceKey<K>,
  pub includes: Includes,
}

pub(crate) type SharedLoad = Shared<BoxFuture<'static, Result<(), ResourceError>>>;

/// A running load other callers can join.
#[derive(Clone)]
pub(crate) struct InFlight<K> {
  pub seq: u64,
  pub targets: Vec<MetaKey<K>>,
  pub future: SharedLoad,
}

pub(crate) struct ResourceState<K> {
  metadata: HashMap<MetaKey<K>, EntryMetadata>,
  in_flight: HashMap<LoadSignature<K>, InFlight<K>>,
  /// Sequence numbers of loads that have not committed yet.
  running: HashSet<u64>,
  /// Sequence number of the last write per key; only kept while loads run.
  stamps: HashMap<K, u64>,
  /// Sequence number of the last invalidation per key or alias.
  invalidated: HashMap<MetaKey<K>, u64>,
  cleared_at: u64,
  all_outdated_at: u64,
  seq: u64,
}

impl<K: CacheKey> ResourceState<K> {
  pub fn new() -> Self {
    Self {
      metadata: HashMap::new(),
      in_flight: HashMap::new(),
      running: HashSet::new(),
      stamps: HashMap::new(),
      invalidated: HashMap::new(),
      cleared_at: 0,
      all_outdated_at: 0,
      seq: 0,
    }
  }

  pub fn next_seq(&mut self) -> u64 {
    self.seq += 1;
    self.seq
  }

  /// A running load for `signature` that no invalidation has overtaken.
  pub fn joinable(&self, signature: &LoadSignature<K>) -> Option<SharedLoad> {
    let pending = self.in_flight.get(signature)?;
    let stale = pending
      .targets
      .iter()
      .any(|target| self.is_invalidated(target, pending.seq));
    (!stale).then(|| pending.future.clone())
  }

  /// Track a new load; it replaces any stale load with the same signature
  /// for joining purposes.
  pub fn start_load(&mut self, signature: LoadSignature<K>, load: InFlight<K>) {
    self.begin_load(&load.targets);
    self.running.insert(load.seq);
    self.in_flight.insert(signature, load);
  }

  /// Forget the load numbered `seq`. Returns false if it was already gone.
  pub fn finish_load(&mut self, signature: &LoadSignature<K>, seq: u64, targets: &[MetaKey<K>]) -> bool {
    if self.in_flight.get(signature).is_some_and(|pending| pending.seq == seq) {
      self.in_flight.remove(signature);
    }
    if !self.running.remove(&seq) {
      return false;
    }
    self.end_load(targets);
    true
  }

  pub fn get(&self, key: &MetaKey<K>) -> Option<&EntryMetadata> {
    self.metadata.get(key)
  }

  pub fn is_outdated(&self, key: &MetaKey<K>, includes: &Includes) -> bool {
    match self.metadata.get(key) {
      Some(meta) => meta.outdated || !meta.loaded || !includes.is_covered_by(&meta.includes),
      None => true,
    }
  }

  pub fn is_loaded(&self, key: &MetaKey<K>, includes: &Includes) -> bool {
    self
      .metadata
      .get(key)
      .is_some_and(|meta| meta.loaded && includes.is_covered_by(&meta.includes))
  }

  pub fn is_loading(&self, key: &MetaKey<K>) -> bool {
    self.metadata.get(key).is_some_and(EntryMetadata::is_loading)
  }

  pub fn error(&self, key: &MetaKey<K>) -> Option<&ResourceError> {
    self.metadata.get(key).and_then(|meta| meta.error.as_ref())
  }

  /// Starting a load clears the previous error.
  pub fn begin_load(&mut self, targets: &[MetaKey<K>]) {
    for target in targets {
      let meta = self.metadata.entry(target.clone()).or_default();
      meta.loading += 1;
      meta.error = None;
    }
  }

  pub fn end_load(&mut self, targets: &[MetaKey<K>]) {
    for target in targets {
      if let Some(meta) = self.metadata.get_mut(target) {
        meta.loading = meta.loading.saturating_sub(1);
      }
    }
  }

  /// Record a successful load. Includes accumulate while the entry stays
  /// fresh; reloading an outdated entry starts over from `includes`.
  pub fn mark_loaded(&mut self, key: MetaKey<K>, includes: &Includes, now: DateTime<Utc>) {
    let meta = self.metadata.entry(key).or_default();
    meta.includes = if meta.loaded && !meta.outdated {
      meta.includes.union(includes)
    } else {
      includes.clone()
    };
    meta.loaded = true;
    meta.outdated = false;
    meta.error = None;
    meta.loaded_at = Some(now);
  }

  /// Record a local write: fresh, loaded, includes unchanged.
  pub fn mark_written(&mut self, key: MetaKey<K>, now: DateTime<Utc>) {
    let meta = self.metadata.entry(key).or_default();
    meta.loaded = true;
    meta.outdated = false;
    meta.error = None;
    meta.loaded_at = Some(now);
  }

  pub fn mark_failed(&mut self, key: MetaKey<K>, error: ResourceError) {
    self.metadata.entry(key).or_default().error = Some(error);
  }

  /// Returns false when there was nothing to mark. Loads already running
  /// will not mark `key` fresh again.
  pub fn mark_outdated(&mut self, key: &MetaKey<K>, seq: u64) -> bool {
    let stamp = self.invalidated.entry(key.clone()).or_insert(seq);
    *stamp = (*stamp).max(seq);
    match self.metadata.get_mut(key) {
      Some(meta) if !meta.outdated => {
        meta.outdated = true;
        true
      }
      _ => false,
    }
  }

  pub fn mark_all_outdated(&mut self, seq: u64) {
    self.all_outdated_at = self.all_outdated_at.max(seq);
    for meta in self.metadata.values_mut() {
      meta.outdated = true;
    }
  }

  /// Forget everything about `key` except loads still running for it.
  pub fn remove(&mut self, key: &K) {
    let key = MetaKey::Key(key.clone());
    if let Some(meta) = self.metadata.remove(&key) {
      if meta.loading > 0 {
        self.metadata.insert(
          key,
          EntryMetadata {
            loading: meta.loading,
            ..EntryMetadata::default()
          },
        );
      }
    }
  }

  pub fn remove_all(&mut self) {
    self.metadata.retain(|_, meta| meta.loading > 0);
    for meta in self.metadata.values_mut() {
      *meta = EntryMetadata {
        loading: meta.loading,
        ..EntryMetadata::default()
      };
    }
  }

  pub fn stamp(&mut self, key: &K, seq: u64) {
    let stamp = self.stamps.entry(key.clone()).or_insert(seq);
    *stamp = (*stamp).max(seq);
  }

  pub fn stamp_clear(&mut self, seq: u64) {
    self.cleared_at = self.cleared_at.max(seq);
  }

  /// True if `key` was written after the load numbered `seq` started.
  pub fn is_superseded(&self, key: &K, seq: u64) -> bool {
    self.cleared_at > seq || self.stamps.get(key).is_some_and(|stamp| *stamp > seq)
  }

  /// True if `target` was written or marked outdated after the load
  /// numbered `seq` started.
  pub fn is_invalidated(&self, target: &MetaKey<K>, seq: u64) -> bool {
    if self.all_outdated_at > seq || self.invalidated.get(target).is_some_and(|stamp| *stamp > seq) {
      return true;
    }
    match target {
      MetaKey::Key(key) => self.is_superseded(key, seq),
      MetaKey::Alias(_) => self.cleared_at > seq,
    }
  }

  /// Stamps only matter to loads still running.
  pub fn settle(&mut self) {
    if self.running.is_empty() {
      self.stamps.clear();
      self.invalidated.clear();
    }
  }
}
