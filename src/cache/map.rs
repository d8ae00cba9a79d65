//! Keyed resource over an entity collection.

use std::collections::{BTreeMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::includes::Includes;
use super::key::{AliasRegistry, CacheKey, ResourceAlias, ResourceKey, ALL_KEY};
use super::metadata::{EntryMetadata, InFlight, LoadSignature, MetaKey, ResourceState};
use super::traits::{MapLoader, Resource, ResourceEvent};
use super::tracker::UseTracker;
use crate::error::ResourceError;

const EVENT_CAPACITY: usize = 64;

/// Cache of values keyed by `K`, filled by a [`MapLoader`].
///
/// Cloning is cheap: clones share the same cache, in-flight loads and
/// subscribers.
pub struct CachedMapResource<K, V> {
  inner: Arc<MapInner<K, V>>,
}

pub(crate) struct MapInner<K, V> {
  name: String,
  loader: Arc<dyn MapLoader<K, V>>,
  state: Mutex<MapState<K, V>>,
  events: broadcast::Sender<ResourceEvent<K>>,
  tracker: UseTracker<K>,
}

struct MapState<K, V> {
  data: BTreeMap<K, V>,
  meta: ResourceState<K>,
  aliases: AliasRegistry<K, V>,
}

struct PendingLoad<K> {
  signature: LoadSignature<K>,
  seq: u64,
  targets: Vec<MetaKey<K>>,
}

impl<K: CacheKey, V: 'static> MapState<K, V> {
  fn resolve(&self, key: &ResourceKey<K>) -> Vec<K> {
    self.aliases.resolve(key, &self.data).unwrap_or_default()
  }

  fn targets(&self, key: &ResourceKey<K>) -> Vec<MetaKey<K>> {
    let mut targets: Vec<MetaKey<K>> = self.resolve(key).into_iter().map(MetaKey::Key).collect();
    if let Some(alias) = key.as_alias() {
      targets.push(MetaKey::Alias(alias.clone()));
    }
    targets
  }

  fn is_outdated(&self, key: &ResourceKey<K>, includes: &Includes) -> bool {
    if let Some(alias) = key.as_alias() {
      if self.meta.is_outdated(&MetaKey::Alias(alias.clone()), includes) {
        return true;
      }
    }
    self
      .resolve(key)
      .into_iter()
      .any(|k| self.meta.is_outdated(&MetaKey::Key(k), includes))
  }

  fn is_loaded(&self, key: &ResourceKey<K>, includes: &Includes) -> bool {
    if let Some(alias) = key.as_alias() {
      if !self.meta.is_loaded(&MetaKey::Alias(alias.clone()), includes) {
        return false;
      }
    }
    self
      .resolve(key)
      .into_iter()
      .all(|k| self.meta.is_loaded(&MetaKey::Key(k), includes))
  }

  fn is_loading(&self, key: &ResourceKey<K>) -> bool {
    self
      .targets(key)
      .iter()
      .any(|target| self.meta.is_loading(target))
  }

  fn error(&self, key: &ResourceKey<K>) -> Option<ResourceError> {
    if let Some(alias) = key.as_alias() {
      if let Some(error) = self.meta.error(&MetaKey::Alias(alias.clone())) {
        return Some(error.clone());
      }
    }
    self
      .resolve(key)
      .into_iter()
      .find_map(|k| self.meta.error(&MetaKey::Key(k)).cloned())
  }

  fn write(&mut self, loader: &dyn MapLoader<K, V>, key: K, value: V) {
    let merged = loader.merge(self.data.get(&key), value);
    self.data.insert(key, merged);
  }

  /// Record a committed load unless the target was invalidated while it ran.
  fn mark_loaded(&mut self, target: MetaKey<K>, includes: &Includes, now: DateTime<Utc>, seq: u64) {
    if !self.meta.is_invalidated(&target, seq) {
      self.meta.mark_loaded(target, includes, now);
    }
  }

  fn remove(&mut self, key: &K, seq: u64) -> bool {
    let existed = self.data.remove(key).is_some();
    self.meta.remove(key);
    self.meta.stamp(key, seq);
    existed
  }

  /// Drop every cached key missing from `incoming`, except keys written
  /// after `seq`.
  fn retain_only(&mut self, incoming: &HashSet<K>, seq: u64) -> Vec<K> {
    let stale: Vec<K> = self
      .data
      .keys()
      .filter(|k| !incoming.contains(*k) && !self.meta.is_superseded(k, seq))
      .cloned()
      .collect();
    for key in &stale {
      self.remove(key, seq);
    }
    stale
  }
}

impl<K, V> CachedMapResource<K, V>
where
  K: CacheKey,
  V: Clone + Send + Sync + 'static,
{
  pub fn new(name: impl Into<String>, loader: impl MapLoader<K, V>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      inner: Arc::new(MapInner {
        name: name.into(),
        loader: Arc::new(loader),
        state: Mutex::new(MapState {
          data: BTreeMap::new(),
          meta: ResourceState::new(),
          aliases: AliasRegistry::new(),
        }),
        events,
        tracker: UseTracker::new(),
      }),
    }
  }

  /// Register a resolver for a named alias. Loads of the alias merge their
  /// results; only the "all" alias replaces the cache.
  pub fn register_alias<F>(&self, name: &'static str, resolver: F)
  where
    F: Fn(&ResourceAlias, &BTreeMap<K, V>) -> Vec<K> + Send + Sync + 'static,
  {
    self.inner.lock().aliases.register(name, resolver);
  }

  pub fn get(&self, key: &K) -> Option<V> {
    self.inner.lock().data.get(key).cloned()
  }

  /// Values currently cached for `key`, in key order. Missing keys are skipped.
  pub fn get_many(&self, key: &ResourceKey<K>) -> Vec<V> {
    let state = self.inner.lock();
    state
      .resolve(key)
      .iter()
      .filter_map(|k| state.data.get(k).cloned())
      .collect()
  }

  pub fn contains(&self, key: &K) -> bool {
    self.inner.lock().data.contains_key(key)
  }

  pub fn keys(&self) -> Vec<K> {
    self.inner.lock().data.keys().cloned().collect()
  }

  pub fn values(&self) -> Vec<V> {
    self.inner.lock().data.values().cloned().collect()
  }

  pub fn len(&self) -> usize {
    self.inner.lock().data.len()
  }

  pub fn is_empty(&self) -> bool {
    self.inner.lock().data.is_empty()
  }

  /// Concrete keys `key` stands for right now.
  pub fn resolve(&self, key: &ResourceKey<K>) -> Vec<K> {
    self.inner.lock().resolve(key)
  }

  pub fn metadata(&self, key: &K) -> Option<EntryMetadata> {
    self
      .inner
      .lock()
      .meta
      .get(&MetaKey::Key(key.clone()))
      .cloned()
  }

  /// Local write of authoritative data, e.g. the response of a mutation.
  pub fn set(&self, key: K, value: V) {
    self.set_many([(key, value)]);
  }

  pub fn set_many(&self, entries: impl IntoIterator<Item = (K, V)>) {
    let now = Utc::now();
    let mut guard = self.inner.lock();
    let state = &mut *guard;
    let seq = state.meta.next_seq();
    let mut keys = Vec::new();
    for (key, value) in entries {
      state.write(self.inner.loader.as_ref(), key.clone(), value);
      state.meta.stamp(&key, seq);
      state.meta.mark_written(MetaKey::Key(key.clone()), now);
      keys.push(key);
    }
    state.meta.settle();
    drop(guard);

    trace!(resource = %self.inner.name, ?keys, "set");
    self.inner.emit(ResourceEvent::Updated { keys });
  }

  /// Make the cache hold exactly `entries`, as after loading the "all" alias.
  pub fn replace(&self, entries: impl IntoIterator<Item = (K, V)>) {
    let entries: Vec<(K, V)> = entries.into_iter().collect();
    let incoming: HashSet<K> = entries.iter().map(|(k, _)| k.clone()).collect();
    let now = Utc::now();

    let mut guard = self.inner.lock();
    let state = &mut *guard;
    let seq = state.meta.next_seq();
    let removed = state.retain_only(&incoming, seq);
    let mut keys = Vec::with_capacity(entries.len());
    for (key, value) in entries {
      state.write(self.inner.loader.as_ref(), key.clone(), value);
      state.meta.stamp(&key, seq);
      state.meta.mark_written(MetaKey::Key(key.clone()), now);
      keys.push(key);
    }
    state.meta.mark_written(MetaKey::Alias(ALL_KEY), now);
    state.meta.settle();
    drop(guard);

    if !removed.is_empty() {
      self.inner.emit(ResourceEvent::Deleted { keys: removed });
    }
    self.inner.emit(ResourceEvent::Updated { keys });
  }

  /// Modify a cached value in place without changing its freshness.
  pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
    let mut guard = self.inner.lock();
    let state = &mut *guard;
    let Some(value) = state.data.get_mut(key) else {
      return false;
    };
    f(value);
    let seq = state.meta.next_seq();
    state.meta.stamp(key, seq);
    state.meta.settle();
    drop(guard);

    self.inner.emit(ResourceEvent::Updated {
      keys: vec![key.clone()],
    });
    true
  }

  /// Remove entries. Loads already running will not write them back.
  pub fn delete(&self, key: impl Into<ResourceKey<K>>) -> Vec<K> {
    let key = key.into();
    let mut guard = self.inner.lock();
    let state = &mut *guard;
    let seq = state.meta.next_seq();
    let keys = state.resolve(&key);
    let removed: Vec<K> = keys
      .into_iter()
      .filter(|k| state.remove(k, seq))
      .collect();
    state.meta.settle();
    drop(guard);

    debug!(resource = %self.inner.name, ?removed, "deleted");
    if !removed.is_empty() {
      self.inner.emit(ResourceEvent::Deleted {
        keys: removed.clone(),
      });
    }
    removed
  }

  pub fn clear(&self) {
    let mut guard = self.inner.lock();
    let state = &mut *guard;
    let seq = state.meta.next_seq();
    state.meta.stamp_clear(seq);
    state.meta.remove_all();
    state.data.clear();
    state.meta.settle();
    drop(guard);

    debug!(resource = %self.inner.name, "cleared");
    self.inner.emit(ResourceEvent::Cleared);
  }

  pub fn mark_all_outdated(&self) {
    let keys = {
      let mut state = self.inner.lock();
      let seq = state.meta.next_seq();
      state.meta.mark_all_outdated(seq);
      state.meta.settle();
      state.data.keys().cloned().collect()
    };
    self.inner.emit(ResourceEvent::Outdated { keys });
  }

  /// Evict entries nobody uses that were loaded more than `ttl` ago.
  pub fn purge_unused(&self, ttl: Duration) -> Vec<K> {
    self.purge_unused_at(Utc::now(), ttl)
  }

  pub(crate) fn purge_unused_at(&self, now: DateTime<Utc>, ttl: Duration) -> Vec<K> {
    let tracked = self.inner.tracker.tracked_keys();
    let cutoff = now - ttl;

    let mut guard = self.inner.lock();
    let state = &mut *guard;
    let protected: HashSet<K> = tracked.iter().flat_map(|key| state.resolve(key)).collect();
    let expired: Vec<K> = state
      .data
      .keys()
      .filter(|k| !protected.contains(*k))
      .filter(|k| match state.meta.get(&MetaKey::Key((*k).clone())) {
        Some(meta) => !meta.is_loading() && meta.loaded_at().map_or(true, |at| at <= cutoff),
        None => true,
      })
      .cloned()
      .collect();
    if expired.is_empty() {
      return expired;
    }

    let seq = state.meta.next_seq();
    for key in &expired {
      state.remove(key, seq);
    }
    // The cache no longer holds the full list.
    state.meta.mark_outdated(&MetaKey::Alias(ALL_KEY), seq);
    state.meta.settle();
    drop(guard);

    debug!(resource = %self.inner.name, count = expired.len(), "purged unused entries");
    self.inner.emit(ResourceEvent::Deleted {
      keys: expired.clone(),
    });
    expired
  }

  /// Run [`purge_unused`](Self::purge_unused) every `interval` until the
  /// resource is dropped.
  pub fn spawn_purge(&self, interval: std::time::Duration, ttl: Duration) -> JoinHandle<()> {
    let weak = self.downgrade();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.tick().await;
      loop {
        ticker.tick().await;
        let Some(resource) = weak.upgrade() else {
          break;
        };
        resource.purge_unused(ttl);
      }
    })
  }

  pub(crate) fn downgrade(&self) -> WeakMapResource<K, V> {
    WeakMapResource(Arc::downgrade(&self.inner))
  }

  fn start(&self, key: ResourceKey<K>, includes: &Includes, force: bool) -> BoxFuture<'static, Result<(), ResourceError>> {
    let mut guard = self.inner.lock();
    let state = &mut *guard;

    if let Err(error) = self.inner.validate(state, &key) {
      return future::ready(Err(error)).boxed();
    }
    if !force && !state.is_outdated(&key, includes) {
      return future::ready(Ok(())).boxed();
    }

    let signature = LoadSignature {
      key: key.clone(),
      includes: includes.clone(),
    };
    if let Some(pending) = state.meta.joinable(&signature) {
      trace!(resource = %self.inner.name, ?key, "joining in-flight load");
      return pending.boxed();
    }

    let seq = state.meta.next_seq();
    let targets = state.targets(&key);

    let pending = PendingLoad {
      signature: signature.clone(),
      seq,
      targets: targets.clone(),
    };
    let inner = Arc::clone(&self.inner);
    let task = tokio::spawn(async move {
      let LoadSignature { key, includes } = &pending.signature;
      let result = AssertUnwindSafe(inner.loader.load(key, includes))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(eyre!("loader panicked")));
      inner.commit(pending, result)
    });

    let inner = Arc::clone(&self.inner);
    let abort_signature = signature.clone();
    let abort_targets = targets.clone();
    let shared = async move {
      match task.await {
        Ok(result) => result,
        Err(_) => Err(inner.abort(&abort_signature, seq, &abort_targets)),
      }
    }
    .boxed()
    .shared();
    state.meta.start_load(
      signature,
      InFlight {
        seq,
        targets,
        future: shared.clone(),
      },
    );
    drop(guard);

    debug!(resource = %self.inner.name, ?key, seq, "load started");
    self.inner.emit(ResourceEvent::Loading { key });
    shared.boxed()
  }
}

impl<K: CacheKey, V: 'static> MapInner<K, V> {
  fn lock(&self) -> MutexGuard<'_, MapState<K, V>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn emit(&self, event: ResourceEvent<K>) {
    // Nobody listening is fine.
    let _ = self.events.send(event);
  }

  fn validate(&self, state: &MapState<K, V>, key: &ResourceKey<K>) -> Result<(), ResourceError> {
    if let Some(alias) = key.as_alias() {
      if !state.aliases.is_registered(alias) {
        return Err(ResourceError::invalid_key(&self.name, key));
      }
    }
    match key.explicit().iter().find(|k| !self.loader.validate_key(k)) {
      Some(invalid) => Err(ResourceError::invalid_key(&self.name, invalid)),
      None => Ok(()),
    }
  }

  fn commit(&self, pending: PendingLoad<K>, result: Result<Vec<(K, V)>>) -> Result<(), ResourceError> {
    let PendingLoad {
      signature,
      seq,
      targets,
    } = pending;
    let now = Utc::now();

    let mut guard = self.lock();
    let state = &mut *guard;
    state.meta.finish_load(&signature, seq, &targets);
    let key = &signature.key;
    let includes = &signature.includes;

    let outcome = match result {
      Ok(entries) => {
        let removed = if key.is_all() {
          let incoming: HashSet<K> = entries.iter().map(|(k, _)| k.clone()).collect();
          state.retain_only(&incoming, seq)
        } else {
          Vec::new()
        };

        let mut written = Vec::with_capacity(entries.len());
        for (k, value) in entries {
          if state.meta.is_superseded(&k, seq) {
            trace!(resource = %self.name, key = ?k, seq, "skipping superseded key");
            continue;
          }
          state.write(self.loader.as_ref(), k.clone(), value);
          state.meta.stamp(&k, seq);
          state.mark_loaded(MetaKey::Key(k.clone()), includes, now, seq);
          written.push(k);
        }
        // Requested keys the backend did not return are loaded as absent.
        for k in key.explicit() {
          if !state.meta.is_superseded(k, seq) {
            state.mark_loaded(MetaKey::Key(k.clone()), includes, now, seq);
          }
        }
        if let Some(alias) = key.as_alias() {
          state.mark_loaded(MetaKey::Alias(alias.clone()), includes, now, seq);
        }
        debug!(resource = %self.name, ?key, written = written.len(), removed = removed.len(), "load committed");
        Ok((written, removed))
      }
      Err(report) => {
        let error = ResourceError::load(&self.name, key, report);
        warn!(resource = %self.name, ?key, %error, "load failed");
        for k in key.explicit() {
          if !state.meta.is_superseded(k, seq) {
            state.meta.mark_failed(MetaKey::Key(k.clone()), error.clone());
          }
        }
        if let Some(alias) = key.as_alias() {
          state.meta.mark_failed(MetaKey::Alias(alias.clone()), error.clone());
        }
        Err(error)
      }
    };
    state.meta.settle();
    drop(guard);

    match outcome {
      Ok((written, removed)) => {
        if !removed.is_empty() {
          self.emit(ResourceEvent::Deleted { keys: removed });
        }
        self.emit(ResourceEvent::Loaded {
          key: signature.key,
          keys: written,
        });
        Ok(())
      }
      Err(error) => {
        self.emit(ResourceEvent::Failed {
          key: signature.key,
          error: error.clone(),
        });
        Err(error)
      }
    }
  }

  /// Clean up after a load task that never reached `commit`.
  fn abort(&self, signature: &LoadSignature<K>, seq: u64, targets: &[MetaKey<K>]) -> ResourceError {
    let mut state = self.lock();
    state.meta.finish_load(signature, seq, targets);
    state.meta.settle();
    ResourceError::aborted(&self.name, &signature.key)
  }
}

impl<K, V> Resource for CachedMapResource<K, V>
where
  K: CacheKey,
  V: Clone + Send + Sync + 'static,
{
  type Key = K;
  type Data = Vec<V>;

  fn name(&self) -> &str {
    &self.inner.name
  }

  fn is_outdated(&self, key: &ResourceKey<K>, includes: &Includes) -> bool {
    self.inner.lock().is_outdated(key, includes)
  }

  fn is_loaded(&self, key: &ResourceKey<K>, includes: &Includes) -> bool {
    self.inner.lock().is_loaded(key, includes)
  }

  fn is_loading(&self, key: &ResourceKey<K>) -> bool {
    self.inner.lock().is_loading(key)
  }

  fn error(&self, key: &ResourceKey<K>) -> Option<ResourceError> {
    self.inner.lock().error(key)
  }

  fn load(&self, key: impl Into<ResourceKey<K>>, includes: &Includes) -> BoxFuture<'static, Result<(), ResourceError>> {
    self.start(key.into(), includes, false)
  }

  fn refresh(&self, key: impl Into<ResourceKey<K>>, includes: &Includes) -> BoxFuture<'static, Result<(), ResourceError>> {
    self.start(key.into(), includes, true)
  }

  fn mark_outdated(&self, key: impl Into<ResourceKey<K>>) {
    let key = key.into();
    let keys: Vec<K> = {
      let mut guard = self.inner.lock();
      let state = &mut *guard;
      let seq = state.meta.next_seq();
      if let Some(alias) = key.as_alias() {
        state.meta.mark_outdated(&MetaKey::Alias(alias.clone()), seq);
      }
      let keys = state
        .resolve(&key)
        .into_iter()
        .filter(|k| state.meta.mark_outdated(&MetaKey::Key(k.clone()), seq))
        .collect();
      state.meta.settle();
      keys
    };
    trace!(resource = %self.inner.name, ?keys, "marked outdated");
    self.inner.emit(ResourceEvent::Outdated { keys });
  }

  fn read(&self, key: &ResourceKey<K>) -> Option<Vec<V>> {
    Some(self.get_many(key))
  }

  fn tracker(&self) -> &UseTracker<K> {
    &self.inner.tracker
  }

  fn subscribe(&self) -> broadcast::Receiver<ResourceEvent<K>> {
    self.inner.events.subscribe()
  }
}

impl<K, V> Clone for CachedMapResource<K, V> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Handle that does not keep the resource alive.
pub(crate) struct WeakMapResource<K, V>(Weak<MapInner<K, V>>);

impl<K, V> WeakMapResource<K, V> {
  pub(crate) fn upgrade(&self) -> Option<CachedMapResource<K, V>> {
    self.0.upgrade().map(|inner| CachedMapResource { inner })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  #[derive(Debug, Clone, PartialEq)]
  struct Team {
    id: String,
    name: String,
    meta: Option<String>,
  }

  fn team(id: &str, name: &str) -> Team {
    Team {
      id: id.to_string(),
      name: name.to_string(),
      meta: None,
    }
  }

  #[derive(Clone, Default)]
  struct Backend {
    teams: Arc<Mutex<BTreeMap<String, Team>>>,
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
  }

  impl Backend {
    fn with(teams: &[Team]) -> Self {
      let backend = Self::default();
      for t in teams {
        backend.put(t.clone());
      }
      backend
    }

    fn put(&self, team: Team) {
      self.teams.lock().unwrap().insert(team.id.clone(), team);
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  struct TestLoader(Backend);

  #[async_trait]
  impl MapLoader<String, Team> for TestLoader {
    async fn load(&self, key: &ResourceKey<String>, includes: &Includes) -> Result<Vec<(String, Team)>> {
      self.0.calls.fetch_add(1, Ordering::SeqCst);
      // The server answers from what it held when the request arrived.
      let teams = self.0.teams.lock().unwrap().clone();
      tokio::time::sleep(std::time::Duration::from_millis(20)).await;
      if self.0.failing.load(Ordering::SeqCst) {
        return Err(eyre!("backend down"));
      }

      let selected: Vec<Team> = match key {
        ResourceKey::Alias(_) => teams.into_values().collect(),
        _ => key
          .explicit()
          .iter()
          .filter_map(|id| teams.get(id).cloned())
          .collect(),
      };
      Ok(
        selected
          .into_iter()
          .map(|mut t| {
            if includes.contains("meta") {
              t.meta = Some(format!("meta-{}", t.id));
            }
            (t.id.clone(), t)
          })
          .collect(),
      )
    }

    fn merge(&self, previous: Option<&Team>, next: Team) -> Team {
      Team {
        meta: next.meta.clone().or_else(|| previous.and_then(|p| p.meta.clone())),
        ..next
      }
    }

    fn validate_key(&self, key: &String) -> bool {
      !key.is_empty()
    }
  }

  fn resource(backend: &Backend) -> CachedMapResource<String, Team> {
    CachedMapResource::new("teams", TestLoader(backend.clone()))
  }

  fn key(k: &str) -> ResourceKey<String> {
    ResourceKey::Single(k.to_string())
  }

  fn none() -> Includes {
    Includes::new()
  }

  #[tokio::test]
  async fn test_never_loaded_is_outdated() {
    let backend = Backend::default();
    let teams = resource(&backend);
    assert!(teams.is_outdated(&key("t1"), &none()));
    assert!(teams.get(&"t1".to_string()).is_none());
    assert_eq!(backend.calls(), 0);
  }

  #[tokio::test]
  async fn test_load_makes_key_fresh_for_its_includes() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);

    teams.load(key("t1"), &none()).await.unwrap();
    assert!(!teams.is_outdated(&key("t1"), &none()));
    assert!(teams.is_loaded(&key("t1"), &none()));
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "One");

    let with_meta = Includes::new().with("meta");
    assert!(teams.is_outdated(&key("t1"), &with_meta));
    teams.load(key("t1"), &with_meta).await.unwrap();
    assert!(!teams.is_outdated(&key("t1"), &with_meta));
    assert_eq!(backend.calls(), 2);
  }

  #[tokio::test]
  async fn test_fresh_load_does_not_fetch() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    teams.load(key("t1"), &none()).await.unwrap();
    teams.load(key("t1"), &none()).await.unwrap();
    assert_eq!(backend.calls(), 1);

    teams.refresh(key("t1"), &none()).await.unwrap();
    assert_eq!(backend.calls(), 2);
  }

  #[tokio::test]
  async fn test_concurrent_identical_loads_fetch_once() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);

    let first = teams.load(key("t1"), &none());
    assert!(teams.is_loading(&key("t1")));
    let second = teams.load(key("t1"), &none());
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(backend.calls(), 1);
    assert!(!teams.is_loading(&key("t1")));
  }

  #[tokio::test]
  async fn test_mark_outdated_keeps_data() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    teams.load(key("t1"), &none()).await.unwrap();

    teams.mark_outdated(key("t1"));
    assert!(teams.is_outdated(&key("t1"), &none()));
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "One");

    backend.put(team("t1", "Renamed"));
    teams.load(key("t1"), &none()).await.unwrap();
    assert!(!teams.is_outdated(&key("t1"), &none()));
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "Renamed");
  }

  #[tokio::test]
  async fn test_all_alias_replaces_cache() {
    let backend = Backend::with(&[team("t1", "One"), team("t2", "Two")]);
    let teams = resource(&backend);
    teams.set_many([
      ("t1".to_string(), team("t1", "One")),
      ("t3".to_string(), team("t3", "Three")),
    ]);

    teams.load(ResourceKey::all(), &none()).await.unwrap();
    assert_eq!(teams.keys(), vec!["t1", "t2"]);
    assert!(!teams.is_outdated(&ResourceKey::all(), &none()));
    assert_eq!(teams.get_many(&ResourceKey::all()).len(), 2);
  }

  #[tokio::test]
  async fn test_partial_load_keeps_other_keys() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    teams.set("t3".to_string(), team("t3", "Three"));

    teams.load(key("t1"), &none()).await.unwrap();
    assert_eq!(teams.keys(), vec!["t1", "t3"]);
  }

  #[tokio::test]
  async fn test_replace_and_set() {
    let backend = Backend::default();
    let teams = resource(&backend);
    teams.set("t1".to_string(), team("t1", "One"));
    teams.set("t2".to_string(), team("t2", "Two"));
    assert_eq!(teams.len(), 2);
    assert!(!teams.is_outdated(&key("t2"), &none()));

    teams.replace([("t2".to_string(), team("t2", "Two"))]);
    assert_eq!(teams.keys(), vec!["t2"]);
  }

  #[tokio::test]
  async fn test_delete_is_not_resurrected_by_late_load() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);

    let pending = teams.load(key("t1"), &none());
    assert_eq!(teams.delete("t1".to_string()), Vec::<String>::new());
    pending.await.unwrap();

    assert!(teams.get(&"t1".to_string()).is_none());
    assert!(teams.is_outdated(&key("t1"), &none()));
  }

  #[tokio::test]
  async fn test_load_running_across_mark_outdated_stays_outdated() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);

    let pending = teams.load(key("t1"), &none());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backend.put(team("t1", "Two"));
    teams.mark_outdated(key("t1"));
    pending.await.unwrap();

    assert!(teams.is_outdated(&key("t1"), &none()));
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "One");

    teams.load(key("t1"), &none()).await.unwrap();
    assert!(!teams.is_outdated(&key("t1"), &none()));
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "Two");
    assert_eq!(backend.calls(), 2);
  }

  #[tokio::test]
  async fn test_load_after_mark_outdated_does_not_join_stale_load() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);

    let first = teams.load(key("t1"), &none());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    backend.put(team("t1", "Two"));
    teams.mark_outdated(key("t1"));
    let second = teams.load(key("t1"), &none());
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok() && b.is_ok());

    assert_eq!(backend.calls(), 2);
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "Two");
    assert!(!teams.is_outdated(&key("t1"), &none()));
    assert!(!teams.is_loading(&key("t1")));
  }

  #[tokio::test]
  async fn test_load_after_delete_fetches_again() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);

    let first = teams.load(key("t1"), &none());
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    teams.delete("t1".to_string());
    assert!(teams.is_loading(&key("t1")));

    let second = teams.load(key("t1"), &none());
    let (a, b) = tokio::join!(first, second);
    assert!(a.is_ok() && b.is_ok());

    assert_eq!(backend.calls(), 2);
    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "One");
    assert!(!teams.is_outdated(&key("t1"), &none()));
    assert!(!teams.is_loading(&key("t1")));
  }

  #[tokio::test]
  async fn test_late_load_does_not_clobber_newer_write() {
    let backend = Backend::with(&[team("t1", "Server")]);
    let teams = resource(&backend);

    let pending = teams.load(key("t1"), &none());
    teams.set("t1".to_string(), team("t1", "Local"));
    pending.await.unwrap();

    assert_eq!(teams.get(&"t1".to_string()).unwrap().name, "Local");
  }

  #[tokio::test]
  async fn test_merge_preserves_unrequested_fields() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    teams.load(key("t1"), &Includes::new().with("meta")).await.unwrap();
    assert_eq!(
      teams.get(&"t1".to_string()).unwrap().meta.as_deref(),
      Some("meta-t1")
    );

    teams.set("t1".to_string(), team("t1", "Renamed"));
    let cached = teams.get(&"t1".to_string()).unwrap();
    assert_eq!(cached.name, "Renamed");
    assert_eq!(cached.meta.as_deref(), Some("meta-t1"));
  }

  #[tokio::test]
  async fn test_invalid_key_is_rejected() {
    let backend = Backend::default();
    let teams = resource(&backend);

    let result = teams.load(key(""), &none()).await;
    assert!(matches!(result, Err(ResourceError::InvalidKey { .. })));

    let unknown = ResourceKey::alias(ResourceAlias::new("unknown"));
    let result = teams.load(unknown, &none()).await;
    assert!(matches!(result, Err(ResourceError::InvalidKey { .. })));
    assert_eq!(backend.calls(), 0);
  }

  #[tokio::test]
  async fn test_failure_is_stored_and_cleared() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    backend.failing.store(true, Ordering::SeqCst);

    let result = teams.load(key("t1"), &none()).await;
    assert!(matches!(result, Err(ResourceError::Load { .. })));
    assert!(teams.error(&key("t1")).is_some());
    assert!(teams.is_outdated(&key("t1"), &none()));

    backend.failing.store(false, Ordering::SeqCst);
    let pending = teams.load(key("t1"), &none());
    assert!(teams.error(&key("t1")).is_none());
    pending.await.unwrap();
    assert!(teams.error(&key("t1")).is_none());
  }

  #[tokio::test]
  async fn test_custom_alias_merges() {
    let backend = Backend::with(&[team("t1", "One"), team("t2", "Two")]);
    let teams = resource(&backend);
    teams.set("t9".to_string(), team("t9", "Nine"));
    teams.register_alias("named", |alias, data| {
      data
        .values()
        .filter(|t| Some(t.name.as_str()) == alias.param())
        .map(|t| t.id.clone())
        .collect()
    });

    let named = ResourceKey::alias(ResourceAlias::new("named").with_param("Two"));
    teams.load(named.clone(), &none()).await.unwrap();
    assert_eq!(teams.keys(), vec!["t1", "t2", "t9"]);
    assert_eq!(teams.get_many(&named), vec![team("t2", "Two")]);
  }

  #[tokio::test]
  async fn test_events() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    let mut events = teams.subscribe();

    teams.load(key("t1"), &none()).await.unwrap();
    assert!(matches!(events.recv().await.unwrap(), ResourceEvent::Loading { .. }));
    match events.recv().await.unwrap() {
      ResourceEvent::Loaded { keys, .. } => assert_eq!(keys, vec!["t1"]),
      other => panic!("unexpected event {:?}", other),
    }

    teams.delete("t1".to_string());
    assert!(matches!(events.recv().await.unwrap(), ResourceEvent::Deleted { .. }));
  }

  #[tokio::test]
  async fn test_purge_skips_used_keys() {
    let backend = Backend::default();
    let teams = resource(&backend);
    teams.set("t1".to_string(), team("t1", "One"));
    teams.set("t2".to_string(), team("t2", "Two"));
    let id = teams.tracker().use_key(key("t1"));

    let later = Utc::now() + Duration::hours(1);
    let purged = teams.purge_unused_at(later, Duration::minutes(5));
    assert_eq!(purged, vec!["t2"]);
    assert_eq!(teams.keys(), vec!["t1"]);

    // Freshly written entries are kept.
    teams.tracker().free(&key("t1"), id);
    assert!(teams.purge_unused(Duration::minutes(5)).is_empty());
  }

  #[tokio::test]
  async fn test_clear_drops_everything() {
    let backend = Backend::with(&[team("t1", "One")]);
    let teams = resource(&backend);
    teams.load(key("t1"), &none()).await.unwrap();

    let pending = teams.load(key("t2"), &none());
    teams.clear();
    pending.await.unwrap();

    assert!(teams.is_empty());
    assert!(teams.is_outdated(&key("t1"), &none()));
  }
}
