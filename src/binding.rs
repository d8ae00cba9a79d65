//! Consumer-side binding to a resource.
//!
//! A `ResourceBinding` is what a screen or command holds to read one key of a
//! resource. It registers interest with the resource's use tracker, starts
//! loads when the resource reports the key outdated, and exposes the result
//! as a small state machine that an event loop polls.
//!
//! # Example
//!
//! ```ignore
//! let mut binding = ResourceBinding::new(teams.clone(), Some(ResourceKey::all()));
//!
//! // In event loop tick
//! if binding.poll() {
//!     // State changed, redraw
//! }
//!
//! match binding.state() {
//!     BindingState::Loading => render_spinner(),
//!     BindingState::Loaded(teams) => render_teams(&teams),
//!     BindingState::Failed(e) => render_error(&e),
//!     BindingState::Idle => {}
//! }
//! ```

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error};

use crate::cache::{Includes, Resource, ResourceKey, UseId};
use crate::error::ResourceError;

/// What a binding currently has to offer.
#[derive(Debug, Clone)]
pub enum BindingState<T> {
  /// No key, or the binding is inactive.
  Idle,
  /// Data is not available yet.
  Loading,
  /// Loaded data. May be outdated while a reload runs.
  Loaded(T),
  Failed(ResourceError),
}

impl<T> BindingState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, BindingState::Loading)
  }

  pub fn is_loaded(&self) -> bool {
    matches!(self, BindingState::Loaded(_))
  }

  pub fn is_failed(&self) -> bool {
    matches!(self, BindingState::Failed(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      BindingState::Loaded(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ResourceError> {
    match self {
      BindingState::Failed(e) => Some(e),
      _ => None,
    }
  }
}

/// Receives load failures of bindings that are not silent.
pub trait ErrorContext: Send + Sync {
  fn catch(&self, error: &ResourceError);
}

/// Reports failures to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorContext;

impl ErrorContext for TracingErrorContext {
  fn catch(&self, e: &ResourceError) {
    error!(resource = %e.resource(), kind = ?e.kind(), "{}", e);
  }
}

#[derive(Debug, Clone, Copy)]
pub struct BindingOptions {
  /// Inactive bindings never start loads.
  pub active: bool,
  /// Keep serving what is loaded and do not reload while frozen.
  pub freeze: bool,
  /// Do not forward failures to the error context.
  pub silent: bool,
}

impl Default for BindingOptions {
  fn default() -> Self {
    Self {
      active: true,
      freeze: false,
      silent: false,
    }
  }
}

type LoadResult = Result<(), ResourceError>;
type DataCallback<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&ResourceError) + Send + Sync>;

pub struct ResourceBinding<R: Resource> {
  resource: R,
  key: Option<ResourceKey<R::Key>>,
  includes: Includes,
  options: BindingOptions,
  use_id: Option<UseId>,
  receiver: Option<oneshot::Receiver<LoadResult>>,
  exception: Option<ResourceError>,
  error_context: Arc<dyn ErrorContext>,
  on_data: Option<DataCallback<R::Data>>,
  on_error: Option<ErrorCallback>,
}

impl<R: Resource> ResourceBinding<R> {
  /// Bind to `key`. `None` leaves the binding idle until a key is set.
  pub fn new(resource: R, key: Option<ResourceKey<R::Key>>) -> Self {
    let mut binding = Self {
      resource,
      key: None,
      includes: Includes::new(),
      options: BindingOptions::default(),
      use_id: None,
      receiver: None,
      exception: None,
      error_context: Arc::new(TracingErrorContext),
      on_data: None,
      on_error: None,
    };
    binding.set_key(key);
    binding
  }

  pub fn with_includes(mut self, includes: Includes) -> Self {
    self.includes = includes;
    self
  }

  pub fn with_options(mut self, options: BindingOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_error_context(mut self, context: Arc<dyn ErrorContext>) -> Self {
    self.error_context = context;
    self
  }

  /// Called with the data each time a load of this binding finishes.
  pub fn with_on_data(mut self, callback: impl Fn(&R::Data) + Send + Sync + 'static) -> Self {
    self.on_data = Some(Arc::new(callback));
    self
  }

  /// Called with every load failure, silent or not.
  pub fn with_on_error(mut self, callback: impl Fn(&ResourceError) + Send + Sync + 'static) -> Self {
    self.on_error = Some(Arc::new(callback));
    self
  }

  pub fn resource(&self) -> &R {
    &self.resource
  }

  pub fn key(&self) -> Option<&ResourceKey<R::Key>> {
    self.key.as_ref()
  }

  pub fn includes(&self) -> &Includes {
    &self.includes
  }

  pub fn options(&self) -> BindingOptions {
    self.options
  }

  /// Switch to another key. The result of a load started for the previous
  /// key is never delivered.
  pub fn set_key(&mut self, key: Option<ResourceKey<R::Key>>) {
    if self.key == key && (key.is_none() || self.use_id.is_some()) {
      return;
    }
    self.release();
    if let Some(key) = &key {
      self.use_id = Some(self.resource.tracker().use_key(key.clone()));
    }
    self.key = key;
    self.receiver = None;
    self.exception = None;
  }

  pub fn set_includes(&mut self, includes: Includes) {
    if self.includes != includes {
      self.includes = includes;
      self.receiver = None;
      self.exception = None;
    }
  }

  pub fn set_options(&mut self, options: BindingOptions) {
    self.options = options;
  }

  /// Collect a finished load and start a new one if needed.
  ///
  /// Returns `true` if something changed. Call this from the event loop tick.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    if let Some(receiver) = &mut self.receiver {
      match receiver.try_recv() {
        Ok(Ok(())) => {
          self.receiver = None;
          self.exception = None;
          self.loaded();
          changed = true;
        }
        Ok(Err(e)) => {
          self.receiver = None;
          self.fail(e);
          changed = true;
        }
        Err(oneshot::error::TryRecvError::Empty) => {}
        Err(oneshot::error::TryRecvError::Closed) => {
          self.receiver = None;
          changed = true;
        }
      }
    }

    if self.can_load() {
      self.start(false);
      changed = true;
    }
    changed
  }

  /// Current state, computed from the resource.
  pub fn state(&self) -> BindingState<R::Data> {
    let Some(key) = &self.key else {
      return BindingState::Idle;
    };
    let pending = self.receiver.is_some();

    if let Some(e) = &self.exception {
      if !pending {
        return BindingState::Failed(e.clone());
      }
    }
    if self.resource.is_loaded(key, &self.includes) {
      if let Some(data) = self.resource.read(key) {
        return BindingState::Loaded(data);
      }
    }
    if pending || self.resource.is_loading(key) || self.options.active {
      BindingState::Loading
    } else {
      BindingState::Idle
    }
  }

  /// True once data for the current key and includes is available.
  pub fn is_ready(&self) -> bool {
    self
      .key
      .as_ref()
      .is_some_and(|key| self.resource.is_loaded(key, &self.includes))
  }

  pub fn is_loading(&self) -> bool {
    self.receiver.is_some()
      || self
        .key
        .as_ref()
        .is_some_and(|key| self.resource.is_loading(key))
  }

  pub fn is_outdated(&self) -> bool {
    self
      .key
      .as_ref()
      .is_some_and(|key| self.resource.is_outdated(key, &self.includes))
  }

  pub fn data(&self) -> Option<R::Data> {
    self.state().data().cloned()
  }

  pub fn error(&self) -> Option<&ResourceError> {
    self.exception.as_ref()
  }

  /// Clear the failure and load again.
  pub fn retry(&mut self) {
    self.exception = None;
    self.start(false);
  }

  /// Load regardless of freshness.
  pub fn reload(&mut self) {
    self.exception = None;
    self.start(true);
  }

  /// Load if needed and wait for the data instead of polling.
  pub async fn resolve(&mut self) -> Result<Option<R::Data>, ResourceError> {
    let Some(key) = self.key.clone() else {
      return Ok(None);
    };
    self.receiver = None;
    if let Err(e) = self.resource.load(key.clone(), &self.includes).await {
      self.fail(e.clone());
      return Err(e);
    }
    self.exception = None;
    let data = self.resource.read(&key);
    if let (Some(callback), Some(data)) = (&self.on_data, &data) {
      callback(data);
    }
    Ok(data)
  }

  fn can_load(&self) -> bool {
    let Some(key) = &self.key else {
      return false;
    };
    self.options.active
      && !self.options.freeze
      && self.receiver.is_none()
      && self.exception.is_none()
      && self.resource.is_outdated(key, &self.includes)
  }

  fn start(&mut self, force: bool) {
    let Some(key) = self.key.clone() else {
      return;
    };
    let future = if force {
      self.resource.refresh(key.clone(), &self.includes)
    } else {
      self.resource.load(key.clone(), &self.includes)
    };
    debug!(resource = %self.resource.name(), ?key, force, "binding load");

    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
      // Ignore send errors - the binding may have moved on
      let _ = tx.send(future.await);
    });
    self.receiver = Some(rx);
  }

  fn loaded(&self) {
    let (Some(callback), Some(key)) = (&self.on_data, &self.key) else {
      return;
    };
    if let Some(data) = self.resource.read(key) {
      callback(&data);
    }
  }

  fn fail(&mut self, e: ResourceError) {
    if let Some(callback) = &self.on_error {
      callback(&e);
    }
    if !self.options.silent {
      self.error_context.catch(&e);
    }
    self.exception = Some(e);
  }

  fn release(&mut self) {
    if let (Some(key), Some(id)) = (&self.key, self.use_id.take()) {
      self.resource.tracker().free(key, id);
    }
  }
}

impl<R: Resource> Drop for ResourceBinding<R> {
  fn drop(&mut self) {
    self.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CachedMapResource, MapLoader};
  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;
  use std::time::Duration;

  #[derive(Clone, Default)]
  struct Loader {
    calls: Arc<AtomicUsize>,
    failing: Arc<AtomicBool>,
  }

  #[async_trait]
  impl MapLoader<u32, String> for Loader {
    async fn load(&self, key: &ResourceKey<u32>, _includes: &Includes) -> Result<Vec<(u32, String)>> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(10)).await;
      if self.failing.load(Ordering::SeqCst) {
        return Err(eyre!("offline"));
      }
      let keys: Vec<u32> = match key {
        ResourceKey::Alias(_) => vec![1, 2],
        _ => key.explicit().to_vec(),
      };
      Ok(keys.into_iter().map(|k| (k, format!("value-{}", k))).collect())
    }
  }

  #[derive(Default)]
  struct Recorder(Mutex<Vec<String>>);

  impl ErrorContext for Recorder {
    fn catch(&self, error: &ResourceError) {
      self.0.lock().unwrap().push(error.to_string());
    }
  }

  fn resource(loader: &Loader) -> CachedMapResource<u32, String> {
    CachedMapResource::new("values", loader.clone())
  }

  async fn settle<R: Resource>(binding: &mut ResourceBinding<R>) {
    tokio::time::sleep(Duration::from_millis(40)).await;
    binding.poll();
  }

  #[tokio::test]
  async fn test_binding_loads_on_poll() {
    let loader = Loader::default();
    let mut binding = ResourceBinding::new(resource(&loader), Some(ResourceKey::Single(1)));

    assert!(binding.state().is_loading());
    assert!(!binding.is_ready());
    assert!(binding.poll());
    assert!(binding.is_loading());

    settle(&mut binding).await;
    assert!(binding.is_ready());
    assert_eq!(binding.data(), Some(vec!["value-1".to_string()]));
    assert!(!binding.poll());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_two_bindings_share_one_fetch() {
    let loader = Loader::default();
    let values = resource(&loader);
    let mut first = ResourceBinding::new(values.clone(), Some(ResourceKey::all()));
    let mut second = ResourceBinding::new(values.clone(), Some(ResourceKey::all()));

    first.poll();
    second.poll();
    settle(&mut first).await;
    second.poll();

    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.data(), second.data());
    assert_eq!(values.tracker().use_count(&ResourceKey::all()), 2);
  }

  #[tokio::test]
  async fn test_two_bindings_on_one_key_share_one_fetch() {
    let loader = Loader::default();
    let values = resource(&loader);
    let mut first = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1)));
    let mut second = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1)));

    first.poll();
    second.poll();
    settle(&mut first).await;
    second.poll();

    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.data(), Some(vec!["value-1".to_string()]));
    assert_eq!(first.data(), second.data());
    assert_eq!(values.tracker().use_count(&ResourceKey::Single(1)), 2);

    drop(first);
    assert_eq!(values.tracker().use_count(&ResourceKey::Single(1)), 1);
  }

  #[tokio::test]
  async fn test_callbacks_see_results() {
    let loader = Loader::default();
    let values = resource(&loader);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let errors = Arc::new(AtomicUsize::new(0));

    let data_seen = seen.clone();
    let error_count = errors.clone();
    let mut binding = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1)))
      .with_on_data(move |data: &Vec<String>| data_seen.lock().unwrap().extend(data.iter().cloned()))
      .with_on_error(move |_| {
        error_count.fetch_add(1, Ordering::SeqCst);
      });

    binding.poll();
    settle(&mut binding).await;
    assert_eq!(*seen.lock().unwrap(), vec!["value-1".to_string()]);
    assert_eq!(errors.load(Ordering::SeqCst), 0);

    loader.failing.store(true, Ordering::SeqCst);
    binding.reload();
    settle(&mut binding).await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_failure_is_reported_and_not_retried() {
    let loader = Loader::default();
    loader.failing.store(true, Ordering::SeqCst);
    let recorder = Arc::new(Recorder::default());
    let mut binding = ResourceBinding::new(resource(&loader), Some(ResourceKey::Single(1)))
      .with_error_context(recorder.clone());

    binding.poll();
    settle(&mut binding).await;
    assert!(binding.state().is_failed());
    assert_eq!(recorder.0.lock().unwrap().len(), 1);

    assert!(!binding.poll());
    settle(&mut binding).await;
    assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

    loader.failing.store(false, Ordering::SeqCst);
    binding.retry();
    settle(&mut binding).await;
    assert!(binding.state().is_loaded());
    assert!(binding.error().is_none());
    assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_silent_binding_does_not_report() {
    let loader = Loader::default();
    loader.failing.store(true, Ordering::SeqCst);
    let recorder = Arc::new(Recorder::default());
    let errors = Arc::new(AtomicUsize::new(0));
    let count = errors.clone();
    let mut binding = ResourceBinding::new(resource(&loader), Some(ResourceKey::Single(1)))
      .with_options(BindingOptions {
        silent: true,
        ..Default::default()
      })
      .with_error_context(recorder.clone())
      .with_on_error(move |e| {
        assert!(matches!(e, ResourceError::Load { .. }));
        count.fetch_add(1, Ordering::SeqCst);
      });

    binding.poll();
    settle(&mut binding).await;
    assert!(binding.error().is_some());
    assert!(recorder.0.lock().unwrap().is_empty());
    assert_eq!(errors.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_key_change_discards_previous_result() {
    let loader = Loader::default();
    let values = resource(&loader);
    let mut binding = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1)));
    binding.poll();

    binding.set_key(Some(ResourceKey::Single(2)));
    assert!(!values.tracker().is_used(&ResourceKey::Single(1)));
    assert!(values.tracker().is_used(&ResourceKey::Single(2)));
    assert!(binding.state().is_loading());

    settle(&mut binding).await;
    settle(&mut binding).await;
    assert_eq!(binding.data(), Some(vec!["value-2".to_string()]));
  }

  #[tokio::test]
  async fn test_inactive_and_frozen_bindings_do_not_load() {
    let loader = Loader::default();
    let values = resource(&loader);
    let mut binding = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1))).with_options(
      BindingOptions {
        active: false,
        ..Default::default()
      },
    );
    assert!(!binding.poll());
    assert!(matches!(binding.state(), BindingState::Idle));

    values.set(1, "local".to_string());
    binding.set_options(BindingOptions {
      freeze: true,
      ..Default::default()
    });
    values.mark_outdated(1);
    assert!(!binding.poll());
    assert_eq!(binding.data(), Some(vec!["local".to_string()]));
    assert_eq!(loader.calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_outdated_data_is_served_during_reload() {
    let loader = Loader::default();
    let values = resource(&loader);
    let mut binding = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1)));
    binding.resolve().await.unwrap();

    values.mark_outdated(1);
    assert!(binding.poll());
    assert!(binding.is_loading());
    assert!(binding.state().is_loaded());
    settle(&mut binding).await;
    assert!(!binding.is_outdated());
  }

  #[tokio::test]
  async fn test_drop_frees_use() {
    let loader = Loader::default();
    let values = resource(&loader);
    let binding = ResourceBinding::new(values.clone(), Some(ResourceKey::Single(1)));
    assert!(values.tracker().is_used(&ResourceKey::Single(1)));
    drop(binding);
    assert!(!values.tracker().is_used(&ResourceKey::Single(1)));
  }
}
