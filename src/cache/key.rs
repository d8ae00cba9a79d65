//! Keys that address resource entries: single keys, key lists and aliases.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fmt::Debug;
use std::hash::Hash;

/// Bounds every concrete resource key satisfies.
pub trait CacheKey: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

impl<T> CacheKey for T where T: Clone + Eq + Hash + Ord + Debug + Send + Sync + 'static {}

const ALL_ALIAS: &str = "all";

/// A symbolic key the resource resolves to a set of concrete keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceAlias {
  name: &'static str,
  param: Option<String>,
}

/// Alias for every entry of a map resource. Loading it replaces the cache.
pub const ALL_KEY: ResourceAlias = ResourceAlias::new(ALL_ALIAS);

impl ResourceAlias {
  pub const fn new(name: &'static str) -> Self {
    Self { name, param: None }
  }

  pub fn with_param(mut self, param: impl Into<String>) -> Self {
    self.param = Some(param.into());
    self
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn param(&self) -> Option<&str> {
    self.param.as_deref()
  }

  pub fn is_all(&self) -> bool {
    self.name == ALL_ALIAS
  }
}

impl fmt::Display for ResourceAlias {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.param {
      Some(param) => write!(f, "@{}:{}", self.name, param),
      None => write!(f, "@{}", self.name),
    }
  }
}

/// Address of one or more entries in a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResourceKey<K> {
  Single(K),
  List(Vec<K>),
  Alias(ResourceAlias),
}

impl<K> ResourceKey<K> {
  pub fn list(keys: impl IntoIterator<Item = K>) -> Self {
    Self::List(keys.into_iter().collect())
  }

  pub fn all() -> Self {
    Self::Alias(ALL_KEY)
  }

  pub fn alias(alias: ResourceAlias) -> Self {
    Self::Alias(alias)
  }

  pub fn is_alias(&self) -> bool {
    matches!(self, Self::Alias(_))
  }

  pub fn is_all(&self) -> bool {
    matches!(self, Self::Alias(alias) if alias.is_all())
  }

  pub fn as_alias(&self) -> Option<&ResourceAlias> {
    match self {
      Self::Alias(alias) => Some(alias),
      _ => None,
    }
  }

  /// Concrete keys named directly by this key. Aliases name none.
  pub fn explicit(&self) -> &[K] {
    match self {
      Self::Single(key) => std::slice::from_ref(key),
      Self::List(keys) => keys,
      Self::Alias(_) => &[],
    }
  }
}

impl<K> From<K> for ResourceKey<K> {
  fn from(key: K) -> Self {
    Self::Single(key)
  }
}

impl<K: fmt::Display> fmt::Display for ResourceKey<K> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Single(key) => write!(f, "{}", key),
      Self::List(keys) => {
        write!(f, "[")?;
        for (i, key) in keys.iter().enumerate() {
          if i > 0 {
            write!(f, ", ")?;
          }
          write!(f, "{}", key)?;
        }
        write!(f, "]")
      }
      Self::Alias(alias) => write!(f, "{}", alias),
    }
  }
}

type AliasResolver<K, V> = Box<dyn Fn(&ResourceAlias, &BTreeMap<K, V>) -> Vec<K> + Send + Sync>;

/// Per-resource table of alias resolvers.
pub(crate) struct AliasRegistry<K, V> {
  resolvers: HashMap<&'static str, AliasResolver<K, V>>,
}

impl<K: CacheKey, V> AliasRegistry<K, V> {
  pub(crate) fn new() -> Self {
    let mut registry = Self {
      resolvers: HashMap::new(),
    };
    registry.register(ALL_ALIAS, |_, data| data.keys().cloned().collect());
    registry
  }

  pub(crate) fn register<F>(&mut self, name: &'static str, resolver: F)
  where
    F: Fn(&ResourceAlias, &BTreeMap<K, V>) -> Vec<K> + Send + Sync + 'static,
  {
    self.resolvers.insert(name, Box::new(resolver));
  }

  pub(crate) fn is_registered(&self, alias: &ResourceAlias) -> bool {
    self.resolvers.contains_key(alias.name())
  }

  /// Resolve a key against the current data. `None` for unknown aliases.
  pub(crate) fn resolve(&self, key: &ResourceKey<K>, data: &BTreeMap<K, V>) -> Option<Vec<K>> {
    match key {
      ResourceKey::Single(key) => Some(vec![key.clone()]),
      ResourceKey::List(keys) => Some(keys.clone()),
      ResourceKey::Alias(alias) => self
        .resolvers
        .get(alias.name())
        .map(|resolver| resolver(alias, data)),
    }
  }
}
