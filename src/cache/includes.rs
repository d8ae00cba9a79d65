//! Optional field groups requested with a load.

use std::collections::BTreeSet;

use serde_json::{Map, Value};

/// Ordered set of field-group names, e.g. `includeMetaParameters`.
///
/// An entry loaded with one set is fresh only for requests whose set is
/// covered by it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Includes(BTreeSet<String>);

impl Includes {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>) -> Self {
    self.0.insert(name.into());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.0.contains(name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &str> {
    self.0.iter().map(String::as_str)
  }

  /// True if everything requested here was part of `loaded`.
  pub fn is_covered_by(&self, loaded: &Includes) -> bool {
    self.0.is_subset(&loaded.0)
  }

  pub fn union(&self, other: &Includes) -> Includes {
    Includes(self.0.union(&other.0).cloned().collect())
  }

  /// Boolean GraphQL variables for every known include.
  pub fn to_variables(&self, known: &[&str]) -> Map<String, Value> {
    known
      .iter()
      .map(|name| (name.to_string(), Value::Bool(self.contains(name))))
      .collect()
  }
}

impl<S: Into<String>> FromIterator<S> for Includes {
  fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
    Includes(iter.into_iter().map(Into::into).collect())
  }
}
