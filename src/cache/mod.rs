//! Generic resource cache.
//!
//! This module provides a backend-agnostic caching layer that:
//! - Caches entities of a collection by key, or a single value
//! - Tracks per key whether data is loaded, outdated or loading, and with
//!   which optional field groups ("includes")
//! - Shares one fetch between identical concurrent loads
//! - Addresses entries by key, key list or alias, where "all" stands for
//!   the whole collection
//! - Counts consumers per key so unused entries can be purged
//! - Publishes change events that other resources can sync on

mod data;
mod includes;
mod key;
mod map;
mod metadata;
mod traits;
mod tracker;

pub use data::CachedDataResource;
pub use includes::Includes;
pub use key::{CacheKey, ResourceAlias, ResourceKey, ALL_KEY};
pub use map::CachedMapResource;
pub use metadata::EntryMetadata;
pub use traits::{DataLoader, MapLoader, Resource, ResourceEvent};
pub use tracker::{UseId, UseTracker};
