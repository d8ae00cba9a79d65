//! Keyed resource caches with freshness tracking, request deduplication and
//! consumer reference counting, plus the GraphQL-backed resources built on
//! them.

pub mod binding;
pub mod cache;
pub mod error;
pub mod graphql;
pub mod resources;

pub use error::{ErrorKind, ResourceError};
