//! GraphQL service used by the concrete resources.

pub mod api_types;
mod client;
pub mod operations;

pub use client::{GraphQlClient, GraphQlTransport, HttpTransport};

#[cfg(test)]
pub(crate) use client::mock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphQlError {
  /// The request never got a response.
  #[error("GraphQL transport error: {0}")]
  Transport(#[from] reqwest::Error),

  #[error("{operation} returned HTTP {status}")]
  Http { operation: String, status: u16 },

  /// The server answered with an `errors` array.
  #[error("{operation} failed: {}", .messages.join("; "))]
  Server {
    operation: String,
    messages: Vec<String>,
  },

  #[error("failed to decode {operation} response: {source}")]
  Decode {
    operation: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("{operation} response has no data")]
  MissingData { operation: String },
}
