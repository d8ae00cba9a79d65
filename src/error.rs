//! Errors surfaced by resources and their consumers.

use std::fmt::Debug;
use std::sync::Arc;

use color_eyre::Report;
use thiserror::Error;

use crate::graphql::GraphQlError;

/// Broad classification of a resource error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
  /// The request never produced a usable response (network, HTTP status).
  Transport,
  /// The backend answered but reported an application error.
  Server,
  /// The key was rejected before any request was made.
  Validation,
  /// Anything else (decode failures, aborted loads, loader bugs).
  Other,
}

/// Error stored against a key and handed to every consumer waiting on it.
///
/// Cloneable so one failure can be shared by all deduplicated waiters
/// and kept in the entry metadata at the same time.
#[derive(Debug, Clone, Error)]
pub enum ResourceError {
  #[error("failed to load {resource} {key}: {cause}")]
  Load {
    resource: String,
    key: String,
    cause: Arc<Report>,
  },

  #[error("invalid key for {resource}: {key}")]
  InvalidKey { resource: String, key: String },

  #[error("load of {resource} {key} was aborted")]
  Aborted { resource: String, key: String },
}

impl ResourceError {
  pub(crate) fn load(resource: &str, key: &impl Debug, cause: Report) -> Self {
    Self::Load {
      resource: resource.to_string(),
      key: format!("{:?}", key),
      cause: Arc::new(cause),
    }
  }

  pub(crate) fn invalid_key(resource: &str, key: &impl Debug) -> Self {
    Self::InvalidKey {
      resource: resource.to_string(),
      key: format!("{:?}", key),
    }
  }

  pub(crate) fn aborted(resource: &str, key: &impl Debug) -> Self {
    Self::Aborted {
      resource: resource.to_string(),
      key: format!("{:?}", key),
    }
  }

  /// Name of the resource the error belongs to.
  pub fn resource(&self) -> &str {
    match self {
      Self::Load { resource, .. }
      | Self::InvalidKey { resource, .. }
      | Self::Aborted { resource, .. } => resource,
    }
  }

  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::InvalidKey { .. } => ErrorKind::Validation,
      Self::Aborted { .. } => ErrorKind::Other,
      Self::Load { cause, .. } => match cause.downcast_ref::<GraphQlError>() {
        Some(GraphQlError::Transport(_)) | Some(GraphQlError::Http { .. }) => ErrorKind::Transport,
        Some(GraphQlError::Server { .. }) => ErrorKind::Server,
        _ => ErrorKind::Other,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;

  #[test]
  fn test_kind_from_graphql_cause() {
    let server = GraphQlError::Server {
      operation: "getTeamsList".to_string(),
      messages: vec!["access denied".to_string()],
    };
    let error = ResourceError::load("teams", &"t1", Report::new(server));
    assert_eq!(error.kind(), ErrorKind::Server);
    assert_eq!(error.resource(), "teams");

    let http = GraphQlError::Http {
      operation: "getTeamsList".to_string(),
      status: 502,
    };
    let error = ResourceError::load("teams", &"t1", Report::new(http));
    assert_eq!(error.kind(), ErrorKind::Transport);
  }

  #[test]
  fn test_kind_for_plain_reports() {
    let error = ResourceError::load("teams", &"t1", eyre!("boom"));
    assert_eq!(error.kind(), ErrorKind::Other);
    assert!(error.to_string().contains("boom"));

    let error = ResourceError::invalid_key("teams", &"");
    assert_eq!(error.kind(), ErrorKind::Validation);
  }
}
