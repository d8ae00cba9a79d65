use std::ops::Deref;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::json;

use crate::cache::{CachedDataResource, DataLoader, Includes};
use crate::graphql::api_types::{ApiSession, SessionStateResponse};
use crate::graphql::{operations, GraphQlClient};

pub type SessionInfo = ApiSession;

struct SessionLoader {
  client: GraphQlClient,
}

#[async_trait]
impl DataLoader<SessionInfo> for SessionLoader {
  async fn load(&self, _includes: &Includes) -> Result<SessionInfo> {
    let response: SessionStateResponse = self
      .client
      .request("getSessionState", operations::GET_SESSION_STATE, json!({}))
      .await?;
    Ok(response.session)
  }
}

/// State of the server session of this client.
#[derive(Clone)]
pub struct SessionResource {
  cache: CachedDataResource<SessionInfo>,
}

impl SessionResource {
  pub fn new(client: GraphQlClient) -> Self {
    Self {
      cache: CachedDataResource::new("session", SessionLoader { client }),
    }
  }

  pub fn cache(&self) -> &CachedDataResource<SessionInfo> {
    &self.cache
  }

  pub fn is_valid(&self) -> bool {
    self.cache.data().is_some_and(|session| session.valid)
  }
}

impl Deref for SessionResource {
  type Target = CachedDataResource<SessionInfo>;

  fn deref(&self) -> &Self::Target {
    &self.cache
  }
}
