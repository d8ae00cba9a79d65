use std::ops::Deref;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::{json, Value};

use super::session::SessionResource;
use crate::cache::{CachedDataResource, DataLoader, Includes};
use crate::graphql::api_types::{ApiProductSettings, ProductSettingsResponse};
use crate::graphql::{operations, GraphQlClient};

pub type ServerSettings = ApiProductSettings;

struct SettingsLoader {
  client: GraphQlClient,
}

#[async_trait]
impl DataLoader<ServerSettings> for SettingsLoader {
  async fn load(&self, _includes: &Includes) -> Result<ServerSettings> {
    let response: ProductSettingsResponse = self
      .client
      .request("getProductSettings", operations::GET_PRODUCT_SETTINGS, json!({}))
      .await?;
    Ok(response.settings)
  }
}

/// Product settings; reloaded whenever the session changes.
#[derive(Clone)]
pub struct ServerSettingsResource {
  cache: CachedDataResource<ServerSettings>,
}

impl ServerSettingsResource {
  /// Must be called from within a tokio runtime.
  pub fn new(client: GraphQlClient, session: &SessionResource) -> Self {
    let cache = CachedDataResource::new("server-settings", SettingsLoader { client });
    cache.sync(session.cache());
    Self { cache }
  }

  pub fn cache(&self) -> &CachedDataResource<ServerSettings> {
    &self.cache
  }

  /// Value of one setting, if loaded.
  pub fn setting(&self, key: &str) -> Option<Value> {
    self
      .cache
      .data()?
      .settings
      .into_iter()
      .find(|setting| setting.key == key)
      .and_then(|setting| setting.value)
  }
}

impl Deref for ServerSettingsResource {
  type Target = CachedDataResource<ServerSettings>;

  fn deref(&self) -> &Self::Target {
    &self.cache
  }
}
