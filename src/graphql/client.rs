use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, trace};
use url::Url;

use super::api_types::GraphQlResponse;
use super::GraphQlError;

/// Sends one GraphQL operation and returns its `data` member.
#[async_trait]
pub trait GraphQlTransport: Send + Sync + 'static {
  async fn execute(&self, operation: &str, query: &str, variables: Value) -> Result<Value, GraphQlError>;
}

/// GraphQL over HTTP POST.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  endpoint: Url,
}

impl HttpTransport {
  pub fn new(endpoint: Url, token: Option<&str>, timeout: Duration) -> Result<Self, GraphQlError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = token {
      // An unusable token is left out rather than failing construction.
      if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
        headers.insert(AUTHORIZATION, value);
      }
    }
    let client = reqwest::Client::builder()
      .default_headers(headers)
      .timeout(timeout)
      .build()?;
    Ok(Self { client, endpoint })
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }
}

#[async_trait]
impl GraphQlTransport for HttpTransport {
  async fn execute(&self, operation: &str, query: &str, variables: Value) -> Result<Value, GraphQlError> {
    let body = json!({
      "query": query,
      "variables": variables,
      "operationName": operation,
    });
    trace!(operation, %variables, "graphql request");

    let response = self.client.post(self.endpoint.clone()).json(&body).send().await?;
    let status = response.status();
    if !status.is_success() {
      return Err(GraphQlError::Http {
        operation: operation.to_string(),
        status: status.as_u16(),
      });
    }

    let response: GraphQlResponse = response.json().await?;
    extract_data(operation, response)
  }
}

/// Application errors win over partial data.
pub(crate) fn extract_data(operation: &str, response: GraphQlResponse) -> Result<Value, GraphQlError> {
  if !response.errors.is_empty() {
    return Err(GraphQlError::Server {
      operation: operation.to_string(),
      messages: response.errors.into_iter().map(|e| e.message).collect(),
    });
  }
  match response.data {
    Some(Value::Null) | None => Err(GraphQlError::MissingData {
      operation: operation.to_string(),
    }),
    Some(data) => Ok(data),
  }
}

/// Typed front end over a transport.
pub struct GraphQlClient {
  transport: Arc<dyn GraphQlTransport>,
}

impl GraphQlClient {
  pub fn new(transport: impl GraphQlTransport) -> Self {
    Self {
      transport: Arc::new(transport),
    }
  }

  /// Run `query` and decode its data into `T`.
  pub async fn request<T: DeserializeOwned>(
    &self,
    operation: &str,
    query: &str,
    variables: Value,
  ) -> Result<T, GraphQlError> {
    let data = self.transport.execute(operation, query, variables).await?;
    let decoded = serde_json::from_value(data).map_err(|source| GraphQlError::Decode {
      operation: operation.to_string(),
      source,
    })?;
    debug!(operation, "graphql request succeeded");
    Ok(decoded)
  }
}

impl Clone for GraphQlClient {
  fn clone(&self) -> Self {
    Self {
      transport: Arc::clone(&self.transport),
    }
  }
}


#[cfg(test)]
mod tests {
  use super::mock::MockTransport;
  use super::*;
  use serde::Deserialize;

  #[derive(Debug, Deserialize, PartialEq)]
  struct Answer {
    value: u32,
  }

  #[test]
  fn test_extract_data_prefers_errors() {
    let response: GraphQlResponse = serde_json::from_value(json!({
      "data": { "value": 1 },
      "errors": [{ "message": "access denied" }, { "message": "try again" }]
    }))
    .unwrap();
    let err = extract_data("getAnswer", response).unwrap_err();
    match err {
      GraphQlError::Server { operation, messages } => {
        assert_eq!(operation, "getAnswer");
        assert_eq!(messages, vec!["access denied", "try again"]);
      }
      other => panic!("unexpected error {:?}", other),
    }
  }

  #[test]
  fn test_extract_data_requires_data() {
    let response: GraphQlResponse = serde_json::from_value(json!({ "data": null })).unwrap();
    assert!(matches!(
      extract_data("getAnswer", response),
      Err(GraphQlError::MissingData { .. })
    ));

    let response: GraphQlResponse = serde_json::from_value(json!({ "data": { "value": 2 } })).unwrap();
    assert_eq!(extract_data("getAnswer", response).unwrap(), json!({ "value": 2 }));
  }

  #[tokio::test]
  async fn test_request_decodes_data() {
    let transport = MockTransport::new(|_, variables| Ok(json!({ "value": variables["n"] })));
    let client = GraphQlClient::new(transport.clone());

    let answer: Answer = client
      .request("getAnswer", "query getAnswer { value }", json!({ "n": 42 }))
      .await
      .unwrap();
    assert_eq!(answer, Answer { value: 42 });
    assert_eq!(transport.count("getAnswer"), 1);
  }

  #[tokio::test]
  async fn test_request_reports_decode_errors() {
    let client = GraphQlClient::new(MockTransport::new(|_, _| Ok(json!({ "value": "nope" }))));
    let result: Result<Answer, _> = client.request("getAnswer", "", json!({})).await;
    assert!(matches!(result, Err(GraphQlError::Decode { .. })));
  }
}
