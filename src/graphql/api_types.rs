//! Serde types matching GraphQL responses.
//!
//! Response types are kept apart from the cached domain types so the wire
//! shape can change without touching the resources.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Envelope
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GraphQlResponse {
  pub data: Option<Value>,
  #[serde(default)]
  pub errors: Vec<GraphQlErrorEntry>,
}

#[derive(Debug, Deserialize)]
pub struct GraphQlErrorEntry {
  pub message: String,
}

// ============================================================================
// Teams
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTeam {
  pub team_id: String,
  pub team_name: Option<String>,
  pub description: Option<String>,
  #[serde(default)]
  pub team_permissions: Vec<String>,
  /// Only present when requested with `includeMetaParameters`.
  pub meta_parameters: Option<BTreeMap<String, Value>>,
}

#[derive(Debug, Deserialize)]
pub struct TeamsListResponse {
  pub teams: Vec<ApiTeam>,
}

#[derive(Debug, Deserialize)]
pub struct TeamResponse {
  pub team: ApiTeam,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGrantedUser {
  pub user_id: String,
  pub team_role: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiTeamGrants {
  #[serde(default)]
  pub granted_users_info: Vec<ApiGrantedUser>,
}

#[derive(Debug, Deserialize)]
pub struct TeamGrantedUsersResponse {
  pub team: Vec<ApiTeamGrants>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConnectionGrant {
  pub connection_id: String,
  pub subject_id: String,
  pub subject_type: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectConnectionAccessResponse {
  pub grant_info: Vec<ApiConnectionGrant>,
}

#[derive(Debug, Deserialize)]
pub struct ApiPermission {
  pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct SetPermissionsResponse {
  pub permissions: Vec<ApiPermission>,
}

// ============================================================================
// Session and settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSession {
  pub create_time: String,
  pub last_access_time: String,
  pub locale: String,
  #[serde(default)]
  pub cache_expired: bool,
  #[serde(default)]
  pub valid: bool,
  pub remaining_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SessionStateResponse {
  #[serde(rename = "sessionState")]
  pub session: ApiSession,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSettingsGroup {
  pub id: String,
  pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSetting {
  pub key: String,
  pub display_name: Option<String>,
  pub group_id: Option<String>,
  pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ApiProductSettings {
  #[serde(default)]
  pub groups: Vec<ApiSettingsGroup>,
  #[serde(default)]
  pub settings: Vec<ApiSetting>,
}

#[derive(Debug, Deserialize)]
pub struct ProductSettingsResponse {
  pub settings: ApiProductSettings,
}
