//! Teams of the admin area.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Deref;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::try_join_all;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cache::{CachedMapResource, Includes, MapLoader, Resource, ResourceAlias, ResourceKey};
use crate::graphql::api_types::{
  ApiConnectionGrant, ApiTeam, SetPermissionsResponse, SubjectConnectionAccessResponse,
  TeamGrantedUsersResponse, TeamResponse, TeamsListResponse,
};
use crate::graphql::{operations, GraphQlClient};

/// Optional field group carrying team meta parameters.
pub const INCLUDE_META_PARAMETERS: &str = "includeMetaParameters";

const KNOWN_INCLUDES: &[&str] = &[INCLUDE_META_PARAMETERS];

const WITH_PERMISSION_ALIAS: &str = "teams-with-permission";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeamInfo {
  pub team_id: String,
  pub team_name: Option<String>,
  pub description: Option<String>,
  pub team_permissions: Vec<String>,
  pub meta_parameters: Option<BTreeMap<String, Value>>,
  /// Set on teams created by this client until the flags are cleaned.
  pub created_at: Option<DateTime<Utc>>,
}

impl TeamInfo {
  pub fn is_new(&self) -> bool {
    self.created_at.is_some()
  }
}

impl From<ApiTeam> for TeamInfo {
  fn from(team: ApiTeam) -> Self {
    Self {
      team_id: team.team_id,
      team_name: team.team_name,
      description: team.description,
      team_permissions: team.team_permissions,
      meta_parameters: team.meta_parameters,
      created_at: None,
    }
  }
}

/// Fields sent when creating or updating a team.
#[derive(Debug, Clone, Default)]
pub struct TeamInput {
  pub team_id: String,
  pub team_name: Option<String>,
  pub description: Option<String>,
  pub team_permissions: Vec<String>,
}

/// A connection a team or user was granted.
pub type ConnectionGrant = ApiConnectionGrant;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserTeamGrant {
  pub user_id: String,
  pub team_role: Option<String>,
}

/// New teams first, newest first; then the rest by id.
pub fn compare_teams(a: &TeamInfo, b: &TeamInfo) -> Ordering {
  match (a.created_at, b.created_at) {
    (Some(a_at), Some(b_at)) => b_at.cmp(&a_at),
    (None, Some(_)) => Ordering::Greater,
    (Some(_), None) => Ordering::Less,
    (None, None) => a.team_id.cmp(&b.team_id),
  }
}

/// Key of every cached team holding `permission`.
pub fn teams_with_permission(permission: &str) -> ResourceKey<String> {
  ResourceKey::alias(ResourceAlias::new(WITH_PERMISSION_ALIAS).with_param(permission))
}

fn same_permissions(a: &[String], b: &[String]) -> bool {
  let mut a = a.to_vec();
  let mut b = b.to_vec();
  a.sort();
  b.sort();
  a == b
}

struct TeamsLoader {
  client: GraphQlClient,
}

#[async_trait]
impl MapLoader<String, TeamInfo> for TeamsLoader {
  async fn load(&self, key: &ResourceKey<String>, includes: &Includes) -> Result<Vec<(String, TeamInfo)>> {
    let ids: Vec<Option<&String>> = match key {
      ResourceKey::Alias(_) => vec![None],
      _ => key.explicit().iter().map(Some).collect(),
    };

    let query = operations::with_team_fields(operations::GET_TEAMS_LIST);
    let requests = ids.into_iter().map(|team_id| {
      let mut variables = includes.to_variables(KNOWN_INCLUDES);
      variables.insert("teamId".to_string(), json!(team_id));
      self
        .client
        .request::<TeamsListResponse>("getTeamsList", &query, Value::Object(variables))
    });
    let responses = try_join_all(requests).await?;

    Ok(
      responses
        .into_iter()
        .flat_map(|response| response.teams)
        .map(|team| (team.team_id.clone(), TeamInfo::from(team)))
        .collect(),
    )
  }

  /// Shallow merge: fields the response did not carry keep their cached value.
  fn merge(&self, previous: Option<&TeamInfo>, next: TeamInfo) -> TeamInfo {
    let Some(previous) = previous else {
      return next;
    };
    TeamInfo {
      meta_parameters: next
        .meta_parameters
        .or_else(|| previous.meta_parameters.clone()),
      created_at: next.created_at.or(previous.created_at),
      ..next
    }
  }

  fn validate_key(&self, key: &String) -> bool {
    !key.trim().is_empty()
  }
}

/// Cache of teams keyed by team id.
#[derive(Clone)]
pub struct TeamsResource {
  cache: CachedMapResource<String, TeamInfo>,
  client: GraphQlClient,
}

impl TeamsResource {
  pub fn new(client: GraphQlClient) -> Self {
    let cache = CachedMapResource::new(
      "teams",
      TeamsLoader {
        client: client.clone(),
      },
    );
    cache.register_alias(WITH_PERMISSION_ALIAS, |alias, teams| {
      let Some(permission) = alias.param() else {
        return Vec::new();
      };
      teams
        .values()
        .filter(|team| team.team_permissions.iter().any(|p| p == permission))
        .map(|team| team.team_id.clone())
        .collect()
    });
    Self { cache, client }
  }

  pub fn cache(&self) -> &CachedMapResource<String, TeamInfo> {
    &self.cache
  }

  /// Cached teams in display order.
  pub fn sorted(&self) -> Vec<TeamInfo> {
    let mut teams = self.cache.values();
    teams.sort_by(compare_teams);
    teams
  }

  /// Includes a mutation should request so its response matches what is
  /// cached for `team_id`.
  fn includes_for(&self, team_id: &str) -> Includes {
    self
      .cache
      .metadata(&team_id.to_string())
      .map(|meta| meta.includes().clone())
      .unwrap_or_default()
  }

  fn mutation_variables(&self, input: &TeamInput) -> Value {
    let mut variables = self
      .includes_for(&input.team_id)
      .to_variables(KNOWN_INCLUDES);
    variables.insert("teamId".to_string(), json!(input.team_id));
    variables.insert("teamName".to_string(), json!(input.team_name));
    variables.insert("description".to_string(), json!(input.description));
    Value::Object(variables)
  }

  pub async fn create_team(&self, input: TeamInput) -> Result<TeamInfo> {
    let response: TeamResponse = self
      .client
      .request(
        "createTeam",
        &operations::with_team_fields(operations::CREATE_TEAM),
        self.mutation_variables(&input),
      )
      .await?;

    let mut team = TeamInfo::from(response.team);
    team.created_at = Some(Utc::now());
    let team_id = team.team_id.clone();
    self.cache.set(team_id.clone(), team);
    info!(team = %team_id, "team created");

    self
      .set_subject_permissions(&team_id, &input.team_permissions)
      .await?;
    self
      .cache
      .get(&team_id)
      .ok_or_else(|| eyre!("team {} disappeared after creation", team_id))
  }

  pub async fn update_team(&self, input: TeamInput) -> Result<TeamInfo> {
    let response: TeamResponse = self
      .client
      .request(
        "updateTeam",
        &operations::with_team_fields(operations::UPDATE_TEAM),
        self.mutation_variables(&input),
      )
      .await?;

    let team_id = response.team.team_id.clone();
    self.cache.set(team_id.clone(), TeamInfo::from(response.team));
    self
      .set_subject_permissions(&team_id, &input.team_permissions)
      .await?;
    self.cache.mark_outdated(team_id.clone());

    self
      .cache
      .get(&team_id)
      .ok_or_else(|| eyre!("team {} disappeared after update", team_id))
  }

  /// Delete every team `key` stands for, one request per team.
  pub async fn delete_teams(&self, key: impl Into<ResourceKey<String>>, force: bool) -> Result<Vec<String>> {
    let key = key.into();
    let ids = match &key {
      ResourceKey::Alias(_) => self.cache.resolve(&key),
      _ => key.explicit().to_vec(),
    };

    let mut deleted = Vec::with_capacity(ids.len());
    for team_id in ids {
      let _: Value = self
        .client
        .request(
          "deleteTeam",
          operations::DELETE_TEAM,
          json!({ "teamId": team_id, "force": force }),
        )
        .await?;
      self.cache.delete(team_id.clone());
      info!(team = %team_id, "team deleted");
      deleted.push(team_id);
    }
    Ok(deleted)
  }

  pub async fn load_granted_users(&self, team_id: &str) -> Result<Vec<UserTeamGrant>> {
    let response: TeamGrantedUsersResponse = self
      .client
      .request(
        "getTeamGrantedUsers",
        operations::GET_TEAM_GRANTED_USERS,
        json!({ "teamId": team_id }),
      )
      .await?;

    let team = response
      .team
      .into_iter()
      .next()
      .ok_or_else(|| eyre!("Team not found: {}", team_id))?;
    Ok(
      team
        .granted_users_info
        .into_iter()
        .map(|user| UserTeamGrant {
          user_id: user.user_id,
          team_role: user.team_role,
        })
        .collect(),
    )
  }

  /// Connections granted to a subject. Not cached.
  pub async fn subject_connection_access(&self, subject_id: &str) -> Result<Vec<ConnectionGrant>> {
    let response: SubjectConnectionAccessResponse = self
      .client
      .request(
        "getSubjectConnectionAccess",
        operations::GET_SUBJECT_CONNECTION_ACCESS,
        json!({ "subjectId": subject_id }),
      )
      .await?;
    Ok(response.grant_info)
  }

  /// Replace the permissions of a team. Unchanged permissions send nothing.
  pub async fn set_subject_permissions(&self, subject_id: &str, permissions: &[String]) -> Result<()> {
    let key = subject_id.to_string();
    if let Some(team) = self.cache.get(&key) {
      if same_permissions(&team.team_permissions, permissions) {
        return Ok(());
      }
    }

    let response: SetPermissionsResponse = self
      .client
      .request(
        "setSubjectPermissions",
        operations::SET_SUBJECT_PERMISSIONS,
        json!({ "subjectId": subject_id, "permissions": permissions }),
      )
      .await?;
    let granted: Vec<String> = response.permissions.into_iter().map(|p| p.id).collect();

    let updated = self.cache.update(&key, |team| {
      team.team_permissions = granted;
    });
    if !updated {
      debug!(team = %subject_id, "permissions set on uncached team, loading it");
      self.cache.refresh(key, &Includes::new()).await?;
    }
    Ok(())
  }

  /// Drop the "new" marker of every cached team.
  pub fn clean_new_flags(&self) {
    for team_id in self.cache.keys() {
      self.cache.update(&team_id, |team| team.created_at = None);
    }
  }
}

impl Deref for TeamsResource {
  type Target = CachedMapResource<String, TeamInfo>;

  fn deref(&self) -> &Self::Target {
    &self.cache
  }
}
