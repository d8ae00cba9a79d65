//! Query documents sent by the resources.

pub const TEAM_FIELDS: &str = r#"
fragment AdminTeamInfo on AdminTeamInfo {
  teamId
  teamName
  description
  teamPermissions
  metaParameters @include(if: $includeMetaParameters)
}
"#;

pub const GET_TEAMS_LIST: &str = r#"
query getTeamsList($teamId: ID, $includeMetaParameters: Boolean!) {
  teams: listTeams(teamId: $teamId) {
    ...AdminTeamInfo
  }
}
"#;

pub const CREATE_TEAM: &str = r#"
mutation createTeam($teamId: ID!, $teamName: String, $description: String, $includeMetaParameters: Boolean!) {
  team: createTeam(teamId: $teamId, teamName: $teamName, description: $description) {
    ...AdminTeamInfo
  }
}
"#;

pub const UPDATE_TEAM: &str = r#"
mutation updateTeam($teamId: ID!, $teamName: String, $description: String, $includeMetaParameters: Boolean!) {
  team: updateTeam(teamId: $teamId, teamName: $teamName, description: $description) {
    ...AdminTeamInfo
  }
}
"#;

pub const DELETE_TEAM: &str = r#"
mutation deleteTeam($teamId: ID!, $force: Boolean) {
  deleteTeam(teamId: $teamId, force: $force)
}
"#;

pub const GET_TEAM_GRANTED_USERS: &str = r#"
query getTeamGrantedUsers($teamId: ID!) {
  team: listTeams(teamId: $teamId) {
    grantedUsersInfo {
      userId
      teamRole
    }
  }
}
"#;

pub const GET_SUBJECT_CONNECTION_ACCESS: &str = r#"
query getSubjectConnectionAccess($subjectId: ID) {
  grantInfo: getSubjectConnectionAccess(subjectId: $subjectId) {
    connectionId
    subjectId
    subjectType
  }
}
"#;

pub const SET_SUBJECT_PERMISSIONS: &str = r#"
mutation setSubjectPermissions($subjectId: ID!, $permissions: [ID!]!) {
  permissions: setSubjectPermissions(subjectId: $subjectId, permissions: $permissions) {
    id
  }
}
"#;

pub const GET_SESSION_STATE: &str = r#"
query getSessionState {
  sessionState {
    createTime
    lastAccessTime
    locale
    cacheExpired
    valid
    remainingTime
  }
}
"#;

pub const GET_PRODUCT_SETTINGS: &str = r#"
query getProductSettings {
  settings: productSettings {
    groups {
      id
      displayName
    }
    settings {
      key
      displayName
      groupId
      value
    }
  }
}
"#;

/// Append the fragments a document uses.
pub fn with_team_fields(document: &str) -> String {
  format!("{}{}", document, TEAM_FIELDS)
}
