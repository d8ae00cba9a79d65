//! Server-backed resources built on the cache.

mod session;
mod settings;
mod teams;

pub use session::{SessionInfo, SessionResource};
pub use settings::{ServerSettings, ServerSettingsResource};
pub use teams::{
  compare_teams, teams_with_permission, ConnectionGrant, TeamInfo, TeamInput, TeamsResource, UserTeamGrant,
  INCLUDE_META_PARAMETERS,
};
