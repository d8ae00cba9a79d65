use crate::config::Config;
use crate::event::{Event, EventHandler};
use color_eyre::{eyre::eyre, Result};
use rescache::binding::{BindingState, ResourceBinding};
use rescache::cache::{Includes, Resource, ResourceKey};
use rescache::graphql::{GraphQlClient, HttpTransport};
use rescache::resources::{
  teams_with_permission, ServerSettingsResource, SessionResource, TeamInput, TeamsResource,
  INCLUDE_META_PARAMETERS,
};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What the watch command follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum WatchTarget {
  Teams,
  Settings,
}

/// Main application state
pub struct App {
  teams: TeamsResource,
  session: SessionResource,
  settings: ServerSettingsResource,
  purge: JoinHandle<()>,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let url = config.server_url()?;
    let token = Config::get_api_token();
    let transport = HttpTransport::new(url.clone(), token.as_deref(), config.timeout())?;
    let client = GraphQlClient::new(transport);
    info!(%url, "using GraphQL endpoint");

    let teams = TeamsResource::new(client.clone());
    let session = SessionResource::new(client.clone());
    let settings = ServerSettingsResource::new(client, &session);
    let purge = teams.spawn_purge(config.purge_interval(), config.cache_ttl());

    Ok(Self {
      teams,
      session,
      settings,
      purge,
    })
  }

  fn includes(meta: bool) -> Includes {
    if meta {
      Includes::new().with(INCLUDE_META_PARAMETERS)
    } else {
      Includes::new()
    }
  }

  pub async fn list_teams(&self, meta: bool, permission: Option<&str>) -> Result<()> {
    let key = match permission {
      // The alias resolves against the cache, so the full list comes first.
      Some(permission) => {
        self.teams.load(ResourceKey::all(), &Self::includes(meta)).await?;
        teams_with_permission(permission)
      }
      None => ResourceKey::all(),
    };
    self.teams.load(key.clone(), &Self::includes(meta)).await?;

    let mut teams = self.teams.get_many(&key);
    teams.sort_by(rescache::resources::compare_teams);
    print(&teams)
  }

  pub async fn get_team(&self, team_id: &str, meta: bool) -> Result<()> {
    let key = team_id.to_string();
    self.teams.load(key.clone(), &Self::includes(meta)).await?;
    let team = self
      .teams
      .get(&key)
      .ok_or_else(|| eyre!("Team not found: {}", team_id))?;
    print(&team)
  }

  pub async fn create_team(&self, input: TeamInput) -> Result<()> {
    let team = self.teams.create_team(input).await?;
    print(&team)
  }

  pub async fn update_team(&self, input: TeamInput) -> Result<()> {
    let team = self.teams.update_team(input).await?;
    print(&team)
  }

  pub async fn delete_teams(&self, team_ids: Vec<String>, force: bool) -> Result<()> {
    let deleted = self
      .teams
      .delete_teams(ResourceKey::list(team_ids), force)
      .await?;
    print(&deleted)
  }

  pub async fn team_users(&self, team_id: &str) -> Result<()> {
    let users = self.teams.load_granted_users(team_id).await?;
    print(&users)
  }

  pub async fn team_access(&self, team_id: &str) -> Result<()> {
    let grants = self.teams.subject_connection_access(team_id).await?;
    print(&grants)
  }

  pub async fn show_session(&self) -> Result<()> {
    self.session.load((), &Includes::new()).await?;
    let session = self
      .session
      .data()
      .ok_or_else(|| eyre!("Session state is not available"))?;
    print(&session)
  }

  pub async fn show_settings(&self, key: Option<&str>) -> Result<()> {
    self.settings.load((), &Includes::new()).await?;
    match key {
      Some(key) => {
        let value = self
          .settings
          .setting(key)
          .ok_or_else(|| eyre!("Setting not found: {}", key))?;
        print(&value)
      }
      None => print(&self.settings.data()),
    }
  }

  /// Follow a resource through a binding until interrupted, printing every
  /// change. The session is refreshed every `session_every` ticks so synced
  /// settings reload.
  pub async fn watch(&self, target: WatchTarget, tick: Duration, session_every: u32) -> Result<()> {
    let mut events = EventHandler::new(tick);
    let mut teams = ResourceBinding::new(self.teams.cache().clone(), Some(ResourceKey::all()));
    let mut settings = ResourceBinding::new(self.settings.cache().clone(), Some(ResourceKey::Single(())));
    teams.set_options(rescache::binding::BindingOptions {
      active: target == WatchTarget::Teams,
      ..Default::default()
    });
    settings.set_options(rescache::binding::BindingOptions {
      active: target == WatchTarget::Settings,
      ..Default::default()
    });

    let mut ticks: u32 = 0;
    while let Some(event) = events.next().await {
      match event {
        Event::Interrupt => break,
        Event::Tick => {
          ticks = ticks.wrapping_add(1);
          if session_every > 0 && ticks % session_every == 0 {
            debug!("refreshing session");
            let session = self.session.clone();
            tokio::spawn(async move {
              if let Err(e) = session.refresh((), &Includes::new()).await {
                warn!(error = %e, "session refresh failed");
              }
            });
          }

          let changed = match target {
            WatchTarget::Teams => teams.poll(),
            WatchTarget::Settings => settings.poll(),
          };
          if !changed {
            continue;
          }
          match target {
            WatchTarget::Teams => report(teams.state())?,
            WatchTarget::Settings => report(settings.state())?,
          }
        }
      }
    }
    Ok(())
  }
}

impl Drop for App {
  fn drop(&mut self) {
    self.purge.abort();
  }
}

fn report<T: Serialize>(state: BindingState<T>) -> Result<()> {
  match state {
    BindingState::Idle => Ok(()),
    BindingState::Loading => {
      eprintln!("loading...");
      Ok(())
    }
    BindingState::Loaded(data) => print(&data),
    BindingState::Failed(e) => {
      eprintln!("error: {} (press ctrl-c to stop)", e);
      Ok(())
    }
  }
}

fn print<T: Serialize + ?Sized>(value: &T) -> Result<()> {
  let yaml = serde_yaml::to_string(value)?;
  println!("{}", yaml.trim_end());
  Ok(())
}
