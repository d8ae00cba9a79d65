mod app;
mod config;
mod event;
mod logging;

use app::{App, WatchTarget};
use clap::{Parser, Subcommand};
use color_eyre::Result;
use rescache::resources::TeamInput;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "rescache")]
#[command(about = "Cached access to a database manager's GraphQL API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rescache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// GraphQL endpoint, overrides the config file
  #[arg(short, long)]
  url: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Manage teams
  #[command(subcommand)]
  Teams(TeamsCommand),
  /// Show the session state
  Session,
  /// Show product settings, or one setting
  Settings { key: Option<String> },
  /// Follow a resource and print it whenever it changes
  Watch {
    #[arg(value_enum)]
    target: WatchTarget,
    /// Poll interval in milliseconds
    #[arg(long, default_value_t = 250)]
    tick_ms: u64,
    /// Refresh the session every N ticks (0 disables)
    #[arg(long, default_value_t = 0)]
    session_every: u32,
  },
}

#[derive(Subcommand, Debug)]
enum TeamsCommand {
  /// List teams
  List {
    /// Include meta parameters
    #[arg(long)]
    meta: bool,
    /// Only teams holding this permission
    #[arg(long)]
    permission: Option<String>,
  },
  /// Show one team
  Get {
    id: String,
    #[arg(long)]
    meta: bool,
  },
  /// Create a team
  Create(TeamArgs),
  /// Update a team's name, description and permissions
  Update(TeamArgs),
  /// Delete teams
  Delete {
    #[arg(required = true)]
    ids: Vec<String>,
    #[arg(long)]
    force: bool,
  },
  /// List users granted a team
  Users { id: String },
  /// List connections granted a team
  Access { id: String },
}

#[derive(clap::Args, Debug)]
struct TeamArgs {
  id: String,
  #[arg(long)]
  name: Option<String>,
  #[arg(long)]
  description: Option<String>,
  /// Permission to grant; repeat for several
  #[arg(long = "permission")]
  permissions: Vec<String>,
}

impl From<TeamArgs> for TeamInput {
  fn from(args: TeamArgs) -> Self {
    TeamInput {
      team_id: args.id,
      team_name: args.name,
      description: args.description,
      team_permissions: args.permissions,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override endpoint if specified on command line
  if let Some(url) = args.url {
    config.server.url = url;
  }

  let _guard = logging::init(&config.log)?;

  let app = App::new(&config)?;
  match args.command {
    Command::Teams(command) => match command {
      TeamsCommand::List { meta, permission } => app.list_teams(meta, permission.as_deref()).await?,
      TeamsCommand::Get { id, meta } => app.get_team(&id, meta).await?,
      TeamsCommand::Create(team) => app.create_team(team.into()).await?,
      TeamsCommand::Update(team) => app.update_team(team.into()).await?,
      TeamsCommand::Delete { ids, force } => app.delete_teams(ids, force).await?,
      TeamsCommand::Users { id } => app.team_users(&id).await?,
      TeamsCommand::Access { id } => app.team_access(&id).await?,
    },
    Command::Session => app.show_session().await?,
    Command::Settings { key } => app.show_settings(key.as_deref()).await?,
    Command::Watch {
      target,
      tick_ms,
      session_every,
    } => {
      app
        .watch(target, Duration::from_millis(tick_ms.max(10)), session_every)
        .await?
    }
  }

  Ok(())
}
