//! CLI entry and dispatch.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use concord_core::config;
use concord_core::core::permissions::PermissionPolicy;
use concord_core::core::session::EngineKind;
use concord_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "concord")]
#[command(version)]
#[command(about = "Drive Claude Code, ACP agents and Codex from one session registry")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Project directory the engines run in (default: current directory)
    #[arg(long, default_value = ".")]
    project: String,

    #[command(flatten)]
    chat: ChatArgs,
}

/// Options for interactive chat.
#[derive(clap::Args, Debug, Clone, Default)]
struct ChatArgs {
    /// Engine for a new session (claude, acp, codex)
    #[arg(short, long)]
    engine: Option<EngineKind>,

    /// Model for a new session
    #[arg(short, long)]
    model: Option<String>,

    /// Mode for a new session (engine specific, e.g. plan)
    #[arg(long)]
    mode: Option<String>,

    /// Open a saved session instead of creating one
    #[arg(long, value_name = "ID")]
    session: Option<String>,

    /// Permission policy (ask, auto-accept-once, allow-everything)
    #[arg(long, env = "CONCORD_PERMISSION_POLICY")]
    policy: Option<PermissionPolicy>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Start an interactive session (the default)
    Chat,
    /// Manage saved sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum SessionCommands {
    /// Lists saved sessions, most recent first
    List {
        /// Only sessions of the --project directory
        #[arg(long)]
        here: bool,
    },
    /// Shows a session transcript
    Show {
        /// The ID of the session to show
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },
    /// Deletes a saved session
    Delete {
        /// The ID of the session to delete
        #[arg(value_name = "SESSION_ID")]
        id: String,
    },
    /// Renames a session
    Rename {
        /// The ID of the session to rename
        #[arg(value_name = "SESSION_ID")]
        id: String,
        /// New title for the session
        #[arg(value_name = "TITLE")]
        title: String,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        project,
        chat,
    } = cli;

    let config = config::Config::load().context("load config")?;
    let _log_guard = match logging::init(&config) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    // default to chat mode
    let command = command.unwrap_or(Commands::Chat);
    match command {
        Commands::Chat => {
            let project = project_id(&project)?;
            commands::chat::run(
                commands::chat::ChatOptions {
                    project,
                    engine: chat.engine,
                    model: chat.model,
                    mode: chat.mode,
                    session: chat.session,
                    policy: chat.policy,
                },
                config,
            )
            .await
        }
        Commands::Sessions { command } => match command {
            SessionCommands::List { here } => {
                let project = here.then(|| project_id(&project)).transpose()?;
                commands::sessions::list(project.as_deref())
            }
            SessionCommands::Show { id } => commands::sessions::show(&id),
            SessionCommands::Delete { id } => commands::sessions::delete(&id),
            SessionCommands::Rename { id, title } => commands::sessions::rename(&id, &title),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
        },
    }
}

/// Canonical project directory used as the project id.
fn project_id(dir: &str) -> Result<String> {
    let path = Path::new(dir)
        .canonicalize()
        .with_context(|| format!("resolve project directory '{dir}'"))?;
    Ok(path.to_string_lossy().into_owned())
}
