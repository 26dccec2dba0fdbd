//! CLI entry and dispatch.

use anyhow::{Context, Result};
use ap_core::{config, logging};
use clap::Parser;

mod commands;

#[derive(Parser)]
#[command(name = "ap")]
#[command(version)]
#[command(about = "AP chat client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Log in to the backend with the master password
    Login {
        /// Backend base URL (overrides config)
        #[arg(long, value_name = "URL")]
        base_url: Option<String>,

        /// Device name reported to the backend
        #[arg(long)]
        device_name: Option<String>,

        /// Master password (read from stdin when not set)
        #[arg(long, env = "AP_MASTER_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Log out and forget the stored device token
    Logout,

    /// Show the logged-in user
    Whoami,

    /// List chats, syncing new ones from the backend
    Chats {
        /// Only show the local cache
        #[arg(long)]
        offline: bool,
    },

    /// Print the transcript of a chat
    Show {
        /// The ID of the chat to show
        #[arg(value_name = "CHAT_ID")]
        id: String,

        /// Show plan tasks and tool arguments and results
        #[arg(long)]
        expand: bool,
    },

    /// Send a message and print the reply
    Ask {
        /// The message to send
        message: String,

        /// Continue an existing chat
        #[arg(long, value_name = "CHAT_ID")]
        chat: Option<String>,

        /// Override the agent key from config
        #[arg(long, value_name = "KEY")]
        agent: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
    /// Print the effective configuration
    Show,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = config::Config::load().context("load config")?;
    let _log_guard = logging::init(&config.log);

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;
    rt.block_on(async move { dispatch(cli, config).await })
}

async fn dispatch(cli: Cli, mut config: config::Config) -> Result<()> {
    match cli.command {
        Commands::Login {
            base_url,
            device_name,
            password,
        } => {
            if let Some(url) = base_url {
                config.base_url = Some(url);
            }
            if let Some(name) = device_name {
                config.device_name = name;
            }
            commands::auth::login(&config, password).await
        }
        Commands::Logout => commands::auth::logout(&config).await,
        Commands::Whoami => commands::auth::whoami(&config).await,
        Commands::Chats { offline } => commands::chats::list(&config, offline).await,
        Commands::Show { id, expand } => commands::chats::show(&config, &id, expand).await,
        Commands::Ask {
            message,
            chat,
            agent,
        } => {
            if let Some(agent) = agent {
                config.agent_key = agent;
            }
            commands::ask::run(&config, &message, chat.as_deref()).await
        }
        Commands::Config { command } => match command {
            ConfigCommands::Path => {
                commands::config::path();
                Ok(())
            }
            ConfigCommands::Init => commands::config::init(),
            ConfigCommands::Show => commands::config::show(&config),
        },
    }
}
