#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::missing_errors_doc, clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use chatrelay::config::Config;
use chatrelay::{gateway, history};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Streams agent sessions to a web UI and recovers past conversations.
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(version)]
#[command(about = "Streamed agent sessions and conversation history over HTTP.", long_about = None)]
struct Cli {
    /// Verbose logging (same as CHATRELAY_DEBUG=1)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Interface to bind (default from config: 127.0.0.1)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (default from config: 8080)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the claude executable
        #[arg(long)]
        claude_path: Option<PathBuf>,
    },

    /// Print the grouped conversation list for a project directory
    History {
        /// Absolute project path, as the agent saw it
        project_path: String,
    },

    /// Print the encoded directory name for a project path
    Encode {
        project_path: String,
    },
}

fn debug_from_env() -> bool {
    std::env::var("CHATRELAY_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn init_logging(debug: bool) {
    let default = if debug { "chatrelay=debug" } else { "chatrelay=info" };
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_writer(std::io::stderr)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Warning: failed to install log subscriber: {e}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug || debug_from_env());

    match cli.command {
        // Pure string work; no config file is created for it.
        Commands::Encode { project_path } => {
            println!("{}", history::encode_project_path(&project_path));
            Ok(())
        }

        Commands::Serve {
            host,
            port,
            claude_path,
        } => {
            let mut config = Config::load_or_init()?;
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            if claude_path.is_some() {
                config.agent.cli_path = claude_path;
            }
            info!(
                "Starting chatrelay on {}:{}",
                config.gateway.host, config.gateway.port
            );
            gateway::run_gateway(config).await
        }

        Commands::History { project_path } => {
            let config = Config::load_or_init()?;
            let projects_dir = config.history.resolved_projects_dir()?;
            let encoded = history::encode_project_path(&project_path);
            let preview_chars = config.history.preview_chars;
            let summaries = tokio::task::spawn_blocking(move || {
                history::list_conversations(&projects_dir, &encoded, preview_chars)
            })
            .await
            .context("history task failed")??;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(())
        }
    }
}
