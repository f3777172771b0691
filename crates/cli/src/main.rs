//! Health Sync CLI
//!
//! A command-line tool for signing in to the collection service, running
//! syncs from exported health records and inspecting the offline queue.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{account, queue, sync};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_API_URL: &str = "http://localhost:8000";

/// Health Sync CLI
#[derive(Parser)]
#[command(name = "hcs")]
#[command(author, version, about = "CLI for the Health Sync engine", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via HCS_API_URL env var)
    #[arg(long, env = "HCS_API_URL")]
    pub api_url: Option<String>,

    /// Directory holding exported records, one <recordType>.json per type
    #[arg(long, env = "HCS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Sign in to the collection service
    Login {
        /// Account user name
        #[arg(long, short)]
        username: String,

        /// Account password (prompted for when omitted)
        #[arg(long, env = "HCS_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Push notification token registered with the session
        #[arg(long)]
        push_token: Option<String>,

        /// Remember the API URL for later commands
        #[arg(long)]
        save: bool,
    },

    /// Sign out and forget the stored session
    Logout,

    /// Check that the collection service is reachable
    Health,

    /// Sync exported records to the collection service
    Sync {
        /// Record types to sync, comma separated (all types if not specified)
        #[arg(long, value_delimiter = ',')]
        types: Vec<String>,

        /// How far back to read (e.g., 30m, 24h, 7d)
        #[arg(long)]
        since: Option<String>,
    },

    /// Inspect and drain the offline queue
    #[command(subcommand)]
    Queue(QueueCommands),
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Show queued items by priority and record type
    Stats,

    /// Deliver queued items now
    Flush {
        /// Maximum number of items to send
        #[arg(long)]
        batch: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let home = config::home_dir()?;
    let mut settings = config::Config::load(&home)?;
    let api_url = cli
        .api_url
        .clone()
        .or_else(|| settings.api_url.clone())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string());

    // Initialize client
    let client = client::SyncClient::new(&api_url, &home).await?;

    // Execute command
    let result = match cli.command {
        Commands::Login {
            username,
            password,
            push_token,
            save,
        } => account::login(&client, &username, password, push_token)
            .await
            .and_then(|()| {
                if save {
                    settings.api_url = Some(api_url.clone());
                    settings.save(&home)?;
                }
                Ok(())
            }),
        Commands::Logout => account::logout(&client).await,
        Commands::Health => account::health(&client, cli.format).await,
        Commands::Sync { types, since } => {
            let data_dir = cli
                .data_dir
                .or(settings.data_dir)
                .unwrap_or_else(|| PathBuf::from("."));
            sync::run_sync(&client, &data_dir, types, since, cli.verbose, cli.format).await
        }
        Commands::Queue(queue_cmd) => match queue_cmd {
            QueueCommands::Stats => queue::show_stats(&client, cli.format).await,
            QueueCommands::Flush { batch } => queue::flush(&client, batch, cli.format).await,
        },
    };

    if let Err(e) = &result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
