//! Scout CLI - run queries through the in-process demo orchestrator.
//!
//! # Usage
//!
//! ```bash
//! # Ask a question
//! scout ask "who is live today"
//! scout ask "生成今日简报" --requester alice
//!
//! # Check data sources, then show worker, source and cache health
//! scout health
//!
//! # Prometheus text exposition after a warm-up briefing
//! scout metrics
//!
//! # Custom configuration, structured logs
//! scout --config scout.toml --json-logs ask "status"
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use scout::config::ScoutConfig;
use scout::orchestration::Query;
use scout::{demo, telemetry};

#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Scout - live stream query orchestrator", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true, env = "SCOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question
    Ask {
        /// Question text
        text: String,

        /// Who is asking
        #[arg(long)]
        requester: Option<String>,

        /// Conversation session id
        #[arg(long)]
        session: Option<String>,
    },

    /// Check every data source, then print the health report
    Health,

    /// Print Prometheus metrics after a warm-up briefing
    Metrics,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = telemetry::init_tracing(cli.verbose, cli.json_logs) {
        eprintln!("Warning: {e}");
    }

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ScoutConfig::load_from_path(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let mut config = ScoutConfig::default();
            config.merge_env_vars()?;
            config.validate()?;
            config
        }
    };

    let orchestrator = demo::build_orchestrator(&config)?;

    match cli.command {
        Commands::Ask {
            text,
            requester,
            session,
        } => {
            let mut query = Query::new(text);
            if let Some(requester) = requester {
                query = query.with_requester(requester);
            }
            if let Some(session) = session {
                query = query.with_session(session);
            }

            let response = orchestrator.handle(&query).await;
            print_json(&response)?;
            if !response.result.success {
                if let Some(error) = &response.result.error {
                    eprintln!("hint: {}", error.category.suggested_action());
                }
                process::exit(2);
            }
        }
        Commands::Health => {
            orchestrator.check_sources().await;
            print_json(&orchestrator.health_report())?;
        }
        Commands::Metrics => {
            orchestrator.handle(&Query::new("daily briefing")).await;
            print!("{}", orchestrator.metrics().encode()?);
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
