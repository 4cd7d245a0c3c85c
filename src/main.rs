//! # PRISM CLI (`prism`)
//!
//! Thin binary around the [`prism`] engine.
//!
//! ## Usage
//!
//! ```bash
//! prism --config ./config/prism.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `prism init` | Create the SQLite database and apply the schema |
//! | `prism run` | Classify on the configured interval (and mirror, if enabled) until Ctrl-C |
//! | `prism once` | Run one classification batch and exit |
//! | `prism mirror` | Run one calendar mirror pass and exit |
//! | `prism status` | Show recent runs, open checkpoints and cache size |
//!
//! Credentials come from the environment: `NOTION_API_KEY`, plus
//! `OPENAI_API_KEY` when the LLM plugin is enabled and
//! `GOOGLE_CALENDAR_TOKEN` when the mirror is enabled.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use prism::config::{self, Credentials};
use prism::engine::Engine;
use prism::scheduler::TickOutcome;
use prism::{logging, migrate, status};
use prism_core::models::BatchState;

/// PRISM: classify knowledge-store inbox items and mirror due-dated tasks
/// to a calendar.
#[derive(Parser)]
#[command(name = "prism", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/prism.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Run the scheduler until interrupted.
    Run,

    /// Run one classification batch now.
    Once,

    /// Run one calendar mirror pass now.
    Mirror,

    /// Show recent runs and persisted state.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized at {}.", cfg.db.path.display());
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
        Commands::Run => {
            let credentials = Credentials::from_env(&cfg)?;
            let engine = Engine::from_config(&cfg, &credentials).await?;
            engine.start();
            tracing::info!(
                interval_secs = cfg.engine.interval_secs,
                mirror = engine.mirror_enabled(),
                "prism running; press Ctrl-C to stop"
            );
            tokio::signal::ctrl_c().await?;
            tracing::info!("shutting down; waiting for in-flight runs");
            engine.shutdown().await;
        }
        Commands::Once => {
            let credentials = Credentials::from_env(&cfg)?;
            let engine = Engine::from_config(&cfg, &credentials).await?;
            let outcome = engine.trigger_batch_now().await;
            engine.shutdown().await;
            report(outcome)?;
        }
        Commands::Mirror => {
            if !cfg.mirror.enabled {
                anyhow::bail!("mirror is disabled; set mirror.enabled = true in {}", cli.config.display());
            }
            let credentials = Credentials::from_env(&cfg)?;
            let engine = Engine::from_config(&cfg, &credentials).await?;
            let outcome = engine.trigger_mirror_now().await;
            engine.shutdown().await;
            match outcome {
                Some(outcome) => report(outcome)?,
                None => anyhow::bail!("mirror is not configured"),
            }
        }
    }

    Ok(())
}

fn report(outcome: TickOutcome) -> anyhow::Result<()> {
    match outcome {
        TickOutcome::Completed(run) => {
            println!("{}", status::summarize_run(&run));
            for failure in run.failures.iter().chain(&run.conflicts) {
                println!("  {}: {}", failure.source_id, failure.error);
            }
            if run.state == BatchState::Aborted {
                anyhow::bail!("run aborted");
            }
        }
        TickOutcome::Skipped => println!("A run is already in progress; nothing started."),
    }
    Ok(())
}
