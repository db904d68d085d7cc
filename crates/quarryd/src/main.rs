//! quarryd: the Quarry daemon and operator CLI.
//!
//! Assembles the state store, the allocation engine and the session reaper
//! from a `quarry.toml`, and offers a few one-shot commands for loading
//! inventory and inspecting placement decisions.
//!
//! # Usage
//!
//! ```text
//! quarryd run --config quarry.toml
//! quarryd load --config quarry.toml --file fixtures/small-cloud.json
//! quarryd candidates --config quarry.toml --query 'resources=VCPU:2,MEMORY_MB:2048'
//! quarryd usage --config quarry.toml --project proj-web
//! ```

mod fixture;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use quarry_core::QuarryConfig;
use quarry_placement::{AllocationRequest, Engine, SelectionContext, UsageScope};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::fixture::Fixture;

#[derive(Parser)]
#[command(name = "quarryd", about = "Quarry resource allocation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Open the store and run the session reaper until Ctrl-C.
    Run {
        /// Path to quarry.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Apply a JSON inventory fixture.
    Load {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Fixture file.
        #[arg(long)]
        file: PathBuf,
    },
    /// Print ranked allocation candidates for a Placement-style query.
    Candidates {
        #[arg(long)]
        config: Option<PathBuf>,

        /// e.g. `resources=VCPU:2&required=HW_CPU_X86_AVX2&limit=5`
        #[arg(long)]
        query: String,
    },
    /// Print committed usage for a provider or a project.
    Usage {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, conflicts_with = "project")]
        provider: Option<String>,

        #[arg(long)]
        project: Option<String>,

        /// Narrow project usage to one user.
        #[arg(long, requires = "project")]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,quarryd=debug,quarry=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => run(load_config(config.as_deref())?).await,
        Command::Load { config, file } => {
            let config = load_config(config.as_deref())?;
            if config.store.path.is_none() {
                warn!("no store.path configured; the fixture is loaded into memory and discarded");
            }
            let engine = Engine::from_config(&config)?;
            let report = Fixture::from_file(&file)?.apply(&engine)?;
            println!(
                "loaded {} providers and {} consumers",
                report.providers, report.consumers
            );
            Ok(())
        }
        Command::Candidates { config, query } => {
            let config = load_config(config.as_deref())?;
            let engine = Engine::from_config(&config)?;
            let (request, limit) = AllocationRequest::parse_query(&query)?;
            let ranked = engine.select_candidates(
                &request,
                limit.unwrap_or(config.search.max_limit),
                &SelectionContext::default(),
            )?;
            println!("{}", serde_json::to_string_pretty(&ranked)?);
            Ok(())
        }
        Command::Usage {
            config,
            provider,
            project,
            user,
        } => {
            let config = load_config(config.as_deref())?;
            let engine = Engine::from_config(&config)?;
            let scope = match (provider, project) {
                (Some(provider_id), _) => UsageScope::Provider { provider_id },
                (None, Some(project_id)) => UsageScope::Project {
                    project_id,
                    user_id: user,
                },
                (None, None) => anyhow::bail!("either --provider or --project is required"),
            };
            let summary = engine.compute_usage(&scope)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<QuarryConfig> {
    match path {
        Some(path) => QuarryConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => {
            let config = QuarryConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}

async fn run(config: QuarryConfig) -> anyhow::Result<()> {
    info!("Quarry daemon starting");

    if let Some(parent) = config.store.path.as_deref().and_then(Path::parent)
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let engine = Engine::from_config(&config)?;
    match &config.store.path {
        Some(path) => info!(path = ?path, "state store opened"),
        None => warn!("no store.path configured; running with an in-memory store"),
    }

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Background tasks ───────────────────────────────────────

    let reaper = engine.reaper(config.sessions.reaper_interval()?);
    let reaper_handle = tokio::spawn(async move {
        reaper.run(shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = reaper_handle.await;
    info!("Quarry daemon stopped");
    Ok(())
}
