use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use catsync_core::{SyncMode, SyncOutcome};
use catsync_source::{open_from_config, search_terms, SourceConfig, SourceHandles};
use catsync_store::{CatalogStore, RestCatalogStore, RestStoreConfig};
use catsync_sync::{
    classify, plan_purge, Extractor, Reconciler, Scheduler, SyncConfig, SyncOrchestrator,
};
use catsync_web::AppState;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "catsync")]
#[command(about = "Catalog sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync and print the run summary as JSON.
    Sync {
        #[arg(long)]
        mode: Option<SyncMode>,
    },
    /// Show what a purge would delete without writing anything.
    Plan,
    /// Search the upstream catalog.
    Search {
        query: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Start the HTTP server and the periodic scheduler.
    Serve {
        #[arg(long, env = "CATSYNC_WEB_PORT", default_value_t = 5000)]
        port: u16,
    },
}

struct Wiring {
    config: SyncConfig,
    source: SourceHandles,
    store: Arc<dyn CatalogStore>,
}

impl Wiring {
    fn from_env() -> Result<Self> {
        let source = open_from_config(&SourceConfig::from_env()).context("opening catalog source")?;
        let store = RestCatalogStore::new(RestStoreConfig::from_env()?)
            .context("building downstream client")?;
        Ok(Self {
            config: SyncConfig::from_env(),
            source,
            store: Arc::new(store),
        })
    }

    fn orchestrator(&self) -> Arc<SyncOrchestrator> {
        Arc::new(SyncOrchestrator::new(
            self.config.clone(),
            self.source.source.clone(),
            self.store.clone(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { mode: None }) {
        Commands::Sync { mode } => {
            let wiring = Wiring::from_env()?;
            let mode = mode.unwrap_or_else(|| wiring.config.default_mode());
            let run = wiring.orchestrator().run_sync(mode).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if run.outcome == SyncOutcome::Failed {
                bail!(
                    "sync run {} failed: {}",
                    run.run_id,
                    run.abort_reason.unwrap_or_default()
                );
            }
        }
        Commands::Plan => {
            let wiring = Wiring::from_env()?;
            let records = Extractor::new(wiring.source.source.clone())
                .fetch()
                .await
                .context("extracting catalog")?;
            let existing = Reconciler::new(wiring.store.clone())
                .current_downstream_keys()
                .await
                .context("reading downstream keys")?;
            let fresh = records
                .iter()
                .map(|r| r.code.clone())
                .collect::<BTreeSet<_>>();
            let plan = plan_purge(&existing, &fresh, wiring.config.purge_max_diff_percent);
            let report = json!({
                "fetched": records.len(),
                "downstream": existing.len(),
                "classification": classify(&existing, &records),
                "purge_enabled": wiring.config.purge_enabled,
                "plan": plan,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Search { query, limit } => {
            let source = open_from_config(&SourceConfig::from_env())
                .context("opening catalog source")?;
            let terms = search_terms(&query);
            if terms.is_empty() {
                bail!("search query is empty");
            }
            let hits = source.search.search(&terms, limit.max(1)).await?;
            println!("{}", serde_json::to_string_pretty(&hits)?);
        }
        Commands::Serve { port } => {
            let wiring = Wiring::from_env()?;
            let orchestrator = wiring.orchestrator();

            let scheduler = if wiring.config.scheduler_enabled {
                let scheduler = Scheduler::new(
                    orchestrator.clone(),
                    wiring.config.sync_interval(),
                    wiring.config.default_mode(),
                );
                Some(scheduler.start().await?)
            } else {
                info!("scheduler disabled, syncs run on demand only");
                None
            };

            let state = AppState::new(orchestrator, wiring.source.search.clone());
            tokio::select! {
                served = catsync_web::serve(state, port) => served?,
                _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            }

            if let Some(handle) = scheduler {
                handle.shutdown().await?;
            }
        }
    }

    Ok(())
}
