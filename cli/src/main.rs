//! tilefeed CLI: historic backfill plus the live WebSocket feed.
//!
//! # Commands
//! ```text
//! tilefeed run       [--config tilefeed.yaml] [--skip-backfill]
//! tilefeed backfill  [--to <block>] [--reset] [--json]
//! tilefeed status    [--json]
//! tilefeed info
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use tilefeed_core::{CheckpointStore, EntityStore, EventKindTable, StatsSource};
use tilefeed_indexer::{BackfillBuilder, BackfillEvent, BackfillSummary};
use tilefeed_rpc::{BlockScanner, HttpRpcClient, LedgerClient, StarknetLedger};
use tilefeed_storage::{MemoryStore, SqliteStore};
use tilefeed_stream::{serve, AppState, Hub, StatsPublisher};

mod config;
mod logging;

use config::{FeedConfig, StoreBackend, ENV_DATABASE_URL, ENV_LISTEN_ADDR, ENV_RPC_URL};

#[derive(Parser)]
#[command(
    name = "tilefeed",
    about = "Ledger event ingestion and live tile feed",
    long_about = "
tilefeed backfills game events from a Starknet-style ledger into a store,
then streams pending events and aggregate stats to WebSocket subscribers.

ENVIRONMENT VARIABLES:
  TILEFEED_RPC_URL        Ledger JSON-RPC endpoint
  TILEFEED_DATABASE_URL   SQLite path or sqlite: URL
  TILEFEED_LISTEN_ADDR    WebSocket listen address (default 0.0.0.0:7171)
  RUST_LOG                Log filter, overrides the config file
",
    version
)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill to the ledger head, then serve the live feed
    Run {
        /// Start serving without backfilling first
        #[arg(long)]
        skip_backfill: bool,
    },

    /// Backfill to the ledger head (or --to) and exit
    Backfill {
        /// Last block to process
        #[arg(long)]
        to: Option<u64>,
        /// Delete the checkpoint first and start from the genesis block
        #[arg(long)]
        reset: bool,
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the checkpoint and a stats snapshot
    Status {
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration and the event-kind table
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut cfg = FeedConfig::load(cli.config.as_deref())?;
    if cli.verbose {
        cfg.log.level = "debug".into();
    }
    logging::init_tracing(&cfg.log);

    if let Commands::Info = cli.command {
        return cmd_info(&cfg);
    }

    // Failing to open the store is fatal.
    match cfg.store.backend {
        StoreBackend::Memory => dispatch(cli.command, cfg, Arc::new(MemoryStore::new())).await,
        StoreBackend::Sqlite => {
            let store = SqliteStore::open(&cfg.store.database_url)
                .await
                .with_context(|| format!("cannot open store '{}'", cfg.store.database_url))?;
            dispatch(cli.command, cfg, Arc::new(store)).await
        }
    }
}

async fn dispatch<S>(command: Commands, cfg: FeedConfig, store: Arc<S>) -> Result<()>
where
    S: EntityStore + CheckpointStore + StatsSource + 'static,
{
    match command {
        Commands::Run { skip_backfill } => cmd_run(cfg, store, skip_backfill).await,
        Commands::Backfill { to, reset, json } => cmd_backfill(cfg, store, to, reset, json).await,
        Commands::Status { json } => cmd_status(cfg, store, json).await,
        Commands::Info => cmd_info(&cfg),
    }
}

// ─── Command implementations ─────────────────────────────────────────────────

async fn cmd_run<S>(cfg: FeedConfig, store: Arc<S>, skip_backfill: bool) -> Result<()>
where
    S: EntityStore + CheckpointStore + StatsSource + 'static,
{
    let table = Arc::new(cfg.event_table()?);
    let ledger = connect_ledger(&cfg)?;
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address '{}'", cfg.listen_addr))?;

    if !skip_backfill {
        let builder = BackfillBuilder::from_config(cfg.indexer.clone());
        match backfill(builder, ledger.clone(), store.clone(), table.clone()).await? {
            Some(summary) => info!(
                blocks = summary.blocks,
                events = summary.events,
                checkpoint = ?summary.to_block,
                "backfill complete, switching to live mode"
            ),
            None => return Ok(()),
        }
    }

    let scanner = BlockScanner::new(ledger, cfg.stream.chunk_size);
    let hub = Arc::new(Hub::new(cfg.stream.clone()).with_source(scanner, table));
    let stats = Arc::new(StatsPublisher::new(store, cfg.stats.clone()));
    let stats_task = tokio::spawn(stats.clone().run());

    let result = serve(addr, AppState { hub, stats }, shutdown_signal()).await;
    stats_task.abort();
    result?;
    info!("shutdown complete");
    Ok(())
}

async fn cmd_backfill<S>(
    cfg: FeedConfig,
    store: Arc<S>,
    to: Option<u64>,
    reset: bool,
    as_json: bool,
) -> Result<()>
where
    S: EntityStore + CheckpointStore + 'static,
{
    let table = Arc::new(cfg.event_table()?);
    let ledger = connect_ledger(&cfg)?;

    if reset {
        store.delete(&cfg.indexer.checkpoint_key).await?;
        warn!(key = %cfg.indexer.checkpoint_key, "checkpoint deleted");
    }

    let mut builder = BackfillBuilder::from_config(cfg.indexer.clone());
    if let Some(to) = to {
        builder = builder.to_block(to);
    }

    let Some(summary) = backfill(builder, ledger, store, table).await? else {
        return Ok(());
    };
    if as_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Backfill finished");
        println!("  from block : {}", summary.from_block);
        match summary.to_block {
            Some(b) => println!("  checkpoint : {b}"),
            None => println!("  checkpoint : (nothing new)"),
        }
        println!("  blocks     : {}", summary.blocks);
        println!("  events     : {}", summary.events);
        println!("  retries    : {}", summary.retries);
    }
    Ok(())
}

async fn cmd_status<S>(cfg: FeedConfig, store: Arc<S>, as_json: bool) -> Result<()>
where
    S: EntityStore + CheckpointStore + StatsSource + 'static,
{
    let checkpoint = store.load(&cfg.indexer.checkpoint_key).await?;
    let snapshot = store.snapshot(cfg.stats.top_n).await?;
    let audit = store.audit_count().await?;

    if as_json {
        let out = serde_json::json!({
            "checkpoint": checkpoint.as_ref().map(|c| c.block_number),
            "audit_records": audit,
            "stats": snapshot,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    match &checkpoint {
        Some(cp) => println!("Checkpoint   : block {} ({})", cp.block_number, cp.key),
        None => println!("Checkpoint   : none (starts at block {})", cfg.indexer.genesis_block),
    }
    println!("Audit records: {audit}");
    println!("Owners       : {}", snapshot.total_owners);
    println!("Agents       : {} alive, {} dead", snapshot.alive_agents, snapshot.dead_agents);
    println!(
        "Claims       : {} empty, {} hazard, {} reward",
        snapshot.claims.empty, snapshot.claims.hazard, snapshot.claims.reward
    );
    if !snapshot.leaderboard.is_empty() {
        println!("Leaderboard:");
        for (rank, entry) in snapshot.leaderboard.iter().enumerate() {
            println!("  {:>3}. {:<66} {}", rank + 1, entry.owner, entry.score);
        }
    }
    Ok(())
}

fn cmd_info(cfg: &FeedConfig) -> Result<()> {
    let table = cfg.event_table()?;
    println!("tilefeed {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Ledger RPC   : {}", cfg.rpc.url);
    if let Some(contract) = &cfg.rpc.contract_address {
        println!("Contract     : {contract}");
    }
    println!("Store        : {:?} ({})", cfg.store.backend, cfg.store.database_url);
    println!("Listen       : {}", cfg.listen_addr);
    println!("Genesis block: {}", cfg.indexer.genesis_block);
    println!("Event kinds  : {} selectors", table.len());
    println!();
    println!("Environment overrides: {ENV_RPC_URL}, {ENV_DATABASE_URL}, {ENV_LISTEN_ADDR}");
    Ok(())
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn connect_ledger(cfg: &FeedConfig) -> Result<Arc<dyn LedgerClient>> {
    let transport = HttpRpcClient::new(cfg.rpc.url.clone(), cfg.rpc.http.clone())
        .with_context(|| format!("cannot create RPC client for '{}'", cfg.rpc.url))?;
    Ok(Arc::new(StarknetLedger::new(transport, cfg.rpc.contract_address.clone())))
}

/// Run a backfill, logging its progress. Returns `None` if interrupted.
async fn backfill<S>(
    builder: BackfillBuilder,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<S>,
    table: Arc<EventKindTable>,
) -> Result<Option<BackfillSummary>>
where
    S: EntityStore + CheckpointStore + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut job = builder.build(ledger, store, table).with_events(tx);

    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                BackfillEvent::Progress { block, head, events } => {
                    info!(block, head, events, "block applied")
                }
                BackfillEvent::Retrying { block, error } => {
                    warn!(block, %error, "block will be retried")
                }
                BackfillEvent::Complete { at_block } => info!(at_block, "caught up"),
            }
        }
    });

    let outcome = tokio::select! {
        summary = job.run() => Some(summary?),
        _ = tokio::signal::ctrl_c() => None,
    };
    if outcome.is_none() {
        warn!(state = %job.state(), "interrupted during backfill");
    }
    drop(job);
    let _ = progress.await;
    Ok(outcome)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => {
            warn!(error = %e, "cannot listen for Ctrl-C, running until killed");
            std::future::pending::<()>().await;
        }
    }
}
