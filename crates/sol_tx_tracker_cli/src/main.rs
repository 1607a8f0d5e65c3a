//! sol-tx-tracker CLI: run, sync, stats, signatures, reset.

use clap::{Parser, Subcommand};
use sol_tx_tracker::chain::SignaturePage;
use sol_tx_tracker::ingest::SyncSettings;
use sol_tx_tracker::store::read_dataset;
use sol_tx_tracker::{
    parse_time_bound, Dataset, DatasetStore, ResponseCache, RpcClient, RpcError, SyncService,
    TrackerConfig,
};
use std::path::PathBuf;
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

type CliResult = Result<(), Box<dyn std::error::Error>>;

fn main() -> CliResult {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();
    let cli = Cli::parse();
    let config = TrackerConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Run => run_service(config),
        Command::Sync => run_sync(config),
        Command::Stats(args) => run_stats(config, args),
        Command::Signatures(args) => run_signatures(config, args),
        Command::Reset => run_reset(config),
    }
}

#[derive(Parser)]
#[command(name = "sol-tx-tracker")]
#[command(author = "gorusys <goru.connector@outlook.com>")]
#[command(about = "Incremental Solana transaction ingestion into a local dataset")]
struct Cli {
    /// Settings file (default: $SOL_TX_TRACKER_CONFIG or ./config/explorer_settings.json).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll the chain and merge new blocks until Ctrl-C.
    Run,
    /// Run a single fetch cycle and exit.
    Sync,
    /// Summarize the local dataset.
    Stats(StatsArgs),
    /// List recent signatures for an address.
    Signatures(SignaturesArgs),
    /// Drop all records and rewind the cursor.
    Reset,
}

#[derive(Parser)]
struct StatsArgs {
    /// Lower block-time bound (unix seconds or RFC 3339).
    #[arg(long)]
    from: Option<String>,
    /// Upper block-time bound (unix seconds or RFC 3339).
    #[arg(long)]
    to: Option<String>,
    /// Also print per-batch counts over buckets of this many slots.
    #[arg(long)]
    batch_size: Option<u64>,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
struct SignaturesArgs {
    #[arg(long)]
    address: String,
    #[arg(long, default_value_t = 20)]
    limit: usize,
    #[arg(long)]
    before: Option<String>,
}

fn client(config: &TrackerConfig) -> Result<RpcClient, Box<dyn std::error::Error>> {
    let cache = match &config.cache_path {
        Some(path) => Some(ResponseCache::open(path)?),
        None => None,
    };
    Ok(RpcClient::new(config.rpc_config(), cache)?)
}

/// Whether the dataset must be started from the chain tip on the first cycle.
fn needs_tip_start(config: &TrackerConfig) -> bool {
    config.start_slot.is_none() && !matches!(read_dataset(&config.dataset_path), Ok(Some(_)))
}

fn open_service(
    config: &TrackerConfig,
) -> Result<(SyncService<RpcClient>, watch::Sender<bool>), Box<dyn std::error::Error>> {
    let (stop_tx, stop_rx) = watch::channel(false);
    let client = client(config)?.with_stop(stop_rx.clone());
    let defer = needs_tip_start(config);
    let store = Arc::new(DatasetStore::load(
        &config.dataset_path,
        config.start_slot.unwrap_or(0),
    )?);
    let mut service = SyncService::new(client, store, SyncSettings::from_config(config), stop_rx);
    if defer {
        service = service.with_deferred_start(config.backfill_slots());
    }
    Ok((service, stop_tx))
}

fn run_service(config: TrackerConfig) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    let (service, stop) = open_service(&config)?;
    let store = service.store();
    rt.block_on(async move {
        let handle = tokio::spawn(service.run());
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, stopping after the current slot"),
            Err(e) => warn!(error = %e, "cannot listen for Ctrl-C, stopping"),
        }
        let _ = stop.send(true);
        handle.await
    })?;
    let snap = store.snapshot();
    info!(records = snap.len(), cursor = snap.cursor(), "shutdown complete");
    Ok(())
}

fn run_sync(config: TrackerConfig) -> CliResult {
    let rt = tokio::runtime::Runtime::new()?;
    let (service, _stop) = open_service(&config)?;
    if let Some(report) = rt.block_on(service.run_once())? {
        println!(
            "cursor {} -> {}: {} added, {} duplicates, {} slots skipped",
            report.merge.previous_cursor,
            report.merge.cursor,
            report.merge.added,
            report.merge.duplicates,
            report.stats.skipped_not_found
        );
        if let Some(slot) = report.stats.aborted_at {
            println!("cycle ended early at slot {slot}; it will be retried next run");
        }
    }
    info!(requests = service.source().request_count(), "sync complete");
    Ok(())
}

fn fmt_time(t: Option<i64>) -> String {
    t.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| "-".to_string())
}

fn run_stats(config: TrackerConfig, args: StatsArgs) -> CliResult {
    let dataset = read_dataset(&config.dataset_path)?.unwrap_or_else(|| Dataset::empty(0));
    let from = args.from.as_deref().map(parse_time_bound).transpose()?;
    let to = args.to.as_deref().map(parse_time_bound).transpose()?;
    let dataset = if from.is_some() || to.is_some() {
        let rows = dataset.in_time_range(from, to).into_iter().cloned().collect();
        Dataset::from_records(dataset.cursor(), rows)
    } else {
        dataset
    };
    let stats = dataset.stats();
    let batches = match args.batch_size {
        Some(n) => dataset.batch_summaries(n)?,
        None => Vec::new(),
    };

    if args.json {
        let out = serde_json::json!({ "stats": stats, "batches": batches });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    println!("cursor:  {}", stats.cursor);
    println!(
        "records: {} ({} success, {} failed)",
        stats.total, stats.by_status.success, stats.by_status.failed
    );
    if let (Some(first), Some(last)) = (stats.first_slot, stats.last_slot) {
        println!("slots:   {first}..={last}");
    }
    for (tx_type, n) in &stats.by_type {
        println!("  {tx_type:<16} {n}");
    }
    for b in &batches {
        println!(
            "batch {:>10}  max_slot {:>10}  from {}  total {:>5}  ok {:>5}  failed {:>5}",
            b.batch,
            b.max_slot,
            fmt_time(b.min_block_time),
            b.total,
            b.by_status.success,
            b.by_status.failed
        );
    }
    Ok(())
}

fn run_signatures(config: TrackerConfig, args: SignaturesArgs) -> CliResult {
    let client = client(&config)?;
    let rt = tokio::runtime::Runtime::new()?;
    let page = SignaturePage {
        before: args.before,
        until: None,
        limit: Some(args.limit),
    };
    let sigs = rt.block_on(client.fetch_signatures_for_address(&args.address, &page))?;
    for s in &sigs {
        let status = if s.err.as_ref().is_some_and(|e| !e.is_null()) {
            "failed"
        } else {
            "success"
        };
        println!("{}  {:>10}  {}  {}", s.signature, s.slot, fmt_time(s.block_time), status);
    }
    info!(count = sigs.len(), "signatures listed");
    Ok(())
}

fn run_reset(config: TrackerConfig) -> CliResult {
    let client = client(&config)?;
    let rt = tokio::runtime::Runtime::new()?;
    // Reset ignores any existing dataset, so resolve the start as for a fresh one.
    let start = match config.start_slot {
        Some(slot) => slot,
        None => match rt.block_on(client.latest_slot()) {
            Ok(latest) => config.start_cursor(latest),
            Err(RpcError::OfflineMiss) => 0,
            Err(e) => return Err(e.into()),
        },
    };
    let store = DatasetStore::load(&config.dataset_path, start)?;
    store.reset(start)?;
    println!("dataset reset, cursor {start}");
    Ok(())
}
