//! # wormscan-mono
//!
//! The `wormscan` binary: loads a JSON source configuration, opens the RocksDB
//! store and drives one [`PollEngine`] per configured source under a shared
//! [`Scheduler`]. Sources replay raw events from local JSONL files through
//! [`replay::ReplayAdapter`], so the polling, cursor, gap and backfill
//! machinery can run end to end without chain RPC access.
//!
//! ## Commands
//!
//! - `run`: poll every source until Ctrl-C (a second Ctrl-C forces exit) or
//!   until every bounded source finishes
//! - `gaps --chain-id N [--backfill]`: list missing sequences, optionally
//!   re-fetch them from the chain's replay file
//! - `cursor show|rewind`: inspect persisted cursors or delete one

pub mod config;
pub mod publisher;
pub mod replay;


use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use wormscan_rocksdb::RocksStore;
use wormscan_sync::{
    AttributeMapper, BackfillReport, Backfiller, CorrelationStage, Cursor, CursorStore,
    GapDetector, GapScan, Mapper, MetricsExporter, PacketCorrelator, Passthrough, PollEngine,
    RunExit, Scheduler, SourceAdapter, SourceAdapterExt,
};

use crate::config::{AppConfig, ReplaySourceConfig};
use crate::publisher::LogPublisher;
use crate::replay::{ReplayAdapter, ReplayLookup};

/// Command-line arguments for `wormscan`.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "WORMSCAN_CONFIG")]
    pub config: PathBuf,
    #[arg(long, env = "WORMSCAN_DB_PATH")]
    pub db_path: PathBuf,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Poll configured sources
    Run {
        /// Only run these sources (repeatable); all sources when omitted
        #[arg(long)]
        source_id: Vec<String>,
    },
    /// Detect missing sequences for a chain
    Gaps {
        #[arg(long)]
        chain_id: u16,
        /// Re-fetch missing messages from the chain's first configured source
        #[arg(long)]
        backfill: bool,
    },
    /// Inspect or rewind cursors
    Cursor {
        #[command(subcommand)]
        action: CursorAction,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum CursorAction {
    Show {
        #[arg(long)]
        source_id: Option<String>,
    },
    /// Delete a cursor so the source starts over from its configured start
    Rewind {
        #[arg(long)]
        source_id: String,
    },
}

pub type Engine = PollEngine<dyn SourceAdapter, RocksStore, RocksStore>;

/// First Ctrl-C cancels the returned token; a second one, or 30 seconds
/// without finishing, exits the process.
pub fn setup_signal_handler() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let requested = Arc::new(AtomicBool::new(false));

    tokio::spawn(async move {
        loop {
            match signal::ctrl_c().await {
                Ok(()) => {
                    if requested.load(Ordering::SeqCst) {
                        eprintln!("\nForce exit requested, terminating immediately");
                        std::process::exit(1);
                    }
                    eprintln!("\nShutdown signal received, finishing in-flight ticks");
                    eprintln!("Press Ctrl-C again to force exit");
                    requested.store(true, Ordering::SeqCst);
                    token.cancel();

                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        eprintln!("\nGraceful shutdown timeout, forcing exit");
                        std::process::exit(1);
                    });
                }
                Err(err) => {
                    eprintln!("Error setting up signal handler: {}", err);
                    break;
                }
            }
        }
    });

    shutdown
}

/// Replay adapter wrapped in the quirk layers its entry asks for, with every
/// call bounded by the source's timeout.
pub fn build_adapter(entry: &ReplaySourceConfig) -> Arc<dyn SourceAdapter> {
    let replay = ReplayAdapter::new(&entry.replay_file);
    let timeout = Duration::from_millis(entry.source.call_timeout_ms);
    match (entry.page_size, entry.confirmations) {
        (None, 0) => Arc::new(replay.with_timeout(timeout)),
        (None, depth) => Arc::new(replay.lagged(depth).with_timeout(timeout)),
        (Some(page), 0) => Arc::new(replay.paginated(page).with_timeout(timeout)),
        (Some(page), depth) => Arc::new(replay.paginated(page).lagged(depth).with_timeout(timeout)),
    }
}

fn build_mapper(entry: &ReplaySourceConfig) -> Arc<dyn Mapper> {
    let mut mapper = AttributeMapper::new(entry.source.chain_id);
    if let (Some(emitter), Some(sequence)) = (&entry.emitter_attribute, &entry.sequence_attribute) {
        mapper = mapper.with_keys(emitter.clone(), sequence.clone());
    }
    Arc::new(mapper)
}

fn build_correlation(entry: &ReplaySourceConfig) -> Arc<dyn CorrelationStage> {
    match (&entry.counterpart_file, entry.source.kind.needs_correlation()) {
        (Some(path), true) => Arc::new(PacketCorrelator::new(
            ReplayLookup::new(path),
            Duration::from_millis(entry.source.call_timeout_ms),
        )),
        (None, true) => {
            warn!(
                "[{}] {} source without counterpart_file, events pass through uncorrelated",
                entry.source.source_id,
                entry.source.kind.as_str()
            );
            Arc::new(Passthrough)
        }
        (_, false) => Arc::new(Passthrough),
    }
}

pub fn build_engine(entry: &ReplaySourceConfig, store: &RocksStore) -> Engine {
    PollEngine::new(
        entry.source.clone(),
        build_adapter(entry),
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    )
    .with_correlation(build_correlation(entry))
    .with_mapper(build_mapper(entry))
    .with_publisher(Arc::new(LogPublisher))
    .with_metrics(Arc::new(MetricsExporter))
}

/// Run the selected sources until each finishes or `cancel` fires.
pub async fn run_sources(
    config: &AppConfig,
    store: &RocksStore,
    only: &[String],
    cancel: CancellationToken,
) -> Result<Vec<(String, RunExit)>> {
    for id in only {
        if config.source(id).is_none() {
            return Err(anyhow!("unknown source_id {}", id));
        }
    }

    let mut scheduler = Scheduler::new(cancel);
    for entry in &config.sources {
        if !only.is_empty() && !only.contains(&entry.source.source_id) {
            continue;
        }
        scheduler.spawn(Arc::new(build_engine(entry, store)));
    }
    if scheduler.is_empty() {
        warn!("no sources configured");
    }
    Ok(scheduler.join().await)
}

/// Detect gaps on one chain and, if asked, backfill them from the chain's
/// first configured source.
pub async fn find_gaps(
    config: &AppConfig,
    store: &RocksStore,
    chain_id: u16,
    backfill: bool,
) -> Result<(GapScan, Option<BackfillReport>)> {
    let scan = GapDetector::scan(store, chain_id).await?;
    if !backfill || scan.gaps.is_empty() {
        return Ok((scan, None));
    }

    let entry = config
        .sources_for_chain(chain_id)
        .next()
        .ok_or_else(|| anyhow!("no configured source for chain {}", chain_id))?;
    let report = Backfiller::new(&entry.source, build_adapter(entry), Arc::new(store.clone()))
        .with_correlation(build_correlation(entry))
        .with_mapper(build_mapper(entry))
        .with_publisher(Arc::new(LogPublisher))
        .close(scan.gaps.clone())
        .await?;
    Ok((scan, Some(report)))
}

pub async fn show_cursors(store: &RocksStore, source_id: Option<&str>) -> Result<Vec<Cursor>> {
    match source_id {
        Some(id) => Ok(store.get(id).await?.into_iter().collect()),
        None => Ok(store.cursors()?),
    }
}

pub async fn rewind_cursor(config: &AppConfig, store: &RocksStore, source_id: &str) -> Result<()> {
    if config.source(source_id).is_none() {
        warn!("rewinding cursor of unconfigured source {}", source_id);
    }
    store.delete(source_id).await?;
    info!("cursor for {} deleted", source_id);
    Ok(())
}

pub async fn run(args: Args, cancel: CancellationToken) -> Result<()> {
    let config = AppConfig::load(&args.config)?;
    let store = RocksStore::open(&args.db_path)?;

    match args.command {
        Command::Run { source_id } => {
            info!("starting {} sources", config.sources.len());
            for (id, exit) in run_sources(&config, &store, &source_id, cancel).await? {
                info!("{}: {:?}", id, exit);
            }
        }
        Command::Gaps { chain_id, backfill } => {
            let (scan, report) = find_gaps(&config, &store, chain_id, backfill).await?;
            println!(
                "chain {}: {} missing sequences in {} spans across {} emitters ({} undecodable keys)",
                chain_id,
                scan.missing(),
                scan.spans.len(),
                scan.emitters,
                scan.skipped
            );
            for span in &scan.spans {
                println!(
                    "{} sequences {}..={} in {}",
                    span.emitter, span.first_missing, span.last_missing, span.bounding_range
                );
            }
            if scan.truncated > 0 {
                println!(
                    "{} sequences beyond the per-emitter limit not listed, scan again after backfill",
                    scan.truncated
                );
            }
            if let Some(report) = report {
                println!(
                    "recovered {}, permanent {}",
                    report.recovered.len(),
                    report.permanent.len()
                );
                for gap in report.permanent {
                    println!("{}", gap.into_permanent_error());
                }
            }
        }
        Command::Cursor { action } => match action {
            CursorAction::Show { source_id } => {
                for cursor in show_cursors(&store, source_id.as_deref()).await? {
                    println!("{}", serde_json::to_string(&cursor)?);
                }
            }
            CursorAction::Rewind { source_id } => {
                rewind_cursor(&config, &store, &source_id).await?;
            }
        },
    }
    Ok(())
}
