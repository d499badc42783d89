//! Facility rollup - hourly sensor aggregation service
//!
//! Replays device digests from a JSONL file through the ingest workers,
//! seals elapsed hours, and writes sealed rollups plus facility reports.
//!
//! Module structure:
//! - `domain/` - Core types (events, digests, rollups, tallies, errors)
//! - `io/` - External interfaces (digest files, rollup store, egress, Prometheus)
//! - `services/` - Business logic (normalizer, builders, engine, tally, combiner)
//! - `infra/` - Infrastructure (Config, Metrics, Registry)

use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use clap::Parser;
use facility_rollup::domain::rollup::HourRollup;
use facility_rollup::infra::{Config, FacilityRegistry, Metrics};
use facility_rollup::io::{load_digests, MemoryRollupStore, RollupEgress};
use facility_rollup::services::{FacilityCombiner, IngestPool, IngestProgress, RollupEngine, TallyTracker};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Facility rollup - hourly aggregation of Look/Move sensor digests
#[derive(Parser, Debug)]
#[command(name = "facility-rollup", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Digest file to replay (overrides [ingest].input_file)
    #[arg(short, long)]
    input: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// How often elapsed hours are sealed, in seconds
    #[arg(long, default_value_t = 5)]
    finalize_interval_secs: u64,
}

/// Everything needed to publish sealed hours
struct Publisher {
    engine: Arc<RollupEngine>,
    combiner: FacilityCombiner,
    registry: Arc<FacilityRegistry>,
    egress: RollupEgress,
}

impl Publisher {
    /// Seal hours elapsed as of `now`, write them and their facility reports
    async fn finalize(&self, now: DateTime<Utc>) -> usize {
        let sealed = match self.engine.finalize_elapsed(now).await {
            Ok(sealed) => sealed,
            Err(e) => {
                error!(error = %e, "finalize_failed");
                return 0;
            }
        };
        self.egress.write_rollups(&sealed);

        for (facility_id, hour) in self.touched_facilities(&sealed) {
            match self.combiner.combine_facility(&facility_id, hour).await {
                Ok(report) => {
                    self.egress.write_report(&report);
                }
                Err(e) => error!(facility = %facility_id, hour_start = %hour, error = %e, "facility_combine_failed"),
            }
        }
        sealed.len()
    }

    fn touched_facilities(&self, sealed: &[HourRollup]) -> BTreeSet<(String, DateTime<Utc>)> {
        sealed
            .iter()
            .filter_map(|r| {
                let key = r.key();
                self.registry.device(&key.device_id).map(|d| (d.facility_id.clone(), key.hour_start))
            })
            .collect()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize structured logging with configurable level via RUST_LOG env var
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(UtcTime::rfc_3339())
            .with_target(false)
            .init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), git_hash = env!("GIT_HASH"), "facility_rollup_starting");

    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };
    let settings = config.rollup_settings()?;
    let input_file = args.input.clone().unwrap_or_else(|| config.input_file().to_string());
    info!(
        config_file = %config.config_file(),
        site = %config.site_id(),
        bucket_count = %config.bucket_count(),
        grace_period_secs = %config.grace_period_secs(),
        workers = %config.ingest_workers(),
        input_file = %input_file,
        egress_file = %config.egress_file(),
        facilities = %config.facilities().len(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let registry = Arc::new(FacilityRegistry::from_config(&config));
    if registry.is_empty() {
        warn!("no_devices_registered");
    } else {
        info!(facilities = ?registry.facility_ids(), "registry_loaded");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let metrics = Arc::new(Metrics::new());
    let store = Arc::new(MemoryRollupStore::new());
    let tally = Arc::new(TallyTracker::new(config.tally_windows()));
    let grace = TimeDelta::seconds(config.grace_period_secs() as i64);
    let engine = Arc::new(
        RollupEngine::new(store.clone(), registry.clone(), settings, metrics.clone())
            .with_retry_policy(config.retry_policy())
            .with_grace_period(grace),
    );
    let publisher = Arc::new(Publisher {
        engine: engine.clone(),
        combiner: FacilityCombiner::new(store.clone(), registry.clone(), config.bucket_count()),
        registry: registry.clone(),
        egress: RollupEgress::new(config.egress_file()),
    });

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_tally = tally.clone();
        let prom_site = config.site_id().to_string();
        let prom_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = facility_rollup::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_tally,
                prom_site,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Event-time progress of the workers; hours are sealed and tallies refreshed against it
    let progress = Arc::new(IngestProgress::new());

    // Start metrics reporter
    let reporter_metrics = metrics.clone();
    let reporter_tally = tally.clone();
    let reporter_progress = progress.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            if let Some(now) = reporter_progress.watermark() {
                reporter_tally.refresh(now);
            }
            reporter_metrics.report(reporter_tally.device_count()).log();
        }
    });

    let finalizer_publisher = publisher.clone();
    let finalizer_progress = progress.clone();
    let mut finalizer_shutdown = shutdown_rx.clone();
    let finalize_every = Duration::from_secs(args.finalize_interval_secs.max(1));
    let finalizer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(finalize_every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(now) = finalizer_progress.watermark() {
                        finalizer_publisher.finalize(now).await;
                    }
                }
                _ = finalizer_shutdown.changed() => {
                    if *finalizer_shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    });

    // Handle shutdown on Ctrl+C
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = signal_tx.send(true);
    });

    let pool = IngestPool::start(
        engine.clone(),
        tally.clone(),
        metrics.clone(),
        progress.clone(),
        config.ingest_workers(),
        config.ingest_queue_capacity(),
        config.digest_retry_limit(),
    );

    let (digests, skipped) = load_digests(&input_file)?;
    let total = digests.len();
    let mut submitted = 0usize;
    for digest in digests {
        if *shutdown_rx.borrow() {
            warn!(submitted, total, "replay_interrupted");
            break;
        }
        pool.submit(digest).await?;
        submitted += 1;
    }
    info!(submitted, skipped, "replay_submitted");

    // Drain queued digests before the final flush
    pool.shutdown().await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = finalizer.await {
        error!(error = %e, "finalizer_join_failed");
    }

    let flush_at = progress.watermark().map_or_else(Utc::now, |m| m.max(Utc::now()));
    let sealed = publisher.finalize(flush_at).await;
    let summary = metrics.report(tally.device_count());
    summary.log();
    info!(
        sealed,
        stored = store.len(),
        digests_failed = summary.digests_failed,
        "facility_rollup_shutdown_complete"
    );
    Ok(())
}
