//! Rollup Runtime - example scheduler driving the rollup engine
//!
//! Polls the raw epoch table and, whenever a new epoch shows up:
//! - rolls epochs into hour buckets and the 1h window
//! - rolls hours into UTC-day buckets and the 24h window
//! - drops hourly partitions older than the retention horizon
//! - writes a JSON status snapshot
//!
//! Usage:
//!   cargo run --release --bin rollup_runtime
//!
//! Environment variables: see `RollupConfig::from_env`.

use dotenv::dotenv;
use epochflow::{DashboardRollup, RollupConfig, RollupError};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::interval;

/// One scheduler tick. Returns the epoch the pass aggregated up to.
fn run_pass(
    rollup: &DashboardRollup,
    config: &RollupConfig,
    last_seen: Option<u64>,
) -> Result<Option<u64>, RollupError> {
    let current = match rollup.latest_exported_epoch()? {
        Some(epoch) if Some(epoch) != last_seen => epoch,
        _ => return Ok(None),
    };

    let hours = rollup.aggregate_hour(current)?;
    if let Some(lag) = hours.behind_by {
        warn!("⏳ Hour rollup {} epochs behind, day rollup deferred", lag);
        return Ok(None);
    }

    let tail_gaps = rollup.missing_rolling_24h_tail_epochs(current)?;
    if !tail_gaps.is_empty() {
        warn!("⚠️  24h window tail is missing raw epochs {:?}", tail_gaps);
    }
    rollup.aggregate_day(current)?;

    let horizon = current.saturating_sub(config.hour_retention_epochs);
    rollup.clear_old_hour_aggregations(horizon)?;

    Ok(Some(current))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize environment and logging
    dotenv().ok();
    env_logger::init();

    info!("🚀 Rollup Runtime");

    let config = RollupConfig::from_env()?;
    info!("   ├─ Database: {}", config.db_path.display());
    info!(
        "   ├─ Clock: {} s/epoch, {} epochs/hour bucket, genesis offset {}",
        config.chain.seconds_per_epoch,
        config.chain.hour_width(),
        config.chain.genesis_offset()
    );
    info!(
        "   ├─ Partitions: {} hours / {} days",
        config.hour_partition_width, config.day_partition_width
    );
    info!("   ├─ Hour retention: {} epochs", config.hour_retention_epochs);
    info!("   └─ Poll interval: {}ms", config.poll_interval_ms);

    let rollup = Arc::new(DashboardRollup::open(&config)?);
    info!("✅ Rollup engine ready");
    info!("🔄 Press CTRL+C to shutdown gracefully");

    let config = Arc::new(config);
    let mut timer = interval(config.poll_interval());
    let mut last_seen: Option<u64> = None;

    loop {
        tokio::select! {
            _ = timer.tick() => {}
            signal = tokio::signal::ctrl_c() => {
                if let Err(err) = signal {
                    error!("❌ Failed to listen for CTRL+C: {}", err);
                }
                info!("⚠️  Received CTRL+C, shutting down...");
                break;
            }
        }

        let pass_rollup = rollup.clone();
        let pass_config = config.clone();
        let result = tokio::task::spawn_blocking(move || {
            let result = run_pass(&pass_rollup, &pass_config, last_seen);
            let status = pass_rollup.status();
            (result, status)
        })
        .await;

        match result {
            Ok((Ok(Some(epoch)), status)) => {
                last_seen = Some(epoch);
                match status {
                    Ok(status) => {
                        if let Err(e) = status.save(&config.status_path) {
                            warn!("Failed to write status snapshot: {}", e);
                        }
                    }
                    Err(e) => warn!("Failed to read rollup status: {}", e),
                }
            }
            Ok((Ok(None), _)) => {}
            Ok((Err(e), _)) => {
                error!("❌ Rollup pass failed (retrying next tick): {}", e);
            }
            Err(e) => {
                error!("❌ Rollup pass panicked: {}", e);
            }
        }
    }

    info!("✅ Rollup runtime stopped");
    Ok(())
}
