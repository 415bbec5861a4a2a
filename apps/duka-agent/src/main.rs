//! # Duka Device Agent
//!
//! Headless runner for the offline sale engine.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  duka-agent                                                             │
//! │                                                                         │
//! │  duka_device.db ──► LocalSaleLedger ◄── QuotaGovernor                   │
//! │                          │                                              │
//! │                     SyncScheduler ◄── ConnectivityMonitor ◄── probe     │
//! │                          │                                    (5s)      │
//! │                          ▼                                              │
//! │  duka_remote.db ──► SqliteRemoteLedger                                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use directories::ProjectDirs;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use duka_core::{RemoteSale, SaleRecord};
use duka_db::{Database, DbConfig};
use duka_sync::{
    CommitReceipt, ConnectivityMonitor, EngineConfig, HookResult, LocalSaleLedger, QuotaGovernor,
    ReversalReport, SaleEventHooks, SchedulerOptions, SqliteLedgerStore, SqliteRemoteLedger,
    SyncScheduler,
};

const PROBE_INTERVAL: Duration = Duration::from_secs(5);
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = EngineConfig::load_or_default(None);
    info!(
        device_id = %config.device_id(),
        device_name = %config.device.name,
        sync_enabled = config.sync.enabled,
        "Starting Duka device agent"
    );

    let local_path = resolve_db_path(&config.storage.local_db_path)?;
    let remote_path = resolve_db_path(&config.storage.remote_db_path)?;

    let local_db = Database::new(DbConfig::new(&local_path))
        .await
        .with_context(|| format!("opening device database at {}", local_path.display()))?;
    let remote_db = Database::new(DbConfig::new(&remote_path))
        .await
        .with_context(|| format!("opening remote ledger at {}", remote_path.display()))?;

    let store = Arc::new(SqliteLedgerStore::new(
        &local_db,
        Some(config.ledger.storage_budget_bytes),
    ));
    let governor = Arc::new(QuotaGovernor::from_config(&config));
    let ledger = Arc::new(LocalSaleLedger::init(store, governor).await?);

    let summary = ledger.summary().await;
    info!(
        pending = summary.pending,
        failed = summary.failed,
        synced = summary.synced,
        "Device ledger ready"
    );

    let remote = Arc::new(SqliteRemoteLedger::new(remote_db));
    let connectivity = ConnectivityMonitor::new(remote.is_reachable().await);
    let probe = {
        let remote = remote.clone();
        connectivity.spawn_probe(PROBE_INTERVAL, move || {
            let remote = remote.clone();
            async move { remote.is_reachable().await }
        })
    };

    let scheduler = Arc::new(
        SyncScheduler::new(
            ledger.clone(),
            remote,
            connectivity,
            SchedulerOptions::from_config(&config),
        )
        .with_hooks(Arc::new(LogHooks)),
    );
    scheduler.start().await?;

    let mut status_ticker = tokio::time::interval(STATUS_INTERVAL);
    status_ticker.tick().await;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                let status = scheduler.status().await;
                info!(
                    online = status.online,
                    pending = status.pending_count,
                    in_flight = status.in_flight,
                    last_error = status.last_error.as_deref().unwrap_or("-"),
                    "Sync status"
                );
            }
            _ = &mut shutdown => break,
        }
    }

    // One last drain so sales captured just before shutdown get a chance
    if let Err(e) = scheduler.sync_all_pending().await {
        warn!(error = %e, "Final sync pass failed");
    }
    scheduler.shutdown().await;
    probe.abort();
    local_db.close().await;

    info!(pending = ledger.pending_count().await, "Duka device agent stopped");
    Ok(())
}

/// Logs commit and reversal events.
struct LogHooks;

#[async_trait]
impl SaleEventHooks for LogHooks {
    async fn on_sale_committed(&self, record: &SaleRecord, receipt: &CommitReceipt) -> HookResult {
        info!(
            sale_id = %record.id,
            sale_number = %record.payload.sale_number,
            total = %record.payload.total,
            %receipt,
            "Receipt ready"
        );
        Ok(())
    }

    async fn on_sale_reversed(&self, sale: &RemoteSale, report: &ReversalReport) -> HookResult {
        info!(
            sale_id = %sale.id,
            variants = report.variants_restored,
            degraded = report.is_degraded(),
            "Reversal recorded"
        );
        Ok(())
    }
}

/// Initializes the tracing subscriber.
///
/// `RUST_LOG` overrides the default filter.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,duka=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Relative database paths live in the platform data directory.
///
/// - **macOS**: `~/Library/Application Support/com.duka.pos/`
/// - **Windows**: `%APPDATA%\duka\pos\data\`
/// - **Linux**: `~/.local/share/pos/`
fn resolve_db_path(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }

    let dirs = ProjectDirs::from("com", "duka", "pos")
        .context("could not determine the app data directory")?;
    let data_dir = dirs.data_dir();
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    Ok(data_dir.join(path))
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
