//! Background maintenance cycle for the mesh database.
//!
//! Each pass prunes telemetry, position and message rows older than the
//! retention period, refreshes planner statistics, VACUUMs when the file has
//! grown past the configured threshold and truncates the WAL.
//!
//! The cycle runs on its own OS thread so a long VACUUM never stalls the
//! async runtime. `stop()` raises the shutdown flag, wakes the thread and
//! waits (bounded by `join_timeout_seconds`) for it to exit.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, error, info, warn};
use rusqlite::params;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{checkpoint, lock, to_millis, StorageError, Store};
use crate::config::MaintenanceConfig;

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub telemetry_deleted: usize,
    pub positions_deleted: usize,
    pub messages_deleted: usize,
    pub size_before_bytes: u64,
    pub size_after_bytes: u64,
    pub vacuumed: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceStatus {
    pub running: bool,
    pub passes: u64,
    pub failures: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_report: Option<MaintenanceReport>,
}

/// Rows deleted per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneCounts {
    pub telemetry: usize,
    pub positions: usize,
    pub messages: usize,
}

impl Store {
    /// Delete append-only rows older than `cutoff` in one transaction.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<PruneCounts, StorageError> {
        let cutoff = to_millis(cutoff);
        self.with_write(|tx| {
            Ok(PruneCounts {
                telemetry: tx
                    .execute("DELETE FROM telemetry WHERE timestamp < ?1", params![cutoff])?,
                positions: tx
                    .execute("DELETE FROM positions WHERE timestamp < ?1", params![cutoff])?,
                messages: tx.execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])?,
            })
        })
    }

    /// ANALYZE plus `PRAGMA optimize`, VACUUM when larger than
    /// `vacuum_threshold_bytes`, then a WAL checkpoint. Returns whether a
    /// VACUUM ran.
    pub fn optimize(&self, vacuum_threshold_bytes: u64) -> Result<bool, StorageError> {
        let size = self.database_size_bytes()?;
        self.with_writer(|conn| {
            conn.execute_batch("ANALYZE; PRAGMA optimize;")?;
            let vacuum = size > vacuum_threshold_bytes;
            if vacuum {
                info!(
                    "Database is {} MB (threshold {} MB), running VACUUM",
                    size / (1024 * 1024),
                    vacuum_threshold_bytes / (1024 * 1024)
                );
                conn.execute_batch("VACUUM;")?;
            }
            checkpoint(conn)?;
            Ok(vacuum)
        })
    }
}

/// Run a single maintenance pass now.
pub fn run_once(
    store: &Store,
    config: &MaintenanceConfig,
) -> Result<MaintenanceReport, StorageError> {
    let started = Instant::now();
    let cutoff = Utc::now() - ChronoDuration::days(i64::from(config.retention_days));
    let size_before_bytes = store.database_size_bytes()?;
    let pruned = store.prune_older_than(cutoff)?;
    let vacuumed = store.optimize(config.vacuum_threshold_mb.saturating_mul(1024 * 1024))?;
    let size_after_bytes = store.database_size_bytes()?;
    let report = MaintenanceReport {
        telemetry_deleted: pruned.telemetry,
        positions_deleted: pruned.positions,
        messages_deleted: pruned.messages,
        size_before_bytes,
        size_after_bytes,
        vacuumed,
        duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
    };
    info!(
        "Maintenance pass: pruned {} telemetry, {} positions, {} messages older than {} days; {} -> {} bytes{} in {} ms",
        report.telemetry_deleted,
        report.positions_deleted,
        report.messages_deleted,
        config.retention_days,
        report.size_before_bytes,
        report.size_after_bytes,
        if report.vacuumed { " (vacuumed)" } else { "" },
        report.duration_ms
    );
    Ok(report)
}

/// Owns the maintenance thread.
pub struct MaintenanceScheduler {
    config: MaintenanceConfig,
    store: Store,
    shutdown: Arc<AtomicBool>,
    status: Arc<Mutex<MaintenanceStatus>>,
    stop_tx: Option<mpsc::Sender<()>>,
    done_rx: Option<mpsc::Receiver<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MaintenanceScheduler {
    pub fn new(store: Store, config: MaintenanceConfig) -> Self {
        Self {
            config,
            store,
            shutdown: Arc::new(AtomicBool::new(false)),
            status: Arc::new(Mutex::new(MaintenanceStatus::default())),
            stop_tx: None,
            done_rx: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn status(&self) -> MaintenanceStatus {
        lock(&self.status).clone()
    }

    /// Spawn the cycle thread. A no-op when disabled or already running.
    pub fn start(&mut self) -> std::io::Result<()> {
        if !self.config.enabled {
            info!("Maintenance scheduler disabled by configuration");
            return Ok(());
        }
        if self.handle.is_some() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();
        let interval = Duration::from_secs(self.config.interval_seconds.max(1));
        let store = self.store.clone();
        let config = self.config.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let status = Arc::clone(&self.status);
        shutdown.store(false, Ordering::SeqCst);
        lock(&status).running = true;

        let handle = std::thread::Builder::new()
            .name("db-maintenance".to_string())
            .spawn(move || {
                info!("Maintenance cycle started (every {:?})", interval);
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }
                    if shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    // A failed pass is logged and the cycle carries on.
                    let result = run_once(&store, &config);
                    let mut st = lock(&status);
                    st.passes += 1;
                    st.last_run = Some(Utc::now());
                    match result {
                        Ok(report) => {
                            st.last_error = None;
                            st.last_report = Some(report);
                        }
                        Err(StorageError::Closed) => {
                            debug!("Store closed, maintenance cycle exiting");
                            break;
                        }
                        Err(e) => {
                            st.failures += 1;
                            st.last_error = Some(e.to_string());
                            error!("Maintenance pass failed: {}", e);
                        }
                    }
                }
                lock(&status).running = false;
                info!("Maintenance cycle stopped");
                let _ = done_tx.send(());
            })?;

        self.stop_tx = Some(stop_tx);
        self.done_rx = Some(done_rx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Signal the cycle to stop and wait for the thread to exit, at most
    /// `join_timeout_seconds`. Returns `false` if the wait timed out; the
    /// thread is then left detached.
    pub fn stop(&mut self) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let timeout = Duration::from_secs(self.config.join_timeout_seconds);
        let exited = match self.done_rx.take() {
            Some(rx) => !matches!(rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)),
            None => true,
        };
        if exited {
            if handle.join().is_err() {
                warn!("Maintenance thread panicked");
            }
            true
        } else {
            warn!(
                "Maintenance thread did not stop within {:?}; detaching",
                timeout
            );
            false
        }
    }
}

impl Drop for MaintenanceScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
