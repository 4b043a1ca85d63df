//! Automatic checkpoint triggering.
//!
//! A background thread fires a checkpoint when any of three independent
//! triggers is met: elapsed time since the last checkpoint, WAL size, or
//! committed transactions since the last checkpoint. Overlapping triggers
//! coalesce into one checkpoint. The thread is cooperatively cancelable
//! and finishes any in-flight checkpoint before exiting.

use crate::checkpoint;
use crate::error::WalError;
use crate::truncate::{self, TruncateConfig};
use crate::wal::WalWriter;
use crate::Lsn;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub enabled: bool,
    /// Time-based trigger.
    pub interval: Duration,
    /// Size-based trigger; 0 disables it.
    pub max_wal_size: u64,
    /// Commit-count trigger; 0 disables it.
    pub max_transactions: u64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
            max_wal_size: 10 * 1024 * 1024,
            max_transactions: 1000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointDaemonStats {
    pub total_checkpoints: u64,
    pub time_triggers: u64,
    pub size_triggers: u64,
    pub txn_triggers: u64,
    pub manual_triggers: u64,
    pub failed_checkpoints: u64,
    pub last_checkpoint_lsn: Lsn,
    pub last_duration: Duration,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Time,
    Size,
    Txns,
    Manual,
}

struct DaemonShared {
    wal: Arc<WalWriter>,
    truncate: Option<TruncateConfig>,
    stats: Mutex<CheckpointDaemonStats>,
    last_checkpoint_at: Mutex<Instant>,
    /// End LSN when the last checkpoint ran; the size trigger refires
    /// only once new records exist.
    end_at_last_checkpoint: AtomicU64,
}

impl DaemonShared {
    fn run_checkpoint(&self, trigger: Trigger) -> Result<Lsn, WalError> {
        let started = Instant::now();
        let result = checkpoint::write_checkpoint(&self.wal);

        let mut stats = self.stats.lock().unwrap();
        match result {
            Ok(end_lsn) => {
                stats.total_checkpoints += 1;
                match trigger {
                    Trigger::Time => stats.time_triggers += 1,
                    Trigger::Size => stats.size_triggers += 1,
                    Trigger::Txns => stats.txn_triggers += 1,
                    Trigger::Manual => stats.manual_triggers += 1,
                }
                stats.last_checkpoint_lsn = end_lsn;
                stats.last_duration = started.elapsed();
                drop(stats);

                *self.last_checkpoint_at.lock().unwrap() = Instant::now();
                self.end_at_last_checkpoint
                    .store(self.wal.end_lsn(), Ordering::Relaxed);

                if let Some(config) = &self.truncate {
                    if let Err(e) = self.truncate_after(config) {
                        tracing::warn!(error = %e, "post-checkpoint truncation failed");
                    }
                }
                Ok(end_lsn)
            }
            Err(e) => {
                stats.failed_checkpoints += 1;
                tracing::warn!(error = %e, "checkpoint failed");
                Err(e)
            }
        }
    }

    fn truncate_after(&self, config: &TruncateConfig) -> Result<u64, WalError> {
        let Some(snapshot) = checkpoint::load_snapshot(self.wal.path())? else {
            return Ok(0);
        };
        truncate::truncate_wal(&self.wal, &snapshot, config)
    }
}

/// Owns the daemon thread. Dropping the daemon stops it.
pub struct CheckpointDaemon {
    shared: Arc<DaemonShared>,
    config: CheckpointConfig,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl CheckpointDaemon {
    pub fn new(
        wal: Arc<WalWriter>,
        config: CheckpointConfig,
        truncate: Option<TruncateConfig>,
    ) -> Self {
        let end = wal.end_lsn();
        Self {
            shared: Arc::new(DaemonShared {
                wal,
                truncate,
                stats: Mutex::new(CheckpointDaemonStats::default()),
                last_checkpoint_at: Mutex::new(Instant::now()),
                end_at_last_checkpoint: AtomicU64::new(end),
            }),
            config,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Starts the background thread. A disabled config makes this a
    /// no-op; manual checkpoints still work.
    pub fn start(&mut self) {
        if !self.config.enabled || self.handle.is_some() {
            return;
        }
        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            max_wal_size = self.config.max_wal_size,
            max_transactions = self.config.max_transactions,
            "starting checkpoint daemon"
        );

        let shared = self.shared.clone();
        let config = self.config.clone();
        let stop = self.stop.clone();
        self.handle = Some(thread::spawn(move || {
            let tick = Duration::from_millis(25);
            while !stop.load(Ordering::SeqCst) {
                thread::sleep(tick);
                let Some(trigger) = due_trigger(&shared, &config) else {
                    continue;
                };
                // A failed checkpoint is retried on the next due tick.
                let _ = shared.run_checkpoint(trigger);
            }
        }));
    }

    /// Signals the thread and joins it; any in-flight checkpoint
    /// completes first.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Administrative manual checkpoint through the same path the
    /// triggers use.
    pub fn checkpoint_now(&self) -> Result<Lsn, WalError> {
        self.shared.run_checkpoint(Trigger::Manual)
    }

    pub fn stats(&self) -> CheckpointDaemonStats {
        self.shared.stats.lock().unwrap().clone()
    }
}

impl Drop for CheckpointDaemon {
    fn drop(&mut self) {
        self.stop();
    }
}

fn due_trigger(shared: &DaemonShared, config: &CheckpointConfig) -> Option<Trigger> {
    if !config.interval.is_zero()
        && shared.last_checkpoint_at.lock().unwrap().elapsed() >= config.interval
    {
        return Some(Trigger::Time);
    }
    if config.max_wal_size > 0
        && shared.wal.size_bytes() >= config.max_wal_size
        && shared.wal.end_lsn() > shared.end_at_last_checkpoint.load(Ordering::Relaxed)
    {
        return Some(Trigger::Size);
    }
    if config.max_transactions > 0
        && shared.wal.commits_since_checkpoint() >= config.max_transactions
    {
        return Some(Trigger::Txns);
    }
    None
}
