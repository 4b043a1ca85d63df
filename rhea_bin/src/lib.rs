//! Engine wiring for the Rhea storage binary.
//!
//! `Engine::open` builds the storage stack for a data directory, runs
//! ARIES recovery before any work is accepted, and starts the checkpoint
//! daemon. Configuration comes from `RHEA_*` environment variables.

use shale::buffer_pool::{BufferPool, DEFAULT_POOL_SIZE};
use shale::checkpoint_daemon::{CheckpointConfig, CheckpointDaemon};
use shale::error::{PoolError, RecoveryError, TxnError, WalError};
use shale::lock_manager::LockManager;
use shale::pager::{DiskManager, FileCatalog};
use shale::recovery::{RecoveryManager, RecoveryStats};
use shale::transaction::TransactionManager;
use shale::truncate::TruncateConfig;
use shale::wal::{WalWriter, DEFAULT_WAL_BUFFER_SIZE};
use shale::Lsn;
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Name of the append-only log inside the data directory.
pub const WAL_FILE_NAME: &str = "wal.log";

/// Name of the table manifest inside the data directory.
const MANIFEST_FILE_NAME: &str = "tables.manifest";

#[derive(Debug)]
pub enum EngineError {
    Io(io::Error),
    Wal(WalError),
    Pool(PoolError),
    Txn(TxnError),
    Recovery(RecoveryError),
    BadManifest(String),
    UnknownTable(String),
}

impl From<io::Error> for EngineError {
    fn from(err: io::Error) -> Self {
        EngineError::Io(err)
    }
}

impl From<WalError> for EngineError {
    fn from(err: WalError) -> Self {
        EngineError::Wal(err)
    }
}

impl From<PoolError> for EngineError {
    fn from(err: PoolError) -> Self {
        EngineError::Pool(err)
    }
}

impl From<TxnError> for EngineError {
    fn from(err: TxnError) -> Self {
        EngineError::Txn(err)
    }
}

impl From<RecoveryError> for EngineError {
    fn from(err: RecoveryError) -> Self {
        EngineError::Recovery(err)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub wal_buffer_size: usize,
    pub pool_size: usize,
    pub checkpoint: CheckpointConfig,
    pub truncate: TruncateConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            wal_buffer_size: DEFAULT_WAL_BUFFER_SIZE,
            pool_size: DEFAULT_POOL_SIZE,
            checkpoint: CheckpointConfig::default(),
            truncate: TruncateConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reads overrides from `RHEA_*` environment variables; unset keys
    /// keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_u64("RHEA_WAL_BUFFER_SIZE") {
            config.wal_buffer_size = v as usize;
        }
        if let Some(v) = env_u64("RHEA_POOL_SIZE") {
            config.pool_size = v as usize;
        }
        if let Some(v) = env_bool("RHEA_CHECKPOINT_ENABLED") {
            config.checkpoint.enabled = v;
        }
        if let Some(v) = env_u64("RHEA_CHECKPOINT_INTERVAL_SECS") {
            config.checkpoint.interval = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("RHEA_CHECKPOINT_MAX_WAL_SIZE") {
            config.checkpoint.max_wal_size = v;
        }
        if let Some(v) = env_u64("RHEA_CHECKPOINT_MAX_TRANSACTIONS") {
            config.checkpoint.max_transactions = v;
        }
        if let Some(v) = env_bool("RHEA_TRUNCATE_ENABLED") {
            config.truncate.enabled = v;
        }
        if let Some(v) = env_u64("RHEA_TRUNCATE_MIN_WAL_SIZE") {
            config.truncate.min_wal_size = v;
        }
        if let Some(v) = env_u64("RHEA_TRUNCATE_MIN_RETAINED_SIZE") {
            config.truncate.min_retained_size = v;
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse().ok()
}

fn env_bool(key: &str) -> Option<bool> {
    match std::env::var(key).ok()?.trim() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

/// A running engine instance for one data directory.
pub struct Engine {
    data_dir: PathBuf,
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    txns: TransactionManager,
    daemon: CheckpointDaemon,
    recovery_stats: RecoveryStats,
    tables: HashMap<String, u64>,
    next_file_id: u64,
}

impl Engine {
    /// Opens the data directory: recovery runs to completion before this
    /// returns, so the engine never serves a partially-recovered state.
    pub fn open<P: AsRef<Path>>(data_dir: P, config: EngineConfig) -> Result<Self, EngineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let tables = load_manifest(&data_dir)?;
        let next_file_id = tables.values().max().copied().unwrap_or(0) + 1;

        let mut catalog = FileCatalog::new();
        for (name, file_id) in &tables {
            catalog.register(*file_id, table_path(&data_dir, name));
        }
        let disk = DiskManager::new(catalog);

        let wal = Arc::new(WalWriter::open(
            data_dir.join(WAL_FILE_NAME),
            config.wal_buffer_size,
        )?);
        let pool = Arc::new(BufferPool::new(
            disk,
            wal.clone(),
            Arc::new(LockManager::new()),
            config.pool_size,
        ));

        let mut recovery = RecoveryManager::new(wal.clone(), pool.clone());
        let recovery_stats = recovery.recover()?;

        let txns = TransactionManager::new(wal.clone(), pool.clone(), recovery_stats.max_txn_id + 1);

        let truncate = config.truncate.enabled.then(|| config.truncate.clone());
        let mut daemon = CheckpointDaemon::new(wal.clone(), config.checkpoint, truncate);
        daemon.start();

        tracing::info!(
            data_dir = %data_dir.display(),
            scanned = recovery_stats.log_records_scanned,
            redone = recovery_stats.redo_operations,
            undone = recovery_stats.undo_operations,
            "engine open"
        );

        Ok(Self {
            data_dir,
            wal,
            pool,
            txns,
            daemon,
            recovery_stats,
            tables,
            next_file_id,
        })
    }

    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }

    pub fn txns(&self) -> &TransactionManager {
        &self.txns
    }

    pub fn wal(&self) -> &Arc<WalWriter> {
        &self.wal
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// File id of an existing table.
    pub fn table(&self, name: &str) -> Result<u64, EngineError> {
        self.tables
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownTable(name.to_string()))
    }

    /// Creates (or returns) the table's backing file id and persists the
    /// manifest.
    pub fn create_table(&mut self, name: &str) -> Result<u64, EngineError> {
        if let Some(&file_id) = self.tables.get(name) {
            return Ok(file_id);
        }
        if name.is_empty() || name.contains(['\t', '\n', '/']) {
            return Err(EngineError::BadManifest(format!(
                "invalid table name {name:?}"
            )));
        }
        let file_id = self.next_file_id;
        self.next_file_id += 1;
        self.tables.insert(name.to_string(), file_id);
        self.pool
            .register_file(file_id, table_path(&self.data_dir, name));
        save_manifest(&self.data_dir, &self.tables)?;
        Ok(file_id)
    }

    /// Administrative manual checkpoint.
    pub fn checkpoint(&self) -> Result<Lsn, EngineError> {
        Ok(self.daemon.checkpoint_now()?)
    }

    /// Stops the daemon and flushes the pool.
    pub fn close(mut self) -> Result<(), EngineError> {
        self.daemon.stop();
        self.pool.flush_all()?;
        self.wal.force(Lsn::MAX)?;
        Ok(())
    }
}

fn table_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(format!("{name}.dat"))
}

fn load_manifest(data_dir: &Path) -> Result<HashMap<String, u64>, EngineError> {
    let path = data_dir.join(MANIFEST_FILE_NAME);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut tables = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (id, name) = line
            .split_once('\t')
            .ok_or_else(|| EngineError::BadManifest(line.to_string()))?;
        let file_id: u64 = id
            .parse()
            .map_err(|_| EngineError::BadManifest(line.to_string()))?;
        tables.insert(name.to_string(), file_id);
    }
    Ok(tables)
}

fn save_manifest(data_dir: &Path, tables: &HashMap<String, u64>) -> Result<(), EngineError> {
    let path = data_dir.join(MANIFEST_FILE_NAME);
    let tmp_path = data_dir.join(format!("{MANIFEST_FILE_NAME}.tmp"));

    let mut entries: Vec<(&String, &u64)> = tables.iter().collect();
    entries.sort_by_key(|(_, id)| **id);

    let mut out = String::new();
    for (name, file_id) in entries {
        out.push_str(&format!("{file_id}\t{name}\n"));
    }

    let mut tmp = std::fs::File::create(&tmp_path)?;
    tmp.write_all(out.as_bytes())?;
    tmp.sync_all()?;
    drop(tmp);
    std::fs::rename(&tmp_path, &path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut tables = HashMap::new();
        tables.insert("users".to_string(), 1);
        tables.insert("orders".to_string(), 2);
        save_manifest(dir.path(), &tables).unwrap();
        assert_eq!(load_manifest(dir.path()).unwrap(), tables);
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_manifest(dir.path()).unwrap().is_empty());
    }
}
