//! Fuzzy checkpoints.
//!
//! A checkpoint bounds recovery time without blocking mutators: a
//! CheckpointBegin record fixes the scan start, the runtime ATT and DPT
//! are snapshotted under a short lock while transactions keep running,
//! the snapshot goes to a sidecar file via write-temp-then-rename, and a
//! CheckpointEnd record (whose `prev_lsn` names the Begin) is forced to
//! complete the protocol. A crash anywhere in between leaves a dangling
//! Begin that Analysis detects, ignoring the sidecar.
//!
//! The sidecar is not a log record: it has its own serialization with a
//! leading total size, a fixed header, count-prefixed transaction and
//! dirty-page lists, and a trailing CRC.

use crate::error::{ParseError, WalError};
use crate::failpoint;
use crate::wal::{TxnLogInfo, TxnStatus, WalWriter};
use crate::{Lsn, PageId, TxnId};
use chrono::{DateTime, TimeZone, Utc};
use crc32fast::Hasher;
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix appended to the WAL path to name the sidecar file.
pub const SIDECAR_SUFFIX: &str = ".checkpoint";

/// A persisted checkpoint snapshot.
#[derive(Debug, Clone)]
pub struct CheckpointSnapshot {
    /// LSN of the paired CheckpointBegin record: the Analysis scan start.
    pub checkpoint_lsn: Lsn,
    pub taken_at: DateTime<Utc>,
    /// Transactions active at snapshot time, keyed by id.
    pub active_txns: HashMap<TxnId, TxnLogInfo>,
    /// Pages believed dirty at snapshot time, with the earliest LSN that
    /// dirtied them.
    pub dirty_pages: HashMap<PageId, Lsn>,
}

impl CheckpointSnapshot {
    /// Serialized layout, little-endian:
    /// `[total_size: u32][checkpoint_lsn: u64][timestamp: i64]
    ///  [txn_count: u32][txn_id, first, last, undo_next: u64 × 4]...
    ///  [page_count: u32][file_id, page_no, rec_lsn: u64 × 3]...
    ///  [crc: u32]`
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(
            8 + 8 + 4 + self.active_txns.len() * 32 + 4 + self.dirty_pages.len() * 24,
        );
        body.extend_from_slice(&self.checkpoint_lsn.to_le_bytes());
        body.extend_from_slice(&self.taken_at.timestamp().to_le_bytes());

        body.extend_from_slice(&(self.active_txns.len() as u32).to_le_bytes());
        for (txn_id, info) in &self.active_txns {
            body.extend_from_slice(&txn_id.to_le_bytes());
            body.extend_from_slice(&info.first_lsn.to_le_bytes());
            body.extend_from_slice(&info.last_lsn.to_le_bytes());
            body.extend_from_slice(&info.undo_next_lsn.to_le_bytes());
        }

        body.extend_from_slice(&(self.dirty_pages.len() as u32).to_le_bytes());
        for (page_id, rec_lsn) in &self.dirty_pages {
            body.extend_from_slice(&page_id.file_id.to_le_bytes());
            body.extend_from_slice(&page_id.page_no.to_le_bytes());
            body.extend_from_slice(&rec_lsn.to_le_bytes());
        }

        let mut hasher = Hasher::new();
        hasher.update(&body);
        let crc = hasher.finalize();

        let total = 4 + body.len() + 4;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_le_bytes());
        out.extend_from_slice(&body);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < 4 {
            return Err(ParseError::Truncated {
                needed: 4,
                remaining: data.len(),
            });
        }
        let total = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
        if data.len() < total || total < 4 + 8 + 8 + 4 + 4 + 4 {
            return Err(ParseError::Truncated {
                needed: total,
                remaining: data.len(),
            });
        }

        let body = &data[4..total - 4];
        let stored = u32::from_le_bytes(data[total - 4..total].try_into().unwrap());
        let mut hasher = Hasher::new();
        hasher.update(body);
        let computed = hasher.finalize();
        if computed != stored {
            return Err(ParseError::Checksum { stored, computed });
        }

        let mut cursor = Cursor { body, pos: 0 };
        let checkpoint_lsn = cursor.u64()?;
        let timestamp = cursor.u64()? as i64;
        let taken_at = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| ParseError::Malformed(format!("bad timestamp {timestamp}")))?;

        let txn_count = cursor.u32()?;
        let mut active_txns = HashMap::with_capacity(txn_count as usize);
        for _ in 0..txn_count {
            let txn_id = cursor.u64()?;
            let first_lsn = cursor.u64()?;
            let last_lsn = cursor.u64()?;
            let undo_next_lsn = cursor.u64()?;
            active_txns.insert(
                txn_id,
                TxnLogInfo {
                    first_lsn,
                    last_lsn,
                    undo_next_lsn,
                    status: TxnStatus::Active,
                },
            );
        }

        let page_count = cursor.u32()?;
        let mut dirty_pages = HashMap::with_capacity(page_count as usize);
        for _ in 0..page_count {
            let file_id = cursor.u64()?;
            let page_no = cursor.u64()?;
            let rec_lsn = cursor.u64()?;
            dirty_pages.insert(PageId::new(file_id, page_no), rec_lsn);
        }

        Ok(Self {
            checkpoint_lsn,
            taken_at,
            active_txns,
            dirty_pages,
        })
    }
}

struct Cursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], ParseError> {
        if self.pos + n > self.body.len() {
            return Err(ParseError::Truncated {
                needed: n,
                remaining: self.body.len() - self.pos,
            });
        }
        let out = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, ParseError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, ParseError> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

/// Path of the sidecar for a given WAL path.
pub fn sidecar_path(wal_path: &Path) -> PathBuf {
    let mut name = wal_path.as_os_str().to_os_string();
    name.push(SIDECAR_SUFFIX);
    PathBuf::from(name)
}

/// Writes a fuzzy checkpoint and returns the CheckpointEnd LSN.
pub fn write_checkpoint(wal: &WalWriter) -> Result<Lsn, WalError> {
    let begin_lsn = wal.write_checkpoint_begin()?;

    // Snapshot under a short lock; mutators keep running. Entries whose
    // commit or abort record is already written are finished
    // transactions, not ATT material.
    let (att, dpt) = wal.snapshot_tables();
    let active_txns: HashMap<TxnId, TxnLogInfo> = att
        .into_iter()
        .filter(|(_, info)| info.status == TxnStatus::Active)
        .collect();

    let snapshot = CheckpointSnapshot {
        checkpoint_lsn: begin_lsn,
        taken_at: Utc::now(),
        active_txns,
        dirty_pages: dpt,
    };

    failpoint::maybe_fail("checkpoint.before_sidecar")?;
    write_sidecar(&sidecar_path(wal.path()), &snapshot.encode())?;

    failpoint::maybe_fail("checkpoint.before_end")?;
    let end_lsn = wal.write_checkpoint_end(begin_lsn)?;
    wal.force(end_lsn)?;
    wal.note_checkpoint_complete(end_lsn);

    tracing::info!(
        begin_lsn,
        end_lsn,
        active_txns = snapshot.active_txns.len(),
        dirty_pages = snapshot.dirty_pages.len(),
        "checkpoint complete"
    );
    Ok(end_lsn)
}

/// Loads the sidecar snapshot, if one exists and decodes cleanly. A
/// corrupt or half-written sidecar is treated as missing: the completed
/// state lives in the log, and Analysis falls back to a full scan.
pub fn load_snapshot(wal_path: &Path) -> Result<Option<CheckpointSnapshot>, WalError> {
    let path = sidecar_path(wal_path);
    let data = match std::fs::read(&path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match CheckpointSnapshot::decode(&data) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint sidecar");
            Ok(None)
        }
    }
}

/// Atomic replace: the sidecar always holds the most recent complete
/// snapshot or the previous one, never a torn mix.
fn write_sidecar(path: &Path, data: &[u8]) -> Result<(), WalError> {
    let tmp_path = {
        let mut name = path.as_os_str().to_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    };
    let mut tmp = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp_path)?;
    tmp.write_all(data)?;
    tmp.sync_all()?;
    drop(tmp);

    if let Err(e) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}
