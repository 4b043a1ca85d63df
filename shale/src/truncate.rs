//! WAL prefix truncation.
//!
//! After a successful checkpoint the log prefix that no recovery can need
//! may be removed. The safe point is the minimum of the checkpoint LSN,
//! every active transaction's first LSN, and every dirty page's rec_lsn,
//! minus a safety margin, snapped down to a record boundary. The suffix
//! is rewritten to a temp file under a rebased file header and renamed
//! over the original; LSNs themselves never change.

use crate::checkpoint::CheckpointSnapshot;
use crate::error::WalError;
use crate::reader::LogReader;
use crate::wal::WalWriter;
use crate::Lsn;

#[derive(Debug, Clone)]
pub struct TruncateConfig {
    pub enabled: bool,
    /// Skip truncation entirely for logs smaller than this.
    pub min_wal_size: u64,
    /// Lower bound on bytes of history retained.
    pub min_retained_size: u64,
}

impl Default for TruncateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_wal_size: 5 * 1024 * 1024,
            min_retained_size: 1024 * 1024,
        }
    }
}

/// Records kept below the computed safe point, for debugging a botched
/// recovery by hand.
const SAFETY_MARGIN: u64 = 1024;

/// Truncates the stale prefix if the configured thresholds allow it.
/// Returns the number of bytes removed (0 when truncation was skipped).
pub fn truncate_wal(
    wal: &WalWriter,
    snapshot: &CheckpointSnapshot,
    config: &TruncateConfig,
) -> Result<u64, WalError> {
    if !config.enabled {
        return Ok(0);
    }

    let current_size = wal.size_bytes();
    if current_size < config.min_wal_size {
        return Ok(0);
    }

    let mut safe = snapshot.checkpoint_lsn;
    for info in snapshot.active_txns.values() {
        safe = safe.min(info.first_lsn);
    }
    for &rec_lsn in snapshot.dirty_pages.values() {
        safe = safe.min(rec_lsn);
    }
    let safe = safe
        .saturating_sub(SAFETY_MARGIN)
        .min(wal.end_lsn().saturating_sub(config.min_retained_size));
    if safe <= wal.base_lsn() {
        return Ok(0);
    }

    // The header rewrite starts mid-file, so the cut must land on a
    // record boundary.
    wal.force(Lsn::MAX)?;
    let safe = snap_to_boundary(wal, safe)?;
    if safe <= wal.base_lsn() {
        return Ok(0);
    }

    let savings = safe - wal.base_lsn();
    if savings < current_size / 10 {
        // Not worth rewriting the file.
        return Ok(0);
    }

    wal.truncate_prefix(safe)
}

/// Greatest record-start LSN not above `target`.
fn snap_to_boundary(wal: &WalWriter, target: Lsn) -> Result<Lsn, WalError> {
    let mut reader = LogReader::open(wal.path())?;
    let mut boundary = reader.base_lsn();
    while let Some(rec) = reader.read_next()? {
        if rec.lsn > target {
            break;
        }
        boundary = rec.lsn;
    }
    Ok(boundary)
}
