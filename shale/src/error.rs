//! Error types for the storage core, categorized by cause.
//!
//! Low-level components expose the narrow types (`ParseError`, `WalError`);
//! higher components wrap them with operation context as they rethrow.

use crate::{Lsn, PageId, TxnId};
use thiserror::Error;

/// Failure to decode a framed log record or checkpoint snapshot.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The declared length exceeds the remaining bytes.
    #[error("record truncated: need {needed} bytes, {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    /// CRC mismatch over the framed payload.
    #[error("record checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },

    /// A kind tag this build does not understand. Forward-compatible
    /// readers treat this as end-of-log for tail records only.
    #[error("unknown record kind {0}")]
    UnknownKind(u8),

    /// Internally inconsistent record bytes.
    #[error("malformed record: {0}")]
    Malformed(String),
}

/// Errors from the WAL writer, reader, and checkpoint machinery.
#[derive(Debug, Error)]
pub enum WalError {
    #[error("wal i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Durability-fatal: a record inside the trusted prefix failed to
    /// parse. The database must refuse to open.
    #[error("corrupt wal record at lsn {lsn}: {source}")]
    CorruptRecord { lsn: Lsn, source: ParseError },

    #[error("record payload of {len} bytes exceeds the {max} byte limit")]
    RecordTooLarge { len: usize, max: usize },

    #[error("failed to serialize log record: {0}")]
    Serialize(String),

    #[error("not a wal file: bad magic")]
    BadFileHeader,

    #[error("unsupported wal format version {0}")]
    UnsupportedVersion(u16),

    /// Programmer error: an operation referenced a transaction with no
    /// log chain.
    #[error("transaction {0} has no log chain")]
    UnknownTransaction(TxnId),

    /// The log on disk ends before a point a completed checkpoint proved
    /// durable.
    #[error("wal ends at lsn {end} but checkpoint requires records through lsn {required}")]
    MissingDurableRecords { end: Lsn, required: Lsn },
}

/// Errors from the buffer pool and disk manager.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("page i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error("no evictable frame: all pages are pinned or uncommitted-dirty")]
    NoFreeFrames,

    #[error("deadlock while locking page {0}")]
    Deadlock(PageId),

    #[error("file id {0} is not registered in the catalog")]
    UnknownFile(u64),
}

/// Errors surfaced to transaction callers.
#[derive(Debug, Error)]
pub enum TxnError {
    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("page {0} has no room for the record")]
    PageFull(PageId),

    #[error("no record at slot {slot} of page {page_id}")]
    NoSuchRecord { page_id: PageId, slot: u16 },

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that abort recovery. The engine must not start in a
/// partially-recovered state.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("{phase} phase failed: {source}")]
    Wal {
        phase: &'static str,
        #[source]
        source: WalError,
    },

    #[error("{phase} phase failed: {source}")]
    Pool {
        phase: &'static str,
        #[source]
        source: PoolError,
    },
}

impl RecoveryError {
    pub fn wal(phase: &'static str, source: WalError) -> Self {
        Self::Wal { phase, source }
    }

    pub fn pool(phase: &'static str, source: PoolError) -> Self {
        Self::Pool { phase, source }
    }
}
