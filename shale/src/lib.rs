//! # Shale Storage Core
//! The durability core of the Rhea database: write-ahead log, fuzzy
//! checkpoints, buffer pool, and ARIES-style crash recovery.
//!
//! The crate guarantees atomicity and durability for fail-stop crashes:
//! after `RecoveryManager::recover` completes, every committed transaction
//! is reflected in the data files and every uncommitted one is rolled back,
//! starting only from the on-disk WAL and data files.

use serde::{Deserialize, Serialize};

/// The buffer pool manager and RAII page pins.
pub mod buffer_pool;
/// Fuzzy checkpoints: snapshot codec, write protocol, sidecar handling.
pub mod checkpoint;
/// The background checkpoint daemon.
pub mod checkpoint_daemon;
/// Typed error taxonomy for the storage core.
pub mod error;
/// Fault injection points for crash testing.
pub mod failpoint;
/// The lock manager for page-level strict two-phase locking.
pub mod lock_manager;
/// The page layout and slotted record directory.
pub mod page;
/// The disk manager and file catalog.
pub mod pager;
/// Forward scans over the log stream.
pub mod reader;
/// The log record codec.
pub mod record;
/// The ARIES recovery manager.
pub mod recovery;
/// The transaction manager.
pub mod transaction;
/// WAL prefix truncation.
pub mod truncate;
/// The Write-Ahead Log writer and reader.
pub mod wal;

/// The size of a single page in bytes. Fixed after first use.
pub const PAGE_SIZE: usize = 4096;

/// A Log Sequence Number: a monotonically increasing identifier for a log
/// record. LSN 0 means "no record".
pub type Lsn = u64;

/// "No record" sentinel for LSN-valued fields.
pub const NO_LSN: Lsn = 0;

/// A transaction identifier, unique per process lifetime. 0 is invalid.
pub type TxnId = u64;

/// Reserved invalid transaction id.
pub const INVALID_TXN_ID: TxnId = 0;

/// A page address: a backing file plus a 0-indexed page offset within it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct PageId {
    pub file_id: u64,
    pub page_no: u64,
}

impl PageId {
    pub fn new(file_id: u64, page_no: u64) -> Self {
        Self { file_id, page_no }
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file_id, self.page_no)
    }
}

pub use buffer_pool::{AccessMode, BufferPool, PageGuard};
pub use page::Page;
pub use wal::{WalWriter, TxnLogInfo, TxnStatus};
