//! ARIES-style crash recovery in three phases.
//!
//! Analysis rebuilds the ATT and DPT from the last completed checkpoint
//! (or the whole log). Redo repeats history from the earliest rec_lsn,
//! losers included. Undo rolls back every transaction that was
//! active at the crash, writing CLRs so a crash during recovery converges
//! to the same state on the next run. `recover` is invoked before the
//! engine accepts any work and is idempotent.

use crate::buffer_pool::BufferPool;
use crate::checkpoint::{self, CheckpointSnapshot};
use crate::error::{RecoveryError, WalError};
use crate::reader::LogReader;
use crate::record::LogRecord;
use crate::wal::{TxnLogInfo, TxnStatus, WalWriter};
use crate::{Lsn, PageId, TxnId, INVALID_TXN_ID, NO_LSN};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

/// Counters from the last `recover` run.
#[derive(Debug, Clone, Default)]
pub struct RecoveryStats {
    pub log_records_scanned: u64,
    pub redo_operations: u64,
    pub undo_operations: u64,
    pub transactions_recovered: u64,
    pub transactions_undone: u64,
    pub dirty_pages_found: u64,
    pub checkpoint_seeded: bool,
    /// Highest transaction id observed; the id counter restarts past it.
    pub max_txn_id: TxnId,
}

pub struct RecoveryManager {
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    att: HashMap<TxnId, TxnLogInfo>,
    dpt: HashMap<PageId, Lsn>,
    /// Records below this LSN are covered by a completed checkpoint;
    /// parse failures there are fatal.
    trusted_limit: Lsn,
    stats: RecoveryStats,
}

impl RecoveryManager {
    pub fn new(wal: Arc<WalWriter>, pool: Arc<BufferPool>) -> Self {
        Self {
            wal,
            pool,
            att: HashMap::new(),
            dpt: HashMap::new(),
            trusted_limit: NO_LSN,
            stats: RecoveryStats::default(),
        }
    }

    /// Runs Analysis, Redo, and Undo. On return every committed
    /// transaction is reflected in the data files, every loser is rolled
    /// back with an Abort record in the log, and the writer's runtime
    /// tables match the surviving dirty pages.
    pub fn recover(&mut self) -> Result<RecoveryStats, RecoveryError> {
        tracing::info!("starting recovery");
        self.stats = RecoveryStats::default();
        self.wal
            .force(Lsn::MAX)
            .map_err(|e| RecoveryError::wal("analysis", e))?;

        self.analysis()?;
        self.redo()?;
        self.undo()?;

        // Every loser is aborted, so the runtime ATT starts empty; the
        // runtime DPT keeps the analysis rec_lsns of pages that are
        // still dirty in the pool (redone but unflushed).
        let live_dpt: HashMap<PageId, Lsn> = self
            .dpt
            .iter()
            .filter(|(page_id, _)| self.pool.is_dirty(**page_id))
            .map(|(page_id, rec_lsn)| (*page_id, *rec_lsn))
            .collect();
        self.wal.install_tables(HashMap::new(), live_dpt);

        tracing::info!(
            scanned = self.stats.log_records_scanned,
            redone = self.stats.redo_operations,
            undone = self.stats.undo_operations,
            losers = self.stats.transactions_undone,
            "recovery complete"
        );
        Ok(self.stats.clone())
    }

    pub fn stats(&self) -> &RecoveryStats {
        &self.stats
    }

    /// A copy of the rebuilt Active Transaction Table.
    pub fn transaction_table(&self) -> HashMap<TxnId, TxnLogInfo> {
        self.att.clone()
    }

    /// A copy of the rebuilt Dirty Page Table.
    pub fn dirty_page_table(&self) -> HashMap<PageId, Lsn> {
        self.dpt.clone()
    }

    /// True when the log shows a transaction with no Commit or Abort.
    pub fn is_recovery_needed(&self) -> Result<bool, RecoveryError> {
        self.wal
            .force(Lsn::MAX)
            .map_err(|e| RecoveryError::wal("analysis", e))?;
        let mut reader =
            LogReader::open(self.wal.path()).map_err(|e| RecoveryError::wal("analysis", e))?;

        let mut active: HashSet<TxnId> = HashSet::new();
        while let Some(rec) = reader
            .read_next()
            .map_err(|e| RecoveryError::wal("analysis", e))?
        {
            match rec.record {
                LogRecord::Begin => {
                    active.insert(rec.header.txn_id);
                }
                LogRecord::Commit | LogRecord::Abort => {
                    active.remove(&rec.header.txn_id);
                }
                _ => {}
            }
        }
        Ok(!active.is_empty())
    }

    fn analysis(&mut self) -> Result<(), RecoveryError> {
        let wrap = |e| RecoveryError::wal("analysis", e);
        self.att.clear();
        self.dpt.clear();
        self.trusted_limit = NO_LSN;

        let seed = self.validated_checkpoint().map_err(wrap)?;
        let mut reader = LogReader::open(self.wal.path()).map_err(wrap)?;
        let scan_start = match seed {
            Some((snapshot, trusted)) => {
                tracing::info!(
                    checkpoint_lsn = snapshot.checkpoint_lsn,
                    active_txns = snapshot.active_txns.len(),
                    dirty_pages = snapshot.dirty_pages.len(),
                    "analysis seeded from checkpoint"
                );
                self.att = snapshot.active_txns;
                self.dpt = snapshot.dirty_pages;
                self.trusted_limit = trusted;
                self.stats.checkpoint_seeded = true;
                for &txn_id in self.att.keys() {
                    self.stats.max_txn_id = self.stats.max_txn_id.max(txn_id);
                }
                snapshot.checkpoint_lsn
            }
            None => reader.base_lsn(),
        };

        reader.set_trusted_limit(self.trusted_limit);
        reader.seek_to(scan_start).map_err(wrap)?;

        while let Some(rec) = reader.read_next().map_err(wrap)? {
            self.stats.log_records_scanned += 1;
            let txn = rec.header.txn_id;
            self.stats.max_txn_id = self.stats.max_txn_id.max(txn);
            let lsn = rec.lsn;

            match &rec.record {
                LogRecord::Begin => {
                    self.att.insert(
                        txn,
                        TxnLogInfo {
                            first_lsn: lsn,
                            last_lsn: lsn,
                            undo_next_lsn: NO_LSN,
                            status: TxnStatus::Active,
                        },
                    );
                }
                LogRecord::Commit => {
                    self.close_txn(txn, lsn, TxnStatus::Committed);
                }
                LogRecord::Abort => {
                    self.close_txn(txn, lsn, TxnStatus::Aborted);
                }
                LogRecord::Update { page_id, .. }
                | LogRecord::Insert { page_id, .. }
                | LogRecord::Delete { page_id, .. } => {
                    // The record itself is the next to undo for its txn.
                    let entry = self.att.entry(txn).or_insert(TxnLogInfo {
                        first_lsn: lsn,
                        last_lsn: lsn,
                        undo_next_lsn: lsn,
                        status: TxnStatus::Active,
                    });
                    entry.last_lsn = lsn;
                    entry.undo_next_lsn = lsn;
                    self.dpt.entry(*page_id).or_insert(lsn);
                }
                LogRecord::Clr {
                    page_id,
                    undo_next_lsn,
                    ..
                } => {
                    let entry = self.att.entry(txn).or_insert(TxnLogInfo {
                        first_lsn: lsn,
                        last_lsn: lsn,
                        undo_next_lsn: *undo_next_lsn,
                        status: TxnStatus::Active,
                    });
                    entry.last_lsn = lsn;
                    entry.undo_next_lsn = *undo_next_lsn;
                    self.dpt.entry(*page_id).or_insert(lsn);
                }
                // State was seeded from the sidecar; the records carry no
                // tables of their own.
                LogRecord::CheckpointBegin | LogRecord::CheckpointEnd => {}
            }
        }

        self.stats.transactions_recovered = self.att.len() as u64;
        self.stats.dirty_pages_found = self.dpt.len() as u64;
        self.stats.transactions_undone = self
            .att
            .values()
            .filter(|info| info.status == TxnStatus::Active)
            .count() as u64;

        // Install the rebuilt tables as the writer's runtime state: Undo
        // chains CLRs through them, and page flushes prune the live DPT.
        let losers: HashMap<TxnId, TxnLogInfo> = self
            .att
            .iter()
            .filter(|(_, info)| info.status == TxnStatus::Active)
            .map(|(id, info)| (*id, *info))
            .collect();
        self.wal.install_tables(losers, self.dpt.clone());

        tracing::info!(
            transactions = self.stats.transactions_recovered,
            dirty_pages = self.stats.dirty_pages_found,
            losers = self.stats.transactions_undone,
            "analysis complete"
        );
        Ok(())
    }

    fn close_txn(&mut self, txn: TxnId, lsn: Lsn, status: TxnStatus) {
        match self.att.get_mut(&txn) {
            Some(entry) => {
                entry.status = status;
                entry.last_lsn = lsn;
            }
            None => {
                // The transaction began before the checkpoint window.
                self.att.insert(
                    txn,
                    TxnLogInfo {
                        first_lsn: lsn,
                        last_lsn: lsn,
                        undo_next_lsn: NO_LSN,
                        status,
                    },
                );
            }
        }
    }

    /// Accepts the sidecar only when the log holds the matching
    /// CheckpointBegin / CheckpointEnd pair. Returns the snapshot and the
    /// LSN one past the CheckpointEnd record (the trusted-prefix bound).
    fn validated_checkpoint(&self) -> Result<Option<(CheckpointSnapshot, Lsn)>, WalError> {
        let Some(snapshot) = checkpoint::load_snapshot(self.wal.path())? else {
            return Ok(None);
        };

        let mut reader = LogReader::open(self.wal.path())?;
        if snapshot.checkpoint_lsn < reader.base_lsn() {
            tracing::warn!(
                checkpoint_lsn = snapshot.checkpoint_lsn,
                base_lsn = reader.base_lsn(),
                "sidecar predates the truncated log; ignoring it"
            );
            return Ok(None);
        }
        reader.seek_to(snapshot.checkpoint_lsn)?;

        match reader.read_next()? {
            Some(rec)
                if rec.lsn == snapshot.checkpoint_lsn
                    && rec.record == LogRecord::CheckpointBegin => {}
            _ => {
                tracing::warn!(
                    checkpoint_lsn = snapshot.checkpoint_lsn,
                    "sidecar does not name a CheckpointBegin; ignoring it"
                );
                return Ok(None);
            }
        }

        while let Some(rec) = reader.read_next()? {
            if rec.record == LogRecord::CheckpointEnd
                && rec.header.prev_lsn == snapshot.checkpoint_lsn
            {
                return Ok(Some((snapshot, reader.position())));
            }
        }

        tracing::warn!(
            checkpoint_lsn = snapshot.checkpoint_lsn,
            "CheckpointBegin has no CheckpointEnd; ignoring sidecar"
        );
        Ok(None)
    }

    fn redo(&mut self) -> Result<(), RecoveryError> {
        let wrap = |e| RecoveryError::wal("redo", e);
        if self.dpt.is_empty() {
            tracing::debug!("dirty page table empty; skipping redo");
            return Ok(());
        }

        let redo_lsn = *self.dpt.values().min().unwrap();
        let mut reader = LogReader::open(self.wal.path()).map_err(wrap)?;
        reader.set_trusted_limit(self.trusted_limit);
        reader.seek_to(redo_lsn).map_err(wrap)?;

        while let Some(rec) = reader.read_next().map_err(wrap)? {
            let after_image = match &rec.record {
                LogRecord::Update { after_image, .. }
                | LogRecord::Insert { after_image, .. }
                | LogRecord::Delete { after_image, .. }
                | LogRecord::Clr { after_image, .. } => after_image,
                _ => continue,
            };
            let page_id = rec.record.page_id().unwrap();

            let Some(&rec_lsn) = self.dpt.get(&page_id) else {
                continue;
            };
            if rec.lsn < rec_lsn {
                continue;
            }

            let guard = self
                .pool
                .fetch_page(page_id)
                .map_err(|e| RecoveryError::pool("redo", e))?;
            let applied = {
                let mut page = guard.write();
                if page.page_lsn() >= rec.lsn {
                    false
                } else {
                    page.install_image(after_image);
                    page.set_page_lsn(rec.lsn);
                    true
                }
            };
            if applied {
                self.pool.mark_dirty(&guard, INVALID_TXN_ID, rec.lsn);
                self.stats.redo_operations += 1;
            }
        }

        tracing::info!(redone = self.stats.redo_operations, "redo complete");
        Ok(())
    }

    fn undo(&mut self) -> Result<(), RecoveryError> {
        let wrap = |e| RecoveryError::wal("undo", e);

        // Highest-LSN loser first, across all losers.
        let mut queue: BinaryHeap<(Lsn, TxnId)> = self
            .att
            .iter()
            .filter(|(_, info)| info.status == TxnStatus::Active)
            .map(|(id, info)| (info.undo_next_lsn, *id))
            .collect();
        if queue.is_empty() {
            tracing::debug!("no loser transactions; skipping undo");
            return Ok(());
        }

        let mut touched: HashMap<TxnId, Vec<PageId>> = HashMap::new();

        while let Some((lsn, txn)) = queue.pop() {
            if lsn == NO_LSN {
                self.finish_loser(txn, &mut touched)?;
                continue;
            }

            let (header, rec) = self.wal.read_record_at(lsn).map_err(wrap)?;
            let next = match rec {
                LogRecord::Update {
                    page_id,
                    before_image,
                    ..
                }
                | LogRecord::Insert {
                    page_id,
                    before_image,
                    ..
                }
                | LogRecord::Delete {
                    page_id,
                    before_image,
                    ..
                } => {
                    let clr_lsn = self
                        .wal
                        .log_clr(txn, page_id, before_image.clone(), header.prev_lsn)
                        .map_err(wrap)?;
                    let guard = self
                        .pool
                        .fetch_page(page_id)
                        .map_err(|e| RecoveryError::pool("undo", e))?;
                    {
                        let mut page = guard.write();
                        page.install_image(&before_image);
                        page.set_page_lsn(clr_lsn);
                    }
                    self.pool.mark_dirty(&guard, INVALID_TXN_ID, clr_lsn);
                    self.stats.undo_operations += 1;
                    touched.entry(txn).or_default().push(page_id);

                    if let Some(entry) = self.att.get_mut(&txn) {
                        entry.last_lsn = clr_lsn;
                    }
                    header.prev_lsn
                }
                // CLRs are never undone (I6); skip to what they name.
                LogRecord::Clr { undo_next_lsn, .. } => undo_next_lsn,
                LogRecord::Begin => NO_LSN,
                _ => header.prev_lsn,
            };

            if let Some(entry) = self.att.get_mut(&txn) {
                entry.undo_next_lsn = next;
            }
            if next == NO_LSN {
                self.finish_loser(txn, &mut touched)?;
            } else {
                queue.push((next, txn));
            }
        }

        self.wal.force(Lsn::MAX).map_err(wrap)?;
        tracing::info!(undone = self.stats.undo_operations, "undo complete");
        Ok(())
    }

    /// The loser's chain is fully compensated: write its Abort record and
    /// flush the pages its undo touched (removing them from the DPT).
    fn finish_loser(
        &mut self,
        txn: TxnId,
        touched: &mut HashMap<TxnId, Vec<PageId>>,
    ) -> Result<(), RecoveryError> {
        let last = self
            .wal
            .chain_tail(txn)
            .or_else(|| self.att.get(&txn).map(|info| info.last_lsn))
            .unwrap_or(NO_LSN);
        self.wal
            .log_abort_during_recovery(txn, last)
            .map_err(|e| RecoveryError::wal("undo", e))?;

        if let Some(entry) = self.att.get_mut(&txn) {
            entry.status = TxnStatus::Aborted;
            entry.last_lsn = self.wal.end_lsn();
        }

        if let Some(mut pages) = touched.remove(&txn) {
            pages.sort_unstable();
            pages.dedup();
            for page_id in pages {
                self.pool
                    .flush_page(page_id)
                    .map_err(|e| RecoveryError::pool("undo", e))?;
            }
        }
        Ok(())
    }
}
