//! The transaction manager.
//!
//! Transactions are born on their first mutation (which emits Begin),
//! extended by each mutation, and ended by exactly one of commit or
//! abort. Commit follows the FORCE policy: the commit record is forced,
//! then every page the transaction dirtied is flushed, then locks are
//! released. Abort walks the per-transaction log chain backwards,
//! restores before-images, and emits a CLR per undone record so a crash
//! mid-abort never repeats completed undos.

use crate::buffer_pool::{AccessMode, BufferPool};
use crate::error::{TxnError, WalError};
use crate::failpoint;
use crate::record::LogRecord;
use crate::wal::WalWriter;
use crate::{Lsn, PageId, TxnId, NO_LSN};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct TransactionManager {
    wal: Arc<WalWriter>,
    pool: Arc<BufferPool>,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// `first_txn_id` seeds the id counter; recovery passes one past the
    /// highest id seen in the log. 0 is reserved invalid.
    pub fn new(wal: Arc<WalWriter>, pool: Arc<BufferPool>, first_txn_id: TxnId) -> Self {
        Self {
            wal,
            pool,
            next_txn_id: AtomicU64::new(first_txn_id.max(1)),
        }
    }

    /// Vends a transaction id. The Begin record is written lazily on the
    /// first mutation.
    pub fn begin(&self) -> TxnId {
        self.next_txn_id.fetch_add(1, Ordering::SeqCst)
    }

    fn ensure_begun(&self, txn: TxnId) -> Result<(), TxnError> {
        if !self.wal.has_chain(txn) {
            self.wal.log_begin(txn)?;
        }
        Ok(())
    }

    /// Reads one record under a shared page lock.
    pub fn read(
        &self,
        txn: TxnId,
        page_id: PageId,
        slot: u16,
    ) -> Result<Option<Vec<u8>>, TxnError> {
        let guard = self.pool.get_page(txn, page_id, AccessMode::Read)?;
        let page = guard.read();
        Ok(page.read_record(slot).map(|r| r.to_vec()))
    }

    /// Adds a record to the page; returns its slot.
    pub fn insert(&self, txn: TxnId, page_id: PageId, record: &[u8]) -> Result<u16, TxnError> {
        let (_, slot) = self.mutate(txn, page_id, MutationKind::Insert, |page| {
            page.insert_record(record).ok_or(TxnError::PageFull(page_id))
        })?;
        Ok(slot)
    }

    /// Overwrites the record at `slot`. Size-changing updates reslot the
    /// record within the page.
    pub fn update(
        &self,
        txn: TxnId,
        page_id: PageId,
        slot: u16,
        record: &[u8],
    ) -> Result<(), TxnError> {
        self.mutate(txn, page_id, MutationKind::Update, |page| {
            let existing_len = page
                .read_record(slot)
                .map(|r| r.len())
                .ok_or(TxnError::NoSuchRecord { page_id, slot })?;
            if existing_len == record.len() {
                page.write_record(slot, record);
                return Ok(());
            }
            // Check room before tombstoning so a full page leaves the
            // record untouched instead of half-updated.
            if !page.has_room_for(record.len()) {
                return Err(TxnError::PageFull(page_id));
            }
            page.delete_record(slot);
            page.insert_record(record)
                .map(|_| ())
                .ok_or(TxnError::PageFull(page_id))
        })?;
        Ok(())
    }

    /// Tombstones the record at `slot`.
    pub fn delete(&self, txn: TxnId, page_id: PageId, slot: u16) -> Result<(), TxnError> {
        self.mutate(txn, page_id, MutationKind::Delete, |page| {
            if page.delete_record(slot) {
                Ok(())
            } else {
                Err(TxnError::NoSuchRecord { page_id, slot })
            }
        })?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        txn: TxnId,
        page_id: PageId,
        kind: MutationKind,
        apply: impl FnOnce(&mut crate::Page) -> Result<T, TxnError>,
    ) -> Result<(Lsn, T), TxnError> {
        self.ensure_begun(txn)?;
        let guard = self.pool.get_page(txn, page_id, AccessMode::Write)?;
        let before = guard.read().data.to_vec();
        let out = apply(&mut guard.write())?;
        let after = guard.read().data.to_vec();

        let lsn = match kind {
            MutationKind::Insert => self.wal.log_insert(txn, page_id, before, after)?,
            MutationKind::Update => self.wal.log_update(txn, page_id, before, after)?,
            MutationKind::Delete => self.wal.log_delete(txn, page_id, before, after)?,
        };
        self.pool.mark_dirty(&guard, txn, lsn);
        Ok((lsn, out))
    }

    /// Commits the transaction. Returns only after the commit record is
    /// durable; the transaction's pages are then flushed (FORCE) and its
    /// locks released.
    pub fn commit(&self, txn: TxnId) -> Result<(), TxnError> {
        failpoint::maybe_fail("txn.commit.before_wal")?;

        if !self.wal.has_chain(txn) {
            // Read-only transaction: nothing to log or flush.
            self.pool.lock_manager().release_all(txn);
            return Ok(());
        }

        self.wal.log_commit(txn)?;
        failpoint::maybe_fail("txn.commit.after_wal")?;

        for page_id in self.pool.pages_dirtied_by(txn) {
            self.pool.flush_page(page_id)?;
        }
        self.pool.lock_manager().release_all(txn);
        Ok(())
    }

    /// Rolls the transaction back: every logged mutation is undone in
    /// reverse chain order with a CLR written per undo, then the Abort
    /// record ends the chain.
    pub fn abort(&self, txn: TxnId) -> Result<(), TxnError> {
        if !self.wal.has_chain(txn) {
            self.pool.lock_manager().release_all(txn);
            return Ok(());
        }

        let mut cursor = self
            .wal
            .chain_tail(txn)
            .ok_or(WalError::UnknownTransaction(txn))?;
        let mut touched = Vec::new();

        while cursor != NO_LSN {
            let (header, record) = self.wal.read_record_at(cursor)?;
            match record {
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
                    let clr_lsn =
                        self.wal
                            .log_clr(txn, page_id, before_image.clone(), header.prev_lsn)?;
                    let guard = self.pool.fetch_page(page_id)?;
                    {
                        let mut page = guard.write();
                        page.install_image(&before_image);
                        page.set_page_lsn(clr_lsn);
                    }
                    self.pool.mark_dirty(&guard, txn, clr_lsn);
                    touched.push(page_id);
                    cursor = header.prev_lsn;
                }
                // CLRs are never undone; jump straight past the records
                // they already compensated.
                LogRecord::Clr { undo_next_lsn, .. } => cursor = undo_next_lsn,
                LogRecord::Begin => break,
                _ => cursor = header.prev_lsn,
            }
        }

        failpoint::maybe_fail("txn.abort.before_abort_record")?;
        self.wal.log_abort(txn)?;

        touched.sort_unstable();
        touched.dedup();
        for page_id in touched {
            self.pool.flush_page(page_id)?;
        }
        self.pool.release_dirtier(txn);
        self.pool.lock_manager().release_all(txn);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum MutationKind {
    Insert,
    Update,
    Delete,
}
