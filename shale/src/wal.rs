//! The Write-Ahead Log writer.
//!
//! A single internal mutex guards LSN assignment, the append buffer, the
//! per-transaction chain tails, and the runtime ATT and DPT; it is never
//! held across fsync. `force` implements group commit: one caller becomes
//! the syncer while concurrent committers wait on a condvar and re-check
//! the published durable LSN.
//!
//! The file starts with a 16-byte header carrying a base LSN, so a
//! record's LSN is `base_lsn + payload_offset`. Truncation rewrites the
//! suffix under a larger base; LSNs stay stable across it.

use crate::error::{ParseError, WalError};
use crate::record::{self, FrameHeader, LogRecord, RecordKind, FRAME_HEADER_LEN};
use crate::{checkpoint, Lsn, PageId, TxnId, NO_LSN};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

/// Magic bytes at the start of every WAL file.
pub const WAL_MAGIC: [u8; 4] = *b"SHWL";

/// On-disk format version.
pub const WAL_FORMAT_VERSION: u16 = 1;

/// Size of the WAL file header: magic, version, reserved, base LSN.
pub const WAL_FILE_HEADER_LEN: usize = 16;

/// Default size of the in-memory append buffer.
pub const DEFAULT_WAL_BUFFER_SIZE: usize = 64 * 1024;

/// Transaction state tracked in the Active Transaction Table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active,
    Committed,
    Aborted,
}

/// One Active Transaction Table entry: the transaction's log chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnLogInfo {
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo_next_lsn: Lsn,
    pub status: TxnStatus,
}

struct WalState {
    /// Bytes appended but not yet written to the file.
    buf: Vec<u8>,
    /// LSN of the first byte in `buf`.
    buf_start_lsn: Lsn,
    /// Next LSN to assign.
    end_lsn: Lsn,
    /// LSN of the first payload byte in the current file.
    base_lsn: Lsn,
    /// A thread is writing the file; file writes stay ordered through this.
    flushing: bool,
    att: HashMap<TxnId, TxnLogInfo>,
    dpt: HashMap<PageId, Lsn>,
    commits_since_checkpoint: u64,
    last_checkpoint_end: Lsn,
}

/// The WAL writer. Exclusively owns the log file for writes; readers open
/// their own handles.
pub struct WalWriter {
    path: PathBuf,
    buffer_capacity: usize,
    state: Mutex<WalState>,
    io_cv: Condvar,
    file: Mutex<File>,
    /// All bytes with LSN below this are durable.
    durable_lsn: AtomicU64,
    sync_count: AtomicU64,
}

impl WalWriter {
    /// Opens (or creates) the WAL at `path` and positions the writer after
    /// the last complete record. Trailing bytes that do not form a
    /// complete record are discarded: a torn tail is expected after a
    /// crash. Refuses to open when a completed checkpoint proves the log
    /// once held records beyond the surviving prefix.
    pub fn open<P: AsRef<Path>>(path: P, buffer_capacity: usize) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let base_lsn = if len < WAL_FILE_HEADER_LEN as u64 {
            // Fresh file, or a header write torn mid-creation; either way
            // no record can exist yet.
            file.set_len(0)?;
            write_file_header(&mut file, NO_LSN)?;
            file.sync_all()?;
            NO_LSN
        } else {
            read_base_lsn(&mut file)?
        };

        let mut data = Vec::new();
        file.seek(SeekFrom::Start(WAL_FILE_HEADER_LEN as u64))?;
        file.read_to_end(&mut data)?;

        let mut pos = 0usize;
        while pos < data.len() {
            match record::decode_record(&data[pos..]) {
                Ok((_, _, consumed)) => pos += consumed,
                Err(_) => break,
            }
        }
        let end_lsn = base_lsn + pos as u64;

        if pos < data.len() {
            // Before dropping the tail, make sure no completed checkpoint
            // claims durable records beyond the surviving prefix.
            if let Some(snap) = checkpoint::load_snapshot(&path)? {
                if snap.checkpoint_lsn >= end_lsn {
                    return Err(WalError::MissingDurableRecords {
                        end: end_lsn,
                        required: snap.checkpoint_lsn,
                    });
                }
            }
            tracing::debug!(
                dropped = data.len() - pos,
                end_lsn,
                "discarding torn wal tail"
            );
            file.set_len(WAL_FILE_HEADER_LEN as u64 + pos as u64)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            buffer_capacity: buffer_capacity.max(FRAME_HEADER_LEN),
            state: Mutex::new(WalState {
                buf: Vec::new(),
                buf_start_lsn: end_lsn,
                end_lsn,
                base_lsn,
                flushing: false,
                att: HashMap::new(),
                dpt: HashMap::new(),
                commits_since_checkpoint: 0,
                last_checkpoint_end: NO_LSN,
            }),
            io_cv: Condvar::new(),
            file: Mutex::new(file),
            durable_lsn: AtomicU64::new(end_lsn),
            sync_count: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next LSN to be assigned.
    pub fn end_lsn(&self) -> Lsn {
        self.state.lock().unwrap().end_lsn
    }

    /// All bytes with LSN below this are on stable storage.
    pub fn durable_lsn(&self) -> Lsn {
        self.durable_lsn.load(Ordering::Acquire)
    }

    pub fn base_lsn(&self) -> Lsn {
        self.state.lock().unwrap().base_lsn
    }

    /// Number of fsyncs issued so far. Group commit keeps this well below
    /// the number of committers.
    pub fn sync_count(&self) -> u64 {
        self.sync_count.load(Ordering::Relaxed)
    }

    /// Physical size of the log file once the buffer drains.
    pub fn size_bytes(&self) -> u64 {
        let st = self.state.lock().unwrap();
        WAL_FILE_HEADER_LEN as u64 + (st.end_lsn - st.base_lsn)
    }

    pub fn commits_since_checkpoint(&self) -> u64 {
        self.state.lock().unwrap().commits_since_checkpoint
    }

    pub fn last_checkpoint_end(&self) -> Lsn {
        self.state.lock().unwrap().last_checkpoint_end
    }

    /// Writes the transaction's Begin record and opens its chain.
    pub fn log_begin(&self, txn: TxnId) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let bytes = record::encode_record(txn, NO_LSN, &LogRecord::Begin)?;
            let lsn = push(&mut st, bytes);
            st.att.insert(
                txn,
                TxnLogInfo {
                    first_lsn: lsn,
                    last_lsn: lsn,
                    undo_next_lsn: NO_LSN,
                    status: TxnStatus::Active,
                },
            );
            lsn
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// True when the transaction has an open log chain.
    pub fn has_chain(&self, txn: TxnId) -> bool {
        self.state.lock().unwrap().att.contains_key(&txn)
    }

    /// LSN of the transaction's most recent record, if it has a chain.
    pub fn chain_tail(&self, txn: TxnId) -> Option<Lsn> {
        self.state
            .lock()
            .unwrap()
            .att
            .get(&txn)
            .map(|info| info.last_lsn)
    }

    pub fn log_update(
        &self,
        txn: TxnId,
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn, WalError> {
        self.append_data(RecordKind::Update, txn, page_id, before_image, after_image)
    }

    pub fn log_insert(
        &self,
        txn: TxnId,
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn, WalError> {
        self.append_data(RecordKind::Insert, txn, page_id, before_image, after_image)
    }

    pub fn log_delete(
        &self,
        txn: TxnId,
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn, WalError> {
        self.append_data(RecordKind::Delete, txn, page_id, before_image, after_image)
    }

    fn append_data(
        &self,
        kind: RecordKind,
        txn: TxnId,
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    ) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let prev = st
                .att
                .get(&txn)
                .ok_or(WalError::UnknownTransaction(txn))?
                .last_lsn;
            let rec = record::data_record(kind, page_id, before_image, after_image);
            let bytes = record::encode_record(txn, prev, &rec)?;
            let lsn = push(&mut st, bytes);
            let entry = st.att.get_mut(&txn).unwrap();
            entry.last_lsn = lsn;
            entry.undo_next_lsn = lsn;
            st.dpt.entry(page_id).or_insert(lsn);
            lsn
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// Writes a compensation record on behalf of an aborting transaction
    /// and advances its chain. The CLR's `after_image` is the effect of
    /// the undo; `undo_next_lsn` names the next record to undo.
    pub fn log_clr(
        &self,
        txn: TxnId,
        page_id: PageId,
        after_image: Vec<u8>,
        undo_next_lsn: Lsn,
    ) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let prev = st
                .att
                .get(&txn)
                .ok_or(WalError::UnknownTransaction(txn))?
                .last_lsn;
            let rec = LogRecord::Clr {
                page_id,
                after_image,
                undo_next_lsn,
            };
            let bytes = record::encode_record(txn, prev, &rec)?;
            let lsn = push(&mut st, bytes);
            let entry = st.att.get_mut(&txn).unwrap();
            entry.last_lsn = lsn;
            entry.undo_next_lsn = undo_next_lsn;
            st.dpt.entry(page_id).or_insert(lsn);
            lsn
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// Appends the Commit record and forces it. Returns only after the
    /// record is durable (I2); concurrent committers share one fsync.
    pub fn log_commit(&self, txn: TxnId) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let prev = st
                .att
                .get(&txn)
                .ok_or(WalError::UnknownTransaction(txn))?
                .last_lsn;
            let bytes = record::encode_record(txn, prev, &LogRecord::Commit)?;
            let lsn = push(&mut st, bytes);
            let entry = st.att.get_mut(&txn).unwrap();
            entry.last_lsn = lsn;
            entry.status = TxnStatus::Committed;
            lsn
        };
        self.force(lsn)?;
        let mut st = self.state.lock().unwrap();
        st.att.remove(&txn);
        st.commits_since_checkpoint += 1;
        Ok(lsn)
    }

    /// Appends the Abort record that ends a rolled-back transaction. The
    /// caller has already undone the transaction's effects.
    pub fn log_abort(&self, txn: TxnId) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let prev = st
                .att
                .get(&txn)
                .ok_or(WalError::UnknownTransaction(txn))?
                .last_lsn;
            let bytes = record::encode_record(txn, prev, &LogRecord::Abort)?;
            let lsn = push(&mut st, bytes);
            st.att.remove(&txn);
            lsn
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// Abort entry point for the Undo phase: accepts a synthetic chain
    /// tail instead of consulting the runtime ATT.
    pub fn log_abort_during_recovery(&self, txn: TxnId, last_lsn: Lsn) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let bytes = record::encode_record(txn, last_lsn, &LogRecord::Abort)?;
            let lsn = push(&mut st, bytes);
            st.att.remove(&txn);
            lsn
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// Appends a CheckpointBegin record, fixing the snapshot start.
    pub fn write_checkpoint_begin(&self) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let bytes = record::encode_record(0, NO_LSN, &LogRecord::CheckpointBegin)?;
            push(&mut st, bytes)
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// Appends the CheckpointEnd record paired with `begin_lsn`.
    pub fn write_checkpoint_end(&self, begin_lsn: Lsn) -> Result<Lsn, WalError> {
        let lsn = {
            let mut st = self.state.lock().unwrap();
            let bytes = record::encode_record(0, begin_lsn, &LogRecord::CheckpointEnd)?;
            push(&mut st, bytes)
        };
        self.drain_if_full()?;
        Ok(lsn)
    }

    /// Makes every record with LSN ≤ `lsn` durable. `Lsn::MAX` forces
    /// everything written so far. fsync failures are durability-fatal.
    pub fn force(&self, lsn: Lsn) -> Result<(), WalError> {
        let mut st = self.state.lock().unwrap();
        loop {
            let target_end = if lsn == Lsn::MAX {
                st.end_lsn
            } else {
                (lsn + 1).min(st.end_lsn)
            };
            if self.durable_lsn.load(Ordering::Acquire) >= target_end {
                return Ok(());
            }
            if st.flushing {
                st = self.io_cv.wait(st).unwrap();
                continue;
            }

            st.flushing = true;
            let pending = std::mem::take(&mut st.buf);
            let file_off = WAL_FILE_HEADER_LEN as u64 + (st.buf_start_lsn - st.base_lsn);
            let sync_upto = st.end_lsn;
            st.buf_start_lsn = sync_upto;
            drop(st);

            let result = self.write_segment(file_off, &pending, true);

            st = self.state.lock().unwrap();
            st.flushing = false;
            self.io_cv.notify_all();
            result?;
            self.durable_lsn.store(sync_upto, Ordering::Release);
            self.sync_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reads the record at `lsn`, whether it is still buffered or already
    /// on disk. Used by the abort chain walk.
    pub fn read_record_at(&self, lsn: Lsn) -> Result<(FrameHeader, LogRecord), WalError> {
        let mut st = self.state.lock().unwrap();
        while st.flushing {
            st = self.io_cv.wait(st).unwrap();
        }
        if lsn >= st.buf_start_lsn {
            let off = (lsn - st.buf_start_lsn) as usize;
            if off >= st.buf.len() {
                return Err(WalError::CorruptRecord {
                    lsn,
                    source: ParseError::Truncated {
                        needed: FRAME_HEADER_LEN,
                        remaining: 0,
                    },
                });
            }
            let (header, rec, _) = record::decode_record(&st.buf[off..])
                .map_err(|source| WalError::CorruptRecord { lsn, source })?;
            return Ok((header, rec));
        }
        if lsn < st.base_lsn {
            return Err(WalError::CorruptRecord {
                lsn,
                source: ParseError::Malformed("lsn precedes the truncated log".to_string()),
            });
        }

        // Holding the state lock keeps flushes from starting while the
        // file is read.
        let file_off = WAL_FILE_HEADER_LEN as u64 + (lsn - st.base_lsn);
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(file_off))?;
        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        file.read_exact(&mut header_buf)?;
        let total_len = u32::from_le_bytes(header_buf[0..4].try_into().unwrap()) as usize;
        if !(FRAME_HEADER_LEN..=FRAME_HEADER_LEN + record::MAX_PAYLOAD_LEN).contains(&total_len) {
            return Err(WalError::CorruptRecord {
                lsn,
                source: ParseError::Malformed(format!("implausible record length {total_len}")),
            });
        }
        let mut frame = header_buf.to_vec();
        frame.resize(total_len, 0);
        file.read_exact(&mut frame[FRAME_HEADER_LEN..])?;
        let (header, rec, _) = record::decode_record(&frame)
            .map_err(|source| WalError::CorruptRecord { lsn, source })?;
        Ok((header, rec))
    }

    /// Snapshot of the runtime tables, taken under a short lock so
    /// checkpoints observe them cheaply while mutators continue.
    pub fn snapshot_tables(&self) -> (HashMap<TxnId, TxnLogInfo>, HashMap<PageId, Lsn>) {
        let st = self.state.lock().unwrap();
        (st.att.clone(), st.dpt.clone())
    }

    /// Replaces the runtime tables wholesale. Analysis installs the
    /// rebuilt ATT and DPT here so Undo and later flushes maintain the
    /// live tables directly.
    pub fn install_tables(
        &self,
        att: HashMap<TxnId, TxnLogInfo>,
        dpt: HashMap<PageId, Lsn>,
    ) {
        let mut st = self.state.lock().unwrap();
        st.att = att;
        st.dpt = dpt;
    }

    /// The page was flushed with the WAL rule satisfied; drop it from the
    /// DPT.
    pub fn page_flushed(&self, page_id: PageId) {
        self.state.lock().unwrap().dpt.remove(&page_id);
    }

    /// Marks a checkpoint complete: resets the commit trigger counter and
    /// remembers the CheckpointEnd LSN.
    pub fn note_checkpoint_complete(&self, end_lsn: Lsn) {
        let mut st = self.state.lock().unwrap();
        st.commits_since_checkpoint = 0;
        st.last_checkpoint_end = end_lsn;
    }

    /// Removes the log prefix below `new_base`, rewriting the file with a
    /// rebased header. LSNs are stable across this: they are decoupled
    /// from raw offsets by the persisted base. Appenders are held off for
    /// the duration.
    pub fn truncate_prefix(&self, new_base: Lsn) -> Result<u64, WalError> {
        let mut st = self.state.lock().unwrap();
        while st.flushing {
            st = self.io_cv.wait(st).unwrap();
        }
        if new_base <= st.base_lsn {
            return Ok(0);
        }
        assert!(
            new_base <= st.end_lsn,
            "truncation point {new_base} beyond end of log {}",
            st.end_lsn
        );

        // Drain the buffer so the file holds every record, then sync.
        let pending = std::mem::take(&mut st.buf);
        let file_off = WAL_FILE_HEADER_LEN as u64 + (st.buf_start_lsn - st.base_lsn);
        st.buf_start_lsn = st.end_lsn;
        {
            let mut file = self.file.lock().unwrap();
            if !pending.is_empty() {
                file.seek(SeekFrom::Start(file_off))?;
                file.write_all(&pending)?;
            }
            file.sync_data()?;
        }
        self.durable_lsn.store(st.end_lsn, Ordering::Release);
        self.sync_count.fetch_add(1, Ordering::Relaxed);

        let old_base = st.base_lsn;
        let mut suffix = Vec::new();
        {
            let mut file = self.file.lock().unwrap();
            file.seek(SeekFrom::Start(
                WAL_FILE_HEADER_LEN as u64 + (new_base - old_base),
            ))?;
            file.read_to_end(&mut suffix)?;
        }

        let tmp_path = self.path.with_extension("log.truncate.tmp");
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        write_file_header(&mut tmp, new_base)?;
        tmp.write_all(&suffix)?;
        tmp.sync_all()?;
        drop(tmp);

        std::fs::rename(&tmp_path, &self.path)?;

        let reopened = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        *self.file.lock().unwrap() = reopened;
        st.base_lsn = new_base;

        let removed = new_base - old_base;
        tracing::info!(new_base, removed, "truncated wal prefix");
        Ok(removed)
    }

    fn write_segment(&self, file_off: u64, bytes: &[u8], sync: bool) -> Result<(), WalError> {
        let mut file = self.file.lock().unwrap();
        if !bytes.is_empty() {
            file.seek(SeekFrom::Start(file_off))?;
            file.write_all(bytes)?;
        }
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Writes the buffer to the file (without fsync) once it exceeds the
    /// configured capacity.
    fn drain_if_full(&self) -> Result<(), WalError> {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.buf.len() < self.buffer_capacity {
                return Ok(());
            }
            if st.flushing {
                st = self.io_cv.wait(st).unwrap();
                continue;
            }
            st.flushing = true;
            let pending = std::mem::take(&mut st.buf);
            let file_off = WAL_FILE_HEADER_LEN as u64 + (st.buf_start_lsn - st.base_lsn);
            st.buf_start_lsn = st.end_lsn;
            drop(st);

            let result = self.write_segment(file_off, &pending, false);

            st = self.state.lock().unwrap();
            st.flushing = false;
            self.io_cv.notify_all();
            result?;
        }
    }
}

/// Reserves the next LSN and appends the encoded record to the buffer.
fn push(st: &mut MutexGuard<'_, WalState>, bytes: Vec<u8>) -> Lsn {
    let lsn = st.end_lsn;
    st.buf.extend_from_slice(&bytes);
    st.end_lsn += bytes.len() as u64;
    lsn
}

fn write_file_header(file: &mut File, base_lsn: Lsn) -> Result<(), WalError> {
    let mut header = [0u8; WAL_FILE_HEADER_LEN];
    header[0..4].copy_from_slice(&WAL_MAGIC);
    header[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&base_lsn.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header)?;
    Ok(())
}

/// Reads and validates the WAL file header, returning the base LSN.
pub fn read_base_lsn(file: &mut File) -> Result<Lsn, WalError> {
    let mut header = [0u8; WAL_FILE_HEADER_LEN];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut header)?;
    if header[0..4] != WAL_MAGIC {
        return Err(WalError::BadFileHeader);
    }
    let version = u16::from_le_bytes(header[4..6].try_into().unwrap());
    if version != WAL_FORMAT_VERSION {
        return Err(WalError::UnsupportedVersion(version));
    }
    Ok(u64::from_le_bytes(header[8..16].try_into().unwrap()))
}
