//! Forward scans over the serialized log stream.
//!
//! Readers are independent of the writer: each opens its own file handle
//! and carries its own cursor, so any number may scan concurrently.

use crate::error::WalError;
use crate::record::{self, FrameHeader, LogRecord, FRAME_HEADER_LEN};
use crate::wal::{read_base_lsn, WAL_FILE_HEADER_LEN};
use crate::{Lsn, NO_LSN};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// One record pulled off the log, with the LSN the writer assigned it.
#[derive(Debug, Clone)]
pub struct SequencedRecord {
    pub lsn: Lsn,
    pub header: FrameHeader,
    pub record: LogRecord,
}

/// A stateful cursor over the WAL.
pub struct LogReader {
    file: File,
    base_lsn: Lsn,
    /// LSN of the next record to read.
    cursor: Lsn,
    /// LSN one past the last byte in the file.
    end_lsn: Lsn,
    /// Records below this LSN are known durable (a completed checkpoint
    /// covers them); a parse failure there is fatal rather than a torn
    /// tail.
    trusted_limit: Lsn,
}

impl LogReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let mut file = File::open(path)?;
        let base_lsn = read_base_lsn(&mut file)?;
        let len = file.metadata()?.len();
        let payload_len = len.saturating_sub(WAL_FILE_HEADER_LEN as u64);
        Ok(Self {
            file,
            base_lsn,
            cursor: base_lsn,
            end_lsn: base_lsn + payload_len,
            trusted_limit: NO_LSN,
        })
    }

    pub fn base_lsn(&self) -> Lsn {
        self.base_lsn
    }

    /// Marks the prefix up to `lsn` (exclusive) as known-durable: parse
    /// failures below it refuse the scan instead of ending it.
    pub fn set_trusted_limit(&mut self, lsn: Lsn) {
        self.trusted_limit = lsn;
    }

    /// LSN of the next record the cursor would read.
    pub fn position(&self) -> Lsn {
        self.cursor
    }

    /// Positions the cursor at `lsn`, which must be a record boundary.
    pub fn seek_to(&mut self, lsn: Lsn) -> Result<(), WalError> {
        if lsn < self.base_lsn {
            return Err(WalError::CorruptRecord {
                lsn,
                source: crate::error::ParseError::Malformed(
                    "lsn precedes the truncated log".to_string(),
                ),
            });
        }
        self.cursor = lsn;
        Ok(())
    }

    /// Reads the record under the cursor and advances past it. Returns
    /// `None` at end-of-log; a torn or corrupt record beyond the trusted
    /// limit is also end-of-log.
    pub fn read_next(&mut self) -> Result<Option<SequencedRecord>, WalError> {
        if self.cursor >= self.end_lsn {
            return Ok(None);
        }
        let lsn = self.cursor;
        let available = (self.end_lsn - lsn) as usize;

        let header_len = FRAME_HEADER_LEN.min(available);
        let mut frame = vec![0u8; header_len];
        self.file.seek(SeekFrom::Start(
            WAL_FILE_HEADER_LEN as u64 + (lsn - self.base_lsn),
        ))?;
        self.file.read_exact(&mut frame)?;

        // Grow the frame to the declared length when the header parsed.
        if header_len == FRAME_HEADER_LEN {
            let total_len = u32::from_le_bytes(frame[0..4].try_into().unwrap()) as usize;
            if (FRAME_HEADER_LEN..=FRAME_HEADER_LEN + record::MAX_PAYLOAD_LEN)
                .contains(&total_len)
                && total_len <= available
            {
                frame.resize(total_len, 0);
                self.file.read_exact(&mut frame[FRAME_HEADER_LEN..])?;
            }
        }

        match record::decode_record(&frame) {
            Ok((header, record, consumed)) => {
                self.cursor = lsn + consumed as u64;
                Ok(Some(SequencedRecord {
                    lsn,
                    header,
                    record,
                }))
            }
            Err(source) => {
                if lsn < self.trusted_limit {
                    Err(WalError::CorruptRecord { lsn, source })
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalWriter;
    use crate::PageId;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn scans_records_in_lsn_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = WalWriter::open(&path, 4096).unwrap();

        let begin = wal.log_begin(1).unwrap();
        let update = wal
            .log_update(1, PageId::new(1, 2), vec![1], vec![2])
            .unwrap();
        let commit = wal.log_commit(1).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        let lsns: Vec<Lsn> = std::iter::from_fn(|| reader.read_next().unwrap())
            .map(|r| r.lsn)
            .collect();
        assert_eq!(lsns, vec![begin, update, commit]);
    }

    #[test]
    fn positioned_scan_starts_mid_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = WalWriter::open(&path, 4096).unwrap();

        wal.log_begin(1).unwrap();
        let update = wal
            .log_update(1, PageId::new(1, 2), vec![1], vec![2])
            .unwrap();
        wal.log_commit(1).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        reader.seek_to(update).unwrap();
        let rec = reader.read_next().unwrap().unwrap();
        assert_eq!(rec.lsn, update);
        assert_eq!(rec.record.page_id(), Some(PageId::new(1, 2)));
    }

    #[test]
    fn torn_tail_reads_as_end_of_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = WalWriter::open(&path, 4096).unwrap();
        wal.log_begin(1).unwrap();
        wal.log_commit(1).unwrap();
        drop(wal);

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap();
        file.write_all(&[7u8; 11]).unwrap();
        drop(file);

        let mut reader = LogReader::open(&path).unwrap();
        assert!(reader.read_next().unwrap().is_some()); // Begin
        assert!(reader.read_next().unwrap().is_some()); // Commit
        assert!(reader.read_next().unwrap().is_none()); // torn tail
    }

    #[test]
    fn corruption_inside_trusted_prefix_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let wal = WalWriter::open(&path, 4096).unwrap();
        wal.log_begin(1).unwrap();
        let commit = wal.log_commit(1).unwrap();
        let end = wal.end_lsn();
        drop(wal);

        // Flip a payload byte of the commit record.
        let mut bytes = std::fs::read(&path).unwrap();
        let off = WAL_FILE_HEADER_LEN + commit as usize + FRAME_HEADER_LEN;
        bytes[off] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let mut reader = LogReader::open(&path).unwrap();
        reader.set_trusted_limit(end);
        assert!(reader.read_next().unwrap().is_some()); // Begin still parses
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, WalError::CorruptRecord { .. }));

        // The same bytes without a trusted prefix read as a short log.
        let mut lenient = LogReader::open(&path).unwrap();
        assert!(lenient.read_next().unwrap().is_some());
        assert!(lenient.read_next().unwrap().is_none());
    }
}
