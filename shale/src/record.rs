//! The log record codec.
//!
//! Every record on disk is a self-delimiting frame:
//! `[total_len: u32][kind: u8][txn_id: u64][prev_lsn: u64][crc: u32]`
//! (little-endian) followed by a bincode payload. The CRC covers the
//! payload only; the length prefix lets readers skip variants they cannot
//! parse. A record's LSN is not stored in the frame: it equals the
//! record's position in the LSN space assigned by the writer.

use crate::error::{ParseError, WalError};
use crate::{Lsn, PageId, TxnId};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

/// Size of the frame header preceding every payload.
pub const FRAME_HEADER_LEN: usize = 4 + 1 + 8 + 8 + 4;

/// Upper bound on a single record's payload.
pub const MAX_PAYLOAD_LEN: usize = 1 << 20;

/// Discriminant stored in the frame so readers can classify a record
/// without decoding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    Begin = 0,
    Update = 1,
    Insert = 2,
    Delete = 3,
    Commit = 4,
    Abort = 5,
    CheckpointBegin = 6,
    CheckpointEnd = 7,
    Clr = 8,
}

impl RecordKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Begin,
            1 => Self::Update,
            2 => Self::Insert,
            3 => Self::Delete,
            4 => Self::Commit,
            5 => Self::Abort,
            6 => Self::CheckpointBegin,
            7 => Self::CheckpointEnd,
            8 => Self::Clr,
            _ => return None,
        })
    }
}

/// A single record in the WAL. Transaction id and backward chain pointer
/// live in the frame header, not here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// A transaction wrote its first mutation.
    Begin,
    /// A page range was overwritten; both images are logged.
    Update {
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    },
    /// A record was added to a page.
    Insert {
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    },
    /// A record was removed from a page.
    Delete {
        page_id: PageId,
        before_image: Vec<u8>,
        after_image: Vec<u8>,
    },
    /// The transaction's effects are durable once this record is forced.
    Commit,
    /// All of the transaction's effects have been undone.
    Abort,
    /// Marks the start of a fuzzy checkpoint snapshot.
    CheckpointBegin,
    /// Completes the checkpoint whose Begin is named by `prev_lsn`.
    CheckpointEnd,
    /// Compensation record written during undo. Redo-only, never undone;
    /// `undo_next_lsn` is the next record to undo for the aborting
    /// transaction.
    Clr {
        page_id: PageId,
        after_image: Vec<u8>,
        undo_next_lsn: Lsn,
    },
}

impl LogRecord {
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Begin => RecordKind::Begin,
            LogRecord::Update { .. } => RecordKind::Update,
            LogRecord::Insert { .. } => RecordKind::Insert,
            LogRecord::Delete { .. } => RecordKind::Delete,
            LogRecord::Commit => RecordKind::Commit,
            LogRecord::Abort => RecordKind::Abort,
            LogRecord::CheckpointBegin => RecordKind::CheckpointBegin,
            LogRecord::CheckpointEnd => RecordKind::CheckpointEnd,
            LogRecord::Clr { .. } => RecordKind::Clr,
        }
    }

    /// The page a data or compensation record touches.
    pub fn page_id(&self) -> Option<PageId> {
        match self {
            LogRecord::Update { page_id, .. }
            | LogRecord::Insert { page_id, .. }
            | LogRecord::Delete { page_id, .. }
            | LogRecord::Clr { page_id, .. } => Some(*page_id),
            _ => None,
        }
    }

    /// True for Update, Insert, and Delete.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            LogRecord::Update { .. } | LogRecord::Insert { .. } | LogRecord::Delete { .. }
        )
    }
}

/// Frame header for a serialized record.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    /// Total length of the record including this header.
    pub total_len: u32,
    /// Raw kind tag.
    pub kind: u8,
    /// Owning transaction, or 0 for checkpoint records.
    pub txn_id: TxnId,
    /// The transaction's previous record, forming a per-txn backward
    /// chain. 0 for the first.
    pub prev_lsn: Lsn,
    /// CRC-32 of the payload.
    pub crc: u32,
}

impl FrameHeader {
    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.total_len.to_le_bytes());
        out.push(self.kind);
        out.extend_from_slice(&self.txn_id.to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.to_le_bytes());
        out.extend_from_slice(&self.crc.to_le_bytes());
    }

    fn read_from(buf: &[u8]) -> Result<Self, ParseError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Err(ParseError::Truncated {
                needed: FRAME_HEADER_LEN,
                remaining: buf.len(),
            });
        }
        let total_len = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let kind = buf[4];
        let txn_id = u64::from_le_bytes(buf[5..13].try_into().unwrap());
        let prev_lsn = u64::from_le_bytes(buf[13..21].try_into().unwrap());
        let crc = u32::from_le_bytes(buf[21..25].try_into().unwrap());
        Ok(Self {
            total_len,
            kind,
            txn_id,
            prev_lsn,
            crc,
        })
    }
}

/// Serializes a record into its framed on-disk form.
pub fn encode_record(
    txn_id: TxnId,
    prev_lsn: Lsn,
    record: &LogRecord,
) -> Result<Vec<u8>, WalError> {
    let payload = bincode::serialize(record).map_err(|e| WalError::Serialize(e.to_string()))?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WalError::RecordTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    let header = FrameHeader {
        total_len: (FRAME_HEADER_LEN + payload.len()) as u32,
        kind: record.kind() as u8,
        txn_id,
        prev_lsn,
        crc,
    };

    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    header.write_to(&mut out);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Parses one framed record from the front of `buf`. Returns the header,
/// the record, and the number of bytes consumed.
pub fn decode_record(buf: &[u8]) -> Result<(FrameHeader, LogRecord, usize), ParseError> {
    let header = FrameHeader::read_from(buf)?;
    let total_len = header.total_len as usize;

    if total_len < FRAME_HEADER_LEN || total_len > FRAME_HEADER_LEN + MAX_PAYLOAD_LEN {
        return Err(ParseError::Malformed(format!(
            "implausible record length {total_len}"
        )));
    }
    if buf.len() < total_len {
        return Err(ParseError::Truncated {
            needed: total_len,
            remaining: buf.len(),
        });
    }

    let payload = &buf[FRAME_HEADER_LEN..total_len];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let computed = hasher.finalize();
    if computed != header.crc {
        return Err(ParseError::Checksum {
            stored: header.crc,
            computed,
        });
    }

    let Some(kind) = RecordKind::from_u8(header.kind) else {
        return Err(ParseError::UnknownKind(header.kind));
    };

    let record: LogRecord =
        bincode::deserialize(payload).map_err(|e| ParseError::Malformed(e.to_string()))?;
    if record.kind() != kind {
        return Err(ParseError::Malformed(format!(
            "frame kind {:?} disagrees with payload kind {:?}",
            kind,
            record.kind()
        )));
    }

    Ok((header, record, total_len))
}

/// Convenience constructor for data records.
pub fn data_record(
    kind: RecordKind,
    page_id: PageId,
    before_image: Vec<u8>,
    after_image: Vec<u8>,
) -> LogRecord {
    match kind {
        RecordKind::Update => LogRecord::Update {
            page_id,
            before_image,
            after_image,
        },
        RecordKind::Insert => LogRecord::Insert {
            page_id,
            before_image,
            after_image,
        },
        RecordKind::Delete => LogRecord::Delete {
            page_id,
            before_image,
            after_image,
        },
        _ => unreachable!("not a data record kind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(txn_id: TxnId, prev_lsn: Lsn, record: LogRecord) {
        let bytes = encode_record(txn_id, prev_lsn, &record).unwrap();
        let (header, decoded, consumed) = decode_record(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(header.txn_id, txn_id);
        assert_eq!(header.prev_lsn, prev_lsn);
        assert_eq!(header.kind, record.kind() as u8);
        assert_eq!(decoded, record);
    }

    #[test]
    fn roundtrip_every_kind_with_varied_payloads() {
        let page = PageId::new(3, 17);
        for len in [0usize, 1, 7, 256, 4096] {
            let before: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let after: Vec<u8> = (0..len).map(|i| (i % 13) as u8).collect();

            roundtrip(1, 0, LogRecord::Begin);
            roundtrip(
                1,
                100,
                LogRecord::Update {
                    page_id: page,
                    before_image: before.clone(),
                    after_image: after.clone(),
                },
            );
            roundtrip(
                2,
                100,
                LogRecord::Insert {
                    page_id: page,
                    before_image: before.clone(),
                    after_image: after.clone(),
                },
            );
            roundtrip(
                3,
                200,
                LogRecord::Delete {
                    page_id: page,
                    before_image: before.clone(),
                    after_image: after.clone(),
                },
            );
            roundtrip(4, 300, LogRecord::Commit);
            roundtrip(5, 400, LogRecord::Abort);
            roundtrip(0, 0, LogRecord::CheckpointBegin);
            roundtrip(0, 500, LogRecord::CheckpointEnd);
            roundtrip(
                6,
                600,
                LogRecord::Clr {
                    page_id: page,
                    after_image: after.clone(),
                    undo_next_lsn: 42,
                },
            );
        }
    }

    #[test]
    fn truncated_frame_is_reported() {
        let bytes = encode_record(1, 0, &LogRecord::Commit).unwrap();
        let err = decode_record(&bytes[..FRAME_HEADER_LEN - 3]).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));

        let err = decode_record(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, ParseError::Truncated { .. }));
    }

    #[test]
    fn corrupt_payload_fails_checksum() {
        let mut bytes = encode_record(
            7,
            10,
            &LogRecord::Update {
                page_id: PageId::new(1, 1),
                before_image: vec![1, 2, 3],
                after_image: vec![4, 5, 6],
            },
        )
        .unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        let err = decode_record(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::Checksum { .. }));
    }

    #[test]
    fn unknown_kind_is_distinguished_from_malformed() {
        let mut bytes = encode_record(1, 0, &LogRecord::Commit).unwrap();
        bytes[4] = 200;
        let err = decode_record(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::UnknownKind(200)));
    }

    #[test]
    fn frame_kind_must_match_payload() {
        let mut bytes = encode_record(1, 0, &LogRecord::Commit).unwrap();
        bytes[4] = RecordKind::Abort as u8;
        let err = decode_record(&bytes).unwrap_err();
        assert!(matches!(err, ParseError::Malformed(_)));
    }

    #[test]
    fn oversized_payload_is_refused() {
        let record = LogRecord::Update {
            page_id: PageId::new(1, 1),
            before_image: vec![0; MAX_PAYLOAD_LEN],
            after_image: vec![0; 16],
        };
        let err = encode_record(1, 0, &record).unwrap_err();
        assert!(matches!(err, WalError::RecordTooLarge { .. }));
    }
}
