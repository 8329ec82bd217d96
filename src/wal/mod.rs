// # Write-Ahead Log
//
// Append-only redo stream shared by every collection in a database
// directory. Each record is a fixed little-endian header
// `lsn(8) txn_id(8) type(1) length(4) crc(4)` followed by a MessagePack
// payload of `length` bytes. The CRC32 covers the first 21 header bytes
// plus the payload, so a torn header and a torn payload both stop the
// reader. The log ends at the first record that fails verification; an
// unclean tail is truncated on open with a warning, never an error.
//
// Durability contract: a transaction is durable once `sync` returns after
// its COMMIT record was appended.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DbError, Result};
use crate::storage::page::PageId;

pub type Lsn = u64;
pub type TxnId = u64;

/// Header bytes: lsn(8) + txn_id(8) + type(1) + length(4) + crc(4).
const HEADER_LEN: usize = 25;
/// Bytes of the header covered by the CRC (everything before the CRC field).
const CRC_COVERED: usize = 21;

const TYPE_BEGIN: u8 = 1;
const TYPE_INSERT: u8 = 2;
const TYPE_UPDATE: u8 = 3;
const TYPE_DELETE: u8 = 4;
const TYPE_COMMIT: u8 = 5;
const TYPE_ROLLBACK: u8 = 6;
const TYPE_CHECKPOINT: u8 = 7;

/// A redo record. Operation records carry the encoded post-image so replay
/// can reconstruct the heap byte-for-byte.
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Begin,
    Insert {
        collection: String,
        id: String,
        record: Vec<u8>,
    },
    Update {
        collection: String,
        id: String,
        old_version: u64,
        record: Vec<u8>,
    },
    Delete {
        collection: String,
        id: String,
    },
    Commit,
    Rollback,
    Checkpoint {
        lsn: Lsn,
        live_txns: Vec<TxnId>,
        durable_pages: Vec<PageId>,
    },
}

#[derive(Serialize, Deserialize)]
struct MutationPayload {
    collection: String,
    id: String,
    old_version: u64,
    record: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointPayload {
    lsn: Lsn,
    live_txns: Vec<TxnId>,
    durable_pages: Vec<PageId>,
}

impl WalRecord {
    fn type_tag(&self) -> u8 {
        match self {
            WalRecord::Begin => TYPE_BEGIN,
            WalRecord::Insert { .. } => TYPE_INSERT,
            WalRecord::Update { .. } => TYPE_UPDATE,
            WalRecord::Delete { .. } => TYPE_DELETE,
            WalRecord::Commit => TYPE_COMMIT,
            WalRecord::Rollback => TYPE_ROLLBACK,
            WalRecord::Checkpoint { .. } => TYPE_CHECKPOINT,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        Ok(match self {
            WalRecord::Begin | WalRecord::Commit | WalRecord::Rollback => Vec::new(),
            WalRecord::Insert {
                collection,
                id,
                record,
            } => rmp_serde::to_vec(&MutationPayload {
                collection: collection.clone(),
                id: id.clone(),
                old_version: 0,
                record: record.clone(),
            })?,
            WalRecord::Update {
                collection,
                id,
                old_version,
                record,
            } => rmp_serde::to_vec(&MutationPayload {
                collection: collection.clone(),
                id: id.clone(),
                old_version: *old_version,
                record: record.clone(),
            })?,
            WalRecord::Delete { collection, id } => rmp_serde::to_vec(&MutationPayload {
                collection: collection.clone(),
                id: id.clone(),
                old_version: 0,
                record: Vec::new(),
            })?,
            WalRecord::Checkpoint {
                lsn,
                live_txns,
                durable_pages,
            } => rmp_serde::to_vec(&CheckpointPayload {
                lsn: *lsn,
                live_txns: live_txns.clone(),
                durable_pages: durable_pages.clone(),
            })?,
        })
    }

    fn decode(tag: u8, payload: &[u8]) -> Result<Self> {
        Ok(match tag {
            TYPE_BEGIN => WalRecord::Begin,
            TYPE_COMMIT => WalRecord::Commit,
            TYPE_ROLLBACK => WalRecord::Rollback,
            TYPE_INSERT => {
                let p: MutationPayload = rmp_serde::from_slice(payload)?;
                WalRecord::Insert {
                    collection: p.collection,
                    id: p.id,
                    record: p.record,
                }
            }
            TYPE_UPDATE => {
                let p: MutationPayload = rmp_serde::from_slice(payload)?;
                WalRecord::Update {
                    collection: p.collection,
                    id: p.id,
                    old_version: p.old_version,
                    record: p.record,
                }
            }
            TYPE_DELETE => {
                let p: MutationPayload = rmp_serde::from_slice(payload)?;
                WalRecord::Delete {
                    collection: p.collection,
                    id: p.id,
                }
            }
            TYPE_CHECKPOINT => {
                let p: CheckpointPayload = rmp_serde::from_slice(payload)?;
                WalRecord::Checkpoint {
                    lsn: p.lsn,
                    live_txns: p.live_txns,
                    durable_pages: p.durable_pages,
                }
            }
            other => {
                return Err(DbError::WalCorruption(format!(
                    "unknown record type {other}"
                )))
            }
        })
    }
}

/// One verified log record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub record: WalRecord,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub appends: u64,
    pub bytes: u64,
    pub fsyncs: u64,
    pub truncations: u64,
}

struct WalInner {
    file: File,
    next_lsn: Lsn,
}

pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
    stats: RwLock<WalStats>,
}

impl Wal {
    /// Open (or create) the log, scan it to find the durable tail and the
    /// next LSN, and truncate anything past the tail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let (entries, valid_len, truncated) = scan(&mut file)?;
        let next_lsn = entries.last().map(|e| e.lsn + 1).unwrap_or(1);

        let mut stats = WalStats::default();
        if truncated {
            warn!(
                path = %path.display(),
                valid_len,
                "WAL tail is malformed; truncating to last good record"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
            stats.truncations = 1;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            inner: Mutex::new(WalInner { file, next_lsn }),
            stats: RwLock::new(stats),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; returns its LSN. Not synced: call `sync` (or use
    /// `append_sync`) to establish durability.
    pub fn append(&self, txn_id: TxnId, record: &WalRecord) -> Result<Lsn> {
        let payload = record.encode_payload()?;
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
        buf.extend_from_slice(&lsn.to_le_bytes());
        buf.extend_from_slice(&txn_id.to_le_bytes());
        buf.push(record.type_tag());
        buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&buf[..CRC_COVERED]);
        hasher.update(&payload);
        buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        buf.extend_from_slice(&payload);

        inner.file.write_all(&buf)?;
        drop(inner);

        let mut stats = self.stats.write();
        stats.appends += 1;
        stats.bytes += (HEADER_LEN + payload.len()) as u64;
        Ok(lsn)
    }

    /// Force appended records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().file.sync_all()?;
        self.stats.write().fsyncs += 1;
        Ok(())
    }

    pub fn append_sync(&self, txn_id: TxnId, record: &WalRecord) -> Result<Lsn> {
        let lsn = self.append(txn_id, record)?;
        self.sync()?;
        Ok(lsn)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Read every verified record from the start of the log.
    pub fn records(&self) -> Result<Vec<WalEntry>> {
        let mut inner = self.inner.lock();
        let (entries, _, _) = scan(&mut inner.file)?;
        inner.file.seek(SeekFrom::End(0))?;
        Ok(entries)
    }

    /// Drop everything and start over with a single CHECKPOINT record.
    /// Used on clean close, when earlier records are no longer needed.
    pub fn reset_with_checkpoint(
        &self,
        live_txns: Vec<TxnId>,
        durable_pages: Vec<PageId>,
    ) -> Result<Lsn> {
        {
            let mut inner = self.inner.lock();
            inner.file.set_len(0)?;
            inner.file.seek(SeekFrom::Start(0))?;
        }
        let lsn = {
            let lsn = self.next_lsn();
            self.append(
                0,
                &WalRecord::Checkpoint {
                    lsn,
                    live_txns,
                    durable_pages,
                },
            )?
        };
        self.sync()?;
        debug!(lsn, "WAL reset to checkpoint");
        Ok(lsn)
    }

    pub fn stats(&self) -> WalStats {
        *self.stats.read()
    }
}

/// Forward scan: verified entries, the byte length of the valid prefix, and
/// whether a malformed tail was found.
fn scan(file: &mut File) -> Result<(Vec<WalEntry>, u64, bool)> {
    file.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + HEADER_LEN <= data.len() {
        let header = &data[pos..pos + HEADER_LEN];
        let lsn = u64::from_le_bytes(header[0..8].try_into().unwrap());
        let txn_id = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let tag = header[16];
        let length = u32::from_le_bytes(header[17..21].try_into().unwrap()) as usize;
        let stored_crc = u32::from_le_bytes(header[21..25].try_into().unwrap());

        let payload_start = pos + HEADER_LEN;
        if payload_start + length > data.len() {
            return Ok((entries, pos as u64, true));
        }
        let payload = &data[payload_start..payload_start + length];

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&header[..CRC_COVERED]);
        hasher.update(payload);
        if hasher.finalize() != stored_crc {
            return Ok((entries, pos as u64, true));
        }

        let record = match WalRecord::decode(tag, payload) {
            Ok(r) => r,
            Err(_) => return Ok((entries, pos as u64, true)),
        };
        entries.push(WalEntry {
            lsn,
            txn_id,
            record,
        });
        pos = payload_start + length;
    }

    let truncated = pos != data.len();
    Ok((entries, pos as u64, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_back() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();

        let l1 = wal.append(1, &WalRecord::Begin).unwrap();
        let l2 = wal
            .append(
                1,
                &WalRecord::Insert {
                    collection: "users".to_string(),
                    id: "a".to_string(),
                    record: vec![1, 2, 3],
                },
            )
            .unwrap();
        wal.append_sync(1, &WalRecord::Commit).unwrap();

        let entries = wal.records().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].lsn, l1);
        assert_eq!(entries[1].lsn, l2);
        assert_eq!(
            entries[1].record,
            WalRecord::Insert {
                collection: "users".to_string(),
                id: "a".to_string(),
                record: vec![1, 2, 3],
            }
        );
        assert_eq!(entries[2].record, WalRecord::Commit);
    }

    #[test]
    fn test_lsn_continues_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append_sync(1, &WalRecord::Begin).unwrap();
        }
        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.next_lsn(), 2);
    }

    #[test]
    fn test_torn_tail_is_truncated_on_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(7, &WalRecord::Begin).unwrap();
            wal.append_sync(7, &WalRecord::Commit).unwrap();
        }

        // Simulate a torn write: half a header at the tail.
        let mut raw = std::fs::read(&path).unwrap();
        let good_len = raw.len();
        raw.extend_from_slice(&[0xAB; 10]);
        std::fs::write(&path, raw).unwrap();

        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.records().unwrap().len(), 2);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len as u64);
    }

    #[test]
    fn test_reader_stops_at_corrupt_record() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("wal.log");
        let first_len;
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(1, &WalRecord::Begin).unwrap();
            first_len = std::fs::metadata(&path).unwrap().len();
            wal.append(
                1,
                &WalRecord::Delete {
                    collection: "c".to_string(),
                    id: "x".to_string(),
                },
            )
            .unwrap();
            wal.append_sync(1, &WalRecord::Commit).unwrap();
        }

        // Corrupt the second record's payload; it and everything after are
        // dropped.
        let mut raw = std::fs::read(&path).unwrap();
        raw[first_len as usize + HEADER_LEN] ^= 0xFF;
        std::fs::write(&path, raw).unwrap();

        let wal = Wal::open(&path).unwrap();
        let entries = wal.records().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].record, WalRecord::Begin);
    }

    #[test]
    fn test_reset_with_checkpoint() {
        let dir = tempdir().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        for _ in 0..10 {
            wal.append(1, &WalRecord::Begin).unwrap();
        }
        wal.reset_with_checkpoint(vec![], vec![1, 2]).unwrap();

        let entries = wal.records().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(matches!(
            entries[0].record,
            WalRecord::Checkpoint { ref durable_pages, .. } if durable_pages == &vec![1, 2]
        ));
    }
}
