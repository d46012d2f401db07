//! The append-only operation log.
//!
//! Records describe transaction lifecycle and key/value mutations over the
//! abstract model the recovery manager replays. Each record is framed by a
//! CRC-checked header so torn tails are detected on read.

use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::txn::TxnId;

/// A log sequence number: the byte offset of a record in the log file.
pub type Lsn = u64;

pub const INVALID_LSN: Lsn = Lsn::MAX;

const RECORD_HEADER_SIZE: usize = 20;

/// A single record in the log.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum LogRecord {
    Begin {
        txn_id: TxnId,
    },
    Commit {
        txn_id: TxnId,
    },
    Abort {
        txn_id: TxnId,
    },
    Insert {
        txn_id: TxnId,
        key: String,
        value: i32,
    },
    Delete {
        txn_id: TxnId,
        key: String,
        value: i32,
    },
    Update {
        txn_id: TxnId,
        key: String,
        old_value: i32,
        new_value: i32,
    },
}

impl LogRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            LogRecord::Begin { txn_id }
            | LogRecord::Commit { txn_id }
            | LogRecord::Abort { txn_id }
            | LogRecord::Insert { txn_id, .. }
            | LogRecord::Delete { txn_id, .. }
            | LogRecord::Update { txn_id, .. } => *txn_id,
        }
    }
}

/// Appends framed records to the log file and reads them back for
/// recovery.
pub struct LogManager {
    file: File,
    #[allow(dead_code)]
    path: PathBuf,
    next_lsn: Lsn,
}

impl LogManager {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<LogManager> {
        let path_buf = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path_buf)?;
        let next_lsn = file.metadata()?.len();
        Ok(LogManager {
            file,
            path: path_buf,
            next_lsn,
        })
    }

    /// Appends one record, chaining it to the transaction's previous record
    /// through `prev_lsn`. Returns the record's LSN.
    pub fn append(&mut self, prev_lsn: Lsn, record: &LogRecord) -> io::Result<Lsn> {
        let payload = bincode::serialize(record)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let lsn = self.next_lsn;
        let total_len = (RECORD_HEADER_SIZE + payload.len()) as u32;
        self.file.seek(SeekFrom::Start(lsn))?;
        self.file.write_all(&total_len.to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&prev_lsn.to_le_bytes())?;
        self.file.write_all(&record.txn_id().to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.sync_all()?;
        self.next_lsn += total_len as u64;
        Ok(lsn)
    }

    /// Reads the record at `lsn`, verifying its checksum. Returns the
    /// record and the LSN of the next record.
    pub fn read_record(&mut self, lsn: Lsn) -> io::Result<Option<(LogRecord, Lsn)>> {
        if lsn >= self.next_lsn {
            return Ok(None);
        }
        self.file.seek(SeekFrom::Start(lsn))?;
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.file.read_exact(&mut header)?;
        let total_len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if total_len < RECORD_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log record shorter than its header",
            ));
        }

        let mut payload = vec![0u8; total_len - RECORD_HEADER_SIZE];
        self.file.read_exact(&mut payload)?;
        let mut hasher = Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "log record CRC mismatch",
            ));
        }
        let record = bincode::deserialize(&payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        Ok(Some((record, lsn + total_len as u64)))
    }

    /// Replays the whole log in order.
    pub fn scan(&mut self) -> io::Result<Vec<(Lsn, LogRecord)>> {
        let mut records = Vec::new();
        let mut at = 0;
        while let Some((record, next)) = self.read_record(at)? {
            records.push((at, record));
            at = next;
        }
        Ok(records)
    }

    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn
    }
}
