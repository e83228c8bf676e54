//! Write-ahead log
//!
//! The log is the sole source of truth for recovery. Records are appended
//! under a single lock that also assigns LSNs, so append order, LSN order and
//! replay order are the same thing. LSNs start at 1 and are gapless.
//!
//! Record format:
//! ```text
//! +--------+--------+-------------+---------+--------+
//! | LSN    | TxnID  | Kind|Length | Payload | CRC32C |
//! | 8B     | 8B     | 1B  | 3B    | var     | 4B     |
//! +--------+--------+-------------+---------+--------+
//! ```
//!
//! The kind lives in the top byte of the 4-byte length word. A checkpoint
//! marker uses the same frame: its TxnID field carries the transaction-id
//! high-water mark and its 8-byte payload carries the low-water LSN.

use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};
use xstore_common::config::SyncMode;
use xstore_common::{Error, Lsn, Result, TxnId};

#[cfg(test)]
use std::sync::atomic::AtomicU32;

/// Header size (lsn + txn_id + kind/length)
const RECORD_HEADER_SIZE: usize = 20;

/// Trailing CRC32C
const CHECKSUM_SIZE: usize = 4;

/// Bit position of the record kind inside the length word
const KIND_SHIFT: u32 = 24;

const LENGTH_MASK: u32 = (1 << KIND_SHIFT) - 1;

/// Largest payload a single record can carry
pub const MAX_PAYLOAD_SIZE: usize = LENGTH_MASK as usize;

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Record type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RecordKind {
    /// Opaque storage operation belonging to a transaction
    Operation = 1,
    /// Commit a transaction
    Commit = 2,
    /// Abort a transaction
    Abort = 3,
    /// Checkpoint marker
    Checkpoint = 4,
}

impl RecordKind {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Operation),
            2 => Some(Self::Commit),
            3 => Some(Self::Abort),
            4 => Some(Self::Checkpoint),
            _ => None,
        }
    }
}

/// A single log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub kind: RecordKind,
    pub payload: Bytes,
}

impl LogRecord {
    /// Create a new record
    pub fn new(lsn: Lsn, txn_id: TxnId, kind: RecordKind, payload: Bytes) -> Self {
        Self {
            lsn,
            txn_id,
            kind,
            payload,
        }
    }

    /// Serialize a record to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_size());

        // Payload length is checked by the writer before a record is built
        let length = (self.payload.len() as u32 & LENGTH_MASK) | (u32::from(self.kind as u8) << KIND_SHIFT);

        buf.extend_from_slice(&self.lsn.get().to_le_bytes());
        buf.extend_from_slice(&self.txn_id.get().to_le_bytes());
        buf.extend_from_slice(&length.to_le_bytes());
        buf.extend_from_slice(&self.payload);

        // CRC over everything before the CRC field
        let crc = crc32c::crc32c(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());

        buf
    }

    /// Parse a record from the front of `data`, returning it and its size
    pub fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < RECORD_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(Error::LogCorruption("record truncated".into()));
        }

        let lsn = read_u64(data, 0);
        let txn_id = read_u64(data, 8);
        let length = read_u32(data, 16);

        let kind = RecordKind::from_u8((length >> KIND_SHIFT) as u8)
            .ok_or_else(|| Error::LogCorruption(format!("invalid record kind at LSN {lsn}")))?;
        let payload_len = (length & LENGTH_MASK) as usize;

        let total_size = RECORD_HEADER_SIZE + payload_len + CHECKSUM_SIZE;
        if data.len() < total_size {
            return Err(Error::LogCorruption("record truncated".into()));
        }

        let stored_crc = read_u32(data, RECORD_HEADER_SIZE + payload_len);
        let computed_crc = crc32c::crc32c(&data[..RECORD_HEADER_SIZE + payload_len]);
        if computed_crc != stored_crc {
            return Err(Error::LogCorruption(format!("CRC mismatch at LSN {lsn}")));
        }
        if lsn == 0 {
            return Err(Error::LogCorruption("record with LSN 0".into()));
        }

        let payload = Bytes::copy_from_slice(&data[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + payload_len]);
        Ok((
            Self::new(Lsn::new(lsn), TxnId::new(txn_id), kind, payload),
            total_size,
        ))
    }

    /// Low-water LSN carried by a checkpoint marker
    pub fn low_water(&self) -> Option<Lsn> {
        if self.kind != RecordKind::Checkpoint || self.payload.len() != 8 {
            return None;
        }
        Some(Lsn::new(read_u64(&self.payload, 0)))
    }

    /// Get the serialized size of this record
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(buf)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[at..at + 4]);
    u32::from_le_bytes(buf)
}

/// Decode records until the first one that does not parse.
///
/// Returns the records and the number of bytes they cover.
fn decode_records(data: &[u8]) -> (Vec<LogRecord>, usize) {
    let mut records = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        match LogRecord::from_bytes(&data[offset..]) {
            Ok((record, size)) => {
                records.push(record);
                offset += size;
            }
            Err(_) => break,
        }
    }

    (records, offset)
}

/// Records must carry consecutive LSNs
fn check_continuity(records: &[LogRecord]) -> Result<()> {
    for pair in records.windows(2) {
        if pair[1].lsn != pair[0].lsn.next() {
            return Err(Error::LogCorruption(format!(
                "LSN gap: {} followed by {}",
                pair[0].lsn, pair[1].lsn
            )));
        }
    }
    Ok(())
}

/// Mutable writer state, guarded by one lock
struct LogWriter {
    out: BufWriter<File>,
    /// LSN the next record receives
    next_lsn: Lsn,
    /// LSN of the oldest record still in the file
    first_lsn: Lsn,
    /// File size in bytes
    size: u64,
}

impl LogWriter {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }
}

/// Side file being filled by a truncation
struct SideCopy {
    out: BufWriter<File>,
    new_path: PathBuf,
    /// Records below this LSN are dropped
    cut: Lsn,
    /// Bytes of the live log already copied
    copied_to: u64,
    first: Option<Lsn>,
    removed: usize,
    size: u64,
}

impl SideCopy {
    fn keep(&mut self, records: &[LogRecord]) -> Result<()> {
        for record in records {
            if record.lsn < self.cut {
                self.removed += 1;
                continue;
            }
            self.first.get_or_insert(record.lsn);
            let bytes = record.to_bytes();
            self.out.write_all(&bytes)?;
            self.size += bytes.len() as u64;
        }
        Ok(())
    }
}

/// Append-only write-ahead log
pub struct WriteAheadLog {
    path: PathBuf,
    writer: Mutex<LogWriter>,
    /// Serializes truncations, which copy the log outside the writer lock
    truncation: Mutex<()>,
    /// Highest LSN known to be on durable storage
    durable_lsn: AtomicU64,
    sync_mode: SyncMode,
    #[cfg(test)]
    failing_syncs: AtomicU32,
}

impl WriteAheadLog {
    /// Open the log at `path`, creating it if missing.
    ///
    /// A torn tail (a final record that does not parse) is cut off. An LSN
    /// gap between two valid records is reported as corruption.
    pub fn open(path: impl AsRef<Path>, sync_mode: SyncMode) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let (records, valid_len) = decode_records(&data);
        check_continuity(&records)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;

        if valid_len < data.len() {
            warn!(
                path = %path.display(),
                discarded = data.len() - valid_len,
                "truncating torn log tail"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let last_lsn = records.last().map_or(Lsn::ZERO, |r| r.lsn);
        let first_lsn = records.first().map_or(last_lsn.next(), |r| r.lsn);

        info!(
            path = %path.display(),
            records = records.len(),
            last_lsn = %last_lsn,
            "opened write-ahead log"
        );

        Ok(Self {
            path,
            writer: Mutex::new(LogWriter {
                out: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
                next_lsn: last_lsn.next(),
                first_lsn,
                size: valid_len as u64,
            }),
            truncation: Mutex::new(()),
            durable_lsn: AtomicU64::new(last_lsn.get()),
            sync_mode,
            #[cfg(test)]
            failing_syncs: AtomicU32::new(0),
        })
    }

    /// Append a record and return its LSN
    pub fn append(&self, txn_id: TxnId, kind: RecordKind, payload: Bytes) -> Result<Lsn> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(Error::internal(format!(
                "log payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE} byte limit",
                payload.len()
            )));
        }

        let mut writer = self.writer.lock();
        let lsn = writer.next_lsn;
        let bytes = LogRecord::new(lsn, txn_id, kind, payload).to_bytes();

        writer.out.write_all(&bytes)?;
        writer.next_lsn = lsn.next();
        writer.size += bytes.len() as u64;

        if self.sync_mode == SyncMode::Always {
            self.check_injected_failure()?;
            writer.flush_and_sync()?;
            self.durable_lsn.fetch_max(lsn.get(), Ordering::SeqCst);
        }

        Ok(lsn)
    }

    /// Append a checkpoint marker
    pub fn append_checkpoint(&self, txn_high_water: TxnId, low_water: Lsn) -> Result<Lsn> {
        let payload = Bytes::copy_from_slice(&low_water.get().to_le_bytes());
        self.append(txn_high_water, RecordKind::Checkpoint, payload)
    }

    /// Make every record up to `lsn` durable.
    ///
    /// Callers that arrive after another caller already synced past `lsn`
    /// return without touching the disk.
    pub fn sync_to(&self, lsn: Lsn) -> Result<()> {
        if self.sync_mode == SyncMode::Never {
            self.writer.lock().out.flush()?;
            return Ok(());
        }
        if self.durable_lsn() >= lsn {
            return Ok(());
        }

        let mut writer = self.writer.lock();
        if self.durable_lsn() >= lsn {
            return Ok(());
        }

        self.check_injected_failure()?;
        writer.flush_and_sync()?;

        let synced = writer.next_lsn.get() - 1;
        self.durable_lsn.fetch_max(synced, Ordering::SeqCst);
        debug!(durable_lsn = synced, "log synced");
        Ok(())
    }

    /// Force everything written so far to durable storage, whatever the sync mode
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        self.check_injected_failure()?;
        writer.flush_and_sync()?;
        let synced = writer.next_lsn.get() - 1;
        self.durable_lsn.fetch_max(synced, Ordering::SeqCst);
        Ok(())
    }

    /// Read every record currently in the log
    pub fn read_records(&self) -> Result<Vec<LogRecord>> {
        let mut writer = self.writer.lock();
        writer.out.flush()?;

        let data = std::fs::read(&self.path)?;
        let (records, valid_len) = decode_records(&data);
        if valid_len < data.len() {
            return Err(Error::LogCorruption(format!(
                "unreadable record at byte {valid_len} of {}",
                self.path.display()
            )));
        }
        check_continuity(&records)?;
        Ok(records)
    }

    /// Drop every record below `lsn`.
    ///
    /// Retained records are copied to a side file which then replaces the
    /// log atomically. The bulk of the copy runs without the writer lock;
    /// appends are held off only while the records written since are moved
    /// over and the files are swapped. Returns the number of records removed.
    pub fn truncate_before(&self, lsn: Lsn) -> Result<usize> {
        let _truncation = self.truncation.lock();
        match self.copy_retained_prefix(lsn)? {
            Some(copy) => self.swap_in(copy),
            None => Ok(0),
        }
    }

    /// Copy the retained part of everything written so far to the side file
    fn copy_retained_prefix(&self, cut: Lsn) -> Result<Option<SideCopy>> {
        let copied_to = {
            let mut writer = self.writer.lock();
            if cut <= writer.first_lsn {
                return Ok(None);
            }
            writer.out.flush()?;
            writer.size
        };

        let data = std::fs::read(&self.path)?;
        let prefix = usize::try_from(copied_to)
            .ok()
            .and_then(|end| data.get(..end))
            .ok_or_else(|| Error::LogCorruption(format!("{} shrank during truncation", self.path.display())))?;
        let (records, _) = decode_records(prefix);

        let new_path = self.path.with_extension("wal.new");
        let mut copy = SideCopy {
            out: BufWriter::with_capacity(WRITE_BUFFER_SIZE, File::create(&new_path)?),
            new_path,
            cut,
            copied_to,
            first: None,
            removed: 0,
            size: 0,
        };
        copy.keep(&records)?;
        copy.out.flush()?;
        copy.out.get_ref().sync_data()?;
        Ok(Some(copy))
    }

    /// Move records appended since the prefix copy, then replace the log
    fn swap_in(&self, mut copy: SideCopy) -> Result<usize> {
        let mut writer = self.writer.lock();
        writer.out.flush()?;

        let mut tail = Vec::new();
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(copy.copied_to))?;
        file.read_to_end(&mut tail)?;
        let (records, _) = decode_records(&tail);
        copy.keep(&records)?;
        copy.out.flush()?;
        copy.out.get_ref().sync_all()?;

        std::fs::rename(&copy.new_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        writer.out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        writer.first_lsn = copy.first.unwrap_or(writer.next_lsn);
        writer.size = copy.size;

        debug!(
            before = %copy.cut,
            removed = copy.removed,
            tail_records = records.len(),
            "truncated write-ahead log"
        );
        Ok(copy.removed)
    }

    /// LSN the next appended record will receive
    pub fn next_lsn(&self) -> Lsn {
        self.writer.lock().next_lsn
    }

    /// LSN of the most recently appended record
    pub fn last_lsn(&self) -> Lsn {
        Lsn::new(self.writer.lock().next_lsn.get() - 1)
    }

    /// LSN of the oldest record still in the log
    pub fn first_lsn(&self) -> Lsn {
        self.writer.lock().first_lsn
    }

    /// Highest LSN known to be durable
    pub fn durable_lsn(&self) -> Lsn {
        Lsn::new(self.durable_lsn.load(Ordering::SeqCst))
    }

    /// Current log size in bytes
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }

    /// Get the path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make the next `count` syncs fail with an I/O error
    #[cfg(test)]
    pub(crate) fn fail_next_syncs(&self, count: u32) {
        self.failing_syncs.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    fn check_injected_failure(&self) -> Result<()> {
        let injected = self
            .failing_syncs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::Io(std::io::Error::other("injected sync failure")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    #[allow(clippy::unnecessary_wraps, clippy::unused_self)]
    fn check_injected_failure(&self) -> Result<()> {
        Ok(())
    }
}
