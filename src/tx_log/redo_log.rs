//! The shared redo log (C6): an append-only record stream carrying every
//! logical mutation, rotated across `<base>.redo.<sequence>` segment
//! files.
//!
//! Segment file format:
//! ```text
//! 0   8  magic
//! 8   8  global position of the first record byte
//! 16  …  records
//! ```
//! A record is `(op byte, varint txn id, …)`; a cleanly finished segment
//! ends with an END record carrying the CRC32C of everything since the
//! segment header. Recovery verifies the CRC on finished segments and,
//! on the live tail, stops at the first malformed record, so a torn
//! write at the end of the stream truncates cleanly.
//!
//! Positions are global byte offsets across all segments, so the header
//! field `redo_log_position` survives rotation.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;

use bytes::{BufMut, BytesMut};
use log::{debug, info, warn};

use crate::config::DurabilityMode;
use crate::error::SmallError;
use crate::io::{SmallReader, SmallWriter};
use crate::types::{IndexId, OwnerId, SmallResult};

/// "smredo01" little-endian.
const SEGMENT_MAGIC: u64 = 0x3130_6f64_6572_6d73;
const SEGMENT_HEADER_LEN: u64 = 16;

const OP_STORE: u8 = 1;
const OP_DELETE: u8 = 2;
const OP_TXN_BEGIN: u8 = 3;
const OP_TXN_ROLLBACK: u8 = 4;
const OP_TXN_COMMIT: u8 = 5;
const OP_TXN_PREPARE: u8 = 6;
const OP_CHECKPOINT: u8 = 7;
const OP_END: u8 = 0xEE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedoRecord {
    Store {
        txn_id: OwnerId,
        index_id: IndexId,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        txn_id: OwnerId,
        index_id: IndexId,
        key: Vec<u8>,
    },
    TxnBegin {
        txn_id: OwnerId,
    },
    TxnRollback {
        txn_id: OwnerId,
    },
    TxnCommit {
        txn_id: OwnerId,
    },
    TxnPrepare {
        txn_id: OwnerId,
        handler_id: u32,
    },
    Checkpoint {
        sequence: u64,
    },
}

impl RedoRecord {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        match self {
            RedoRecord::Store {
                txn_id,
                index_id,
                key,
                value,
            } => {
                w.write_u8(OP_STORE);
                w.write_varint(*txn_id);
                w.write_varint(*index_id);
                w.write_varint(key.len() as u64);
                w.write_bytes(key);
                w.write_varint(value.len() as u64);
                w.write_bytes(value);
            }
            RedoRecord::Delete {
                txn_id,
                index_id,
                key,
            } => {
                w.write_u8(OP_DELETE);
                w.write_varint(*txn_id);
                w.write_varint(*index_id);
                w.write_varint(key.len() as u64);
                w.write_bytes(key);
            }
            RedoRecord::TxnBegin { txn_id } => {
                w.write_u8(OP_TXN_BEGIN);
                w.write_varint(*txn_id);
            }
            RedoRecord::TxnRollback { txn_id } => {
                w.write_u8(OP_TXN_ROLLBACK);
                w.write_varint(*txn_id);
            }
            RedoRecord::TxnCommit { txn_id } => {
                w.write_u8(OP_TXN_COMMIT);
                w.write_varint(*txn_id);
            }
            RedoRecord::TxnPrepare { txn_id, handler_id } => {
                w.write_u8(OP_TXN_PREPARE);
                w.write_varint(*txn_id);
                w.write_varint(*handler_id as u64);
            }
            RedoRecord::Checkpoint { sequence } => {
                w.write_u8(OP_CHECKPOINT);
                w.write_varint(*sequence);
            }
        }
        w.to_bytes()
    }

    fn decode(reader: &mut SmallReader) -> Result<Option<Self>, SmallError> {
        let op = reader.read_u8()?;
        let record = match op {
            OP_STORE => {
                let txn_id = reader.read_varint()?;
                let index_id = reader.read_varint()?;
                let key_len = reader.read_varint()? as usize;
                let key = reader.read_exact(key_len)?.to_vec();
                let value_len = reader.read_varint()? as usize;
                let value = reader.read_exact(value_len)?.to_vec();
                RedoRecord::Store {
                    txn_id,
                    index_id,
                    key,
                    value,
                }
            }
            OP_DELETE => {
                let txn_id = reader.read_varint()?;
                let index_id = reader.read_varint()?;
                let key_len = reader.read_varint()? as usize;
                let key = reader.read_exact(key_len)?.to_vec();
                RedoRecord::Delete {
                    txn_id,
                    index_id,
                    key,
                }
            }
            OP_TXN_BEGIN => RedoRecord::TxnBegin {
                txn_id: reader.read_varint()?,
            },
            OP_TXN_ROLLBACK => RedoRecord::TxnRollback {
                txn_id: reader.read_varint()?,
            },
            OP_TXN_COMMIT => RedoRecord::TxnCommit {
                txn_id: reader.read_varint()?,
            },
            OP_TXN_PREPARE => {
                let txn_id = reader.read_varint()?;
                let handler_id = reader.read_varint()? as u32;
                RedoRecord::TxnPrepare { txn_id, handler_id }
            }
            OP_CHECKPOINT => RedoRecord::Checkpoint {
                sequence: reader.read_varint()?,
            },
            OP_END => return Ok(None),
            _ => {
                return Err(SmallError::corrupt(&format!("bad redo op: {}", op)));
            }
        };
        Ok(Some(record))
    }
}

pub struct RedoLog {
    /// `None` runs the log in memory only (no base file): records are
    /// buffered and dropped, which is exactly the non-recoverable
    /// contract of an in-memory engine.
    base: Option<PathBuf>,
    segment_sequence: u64,
    segment_start: u64,
    segment_crc: u32,
    file: Option<File>,
    buf: BytesMut,
    /// Global end position including buffered bytes.
    position: u64,
    /// Bytes appended since the last checkpoint; drives the automatic
    /// checkpoint size threshold.
    bytes_since_checkpoint: u64,
    segment_size: u64,
}

impl RedoLog {
    fn segment_path(base: &PathBuf, sequence: u64) -> PathBuf {
        let mut name = base
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".redo.{}", sequence));
        base.with_file_name(name)
    }

    /// Open for appending at `position`, starting a fresh segment after
    /// `last_sequence`.
    pub fn open(
        base: Option<PathBuf>,
        position: u64,
        last_sequence: u64,
        segment_size: u64,
    ) -> Result<Self, SmallError> {
        let mut log = Self {
            base,
            segment_sequence: last_sequence,
            segment_start: position,
            segment_crc: 0,
            file: None,
            buf: BytesMut::new(),
            position,
            bytes_since_checkpoint: 0,
            segment_size,
        };
        log.roll_segment()?;
        Ok(log)
    }

    fn roll_segment(&mut self) -> SmallResult {
        let base = match &self.base {
            Some(base) => base.clone(),
            None => return Ok(()),
        };
        self.segment_sequence += 1;
        self.segment_start = self.position;
        self.segment_crc = 0;
        let path = Self::segment_path(&base, self.segment_sequence);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        let mut header = SmallWriter::with_capacity(SEGMENT_HEADER_LEN as usize);
        header.write_u64(SEGMENT_MAGIC);
        header.write_u64(self.position);
        file.write_all(header.as_slice())?;
        self.file = Some(file);
        debug!(
            "redo segment {} opened at position {}",
            self.segment_sequence, self.position
        );
        Ok(())
    }

    /// Append a record; returns the global position after it. Durability
    /// is the caller's business via `commit`.
    pub fn append(&mut self, record: &RedoRecord) -> Result<u64, SmallError> {
        let bytes = record.encode();
        self.buf.put_slice(&bytes);
        self.position += bytes.len() as u64;
        self.bytes_since_checkpoint += bytes.len() as u64;

        if self.file.is_some() && self.position - self.segment_start >= self.segment_size {
            self.finish_segment()?;
            self.roll_segment()?;
        }
        Ok(self.position)
    }

    /// Seal the current segment with an END record and its CRC.
    fn finish_segment(&mut self) -> SmallResult {
        self.flush()?;
        if let Some(file) = &mut self.file {
            let mut w = SmallWriter::with_capacity(5);
            w.write_u8(OP_END);
            w.write_u32(self.segment_crc);
            file.write_all(w.as_slice())?;
            file.sync_data()?;
            // the END record is not part of the global position: the
            // next segment's header records where the stream resumes
        }
        Ok(())
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn bytes_since_checkpoint(&self) -> u64 {
        self.bytes_since_checkpoint
    }

    pub fn note_checkpoint(&mut self) {
        self.bytes_since_checkpoint = 0;
    }

    /// Write buffered records to the OS.
    pub fn flush(&mut self) -> SmallResult {
        if self.buf.is_empty() {
            return Ok(());
        }
        let bytes = self.buf.split();
        if let Some(file) = &mut self.file {
            self.segment_crc = crc32c::crc32c_append(self.segment_crc, &bytes);
            file.write_all(&bytes)?;
        }
        Ok(())
    }

    pub fn sync(&mut self) -> SmallResult {
        self.flush()?;
        if let Some(file) = &mut self.file {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Apply the durability contract after a commit record.
    pub fn commit(&mut self, mode: DurabilityMode) -> SmallResult {
        match mode {
            DurabilityMode::NoRedo | DurabilityMode::NoFlush => Ok(()),
            DurabilityMode::NoSync => self.flush(),
            DurabilityMode::Sync => self.sync(),
        }
    }

    /// Delete segments that lie entirely below `position` (everything in
    /// them is covered by the checkpoint).
    pub fn free_before(&mut self, position: u64) -> SmallResult {
        let base = match &self.base {
            Some(base) => base.clone(),
            None => return Ok(()),
        };
        for (sequence, start) in Self::list_segments(&base)? {
            if sequence == self.segment_sequence {
                continue;
            }
            let path = Self::segment_path(&base, sequence);
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            let mut len = (bytes.len() as u64).saturating_sub(SEGMENT_HEADER_LEN);
            // the END+CRC trailer is not part of the position stream
            if len >= 5 && bytes[bytes.len() - 5] == OP_END {
                len -= 5;
            }
            if start + len <= position {
                info!(
                    "redo segment {} freed (end {} <= checkpoint {})",
                    sequence,
                    start + len,
                    position
                );
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }

    fn list_segments(base: &PathBuf) -> Result<Vec<(u64, u64)>, SmallError> {
        let dir = base.parent().map(|p| p.to_path_buf()).unwrap_or_else(|| PathBuf::from("."));
        let dir = if dir.as_os_str().is_empty() {
            PathBuf::from(".")
        } else {
            dir
        };
        let prefix = format!(
            "{}.redo.",
            base.file_name().unwrap_or_default().to_string_lossy()
        );
        let mut segments = Vec::new();
        if !dir.exists() {
            return Ok(segments);
        }
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(suffix) = name.strip_prefix(&prefix) {
                if let Ok(sequence) = suffix.parse::<u64>() {
                    let mut header = [0u8; SEGMENT_HEADER_LEN as usize];
                    let mut file = File::open(entry.path())?;
                    if file.read_exact(&mut header).is_err() {
                        warn!("redo segment {} too short, skipped", sequence);
                        continue;
                    }
                    let mut reader = SmallReader::new(&header);
                    if reader.read_u64()? != SEGMENT_MAGIC {
                        warn!("redo segment {} has bad magic, skipped", sequence);
                        continue;
                    }
                    let start = reader.read_u64()?;
                    segments.push((sequence, start));
                }
            }
        }
        segments.sort();
        Ok(segments)
    }

    /// Replay every record at or after `from_position`. Returns the
    /// records in order, the position of the stream end (first malformed
    /// byte on the live tail), and the highest segment sequence seen.
    pub fn replay(
        base: &PathBuf,
        from_position: u64,
    ) -> Result<(Vec<RedoRecord>, u64, u64), SmallError> {
        let segments = Self::list_segments(base)?;
        let mut records = Vec::new();
        let mut position = from_position;
        let mut last_sequence = 0;

        for (i, (sequence, start)) in segments.iter().enumerate() {
            last_sequence = last_sequence.max(*sequence);
            let path = Self::segment_path(base, *sequence);
            let mut bytes = Vec::new();
            File::open(&path)?.read_to_end(&mut bytes)?;
            if bytes.len() < SEGMENT_HEADER_LEN as usize {
                continue;
            }
            let payload = &bytes[SEGMENT_HEADER_LEN as usize..];
            let is_last = i + 1 == segments.len();

            // finished segments carry a trailing END+CRC; verify it
            if !is_last {
                if let Err(e) = verify_segment_crc(payload) {
                    // a sealed segment failing its checksum is real
                    // corruption, not a torn tail
                    return Err(e);
                }
            }

            let mut reader = SmallReader::new(payload);
            let mut segment_position = *start;
            loop {
                let record_start = reader.pos();
                if reader.at_end() {
                    break;
                }
                match RedoRecord::decode(&mut reader) {
                    Ok(Some(record)) => {
                        let len = (reader.pos() - record_start) as u64;
                        segment_position += len;
                        if segment_position > from_position {
                            records.push(record);
                        }
                        position = position.max(segment_position);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        if is_last {
                            warn!(
                                "redo stream truncated at {} ({})",
                                segment_position, e
                            );
                            break;
                        }
                        return Err(e);
                    }
                }
            }
        }
        Ok((records, position, last_sequence))
    }
}

fn verify_segment_crc(payload: &[u8]) -> SmallResult {
    // find the END record: it is the last 5 bytes
    if payload.len() < 5 || payload[payload.len() - 5] != OP_END {
        return Err(SmallError::corrupt("sealed redo segment missing END"));
    }
    let body = &payload[..payload.len() - 5];
    let mut reader = SmallReader::new(&payload[payload.len() - 4..]);
    let expect = reader.read_u32()?;
    let actual = crc32c::crc32c(body);
    if actual != expect {
        return Err(SmallError::corrupt("redo segment checksum mismatch"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_base(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("small-store-redo-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir.join("store")
    }

    fn store_record(i: u64) -> RedoRecord {
        RedoRecord::Store {
            txn_id: 1,
            index_id: 2,
            key: format!("key{}", i).into_bytes(),
            value: format!("value{}", i).into_bytes(),
        }
    }

    #[test]
    fn test_append_replay_round_trip() {
        let base = temp_base("round-trip");
        let mut log = RedoLog::open(Some(base.clone()), 0, 0, 1 << 20).unwrap();
        log.append(&RedoRecord::TxnBegin { txn_id: 1 }).unwrap();
        for i in 0..10 {
            log.append(&store_record(i)).unwrap();
        }
        log.append(&RedoRecord::TxnCommit { txn_id: 1 }).unwrap();
        log.sync().unwrap();

        let (records, _position, _seq) = RedoLog::replay(&base, 0).unwrap();
        assert_eq!(records.len(), 12);
        assert_eq!(records[0], RedoRecord::TxnBegin { txn_id: 1 });
        assert_eq!(records[11], RedoRecord::TxnCommit { txn_id: 1 });
    }

    #[test]
    fn test_rotation_and_replay_across_segments() {
        let base = temp_base("rotate");
        // tiny segments force several rotations
        let mut log = RedoLog::open(Some(base.clone()), 0, 0, 256).unwrap();
        for i in 0..50 {
            log.append(&store_record(i)).unwrap();
        }
        log.sync().unwrap();
        assert!(log.segment_sequence > 1);

        let (records, position, last) = RedoLog::replay(&base, 0).unwrap();
        assert_eq!(records.len(), 50);
        assert_eq!(position, log.position());
        assert_eq!(last, log.segment_sequence);
    }

    #[test]
    fn test_replay_from_position_skips_covered_records() {
        let base = temp_base("from-pos");
        let mut log = RedoLog::open(Some(base.clone()), 0, 0, 1 << 20).unwrap();
        for i in 0..5 {
            log.append(&store_record(i)).unwrap();
        }
        let mid = log.position();
        for i in 5..10 {
            log.append(&store_record(i)).unwrap();
        }
        log.sync().unwrap();

        let (records, _, _) = RedoLog::replay(&base, mid).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], store_record(5));
    }

    #[test]
    fn test_torn_tail_truncates_cleanly() {
        let base = temp_base("torn");
        let mut log = RedoLog::open(Some(base.clone()), 0, 0, 1 << 20).unwrap();
        for i in 0..5 {
            log.append(&store_record(i)).unwrap();
        }
        log.sync().unwrap();
        let good_position = log.position();
        drop(log);

        // simulate a torn write: half a record at the tail
        let path = RedoLog::segment_path(&base, 1);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[OP_STORE, 0x01, 0x02]).unwrap();
        drop(file);

        let (records, position, _) = RedoLog::replay(&base, 0).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(position, good_position);
    }

    #[test]
    fn test_free_before_removes_old_segments() {
        let base = temp_base("free");
        let mut log = RedoLog::open(Some(base.clone()), 0, 0, 128).unwrap();
        for i in 0..40 {
            log.append(&store_record(i)).unwrap();
        }
        log.sync().unwrap();
        let position = log.position();
        log.free_before(position).unwrap();

        // only the live segment remains
        let remaining = RedoLog::list_segments(&base).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, log.segment_sequence);
    }

    #[test]
    fn test_in_memory_log_is_a_no_op() {
        let mut log = RedoLog::open(None, 0, 0, 1 << 20).unwrap();
        for i in 0..10 {
            log.append(&store_record(i)).unwrap();
        }
        log.commit(DurabilityMode::Sync).unwrap();
        assert!(log.position() > 0);
    }
}
