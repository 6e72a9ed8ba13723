//! Per-transaction undo log (C6): how to reverse each mutation, newest
//! first.
//!
//! Records accumulate in an in-memory buffer and spill to pages
//! allocated from the page manager when the buffer fills (and at
//! checkpoint time, so transactions that straddle a checkpoint can be
//! rolled back during recovery). Spilled pages form a backward chain:
//!
//! ```text
//! 0  1  node type (UNDO_LOG)
//! 1  6  previous page id (u48, NO_PAGE at the chain end)
//! 7  2  payload length
//! 9  …  records
//! ```
//!
//! Each record is `payload, u16 payload_len`, so a page (or the live
//! buffer) is walked backwards from its end.

use std::sync::Arc;

use log::debug;

use crate::btree::node::NodeType;
use crate::error::SmallError;
use crate::io::{get_u16, get_u48, put_u16, put_u48, SmallReader, SmallWriter};
use crate::storage::page_manager::{AllocMode, PageManager};
use crate::storage::page_store::PageStore;
use crate::types::{IndexId, PageId, SmallResult, NO_PAGE};

const OFF_PREV: usize = 1;
const OFF_PAYLOAD_LEN: usize = 7;
const UNDO_PAGE_HEADER_LEN: usize = 9;

const OP_UNINSERT: u8 = 1;
const OP_UNUPDATE: u8 = 2;
const OP_UNDELETE: u8 = 3;

/// How to reverse one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOp {
    /// The key did not exist before; rollback removes it.
    Uninsert,
    /// The key held `old_value`; rollback stores it back.
    Unupdate,
    /// The key was ghosted by a delete; rollback restores `old_value`.
    Undelete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord {
    pub op: UndoOp,
    pub index_id: IndexId,
    pub key: Vec<u8>,
    pub old_value: Option<Vec<u8>>,
}

impl UndoRecord {
    fn encode(&self) -> Vec<u8> {
        let mut w = SmallWriter::new();
        let (op, value) = match &self.op {
            UndoOp::Uninsert => (OP_UNINSERT, None),
            UndoOp::Unupdate => (OP_UNUPDATE, self.old_value.as_deref()),
            UndoOp::Undelete => (OP_UNDELETE, self.old_value.as_deref()),
        };
        w.write_u8(op);
        w.write_varint(self.index_id);
        w.write_varint(self.key.len() as u64);
        w.write_bytes(&self.key);
        if let Some(value) = value {
            w.write_varint(value.len() as u64);
            w.write_bytes(value);
        }
        w.to_bytes()
    }

    fn decode(payload: &[u8]) -> Result<Self, SmallError> {
        let mut r = SmallReader::new(payload);
        let op = r.read_u8()?;
        let index_id = r.read_varint()?;
        let key_len = r.read_varint()? as usize;
        let key = r.read_exact(key_len)?.to_vec();
        let (op, old_value) = match op {
            OP_UNINSERT => (UndoOp::Uninsert, None),
            OP_UNUPDATE | OP_UNDELETE => {
                let value_len = r.read_varint()? as usize;
                let value = r.read_exact(value_len)?.to_vec();
                (
                    if op == OP_UNUPDATE {
                        UndoOp::Unupdate
                    } else {
                        UndoOp::Undelete
                    },
                    Some(value),
                )
            }
            _ => return Err(SmallError::corrupt(&format!("bad undo op: {}", op))),
        };
        Ok(Self {
            op,
            index_id,
            key,
            old_value,
        })
    }
}

pub struct UndoLog {
    /// Records not yet spilled, framed `payload, u16 len`.
    buffer: Vec<u8>,
    /// Record count in the buffer; scope exits need it.
    buffer_records: usize,
    /// Head of the spilled chain (the newest spilled page).
    top_page: PageId,
    spilled_pages: Vec<PageId>,
    /// Checkpoint sequence when the log was created; pages freed while
    /// the sequence is unchanged were never referenced by any durable
    /// state and may be recycled instead of queued for after the next
    /// checkpoint.
    born_sequence: u64,
    /// Total records ever pushed; scope savepoints count against this.
    pub record_count: u64,
}

impl UndoLog {
    pub fn new(born_sequence: u64) -> Self {
        Self {
            buffer: Vec::new(),
            buffer_records: 0,
            top_page: NO_PAGE,
            spilled_pages: Vec::new(),
            born_sequence,
            record_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn top_page(&self) -> PageId {
        self.top_page
    }

    pub fn push(
        &mut self,
        record: &UndoRecord,
        pm: &PageManager,
        store: &Arc<dyn PageStore>,
    ) -> SmallResult {
        let payload = record.encode();
        let page_size = store.page_size();
        let cap = page_size - UNDO_PAGE_HEADER_LEN;
        if self.buffer.len() + payload.len() + 2 > cap {
            self.spill(pm, store)?;
        }
        // a record larger than one page cannot happen: keys and inline
        // values are bounded well below the page size
        assert!(payload.len() + 2 <= cap, "undo record exceeds page capacity");
        self.buffer.extend_from_slice(&payload);
        let mut frame = [0u8; 2];
        put_u16(&mut frame, 0, payload.len() as u16);
        self.buffer.extend_from_slice(&frame);
        self.buffer_records += 1;
        self.record_count += 1;
        Ok(())
    }

    /// Write the buffered records to a fresh page and link it onto the
    /// chain. Called on overflow and by the checkpoint for live
    /// transactions.
    pub fn spill(&mut self, pm: &PageManager, store: &Arc<dyn PageStore>) -> SmallResult {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let page_size = store.page_size();
        let pid = pm.alloc_page(AllocMode::Normal)?;
        let mut page = vec![0u8; page_size];
        page[0] = NodeType::UndoLog.to_u8();
        put_u48(&mut page, OFF_PREV, self.top_page);
        put_u16(&mut page, OFF_PAYLOAD_LEN, self.buffer.len() as u16);
        page[UNDO_PAGE_HEADER_LEN..UNDO_PAGE_HEADER_LEN + self.buffer.len()]
            .copy_from_slice(&self.buffer);
        store.write_page(pid, &page)?;
        debug!(
            "undo log spilled {} bytes to page {}, prev {}",
            self.buffer.len(),
            pid,
            self.top_page
        );
        self.top_page = pid;
        self.spilled_pages.push(pid);
        self.buffer.clear();
        self.buffer_records = 0;
        Ok(())
    }

    /// All records, newest first, from the buffer and the spilled chain.
    pub fn records_newest_first(
        &self,
        store: &Arc<dyn PageStore>,
    ) -> Result<Vec<UndoRecord>, SmallError> {
        let mut records = Vec::new();
        walk_frames_backwards(&self.buffer, &mut records)?;

        let mut pid = self.top_page;
        let mut page = vec![0u8; store.page_size()];
        while pid != NO_PAGE {
            store.read_page(pid, &mut page)?;
            if page[0] != NodeType::UndoLog.to_u8() {
                return Err(SmallError::corrupt(&format!(
                    "page {} is not an undo page",
                    pid
                )));
            }
            let len = get_u16(&page, OFF_PAYLOAD_LEN) as usize;
            walk_frames_backwards(
                &page[UNDO_PAGE_HEADER_LEN..UNDO_PAGE_HEADER_LEN + len],
                &mut records,
            )?;
            pid = get_u48(&page, OFF_PREV);
        }
        Ok(records)
    }

    /// Drop the newest records until only `keep` remain; used by scope
    /// exits after their records have been applied. Records still in the
    /// buffer are truncated in place; spilled pages are not rewritten
    /// (rollback simply replays fewer records), so this only supports
    /// trimming within the buffer. Returns false when the cut is below
    /// the spill boundary and the caller should roll back via replay.
    pub fn truncate_buffer_to(&mut self, keep: u64) -> bool {
        let spilled = self.record_count - self.buffer_records as u64;
        if keep < spilled {
            return false;
        }
        let mut drop = self.record_count - keep;
        while drop > 0 {
            let end = self.buffer.len();
            let len = get_u16(&self.buffer, end - 2) as usize;
            self.buffer.truncate(end - 2 - len);
            self.buffer_records -= 1;
            self.record_count -= 1;
            drop -= 1;
        }
        true
    }

    /// Release every spilled page. `current_sequence` decides between
    /// recycling (no checkpoint has seen the pages) and the regular free
    /// queue.
    pub fn free_pages(&mut self, pm: &PageManager, current_sequence: u64) -> SmallResult {
        for pid in self.spilled_pages.drain(..) {
            if current_sequence == self.born_sequence {
                pm.recycle_page(pid)?;
            } else {
                pm.delete_page(pid)?;
            }
        }
        self.top_page = NO_PAGE;
        self.buffer.clear();
        self.buffer_records = 0;
        self.record_count = 0;
        Ok(())
    }

    /// Load the records of a chain persisted by a checkpoint; used by
    /// recovery to roll back transactions that were live at checkpoint
    /// time.
    pub fn load_chain(
        store: &Arc<dyn PageStore>,
        head: PageId,
    ) -> Result<Vec<UndoRecord>, SmallError> {
        let mut log = UndoLog::new(0);
        log.top_page = head;
        log.records_newest_first(store)
    }
}

fn walk_frames_backwards(buffer: &[u8], out: &mut Vec<UndoRecord>) -> SmallResult {
    let mut end = buffer.len();
    while end > 0 {
        if end < 2 {
            return Err(SmallError::corrupt("torn undo frame"));
        }
        let len = get_u16(buffer, end - 2) as usize;
        if len + 2 > end {
            return Err(SmallError::corrupt("undo frame length out of range"));
        }
        out.push(UndoRecord::decode(&buffer[end - 2 - len..end - 2])?);
        end -= len + 2;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::MemPageStore;

    fn setup() -> (Arc<dyn PageStore>, PageManager) {
        let store: Arc<dyn PageStore> = Arc::new(MemPageStore::new(512));
        store.set_page_count(2).unwrap();
        let pm = PageManager::new(Arc::clone(&store));
        (store, pm)
    }

    fn record(i: u8) -> UndoRecord {
        UndoRecord {
            op: UndoOp::Unupdate,
            index_id: 7,
            key: vec![b'k', i],
            old_value: Some(vec![i; 3]),
        }
    }

    #[test]
    fn test_records_come_back_newest_first() {
        let (store, pm) = setup();
        let mut log = UndoLog::new(0);
        for i in 0..5 {
            log.push(&record(i), &pm, &store).unwrap();
        }
        let records = log.records_newest_first(&store).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0], record(4));
        assert_eq!(records[4], record(0));
    }

    #[test]
    fn test_spill_preserves_order_across_pages() {
        let (store, pm) = setup();
        let mut log = UndoLog::new(0);
        // enough records to force several spills at 512-byte pages
        for i in 0..100 {
            log.push(&record(i), &pm, &store).unwrap();
        }
        assert!(log.top_page() != NO_PAGE);
        let records = log.records_newest_first(&store).unwrap();
        assert_eq!(records.len(), 100);
        for (j, r) in records.iter().enumerate() {
            assert_eq!(r.key[1], (99 - j) as u8);
        }
    }

    #[test]
    fn test_uninsert_has_no_value() {
        let (store, pm) = setup();
        let mut log = UndoLog::new(0);
        log.push(
            &UndoRecord {
                op: UndoOp::Uninsert,
                index_id: 1,
                key: b"fresh".to_vec(),
                old_value: None,
            },
            &pm,
            &store,
        )
        .unwrap();
        let records = log.records_newest_first(&store).unwrap();
        assert_eq!(records[0].op, UndoOp::Uninsert);
        assert!(records[0].old_value.is_none());
    }

    #[test]
    fn test_truncate_within_buffer() {
        let (store, pm) = setup();
        let mut log = UndoLog::new(0);
        for i in 0..4 {
            log.push(&record(i), &pm, &store).unwrap();
        }
        assert!(log.truncate_buffer_to(2));
        let records = log.records_newest_first(&store).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], record(1));
    }

    #[test]
    fn test_free_pages_recycles_within_same_checkpoint() {
        let (store, pm) = setup();
        let mut log = UndoLog::new(3);
        for i in 0..100 {
            log.push(&record(i), &pm, &store).unwrap();
        }
        log.free_pages(&pm, 3).unwrap();
        assert!(log.is_empty());
        // pages went to the recycle queue: allocatable right away
        let pid = pm.alloc_page(AllocMode::TryReserve).unwrap();
        assert_ne!(pid, NO_PAGE);
    }
}
