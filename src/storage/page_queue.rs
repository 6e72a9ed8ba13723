//! A page queue: a FIFO of page ids stored as a linked list of queue-node
//! pages, with an in-memory append heap at the tail.
//!
//! Node page layout:
//! ```text
//! 0  1  page type (QUEUE_NODE)
//! 1  2  entry count
//! 3  6  next queue node id (u48, NO_PAGE = none)
//! 9  …  varint first id, then varint deltas from the previous id
//! ```
//! Entries within one node come from a single drain of the append heap,
//! so they are ascending and the deltas are non-negative.
//!
//! The append side (heap + tail node) and the remove side (head decode
//! state) are separate structs locked separately by the page manager;
//! the append side may reach over to the remove side, never the reverse.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::SmallError;
use crate::io::{get_u16, get_u48, put_u16, put_u48, SmallReader, SmallWriter};
use crate::storage::page_store::PageStore;
use crate::types::{PageId, SmallResult, NO_PAGE};

pub const QUEUE_NODE_TYPE: u8 = 5;

const OFF_TYPE: usize = 0;
const OFF_COUNT: usize = 1;
const OFF_NEXT: usize = 3;
pub const QUEUE_NODE_HEADER_LEN: usize = 9;

/// How many ids the append heap buffers before draining to a tail node.
pub const APPEND_DRAIN_THRESHOLD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// Freed by tree operations; reusable only after the next checkpoint.
    Regular,
    /// Freed aggressively; reusable within the current checkpoint.
    Recycle,
    /// Held aside during compaction.
    Reserve,
}

// ------------------------------------------------------------------
// append side
// ------------------------------------------------------------------

pub struct QueueAppend {
    buffer: BinaryHeap<Reverse<PageId>>,
    pub tail_id: PageId,
    /// Total entries drained onto pages over the queue's lifetime.
    pub append_count: u64,
}

impl QueueAppend {
    pub fn new() -> Self {
        Self {
            buffer: BinaryHeap::new(),
            tail_id: NO_PAGE,
            append_count: 0,
        }
    }

    pub fn append(&mut self, pid: PageId) {
        debug_assert_ne!(pid, NO_PAGE);
        self.buffer.push(Reverse(pid));
    }

    /// Fast path: pop a recently appended id straight out of the heap.
    pub fn try_unappend(&mut self) -> Option<PageId> {
        self.buffer.pop().map(|Reverse(pid)| pid)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn should_drain(&self) -> bool {
        self.buffer.len() >= APPEND_DRAIN_THRESHOLD
    }

    /// Pull every buffered id out in ascending order.
    pub fn take_sorted(&mut self) -> Vec<PageId> {
        let mut ids = Vec::with_capacity(self.buffer.len());
        while let Some(Reverse(pid)) = self.buffer.pop() {
            ids.push(pid);
        }
        ids
    }
}

/// Serialize `ids` (ascending) into a queue node page image.
pub fn encode_queue_node(page_size: usize, next: PageId, ids: &[PageId]) -> Vec<u8> {
    let mut writer = SmallWriter::with_capacity(page_size);
    writer.write_u8(QUEUE_NODE_TYPE);
    writer.write_u16(ids.len() as u16);
    writer.write_u48(next);
    let mut prev = 0u64;
    for (i, pid) in ids.iter().enumerate() {
        if i == 0 {
            writer.write_varint(*pid);
        } else {
            writer.write_varint(*pid - prev);
        }
        prev = *pid;
    }
    writer.to_padded_bytes(page_size)
}

/// How many ids fit in one node page in the worst case (10-byte varints).
pub fn queue_node_capacity(page_size: usize) -> usize {
    (page_size - QUEUE_NODE_HEADER_LEN) / 10
}

pub fn queue_node_next(bytes: &[u8]) -> PageId {
    get_u48(bytes, OFF_NEXT)
}

pub fn set_queue_node_next(bytes: &mut [u8], next: PageId) {
    put_u48(bytes, OFF_NEXT, next);
}

pub fn queue_node_count(bytes: &[u8]) -> u16 {
    get_u16(bytes, OFF_COUNT)
}

pub fn check_queue_node(bytes: &[u8], pid: PageId) -> SmallResult {
    if bytes[OFF_TYPE] != QUEUE_NODE_TYPE {
        return Err(SmallError::corrupt(&format!(
            "page {} is not a queue node (type {})",
            pid, bytes[OFF_TYPE]
        )));
    }
    Ok(())
}

// ------------------------------------------------------------------
// remove side
// ------------------------------------------------------------------

pub struct QueueHead {
    pub head_id: PageId,
    /// Cached image of the head node page.
    head_bytes: Vec<u8>,
    /// Byte offset of the next undecoded entry in `head_bytes`.
    pub head_pos: u16,
    /// Entries not yet decoded from the head node.
    pub head_remaining: u16,
    /// Last decoded id; deltas accumulate onto it.
    pub prev_id: PageId,
    /// Total entries ever removed.
    pub remove_count: u64,
    /// Entries eligible for removal; bumped by `commit_end` for the
    /// regular queue, tracks `append_count` for the others.
    pub safe_count: u64,
    /// Bumped by the append side whenever it links a new node, telling
    /// the remove side its cached next pointer may be stale.
    pub link_generation: u64,
    seen_generation: u64,
}

/// Outcome of one `try_remove` step. The released node page, if any, must
/// be handed back to the regular free queue by the caller after the
/// remove lock is dropped.
pub struct RemoveOutcome {
    pub entry: Option<PageId>,
    pub released_node: Option<PageId>,
}

impl QueueHead {
    pub fn new() -> Self {
        Self {
            head_id: NO_PAGE,
            head_bytes: Vec::new(),
            head_pos: 0,
            head_remaining: 0,
            prev_id: 0,
            remove_count: 0,
            safe_count: 0,
            link_generation: 0,
            seen_generation: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head_id == NO_PAGE
    }

    /// Point the head at its first node. Called by the append side (via
    /// the manager) when a drain finds the queue empty on disk.
    pub fn set_first_node(&mut self, pid: PageId, bytes: Vec<u8>) {
        debug_assert_eq!(self.head_id, NO_PAGE);
        self.head_id = pid;
        self.head_pos = QUEUE_NODE_HEADER_LEN as u16;
        self.head_remaining = queue_node_count(&bytes);
        self.prev_id = 0;
        self.head_bytes = bytes;
        self.seen_generation = self.link_generation;
    }

    fn load_node(&mut self, store: &dyn PageStore, pid: PageId) -> SmallResult {
        let mut bytes = vec![0u8; store.page_size()];
        store.read_page(pid, &mut bytes)?;
        check_queue_node(&bytes, pid)?;
        self.head_id = pid;
        self.head_pos = QUEUE_NODE_HEADER_LEN as u16;
        self.head_remaining = queue_node_count(&bytes);
        self.prev_id = 0;
        self.head_bytes = bytes;
        self.seen_generation = self.link_generation;
        Ok(())
    }

    /// Re-read the head page after startup or when the append side has
    /// linked past our cached image.
    pub fn refresh(&mut self, store: &dyn PageStore) -> SmallResult {
        if self.head_id == NO_PAGE {
            return Ok(());
        }
        let mut bytes = vec![0u8; store.page_size()];
        store.read_page(self.head_id, &mut bytes)?;
        check_queue_node(&bytes, self.head_id)?;
        self.head_bytes = bytes;
        self.seen_generation = self.link_generation;
        Ok(())
    }

    /// Pop one entry. `enforce_safe` gates the regular queue: entries
    /// appended since the last checkpoint are not yet removable.
    pub fn try_remove(
        &mut self,
        store: &dyn PageStore,
        enforce_safe: bool,
    ) -> Result<RemoveOutcome, SmallError> {
        let mut released_node = None;

        loop {
            if self.head_id == NO_PAGE {
                return Ok(RemoveOutcome {
                    entry: None,
                    released_node,
                });
            }

            if enforce_safe && self.remove_count >= self.safe_count {
                return Ok(RemoveOutcome {
                    entry: None,
                    released_node,
                });
            }

            if self.head_remaining > 0 {
                let mut reader = SmallReader::new(&self.head_bytes);
                reader.seek(self.head_pos as usize);
                let delta = reader.read_varint()?;
                let pid = if self.prev_id == 0 && self.head_pos == QUEUE_NODE_HEADER_LEN as u16 {
                    delta
                } else {
                    self.prev_id + delta
                };
                self.head_pos = reader.pos() as u16;
                self.head_remaining -= 1;
                self.prev_id = pid;
                self.remove_count += 1;
                return Ok(RemoveOutcome {
                    entry: Some(pid),
                    released_node,
                });
            }

            // head node exhausted; advance if a successor exists
            if self.seen_generation != self.link_generation {
                self.refresh(store)?;
            }
            let next = queue_node_next(&self.head_bytes);
            if next == NO_PAGE {
                // the append side still owns this node as its tail;
                // leave it in place
                return Ok(RemoveOutcome {
                    entry: None,
                    released_node,
                });
            }

            // the exhausted node page itself becomes free; only one node
            // can be released per call, which is always the case since
            // the freshly loaded successor either has entries or is the
            // tail
            debug_assert!(released_node.is_none());
            released_node = Some(self.head_id);
            self.load_node(store, next)?;
        }
    }

    /// Decode every entry still in the queue, head node first. Also
    /// reports the node page ids themselves. Used by compaction.
    pub fn iterate(
        &self,
        store: &dyn PageStore,
    ) -> Result<(Vec<PageId>, Vec<PageId>), SmallError> {
        let mut entries = Vec::new();
        let mut nodes = Vec::new();
        if self.head_id == NO_PAGE {
            return Ok((entries, nodes));
        }

        // current head node, from the cached decode position
        nodes.push(self.head_id);
        let mut reader = SmallReader::new(&self.head_bytes);
        reader.seek(self.head_pos as usize);
        let mut prev = self.prev_id;
        for i in 0..self.head_remaining {
            let delta = reader.read_varint()?;
            let pid = if prev == 0 && i == 0 && self.head_pos == QUEUE_NODE_HEADER_LEN as u16 {
                delta
            } else {
                prev + delta
            };
            entries.push(pid);
            prev = pid;
        }

        // successors
        let mut next = queue_node_next(&self.head_bytes);
        let mut bytes = vec![0u8; store.page_size()];
        while next != NO_PAGE {
            store.read_page(next, &mut bytes)?;
            check_queue_node(&bytes, next)?;
            nodes.push(next);
            let count = queue_node_count(&bytes);
            let mut reader = SmallReader::new(&bytes);
            reader.seek(QUEUE_NODE_HEADER_LEN);
            let mut prev = 0u64;
            for i in 0..count {
                let delta = reader.read_varint()?;
                let pid = if i == 0 { delta } else { prev + delta };
                entries.push(pid);
                prev = pid;
            }
            next = queue_node_next(&bytes);
        }
        Ok((entries, nodes))
    }
}

// ------------------------------------------------------------------
// persisted queue state (for the header's page manager region)
// ------------------------------------------------------------------

pub const QUEUE_STATE_LEN: usize = 40;

pub fn encode_queue_state(
    buf: &mut [u8],
    off: usize,
    append: &QueueAppend,
    head: &QueueHead,
) {
    debug_assert_eq!(append.buffered(), 0, "buffer must be drained first");
    put_u48(buf, off, append.tail_id);
    put_u48(buf, off + 6, head.head_id);
    put_u16(buf, off + 12, head.head_pos);
    put_u16(buf, off + 14, head.head_remaining);
    put_u48(buf, off + 16, head.prev_id);
    put_u48(buf, off + 22, append.append_count);
    put_u48(buf, off + 28, head.remove_count);
    put_u48(buf, off + 34, head.safe_count);
}

pub fn decode_queue_state(
    buf: &[u8],
    off: usize,
    store: &dyn PageStore,
) -> Result<(QueueAppend, QueueHead), SmallError> {
    let mut append = QueueAppend::new();
    let mut head = QueueHead::new();
    append.tail_id = get_u48(buf, off);
    head.head_id = get_u48(buf, off + 6);
    head.head_pos = get_u16(buf, off + 12);
    head.head_remaining = get_u16(buf, off + 14);
    head.prev_id = get_u48(buf, off + 16);
    append.append_count = get_u48(buf, off + 22);
    head.remove_count = get_u48(buf, off + 28);
    head.safe_count = get_u48(buf, off + 34);
    head.refresh(store)?;
    Ok((append, head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::MemPageStore;

    #[test]
    fn test_node_encoding_round_trip() {
        let ids = vec![10u64, 11, 40, 1000, 1001];
        let bytes = encode_queue_node(512, 77, &ids);
        assert_eq!(queue_node_count(&bytes), 5);
        assert_eq!(queue_node_next(&bytes), 77);

        let mut reader = SmallReader::new(&bytes);
        reader.seek(QUEUE_NODE_HEADER_LEN);
        let mut prev = 0;
        let mut decoded = Vec::new();
        for i in 0..5 {
            let delta = reader.read_varint().unwrap();
            let pid = if i == 0 { delta } else { prev + delta };
            decoded.push(pid);
            prev = pid;
        }
        assert_eq!(decoded, ids);
    }

    #[test]
    fn test_remove_walks_nodes_and_releases_them() {
        let store = MemPageStore::new(512);
        store.set_page_count(200).unwrap();

        // two linked nodes: [5, 6] -> [9]
        let second = encode_queue_node(512, NO_PAGE, &[9]);
        store.write_page(101, &second).unwrap();
        let first = encode_queue_node(512, 101, &[5, 6]);
        store.write_page(100, &first).unwrap();

        let mut head = QueueHead::new();
        head.head_id = 100;
        head.head_pos = QUEUE_NODE_HEADER_LEN as u16;
        head.head_remaining = 2;
        head.refresh(&store).unwrap();

        let out = head.try_remove(&store, false).unwrap();
        assert_eq!(out.entry, Some(5));
        let out = head.try_remove(&store, false).unwrap();
        assert_eq!(out.entry, Some(6));
        assert!(out.released_node.is_none());

        // crossing into the second node releases the first node page
        let out = head.try_remove(&store, false).unwrap();
        assert_eq!(out.entry, Some(9));
        assert_eq!(out.released_node, Some(100));

        // tail node is never released
        let out = head.try_remove(&store, false).unwrap();
        assert!(out.entry.is_none());
        assert!(out.released_node.is_none());
    }

    #[test]
    fn test_safe_count_gates_removal() {
        let store = MemPageStore::new(512);
        store.set_page_count(200).unwrap();
        let node = encode_queue_node(512, NO_PAGE, &[5, 6]);
        store.write_page(100, &node).unwrap();

        let mut head = QueueHead::new();
        head.head_id = 100;
        head.head_pos = QUEUE_NODE_HEADER_LEN as u16;
        head.head_remaining = 2;
        head.refresh(&store).unwrap();
        head.safe_count = 1;

        assert_eq!(head.try_remove(&store, true).unwrap().entry, Some(5));
        assert!(head.try_remove(&store, true).unwrap().entry.is_none());
        head.safe_count = 2;
        assert_eq!(head.try_remove(&store, true).unwrap().entry, Some(6));
    }
}
