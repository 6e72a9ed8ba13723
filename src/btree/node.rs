//! In-memory node and on-page layout for tree pages.
//!
//! Leaf and internal pages share a slotted layout. A sorted search vector
//! of 2-byte entry offsets sits between two entry segments, one growing
//! up from the header and one growing down from the page end:
//!
//! ```text
//! [header][left entries →][gap][search vector][gap][← right entries]
//! ```
//!
//! Header, all little-endian:
//! ```text
//! 0   1  node type
//! 1   1  flags (unused)
//! 2   2  garbage bytes
//! 4   2  left_seg_tail    first free byte of the left gap
//! 6   2  search_vec_start offset of the first vector slot
//! 8   2  search_vec_end   offset of the last slot (start - 2 when empty)
//! 10  2  right_seg_tail   last free byte of the right gap
//! ```
//!
//! A leaf entry is `varint key_len, key, value_header, value`. An
//! internal entry is `varint key_len, key, child_id (8 bytes)`, where the
//! child holds keys below the entry's key; the extra rightmost child id
//! lives in the header extension at offset 12. Deleting an entry only
//! unlinks it from the vector and counts its bytes as garbage; `compact`
//! rebuilds the page when the gaps alone cannot fit an insert.

use crate::error::SmallError;
use crate::io::{get_u16, get_u64, put_u16, put_u64, varint_len, SmallReader, SmallWriter};
use crate::types::PageId;
use crate::utils::compare_unsigned;

pub const OFF_TYPE: usize = 0;
const OFF_GARBAGE: usize = 2;
const OFF_LEFT_SEG_TAIL: usize = 4;
const OFF_SEARCH_VEC_START: usize = 6;
const OFF_SEARCH_VEC_END: usize = 8;
const OFF_RIGHT_SEG_TAIL: usize = 10;
const OFF_RIGHTMOST_CHILD: usize = 12;

pub const LEAF_HEADER_LEN: usize = 12;
pub const INTERNAL_HEADER_LEN: usize = 20;

const INTERNAL_CHILD_LEN: usize = 8;

/// Largest value stored inline in a leaf; longer values fragment.
pub const MAX_INLINE_VALUE: usize = 8191;

// value header bytes
const VALUE_GHOST: u8 = 0xC0;
const VALUE_FRAGMENTED: u8 = 0xF0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Leaf,
    Internal,
    Fragment,
    Inode,
    UndoLog,
    QueueNode,
}

impl NodeType {
    pub fn to_u8(self) -> u8 {
        match self {
            NodeType::Leaf => 0,
            NodeType::Internal => 1,
            NodeType::Fragment => 2,
            NodeType::Inode => 3,
            NodeType::UndoLog => 4,
            NodeType::QueueNode => 5,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, SmallError> {
        match v {
            0 => Ok(NodeType::Leaf),
            1 => Ok(NodeType::Internal),
            2 => Ok(NodeType::Fragment),
            3 => Ok(NodeType::Inode),
            4 => Ok(NodeType::UndoLog),
            5 => Ok(NodeType::QueueNode),
            _ => Err(SmallError::corrupt(&format!("bad node type: {}", v))),
        }
    }
}

/// Dirty state is double-buffered: nodes dirtied before the running
/// checkpoint's snapshot carry the previous sentinel and are flushed by
/// it; nodes dirtied after carry the flipped sentinel and wait for the
/// next one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedState {
    Clean,
    DirtyA,
    DirtyB,
}

/// What a leaf entry's value turned out to be.
pub enum ValueRef<'a> {
    /// Inline bytes, borrowed from the page.
    Inline(&'a [u8]),
    /// Logically deleted by a pending transaction.
    Ghost,
    /// Fragmented; the slice is the encoded descriptor (without the
    /// header byte's flags already applied).
    Fragmented { flags: u8, descriptor: &'a [u8] },
}

pub struct Node {
    pub pid: PageId,
    pub node_type: NodeType,
    pub cached_state: CachedState,
    /// Bumped on any change that invalidates slot positions held by
    /// cursors (insert, delete, split, merge, relocation).
    pub version: u64,
    data: Box<[u8]>,
}

impl Node {
    pub fn new_empty(page_size: usize) -> Self {
        Self {
            pid: 0,
            node_type: NodeType::Leaf,
            cached_state: CachedState::Clean,
            version: 0,
            data: vec![0u8; page_size].into_boxed_slice(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Rebind this in-memory node to a page image loaded from disk.
    pub fn bind(&mut self, pid: PageId, node_type: NodeType) {
        self.pid = pid;
        self.node_type = node_type;
        self.cached_state = CachedState::Clean;
        self.version = self.version.wrapping_add(1);
    }

    pub fn is_dirty(&self) -> bool {
        self.cached_state != CachedState::Clean
    }

    // --------------------------------------------------------------
    // header accessors
    // --------------------------------------------------------------

    fn header_len(&self) -> usize {
        match self.node_type {
            NodeType::Internal => INTERNAL_HEADER_LEN,
            _ => LEAF_HEADER_LEN,
        }
    }

    pub fn garbage(&self) -> usize {
        get_u16(&self.data, OFF_GARBAGE) as usize
    }

    fn set_garbage(&mut self, v: usize) {
        put_u16(&mut self.data, OFF_GARBAGE, v as u16);
    }

    fn left_seg_tail(&self) -> usize {
        get_u16(&self.data, OFF_LEFT_SEG_TAIL) as usize
    }

    fn set_left_seg_tail(&mut self, v: usize) {
        put_u16(&mut self.data, OFF_LEFT_SEG_TAIL, v as u16);
    }

    fn search_vec_start(&self) -> usize {
        get_u16(&self.data, OFF_SEARCH_VEC_START) as usize
    }

    fn set_search_vec_start(&mut self, v: usize) {
        put_u16(&mut self.data, OFF_SEARCH_VEC_START, v as u16);
    }

    fn search_vec_end(&self) -> usize {
        get_u16(&self.data, OFF_SEARCH_VEC_END) as usize
    }

    fn set_search_vec_end(&mut self, v: usize) {
        put_u16(&mut self.data, OFF_SEARCH_VEC_END, v as u16);
    }

    fn right_seg_tail(&self) -> usize {
        get_u16(&self.data, OFF_RIGHT_SEG_TAIL) as usize
    }

    fn set_right_seg_tail(&mut self, v: usize) {
        put_u16(&mut self.data, OFF_RIGHT_SEG_TAIL, v as u16);
    }

    pub fn rightmost_child(&self) -> PageId {
        debug_assert_eq!(self.node_type, NodeType::Internal);
        get_u64(&self.data, OFF_RIGHTMOST_CHILD)
    }

    pub fn set_rightmost_child(&mut self, pid: PageId) {
        debug_assert_eq!(self.node_type, NodeType::Internal);
        put_u64(&mut self.data, OFF_RIGHTMOST_CHILD, pid);
    }

    /// Number of entries in the search vector.
    pub fn num_slots(&self) -> usize {
        (self.search_vec_end() + 2 - self.search_vec_start()) / 2
    }

    pub fn is_empty(&self) -> bool {
        self.num_slots() == 0
    }

    // --------------------------------------------------------------
    // init
    // --------------------------------------------------------------

    pub fn init_leaf(&mut self) {
        self.node_type = NodeType::Leaf;
        self.data.fill(0);
        self.data[OFF_TYPE] = NodeType::Leaf.to_u8();
        self.reset_layout(LEAF_HEADER_LEN);
        self.version = self.version.wrapping_add(1);
    }

    pub fn init_internal(&mut self, rightmost_child: PageId) {
        self.node_type = NodeType::Internal;
        self.data.fill(0);
        self.data[OFF_TYPE] = NodeType::Internal.to_u8();
        self.reset_layout(INTERNAL_HEADER_LEN);
        self.set_rightmost_child(rightmost_child);
        self.version = self.version.wrapping_add(1);
    }

    fn reset_layout(&mut self, header_len: usize) {
        let page_size = self.data.len();
        let center = (header_len + (page_size - header_len) / 2) & !1;
        self.set_garbage(0);
        self.set_left_seg_tail(header_len);
        self.set_search_vec_start(center);
        self.set_search_vec_end(center - 2);
        self.set_right_seg_tail(page_size - 1);
    }

    // --------------------------------------------------------------
    // entry access
    // --------------------------------------------------------------

    fn slot_value(&self, i: usize) -> usize {
        get_u16(&self.data, self.search_vec_start() + 2 * i) as usize
    }

    /// The key of entry `i`.
    pub fn key_at(&self, i: usize) -> Result<&[u8], SmallError> {
        let off = self.slot_value(i);
        let mut reader = SmallReader::new(&self.data);
        reader.seek(off);
        let klen = reader.read_varint()? as usize;
        reader.read_exact(klen)
    }

    /// Byte offset just past the key of entry `i` (the value header in a
    /// leaf, the child id in an internal node).
    fn payload_offset(&self, i: usize) -> Result<usize, SmallError> {
        let off = self.slot_value(i);
        let mut reader = SmallReader::new(&self.data);
        reader.seek(off);
        let klen = reader.read_varint()? as usize;
        reader.read_exact(klen)?;
        Ok(reader.pos())
    }

    /// Binary search for `key`: `Ok(i)` when found, `Err(i)` with the
    /// insertion position otherwise. Unsigned lexicographic order.
    pub fn binary_search(&self, key: &[u8]) -> Result<Result<usize, usize>, SmallError> {
        let mut lo = 0usize;
        let mut hi = self.num_slots();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare_unsigned(self.key_at(mid)?, key) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(lo))
    }

    // --------------------------------------------------------------
    // leaf values
    // --------------------------------------------------------------

    /// Decode the value of leaf entry `i`.
    pub fn leaf_value(&self, i: usize) -> Result<ValueRef, SmallError> {
        debug_assert_eq!(self.node_type, NodeType::Leaf);
        let off = self.payload_offset(i)?;
        let mut reader = SmallReader::new(&self.data);
        reader.seek(off);
        let header = reader.read_u8()?;
        match header {
            0x00..=0x7F => Ok(ValueRef::Inline(reader.read_exact(header as usize)?)),
            0x80..=0xBF => {
                let low = reader.read_u8()?;
                let len = 128 + (((header & 0x3F) as usize) << 8 | low as usize);
                Ok(ValueRef::Inline(reader.read_exact(len)?))
            }
            VALUE_GHOST => Ok(ValueRef::Ghost),
            0xF0..=0xF3 => {
                let flags = header - VALUE_FRAGMENTED;
                let descriptor = &self.data[reader.pos()..self.entry_end(i)?];
                Ok(ValueRef::Fragmented { flags, descriptor })
            }
            _ => Err(SmallError::corrupt(&format!(
                "bad value header {:#x} in page {}",
                header, self.pid
            ))),
        }
    }

    /// Byte offset one past the end of entry `i`.
    fn entry_end(&self, i: usize) -> Result<usize, SmallError> {
        let off = self.slot_value(i);
        Ok(off + self.entry_len_at(off)?)
    }

    /// Total encoded length of the entry starting at `off`.
    fn entry_len_at(&self, off: usize) -> Result<usize, SmallError> {
        let mut reader = SmallReader::new(&self.data);
        reader.seek(off);
        let klen = reader.read_varint()? as usize;
        reader.read_exact(klen)?;
        match self.node_type {
            NodeType::Internal => Ok(reader.pos() - off + INTERNAL_CHILD_LEN),
            NodeType::Leaf => {
                let header = reader.read_u8()?;
                match header {
                    0x00..=0x7F => Ok(reader.pos() - off + header as usize),
                    0x80..=0xBF => {
                        let low = reader.read_u8()?;
                        let len = 128 + (((header & 0x3F) as usize) << 8 | low as usize);
                        Ok(reader.pos() - off + len)
                    }
                    VALUE_GHOST => Ok(reader.pos() - off),
                    0xF0..=0xF3 => {
                        // descriptor: varint total length, optional
                        // prefix, pointer array; its encoded size is
                        // recoverable from its own fields
                        let start = reader.pos();
                        let desc_len = descriptor_len(&self.data, start, header, self.page_size())?;
                        Ok(start - off + desc_len)
                    }
                    _ => Err(SmallError::corrupt("bad value header")),
                }
            }
            _ => Err(SmallError::corrupt("entry in non-tree node")),
        }
    }

    // --------------------------------------------------------------
    // internal children
    // --------------------------------------------------------------

    /// Child holding keys below the key of entry `i`.
    pub fn child_at(&self, i: usize) -> Result<PageId, SmallError> {
        debug_assert_eq!(self.node_type, NodeType::Internal);
        let off = self.payload_offset(i)?;
        Ok(get_u64(&self.data, off))
    }

    pub fn set_child_at(&mut self, i: usize, child: PageId) -> Result<(), SmallError> {
        debug_assert_eq!(self.node_type, NodeType::Internal);
        let off = self.payload_offset(i)?;
        put_u64(&mut self.data, off, child);
        Ok(())
    }

    /// Child to descend into for `key`: the first entry whose key is
    /// greater than `key`, else the rightmost child. Returns the logical
    /// child position (0..=num_slots).
    pub fn child_pos_for(&self, key: &[u8]) -> Result<usize, SmallError> {
        match self.binary_search(key)? {
            // an exact separator match belongs to the right subtree
            Ok(i) => Ok(i + 1),
            Err(i) => Ok(i),
        }
    }

    /// Page id of logical child `pos` (0..=num_slots).
    pub fn child_id(&self, pos: usize) -> Result<PageId, SmallError> {
        if pos == self.num_slots() {
            Ok(self.rightmost_child())
        } else {
            self.child_at(pos)
        }
    }

    pub fn set_child_id(&mut self, pos: usize, child: PageId) -> Result<(), SmallError> {
        if pos == self.num_slots() {
            self.set_rightmost_child(child);
            Ok(())
        } else {
            self.set_child_at(pos, child)
        }
    }

    // --------------------------------------------------------------
    // space accounting
    // --------------------------------------------------------------

    fn left_gap(&self) -> usize {
        self.search_vec_start() - self.left_seg_tail()
    }

    fn right_gap(&self) -> usize {
        self.right_seg_tail() + 1 - (self.search_vec_end() + 2)
    }

    /// Directly usable free bytes (both gaps).
    pub fn free_space(&self) -> usize {
        self.left_gap() + self.right_gap()
    }

    /// Whether an entry of `entry_len` bytes (plus its vector slot) fits,
    /// counting garbage that compaction would reclaim.
    pub fn fits(&self, entry_len: usize) -> bool {
        self.free_space() + self.garbage() >= entry_len + 2
    }

    /// Live payload bytes: every entry plus its vector slot.
    pub fn live_bytes(&self) -> Result<usize, SmallError> {
        let mut total = 0;
        for i in 0..self.num_slots() {
            total += self.entry_len_at(self.slot_value(i))? + 2;
        }
        Ok(total)
    }

    // --------------------------------------------------------------
    // mutation
    // --------------------------------------------------------------

    /// Insert an already-encoded entry at vector position `i`. Fails
    /// (returns false) when the entry cannot fit even after compaction;
    /// the caller splits.
    pub fn insert_entry(&mut self, i: usize, entry: &[u8]) -> Result<bool, SmallError> {
        if !self.fits(entry.len()) {
            return Ok(false);
        }
        if !self.try_insert_entry(i, entry) {
            self.compact()?;
            let ok = self.try_insert_entry(i, entry);
            debug_assert!(ok, "entry must fit after compaction");
            if !ok {
                return Ok(false);
            }
        }
        self.version = self.version.wrapping_add(1);
        Ok(true)
    }

    fn try_insert_entry(&mut self, i: usize, entry: &[u8]) -> bool {
        let n = self.num_slots();
        debug_assert!(i <= n);

        // 1. allocate entry bytes; the vector shift consumes 2 bytes of
        // one gap, so require that much headroom on the side we pick
        let len = entry.len();
        let left_gap = self.left_gap();
        let right_gap = self.right_gap();

        let off = if left_gap >= len && left_gap.max(right_gap) >= len + 2 && left_gap >= right_gap
        {
            let off = self.left_seg_tail();
            self.set_left_seg_tail(off + len);
            off
        } else if right_gap >= len + 2 || (right_gap >= len && left_gap >= 2) {
            let off = self.right_seg_tail() + 1 - len;
            self.set_right_seg_tail(off - 1);
            off
        } else if left_gap >= len + 2 {
            let off = self.left_seg_tail();
            self.set_left_seg_tail(off + len);
            off
        } else {
            return false;
        };
        self.data[off..off + len].copy_from_slice(entry);

        // 2. grow the vector into whichever gap still has room
        let start = self.search_vec_start();
        let end = self.search_vec_end();
        if self.left_gap() >= 2 && (i <= n / 2 || self.right_gap() < 2) {
            self.data.copy_within(start..start + 2 * i, start - 2);
            self.set_search_vec_start(start - 2);
        } else if self.right_gap() >= 2 {
            self.data.copy_within(start + 2 * i..end + 2, start + 2 * i + 2);
            self.set_search_vec_end(end + 2);
        } else {
            // roll back the entry allocation
            if off == self.left_seg_tail() - len {
                self.set_left_seg_tail(off);
            } else {
                self.set_right_seg_tail(off + len - 1);
            }
            return false;
        }
        let slot_off = self.search_vec_start() + 2 * i;
        put_u16(&mut self.data, slot_off, off as u16);
        true
    }

    /// Remove entry `i` from the vector; its bytes become garbage.
    pub fn delete_entry(&mut self, i: usize) -> Result<(), SmallError> {
        let n = self.num_slots();
        debug_assert!(i < n);
        let entry_len = self.entry_len_at(self.slot_value(i))?;

        let start = self.search_vec_start();
        let end = self.search_vec_end();
        // shrink from whichever side moves fewer slots
        if i < n / 2 {
            self.data.copy_within(start..start + 2 * i, start + 2);
            self.set_search_vec_start(start + 2);
        } else {
            self.data
                .copy_within(start + 2 * (i + 1)..end + 2, start + 2 * i);
            self.set_search_vec_end(end - 2);
        }
        self.set_garbage(self.garbage() + entry_len);
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Replace the value portion of leaf entry `i` with `new_value`
    /// (encoded, header included) when it fits in place; otherwise the
    /// caller re-inserts. In-place means the encoded entry does not grow.
    pub fn try_replace_value(&mut self, i: usize, new_value: &[u8]) -> Result<bool, SmallError> {
        debug_assert_eq!(self.node_type, NodeType::Leaf);
        let off = self.slot_value(i);
        let old_len = self.entry_len_at(off)?;
        let value_off = self.payload_offset(i)?;
        let key_len = value_off - off;
        let new_len = key_len + new_value.len();
        if new_len > old_len {
            return Ok(false);
        }
        self.data[value_off..value_off + new_value.len()].copy_from_slice(new_value);
        self.set_garbage(self.garbage() + (old_len - new_len));
        self.version = self.version.wrapping_add(1);
        Ok(true)
    }

    /// Overwrite the value header of leaf entry `i` with a ghost marker,
    /// counting the value bytes as garbage. The key stays in place so
    /// the pending delete remains addressable.
    pub fn ghost_value(&mut self, i: usize) -> Result<(), SmallError> {
        debug_assert_eq!(self.node_type, NodeType::Leaf);
        let off = self.slot_value(i);
        let old_len = self.entry_len_at(off)?;
        let value_off = self.payload_offset(i)?;
        let key_len = value_off - off;
        self.data[value_off] = VALUE_GHOST;
        self.set_garbage(self.garbage() + old_len - key_len - 1);
        self.version = self.version.wrapping_add(1);
        Ok(())
    }

    /// Rewrite the page with all live entries packed into the left
    /// segment, clearing garbage. Slot order (and cursor positions) are
    /// preserved.
    pub fn compact(&mut self) -> Result<(), SmallError> {
        let n = self.num_slots();
        let header_len = self.header_len();
        let page_size = self.data.len();

        let mut entries: Vec<(usize, usize)> = Vec::with_capacity(n);
        let mut total = 0usize;
        for i in 0..n {
            let off = self.slot_value(i);
            let len = self.entry_len_at(off)?;
            entries.push((off, len));
            total += len;
        }

        let mut fresh = vec![0u8; page_size].into_boxed_slice();
        fresh[..header_len].copy_from_slice(&self.data[..header_len]);

        let mut write = header_len;
        let mut offsets = Vec::with_capacity(n);
        for (off, len) in entries {
            fresh[write..write + len].copy_from_slice(&self.data[off..off + len]);
            offsets.push(write);
            write += len;
        }

        // vector sits right after the entries, leaving all free space as
        // one contiguous right gap so any entry that fits in total fits
        // in practice
        let vec_start = write;
        for (i, off) in offsets.iter().enumerate() {
            put_u16(&mut fresh, vec_start + 2 * i, *off as u16);
        }
        write += 2 * n;

        self.data = fresh;
        self.set_garbage(0);
        self.set_left_seg_tail(vec_start);
        self.set_search_vec_start(vec_start);
        self.set_search_vec_end(vec_start + 2 * n - 2);
        self.set_right_seg_tail(page_size - 1);
        debug_assert_eq!(write, vec_start + 2 * n);
        Ok(())
    }

    /// Raw encoded entry `i`, for moving entries between nodes.
    pub fn entry_bytes(&self, i: usize) -> Result<&[u8], SmallError> {
        let off = self.slot_value(i);
        let len = self.entry_len_at(off)?;
        Ok(&self.data[off..off + len])
    }

    /// Check the ordering invariant and layout sanity; used by the
    /// verifier and by tests.
    pub fn check_integrity(&self) -> Result<(), SmallError> {
        let n = self.num_slots();
        let header_len = self.header_len();
        if self.search_vec_start() < header_len
            || self.search_vec_end() + 2 > self.page_size()
            || self.left_seg_tail() > self.search_vec_start()
        {
            return Err(SmallError::corrupt(&format!(
                "page {} layout out of bounds",
                self.pid
            )));
        }
        for i in 1..n {
            if compare_unsigned(self.key_at(i - 1)?, self.key_at(i)?) != std::cmp::Ordering::Less {
                return Err(SmallError::corrupt(&format!(
                    "page {} keys out of order at slot {}",
                    self.pid, i
                )));
            }
        }
        Ok(())
    }
}

/// Size of a fragmented-value descriptor starting at `off` (header byte
/// already consumed; `header` tells which optional parts exist).
fn descriptor_len(
    data: &[u8],
    off: usize,
    header: u8,
    page_size: usize,
) -> Result<usize, SmallError> {
    let mut reader = SmallReader::new(data);
    reader.seek(off);
    let total_len = reader.read_varint()?;
    let indirect = header & 0x01 != 0;
    let has_prefix = header & 0x02 != 0;
    let mut remaining = total_len;
    if has_prefix {
        let prefix_len = reader.read_u16()? as u64;
        reader.read_exact(prefix_len as usize)?;
        remaining = remaining.saturating_sub(prefix_len);
    }
    if indirect {
        reader.read_exact(6)?;
    } else {
        let pages = (remaining as usize + page_size - 1) / page_size;
        reader.read_exact(6 * pages)?;
    }
    Ok(reader.pos() - off)
}

// ------------------------------------------------------------------
// entry encoding helpers
// ------------------------------------------------------------------

/// Encode a leaf entry with an inline value.
pub fn encode_leaf_entry(key: &[u8], value: &[u8]) -> Vec<u8> {
    debug_assert!(value.len() <= MAX_INLINE_VALUE);
    let mut w = SmallWriter::with_capacity(varint_len(key.len() as u64) + key.len() + 2 + value.len());
    w.write_varint(key.len() as u64);
    w.write_bytes(key);
    w.write_bytes(&encode_inline_value(value));
    w.to_bytes()
}

/// Encode just the value portion (header + bytes) of an inline value.
pub fn encode_inline_value(value: &[u8]) -> Vec<u8> {
    let mut w = SmallWriter::with_capacity(2 + value.len());
    if value.len() < 128 {
        w.write_u8(value.len() as u8);
    } else {
        let adjusted = value.len() - 128;
        w.write_u8(0x80 | (adjusted >> 8) as u8);
        w.write_u8(adjusted as u8);
    }
    w.write_bytes(value);
    w.to_bytes()
}

/// Encode a leaf entry whose value portion is already encoded (inline,
/// ghost, or fragmented descriptor).
pub fn encode_leaf_entry_raw(key: &[u8], encoded_value: &[u8]) -> Vec<u8> {
    let mut w =
        SmallWriter::with_capacity(varint_len(key.len() as u64) + key.len() + encoded_value.len());
    w.write_varint(key.len() as u64);
    w.write_bytes(key);
    w.write_bytes(encoded_value);
    w.to_bytes()
}

/// Encode an internal entry: separator key plus the child id holding
/// keys below it.
pub fn encode_internal_entry(key: &[u8], child: PageId) -> Vec<u8> {
    let mut w = SmallWriter::with_capacity(varint_len(key.len() as u64) + key.len() + 8);
    w.write_varint(key.len() as u64);
    w.write_bytes(key);
    w.write_u64(child);
    w.to_bytes()
}

/// The ghost value marker, encoded.
pub fn encoded_ghost_value() -> Vec<u8> {
    vec![VALUE_GHOST]
}

/// Encoded size of a leaf entry with an inline value, without building
/// it. Used for split planning and fit checks.
pub fn leaf_entry_size(key_len: usize, value_len: usize) -> usize {
    let header = if value_len < 128 { 1 } else { 2 };
    varint_len(key_len as u64) + key_len + header + value_len
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(page_size: usize) -> Node {
        let mut node = Node::new_empty(page_size);
        node.init_leaf();
        node
    }

    fn insert_kv(node: &mut Node, key: &[u8], value: &[u8]) -> bool {
        let entry = encode_leaf_entry(key, value);
        match node.binary_search(key).unwrap() {
            Ok(_) => panic!("duplicate key in test"),
            Err(pos) => node.insert_entry(pos, &entry).unwrap(),
        }
    }

    #[test]
    fn test_insert_and_search() {
        let mut node = leaf(1024);
        for k in ["delta", "alpha", "echo", "bravo", "charlie"] {
            assert!(insert_kv(&mut node, k.as_bytes(), b"v"));
        }
        assert_eq!(node.num_slots(), 5);
        node.check_integrity().unwrap();

        assert_eq!(node.binary_search(b"bravo").unwrap(), Ok(1));
        assert_eq!(node.binary_search(b"zulu").unwrap(), Err(5));
        assert_eq!(node.key_at(0).unwrap(), b"alpha");
        assert_eq!(node.key_at(4).unwrap(), b"echo");
    }

    #[test]
    fn test_values_round_trip() {
        let mut node = leaf(4096);
        let long_value = vec![0xAB; 700];
        assert!(insert_kv(&mut node, b"short", b"hello"));
        assert!(insert_kv(&mut node, b"long", &long_value));
        assert!(insert_kv(&mut node, b"empty", b""));

        let pos = node.binary_search(b"long").unwrap().unwrap();
        match node.leaf_value(pos).unwrap() {
            ValueRef::Inline(v) => assert_eq!(v, &long_value[..]),
            _ => panic!("expected inline"),
        }
        let pos = node.binary_search(b"empty").unwrap().unwrap();
        match node.leaf_value(pos).unwrap() {
            ValueRef::Inline(v) => assert!(v.is_empty()),
            _ => panic!("expected inline"),
        }
    }

    #[test]
    fn test_empty_key_is_permitted() {
        let mut node = leaf(1024);
        assert!(insert_kv(&mut node, b"", b"root"));
        assert!(insert_kv(&mut node, b"a", b"x"));
        assert_eq!(node.binary_search(b"").unwrap(), Ok(0));
        node.check_integrity().unwrap();
    }

    #[test]
    fn test_delete_creates_garbage_and_compact_reclaims() {
        let mut node = leaf(1024);
        for i in 0..10u8 {
            assert!(insert_kv(&mut node, &[b'k', i], &[i; 40]));
        }
        let before_free = node.free_space();
        for _ in 0..5 {
            node.delete_entry(0).unwrap();
        }
        assert!(node.garbage() > 0);
        node.check_integrity().unwrap();

        node.compact().unwrap();
        assert_eq!(node.garbage(), 0);
        assert!(node.free_space() > before_free);
        assert_eq!(node.num_slots(), 5);
        assert_eq!(node.key_at(0).unwrap(), &[b'k', 5]);
        node.check_integrity().unwrap();
    }

    #[test]
    fn test_fill_until_overflow_then_fits_is_honest() {
        let mut node = leaf(512);
        let mut inserted = 0;
        loop {
            let key = format!("key{:04}", inserted);
            let entry = encode_leaf_entry(key.as_bytes(), &[7u8; 20]);
            if !node.fits(entry.len()) {
                break;
            }
            let pos = node.binary_search(key.as_bytes()).unwrap().unwrap_err();
            assert!(node.insert_entry(pos, &entry).unwrap());
            inserted += 1;
        }
        assert!(inserted > 5);
        node.check_integrity().unwrap();

        // after deleting one, the same entry fits again via garbage
        node.delete_entry(0).unwrap();
        let entry = encode_leaf_entry(b"key9999", &[7u8; 20]);
        assert!(node.fits(entry.len()));
        let pos = node.binary_search(b"key9999").unwrap().unwrap_err();
        assert!(node.insert_entry(pos, &entry).unwrap());
        node.check_integrity().unwrap();
    }

    #[test]
    fn test_ghost_marker() {
        let mut node = leaf(1024);
        assert!(insert_kv(&mut node, b"k", b"value"));
        let pos = node.binary_search(b"k").unwrap().unwrap();
        node.ghost_value(pos).unwrap();
        match node.leaf_value(pos).unwrap() {
            ValueRef::Ghost => {}
            _ => panic!("expected ghost"),
        }
        // the key is still addressable
        assert_eq!(node.binary_search(b"k").unwrap(), Ok(0));

        // and can be resurrected in place (ghost shrank the entry)
        let replaced = node.try_replace_value(pos, &encode_inline_value(b"nv")).unwrap();
        assert!(replaced);
        match node.leaf_value(pos).unwrap() {
            ValueRef::Inline(v) => assert_eq!(v, b"nv"),
            _ => panic!("expected inline"),
        }
    }

    #[test]
    fn test_internal_children() {
        let mut node = Node::new_empty(1024);
        node.init_internal(99);
        let entry = encode_internal_entry(b"m", 10);
        assert!(node.insert_entry(0, &entry).unwrap());
        let entry = encode_internal_entry(b"t", 20);
        assert!(node.insert_entry(1, &entry).unwrap());

        // keys < "m" go to child 10, ["m","t") to 20, >= "t" to 99
        assert_eq!(node.child_id(node.child_pos_for(b"a").unwrap()).unwrap(), 10);
        assert_eq!(node.child_id(node.child_pos_for(b"m").unwrap()).unwrap(), 20);
        assert_eq!(node.child_id(node.child_pos_for(b"s").unwrap()).unwrap(), 20);
        assert_eq!(node.child_id(node.child_pos_for(b"t").unwrap()).unwrap(), 99);
        assert_eq!(node.child_id(node.child_pos_for(b"z").unwrap()).unwrap(), 99);

        node.set_child_at(0, 11).unwrap();
        assert_eq!(node.child_at(0).unwrap(), 11);
    }

    #[test]
    fn test_inline_value_header_boundary() {
        // 127 fits the 1-byte header, 128 switches to the 2-byte form
        let v127 = encode_inline_value(&[1u8; 127]);
        assert_eq!(v127[0], 127);
        let v128 = encode_inline_value(&[1u8; 128]);
        assert_eq!(v128[0], 0x80);
        assert_eq!(v128[1], 0);
        let v300 = encode_inline_value(&[1u8; 300]);
        assert_eq!(v300.len(), 2 + 300);
    }
}
