//! Cursors: a stateful handle to a logical position in a tree (C8).
//!
//! A cursor keeps one frame per tree level, root first, leaf last. The
//! frames are navigation hints, not pins: each records the node handle,
//! its page id and the node version at bind time. Whenever a frame is
//! resumed the node is re-latched and the id/version checked; any
//! mismatch throws the stack away and re-descends from the root keyed
//! on the cursor's current key, so a stale frame is never trusted.
//!
//! Value access goes through the linked transaction: `load` first takes
//! a key lock in the cursor's link mode, then resolves the value with a
//! fully latch-coupled read. On lock timeout the cursor stays positioned
//! at the key with the value marked not-loaded, and the error surfaces.

use std::sync::Arc;

use crate::btree::node::{Node, NodeType};
use crate::btree::tree::Tree;
use crate::error::{ErrorKind, SmallError};
use crate::transaction::tx::Transaction;
use crate::types::{PageId, Pod, SmallResult};
use crate::utils::HandyRwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorValue {
    /// Positioned, but the value was not (or could not be) materialised.
    NotLoaded,
    /// Positioned at a key with no live entry.
    Absent,
    Value(Vec<u8>),
}

impl CursorValue {
    pub fn as_option(&self) -> Option<&[u8]> {
        match self {
            CursorValue::Value(v) => Some(v),
            _ => None,
        }
    }
}

struct Frame {
    pod: Pod<Node>,
    pid: PageId,
    version: u64,
    /// Entry position in a leaf; child position in an internal node.
    pos: usize,
}

/// Outcome of normalising a cursor position.
#[derive(PartialEq)]
enum Settle {
    /// The leaf frame points at a real entry.
    Positioned,
    /// The index genuinely ends in this direction.
    End,
    /// A frame went stale; the caller re-descends and tries again.
    Stale,
}

enum Target<'a> {
    Key(&'a [u8]),
    First,
    Last,
}

pub struct Cursor<'t> {
    tree: Arc<Tree>,
    txn: &'t Transaction,
    autoload: bool,
    key: Option<Vec<u8>>,
    value: CursorValue,
    frames: Vec<Frame>,
}

impl<'t> Cursor<'t> {
    pub fn new(tree: Arc<Tree>, txn: &'t Transaction) -> Self {
        Self {
            tree,
            txn,
            autoload: true,
            key: None,
            value: CursorValue::NotLoaded,
            frames: Vec::new(),
        }
    }

    /// When off, positioning operations skip value materialisation (and
    /// the lock acquisition that guards it).
    pub fn set_autoload(&mut self, autoload: bool) {
        self.autoload = autoload;
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &CursorValue {
        &self.value
    }

    /// Release the frame stack and forget the position.
    pub fn reset(&mut self) {
        self.frames.clear();
        self.key = None;
        self.value = CursorValue::NotLoaded;
    }

    fn unpositioned_error(&self) -> SmallError {
        SmallError::new(
            ErrorKind::UnpositionedCursor,
            "cursor is not positioned on a key",
        )
    }

    // --------------------------------------------------------------
    // positioning
    // --------------------------------------------------------------

    /// Position exactly at `key`, whether or not an entry exists.
    pub fn find(&mut self, key: &[u8]) -> SmallResult {
        self.descend(Target::Key(key))?;
        self.key = Some(key.to_vec());
        self.after_position()
    }

    /// Position at the first entry with key ≥ `key`; unpositioned when
    /// the index ends first.
    pub fn find_ge(&mut self, key: &[u8]) -> SmallResult {
        loop {
            self.descend(Target::Key(key))?;
            match self.settle_forward()? {
                Settle::Positioned => {
                    if !self.bind_key_from_leaf()? {
                        continue;
                    }
                    return self.after_position();
                }
                Settle::End => {
                    self.reset();
                    return Ok(());
                }
                Settle::Stale => continue,
            }
        }
    }

    /// Position at the first entry with key > `key`.
    pub fn find_gt(&mut self, key: &[u8]) -> SmallResult {
        self.find_ge(key)?;
        if self.key.as_deref() == Some(key) {
            self.next()?;
        }
        Ok(())
    }

    /// Re-position at `key`, reusing the current leaf when it still
    /// covers the key; falls back to a fresh descent.
    pub fn find_nearby(&mut self, key: &[u8]) -> SmallResult {
        let reused = match self.frames.last_mut() {
            Some(frame) => {
                let guard = frame.pod.rl();
                if guard.pid == frame.pid
                    && guard.version == frame.version
                    && guard.node_type == NodeType::Leaf
                    && guard.num_slots() > 0
                    && guard.key_at(0)? <= key
                    && key <= guard.key_at(guard.num_slots() - 1)?
                {
                    frame.pos = match guard.binary_search(key)? {
                        Ok(i) => i,
                        Err(i) => i,
                    };
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if reused {
            self.key = Some(key.to_vec());
            return self.after_position();
        }
        self.find(key)
    }

    pub fn first(&mut self) -> SmallResult {
        loop {
            self.descend(Target::First)?;
            match self.settle_forward()? {
                Settle::Positioned => {
                    if !self.bind_key_from_leaf()? {
                        continue;
                    }
                    return self.after_position();
                }
                Settle::End => {
                    self.reset();
                    return Ok(());
                }
                Settle::Stale => continue,
            }
        }
    }

    pub fn last(&mut self) -> SmallResult {
        loop {
            self.descend(Target::Last)?;
            match self.settle_backward()? {
                Settle::Positioned => {
                    if !self.bind_key_from_leaf()? {
                        continue;
                    }
                    return self.after_position();
                }
                Settle::End => {
                    self.reset();
                    return Ok(());
                }
                Settle::Stale => continue,
            }
        }
    }

    /// Advance to the following entry; unpositioned at the end.
    pub fn next(&mut self) -> SmallResult {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(self.unpositioned_error()),
        };
        loop {
            if self.frames.is_empty() {
                self.descend(Target::Key(&key))?;
            }
            // advance within the leaf when the frame is still fresh
            enum Leaf {
                Hit,
                Exhausted,
                Stale,
            }
            let state = {
                let frame = self.frames.last_mut().unwrap();
                let guard = frame.pod.rl();
                if guard.pid != frame.pid || guard.version != frame.version {
                    Leaf::Stale
                } else {
                    // the frame position may still point at the current
                    // key (or its insertion point); step past it
                    let n = guard.num_slots();
                    let mut pos = frame.pos;
                    while pos < n && guard.key_at(pos)? <= key.as_slice() {
                        pos += 1;
                    }
                    if pos < n {
                        frame.pos = pos;
                        Leaf::Hit
                    } else {
                        frame.pos = n;
                        Leaf::Exhausted
                    }
                }
            };
            match state {
                Leaf::Hit => {
                    if !self.bind_key_from_leaf()? {
                        self.frames.clear();
                        continue;
                    }
                    return self.after_position();
                }
                Leaf::Stale => {
                    self.frames.clear();
                    continue;
                }
                Leaf::Exhausted => match self.settle_forward()? {
                    Settle::Positioned => {
                        if !self.bind_key_from_leaf()? {
                            self.frames.clear();
                            continue;
                        }
                        return self.after_position();
                    }
                    Settle::End => {
                        self.reset();
                        return Ok(());
                    }
                    Settle::Stale => {
                        self.frames.clear();
                        continue;
                    }
                },
            }
        }
    }

    /// Step back to the preceding entry; unpositioned at the start.
    pub fn previous(&mut self) -> SmallResult {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(self.unpositioned_error()),
        };
        loop {
            if self.frames.is_empty() {
                self.descend(Target::Key(&key))?;
            }
            enum Leaf {
                Hit,
                Exhausted,
                Stale,
            }
            let state = {
                let frame = self.frames.last_mut().unwrap();
                let guard = frame.pod.rl();
                if guard.pid != frame.pid || guard.version != frame.version {
                    Leaf::Stale
                } else {
                    let n = guard.num_slots();
                    let mut pos = frame.pos.min(n);
                    let mut hit = None;
                    while pos > 0 {
                        pos -= 1;
                        if guard.key_at(pos)? < key.as_slice() {
                            hit = Some(pos);
                            break;
                        }
                    }
                    match hit {
                        Some(pos) => {
                            frame.pos = pos;
                            Leaf::Hit
                        }
                        None => {
                            frame.pos = 0;
                            Leaf::Exhausted
                        }
                    }
                }
            };
            match state {
                Leaf::Hit => {
                    if !self.bind_key_from_leaf()? {
                        self.frames.clear();
                        continue;
                    }
                    return self.after_position();
                }
                Leaf::Stale => {
                    self.frames.clear();
                    continue;
                }
                Leaf::Exhausted => match self.settle_backward_past_leaf()? {
                    Settle::Positioned => {
                        if !self.bind_key_from_leaf()? {
                            self.frames.clear();
                            continue;
                        }
                        return self.after_position();
                    }
                    Settle::End => {
                        self.reset();
                        return Ok(());
                    }
                    Settle::Stale => {
                        self.frames.clear();
                        continue;
                    }
                },
            }
        }
    }

    /// Move `n` entries forward (or backward when negative), locking and
    /// loading only the final entry.
    pub fn skip(&mut self, n: i64) -> SmallResult {
        if self.key.is_none() {
            return Err(self.unpositioned_error());
        }
        if n == 0 {
            return self.maybe_load();
        }
        let autoload = self.autoload;
        self.autoload = false;
        let mut remaining = n.unsigned_abs();
        let mut result = Ok(());
        while remaining > 0 {
            result = if n > 0 { self.next() } else { self.previous() };
            if result.is_err() || self.key.is_none() {
                break;
            }
            remaining -= 1;
        }
        self.autoload = autoload;
        result?;
        if self.key.is_some() {
            self.maybe_load()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // value access
    // --------------------------------------------------------------

    /// Acquire the link-mode lock and materialise the value.
    pub fn load(&mut self) -> SmallResult {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(self.unpositioned_error()),
        };
        if let Err(e) = self.txn.lock_for_read(self.tree.id, &key) {
            self.value = CursorValue::NotLoaded;
            return Err(e);
        }
        let loaded = self.tree.load_value(&key)?;
        self.value = match loaded {
            Some(v) => CursorValue::Value(v),
            None => CursorValue::Absent,
        };
        Ok(())
    }

    /// Stream a slice of the value at the cursor without materialising
    /// all of it; the workhorse behind large-value reads.
    pub fn read_value_at(&mut self, pos: u64, out: &mut [u8]) -> Result<usize, SmallError> {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(self.unpositioned_error()),
        };
        self.txn.lock_for_read(self.tree.id, &key)?;
        self.tree.read_value_range(&key, pos, out)
    }

    /// Store a value at the cursor's key through the linked transaction.
    pub fn store(&mut self, value: &[u8]) -> SmallResult {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(self.unpositioned_error()),
        };
        self.txn.store(&self.tree, &key, value)?;
        self.value = CursorValue::Value(value.to_vec());
        Ok(())
    }

    /// Delete the entry at the cursor's key through the linked
    /// transaction.
    pub fn delete(&mut self) -> SmallResult {
        let key = match &self.key {
            Some(k) => k.clone(),
            None => return Err(self.unpositioned_error()),
        };
        self.txn.delete(&self.tree, &key)?;
        self.value = CursorValue::Absent;
        Ok(())
    }

    fn after_position(&mut self) -> SmallResult {
        if self.autoload && self.key.is_some() {
            self.load()
        } else {
            self.value = CursorValue::NotLoaded;
            Ok(())
        }
    }

    fn maybe_load(&mut self) -> SmallResult {
        if self.autoload {
            self.load()
        } else {
            self.value = CursorValue::NotLoaded;
            Ok(())
        }
    }

    // --------------------------------------------------------------
    // frame machinery
    // --------------------------------------------------------------

    /// Build the frame stack root-to-leaf for the target.
    fn descend(&mut self, target: Target) -> SmallResult {
        'restart: loop {
            self.frames.clear();
            let mut pid = self.tree.root_pid();
            loop {
                let pod = self.tree.ctx().cache.get_or_load(pid, NodeType::Leaf)?;
                let guard = pod.rl();
                if guard.pid != pid {
                    continue 'restart;
                }
                let version = guard.version;
                match guard.node_type {
                    NodeType::Leaf => {
                        let pos = match &target {
                            Target::Key(key) => match guard.binary_search(key)? {
                                Ok(i) => i,
                                Err(i) => i,
                            },
                            Target::First => 0,
                            Target::Last => guard.num_slots().saturating_sub(1),
                        };
                        drop(guard);
                        self.frames.push(Frame {
                            pod,
                            pid,
                            version,
                            pos,
                        });
                        return Ok(());
                    }
                    NodeType::Internal => {
                        let pos = match &target {
                            Target::Key(key) => guard.child_pos_for(key)?,
                            Target::First => 0,
                            Target::Last => guard.num_slots(),
                        };
                        let child = guard.child_id(pos)?;
                        drop(guard);
                        self.frames.push(Frame {
                            pod,
                            pid,
                            version,
                            pos,
                        });
                        pid = child;
                    }
                    _ => {
                        return Err(SmallError::corrupt(&format!(
                            "page {} is not a tree node",
                            pid
                        )))
                    }
                }
            }
        }
    }

    /// Normalise a forward position: when the leaf frame's position is
    /// past the last entry, ascend to the next subtree and descend to
    /// its first entry.
    fn settle_forward(&mut self) -> Result<Settle, SmallError> {
        loop {
            // leaf frame with a valid position?
            {
                let frame = match self.frames.last() {
                    Some(f) => f,
                    None => return Ok(Settle::End),
                };
                let guard = frame.pod.rl();
                if guard.pid != frame.pid || guard.version != frame.version {
                    return Ok(Settle::Stale);
                }
                if guard.node_type == NodeType::Leaf && frame.pos < guard.num_slots() {
                    return Ok(Settle::Positioned);
                }
            }

            // ascend to the first ancestor with a following child
            self.frames.pop();
            let child = loop {
                let advanced = {
                    let frame = match self.frames.last_mut() {
                        Some(f) => f,
                        None => return Ok(Settle::End),
                    };
                    let guard = frame.pod.rl();
                    if guard.pid != frame.pid || guard.version != frame.version {
                        return Ok(Settle::Stale);
                    }
                    if frame.pos < guard.num_slots() {
                        frame.pos += 1;
                        Some(guard.child_id(frame.pos)?)
                    } else {
                        None
                    }
                };
                match advanced {
                    Some(child) => break child,
                    None => {
                        self.frames.pop();
                    }
                }
            };

            match self.push_first_of(child)? {
                Settle::Positioned => return Ok(Settle::Positioned),
                Settle::Stale => return Ok(Settle::Stale),
                // an empty leaf at the edge: loop and keep ascending
                Settle::End => continue,
            }
        }
    }

    fn settle_backward(&mut self) -> Result<Settle, SmallError> {
        {
            let frame = match self.frames.last() {
                Some(f) => f,
                None => return Ok(Settle::End),
            };
            let guard = frame.pod.rl();
            if guard.pid != frame.pid || guard.version != frame.version {
                return Ok(Settle::Stale);
            }
            if guard.node_type == NodeType::Leaf
                && guard.num_slots() > 0
                && frame.pos < guard.num_slots()
            {
                return Ok(Settle::Positioned);
            }
        }
        self.settle_backward_past_leaf()
    }

    /// Ascend to the preceding subtree and descend to its last entry.
    fn settle_backward_past_leaf(&mut self) -> Result<Settle, SmallError> {
        loop {
            self.frames.pop();
            let child = loop {
                let descended = {
                    let frame = match self.frames.last_mut() {
                        Some(f) => f,
                        None => return Ok(Settle::End),
                    };
                    let guard = frame.pod.rl();
                    if guard.pid != frame.pid || guard.version != frame.version {
                        return Ok(Settle::Stale);
                    }
                    if frame.pos > 0 {
                        frame.pos -= 1;
                        Some(guard.child_id(frame.pos)?)
                    } else {
                        None
                    }
                };
                match descended {
                    Some(child) => break child,
                    None => {
                        self.frames.pop();
                    }
                }
            };

            match self.push_last_of(child)? {
                Settle::Positioned => return Ok(Settle::Positioned),
                Settle::Stale => return Ok(Settle::Stale),
                Settle::End => continue,
            }
        }
    }

    /// Push frames down to the first entry of the subtree at `pid`.
    /// `End` means the subtree is empty (an edge leaf).
    fn push_first_of(&mut self, mut pid: PageId) -> Result<Settle, SmallError> {
        loop {
            let pod = self.tree.ctx().cache.get_or_load(pid, NodeType::Leaf)?;
            let guard = pod.rl();
            if guard.pid != pid {
                return Ok(Settle::Stale);
            }
            let version = guard.version;
            match guard.node_type {
                NodeType::Leaf => {
                    let has_entries = guard.num_slots() > 0;
                    drop(guard);
                    self.frames.push(Frame {
                        pod,
                        pid,
                        version,
                        pos: 0,
                    });
                    return Ok(if has_entries {
                        Settle::Positioned
                    } else {
                        Settle::End
                    });
                }
                NodeType::Internal => {
                    let child = guard.child_id(0)?;
                    drop(guard);
                    self.frames.push(Frame {
                        pod,
                        pid,
                        version,
                        pos: 0,
                    });
                    pid = child;
                }
                _ => return Err(SmallError::corrupt("non-tree node in descent")),
            }
        }
    }

    fn push_last_of(&mut self, mut pid: PageId) -> Result<Settle, SmallError> {
        loop {
            let pod = self.tree.ctx().cache.get_or_load(pid, NodeType::Leaf)?;
            let guard = pod.rl();
            if guard.pid != pid {
                return Ok(Settle::Stale);
            }
            let version = guard.version;
            match guard.node_type {
                NodeType::Leaf => {
                    let n = guard.num_slots();
                    drop(guard);
                    self.frames.push(Frame {
                        pod,
                        pid,
                        version,
                        pos: n.saturating_sub(1),
                    });
                    return Ok(if n > 0 { Settle::Positioned } else { Settle::End });
                }
                NodeType::Internal => {
                    let pos = guard.num_slots();
                    let child = guard.child_id(pos)?;
                    drop(guard);
                    self.frames.push(Frame {
                        pod,
                        pid,
                        version,
                        pos,
                    });
                    pid = child;
                }
                _ => return Err(SmallError::corrupt("non-tree node in descent")),
            }
        }
    }

    /// Copy the key out of the leaf entry the frame points at. False
    /// means the frame went stale in between; the caller retries.
    fn bind_key_from_leaf(&mut self) -> Result<bool, SmallError> {
        let frame = self.frames.last().expect("no leaf frame");
        let guard = frame.pod.rl();
        if guard.pid == frame.pid
            && guard.version == frame.version
            && frame.pos < guard.num_slots()
        {
            self.key = Some(guard.key_at(frame.pos)?.to_vec());
            return Ok(true);
        }
        drop(guard);
        self.frames.clear();
        Ok(false)
    }
}
