//! The B+ tree (C7): key-ordered nodes, search, insert, delete,
//! split/merge, and page relocation for compaction.
//!
//! Descent discipline: readers take shared node latches root-to-leaf,
//! holding each parent until the child is latched (the recursion keeps
//! the parent guard alive across the child acquisition). Writers first
//! descend optimistically (shared on internal nodes, exclusive only on
//! the leaf) and redo the descent with exclusive latches all the way
//! down when the leaf cannot absorb the operation, so splits and merges
//! always run under an exclusively latched spine.
//!
//! Nodes reference each other by page id only; every hop goes through
//! the node cache and re-validates the id after latching, because an
//! eviction may rebind the in-memory node under a stale handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use log::debug;

use crate::btree::fragment;
use crate::btree::node::{
    encode_inline_value, encode_internal_entry, encode_leaf_entry_raw, CachedState, Node,
    NodeType, ValueRef, LEAF_HEADER_LEN, MAX_INLINE_VALUE,
};
use crate::btree::node_cache::NodeCache;
use crate::error::{ErrorKind, SmallError};
use crate::storage::page_manager::{AllocMode, PageManager};
use crate::storage::page_store::PageStore;
use crate::types::{IndexId, PageId, Pod, SmallResult, NO_PAGE};
use crate::utils::{display_key, HandyRwLock};

/// Shared plumbing every tree operates over; owned by the database.
pub struct TreeContext {
    pub store: Arc<dyn PageStore>,
    pub pm: PageManager,
    pub cache: NodeCache,
    /// Which dirty sentinel new mutations carry; flipped by the
    /// checkpoint.
    dirty_flip: AtomicBool,
}

impl TreeContext {
    pub fn new(store: Arc<dyn PageStore>, pm: PageManager, cache: NodeCache) -> Self {
        Self {
            store,
            pm,
            cache,
            dirty_flip: AtomicBool::new(false),
        }
    }

    pub fn dirty_state(&self) -> CachedState {
        if self.dirty_flip.load(Ordering::Acquire) {
            CachedState::DirtyB
        } else {
            CachedState::DirtyA
        }
    }

    /// Flip the sentinel; returns the state the running checkpoint must
    /// flush.
    pub fn flip_dirty_state(&self) -> CachedState {
        let previous = self.dirty_state();
        self.dirty_flip
            .store(previous == CachedState::DirtyA, Ordering::Release);
        previous
    }

    pub fn alloc_tree_page(&self) -> Result<PageId, SmallError> {
        self.pm.alloc_page(AllocMode::Normal)
    }
}

/// Values above this stay out of the leaf. Grows with the page but never
/// past the inline encoding limit.
pub fn inline_threshold(page_size: usize) -> usize {
    (page_size / 4 - 32).min(MAX_INLINE_VALUE)
}

/// Keys have to stay small enough that several fit a node.
pub fn max_key_length(page_size: usize) -> usize {
    (page_size / 16).max(32)
}

/// A leaf merge is attempted below this many live bytes.
fn merge_threshold(page_size: usize) -> usize {
    (page_size - LEAF_HEADER_LEN) / 4
}

// ------------------------------------------------------------------
// write plumbing
// ------------------------------------------------------------------

/// What a write descent does at the leaf.
enum Apply<'a> {
    /// Insert or replace with this encoded value portion.
    Put { encoded_value: &'a [u8] },
    /// Overwrite the value with a ghost marker (transactional delete).
    Ghost,
    /// Physically remove the entry (ghost materialisation, rollback of
    /// an insert, or a non-transactional delete).
    Remove,
}

/// Fragmented values displaced by a write; freed after latches drop.
struct Displaced {
    values: Vec<(u8, Vec<u8>)>,
}

impl Displaced {
    fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn note(&mut self, value: &ValueRef) {
        if let ValueRef::Fragmented { flags, descriptor } = value {
            self.values.push((*flags, descriptor.to_vec()));
        }
    }

    fn free(self, ctx: &TreeContext) -> SmallResult {
        for (flags, descriptor) in self.values {
            let parsed = fragment::parse(flags, &descriptor, ctx.store.page_size())?;
            fragment::free(ctx, &parsed)?;
        }
        Ok(())
    }
}

enum StepOutcome {
    Done { underflow: bool },
    Split { pivot: Vec<u8>, right: PageId },
    /// Node was rebound under us; redo the whole descent.
    Retry,
    /// The optimistic pass cannot absorb the operation.
    NeedsExclusive,
}

pub struct Tree {
    pub id: IndexId,
    pub name: RwLock<Option<Vec<u8>>>,
    root: RwLock<PageId>,
    ctx: Arc<TreeContext>,
}

impl Tree {
    pub fn open(ctx: Arc<TreeContext>, id: IndexId, name: Option<Vec<u8>>, root: PageId) -> Self {
        Self {
            id,
            name: RwLock::new(name),
            root: RwLock::new(root),
            ctx,
        }
    }

    /// Create a tree with a fresh, empty root leaf.
    pub fn create(
        ctx: Arc<TreeContext>,
        id: IndexId,
        name: Option<Vec<u8>>,
    ) -> Result<Self, SmallError> {
        let root_pid = ctx.alloc_tree_page()?;
        let dirty = ctx.dirty_state();
        let pod = ctx.cache.create(root_pid, |node| node.init_leaf())?;
        pod.wl().cached_state = dirty;
        ctx.cache.make_unevictable(root_pid);
        debug!("tree {} created, root page {}", id, root_pid);
        Ok(Self::open(ctx, id, name, root_pid))
    }

    pub fn ctx(&self) -> &Arc<TreeContext> {
        &self.ctx
    }

    pub fn root_pid(&self) -> PageId {
        *self.root.rl()
    }

    fn install_root(&self, new_root: PageId) {
        let mut root = self.root.wl();
        let old = *root;
        *root = new_root;
        drop(root);
        self.ctx.cache.make_unevictable(new_root);
        self.ctx.cache.make_evictable(old);
        debug!("tree {} root moved {} -> {}", self.id, old, new_root);
    }

    /// Mark a node dirty under the current sentinel. A node still
    /// carrying the previous checkpoint's sentinel is flushed first, so
    /// the running checkpoint's snapshot never absorbs newer changes.
    fn mark_dirty(&self, node: &mut Node) -> SmallResult {
        let current = self.ctx.dirty_state();
        if node.is_dirty() && node.cached_state != current {
            self.ctx.cache.write_back(node)?;
        }
        node.cached_state = current;
        Ok(())
    }

    fn load_node(&self, pid: PageId) -> Result<Pod<Node>, SmallError> {
        self.ctx.cache.get_or_load(pid, NodeType::Leaf)
    }

    // --------------------------------------------------------------
    // reads
    // --------------------------------------------------------------

    /// Run `f` against the latched leaf that owns `key`. The whole spine
    /// stays share-latched while `f` runs.
    pub fn with_leaf_for<R>(
        &self,
        key: &[u8],
        f: impl FnOnce(&Node, Result<usize, usize>) -> Result<R, SmallError>,
    ) -> Result<R, SmallError> {
        let mut f = Some(f);
        loop {
            let root_pid = self.root_pid();
            let pod = self.load_node(root_pid)?;
            match self.read_step(&pod, root_pid, key, &mut f)? {
                Some(result) => return Ok(result),
                None => continue,
            }
        }
    }

    fn read_step<R>(
        &self,
        pod: &Pod<Node>,
        expect_pid: PageId,
        key: &[u8],
        f: &mut Option<impl FnOnce(&Node, Result<usize, usize>) -> Result<R, SmallError>>,
    ) -> Result<Option<R>, SmallError> {
        let guard = pod.rl();
        if guard.pid != expect_pid {
            return Ok(None);
        }
        match guard.node_type {
            NodeType::Leaf => {
                let found = guard.binary_search(key)?;
                let f = f.take().expect("leaf visited twice");
                Ok(Some(f(&guard, found)?))
            }
            NodeType::Internal => {
                let pos = guard.child_pos_for(key)?;
                let child_pid = guard.child_id(pos)?;
                let child = self.load_node(child_pid)?;
                // the parent guard is still alive: latch coupling
                let result = self.read_step(&child, child_pid, key, f);
                self.ctx.cache.used(child_pid);
                result
            }
            _ => Err(SmallError::corrupt(&format!(
                "page {} is not a tree node",
                guard.pid
            ))),
        }
    }

    /// Fully resolve the value for `key`. Ghosts read as absent.
    pub fn load_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        self.with_leaf_for(key, |leaf, found| match found {
            Err(_) => Ok(None),
            Ok(i) => match leaf.leaf_value(i)? {
                ValueRef::Inline(v) => Ok(Some(v.to_vec())),
                ValueRef::Ghost => Ok(None),
                ValueRef::Fragmented { flags, descriptor } => {
                    let parsed =
                        fragment::parse(flags, descriptor, self.ctx.store.page_size())?;
                    // fragment I/O under the leaf's shared latch is one
                    // of the two permitted held-across-I/O paths
                    Ok(Some(fragment::read_full(&self.ctx, &parsed)?))
                }
            },
        })
    }

    /// Whether `key` currently has a live (non-ghost) entry.
    pub fn contains(&self, key: &[u8]) -> Result<bool, SmallError> {
        self.with_leaf_for(key, |leaf, found| match found {
            Err(_) => Ok(false),
            Ok(i) => Ok(!matches!(leaf.leaf_value(i)?, ValueRef::Ghost)),
        })
    }

    /// Read part of the value for `key` without materialising all of
    /// it: the streaming path for fragmented values. Returns the bytes
    /// copied (0 when the key is absent or `pos` is past the end).
    pub fn read_value_range(
        &self,
        key: &[u8],
        pos: u64,
        out: &mut [u8],
    ) -> Result<usize, SmallError> {
        self.with_leaf_for(key, |leaf, found| match found {
            Err(_) => Ok(0),
            Ok(i) => match leaf.leaf_value(i)? {
                ValueRef::Ghost => Ok(0),
                ValueRef::Inline(v) => {
                    if pos >= v.len() as u64 {
                        return Ok(0);
                    }
                    let at = pos as usize;
                    let n = out.len().min(v.len() - at);
                    out[..n].copy_from_slice(&v[at..at + n]);
                    Ok(n)
                }
                ValueRef::Fragmented { flags, descriptor } => {
                    let parsed =
                        fragment::parse(flags, descriptor, self.ctx.store.page_size())?;
                    fragment::read_range(&self.ctx, &parsed, pos, out)
                }
            },
        })
    }

    // --------------------------------------------------------------
    // writes
    // --------------------------------------------------------------

    /// Insert or replace `key` with `value`, fragmenting large values.
    pub fn store_value(&self, key: &[u8], value: &[u8]) -> SmallResult {
        self.check_key(key)?;
        let page_size = self.ctx.store.page_size();
        let encoded = if value.len() > inline_threshold(page_size) {
            fragment::write_fragmented(&self.ctx, value)?
        } else {
            encode_inline_value(value)
        };
        self.write_op(key, Apply::Put {
            encoded_value: &encoded,
        })
    }

    /// Mark `key` as a ghost; the physical delete happens at commit.
    /// A miss is a no-op.
    pub fn ghost_delete(&self, key: &[u8]) -> SmallResult {
        self.write_op(key, Apply::Ghost)
    }

    /// Physically remove `key`, merging sparse nodes on the way out.
    pub fn delete_physical(&self, key: &[u8]) -> SmallResult {
        self.write_op(key, Apply::Remove)
    }

    fn check_key(&self, key: &[u8]) -> SmallResult {
        let max = max_key_length(self.ctx.store.page_size());
        if key.len() > max {
            return Err(SmallError::new(
                ErrorKind::LargeValue,
                &format!("key {} exceeds {} bytes", display_key(key), max),
            ));
        }
        Ok(())
    }

    fn write_op(&self, key: &[u8], apply: Apply) -> SmallResult {
        // optimistic pass: shared internals, exclusive leaf. Removals
        // go straight to the exclusive pass, which is where merges can
        // actually run.
        if !matches!(apply, Apply::Remove) {
            loop {
                let mut displaced = Displaced::new();
                let root_pid = self.root_pid();
                let pod = self.load_node(root_pid)?;
                match self.optimistic_step(&pod, root_pid, key, &apply, &mut displaced)? {
                    StepOutcome::Done { underflow: _ } => {
                        displaced.free(&self.ctx)?;
                        return Ok(());
                    }
                    StepOutcome::Retry => continue,
                    StepOutcome::NeedsExclusive => break,
                    StepOutcome::Split { .. } => unreachable!("optimistic pass never splits"),
                }
            }
        }

        // exclusive pass: the whole spine write-latched
        loop {
            let mut displaced = Displaced::new();
            let root_pid = self.root_pid();
            let pod = self.load_node(root_pid)?;
            let outcome = self.exclusive_step(&pod, root_pid, key, &apply, &mut displaced, true)?;
            match outcome {
                StepOutcome::Done { .. } => {
                    displaced.free(&self.ctx)?;
                    return Ok(());
                }
                StepOutcome::Retry => continue,
                StepOutcome::Split { .. } => {
                    unreachable!("root splits are handled inside the step")
                }
                StepOutcome::NeedsExclusive => unreachable!(),
            }
        }
    }

    fn optimistic_step(
        &self,
        pod: &Pod<Node>,
        expect_pid: PageId,
        key: &[u8],
        apply: &Apply,
        displaced: &mut Displaced,
    ) -> Result<StepOutcome, SmallError> {
        // peek at the node type under a shared latch
        let node_type = {
            let guard = pod.rl();
            if guard.pid != expect_pid {
                return Ok(StepOutcome::Retry);
            }
            guard.node_type
        };

        match node_type {
            NodeType::Leaf => {
                let mut guard = pod.wl();
                if guard.pid != expect_pid || guard.node_type != NodeType::Leaf {
                    return Ok(StepOutcome::Retry);
                }
                self.apply_to_leaf(&mut guard, key, apply, displaced, false)
            }
            NodeType::Internal => {
                let guard = pod.rl();
                if guard.pid != expect_pid || guard.node_type != NodeType::Internal {
                    return Ok(StepOutcome::Retry);
                }
                let pos = guard.child_pos_for(key)?;
                let child_pid = guard.child_id(pos)?;
                let child = self.load_node(child_pid)?;
                let outcome = self.optimistic_step(&child, child_pid, key, apply, displaced)?;
                self.ctx.cache.used(child_pid);
                match outcome {
                    // underflow is rebalanced by the exclusive pass
                    StepOutcome::Done { underflow } => Ok(StepOutcome::Done { underflow }),
                    other => Ok(other),
                }
            }
            _ => Err(SmallError::corrupt(&format!(
                "page {} is not a tree node",
                expect_pid
            ))),
        }
    }

    fn exclusive_step(
        &self,
        pod: &Pod<Node>,
        expect_pid: PageId,
        key: &[u8],
        apply: &Apply,
        displaced: &mut Displaced,
        is_root: bool,
    ) -> Result<StepOutcome, SmallError> {
        let mut guard = pod.wl();
        if guard.pid != expect_pid {
            return Ok(StepOutcome::Retry);
        }

        let outcome = match guard.node_type {
            NodeType::Leaf => self.apply_to_leaf(&mut guard, key, apply, displaced, true)?,
            NodeType::Internal => {
                let pos = guard.child_pos_for(key)?;
                let child_pid = guard.child_id(pos)?;
                let child = self.load_node(child_pid)?;
                let child_outcome =
                    self.exclusive_step(&child, child_pid, key, apply, displaced, false)?;
                match child_outcome {
                    StepOutcome::Retry => return Ok(StepOutcome::Retry),
                    StepOutcome::NeedsExclusive => unreachable!(),
                    StepOutcome::Done { underflow: false } => StepOutcome::Done { underflow: false },
                    StepOutcome::Done { underflow: true } => {
                        self.merge_children(&mut guard, pos)?;
                        let sparse = guard.live_bytes()?
                            < merge_threshold(self.ctx.store.page_size());
                        StepOutcome::Done { underflow: sparse }
                    }
                    StepOutcome::Split { pivot, right } => {
                        self.insert_child_split(&mut guard, pos, pivot, child_pid, right)?
                    }
                }
            }
            _ => {
                return Err(SmallError::corrupt(&format!(
                    "page {} is not a tree node",
                    expect_pid
                )))
            }
        };

        if !is_root {
            return Ok(outcome);
        }

        // root duties, still holding the root latch
        match outcome {
            StepOutcome::Split { pivot, right } => {
                let new_root_pid = self.ctx.alloc_tree_page()?;
                let dirty = self.ctx.dirty_state();
                let old_root_pid = guard.pid;
                let new_root = self.ctx.cache.create(new_root_pid, |node| {
                    node.init_internal(right);
                })?;
                {
                    let mut root_guard = new_root.wl();
                    let entry = encode_internal_entry(&pivot, old_root_pid);
                    let ok = root_guard.insert_entry(0, &entry)?;
                    debug_assert!(ok, "fresh root must absorb one entry");
                    root_guard.cached_state = dirty;
                }
                self.install_root(new_root_pid);
                Ok(StepOutcome::Done { underflow: false })
            }
            StepOutcome::Done { underflow } => {
                if underflow
                    && guard.node_type == NodeType::Internal
                    && guard.num_slots() == 0
                {
                    // the root holds no separator: its single child is
                    // the new root
                    let only_child = guard.rightmost_child();
                    let old_root = guard.pid;
                    self.install_root(only_child);
                    // invalidate any cursor frame bound to the old root
                    guard.version = guard.version.wrapping_add(1);
                    guard.cached_state = CachedState::Clean;
                    drop(guard);
                    self.ctx.cache.remove(old_root);
                    self.ctx.pm.delete_page(old_root)?;
                    return Ok(StepOutcome::Done { underflow: false });
                }
                Ok(StepOutcome::Done { underflow: false })
            }
            other => Ok(other),
        }
    }

    /// Apply the operation at the leaf. `may_split` distinguishes the
    /// exclusive pass (splits allowed) from the optimistic one.
    fn apply_to_leaf(
        &self,
        guard: &mut RwLockWriteGuard<'_, Node>,
        key: &[u8],
        apply: &Apply,
        displaced: &mut Displaced,
        may_split: bool,
    ) -> Result<StepOutcome, SmallError> {
        let page_size = self.ctx.store.page_size();
        let found = guard.binary_search(key)?;

        match apply {
            Apply::Put { encoded_value } => {
                match found {
                    Ok(i) => {
                        displaced.note(&guard.leaf_value(i)?);
                        if guard.try_replace_value(i, encoded_value)? {
                            self.mark_dirty(guard)?;
                            return Ok(StepOutcome::Done { underflow: false });
                        }
                        // would grow: remove then reinsert
                        let entry = encode_leaf_entry_raw(key, encoded_value);
                        if !may_split && !guard.fits(entry.len()) {
                            displaced.values.clear();
                            return Ok(StepOutcome::NeedsExclusive);
                        }
                        guard.delete_entry(i)?;
                        if guard.insert_entry(i, &entry)? {
                            self.mark_dirty(guard)?;
                            return Ok(StepOutcome::Done { underflow: false });
                        }
                        let outcome = self.split_leaf(guard, i, &entry)?;
                        self.mark_dirty(guard)?;
                        Ok(outcome)
                    }
                    Err(i) => {
                        let entry = encode_leaf_entry_raw(key, encoded_value);
                        if guard.insert_entry(i, &entry)? {
                            self.mark_dirty(guard)?;
                            return Ok(StepOutcome::Done { underflow: false });
                        }
                        if !may_split {
                            displaced.values.clear();
                            return Ok(StepOutcome::NeedsExclusive);
                        }
                        let outcome = self.split_leaf(guard, i, &entry)?;
                        self.mark_dirty(guard)?;
                        Ok(outcome)
                    }
                }
            }
            Apply::Ghost => match found {
                Ok(i) => {
                    if !matches!(guard.leaf_value(i)?, ValueRef::Ghost) {
                        guard.ghost_value(i)?;
                        self.mark_dirty(guard)?;
                    }
                    Ok(StepOutcome::Done { underflow: false })
                }
                Err(_) => Ok(StepOutcome::Done { underflow: false }),
            },
            Apply::Remove => match found {
                Ok(i) => {
                    displaced.note(&guard.leaf_value(i)?);
                    guard.delete_entry(i)?;
                    self.mark_dirty(guard)?;
                    let sparse = guard.live_bytes()? < merge_threshold(page_size);
                    Ok(StepOutcome::Done { underflow: sparse })
                }
                Err(_) => Ok(StepOutcome::Done { underflow: false }),
            },
        }
    }

    // --------------------------------------------------------------
    // split
    // --------------------------------------------------------------

    /// Split a full leaf while inserting `entry` at position `i`.
    /// Pivot policy: among split points in the middle third of the
    /// combined entry sequence, pick the one minimising
    /// |bytes_right − bytes_left|, breaking ties toward the lower index.
    fn split_leaf(
        &self,
        guard: &mut RwLockWriteGuard<'_, Node>,
        insert_pos: usize,
        entry: &[u8],
    ) -> Result<StepOutcome, SmallError> {
        let n = guard.num_slots();

        // combined sizes with the new entry spliced in
        let mut sizes = Vec::with_capacity(n + 1);
        for combined in 0..=n {
            if combined == insert_pos {
                sizes.push(entry.len() + 2);
            }
            if combined < n {
                sizes.push(guard.entry_bytes(combined)?.len() + 2);
            }
        }
        debug_assert_eq!(sizes.len(), n + 1);

        let split_at = choose_split(&sizes);

        // materialise everything that moves right; combined position c
        // maps to original c below the insert point, c - 1 above it
        let mut moved: Vec<Vec<u8>> = Vec::new();
        for combined in split_at..=n {
            if combined == insert_pos {
                moved.push(entry.to_vec());
            } else {
                let original = if combined < insert_pos {
                    combined
                } else {
                    combined - 1
                };
                moved.push(guard.entry_bytes(original)?.to_vec());
            }
        }

        // trim the left node
        let first_moved_original = if insert_pos < split_at {
            split_at - 1
        } else {
            split_at
        };
        for i in (first_moved_original..n).rev() {
            guard.delete_entry(i)?;
        }

        // build the right sibling
        let sibling_pid = self.ctx.alloc_tree_page()?;
        let dirty = self.ctx.dirty_state();
        let sibling = self.ctx.cache.create(sibling_pid, |node| node.init_leaf())?;
        {
            let mut sibling_guard = sibling.wl();
            for (j, bytes) in moved.iter().enumerate() {
                let ok = sibling_guard.insert_entry(j, bytes)?;
                debug_assert!(ok, "fresh sibling must absorb the moved entries");
            }
            sibling_guard.cached_state = dirty;
        }

        // the new entry may belong on the left
        if insert_pos < split_at {
            let ok = guard.insert_entry(insert_pos, entry)?;
            debug_assert!(ok, "left half must absorb the entry after the split");
        }

        let pivot = { sibling.rl().key_at(0)?.to_vec() };
        self.ctx.cache.make_evictable(sibling_pid);
        debug!(
            "leaf {} split at {} of {}, right sibling {}",
            guard.pid, split_at, n + 1, sibling_pid
        );
        Ok(StepOutcome::Split {
            pivot,
            right: sibling_pid,
        })
    }

    /// Record a child split in this internal node: insert the pivot
    /// pointing at the old child and repoint the following position at
    /// the new right sibling. Splits this node too when full.
    fn insert_child_split(
        &self,
        guard: &mut RwLockWriteGuard<'_, Node>,
        pos: usize,
        pivot: Vec<u8>,
        child: PageId,
        right: PageId,
    ) -> Result<StepOutcome, SmallError> {
        let entry = encode_internal_entry(&pivot, child);
        if guard.insert_entry(pos, &entry)? {
            guard.set_child_id(pos + 1, right)?;
            self.mark_dirty(guard)?;
            return Ok(StepOutcome::Done { underflow: false });
        }
        let outcome = self.split_internal(guard, pos, &pivot, child, right)?;
        self.mark_dirty(guard)?;
        Ok(outcome)
    }

    /// Split a full internal node around a promoted separator while
    /// inserting `(pivot, child)` at `pos` (with `right` becoming the
    /// child after it).
    fn split_internal(
        &self,
        guard: &mut RwLockWriteGuard<'_, Node>,
        pos: usize,
        pivot: &[u8],
        child: PageId,
        right: PageId,
    ) -> Result<StepOutcome, SmallError> {
        let n = guard.num_slots();

        // combined view: (key, left-child) pairs plus the final
        // rightmost child, with the pending entry spliced at `pos`;
        // the child *after* the pending entry becomes `right`
        let mut keys: Vec<Vec<u8>> = Vec::with_capacity(n + 1);
        let mut lefts: Vec<PageId> = Vec::with_capacity(n + 1);
        for i in 0..n {
            keys.push(guard.key_at(i)?.to_vec());
            lefts.push(guard.child_at(i)?);
        }
        let mut children: Vec<PageId> = lefts;
        children.push(guard.rightmost_child());
        keys.insert(pos, pivot.to_vec());
        children.insert(pos, child);
        children[pos + 1] = right;

        let sizes: Vec<usize> = keys
            .iter()
            .map(|k| encode_internal_entry(k, 0).len() + 2)
            .collect();
        let split_at = choose_split(&sizes).min(keys.len() - 1).max(1);

        // keys[split_at] promotes; left keeps [0, split_at), right gets
        // (split_at, ..]
        let promoted = keys[split_at].clone();
        let left_rightmost = children[split_at];

        let sibling_pid = self.ctx.alloc_tree_page()?;
        let dirty = self.ctx.dirty_state();
        let sibling = self
            .ctx
            .cache
            .create(sibling_pid, |node| node.init_internal(NO_PAGE))?;
        {
            let mut sibling_guard = sibling.wl();
            sibling_guard.set_rightmost_child(*children.last().unwrap());
            for (j, combined) in (split_at + 1..keys.len()).enumerate() {
                let bytes = encode_internal_entry(&keys[combined], children[combined]);
                let ok = sibling_guard.insert_entry(j, &bytes)?;
                debug_assert!(ok, "fresh sibling must absorb the moved entries");
            }
            sibling_guard.cached_state = dirty;
        }

        // rebuild the left node in place
        guard.init_internal(left_rightmost);
        for combined in 0..split_at {
            let bytes = encode_internal_entry(&keys[combined], children[combined]);
            let ok = guard.insert_entry(combined, &bytes)?;
            debug_assert!(ok, "left half must absorb its entries");
        }

        self.ctx.cache.make_evictable(sibling_pid);
        debug!(
            "internal {} split, promoted {}, right sibling {}",
            guard.pid,
            display_key(&promoted),
            sibling_pid
        );
        Ok(StepOutcome::Split {
            pivot: promoted,
            right: sibling_pid,
        })
    }

    // --------------------------------------------------------------
    // merge
    // --------------------------------------------------------------

    /// Try to merge the child at logical position `pos` with a
    /// neighbour; this node is exclusively latched. A merge that does
    /// not pay for itself is skipped.
    fn merge_children(
        &self,
        guard: &mut RwLockWriteGuard<'_, Node>,
        pos: usize,
    ) -> SmallResult {
        let n = guard.num_slots();
        if n == 0 {
            return Ok(());
        }
        // merge `left_pos` with `left_pos + 1`
        let left_pos = if pos >= n { pos - 1 } else { pos };

        let left_pid = guard.child_id(left_pos)?;
        let right_pid = guard.child_id(left_pos + 1)?;
        let left_pod = self.load_node(left_pid)?;
        let right_pod = self.load_node(right_pid)?;
        let mut left = left_pod.wl();
        if left.pid != left_pid {
            return Ok(());
        }
        let mut right = right_pod.wl();
        if right.pid != right_pid {
            return Ok(());
        }
        if left.node_type != right.node_type {
            return Err(SmallError::corrupt("sibling node type mismatch"));
        }

        let page_size = self.ctx.store.page_size();
        let separator = guard.key_at(left_pos)?.to_vec();
        let extra = match left.node_type {
            NodeType::Internal => encode_internal_entry(&separator, 0).len() + 2,
            _ => 0,
        };
        let budget = page_size - LEAF_HEADER_LEN - 16;
        if left.live_bytes()? + right.live_bytes()? + extra > budget {
            return Ok(());
        }

        match left.node_type {
            NodeType::Leaf => {
                let base = left.num_slots();
                for i in 0..right.num_slots() {
                    let bytes = right.entry_bytes(i)?.to_vec();
                    let ok = left.insert_entry(base + i, &bytes)?;
                    debug_assert!(ok, "merge target must absorb the entries");
                }
            }
            NodeType::Internal => {
                // pull the separator down, then the right node's entries
                let base = left.num_slots();
                let down = encode_internal_entry(&separator, left.rightmost_child());
                let ok = left.insert_entry(base, &down)?;
                debug_assert!(ok);
                for i in 0..right.num_slots() {
                    let bytes = right.entry_bytes(i)?.to_vec();
                    let ok = left.insert_entry(base + 1 + i, &bytes)?;
                    debug_assert!(ok);
                }
                let right_rightmost = right.rightmost_child();
                left.set_rightmost_child(right_rightmost);
            }
            _ => unreachable!(),
        }

        // unlink: the position after the separator now points at the
        // merged node, then the separator entry goes away
        guard.set_child_id(left_pos + 1, left_pid)?;
        guard.delete_entry(left_pos)?;
        self.mark_dirty(guard)?;
        self.mark_dirty(&mut left)?;

        right.version = right.version.wrapping_add(1);
        right.cached_state = CachedState::Clean;
        drop(right);
        self.ctx.cache.remove(right_pid);
        self.ctx.pm.delete_page(right_pid)?;
        debug!(
            "merged node {} into {} under {}",
            right_pid, left_pid, guard.pid
        );
        Ok(())
    }

    // --------------------------------------------------------------
    // maintenance
    // --------------------------------------------------------------

    /// Relocate every tree page at or above `target` to a lower page,
    /// so the compaction zone empties. Fragment and inode pages hang
    /// off leaf entries and are relocated along the way. Returns false
    /// when no page below the target could be allocated (the caller
    /// aborts the compaction).
    pub fn relocate_zone_pages(&self, target: PageId) -> Result<bool, SmallError> {
        self.relocate_subtree(self.root_pid(), None, target)
    }

    fn relocate_subtree(
        &self,
        pid: PageId,
        parent: Option<(PageId, usize)>,
        target: PageId,
    ) -> Result<bool, SmallError> {
        // children first, so parent pointer rewrites settle in one visit
        let (node_type, child_count) = {
            let pod = self.load_node(pid)?;
            let guard = pod.rl();
            if guard.pid != pid {
                return Ok(true);
            }
            (guard.node_type, guard.num_slots() + 1)
        };

        if node_type == NodeType::Internal {
            for pos in 0..child_count {
                let child_pid = {
                    let pod = self.load_node(pid)?;
                    let guard = pod.rl();
                    if guard.pid != pid {
                        return Ok(true);
                    }
                    guard.child_id(pos)?
                };
                if !self.relocate_subtree(child_pid, Some((pid, pos)), target)? {
                    return Ok(false);
                }
            }
        } else {
            // leaves may carry fragment trees
            if !self.relocate_fragments(pid, target)? {
                return Ok(false);
            }
        }

        if pid < target {
            return Ok(true);
        }

        // a destination inside the zone is useless; quarantine and retry
        let new_pid = loop {
            let candidate = self.ctx.pm.alloc_page(AllocMode::TryReserve)?;
            if candidate == NO_PAGE {
                return Ok(false);
            }
            if candidate >= target {
                self.ctx.pm.recycle_page(candidate)?;
                continue;
            }
            break candidate;
        };

        let pod = self.load_node(pid)?;
        {
            let mut guard = pod.wl();
            if guard.pid != pid {
                self.ctx.pm.recycle_page(new_pid)?;
                return Ok(true);
            }
            // the content moves wholesale; the cache drops the stale
            // mapping and reloads from the new location on demand
            guard.version = guard.version.wrapping_add(1);
            guard.cached_state = CachedState::Clean;
            self.ctx.store.write_page(new_pid, guard.data())?;
        }
        self.ctx.cache.remove(pid);
        self.ctx.pm.delete_page(pid)?;

        match parent {
            Some((parent_pid, pos)) => {
                let parent_pod = self.load_node(parent_pid)?;
                let mut parent_guard = parent_pod.wl();
                if parent_guard.pid != parent_pid {
                    return Err(SmallError::corrupt("parent vanished during relocation"));
                }
                parent_guard.set_child_id(pos, new_pid)?;
                self.mark_dirty(&mut parent_guard)?;
            }
            None => self.install_root(new_pid),
        }
        debug!("relocated page {} -> {} (target {})", pid, new_pid, target);
        Ok(true)
    }

    fn relocate_fragments(&self, leaf_pid: PageId, target: PageId) -> Result<bool, SmallError> {
        let fragmented: Vec<(Vec<u8>, u8, Vec<u8>)> = {
            let pod = self.load_node(leaf_pid)?;
            let guard = pod.rl();
            if guard.pid != leaf_pid {
                return Ok(true);
            }
            let mut list = Vec::new();
            for i in 0..guard.num_slots() {
                if let ValueRef::Fragmented { flags, descriptor } = guard.leaf_value(i)? {
                    let descriptor = descriptor.to_vec();
                    list.push((guard.key_at(i)?.to_vec(), flags, descriptor));
                }
            }
            list
        };

        for (key, flags, descriptor) in &fragmented {
            let value = fragment::parse(*flags, descriptor, self.ctx.store.page_size())?;
            let needs_move = value.direct.iter().any(|p| *p >= target)
                || (value.inode_root != NO_PAGE && value.inode_root >= target);
            if !needs_move {
                continue;
            }
            // rewriting the value re-fragments it below the target (new
            // allocations avoid the zone) and frees the old pages
            let bytes = match self.load_value(key)? {
                Some(bytes) => bytes,
                None => continue,
            };
            self.store_value(key, &bytes)?;
        }
        Ok(true)
    }

    /// Walk the whole tree checking layout and ordering invariants.
    pub fn verify(&self) -> SmallResult {
        self.verify_subtree(self.root_pid(), None, None)
    }

    fn verify_subtree(
        &self,
        pid: PageId,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> SmallResult {
        if pid >= self.ctx.pm.total_page_count() {
            return Err(SmallError::corrupt(&format!(
                "page {} beyond total page count",
                pid
            )));
        }
        let pod = self.load_node(pid)?;
        let (node_type, n, children): (NodeType, usize, Vec<PageId>) = {
            let guard = pod.rl();
            guard.check_integrity()?;
            for i in 0..guard.num_slots() {
                let key = guard.key_at(i)?;
                if let Some(lower) = &lower {
                    if key < lower.as_slice() {
                        return Err(SmallError::corrupt(&format!(
                            "page {} key below subtree bound",
                            pid
                        )));
                    }
                }
                if let Some(upper) = &upper {
                    if key >= upper.as_slice() {
                        return Err(SmallError::corrupt(&format!(
                            "page {} key above subtree bound",
                            pid
                        )));
                    }
                }
            }
            let mut children = Vec::new();
            if guard.node_type == NodeType::Internal {
                for pos in 0..=guard.num_slots() {
                    children.push(guard.child_id(pos)?);
                }
            }
            (guard.node_type, guard.num_slots(), children)
        };

        if node_type == NodeType::Internal {
            for (pos, child) in children.iter().enumerate() {
                let child_lower = if pos == 0 {
                    lower.clone()
                } else {
                    let pod = self.load_node(pid)?;
                    let guard = pod.rl();
                    Some(guard.key_at(pos - 1)?.to_vec())
                };
                let child_upper = if pos == n {
                    upper.clone()
                } else {
                    let pod = self.load_node(pid)?;
                    let guard = pod.rl();
                    Some(guard.key_at(pos)?.to_vec())
                };
                self.verify_subtree(*child, child_lower, child_upper)?;
            }
        }
        Ok(())
    }

    /// Count live (non-ghost) entries by walking the leaves.
    pub fn count_entries(&self) -> Result<u64, SmallError> {
        self.count_subtree(self.root_pid())
    }

    fn count_subtree(&self, pid: PageId) -> Result<u64, SmallError> {
        let pod = self.load_node(pid)?;
        let (node_type, slots, children): (NodeType, usize, Vec<PageId>) = {
            let guard = pod.rl();
            let mut children = Vec::new();
            if guard.node_type == NodeType::Internal {
                for pos in 0..=guard.num_slots() {
                    children.push(guard.child_id(pos)?);
                }
            }
            (guard.node_type, guard.num_slots(), children)
        };
        match node_type {
            NodeType::Leaf => {
                let pod = self.load_node(pid)?;
                let guard = pod.rl();
                let mut count = 0;
                for i in 0..slots.min(guard.num_slots()) {
                    if !matches!(guard.leaf_value(i)?, ValueRef::Ghost) {
                        count += 1;
                    }
                }
                Ok(count)
            }
            NodeType::Internal => {
                let mut count = 0;
                for child in children {
                    count += self.count_subtree(child)?;
                }
                Ok(count)
            }
            _ => Err(SmallError::corrupt("non-tree node in tree walk")),
        }
    }
}

/// Split-point choice shared by leaves and internals: minimise the byte
/// imbalance over the allowed middle-third candidates, ties toward the
/// lower index. `sizes` covers the combined entry sequence; the result
/// `s` means the left side keeps `sizes[..s]`.
fn choose_split(sizes: &[usize]) -> usize {
    let count = sizes.len();
    debug_assert!(count >= 2);
    let total: usize = sizes.iter().sum();

    let mut lo = count / 3;
    let mut hi = (2 * count) / 3;
    lo = lo.max(1);
    hi = hi.min(count - 1);
    if lo > hi {
        lo = 1;
        hi = count - 1;
    }

    let mut best = lo;
    let mut best_imbalance = usize::MAX;
    let mut left: usize = sizes[..lo].iter().sum();
    for s in lo..=hi {
        let right = total - left;
        let imbalance = left.max(right) - left.min(right);
        if imbalance < best_imbalance {
            best_imbalance = imbalance;
            best = s;
        }
        left += sizes[s];
    }
    best
}
