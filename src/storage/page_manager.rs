//! The page manager: free/recycle/reserve queues, allocation and
//! compaction (C2).
//!
//! Locking: each queue's append side has its own mutex; all three remove
//! sides share the single `heads` mutex (the remove lock). The global
//! order is append locks (regular, then recycle, then reserve) before
//! the remove lock. The append side may take the remove lock (to
//! link a drained node); the remove side never takes an append lock.
//!
//! Queue node storage never comes from the regular append buffer: a
//! regular-freed page may still be referenced by the last checkpoint's
//! tree, and overwriting it before the next checkpoint commits would
//! corrupt the recoverable snapshot. Node pages are taken from the
//! recycle queue, the safe part of the regular queue, or file growth.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bit_vec::BitVec;
use log::{debug, info, warn};

use crate::error::SmallError;
use crate::io::{get_u48, put_u48};
use crate::storage::header::PM_STATE_LEN;
use crate::storage::page_queue::{
    decode_queue_state, encode_queue_node, encode_queue_state, set_queue_node_next,
    QueueAppend, QueueHead, QueueKind, QUEUE_STATE_LEN,
};
use crate::storage::page_store::PageStore;
use crate::types::{PageId, SmallResult, NO_PAGE};

const REGULAR: usize = 0;
const RECYCLE: usize = 1;
const RESERVE: usize = 2;

/// First page id available for allocation; 0 and 1 are the header slots.
pub const FIRST_USABLE_PAGE: PageId = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocMode {
    /// Take a free page or grow the file.
    Normal,
    /// Take a free page, or return `NO_PAGE` rather than grow the file
    /// or raid the reserve queue. Used while relocating pages out of the
    /// compaction zone.
    TryReserve,
}

struct Heads {
    queues: [QueueHead; 3],
    /// Snapshot of the regular queue's on-page append count, taken at
    /// `commit_start`, promoted to `safe_count` at `commit_end`.
    pending_safe_regular: u64,
}

pub struct PageManager {
    store: Arc<dyn PageStore>,
    appends: [Mutex<QueueAppend>; 3],
    heads: Mutex<Heads>,
    total_page_count: AtomicU64,
    compacting: AtomicBool,
    compact_target: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PageManagerStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub recycled_pages: u64,
    pub reserved_pages: u64,
}

impl PageManager {
    /// Manager for a freshly formatted store: nothing free, the two
    /// header pages allocated.
    pub fn new(store: Arc<dyn PageStore>) -> Self {
        Self {
            store,
            appends: [
                Mutex::new(QueueAppend::new()),
                Mutex::new(QueueAppend::new()),
                Mutex::new(QueueAppend::new()),
            ],
            heads: Mutex::new(Heads {
                queues: [QueueHead::new(), QueueHead::new(), QueueHead::new()],
                pending_safe_regular: 0,
            }),
            total_page_count: AtomicU64::new(FIRST_USABLE_PAGE),
            compacting: AtomicBool::new(false),
            compact_target: AtomicU64::new(0),
        }
    }

    /// Restore from the state a checkpoint serialised via `commit_start`.
    pub fn restore(store: Arc<dyn PageStore>, state: &[u8]) -> Result<Self, SmallError> {
        assert!(state.len() >= PM_STATE_LEN);
        let mut appends = Vec::with_capacity(3);
        let mut queues = Vec::with_capacity(3);
        for i in 0..3 {
            let (append, head) = decode_queue_state(state, i * QUEUE_STATE_LEN, store.as_ref())?;
            appends.push(Mutex::new(append));
            queues.push(head);
        }
        let total = get_u48(state, 3 * QUEUE_STATE_LEN);
        if total < FIRST_USABLE_PAGE {
            return Err(SmallError::corrupt(&format!(
                "total page count too small: {}",
                total
            )));
        }
        let manager = Self {
            store,
            appends: match appends.try_into() {
                Ok(a) => a,
                Err(_) => unreachable!(),
            },
            heads: Mutex::new(Heads {
                queues: match queues.try_into() {
                    Ok(q) => q,
                    Err(_) => unreachable!(),
                },
                pending_safe_regular: 0,
            }),
            total_page_count: AtomicU64::new(total),
            compacting: AtomicBool::new(false),
            compact_target: AtomicU64::new(0),
        };

        // a crash mid-compaction leaves pages stranded on the reserve
        // queue; hand them back to the regular queue
        manager.dismantle_reserve(u64::MAX, REGULAR)?;
        Ok(manager)
    }

    pub fn total_page_count(&self) -> PageId {
        self.total_page_count.load(Ordering::Acquire)
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub fn compact_target(&self) -> PageId {
        self.compact_target.load(Ordering::Acquire)
    }

    // --------------------------------------------------------------
    // allocation
    // --------------------------------------------------------------

    /// Allocate a page id. The result is not in any queue and is below
    /// `total_page_count`. Returns `NO_PAGE` only in `TryReserve` mode.
    pub fn alloc_page(&self, mode: AllocMode) -> Result<PageId, SmallError> {
        loop {
            let pid = self.alloc_raw(mode)?;
            if pid == NO_PAGE {
                debug_assert_eq!(mode, AllocMode::TryReserve);
                return Ok(NO_PAGE);
            }
            // while compacting, a page inside the zone must not carry
            // new data; quarantine it and retry
            if mode == AllocMode::Normal
                && self.is_compacting()
                && pid >= self.compact_target()
            {
                self.append_to(RESERVE, pid)?;
                continue;
            }
            return Ok(pid);
        }
    }

    fn alloc_raw(&self, mode: AllocMode) -> Result<PageId, SmallError> {
        // fast path: un-append a recently recycled page
        if let Some(pid) = self.appends[RECYCLE].lock().unwrap().try_unappend() {
            return Ok(pid);
        }

        let mut released = Vec::new();
        let result = (|| {
            let mut heads = self.heads.lock().unwrap();

            let out = heads.queues[RECYCLE].try_remove(self.store.as_ref(), false)?;
            released.extend(out.released_node);
            if let Some(pid) = out.entry {
                return Ok(pid);
            }

            let out = heads.queues[REGULAR].try_remove(self.store.as_ref(), true)?;
            released.extend(out.released_node);
            if let Some(pid) = out.entry {
                return Ok(pid);
            }

            if mode == AllocMode::TryReserve {
                return Ok(NO_PAGE);
            }

            if self.is_compacting() {
                let out = heads.queues[RESERVE].try_remove(self.store.as_ref(), false)?;
                released.extend(out.released_node);
                if let Some(pid) = out.entry {
                    return Ok(pid);
                }
                // growth defeats the purpose of compaction; abort it
                warn!("allocation forced file growth, aborting compaction");
                self.compacting.store(false, Ordering::Release);
            }

            Ok(self.total_page_count.fetch_add(1, Ordering::AcqRel))
        })();

        self.free_released(released);
        result
    }

    /// Return a page freed by a tree operation; reusable only after the
    /// next successful checkpoint.
    pub fn delete_page(&self, pid: PageId) -> SmallResult {
        debug_assert!(pid >= FIRST_USABLE_PAGE && pid < self.total_page_count());
        if self.is_compacting() && pid >= self.compact_target() {
            return self.append_to(RESERVE, pid);
        }
        self.append_to(REGULAR, pid)
    }

    /// Return a page that may be reused within the current checkpoint.
    /// Only for pages no committed state can reference.
    pub fn recycle_page(&self, pid: PageId) -> SmallResult {
        debug_assert!(pid >= FIRST_USABLE_PAGE && pid < self.total_page_count());
        if self.is_compacting() && pid >= self.compact_target() {
            return self.append_to(RESERVE, pid);
        }
        self.append_to(RECYCLE, pid)
    }

    fn append_to(&self, which: usize, pid: PageId) -> SmallResult {
        let mut append = self.appends[which].lock().unwrap();
        append.append(pid);
        if append.should_drain() {
            let released = self.drain_locked(which, &mut append)?;
            drop(append);
            self.free_released(released);
        }
        Ok(())
    }

    /// Buffer a free page without triggering a drain. Used for released
    /// queue-node pages to bound recursion.
    fn append_raw(&self, which: usize, pid: PageId) {
        self.appends[which].lock().unwrap().append(pid);
    }

    fn free_released(&self, released: Vec<PageId>) {
        for pid in released {
            self.append_raw(REGULAR, pid);
        }
    }

    // --------------------------------------------------------------
    // draining the append heap onto queue-node pages
    // --------------------------------------------------------------

    /// Drain the append heap into a new tail node. The caller holds the
    /// queue's append lock; the remove lock is taken briefly inside.
    /// Returns node pages released by allocation, to be freed by the
    /// caller after dropping the append lock.
    fn drain_locked(
        &self,
        which: usize,
        append: &mut QueueAppend,
    ) -> Result<Vec<PageId>, SmallError> {
        let mut ids = append.take_sorted();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut released = Vec::new();

        // the recycle queue stores its nodes in its own pages (they are
        // overwrite-safe by definition); the others must not
        let node_pid = if which == RECYCLE {
            ids.remove(0)
        } else {
            match self.alloc_queue_node_page(which, &mut released)? {
                Some(pid) => pid,
                None => {
                    // nothing free; growth
                    self.total_page_count.fetch_add(1, Ordering::AcqRel)
                }
            }
        };

        let bytes = encode_queue_node(self.store.page_size(), NO_PAGE, &ids);
        self.store.write_page(node_pid, &bytes)?;

        if append.tail_id == NO_PAGE {
            let mut heads = self.heads.lock().unwrap();
            heads.queues[which].set_first_node(node_pid, bytes);
        } else {
            let mut tail_bytes = vec![0u8; self.store.page_size()];
            self.store.read_page(append.tail_id, &mut tail_bytes)?;
            set_queue_node_next(&mut tail_bytes, node_pid);
            self.store.write_page(append.tail_id, &tail_bytes)?;
            let mut heads = self.heads.lock().unwrap();
            heads.queues[which].link_generation += 1;
        }

        append.tail_id = node_pid;
        append.append_count += ids.len() as u64;
        debug!(
            "queue {:?} drained {} ids to node page {}",
            kind_of(which),
            ids.len(),
            node_pid
        );
        Ok(released)
    }

    /// A page suitable for queue node storage: recycle queue, safe part
    /// of the regular queue, or file growth. Touches only the remove
    /// lock. While compacting, in-zone candidates are quarantined unless
    /// the node is for the reserve queue itself (whose node pages are
    /// accounted for by `compaction_verify`).
    fn alloc_queue_node_page(
        &self,
        which: usize,
        released: &mut Vec<PageId>,
    ) -> Result<Option<PageId>, SmallError> {
        let mut heads = self.heads.lock().unwrap();
        loop {
            let out = heads.queues[RECYCLE].try_remove(self.store.as_ref(), false)?;
            released.extend(out.released_node);
            let entry = match out.entry {
                Some(pid) => Some(pid),
                None => {
                    let out = heads.queues[REGULAR].try_remove(self.store.as_ref(), true)?;
                    released.extend(out.released_node);
                    out.entry
                }
            };
            match entry {
                Some(pid) => {
                    if which != RESERVE
                        && self.is_compacting()
                        && pid >= self.compact_target()
                    {
                        drop(heads);
                        self.append_raw(RESERVE, pid);
                        heads = self.heads.lock().unwrap();
                        continue;
                    }
                    return Ok(Some(pid));
                }
                None => return Ok(None),
            }
        }
    }

    // --------------------------------------------------------------
    // checkpoint
    // --------------------------------------------------------------

    /// Serialise queue metadata and the page count into `state`. Called
    /// with mutations quiesced (the checkpoint holds the commit latch
    /// exclusively); drains every append heap first so the persisted
    /// state is entirely on pages.
    pub fn commit_start(&self, state: &mut [u8]) -> SmallResult {
        assert!(state.len() >= PM_STATE_LEN);

        // drain until no buffered ids remain; each round may release
        // exhausted node pages which re-enter the regular buffer
        for round in 0.. {
            let mut any = false;
            for which in [REGULAR, RECYCLE, RESERVE] {
                let mut append = self.appends[which].lock().unwrap();
                if append.buffered() > 0 {
                    any = true;
                    let released = self.drain_locked(which, &mut append)?;
                    drop(append);
                    self.free_released(released);
                }
            }
            if !any {
                break;
            }
            if round > 64 {
                return Err(SmallError::corrupt(
                    "page queues failed to settle during checkpoint",
                ));
            }
        }

        // full lock: appends in fixed order, then the remove lock
        let a0 = self.appends[REGULAR].lock().unwrap();
        let a1 = self.appends[RECYCLE].lock().unwrap();
        let a2 = self.appends[RESERVE].lock().unwrap();
        let mut heads = self.heads.lock().unwrap();

        if a0.buffered() + a1.buffered() + a2.buffered() > 0 {
            return Err(SmallError::corrupt(
                "append heaps not drained at checkpoint",
            ));
        }

        // recycle and reserve entries are removable right away; only the
        // regular queue's boundary waits for commit_end, so its encoded
        // safe count is the conservative pre-commit value
        heads.queues[RECYCLE].safe_count = a1.append_count;
        heads.queues[RESERVE].safe_count = a2.append_count;
        heads.pending_safe_regular = a0.append_count;

        state[..PM_STATE_LEN].fill(0);
        encode_queue_state(state, 0, &a0, &heads.queues[REGULAR]);
        encode_queue_state(state, QUEUE_STATE_LEN, &a1, &heads.queues[RECYCLE]);
        encode_queue_state(state, 2 * QUEUE_STATE_LEN, &a2, &heads.queues[RESERVE]);
        put_u48(state, 3 * QUEUE_STATE_LEN, self.total_page_count());
        Ok(())
    }

    /// The header made it to disk: regular-freed pages recorded by this
    /// checkpoint become removable.
    pub fn commit_end(&self) {
        let mut heads = self.heads.lock().unwrap();
        let pending = heads.pending_safe_regular;
        heads.queues[REGULAR].safe_count = pending;
    }

    // --------------------------------------------------------------
    // compaction
    // --------------------------------------------------------------

    /// Begin compacting: no page ≥ `target` may carry new data from now
    /// on. Returns false when the target is not below the current size.
    pub fn compaction_start(&self, target: PageId) -> Result<bool, SmallError> {
        let _heads = self.heads.lock().unwrap();
        if self.is_compacting() {
            return Ok(false);
        }
        if target < FIRST_USABLE_PAGE || target >= self.total_page_count() {
            return Ok(false);
        }
        self.compact_target.store(target, Ordering::Release);
        self.compacting.store(true, Ordering::Release);
        info!(
            "compaction started, target: {}, total: {}",
            target,
            self.total_page_count()
        );
        Ok(true)
    }

    /// Walk the regular and recycle queues, relocating every listed page
    /// inside the zone onto the reserve queue.
    pub fn compaction_scan_free_list(&self) -> SmallResult {
        if !self.is_compacting() {
            return Ok(());
        }
        let target = self.compact_target();

        for which in [REGULAR, RECYCLE] {
            // bound the walk by the entry population at the start so
            // re-appended survivors are not revisited forever
            let population = {
                let append = self.appends[which].lock().unwrap();
                let heads = self.heads.lock().unwrap();
                append.buffered() as u64 + append.append_count
                    - heads.queues[which].remove_count
            };

            for _ in 0..population {
                let popped = {
                    let from_buffer = self.appends[which].lock().unwrap().try_unappend();
                    match from_buffer {
                        Some(pid) => Some(pid),
                        None => {
                            let mut released = Vec::new();
                            let entry = {
                                let mut heads = self.heads.lock().unwrap();
                                let out = heads.queues[which]
                                    .try_remove(self.store.as_ref(), false)?;
                                released.extend(out.released_node);
                                out.entry
                            };
                            self.free_released(released);
                            entry
                        }
                    }
                };
                let pid = match popped {
                    Some(pid) => pid,
                    None => break,
                };
                if pid >= target {
                    self.append_to(RESERVE, pid)?;
                } else {
                    self.append_to(which, pid)?;
                }
            }
        }
        Ok(())
    }

    /// Check that every page in `[target, total_page_count)` is accounted
    /// for by the reserve queue (as an entry or as one of its own node
    /// pages) and that no other queue keeps a node page in the zone.
    pub fn compaction_verify(&self) -> Result<bool, SmallError> {
        if !self.is_compacting() {
            return Ok(false);
        }
        let target = self.compact_target();
        let total = self.total_page_count();

        let a0 = self.appends[REGULAR].lock().unwrap();
        let a1 = self.appends[RECYCLE].lock().unwrap();
        let mut a2 = self.appends[RESERVE].lock().unwrap();
        let heads = self.heads.lock().unwrap();

        let mut zone = BitVec::from_elem((total - target) as usize, false);
        let mut mark = |pid: PageId, zone: &mut BitVec| {
            if pid >= target && pid < total {
                zone.set((pid - target) as usize, true);
            }
        };

        let (entries, nodes) = heads.queues[RESERVE].iterate(self.store.as_ref())?;
        for pid in entries.iter().chain(nodes.iter()) {
            mark(*pid, &mut zone);
        }
        // buffered reserve ids: drain-free peek by un/re-append
        let buffered = {
            let mut tmp = Vec::new();
            while let Some(pid) = a2.try_unappend() {
                tmp.push(pid);
            }
            for pid in &tmp {
                a2.append(*pid);
            }
            tmp
        };
        for pid in buffered {
            mark(pid, &mut zone);
        }

        // other queues must not pin node pages inside the zone
        for (append, head) in [
            (&a0, &heads.queues[REGULAR]),
            (&a1, &heads.queues[RECYCLE]),
        ] {
            let (_, nodes) = head.iterate(self.store.as_ref())?;
            for pid in nodes {
                if pid >= target {
                    debug!("queue node {} still inside compaction zone", pid);
                    return Ok(false);
                }
            }
            if append.tail_id >= target && append.tail_id != NO_PAGE {
                return Ok(false);
            }
        }

        Ok(zone.all())
    }

    /// Commit (`success`) or abort the compaction. On success the page
    /// count drops to the target; either way reserve entries below the
    /// new count return to the regular queue.
    pub fn compaction_end(&self, success: bool) -> SmallResult {
        if !self.is_compacting() {
            return Ok(());
        }
        let limit = if success {
            self.compact_target()
        } else {
            u64::MAX
        };
        self.compacting.store(false, Ordering::Release);
        // on success the caller has already checkpointed the relocated
        // tree, so nothing durable references the reserved pages and
        // they can recycle; an abort is conservative
        let destination = if success { RECYCLE } else { REGULAR };
        self.dismantle_reserve(limit, destination)?;
        if success {
            let target = self.compact_target();
            self.total_page_count.store(target, Ordering::Release);
            info!("compaction finished, new total: {}", target);
        } else {
            info!("compaction aborted");
        }
        Ok(())
    }

    /// Empty the reserve queue, returning every page below `limit` to
    /// the given queue and dropping the rest (they fall off the end of
    /// the truncated file).
    fn dismantle_reserve(&self, limit: PageId, destination: usize) -> SmallResult {
        let mut survivors = Vec::new();
        {
            let mut append = self.appends[RESERVE].lock().unwrap();
            let mut heads = self.heads.lock().unwrap();

            for pid in append.take_sorted() {
                if pid < limit {
                    survivors.push(pid);
                }
            }
            loop {
                let out = heads.queues[RESERVE].try_remove(self.store.as_ref(), false)?;
                for pid in out.released_node {
                    if pid < limit {
                        survivors.push(pid);
                    }
                }
                match out.entry {
                    Some(pid) => {
                        if pid < limit {
                            survivors.push(pid);
                        }
                    }
                    None => break,
                }
            }
            // the stranded tail node, if any
            if heads.queues[RESERVE].head_id != NO_PAGE {
                let tail = heads.queues[RESERVE].head_id;
                if tail < limit {
                    survivors.push(tail);
                }
            }
            heads.queues[RESERVE] = QueueHead::new();
            *append = QueueAppend::new();
        }
        for pid in survivors {
            self.append_raw(destination, pid);
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // stats
    // --------------------------------------------------------------

    pub fn stats(&self) -> PageManagerStats {
        let heads = self.heads.lock().unwrap();
        let population = |which: usize| {
            let append = self.appends[which].lock().unwrap();
            append.buffered() as u64 + append.append_count - heads.queues[which].remove_count
        };
        PageManagerStats {
            total_pages: self.total_page_count(),
            free_pages: population(REGULAR),
            recycled_pages: population(RECYCLE),
            reserved_pages: population(RESERVE),
        }
    }
}

fn kind_of(which: usize) -> QueueKind {
    match which {
        REGULAR => QueueKind::Regular,
        RECYCLE => QueueKind::Recycle,
        _ => QueueKind::Reserve,
    }
}
