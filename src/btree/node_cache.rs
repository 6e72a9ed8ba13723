//! The node cache: a fixed-capacity pool of in-memory nodes with LRU
//! eviction (C3).
//!
//! One mutex (the cache latch) guards the pid → slot map and the
//! doubly-linked LRU chain; each node carries its own `RwLock` (the node
//! latch). Latch order is cache latch → node latch, and a node latch is
//! only ever *tried* while the cache latch is held; on contention the
//! cache latch is dropped and retaken rather than waiting, which is what
//! keeps the order safe.
//!
//! A node handed out by the cache can be rebound to a different page by
//! a concurrent eviction, so holders re-validate `node.pid` after
//! latching and retry on mismatch. An unbound node has `pid == NO_PAGE`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use log::debug;

use crate::btree::node::{CachedState, Node, NodeType};
use crate::error::{ErrorKind, SmallError};
use crate::storage::page_store::PageStore;
use crate::types::{PageId, Pod, SmallResult, NO_PAGE};
use crate::utils::HandyRwLock;

/// Eviction behaviour for [`NodeCache::alloc_latched`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocNodeMode {
    /// Grow up to capacity, then evict the least recently used node.
    Normal,
    /// Like `Normal`, but the node is not linked into the LRU chain;
    /// it cannot be evicted until `make_evictable` is called.
    Unevictable,
    /// Never evict: return `None` when the pool is full.
    NoEvict,
}

struct Slot {
    node: Pod<Node>,
    prev: Option<usize>,
    next: Option<usize>,
    in_chain: bool,
    /// Pid registered in the map for this slot, `NO_PAGE` when unbound.
    mapped: PageId,
}

struct CacheInner {
    map: HashMap<PageId, usize>,
    slots: Vec<Slot>,
    /// Most recently used end of the chain.
    head: Option<usize>,
    /// Least recently used end; eviction candidates.
    tail: Option<usize>,
    chain_len: usize,
    free: Vec<usize>,
}

impl CacheInner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.slots[idx].prev, self.slots[idx].next);
        match prev {
            Some(p) => self.slots[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].prev = prev,
            None => self.tail = prev,
        }
        self.slots[idx].prev = None;
        self.slots[idx].next = None;
        if self.slots[idx].in_chain {
            self.slots[idx].in_chain = false;
            self.chain_len -= 1;
        }
    }

    fn link_head(&mut self, idx: usize) {
        debug_assert!(!self.slots[idx].in_chain);
        self.slots[idx].prev = None;
        self.slots[idx].next = self.head;
        if let Some(h) = self.head {
            self.slots[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
        self.slots[idx].in_chain = true;
        self.chain_len += 1;
    }

    fn link_tail(&mut self, idx: usize) {
        debug_assert!(!self.slots[idx].in_chain);
        self.slots[idx].next = None;
        self.slots[idx].prev = self.tail;
        if let Some(t) = self.tail {
            self.slots[t].next = Some(idx);
        }
        self.tail = Some(idx);
        if self.head.is_none() {
            self.head = Some(idx);
        }
        self.slots[idx].in_chain = true;
        self.chain_len += 1;
    }
}

type WritebackBarrier = Arc<dyn Fn() -> SmallResult + Send + Sync>;

pub struct NodeCache {
    store: Arc<dyn PageStore>,
    page_size: usize,
    max_nodes: usize,
    inner: Mutex<CacheInner>,
    /// Called before a dirty node is written back outside a checkpoint;
    /// the engine uses it to uphold write-ahead ordering on the redo
    /// stream.
    writeback_barrier: Mutex<Option<WritebackBarrier>>,
    fragment_segments: Vec<Mutex<HashMap<PageId, Pod<Node>>>>,
    fragment_segment_cap: usize,
}

impl NodeCache {
    pub fn new(store: Arc<dyn PageStore>, max_nodes: usize) -> Self {
        let max_nodes = max_nodes.max(8);
        // power-of-two segment count for the lossy fragment cache
        let segments = 8;
        let fragment_segment_cap = (max_nodes / 4 / segments).max(2);
        let page_size = store.page_size();
        Self {
            store,
            page_size,
            max_nodes,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                slots: Vec::new(),
                head: None,
                tail: None,
                chain_len: 0,
                free: Vec::new(),
            }),
            writeback_barrier: Mutex::new(None),
            fragment_segments: (0..segments).map(|_| Mutex::new(HashMap::new())).collect(),
            fragment_segment_cap,
        }
    }

    pub fn set_writeback_barrier(&self, barrier: WritebackBarrier) {
        *self.writeback_barrier.lock().unwrap() = Some(barrier);
    }

    /// Write a dirty node out immediately, honouring the write-ahead
    /// barrier. Used by eviction and by mutators that catch a node still
    /// carrying the previous checkpoint's dirty sentinel: the node is
    /// flushed before it may be re-dirtied, keeping the running
    /// checkpoint's snapshot intact.
    pub fn write_back(&self, node: &mut Node) -> SmallResult {
        if !node.is_dirty() {
            return Ok(());
        }
        if let Some(barrier) = self.writeback_barrier.lock().unwrap().clone() {
            barrier()?;
        }
        self.store.write_page(node.pid, node.data())?;
        node.cached_state = CachedState::Clean;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.max_nodes
    }

    pub fn occupancy(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.slots.len() - inner.free.len()
    }

    // --------------------------------------------------------------
    // allocation & lookup
    // --------------------------------------------------------------

    /// Hand out an unbound node, evicting if the pool is full. The node
    /// is invisible to lookups until [`NodeCache::publish`].
    pub fn alloc_latched(&self, mode: AllocNodeMode) -> Result<Option<Pod<Node>>, SmallError> {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(idx) = inner.free.pop() {
                    let pod = Arc::clone(&inner.slots[idx].node);
                    return Ok(Some(pod));
                }
                if inner.slots.len() < self.max_nodes {
                    let node = Node::new_empty(self.page_size);
                    let pod = Arc::new(RwLock::new(node));
                    inner.slots.push(Slot {
                        node: Arc::clone(&pod),
                        prev: None,
                        next: None,
                        in_chain: false,
                        mapped: NO_PAGE,
                    });
                    let _ = mode;
                    return Ok(Some(pod));
                }
            }
            if mode == AllocNodeMode::NoEvict {
                return Ok(None);
            }
            if !self.evict_one()? {
                return Err(SmallError::new(
                    ErrorKind::Other,
                    "node cache exhausted: everything is pinned or dirty-locked",
                ));
            }
        }
    }

    /// Evict the least recently used node whose latch can be taken
    /// immediately, writing it back first when dirty. Returns false when
    /// no candidate was claimable.
    ///
    /// The node stays in the map until it is latched exclusively and
    /// clean, so no concurrent load can resurrect a stale disk image
    /// while dirty state is still in flight. Taking the cache latch
    /// while holding a node latch is safe here: every path that holds
    /// the cache latch only ever *tries* node latches.
    fn evict_one(&self) -> Result<bool, SmallError> {
        let mut attempts = 0;
        loop {
            // phase 1: pick the coldest candidate whose latch is free
            let picked = {
                let inner = self.inner.lock().unwrap();
                if inner.chain_len <= 2 {
                    return Ok(false);
                }
                let mut cursor = inner.tail;
                let mut picked = None;
                while let Some(idx) = cursor {
                    let pod = &inner.slots[idx].node;
                    let free = match pod.try_write() {
                        Ok(_) => true,
                        Err(_) => false,
                    };
                    if free {
                        picked = Some((idx, Arc::clone(pod), inner.slots[idx].mapped));
                        break;
                    }
                    cursor = inner.slots[idx].prev;
                }
                picked
            };

            let (idx, pod, expect_pid) = match picked {
                Some(p) => p,
                None => {
                    attempts += 1;
                    if attempts > 64 {
                        return Ok(false);
                    }
                    std::thread::yield_now();
                    continue;
                }
            };

            // phase 2: latch it for real and revalidate. Only a try:
            // callers may already hold other node latches, and blocking
            // here could close a latch cycle with another evicting
            // thread.
            let mut node = match pod.try_write() {
                Ok(guard) => guard,
                Err(_) => {
                    attempts += 1;
                    if attempts > 64 {
                        return Ok(false);
                    }
                    std::thread::yield_now();
                    continue;
                }
            };
            if node.pid != expect_pid || expect_pid == NO_PAGE {
                continue;
            }

            // phase 3: write back while latched, cache latch released
            if node.is_dirty() {
                debug!("evicting dirty node, write back page {}", node.pid);
                self.write_back(&mut node)?;
            }

            // phase 4: unmap and reclaim, still holding the node latch
            let mut inner = self.inner.lock().unwrap();
            match inner.map.get(&expect_pid) {
                Some(i) if *i == idx => {}
                _ => continue,
            }
            if !inner.slots[idx].in_chain {
                // pinned while we were writing back; leave it alone
                continue;
            }
            inner.map.remove(&expect_pid);
            inner.unlink(idx);
            inner.slots[idx].mapped = NO_PAGE;
            node.pid = NO_PAGE;
            node.version = node.version.wrapping_add(1);
            inner.free.push(idx);
            return Ok(true);
        }
    }

    /// Make a freshly initialised node visible under `pid`.
    /// Fails when the pid is already mapped (the caller lost a race).
    pub fn publish(&self, pod: &Pod<Node>, pid: PageId, evictable: bool) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.contains_key(&pid) {
            return false;
        }
        let idx = inner
            .slots
            .iter()
            .position(|s| Arc::ptr_eq(&s.node, pod))
            .expect("publish of a foreign node");
        inner.map.insert(pid, idx);
        inner.slots[idx].mapped = pid;
        if evictable {
            inner.link_head(idx);
        }
        true
    }

    /// Return an unbound node to the free pool (lost publish race or
    /// failed load). The node id is cleared so stale handles cannot
    /// mistake the leftover content for a valid page.
    pub fn discard(&self, pod: &Pod<Node>) {
        {
            let mut node = pod.wl();
            node.pid = NO_PAGE;
            node.version = node.version.wrapping_add(1);
        }
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.slots.iter().position(|s| Arc::ptr_eq(&s.node, pod)) {
            debug_assert_eq!(inner.slots[idx].mapped, NO_PAGE);
            inner.free.push(idx);
        }
    }

    pub fn find(&self, pid: PageId) -> Option<Pod<Node>> {
        let mut inner = self.inner.lock().unwrap();
        let idx = *inner.map.get(&pid)?;
        let pod = Arc::clone(&inner.slots[idx].node);
        if inner.slots[idx].in_chain {
            inner.unlink(idx);
            inner.link_head(idx);
        }
        Some(pod)
    }

    /// Load (or find) the node for `pid`. The returned node is validated
    /// to carry `pid`; the caller must still re-check after re-latching
    /// later.
    pub fn get_or_load(&self, pid: PageId, node_type: NodeType) -> Result<Pod<Node>, SmallError> {
        loop {
            if let Some(pod) = self.find(pid) {
                let valid = { pod.rl().pid == pid };
                if valid {
                    return Ok(pod);
                }
                // rebound under us; retry
                continue;
            }

            let pod = match self.alloc_latched(AllocNodeMode::Normal)? {
                Some(pod) => pod,
                None => unreachable!("Normal mode never returns None"),
            };
            let loaded = (|| -> SmallResult {
                let mut node = pod.wl();
                self.store.read_page(pid, node.data_mut())?;
                node.bind(pid, node_type);
                if matches!(node_type, NodeType::Leaf | NodeType::Internal) {
                    // tree pages self-describe; trust the byte over the hint
                    let tagged = NodeType::from_u8(node.data()[0])?;
                    if !matches!(tagged, NodeType::Leaf | NodeType::Internal) {
                        return Err(SmallError::corrupt(&format!(
                            "page {} is not a tree node",
                            pid
                        )));
                    }
                    node.node_type = tagged;
                }
                Ok(())
            })();
            if let Err(e) = loaded {
                self.discard(&pod);
                return Err(e);
            }
            if self.publish(&pod, pid, true) {
                return Ok(pod);
            }
            // another thread published first; recycle ours and use theirs
            self.discard(&pod);
        }
    }

    /// Create a node for a freshly allocated page. The initialiser runs
    /// under the node's exclusive latch before the node becomes
    /// visible, and the node is published *unevictable*: the caller
    /// finishes wiring it up, then calls `make_evictable` (tree roots
    /// simply stay pinned).
    pub fn create<F>(&self, pid: PageId, init: F) -> Result<Pod<Node>, SmallError>
    where
        F: FnOnce(&mut Node),
    {
        let pod = match self.alloc_latched(AllocNodeMode::Unevictable)? {
            Some(pod) => pod,
            None => unreachable!(),
        };
        {
            let mut node = pod.wl();
            let node_type = node.node_type;
            node.bind(pid, node_type);
            init(&mut node);
            node.pid = pid;
        }
        if !self.publish(&pod, pid, false) {
            self.discard(&pod);
            return Err(SmallError::corrupt(&format!(
                "created page {} already cached",
                pid
            )));
        }
        Ok(pod)
    }

    /// Drop the cached node for a freed page. Blocks briefly if the node
    /// latch is contended.
    pub fn remove(&self, pid: PageId) {
        loop {
            let pod = {
                let inner = self.inner.lock().unwrap();
                match inner.map.get(&pid) {
                    Some(idx) => Arc::clone(&inner.slots[*idx].node),
                    None => return,
                }
            };
            // take the node latch without the cache latch, then re-check
            let mut node = pod.wl();
            if node.pid != pid {
                // stale mapping: the node was rebound elsewhere but the
                // map entry lingered; drop just the mapping
                let mut inner = self.inner.lock().unwrap();
                if let Some(idx) = inner.map.get(&pid).copied() {
                    if inner.slots[idx].mapped == pid
                        && !Arc::ptr_eq(&inner.slots[idx].node, &pod)
                    {
                        continue;
                    }
                    inner.map.remove(&pid);
                    inner.unlink(idx);
                    inner.slots[idx].mapped = NO_PAGE;
                    inner.free.push(idx);
                }
                return;
            }
            let mut inner = self.inner.lock().unwrap();
            let idx = match inner.map.get(&pid) {
                Some(idx) => *idx,
                None => return,
            };
            inner.map.remove(&pid);
            inner.unlink(idx);
            inner.slots[idx].mapped = NO_PAGE;
            node.pid = NO_PAGE;
            node.cached_state = CachedState::Clean;
            node.version = node.version.wrapping_add(1);
            inner.free.push(idx);
            return;
        }
    }

    // --------------------------------------------------------------
    // LRU maintenance
    // --------------------------------------------------------------

    /// Move to MRU. Best-effort: skipped when the cache latch is
    /// contended; a hot node will be re-seen.
    pub fn used(&self, pid: PageId) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(idx) = inner.map.get(&pid).copied() {
                if inner.slots[idx].in_chain {
                    inner.unlink(idx);
                    inner.link_head(idx);
                }
            }
        }
    }

    /// Move to LRU, for nodes expected to be recycled soon.
    pub fn unused(&self, pid: PageId) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(idx) = inner.map.get(&pid).copied() {
                if inner.slots[idx].in_chain {
                    inner.unlink(idx);
                    inner.link_tail(idx);
                }
            }
        }
    }

    /// Unsplice from the LRU chain so eviction cannot touch the node.
    pub fn make_unevictable(&self, pid: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.map.get(&pid).copied() {
            if inner.slots[idx].in_chain {
                inner.unlink(idx);
            }
        }
    }

    pub fn make_evictable(&self, pid: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(idx) = inner.map.get(&pid).copied() {
            if !inner.slots[idx].in_chain {
                inner.link_head(idx);
            }
        }
    }

    /// Every resident node; the checkpoint filters for its dirty
    /// sentinel under each node's latch.
    pub fn all_nodes(&self) -> Vec<Pod<Node>> {
        let inner = self.inner.lock().unwrap();
        inner
            .slots
            .iter()
            .filter(|s| s.mapped != NO_PAGE)
            .map(|s| Arc::clone(&s.node))
            .collect()
    }

    // --------------------------------------------------------------
    // fragment cache
    // --------------------------------------------------------------

    fn fragment_segment(&self, pid: PageId) -> &Mutex<HashMap<PageId, Pod<Node>>> {
        let mask = self.fragment_segments.len() - 1;
        // cheap scramble; fragment ids cluster
        let hash = pid.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.fragment_segments[(hash >> 32) as usize & mask]
    }

    pub fn find_fragment(&self, pid: PageId) -> Option<Pod<Node>> {
        self.fragment_segment(pid).lock().unwrap().get(&pid).cloned()
    }

    /// Lossy insert: when the segment is full, a clean resident is
    /// evicted to make room; if none can be claimed the insert is
    /// silently dropped.
    pub fn insert_fragment(&self, pid: PageId, pod: Pod<Node>) {
        let mut segment = self.fragment_segment(pid).lock().unwrap();
        if segment.len() >= self.fragment_segment_cap && !segment.contains_key(&pid) {
            let victim = segment
                .iter()
                .find(|(_, v)| match v.try_read() {
                    Ok(n) => !n.is_dirty(),
                    Err(_) => false,
                })
                .map(|(k, _)| *k);
            match victim {
                Some(k) => {
                    segment.remove(&k);
                }
                None => return,
            }
        }
        segment.insert(pid, pod);
    }

    pub fn remove_fragment(&self, pid: PageId) {
        self.fragment_segment(pid).lock().unwrap().remove(&pid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page_store::MemPageStore;

    fn new_cache(max_nodes: usize) -> (Arc<MemPageStore>, NodeCache) {
        let store = Arc::new(MemPageStore::new(512));
        store.set_page_count(64).unwrap();
        let cache = NodeCache::new(Arc::clone(&store) as Arc<dyn PageStore>, max_nodes);
        (store, cache)
    }

    #[test]
    fn test_load_and_find() {
        let (store, cache) = new_cache(8);
        let mut page = vec![0u8; 512];
        page[0] = NodeType::Leaf.to_u8();
        store.write_page(7, &page).unwrap();

        let pod = cache.get_or_load(7, NodeType::Leaf).unwrap();
        assert_eq!(pod.rl().pid, 7);
        let again = cache.get_or_load(7, NodeType::Leaf).unwrap();
        assert!(Arc::ptr_eq(&pod, &again));
        assert_eq!(cache.occupancy(), 1);
    }

    #[test]
    fn test_eviction_reclaims_lru() {
        let (store, cache) = new_cache(8);
        for pid in 2..20u64 {
            let mut page = vec![0u8; 512];
            page[0] = NodeType::Leaf.to_u8();
            store.write_page(pid, &page).unwrap();
        }
        for pid in 2..20u64 {
            cache.get_or_load(pid, NodeType::Leaf).unwrap();
        }
        // pool stayed bounded
        assert!(cache.occupancy() <= 8);
        // the hottest page is still resident
        assert!(cache.find(19).is_some());
    }

    #[test]
    fn test_dirty_eviction_writes_back() {
        let (store, cache) = new_cache(8);
        for pid in 2..12u64 {
            let mut page = vec![0u8; 512];
            page[0] = NodeType::Leaf.to_u8();
            store.write_page(pid, &page).unwrap();
        }
        let pod = cache.get_or_load(2, NodeType::Leaf).unwrap();
        {
            let mut node = pod.wl();
            node.init_leaf();
            let entry = crate::btree::node::encode_leaf_entry(b"k", b"v");
            assert!(node.insert_entry(0, &entry).unwrap());
            node.cached_state = CachedState::DirtyA;
        }
        cache.unused(2);

        // churn the cache until page 2 is evicted
        for pid in 3..12u64 {
            cache.get_or_load(pid, NodeType::Leaf).unwrap();
        }
        for pid in (3..12u64).rev() {
            cache.get_or_load(pid, NodeType::Leaf).unwrap();
        }

        // whether or not it was evicted, the disk copy must be readable;
        // if evicted it carries the entry
        if cache.find(2).is_none() {
            let reloaded = cache.get_or_load(2, NodeType::Leaf).unwrap();
            let node = reloaded.rl();
            assert_eq!(node.num_slots(), 1);
            assert_eq!(node.key_at(0).unwrap(), b"k");
        }
    }

    #[test]
    fn test_unevictable_survives_churn() {
        let (store, cache) = new_cache(8);
        for pid in 2..30u64 {
            let mut page = vec![0u8; 512];
            page[0] = NodeType::Leaf.to_u8();
            store.write_page(pid, &page).unwrap();
        }
        let pod = cache.get_or_load(2, NodeType::Leaf).unwrap();
        cache.make_unevictable(2);
        for pid in 3..30u64 {
            cache.get_or_load(pid, NodeType::Leaf).unwrap();
        }
        let found = cache.find(2).expect("pinned node evicted");
        assert!(Arc::ptr_eq(&pod, &found));

        cache.make_evictable(2);
    }

    #[test]
    fn test_fragment_cache_is_lossy_not_wrong() {
        let (_store, cache) = new_cache(8);
        for pid in 100..200u64 {
            let node = Node::new_empty(512);
            cache.insert_fragment(pid, Arc::new(RwLock::new(node)));
        }
        // lookups either miss or return the right node; capacity bounded
        let total: usize = cache
            .fragment_segments
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum();
        assert!(total <= cache.fragment_segment_cap * cache.fragment_segments.len());
    }
}
