//! The engine: opening and recovery, the index registry, checkpoints,
//! compaction, and the public `Database`/`Index` handles.
//!
//! All mutable engine state hangs off one `DbInner`; there is no
//! process-wide singleton. Opening the same base file twice within a
//! process is rejected through a registry of canonical paths.
//!
//! Checkpoint protocol (fuzzy): under a brief exclusive commit latch the
//! dirty sentinel flips, the registry roots and live undo logs are
//! snapshotted and the redo position recorded; mutations then resume
//! while every node carrying the previous sentinel is flushed; a second
//! brief exclusive window serialises the page manager state and flips
//! the alternating header. Mutators that touch a node still carrying
//! the old sentinel first write it back (see `Tree::mark_dirty`), which
//! is what keeps the snapshot consistent without stopping the world.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use once_cell::sync::Lazy;

use crate::btree::cursor::Cursor;
use crate::btree::node::{CachedState, NodeType, OFF_TYPE};
use crate::btree::node_cache::NodeCache;
use crate::btree::tree::{Tree, TreeContext};
use crate::config::{Options, PrepareHandler};
use crate::error::{ErrorKind, SmallError};
use crate::io::{get_u16, get_u48, get_u64, put_u16, put_u48, put_u64};
use crate::latch::Latch;
use crate::storage::header::Header;
use crate::storage::page_manager::PageManager;
use crate::storage::page_store::{FilePageStore, MemPageStore, PageStore, StripedPageStore};
use crate::transaction::lock_manager::LockManager;
use crate::transaction::tx::{Transaction, BOGUS_TXN_ID};
use crate::tx_log::redo_log::{RedoLog, RedoRecord};
use crate::tx_log::undo_log::UndoLog;
use crate::types::{IndexId, OwnerId, PageId, SmallResult, NO_PAGE};
use crate::utils::HandyRwLock;

/// The registry index: name → id and id → root mappings.
pub(crate) const REGISTRY_INDEX_ID: IndexId = 0;

const REG_PREFIX_NAME: u8 = b'N';
const REG_PREFIX_ROOT: u8 = b'R';
const REG_PREFIX_ID_NAME: u8 = b'I';
const REG_KEY_COUNTER: &[u8] = b"C";

/// Base files already open in this process.
static OPEN_FILES: Lazy<Mutex<std::collections::HashSet<PathBuf>>> =
    Lazy::new(|| Mutex::new(std::collections::HashSet::new()));

fn reg_name_key(name: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + name.len());
    key.push(REG_PREFIX_NAME);
    key.extend_from_slice(name);
    key
}

fn reg_root_key(id: IndexId) -> Vec<u8> {
    let mut key = vec![REG_PREFIX_ROOT];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

fn reg_id_name_key(id: IndexId) -> Vec<u8> {
    let mut key = vec![REG_PREFIX_ID_NAME];
    key.extend_from_slice(&id.to_be_bytes());
    key
}

pub(crate) struct DbInner {
    pub(crate) options: Options,
    pub(crate) ctx: Arc<TreeContext>,
    pub(crate) lock_mgr: LockManager,
    pub(crate) redo: Mutex<RedoLog>,
    pub(crate) commit_latch: Latch,
    registry: Mutex<Option<Arc<Tree>>>,
    trees_by_id: Mutex<HashMap<IndexId, Arc<Tree>>>,
    trees_by_name: Mutex<HashMap<Vec<u8>, IndexId>>,
    live_txns: Mutex<HashMap<OwnerId, Arc<Mutex<UndoLog>>>>,
    prepare_handlers: HashMap<u32, Arc<dyn PrepareHandler>>,
    header_slot: Mutex<PageId>,
    checkpoint_seq: AtomicU64,
    txn_counter: AtomicU64,
    next_index_id: AtomicU64,
    /// The live-undo list page written by the previous checkpoint.
    prev_live_undo_page: AtomicU64,
    checkpoint_mutex: Mutex<()>,
    last_checkpoint: Mutex<Instant>,
    closed: AtomicBool,
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    checkpointer: Mutex<Option<JoinHandle<()>>>,
    canonical_path: Option<PathBuf>,
    path_registered: AtomicBool,
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseStats {
    pub total_pages: u64,
    pub free_pages: u64,
    pub recycled_pages: u64,
    pub reserved_pages: u64,
    pub cache_nodes: usize,
    pub cache_capacity: usize,
    pub open_transactions: usize,
    pub checkpoint_sequence: u64,
}

/// Cloneable handle to an open engine.
#[derive(Clone)]
pub struct Database {
    pub(crate) inner: Arc<DbInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

/// Cloneable handle to a named B+ tree.
#[derive(Clone)]
pub struct Index {
    pub(crate) tree: Arc<Tree>,
    db: Database,
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index").finish()
    }
}

impl Database {
    // --------------------------------------------------------------
    // open & recovery
    // --------------------------------------------------------------

    pub fn open(options: Options) -> Result<Database, SmallError> {
        options.validate()?;

        // reject a second in-process open of the same base file
        let canonical_path = match &options.base_file {
            Some(base) => {
                let parent = base.parent().map(|p| p.to_path_buf());
                if let Some(parent) = &parent {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                let canonical = match base.canonicalize() {
                    Ok(p) => p,
                    // the base itself may not exist yet; canonicalise
                    // the parent instead
                    Err(_) => match (base.parent(), base.file_name()) {
                        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
                            parent.canonicalize()?.join(name)
                        }
                        _ => base.clone(),
                    },
                };
                if !OPEN_FILES.lock().unwrap().insert(canonical.clone()) {
                    return Err(SmallError::new(
                        ErrorKind::Other,
                        &format!("{:?} is already open in this process", canonical),
                    ));
                }
                Some(canonical)
            }
            None => None,
        };

        match Self::open_registered(options, canonical_path.clone()) {
            Ok(db) => Ok(db),
            Err(e) => {
                if let Some(path) = canonical_path {
                    OPEN_FILES.lock().unwrap().remove(&path);
                }
                Err(e)
            }
        }
    }

    fn open_registered(
        options: Options,
        canonical_path: Option<PathBuf>,
    ) -> Result<Database, SmallError> {
        let page_size = options.page_size as usize;

        let store: Arc<dyn PageStore> = match &options.base_file {
            None => Arc::new(MemPageStore::new(page_size)),
            Some(base) => {
                if options.data_files.len() > 1 {
                    Arc::new(StripedPageStore::open(
                        &options.data_files,
                        page_size,
                        options.read_only,
                    )?)
                } else if options.data_files.len() == 1 {
                    Arc::new(FilePageStore::open(
                        &options.data_files[0],
                        page_size,
                        options.read_only,
                    )?)
                } else {
                    let mut name = base
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_default();
                    name.push(".db");
                    Arc::new(FilePageStore::open(
                        base.with_file_name(name),
                        page_size,
                        options.read_only,
                    )?)
                }
            }
        };

        let fresh = store.page_count() < 2;
        if fresh && options.read_only {
            return Err(SmallError::new(
                ErrorKind::Other,
                "read-only open of a store that does not exist",
            ));
        }

        let cache_nodes = (options.max_cache_size / page_size as u64).max(8) as usize;

        let (header, header_slot, pm) = if fresh {
            (Header::new(), 1, PageManager::new(Arc::clone(&store)))
        } else {
            let (header, slot) = Header::read_newest(store.as_ref(), options.page_size)?;
            let pm = PageManager::restore(Arc::clone(&store), &header.page_manager_state)?;
            (header, slot, pm)
        };

        let cache = NodeCache::new(Arc::clone(&store), cache_nodes);
        let ctx = Arc::new(TreeContext::new(Arc::clone(&store), pm, cache));
        let lock_rule = options.lock_upgrade_rule;

        let inner = Arc::new(DbInner {
            prepare_handlers: options
                .prepare_handlers
                .iter()
                .map(|(id, h)| (*id, Arc::clone(h)))
                .collect(),
            options,
            ctx: Arc::clone(&ctx),
            lock_mgr: LockManager::new(lock_rule),
            redo: Mutex::new(RedoLog::open(None, 0, 0, u64::MAX)?),
            commit_latch: Latch::new(),
            registry: Mutex::new(None),
            trees_by_id: Mutex::new(HashMap::new()),
            trees_by_name: Mutex::new(HashMap::new()),
            live_txns: Mutex::new(HashMap::new()),
            header_slot: Mutex::new(header_slot),
            checkpoint_seq: AtomicU64::new(header.checkpoint_sequence),
            txn_counter: AtomicU64::new(header.txn_id_counter.max(1)),
            next_index_id: AtomicU64::new(1),
            prev_live_undo_page: AtomicU64::new(header.live_undo_page_id),
            checkpoint_mutex: Mutex::new(()),
            last_checkpoint: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            shutdown: Arc::new((Mutex::new(false), Condvar::new())),
            checkpointer: Mutex::new(None),
            path_registered: AtomicBool::new(canonical_path.is_some()),
            canonical_path,
        });

        // write-ahead ordering: a dirty node never reaches the store
        // before the redo covering it has left the append buffer
        {
            let weak = Arc::downgrade(&inner);
            inner.ctx.cache.set_writeback_barrier(Arc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.redo.lock().unwrap().flush()?;
                }
                Ok(())
            }));
        }

        let db = Database {
            inner: Arc::clone(&inner),
        };

        if fresh {
            if let Some(base) = &inner.options.base_file {
                *inner.redo.lock().unwrap() = RedoLog::open(
                    Some(base.clone()),
                    0,
                    0,
                    inner.options.redo_segment_size,
                )?;
            }
            let registry = Arc::new(Tree::create(
                Arc::clone(&inner.ctx),
                REGISTRY_INDEX_ID,
                None,
            )?);
            *inner.registry.lock().unwrap() = Some(Arc::clone(&registry));
            inner
                .trees_by_id
                .lock()
                .unwrap()
                .insert(REGISTRY_INDEX_ID, registry);
            db.bootstrap_counter()?;
            db.checkpoint()?;
            info!("store formatted, page size {}", inner.options.page_size);
        } else {
            let registry = Arc::new(Tree::open(
                Arc::clone(&inner.ctx),
                REGISTRY_INDEX_ID,
                None,
                header.registry_root_page_id,
            ));
            inner.ctx.cache.make_unevictable(header.registry_root_page_id);
            *inner.registry.lock().unwrap() = Some(Arc::clone(&registry));
            inner
                .trees_by_id
                .lock()
                .unwrap()
                .insert(REGISTRY_INDEX_ID, registry);
            db.load_index_counter()?;
            db.recover(&header)?;
        }

        db.start_checkpointer();
        Ok(db)
    }

    fn bootstrap_counter(&self) -> SmallResult {
        let registry = self.inner.registry_tree();
        let mut value = [0u8; 8];
        put_u64(&mut value, 0, 1);
        registry.store_value(REG_KEY_COUNTER, &value)?;
        Ok(())
    }

    fn load_index_counter(&self) -> SmallResult {
        let registry = self.inner.registry_tree();
        if let Some(raw) = registry.load_value(REG_KEY_COUNTER)? {
            if raw.len() == 8 {
                self.inner
                    .next_index_id
                    .store(get_u64(&raw, 0), Ordering::Release);
            }
        }
        Ok(())
    }

    /// Recovery: roll back transactions live at the checkpoint, then
    /// replay the redo stream (committed transactions applied, prepared
    /// ones rebuilt and handed to their handlers).
    fn recover(&self, header: &Header) -> SmallResult {
        let inner = &self.inner;

        // 1. undo transactions that were live at checkpoint time
        if header.live_undo_page_id != NO_PAGE {
            self.rollback_live_undo(header.live_undo_page_id)?;
        }

        // 2. replay redo
        let base = match &inner.options.base_file {
            Some(base) => base.clone(),
            None => return Ok(()),
        };
        let (records, end_position, last_segment) =
            RedoLog::replay(&base, header.redo_log_position)?;

        let mut committed: std::collections::HashSet<OwnerId> = std::collections::HashSet::new();
        let mut finished: std::collections::HashSet<OwnerId> = std::collections::HashSet::new();
        let mut prepared: HashMap<OwnerId, u32> = HashMap::new();
        let mut max_txn_id = 0;
        committed.insert(BOGUS_TXN_ID);
        for record in &records {
            match record {
                RedoRecord::TxnCommit { txn_id } => {
                    committed.insert(*txn_id);
                    finished.insert(*txn_id);
                }
                RedoRecord::TxnRollback { txn_id } => {
                    finished.insert(*txn_id);
                }
                RedoRecord::TxnPrepare { txn_id, handler_id } => {
                    prepared.insert(*txn_id, *handler_id);
                }
                RedoRecord::TxnBegin { txn_id } => {
                    max_txn_id = max_txn_id.max(*txn_id);
                }
                _ => {}
            }
        }
        let prepared_pending: HashMap<OwnerId, u32> = prepared
            .iter()
            .filter(|(id, _)| !finished.contains(id))
            .map(|(id, h)| (*id, *h))
            .collect();

        inner
            .txn_counter
            .store(
                inner.txn_counter.load(Ordering::Acquire).max(max_txn_id + 1),
                Ordering::Release,
            );

        // committed work replays directly; everything else replays
        // through a recovered transaction so it regains locks and undo,
        // and is rolled back at its rollback record (or at the end).
        // Replaying and undoing the losers is not optional: an eviction
        // may have pushed their dirty pages to disk before the crash,
        // and only the replay-then-rollback sequence overwrites that.
        let mut recovered: HashMap<OwnerId, Transaction> = HashMap::new();

        let mut applied = 0u64;
        for record in &records {
            match record {
                RedoRecord::Store {
                    txn_id,
                    index_id,
                    key,
                    value,
                } => {
                    if committed.contains(txn_id) {
                        self.replay_store(*index_id, key, value)?;
                        applied += 1;
                    } else {
                        let txn = recovered
                            .entry(*txn_id)
                            .or_insert_with(|| self.recovered_transaction(*txn_id));
                        let tree = self.inner.open_tree_by_id(*index_id)?;
                        txn.store(&tree, key, value)?;
                    }
                }
                RedoRecord::Delete {
                    txn_id,
                    index_id,
                    key,
                } => {
                    if committed.contains(txn_id) {
                        self.replay_delete(*index_id, key)?;
                        applied += 1;
                    } else {
                        let txn = recovered
                            .entry(*txn_id)
                            .or_insert_with(|| self.recovered_transaction(*txn_id));
                        let tree = self.inner.open_tree_by_id(*index_id)?;
                        txn.delete(&tree, key)?;
                    }
                }
                RedoRecord::TxnRollback { txn_id } => {
                    // roll back at the original point in the timeline so
                    // later committed writes to the same keys win
                    if let Some(txn) = recovered.remove(txn_id) {
                        txn.reset()?;
                        applied += 1;
                    }
                }
                _ => {}
            }
        }

        // whoever is left neither committed nor rolled back: the
        // prepared ones go to their handlers below, the rest roll back
        let mut pending: Vec<(OwnerId, Transaction)> = Vec::new();
        for (txn_id, txn) in recovered.drain() {
            if prepared_pending.contains_key(&txn_id) {
                pending.push((txn_id, txn));
            } else {
                txn.reset()?;
                applied += 1;
            }
        }
        let mut recovered: HashMap<OwnerId, Transaction> = pending.into_iter().collect();

        // 3. reopen the redo log past the replayed stream; a read-only
        // engine keeps the in-memory placeholder and writes nothing
        if !inner.options.read_only {
            let mut redo = inner.redo.lock().unwrap();
            *redo = RedoLog::open(
                Some(base),
                end_position,
                last_segment,
                inner.options.redo_segment_size,
            )?;
        }

        info!(
            "recovery complete: {} records applied, {} prepared transaction(s)",
            applied,
            prepared_pending.len()
        );

        // 4. hand prepared transactions to their handlers
        for (txn_id, handler_id) in prepared_pending {
            let txn = match recovered.remove(&txn_id) {
                Some(txn) => txn,
                None => continue,
            };
            match inner.prepare_handlers.get(&handler_id) {
                Some(handler) => handler.recover(txn)?,
                None => {
                    warn!(
                        "prepared txn {} has no handler {}; rolling back",
                        txn_id, handler_id
                    );
                    txn.reset()?;
                }
            }
        }

        // 5. consolidate so the replay does not repeat on the next open
        if applied > 0 && !inner.options.read_only {
            self.checkpoint()?;
        }
        Ok(())
    }

    fn rollback_live_undo(&self, list_page: PageId) -> SmallResult {
        let inner = &self.inner;
        let mut page = vec![0u8; inner.ctx.store.page_size()];
        inner.ctx.store.read_page(list_page, &mut page)?;
        let count = get_u16(&page, 1) as usize;
        let mut rolled = 0;
        for i in 0..count {
            let off = 3 + i * 14;
            let txn_id = get_u64(&page, off);
            let head = get_u48(&page, off + 8);
            let records = UndoLog::load_chain(&inner.ctx.store, head)?;
            for record in &records {
                let tree = inner.open_tree_by_id(record.index_id)?;
                match record.op {
                    crate::tx_log::undo_log::UndoOp::Uninsert => {
                        tree.delete_physical(&record.key)?
                    }
                    _ => {
                        let old = record.old_value.as_deref().unwrap_or(&[]);
                        tree.store_value(&record.key, old)?;
                    }
                }
            }
            debug!(
                "rolled back live txn {} ({} undo records)",
                txn_id,
                records.len()
            );
            rolled += 1;
        }
        inner.ctx.pm.delete_page(list_page)?;
        if rolled > 0 {
            info!("rolled back {} transaction(s) live at checkpoint", rolled);
        }
        Ok(())
    }

    /// Apply a committed redo store. Stores into the registry that
    /// record an index root come from index creation; the recorded root
    /// page was never checkpointed, so a fresh tree is created instead.
    fn replay_store(&self, index_id: IndexId, key: &[u8], value: &[u8]) -> SmallResult {
        let inner = &self.inner;
        if index_id == REGISTRY_INDEX_ID && key.first() == Some(&REG_PREFIX_ROOT) && key.len() == 9 {
            let target = IndexId::from_be_bytes(key[1..9].try_into().unwrap());
            let registry = inner.registry_tree();
            if registry.load_value(key)?.is_none() {
                let tree = Arc::new(Tree::create(Arc::clone(&inner.ctx), target, None)?);
                let mut root = [0u8; 8];
                put_u64(&mut root, 0, tree.root_pid());
                registry.store_value(key, &root)?;
                inner.trees_by_id.lock().unwrap().insert(target, tree);
                debug!("index {} recreated during replay", target);
            }
            return Ok(());
        }
        let tree = inner.open_tree_by_id(index_id)?;
        tree.store_value(key, value)?;
        Ok(())
    }

    fn replay_delete(&self, index_id: IndexId, key: &[u8]) -> SmallResult {
        let tree = self.inner.open_tree_by_id(index_id)?;
        tree.delete_physical(key)
    }

    fn recovered_transaction(&self, txn_id: OwnerId) -> Transaction {
        let undo = Arc::new(Mutex::new(UndoLog::new(self.inner.checkpoint_sequence())));
        self.inner
            .live_txns
            .lock()
            .unwrap()
            .insert(txn_id, Arc::clone(&undo));
        Transaction::new(
            Arc::clone(&self.inner),
            txn_id,
            false,
            self.inner.options.durability_mode,
            undo,
        )
    }

    // --------------------------------------------------------------
    // transactions
    // --------------------------------------------------------------

    pub fn begin(&self) -> Result<Transaction, SmallError> {
        self.begin_with(self.inner.options.durability_mode)
    }

    pub fn begin_with(&self, durability: crate::config::DurabilityMode) -> Result<Transaction, SmallError> {
        self.inner.check_open()?;
        let id = self.inner.txn_counter.fetch_add(1, Ordering::AcqRel);
        let undo = Arc::new(Mutex::new(UndoLog::new(self.inner.checkpoint_sequence())));
        self.inner
            .live_txns
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&undo));
        Ok(Transaction::new(
            Arc::clone(&self.inner),
            id,
            false,
            durability,
            undo,
        ))
    }

    /// A transaction that acquires no locks and keeps no undo; its
    /// mutations are immediate and auto-committed.
    pub fn bogus(&self) -> Transaction {
        let undo = Arc::new(Mutex::new(UndoLog::new(0)));
        Transaction::new(
            Arc::clone(&self.inner),
            BOGUS_TXN_ID,
            true,
            crate::config::DurabilityMode::NoFlush,
            undo,
        )
    }

    // --------------------------------------------------------------
    // indexes
    // --------------------------------------------------------------

    /// Open the named index, creating it on first use.
    pub fn open_index(&self, name: &[u8]) -> Result<Index, SmallError> {
        self.inner.check_open()?;
        if let Some(index) = self.find_index(name)? {
            return Ok(index);
        }
        self.inner.check_writable()?;

        let registry = self.inner.registry_tree();
        let txn = self.begin_with(crate::config::DurabilityMode::Sync)?;

        // re-check under the registry name lock
        txn.lock_exclusive(REGISTRY_INDEX_ID, &reg_name_key(name))?;
        if let Some(raw) = registry.load_value(&reg_name_key(name))? {
            txn.reset()?;
            let id = get_u64(&raw, 0);
            let tree = self.inner.open_tree_by_id(id)?;
            tree.name.wl().replace(name.to_vec());
            self.inner
                .trees_by_name
                .lock()
                .unwrap()
                .insert(name.to_vec(), id);
            return Ok(Index {
                tree,
                db: self.clone(),
            });
        }

        let id = self.inner.next_index_id.fetch_add(1, Ordering::AcqRel);
        let tree = Arc::new(Tree::create(
            Arc::clone(&self.inner.ctx),
            id,
            Some(name.to_vec()),
        )?);

        let mut id_bytes = [0u8; 8];
        put_u64(&mut id_bytes, 0, id);
        let mut root_bytes = [0u8; 8];
        put_u64(&mut root_bytes, 0, tree.root_pid());
        let mut counter = [0u8; 8];
        put_u64(&mut counter, 0, id + 1);

        txn.store(&registry, &reg_name_key(name), &id_bytes)?;
        txn.store(&registry, &reg_root_key(id), &root_bytes)?;
        txn.store(&registry, &reg_id_name_key(id), name)?;
        txn.store(&registry, REG_KEY_COUNTER, &counter)?;
        txn.commit()?;

        self.inner
            .trees_by_id
            .lock()
            .unwrap()
            .insert(id, Arc::clone(&tree));
        self.inner
            .trees_by_name
            .lock()
            .unwrap()
            .insert(name.to_vec(), id);
        info!("index {:?} created with id {}", String::from_utf8_lossy(name), id);
        Ok(Index {
            tree,
            db: self.clone(),
        })
    }

    /// Look the named index up without creating it.
    pub fn find_index(&self, name: &[u8]) -> Result<Option<Index>, SmallError> {
        self.inner.check_open()?;
        if let Some(id) = self.inner.trees_by_name.lock().unwrap().get(name).copied() {
            let tree = self.inner.open_tree_by_id(id)?;
            return Ok(Some(Index {
                tree,
                db: self.clone(),
            }));
        }
        let registry = self.inner.registry_tree();
        match registry.load_value(&reg_name_key(name))? {
            Some(raw) if raw.len() == 8 => {
                let id = get_u64(&raw, 0);
                let tree = self.inner.open_tree_by_id(id)?;
                tree.name.wl().replace(name.to_vec());
                self.inner
                    .trees_by_name
                    .lock()
                    .unwrap()
                    .insert(name.to_vec(), id);
                Ok(Some(Index {
                    tree,
                    db: self.clone(),
                }))
            }
            _ => Ok(None),
        }
    }

    pub fn index_by_id(&self, id: IndexId) -> Result<Option<Index>, SmallError> {
        self.inner.check_open()?;
        if id == REGISTRY_INDEX_ID {
            return Ok(None);
        }
        match self.inner.try_open_tree_by_id(id)? {
            Some(tree) => Ok(Some(Index {
                tree,
                db: self.clone(),
            })),
            None => Ok(None),
        }
    }

    /// Give an index a different name.
    pub fn rename_index(&self, index: &Index, new_name: &[u8]) -> SmallResult {
        self.inner.check_writable()?;
        let registry = self.inner.registry_tree();
        let id = index.tree.id;
        let old_name = index.tree.name.rl().clone();

        let txn = self.begin_with(crate::config::DurabilityMode::Sync)?;
        txn.lock_exclusive(REGISTRY_INDEX_ID, &reg_name_key(new_name))?;
        if registry.load_value(&reg_name_key(new_name))?.is_some() {
            txn.reset()?;
            return Err(SmallError::new(
                ErrorKind::Other,
                "target index name already exists",
            ));
        }
        let mut id_bytes = [0u8; 8];
        put_u64(&mut id_bytes, 0, id);
        if let Some(old) = &old_name {
            txn.delete(&registry, &reg_name_key(old))?;
        }
        txn.store(&registry, &reg_name_key(new_name), &id_bytes)?;
        txn.store(&registry, &reg_id_name_key(id), new_name)?;
        txn.commit()?;

        let mut names = self.inner.trees_by_name.lock().unwrap();
        if let Some(old) = &old_name {
            names.remove(old);
        }
        names.insert(new_name.to_vec(), id);
        index.tree.name.wl().replace(new_name.to_vec());
        Ok(())
    }

    /// Drop an empty index; refuses when entries remain.
    pub fn drop_index(&self, index: Index) -> SmallResult {
        self.inner.check_writable()?;
        let id = index.tree.id;
        if index.tree.count_entries()? != 0 {
            return Err(SmallError::new(
                ErrorKind::Other,
                "index is not empty; drop refused",
            ));
        }
        let registry = self.inner.registry_tree();
        let name = index.tree.name.rl().clone();

        let txn = self.begin_with(crate::config::DurabilityMode::Sync)?;
        if let Some(name) = &name {
            txn.delete(&registry, &reg_name_key(name))?;
        }
        txn.delete(&registry, &reg_root_key(id))?;
        txn.delete(&registry, &reg_id_name_key(id))?;
        txn.commit()?;

        let root = index.tree.root_pid();
        self.inner.trees_by_id.lock().unwrap().remove(&id);
        if let Some(name) = &name {
            self.inner.trees_by_name.lock().unwrap().remove(name);
        }
        self.inner.ctx.cache.make_evictable(root);
        self.inner.ctx.cache.remove(root);
        self.inner.ctx.pm.delete_page(root)?;
        info!("index {} dropped", id);
        Ok(())
    }

    // --------------------------------------------------------------
    // checkpoint
    // --------------------------------------------------------------

    /// Run a full checkpoint; cheap when nothing changed.
    pub fn checkpoint(&self) -> SmallResult {
        let inner = &self.inner;
        inner.check_open()?;
        if inner.options.read_only {
            return Ok(());
        }
        let _only_one = inner.checkpoint_mutex.lock().unwrap();

        let new_seq = inner.checkpoint_sequence() + 1;

        // phase 1: snapshot under a brief exclusive commit latch
        inner.commit_latch.acquire_exclusive();
        let snapshot = (|| -> Result<(CachedState, u64, PageId, PageId), SmallError> {
            // persist live undo logs so recovery can roll them back
            let live_undo_page = self.write_live_undo_list()?;

            // registry gets the current roots before the flip so the
            // updates carry the flushed sentinel
            let registry = inner.registry_tree();
            let trees: Vec<Arc<Tree>> = inner
                .trees_by_id
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for tree in &trees {
                if tree.id == REGISTRY_INDEX_ID {
                    continue;
                }
                let mut root_bytes = [0u8; 8];
                put_u64(&mut root_bytes, 0, tree.root_pid());
                registry.store_value(&reg_root_key(tree.id), &root_bytes)?;
            }
            let registry_root = registry.root_pid();

            let flush_state = inner.ctx.flip_dirty_state();
            let redo_position = {
                let mut redo = inner.redo.lock().unwrap();
                redo.append(&RedoRecord::Checkpoint { sequence: new_seq })?;
                redo.position()
            };
            Ok((flush_state, redo_position, registry_root, live_undo_page))
        })();
        inner.commit_latch.release_exclusive();
        let (flush_state, redo_position, registry_root, live_undo_page) =
            snapshot.map_err(|e| self.fail_engine(e))?;

        // phase 2: write-ahead, then flush everything dirtied before
        // the flip; mutations run concurrently
        let result = (|| -> SmallResult {
            inner.redo.lock().unwrap().sync()?;
            for pod in inner.ctx.cache.all_nodes() {
                let mut node = pod.wl();
                if node.cached_state == flush_state && node.pid != NO_PAGE {
                    inner.ctx.store.write_page(node.pid, node.data())?;
                    node.cached_state = CachedState::Clean;
                }
            }
            Ok(())
        })();
        result.map_err(|e| self.fail_engine(e))?;

        // phase 3: header flip under the exclusive latch again
        inner.commit_latch.acquire_exclusive();
        let result = (|| -> SmallResult {
            let mut header = Header::new();
            header.checkpoint_sequence = new_seq;
            header.redo_log_position = redo_position;
            header.txn_id_counter = inner.txn_counter.load(Ordering::Acquire);
            header.registry_root_page_id = registry_root;
            header.live_undo_page_id = live_undo_page;
            inner.ctx.pm.commit_start(&mut header.page_manager_state)?;

            let mut slot = inner.header_slot.lock().unwrap();
            let written = header.commit(inner.ctx.store.as_ref(), *slot)?;
            *slot = written;
            inner.ctx.pm.commit_end();
            inner.checkpoint_seq.store(new_seq, Ordering::Release);
            Ok(())
        })();
        inner.commit_latch.release_exclusive();
        result.map_err(|e| self.fail_engine(e))?;

        // phase 4: release what the checkpoint made obsolete
        let previous_list = inner
            .prev_live_undo_page
            .swap(live_undo_page, Ordering::AcqRel);
        if previous_list != NO_PAGE && previous_list != live_undo_page {
            inner.ctx.pm.delete_page(previous_list)?;
        }
        {
            let mut redo = inner.redo.lock().unwrap();
            redo.free_before(redo_position)?;
            redo.note_checkpoint();
        }
        *inner.last_checkpoint.lock().unwrap() = Instant::now();
        debug!("checkpoint {} complete", new_seq);
        Ok(())
    }

    /// Persist each live transaction's undo chain and write the list
    /// page recovery reads. Returns `NO_PAGE` when no transaction holds
    /// undo.
    fn write_live_undo_list(&self) -> Result<PageId, SmallError> {
        let inner = &self.inner;
        let live: Vec<(OwnerId, Arc<Mutex<UndoLog>>)> = inner
            .live_txns
            .lock()
            .unwrap()
            .iter()
            .map(|(id, undo)| (*id, Arc::clone(undo)))
            .collect();

        let mut entries = Vec::new();
        for (txn_id, undo) in live {
            let mut undo = undo.lock().unwrap();
            if undo.is_empty() {
                continue;
            }
            undo.spill(&inner.ctx.pm, &inner.ctx.store)?;
            entries.push((txn_id, undo.top_page()));
        }
        if entries.is_empty() {
            return Ok(NO_PAGE);
        }

        let page_size = inner.ctx.store.page_size();
        assert!(3 + entries.len() * 14 <= page_size, "too many live transactions");
        let mut page = vec![0u8; page_size];
        page[OFF_TYPE] = NodeType::UndoLog.to_u8();
        put_u16(&mut page, 1, entries.len() as u16);
        for (i, (txn_id, head)) in entries.iter().enumerate() {
            let off = 3 + i * 14;
            put_u64(&mut page, off, *txn_id);
            put_u48(&mut page, off + 8, *head);
        }
        let pid = inner.ctx.alloc_tree_page()?;
        inner.ctx.store.write_page(pid, &page)?;
        Ok(pid)
    }

    /// Mark the engine failed: subsequent operations return `Closed`.
    fn fail_engine(&self, e: SmallError) -> SmallError {
        error!("engine failure, closing: {}", e);
        e.show_backtrace();
        self.inner.closed.store(true, Ordering::Release);
        e
    }

    fn start_checkpointer(&self) {
        if self.inner.options.read_only {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let shutdown = Arc::clone(&self.inner.shutdown);
        let rate = self.inner.options.checkpoint_rate.max(Duration::from_millis(10));
        let handle = std::thread::Builder::new()
            .name("small-store-checkpointer".to_string())
            .spawn(move || {
                loop {
                    {
                        let (lock, cond) = &*shutdown;
                        let stop = lock.lock().unwrap();
                        let (stop, _) = cond.wait_timeout(stop, rate).unwrap();
                        if *stop {
                            return;
                        }
                    }
                    let inner = match weak.upgrade() {
                        Some(inner) => inner,
                        None => return,
                    };
                    if inner.closed.load(Ordering::Acquire) {
                        return;
                    }
                    let db = Database { inner };
                    if db.should_auto_checkpoint() {
                        if let Err(e) = db.checkpoint() {
                            error!("automatic checkpoint failed: {}", e);
                            return;
                        }
                    }
                }
            })
            .expect("spawn checkpointer");
        *self.inner.checkpointer.lock().unwrap() = Some(handle);
    }

    fn should_auto_checkpoint(&self) -> bool {
        let inner = &self.inner;
        let bytes = inner.redo.lock().unwrap().bytes_since_checkpoint();
        if bytes == 0 {
            return false;
        }
        if bytes >= inner.options.checkpoint_size_threshold {
            return true;
        }
        let since = inner.last_checkpoint.lock().unwrap().elapsed();
        since >= inner.options.checkpoint_delay_threshold
    }

    // --------------------------------------------------------------
    // compaction
    // --------------------------------------------------------------

    /// Shrink the backing file so no page id reaches `target`. Returns
    /// false when the target is unreachable (live data would not fit or
    /// nothing to do). Runs stop-the-world.
    pub fn compact_file(&self, target: PageId) -> Result<bool, SmallError> {
        let inner = &self.inner;
        inner.check_writable()?;

        if !inner.ctx.pm.compaction_start(target)? {
            return Ok(false);
        }

        // every index must be visible to the relocation walk
        self.open_all_indexes()?;

        inner.commit_latch.acquire_exclusive();
        let relocated = (|| -> Result<bool, SmallError> {
            let trees: Vec<Arc<Tree>> = inner
                .trees_by_id
                .lock()
                .unwrap()
                .values()
                .cloned()
                .collect();
            for tree in &trees {
                if !tree.relocate_zone_pages(target)? {
                    return Ok(false);
                }
            }
            Ok(true)
        })();
        inner.commit_latch.release_exclusive();

        let relocated = relocated?;
        if !relocated {
            inner.ctx.pm.compaction_end(false)?;
            info!("compaction aborted: no room below target {}", target);
            return Ok(false);
        }

        inner.ctx.pm.compaction_scan_free_list()?;

        // flush relocations and persist the reserve queue before
        // shrinking anything
        self.checkpoint()?;

        if !inner.ctx.pm.compaction_verify()? {
            inner.ctx.pm.compaction_end(false)?;
            self.checkpoint()?;
            info!("compaction aborted: zone not clear at target {}", target);
            return Ok(false);
        }

        inner.ctx.pm.compaction_end(true)?;
        inner.ctx.store.set_page_count(target)?;
        self.checkpoint()?;
        info!("compaction done, file truncated to {} pages", target);
        Ok(true)
    }

    fn open_all_indexes(&self) -> SmallResult {
        let registry = self.inner.registry_tree();
        let txn = self.bogus();
        let mut cursor = Cursor::new(Arc::clone(&registry), &txn);
        cursor.set_autoload(true);
        cursor.find_ge(&[REG_PREFIX_ROOT])?;
        while let Some(key) = cursor.key().map(|k| k.to_vec()) {
            if key.first() != Some(&REG_PREFIX_ROOT) {
                break;
            }
            if key.len() == 9 {
                let id = IndexId::from_be_bytes(key[1..9].try_into().unwrap());
                self.inner.open_tree_by_id(id)?;
            }
            cursor.next()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // maintenance & teardown
    // --------------------------------------------------------------

    /// Walk every open tree checking structural invariants.
    pub fn verify(&self) -> SmallResult {
        self.open_all_indexes()?;
        let trees: Vec<Arc<Tree>> = self
            .inner
            .trees_by_id
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for tree in trees {
            tree.verify()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> DatabaseStats {
        let pm = self.inner.ctx.pm.stats();
        DatabaseStats {
            total_pages: pm.total_pages,
            free_pages: pm.free_pages,
            recycled_pages: pm.recycled_pages,
            reserved_pages: pm.reserved_pages,
            cache_nodes: self.inner.ctx.cache.occupancy(),
            cache_capacity: self.inner.ctx.cache.capacity(),
            open_transactions: self.inner.live_txns.lock().unwrap().len(),
            checkpoint_sequence: self.inner.checkpoint_sequence(),
        }
    }

    /// Checkpoint and shut down; further operations return `Closed`.
    pub fn close(&self) -> SmallResult {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // stop the checkpointer first
        {
            let (lock, cond) = &*inner.shutdown;
            *lock.lock().unwrap() = true;
            cond.notify_all();
        }
        if let Some(handle) = inner.checkpointer.lock().unwrap().take() {
            let _ = handle.join();
        }

        if !inner.options.read_only {
            // final checkpoint despite the closed flag
            inner.closed.store(false, Ordering::Release);
            let result = self.checkpoint();
            inner.closed.store(true, Ordering::Release);
            result?;
        }

        // the base file becomes reopenable immediately, even while stale
        // handles to this engine linger
        inner.release_path();
        info!("store closed");
        Ok(())
    }
}


impl DbInner {
    pub(crate) fn registry_tree(&self) -> Arc<Tree> {
        self.registry
            .lock()
            .unwrap()
            .as_ref()
            .expect("registry not initialised")
            .clone()
    }

    pub(crate) fn checkpoint_sequence(&self) -> u64 {
        self.checkpoint_seq.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> SmallResult {
        if self.closed.load(Ordering::Acquire) {
            return Err(SmallError::new(ErrorKind::Closed, "the engine is closed"));
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> SmallResult {
        self.check_open()?;
        if self.options.read_only {
            return Err(SmallError::new(
                ErrorKind::Other,
                "the store is open read-only",
            ));
        }
        Ok(())
    }

    pub(crate) fn has_prepare_handler(&self, id: u32) -> bool {
        self.prepare_handlers.contains_key(&id)
    }

    pub(crate) fn tree_by_id(&self, id: IndexId) -> Option<Arc<Tree>> {
        self.trees_by_id.lock().unwrap().get(&id).cloned()
    }

    /// Open (or fetch) the tree for `id`, reading its root from the
    /// registry.
    pub(crate) fn open_tree_by_id(&self, id: IndexId) -> Result<Arc<Tree>, SmallError> {
        match self.try_open_tree_by_id(id)? {
            Some(tree) => Ok(tree),
            None => Err(SmallError::corrupt(&format!("unknown index id {}", id))),
        }
    }

    pub(crate) fn try_open_tree_by_id(
        &self,
        id: IndexId,
    ) -> Result<Option<Arc<Tree>>, SmallError> {
        if let Some(tree) = self.tree_by_id(id) {
            return Ok(Some(tree));
        }
        let registry = self.registry_tree();
        let root = match registry.load_value(&reg_root_key(id))? {
            Some(raw) if raw.len() == 8 => get_u64(&raw, 0),
            _ => return Ok(None),
        };
        let name = registry.load_value(&reg_id_name_key(id))?;
        let tree = Arc::new(Tree::open(Arc::clone(&self.ctx), id, name, root));
        self.ctx.cache.make_unevictable(root);
        let mut trees = self.trees_by_id.lock().unwrap();
        let entry = trees.entry(id).or_insert_with(|| Arc::clone(&tree));
        Ok(Some(Arc::clone(entry)))
    }

    pub(crate) fn deregister_txn(&self, id: OwnerId) {
        self.live_txns.lock().unwrap().remove(&id);
    }

    fn release_path(&self) {
        if self.path_registered.swap(false, Ordering::AcqRel) {
            if let Some(path) = &self.canonical_path {
                OPEN_FILES.lock().unwrap().remove(path);
            }
        }
    }
}

impl Drop for DbInner {
    fn drop(&mut self) {
        {
            let (lock, cond) = &*self.shutdown;
            if let Ok(mut stop) = lock.lock() {
                *stop = true;
                cond.notify_all();
            }
        }
        if let Some(handle) = self.checkpointer.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.release_path();
    }
}

// ------------------------------------------------------------------
// Index handle
// ------------------------------------------------------------------

impl Index {
    pub fn id(&self) -> IndexId {
        self.tree.id
    }

    pub fn name(&self) -> Option<Vec<u8>> {
        self.tree.name.rl().clone()
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn load(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        txn.load(&self.tree, key)
    }

    pub fn store(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> SmallResult {
        txn.store(&self.tree, key, value)
    }

    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> SmallResult {
        txn.delete(&self.tree, key)
    }

    pub fn cursor<'t>(&self, txn: &'t Transaction) -> Cursor<'t> {
        Cursor::new(Arc::clone(&self.tree), txn)
    }

    /// Count live entries by walking the leaves.
    pub fn count(&self) -> Result<u64, SmallError> {
        self.tree.count_entries()
    }

    pub fn verify(&self) -> SmallResult {
        self.tree.verify()
    }
}
