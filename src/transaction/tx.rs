//! Transactions (C8): lock ownership, undo/redo wiring, scopes,
//! commit/rollback and two-phase prepare.
//!
//! Ordering per operation: the key lock is acquired first (lock waits
//! must not hold any latch), then the commit latch is taken shared for
//! the mutation itself, then node latches. The undo record is written
//! before the tree changes; the redo record is buffered before commit
//! forces it out according to the durability mode.
//!
//! A bogus transaction acquires no locks and writes no undo; its
//! mutations go out as auto-committed redo under transaction id 0.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::btree::tree::Tree;
use crate::config::DurabilityMode;
use crate::db::DbInner;
use crate::error::{ErrorKind, SmallError};
use crate::transaction::lock_manager::{LockKey, LockMode, LockResult};
use crate::tx_log::redo_log::RedoRecord;
use crate::tx_log::undo_log::{UndoLog, UndoOp, UndoRecord};
use crate::types::{IndexId, OwnerId, SmallResult};

/// Redo ops from a bogus transaction carry this id; replay treats it as
/// always committed.
pub(crate) const BOGUS_TXN_ID: OwnerId = 0;

struct Scope {
    lock_mark: usize,
    undo_mark: u64,
}

pub(crate) struct TxnInner {
    locks: Vec<LockKey>,
    lock_set: HashSet<LockKey>,
    pub(crate) undo: Arc<Mutex<UndoLog>>,
    scopes: Vec<Scope>,
    redo_began: bool,
    prepared: Option<u32>,
}

pub struct Transaction {
    pub(crate) db: Arc<DbInner>,
    id: OwnerId,
    bogus: bool,
    durability: DurabilityMode,
    lock_timeout_nanos: i64,
    read_lock_mode: LockMode,
    inner: Mutex<TxnInner>,
    finished: AtomicBool,
}

impl Transaction {
    pub(crate) fn new(
        db: Arc<DbInner>,
        id: OwnerId,
        bogus: bool,
        durability: DurabilityMode,
        undo: Arc<Mutex<UndoLog>>,
    ) -> Self {
        let lock_timeout_nanos = db.options.lock_timeout_nanos;
        Self {
            db,
            id,
            bogus,
            durability,
            lock_timeout_nanos,
            read_lock_mode: LockMode::Upgradable,
            inner: Mutex::new(TxnInner {
                locks: Vec::new(),
                lock_set: HashSet::new(),
                undo,
                scopes: Vec::new(),
                redo_began: false,
                prepared: None,
            }),
            finished: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.id
    }

    pub fn is_bogus(&self) -> bool {
        self.bogus
    }

    pub fn durability_mode(&self) -> DurabilityMode {
        self.durability
    }

    /// Lock wait budget for this transaction; zero times out
    /// immediately, negative waits forever.
    pub fn set_lock_timeout_nanos(&mut self, nanos: i64) {
        self.lock_timeout_nanos = nanos;
    }

    /// Mode taken by plain reads: `Upgradable` (the default) for
    /// read-modify-write, `Shared` for pure readers.
    pub fn set_read_lock_mode(&mut self, mode: LockMode) {
        debug_assert_ne!(mode, LockMode::Exclusive);
        self.read_lock_mode = mode;
    }

    // --------------------------------------------------------------
    // locks
    // --------------------------------------------------------------

    /// Acquire `mode` on `(index_id, key)`, recording ownership.
    pub fn lock(&self, index_id: IndexId, key: &[u8], mode: LockMode) -> SmallResult {
        if self.bogus {
            return Ok(());
        }
        self.check_usable()?;
        let lock_key = LockKey::new(index_id, key);
        let result = self
            .db
            .lock_mgr
            .try_lock(self.id, &lock_key, mode, self.lock_timeout_nanos);
        if let Some(err) = result.to_error(key) {
            return Err(err);
        }
        if matches!(result, LockResult::Acquired | LockResult::Upgraded) {
            let mut inner = self.inner.lock().unwrap();
            if inner.lock_set.insert(lock_key.clone()) {
                inner.locks.push(lock_key);
            }
        }
        Ok(())
    }

    pub(crate) fn lock_for_read(&self, index_id: IndexId, key: &[u8]) -> SmallResult {
        if self.bogus {
            return Ok(());
        }
        self.lock(index_id, key, self.read_lock_mode)
    }

    /// Unpark this transaction from any lock wait; the blocked operation
    /// returns an interruption error and the wait queue entry is
    /// removed. Safe to call from another thread.
    pub fn interrupt(&self) {
        self.db.lock_mgr.interrupt(self.id);
    }

    pub fn lock_exclusive(&self, index_id: IndexId, key: &[u8]) -> SmallResult {
        self.lock(index_id, key, LockMode::Exclusive)
    }

    // --------------------------------------------------------------
    // reads and writes
    // --------------------------------------------------------------

    pub fn load(&self, tree: &Arc<Tree>, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        self.check_usable()?;
        self.lock_for_read(tree.id, key)?;
        tree.load_value(key)
    }

    /// Insert or replace `key` with `value`.
    pub fn store(&self, tree: &Arc<Tree>, key: &[u8], value: &[u8]) -> SmallResult {
        self.check_usable()?;
        self.db.check_writable()?;

        if self.bogus {
            let _commit = self.db.commit_latch.shared_scope();
            tree.store_value(key, value)?;
            let mut redo = self.db.redo.lock().unwrap();
            redo.append(&RedoRecord::Store {
                txn_id: BOGUS_TXN_ID,
                index_id: tree.id,
                key: key.to_vec(),
                value: value.to_vec(),
            })?;
            redo.commit(DurabilityMode::NoFlush)?;
            return Ok(());
        }

        // lock before any latch
        self.lock_exclusive(tree.id, key)?;

        let _commit = self.db.commit_latch.shared_scope();

        // the old value feeds the undo record; stable under our lock
        let old = tree.load_value(key)?;
        {
            let inner = self.inner.lock().unwrap();
            let record = match &old {
                None => UndoRecord {
                    op: UndoOp::Uninsert,
                    index_id: tree.id,
                    key: key.to_vec(),
                    old_value: None,
                },
                Some(old) => UndoRecord {
                    op: UndoOp::Unupdate,
                    index_id: tree.id,
                    key: key.to_vec(),
                    old_value: Some(old.clone()),
                },
            };
            let mut undo = inner.undo.lock().unwrap();
            undo.push(&record, &tree.ctx().pm, &tree.ctx().store)?;
        }

        self.append_redo(&RedoRecord::Store {
            txn_id: self.id,
            index_id: tree.id,
            key: key.to_vec(),
            value: value.to_vec(),
        })?;

        tree.store_value(key, value)?;

        // a store over our own pending delete revives the entry
        let lock_key = LockKey::new(tree.id, key);
        if self.db.lock_mgr.has_ghost(&lock_key) {
            self.db.lock_mgr.set_ghost(self.id, &lock_key, false);
        }
        Ok(())
    }

    /// Transactional delete: ghost the entry now, materialise at
    /// commit. Deleting an absent key is a no-op.
    pub fn delete(&self, tree: &Arc<Tree>, key: &[u8]) -> SmallResult {
        self.check_usable()?;
        self.db.check_writable()?;

        if self.bogus {
            let _commit = self.db.commit_latch.shared_scope();
            tree.delete_physical(key)?;
            let mut redo = self.db.redo.lock().unwrap();
            redo.append(&RedoRecord::Delete {
                txn_id: BOGUS_TXN_ID,
                index_id: tree.id,
                key: key.to_vec(),
            })?;
            redo.commit(DurabilityMode::NoFlush)?;
            return Ok(());
        }

        self.lock_exclusive(tree.id, key)?;

        let _commit = self.db.commit_latch.shared_scope();

        let old = match tree.load_value(key)? {
            Some(old) => old,
            None => return Ok(()),
        };
        {
            let inner = self.inner.lock().unwrap();
            let record = UndoRecord {
                op: UndoOp::Undelete,
                index_id: tree.id,
                key: key.to_vec(),
                old_value: Some(old),
            };
            let mut undo = inner.undo.lock().unwrap();
            undo.push(&record, &tree.ctx().pm, &tree.ctx().store)?;
        }

        self.append_redo(&RedoRecord::Delete {
            txn_id: self.id,
            index_id: tree.id,
            key: key.to_vec(),
        })?;

        tree.ghost_delete(key)?;
        self.db
            .lock_mgr
            .set_ghost(self.id, &LockKey::new(tree.id, key), true);
        Ok(())
    }

    fn append_redo(&self, record: &RedoRecord) -> SmallResult {
        if self.durability == DurabilityMode::NoRedo {
            return Ok(());
        }
        let mut inner = self.inner.lock().unwrap();
        let mut redo = self.db.redo.lock().unwrap();
        if !inner.redo_began {
            redo.append(&RedoRecord::TxnBegin { txn_id: self.id })?;
            inner.redo_began = true;
        }
        redo.append(record)?;
        Ok(())
    }

    // --------------------------------------------------------------
    // scopes
    // --------------------------------------------------------------

    /// Push a nested scope; `exit` rolls back to it.
    pub fn enter(&self) -> SmallResult {
        self.check_usable()?;
        let mut inner = self.inner.lock().unwrap();
        let scope = Scope {
            lock_mark: inner.locks.len(),
            undo_mark: inner.undo.lock().unwrap().record_count,
        };
        inner.scopes.push(scope);
        Ok(())
    }

    /// Pop the innermost scope: roll back everything since the matching
    /// `enter` and release the locks acquired inside it.
    pub fn exit(&self) -> SmallResult {
        self.check_usable()?;
        let (lock_mark, undo_mark) = {
            let mut inner = self.inner.lock().unwrap();
            match inner.scopes.pop() {
                Some(scope) => (scope.lock_mark, scope.undo_mark),
                None => return Ok(()),
            }
        };
        self.rollback_to(undo_mark)?;

        let released = {
            let mut inner = self.inner.lock().unwrap();
            let released: Vec<LockKey> = inner.locks.split_off(lock_mark);
            for key in &released {
                inner.lock_set.remove(key);
            }
            released
        };
        for key in released.iter().rev() {
            self.db.lock_mgr.unlock(self.id, key);
        }
        Ok(())
    }

    // --------------------------------------------------------------
    // commit / rollback
    // --------------------------------------------------------------

    /// Materialise ghosts, make the redo durable per the transaction's
    /// mode, free the undo log and release every lock.
    pub fn commit(&self) -> SmallResult {
        if self.bogus {
            return Ok(());
        }
        self.check_usable()?;

        // ghost deletes become physical while the exclusive locks are
        // still held, so no reader can observe the half-done state
        let locks: Vec<LockKey> = {
            let inner = self.inner.lock().unwrap();
            inner.locks.clone()
        };
        {
            let _commit = self.db.commit_latch.shared_scope();
            for key in &locks {
                if self.db.lock_mgr.has_ghost(key) {
                    if let Some(tree) = self.db.tree_by_id(key.index_id) {
                        tree.delete_physical(&key.key)?;
                    }
                    self.db.lock_mgr.set_ghost(self.id, key, false);
                }
            }
        }

        {
            // latch before the undo mutex; the checkpoint takes them in
            // the same order
            let _commit = self.db.commit_latch.shared_scope();
            let mut inner = self.inner.lock().unwrap();
            if inner.redo_began {
                let mut redo = self.db.redo.lock().unwrap();
                redo.append(&RedoRecord::TxnCommit { txn_id: self.id })?;
                redo.commit(self.durability)?;
            }
            inner.prepared = None;
            let mut undo = inner.undo.lock().unwrap();
            undo.free_pages(&self.db.ctx.pm, self.db.checkpoint_sequence())?;
        }

        self.release_all_locks();
        self.db.deregister_txn(self.id);
        self.finished.store(true, Ordering::Release);
        debug!("txn {} committed", self.id);
        Ok(())
    }

    /// Roll everything back and release the locks; the transaction is
    /// reusable afterwards.
    pub fn reset(&self) -> SmallResult {
        if self.bogus {
            return Ok(());
        }
        if self.finished.load(Ordering::Acquire) {
            return Ok(());
        }

        self.rollback_to(0)?;

        {
            let _commit = self.db.commit_latch.shared_scope();
            let mut inner = self.inner.lock().unwrap();
            inner.scopes.clear();
            inner.prepared = None;
            if inner.redo_began {
                let mut redo = self.db.redo.lock().unwrap();
                redo.append(&RedoRecord::TxnRollback { txn_id: self.id })?;
                redo.flush()?;
                inner.redo_began = false;
            }
            let mut undo = inner.undo.lock().unwrap();
            undo.free_pages(&self.db.ctx.pm, self.db.checkpoint_sequence())?;
        }

        self.release_all_locks();
        debug!("txn {} reset", self.id);
        Ok(())
    }

    /// Apply undo records newest-first down to `keep` records.
    fn rollback_to(&self, keep: u64) -> SmallResult {
        let records = {
            let inner = self.inner.lock().unwrap();
            let undo = inner.undo.lock().unwrap();
            let total = undo.record_count;
            if total <= keep {
                return Ok(());
            }
            let mut records = undo.records_newest_first(&self.db.ctx.store)?;
            records.truncate((total - keep) as usize);
            records
        };

        let _commit = self.db.commit_latch.shared_scope();
        for record in &records {
            let tree = match self.db.tree_by_id(record.index_id) {
                Some(tree) => tree,
                None => {
                    warn!("undo for vanished index {}", record.index_id);
                    continue;
                }
            };
            match &record.op {
                UndoOp::Uninsert => tree.delete_physical(&record.key)?,
                UndoOp::Unupdate | UndoOp::Undelete => {
                    let old = record.old_value.as_deref().unwrap_or(&[]);
                    tree.store_value(&record.key, old)?;
                    // restoring the value cancels any pending ghost
                    let lock_key = LockKey::new(record.index_id, &record.key);
                    if self.db.lock_mgr.has_ghost(&lock_key) {
                        self.db.lock_mgr.set_ghost(self.id, &lock_key, false);
                    }
                }
            }
        }

        let inner = self.inner.lock().unwrap();
        let mut undo = inner.undo.lock().unwrap();
        if !undo.truncate_buffer_to(keep) {
            // records live on spilled pages; they stay and re-replay
            // harmlessly on a later rollback (each restores prior state)
        }
        Ok(())
    }

    fn release_all_locks(&self) {
        let locks: Vec<LockKey> = {
            let mut inner = self.inner.lock().unwrap();
            inner.lock_set.clear();
            inner.scopes.clear();
            std::mem::take(&mut inner.locks)
        };
        for key in locks.iter().rev() {
            self.db.lock_mgr.unlock(self.id, key);
        }
    }

    // --------------------------------------------------------------
    // two-phase prepare
    // --------------------------------------------------------------

    /// First phase of 2PC: flush a durable prepare marker. After a
    /// crash, recovery re-creates the transaction and hands it to the
    /// registered handler, which must commit or reset it.
    pub fn prepare(&self, handler_id: u32) -> SmallResult {
        self.check_usable()?;
        if self.bogus {
            return Err(SmallError::new(
                ErrorKind::Other,
                "a bogus transaction cannot prepare",
            ));
        }
        if !self.db.has_prepare_handler(handler_id) {
            return Err(SmallError::new(
                ErrorKind::Other,
                &format!("no prepare handler registered under {}", handler_id),
            ));
        }
        let mut inner = self.inner.lock().unwrap();
        let mut redo = self.db.redo.lock().unwrap();
        if !inner.redo_began {
            redo.append(&RedoRecord::TxnBegin { txn_id: self.id })?;
            inner.redo_began = true;
        }
        redo.append(&RedoRecord::TxnPrepare {
            txn_id: self.id,
            handler_id,
        })?;
        redo.sync()?;
        inner.prepared = Some(handler_id);
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.inner.lock().unwrap().prepared.is_some()
    }

    fn check_usable(&self) -> SmallResult {
        self.db.check_open()?;
        if self.finished.load(Ordering::Acquire) {
            return Err(SmallError::new(
                ErrorKind::Other,
                &format!("txn {} already committed", self.id),
            ));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.bogus || self.finished.load(Ordering::Acquire) {
            return;
        }
        // uncommitted work rolls back, matching the reset contract
        if let Err(e) = self.reset() {
            warn!("rollback on drop failed for txn {}: {}", self.id, e);
        }
        self.db.deregister_txn(self.id);
    }
}

impl std::fmt::Display for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "tx_{}", self.id)
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
