//! The lock manager: transactional key locks with shared, upgradable and
//! exclusive modes, fair FIFO waits and deadlock detection (C5).
//!
//! Locks are keyed by `(index_id, key)` and live in a fixed array of
//! hash-table segments, each with its own mutex and condition variable.
//! Waiters queue per lock (upgradable requests in one queue, shared and
//! exclusive in the other) and self-select on wakeup by checking
//! whether they are at the front of the contiguous grantable run, which
//! yields the documented fairness: an exclusive release admits at most
//! one upgradable waiter plus every shared waiter ahead of the next
//! exclusive one.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use itertools::Itertools;
use log::debug;

use crate::config::LockUpgradeRule;
use crate::error::{ErrorKind, SmallError};
use crate::transaction::wait_for_graph::WaitForGraph;
use crate::types::{IndexId, OwnerId};
use crate::utils::display_key;

const NUM_SEGMENTS: usize = 64;

/// Poll slice while parked, so interruption and deadlock checks run even
/// under an infinite timeout.
const PARK_SLICE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockMode {
    Shared,
    Upgradable,
    Exclusive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockResult {
    Acquired,
    /// The owner held the lock upgradable and now holds it exclusively.
    Upgraded,
    /// Already held at the requested (or a higher) mode; not re-counted.
    OwnedShared,
    OwnedUpgradable,
    OwnedExclusive,
    TimedOut,
    Interrupted,
    /// Shared-to-upgradable denied by the configured rule.
    Illegal,
    /// The wait would close a cycle; the attachment names every owner on
    /// it, the last being the guilty one.
    Deadlock(Vec<OwnerId>),
}

impl LockResult {
    pub fn is_granted(&self) -> bool {
        matches!(
            self,
            LockResult::Acquired
                | LockResult::Upgraded
                | LockResult::OwnedShared
                | LockResult::OwnedUpgradable
                | LockResult::OwnedExclusive
        )
    }

    pub fn to_error(&self, key: &[u8]) -> Option<SmallError> {
        match self {
            LockResult::TimedOut => Some(SmallError::new(
                ErrorKind::LockTimeout,
                &format!("lock timeout on key {}", display_key(key)),
            )),
            LockResult::Interrupted => Some(SmallError::new(
                ErrorKind::LockTimeout,
                &format!("lock wait interrupted on key {}", display_key(key)),
            )),
            LockResult::Illegal => Some(SmallError::new(
                ErrorKind::IllegalUpgrade,
                &format!("illegal lock upgrade on key {}", display_key(key)),
            )),
            LockResult::Deadlock(cycle) => Some(SmallError::new(
                ErrorKind::Deadlock,
                &format!(
                    "deadlock detected on key {}, cycle: {}",
                    display_key(key),
                    cycle.iter().map(|o| format!("tx_{}", o)).join(" -> ")
                ),
            )),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub index_id: IndexId,
    pub key: Vec<u8>,
}

impl LockKey {
    pub fn new(index_id: IndexId, key: &[u8]) -> Self {
        Self {
            index_id,
            key: key.to_vec(),
        }
    }
}

struct Waiter {
    owner: OwnerId,
    mode: LockMode,
    ticket: u64,
}

#[derive(Default)]
struct LockEntry {
    shared_owners: HashSet<OwnerId>,
    /// Upgradable or exclusive holder.
    owner: Option<OwnerId>,
    exclusive: bool,
    /// A deletion pending materialisation when the holder commits.
    ghost: bool,
    queue_u: VecDeque<Waiter>,
    queue_sx: VecDeque<Waiter>,
}

impl LockEntry {
    /// Packed counter encoding: `0xxx…` = N shared, `1xxx…` = one
    /// upgradable plus N shared, all-ones = exclusive. Diagnostic only;
    /// the fields are authoritative.
    #[allow(dead_code)]
    fn lock_count(&self) -> u32 {
        if self.exclusive {
            !0
        } else {
            let mut count = self.shared_owners.len() as u32;
            if self.owner.is_some() {
                count |= 0x8000_0000;
            }
            count
        }
    }

    fn mode_held_by(&self, owner: OwnerId) -> Option<LockMode> {
        if self.owner == Some(owner) {
            if self.exclusive {
                return Some(LockMode::Exclusive);
            }
            return Some(LockMode::Upgradable);
        }
        if self.shared_owners.contains(&owner) {
            return Some(LockMode::Shared);
        }
        None
    }

    fn is_unused(&self) -> bool {
        self.shared_owners.is_empty()
            && self.owner.is_none()
            && !self.ghost
            && self.queue_u.is_empty()
            && self.queue_sx.is_empty()
    }

    /// Conflicting holders a request by `owner` would wait behind.
    fn blockers(&self, owner: OwnerId, mode: LockMode) -> Vec<OwnerId> {
        let mut blockers = Vec::new();
        if let Some(holder) = self.owner {
            if holder != owner {
                blockers.push(holder);
            }
        }
        if mode == LockMode::Exclusive {
            for shared in &self.shared_owners {
                if *shared != owner {
                    blockers.push(*shared);
                }
            }
        }
        blockers
    }
}

struct Segment {
    entries: Mutex<HashMap<LockKey, LockEntry>>,
    cond: Condvar,
}

pub struct LockManager {
    segments: Vec<Segment>,
    rule: LockUpgradeRule,
    graph: Mutex<WaitForGraph>,
    interrupted: Mutex<HashSet<OwnerId>>,
    ticket: AtomicU64,
}

impl LockManager {
    pub fn new(rule: LockUpgradeRule) -> Self {
        Self {
            segments: (0..NUM_SEGMENTS)
                .map(|_| Segment {
                    entries: Mutex::new(HashMap::new()),
                    cond: Condvar::new(),
                })
                .collect(),
            rule,
            graph: Mutex::new(WaitForGraph::new()),
            interrupted: Mutex::new(HashSet::new()),
            ticket: AtomicU64::new(1),
        }
    }

    fn segment_for(&self, key: &LockKey) -> &Segment {
        let mut hasher = DefaultHasher::new();
        key.key.hash(&mut hasher);
        let scrambled = (key.index_id ^ hasher.finish()).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        &self.segments[(scrambled >> 32) as usize & (NUM_SEGMENTS - 1)]
    }

    /// Request `mode` on `(index_id, key)` for `owner`, waiting up to
    /// `timeout_nanos` (0 = immediate, negative = forever).
    pub fn try_lock(
        &self,
        owner: OwnerId,
        key: &LockKey,
        mode: LockMode,
        timeout_nanos: i64,
    ) -> LockResult {
        let segment = self.segment_for(key);
        let mut entries = segment.entries.lock().unwrap();
        let entry = entries.entry(key.clone()).or_default();

        // reentrancy: the same or a lower mode is a no-op
        if let Some(held) = entry.mode_held_by(owner) {
            if held >= mode {
                return match held {
                    LockMode::Shared => LockResult::OwnedShared,
                    LockMode::Upgradable => LockResult::OwnedUpgradable,
                    LockMode::Exclusive => LockResult::OwnedExclusive,
                };
            }
            match (held, mode) {
                (LockMode::Shared, LockMode::Upgradable) => {
                    let others = entry.shared_owners.len() > 1;
                    match self.rule {
                        LockUpgradeRule::Strict if others => return LockResult::Illegal,
                        _ => {}
                    }
                }
                (LockMode::Shared, LockMode::Exclusive) => {
                    // the upgrade path goes through upgradable
                    return LockResult::Illegal;
                }
                (LockMode::Upgradable, LockMode::Exclusive) => {}
                _ => unreachable!(),
            }
        }

        let deadline = if timeout_nanos < 0 {
            None
        } else {
            Some(Instant::now() + Duration::from_nanos(timeout_nanos as u64))
        };

        if let Some(result) = Self::try_grant(entry, owner, mode, None) {
            return result;
        }
        if timeout_nanos == 0 {
            return LockResult::TimedOut;
        }

        // enqueue and park
        let ticket = self.ticket.fetch_add(1, Ordering::Relaxed);
        let waiter = Waiter {
            owner,
            mode,
            ticket,
        };
        if mode == LockMode::Upgradable {
            entry.queue_u.push_back(waiter);
        } else {
            entry.queue_sx.push_back(waiter);
        }

        loop {
            // publish wait-for edges and look for a cycle before parking;
            // the youngest owner on the cycle is the victim, so exactly
            // one participant backs off
            {
                let entry = entries.get(key).expect("entry vanished while queued");
                let blockers = entry.blockers(owner, mode);
                let mut graph = self.graph.lock().unwrap();
                // replace, never union: the lock's holders change while
                // we park, and a stale edge to a departed holder can
                // close a cycle that does not exist
                graph.remove_waiter(owner);
                for blocker in blockers {
                    graph.add_edge(owner, blocker);
                }
                if let Some(cycle) = graph.find_cycle(owner) {
                    let victim = *cycle.iter().max().unwrap();
                    if victim == owner {
                        graph.remove_waiter(owner);
                        drop(graph);
                        debug!("deadlock cycle {:?} on key {:?}", cycle, key.key);
                        Self::remove_waiter(entries.get_mut(key).unwrap(), owner, ticket);
                        segment.cond.notify_all();
                        return LockResult::Deadlock(cycle);
                    }
                    // someone else is the victim; they re-check within a
                    // park slice and break the cycle
                }
            }

            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        self.clear_wait_state(owner);
                        Self::remove_waiter(entries.get_mut(key).unwrap(), owner, ticket);
                        segment.cond.notify_all();
                        return LockResult::TimedOut;
                    }
                    (d - now).min(PARK_SLICE)
                }
                None => PARK_SLICE,
            };

            let (guard, _timed_out) = segment.cond.wait_timeout(entries, slice).unwrap();
            entries = guard;

            if self.interrupted.lock().unwrap().remove(&owner) {
                self.clear_wait_state(owner);
                Self::remove_waiter(entries.get_mut(key).unwrap(), owner, ticket);
                segment.cond.notify_all();
                return LockResult::Interrupted;
            }

            let entry = entries.get_mut(key).expect("entry vanished while queued");
            if let Some(result) = Self::try_grant(entry, owner, mode, Some(ticket)) {
                Self::remove_waiter(entry, owner, ticket);
                self.clear_wait_state(owner);
                // a shared grant may unblock further contiguous shared
                // waiters behind us
                segment.cond.notify_all();
                return result;
            }
        }
    }

    /// Attempt an immediate grant. When `ticket` is given, the request
    /// must also be at the front of the grantable run of its queue
    /// (fairness); fresh requests only grant when no one is queued ahead.
    ///
    /// The fairness gate never applies to the upgradable holder asking
    /// for exclusive: it is not a fresh competitor, and every exclusive
    /// waiter already queued is blocked *by* it. Gating the upgrade
    /// behind them would deadlock both sides, and undetectably so, since
    /// the holder has no wait-for edge to itself.
    fn try_grant(
        entry: &mut LockEntry,
        owner: OwnerId,
        mode: LockMode,
        ticket: Option<u64>,
    ) -> Option<LockResult> {
        let reentrant_upgrade =
            mode == LockMode::Exclusive && entry.owner == Some(owner) && !entry.exclusive;

        let in_turn = reentrant_upgrade
            || match mode {
                LockMode::Upgradable => match ticket {
                    None => entry.queue_u.is_empty(),
                    Some(t) => entry.queue_u.front().map(|w| w.ticket) == Some(t),
                },
                _ => match ticket {
                    None => entry.queue_sx.is_empty(),
                    Some(t) => {
                        // every sx waiter ahead of us must be a shared one
                        // being granted in the same wave
                        let mut ahead_ok = false;
                        for w in &entry.queue_sx {
                            if w.ticket == t {
                                ahead_ok = true;
                                break;
                            }
                            if w.mode != LockMode::Shared || mode != LockMode::Shared {
                                break;
                            }
                        }
                        ahead_ok
                    }
                },
            };
        if !in_turn {
            return None;
        }

        match mode {
            LockMode::Shared => {
                if entry.exclusive {
                    return None;
                }
                entry.shared_owners.insert(owner);
                Some(LockResult::Acquired)
            }
            LockMode::Upgradable => {
                if entry.exclusive {
                    return None;
                }
                match entry.owner {
                    Some(_) => None,
                    None => {
                        let was_shared = entry.shared_owners.remove(&owner);
                        entry.owner = Some(owner);
                        let _ = was_shared;
                        Some(LockResult::Acquired)
                    }
                }
            }
            LockMode::Exclusive => {
                if entry.owner == Some(owner) && !entry.exclusive {
                    // upgradable → exclusive once no other shared holder
                    let others = entry.shared_owners.iter().any(|o| *o != owner);
                    if others {
                        return None;
                    }
                    entry.shared_owners.remove(&owner);
                    entry.exclusive = true;
                    Some(LockResult::Upgraded)
                } else if entry.owner.is_none()
                    && !entry.exclusive
                    && entry.shared_owners.iter().all(|o| *o == owner)
                {
                    entry.shared_owners.clear();
                    entry.owner = Some(owner);
                    entry.exclusive = true;
                    Some(LockResult::Acquired)
                } else {
                    None
                }
            }
        }
    }

    fn remove_waiter(entry: &mut LockEntry, owner: OwnerId, ticket: u64) {
        entry.queue_u.retain(|w| w.ticket != ticket || w.owner != owner);
        entry.queue_sx.retain(|w| w.ticket != ticket || w.owner != owner);
    }

    fn clear_wait_state(&self, owner: OwnerId) {
        self.graph.lock().unwrap().remove_waiter(owner);
    }

    /// Release whatever `owner` holds on `key`. Returns true when the
    /// lock carried a ghost (the caller has just materialised it).
    pub fn unlock(&self, owner: OwnerId, key: &LockKey) -> bool {
        let segment = self.segment_for(key);
        let mut entries = segment.entries.lock().unwrap();
        let entry = match entries.get_mut(key) {
            Some(e) => e,
            None => return false,
        };
        let mut had_ghost = false;
        if entry.owner == Some(owner) {
            if entry.ghost {
                had_ghost = true;
                entry.ghost = false;
            }
            entry.owner = None;
            entry.exclusive = false;
        }
        entry.shared_owners.remove(&owner);
        if entry.is_unused() {
            entries.remove(key);
        }
        drop(entries);
        segment.cond.notify_all();
        had_ghost
    }

    pub fn mode_held(&self, owner: OwnerId, key: &LockKey) -> Option<LockMode> {
        let segment = self.segment_for(key);
        let entries = segment.entries.lock().unwrap();
        entries.get(key).and_then(|e| e.mode_held_by(owner))
    }

    /// Mark the pending delete on an exclusively held lock.
    pub fn set_ghost(&self, owner: OwnerId, key: &LockKey, ghost: bool) {
        let segment = self.segment_for(key);
        let mut entries = segment.entries.lock().unwrap();
        if let Some(entry) = entries.get_mut(key) {
            debug_assert_eq!(entry.owner, Some(owner));
            debug_assert!(entry.exclusive);
            entry.ghost = ghost;
        }
    }

    pub fn has_ghost(&self, key: &LockKey) -> bool {
        let segment = self.segment_for(key);
        let entries = segment.entries.lock().unwrap();
        entries.get(key).map(|e| e.ghost).unwrap_or(false)
    }

    /// Flag an owner so its next wakeup returns `Interrupted`.
    pub fn interrupt(&self, owner: OwnerId) {
        self.interrupted.lock().unwrap().insert(owner);
        for segment in &self.segments {
            segment.cond.notify_all();
        }
    }
}
