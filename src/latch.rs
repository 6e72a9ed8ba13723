//! A non-reentrant shared/exclusive latch.
//!
//! Latches guard short critical sections: node field access, the cache
//! chain, the commit snapshot. They are never held across a wait for
//! another key, and only the documented paths (eviction write-back,
//! fragmented-value I/O) may hold one across page store I/O.
//!
//! Unlike `std::sync::RwLock` this is not a guard-based lock: acquire and
//! release are explicit calls, which is what the checkpoint needs to hold
//! a mode across function boundaries and downgrade in the middle. The
//! caller upholds the pairing; every acquire has exactly one release.

use std::sync::{Condvar, Mutex};

const SPIN_LIMIT: u32 = 64;

#[derive(Default)]
struct LatchState {
    /// Number of shared holders.
    shared: u32,
    /// Whether an exclusive holder exists.
    exclusive: bool,
    /// Parked writers; new readers defer to them.
    exclusive_waiters: u32,
}

pub struct Latch {
    state: Mutex<LatchState>,
    shared_cond: Condvar,
    exclusive_cond: Condvar,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::default()),
            shared_cond: Condvar::new(),
            exclusive_cond: Condvar::new(),
        }
    }

    pub fn acquire_shared(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_acquire_shared() {
                return;
            }
            std::hint::spin_loop();
        }

        let mut state = self.state.lock().unwrap();
        while state.exclusive || state.exclusive_waiters > 0 {
            state = self.shared_cond.wait(state).unwrap();
        }
        state.shared += 1;
    }

    pub fn try_acquire_shared(&self) -> bool {
        match self.state.try_lock() {
            Ok(mut state) => {
                if state.exclusive {
                    return false;
                }
                state.shared += 1;
                true
            }
            Err(_) => false,
        }
    }

    pub fn release_shared(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.shared > 0 && !state.exclusive);
        state.shared -= 1;
        if state.shared == 0 && state.exclusive_waiters > 0 {
            self.exclusive_cond.notify_one();
        }
    }

    pub fn acquire_exclusive(&self) {
        for _ in 0..SPIN_LIMIT {
            if self.try_acquire_exclusive() {
                return;
            }
            std::hint::spin_loop();
        }

        let mut state = self.state.lock().unwrap();
        state.exclusive_waiters += 1;
        while state.exclusive || state.shared > 0 {
            state = self.exclusive_cond.wait(state).unwrap();
        }
        state.exclusive_waiters -= 1;
        state.exclusive = true;
    }

    pub fn try_acquire_exclusive(&self) -> bool {
        match self.state.try_lock() {
            Ok(mut state) => {
                if state.exclusive || state.shared > 0 {
                    return false;
                }
                state.exclusive = true;
                true
            }
            Err(_) => false,
        }
    }

    pub fn release_exclusive(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.exclusive);
        state.exclusive = false;
        if state.exclusive_waiters > 0 {
            self.exclusive_cond.notify_one();
        } else {
            self.shared_cond.notify_all();
        }
    }

    /// Attempt to turn the caller's shared hold into an exclusive one.
    /// Succeeds only when the caller is the sole shared holder.
    pub fn try_upgrade(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.shared > 0 && !state.exclusive);
        if state.shared != 1 {
            return false;
        }
        state.shared = 0;
        state.exclusive = true;
        true
    }

    /// Turn the caller's exclusive hold into a shared one without letting
    /// any writer in between.
    pub fn downgrade(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.exclusive);
        state.exclusive = false;
        state.shared = 1;
        self.shared_cond.notify_all();
    }
}

impl Latch {
    /// Scope-bound shared hold, for callers that cannot easily pair the
    /// release across early returns.
    pub fn shared_scope(&self) -> SharedScope<'_> {
        self.acquire_shared();
        SharedScope { latch: self }
    }
}

pub struct SharedScope<'a> {
    latch: &'a Latch,
}

impl Drop for SharedScope<'_> {
    fn drop(&mut self) {
        self.latch.release_shared();
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Latch {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.state.try_lock() {
            Ok(state) => write!(
                f,
                "Latch[s: {}, x: {}, xw: {}]",
                state.shared, state.exclusive, state.exclusive_waiters
            ),
            Err(_) => write!(f, "Latch[contended]"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_shared_is_concurrent() {
        let latch = Latch::new();
        latch.acquire_shared();
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_acquire_exclusive());
        latch.release_shared();
        latch.release_shared();
        assert!(latch.try_acquire_exclusive());
        latch.release_exclusive();
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let latch = Latch::new();
        latch.acquire_shared();
        assert!(latch.try_upgrade());
        assert!(!latch.try_acquire_shared());
        latch.downgrade();
        assert!(latch.try_acquire_shared());
        latch.release_shared();
        latch.release_shared();

        // upgrade refused while a second reader exists
        latch.acquire_shared();
        assert!(latch.try_acquire_shared());
        assert!(!latch.try_upgrade());
        latch.release_shared();
        latch.release_shared();
    }

    #[test]
    fn test_exclusive_excludes_everything() {
        let latch = Arc::new(Latch::new());
        let counter = Arc::new(AtomicU32::new(0));

        latch.acquire_exclusive();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let latch = Arc::clone(&latch);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                latch.acquire_shared();
                counter.fetch_add(1, Ordering::SeqCst);
                latch.release_shared();
            }));
        }

        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        latch.release_exclusive();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
