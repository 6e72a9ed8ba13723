use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ErrorKind, SmallError};
use crate::transaction::Transaction;
use crate::types::SmallResult;

/// When is a transaction's redo durable?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityMode {
    /// Skip redo logging entirely; mutations are non-recoverable until the
    /// next checkpoint.
    NoRedo,
    /// Redo is buffered in memory only.
    NoFlush,
    /// Redo is written to the OS on commit, without fsync.
    NoSync,
    /// Redo is fsynced before commit returns.
    Sync,
}

/// Policy for a shared-to-upgradable lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockUpgradeRule {
    /// Reject when any other owner also holds the lock shared.
    Strict,
    /// Allow as long as no other upgradable/exclusive owner exists.
    Lenient,
    /// Skip the check; the caller accepts the deadlock risk.
    Unchecked,
}

/// Invoked during recovery for every prepared transaction that neither
/// committed nor rolled back before the crash. The handler decides.
pub trait PrepareHandler: Send + Sync {
    fn recover(&self, txn: Transaction) -> SmallResult;
}

/// Engine configuration. Chain the setters, then call
/// [`crate::Database::open`].
///
/// ```ignore
/// let db = Database::open(
///     Options::new()
///         .base_file("/tmp/app.store")
///         .max_cache_size(64 * 1024 * 1024)
///         .durability_mode(DurabilityMode::Sync),
/// )?;
/// ```
#[derive(Clone)]
pub struct Options {
    pub(crate) page_size: u32,
    pub(crate) min_cache_size: u64,
    pub(crate) max_cache_size: u64,
    pub(crate) durability_mode: DurabilityMode,
    pub(crate) lock_timeout_nanos: i64,
    pub(crate) lock_upgrade_rule: LockUpgradeRule,
    pub(crate) checkpoint_rate: Duration,
    pub(crate) checkpoint_size_threshold: u64,
    pub(crate) checkpoint_delay_threshold: Duration,
    pub(crate) read_only: bool,
    pub(crate) base_file: Option<PathBuf>,
    pub(crate) data_files: Vec<PathBuf>,
    pub(crate) redo_segment_size: u64,
    pub(crate) prepare_handlers: Vec<(u32, Arc<dyn PrepareHandler>)>,
}

pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const MIN_PAGE_SIZE: u32 = 512;
pub const MAX_PAGE_SIZE: u32 = 65536;

impl Options {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            min_cache_size: 64 * DEFAULT_PAGE_SIZE as u64,
            max_cache_size: 4 * 1024 * 1024,
            durability_mode: DurabilityMode::Sync,
            lock_timeout_nanos: 1_000_000_000,
            lock_upgrade_rule: LockUpgradeRule::Strict,
            checkpoint_rate: Duration::from_secs(1),
            checkpoint_size_threshold: 64 * 1024 * 1024,
            checkpoint_delay_threshold: Duration::from_secs(60),
            read_only: false,
            base_file: None,
            data_files: Vec::new(),
            redo_segment_size: 16 * 1024 * 1024,
            prepare_handlers: Vec::new(),
        }
    }

    /// Physical page size; fixed for the life of the store.
    pub fn page_size(mut self, bytes: u32) -> Self {
        self.page_size = bytes;
        self
    }

    /// Lower bound on the node cache, in bytes.
    pub fn min_cache_size(mut self, bytes: u64) -> Self {
        self.min_cache_size = bytes;
        self
    }

    /// Upper bound on the node cache, in bytes.
    pub fn max_cache_size(mut self, bytes: u64) -> Self {
        self.max_cache_size = bytes;
        self
    }

    /// Default mode for transactions without an explicit override.
    pub fn durability_mode(mut self, mode: DurabilityMode) -> Self {
        self.durability_mode = mode;
        self
    }

    /// Default lock wait. Zero means immediate timeout; negative means
    /// wait forever.
    pub fn lock_timeout_nanos(mut self, nanos: i64) -> Self {
        self.lock_timeout_nanos = nanos;
        self
    }

    pub fn lock_upgrade_rule(mut self, rule: LockUpgradeRule) -> Self {
        self.lock_upgrade_rule = rule;
        self
    }

    /// Target interval between automatic checkpoints.
    pub fn checkpoint_rate(mut self, rate: Duration) -> Self {
        self.checkpoint_rate = rate;
        self
    }

    /// Redo bytes required before an automatic checkpoint bothers to run.
    pub fn checkpoint_size_threshold(mut self, bytes: u64) -> Self {
        self.checkpoint_size_threshold = bytes;
        self
    }

    /// Wall-clock cap that overrides the size threshold.
    pub fn checkpoint_delay_threshold(mut self, delay: Duration) -> Self {
        self.checkpoint_delay_threshold = delay;
        self
    }

    /// Refuse all mutations; still allow opening the file.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Backing file path. When never set, the engine runs fully in memory.
    pub fn base_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.base_file = Some(path.into());
        self
    }

    /// Explicit data file paths; more than one stripes pages across them.
    /// Defaults to `<base_file>.db`.
    pub fn data_files<P: Into<PathBuf>>(mut self, paths: Vec<P>) -> Self {
        self.data_files = paths.into_iter().map(|p| p.into()).collect();
        self
    }

    /// Size at which redo segments rotate.
    pub fn redo_segment_size(mut self, bytes: u64) -> Self {
        self.redo_segment_size = bytes;
        self
    }

    /// Register a prepared-transaction recovery handler under an id; the
    /// id is what `Transaction::prepare` refers to.
    pub fn prepare_handler(mut self, id: u32, handler: Arc<dyn PrepareHandler>) -> Self {
        self.prepare_handlers.push((id, handler));
        self
    }

    pub(crate) fn validate(&self) -> SmallResult {
        if self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
            || !self.page_size.is_power_of_two()
        {
            return Err(SmallError::new(
                ErrorKind::Other,
                &format!("invalid page size: {}", self.page_size),
            ));
        }
        if self.min_cache_size > self.max_cache_size {
            return Err(SmallError::new(
                ErrorKind::Other,
                &format!(
                    "min cache size exceeds max: {} > {}",
                    self.min_cache_size, self.max_cache_size
                ),
            ));
        }
        if self.max_cache_size < 8 * self.page_size as u64 {
            return Err(SmallError::new(
                ErrorKind::Other,
                "max cache size must hold at least 8 pages",
            ));
        }
        if self.base_file.is_none() && !self.data_files.is_empty() {
            return Err(SmallError::new(
                ErrorKind::Other,
                "data files require a base file",
            ));
        }
        Ok(())
    }
}

impl Default for Options {
    fn default() -> Self {
        Self::new()
    }
}
