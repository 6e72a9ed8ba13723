//! An embedded, transactional, ordered key-value storage engine.
//!
//! Keys and values are opaque byte sequences. Named indexes are B+
//! trees over a paged file; reads and writes run under shared /
//! upgradable / exclusive key locks with deadlock detection, mutations
//! are undo/redo logged, and checkpoints commit an atomic snapshot
//! through two alternating header pages.
//!
//! ```no_run
//! use small_store::{Database, Options};
//!
//! let db = Database::open(Options::new().base_file("/tmp/example.store"))?;
//! let index = db.open_index(b"people")?;
//!
//! let txn = db.begin()?;
//! index.store(&txn, b"hello", b"world")?;
//! assert_eq!(index.load(&txn, b"hello")?.as_deref(), Some(&b"world"[..]));
//! txn.commit()?;
//! # Ok::<(), small_store::SmallError>(())
//! ```

mod config;
mod db;
mod error;
mod io;
mod latch;
mod storage;
mod types;
mod utils;
mod view;

mod btree;
mod transaction;
mod tx_log;

pub use btree::cursor::{Cursor, CursorValue};
pub use config::{DurabilityMode, LockUpgradeRule, Options, PrepareHandler};
pub use db::{Database, DatabaseStats, Index};
pub use error::{ErrorKind, SmallError};
pub use latch::Latch;
pub use transaction::lock_manager::{LockMode, LockResult};
pub use transaction::tx::Transaction;
pub use types::{IndexId, PageId, SmallResult};
pub use view::{PrefixCursor, PrefixView, ReverseCursor, ReverseView};

pub use btree::tree::{inline_threshold, max_key_length};
