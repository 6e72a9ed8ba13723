use std::sync::{Arc, RwLock};

use crate::error::SmallError;

// Type alias, not a new type, cannot define methods on it
pub type Pod<T> = Arc<RwLock<T>>;

pub type ResultPod<T> = Result<Pod<T>, SmallError>;
pub type SmallResult = Result<(), SmallError>;

/// 64-bit unsigned address of a fixed-size block in the backing store.
/// Ids 0 and 1 are the two alternating header pages; 0 doubles as the
/// "no page" sentinel in linked structures.
pub type PageId = u64;

pub const NO_PAGE: PageId = 0;

/// Internally-assigned id of a named B+ tree.
pub type IndexId = u64;

/// The logical entity holding a lock; usually a transaction id.
pub type OwnerId = u64;
