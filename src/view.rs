//! View adapters: ordered projections layered over an index by
//! composition. A view holds the underlying index and maps keys and
//! positions through pure functions; nothing here owns storage.

use crate::btree::cursor::{Cursor, CursorValue};
use crate::db::Index;
use crate::error::{ErrorKind, SmallError};
use crate::transaction::tx::Transaction;
use crate::types::SmallResult;
use crate::utils::display_key;

/// The underlying index in reverse order: `first` is the largest key
/// and `next` walks downward.
#[derive(Clone)]
pub struct ReverseView {
    index: Index,
}

impl ReverseView {
    pub fn new(index: Index) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn load(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        self.index.load(txn, key)
    }

    pub fn store(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> SmallResult {
        self.index.store(txn, key, value)
    }

    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> SmallResult {
        self.index.delete(txn, key)
    }

    pub fn cursor<'t>(&self, txn: &'t Transaction) -> ReverseCursor<'t> {
        ReverseCursor {
            inner: self.index.cursor(txn),
        }
    }
}

/// A cursor over a [`ReverseView`]: every direction swaps.
pub struct ReverseCursor<'t> {
    inner: Cursor<'t>,
}

impl<'t> ReverseCursor<'t> {
    pub fn key(&self) -> Option<&[u8]> {
        self.inner.key()
    }

    pub fn value(&self) -> &CursorValue {
        self.inner.value()
    }

    pub fn first(&mut self) -> SmallResult {
        self.inner.last()
    }

    pub fn last(&mut self) -> SmallResult {
        self.inner.first()
    }

    pub fn next(&mut self) -> SmallResult {
        self.inner.previous()
    }

    pub fn previous(&mut self) -> SmallResult {
        self.inner.next()
    }

    pub fn find(&mut self, key: &[u8]) -> SmallResult {
        self.inner.find(key)
    }

    pub fn skip(&mut self, n: i64) -> SmallResult {
        self.inner.skip(-n)
    }

    pub fn reset(&mut self) {
        self.inner.reset()
    }
}

/// Only the keys carrying `prefix`. Stores outside the prefix are
/// rejected with a view-constraint error; iteration is clamped to the
/// prefix range.
#[derive(Clone)]
pub struct PrefixView {
    index: Index,
    prefix: Vec<u8>,
}

impl PrefixView {
    pub fn new(index: Index, prefix: &[u8]) -> Self {
        Self {
            index,
            prefix: prefix.to_vec(),
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn prefix(&self) -> &[u8] {
        &self.prefix
    }

    fn check(&self, key: &[u8]) -> SmallResult {
        if !key.starts_with(&self.prefix) {
            return Err(SmallError::new(
                ErrorKind::ViewConstraint,
                &format!(
                    "key {} is outside the view prefix {}",
                    display_key(key),
                    display_key(&self.prefix)
                ),
            ));
        }
        Ok(())
    }

    pub fn load(&self, txn: &Transaction, key: &[u8]) -> Result<Option<Vec<u8>>, SmallError> {
        self.check(key)?;
        self.index.load(txn, key)
    }

    pub fn store(&self, txn: &Transaction, key: &[u8], value: &[u8]) -> SmallResult {
        self.check(key)?;
        self.index.store(txn, key, value)
    }

    pub fn delete(&self, txn: &Transaction, key: &[u8]) -> SmallResult {
        self.check(key)?;
        self.index.delete(txn, key)
    }

    pub fn cursor<'t>(&self, txn: &'t Transaction) -> PrefixCursor<'t> {
        PrefixCursor {
            inner: self.index.cursor(txn),
            prefix: self.prefix.clone(),
        }
    }
}

pub struct PrefixCursor<'t> {
    inner: Cursor<'t>,
    prefix: Vec<u8>,
}

impl<'t> PrefixCursor<'t> {
    pub fn key(&self) -> Option<&[u8]> {
        self.inner.key()
    }

    pub fn value(&self) -> &CursorValue {
        self.inner.value()
    }

    fn clamp(&mut self) -> SmallResult {
        if let Some(key) = self.inner.key() {
            if !key.starts_with(&self.prefix) {
                self.inner.reset();
            }
        }
        Ok(())
    }

    pub fn first(&mut self) -> SmallResult {
        let prefix = self.prefix.clone();
        self.inner.find_ge(&prefix)?;
        self.clamp()
    }

    pub fn next(&mut self) -> SmallResult {
        self.inner.next()?;
        self.clamp()
    }

    pub fn find(&mut self, key: &[u8]) -> SmallResult {
        if !key.starts_with(&self.prefix) {
            return Err(SmallError::new(
                ErrorKind::ViewConstraint,
                &format!("key {} is outside the view prefix", display_key(key)),
            ));
        }
        self.inner.find(key)
    }

    pub fn reset(&mut self) {
        self.inner.reset()
    }
}
