use std::{error::Error, fmt};

use backtrace::Backtrace;

/// Classification of engine errors. Most kinds are reported to the caller
/// and leave the transaction usable; `CorruptStore` and unhandled `Io`
/// during a checkpoint close the whole engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A lock could not be acquired within the configured timeout. The
    /// transaction state is preserved.
    LockTimeout,

    /// A lock wait would close a cycle in the wait-for graph. The current
    /// statement is aborted; the transaction remains open.
    Deadlock,

    /// A shared-to-upgradable lock upgrade was denied by the configured
    /// upgrade rule.
    IllegalUpgrade,

    /// An operation requiring a cursor position was invoked against an
    /// unpositioned cursor.
    UnpositionedCursor,

    /// A store was rejected by a derived view (e.g. key outside the view's
    /// prefix).
    ViewConstraint,

    /// A value length exceeds the fragmented-value addressable range.
    LargeValue,

    /// A page id out of range, a checksum mismatch, or a header
    /// inconsistency. Fatal: the engine closes itself.
    CorruptStore,

    /// Propagated I/O failure.
    Io,

    /// The engine has been closed; reopen to recover.
    Closed,

    /// Everything else (bad configuration, misuse of the API).
    Other,
}

/// The error type used throughout the engine.
///
/// Carries a backtrace captured at construction time; call
/// `show_backtrace()` to dump it through the logger when chasing a
/// hard-to-reproduce failure.
#[derive(Debug)]
pub struct SmallError {
    kind: ErrorKind,
    details: String,
    backtrace: Backtrace,
}

impl SmallError {
    pub fn new(kind: ErrorKind, msg: &str) -> SmallError {
        SmallError {
            kind,
            details: msg.to_string(),
            backtrace: Backtrace::new_unresolved(),
        }
    }

    pub fn corrupt(msg: &str) -> SmallError {
        Self::new(ErrorKind::CorruptStore, msg)
    }

    pub fn get_kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn get_details(&self) -> &str {
        &self.details
    }

    pub fn show_backtrace(&self) {
        let mut backtrace = self.backtrace.clone();
        backtrace.resolve();
        log::error!("{}\nbacktrace:\n{:?}", self, backtrace);
    }
}

impl fmt::Display for SmallError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.details)
    }
}

impl Error for SmallError {}

impl From<std::io::Error> for SmallError {
    fn from(e: std::io::Error) -> Self {
        SmallError::new(ErrorKind::Io, &e.to_string())
    }
}
