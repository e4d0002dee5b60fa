//! The error record kept by the byte-counting wrappers.

use std::io;
use std::sync::OnceLock;

/// The first terminal I/O error observed by a wrapper.
///
/// The original [`io::Error`] is handed back to the caller untouched, so the
/// wrapper keeps its kind and message instead.
#[derive(Clone, Debug, PartialEq, Eq, derive_more::Display)]
#[display(fmt = "{}", message)]
pub struct CapturedError {
    kind: io::ErrorKind,
    message: String,
}

impl CapturedError {
    pub fn kind(&self) -> io::ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stores `error` in `slot` unless the slot already holds one.
    ///
    /// Interruptions are retried by readers and writers alike and never end a
    /// stream, so they are not recorded.
    pub(crate) fn record_first(slot: &OnceLock<CapturedError>, error: &io::Error) {
        if error.kind() == io::ErrorKind::Interrupted {
            return;
        }
        let _ = slot.set(CapturedError::from(error));
    }
}

impl From<&io::Error> for CapturedError {
    fn from(error: &io::Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
