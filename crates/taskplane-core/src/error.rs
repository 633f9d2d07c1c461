//! The closed protocol error set.
//!
//! Every failure that crosses a subsystem boundary is one of these kinds.
//! Details (paths, offsets, peer addresses) are logged at the failure site
//! with `tracing`; the kind alone propagates, and the dispatcher folds it
//! into `success: false` on the user-visible reply.

use std::io;

/// Failure kinds shared by every subsystem.
///
/// The set is closed on purpose: handlers match on it exhaustively and the
/// dispatcher never has to guess how to fold an unknown error into a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// An inbound frame or message failed to parse.
    #[error("decoding failed")]
    DecodingFailed,

    /// An outbound message could not be serialised or stuffed.
    #[error("encoding failed")]
    EncodingFailed,

    /// The request was well-formed but semantically invalid.
    #[error("input error")]
    InputError,

    /// An I/O primitive (file, directory, socket, pipe, spawn) failed.
    #[error("reactor error")]
    ReactorError,

    /// Scratch memory was exhausted.
    #[error("memory allocation failed")]
    MemoryAllocationFailed,

    /// A task failed to run to completion.
    #[error("task error")]
    TaskError,

    /// A state invariant was violated.
    #[error("internal error")]
    InternalError,
}

impl From<io::Error> for ErrorKind {
    fn from(_: io::Error) -> Self {
        Self::ReactorError
    }
}

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, ErrorKind>;
