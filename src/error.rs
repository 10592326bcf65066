//! Engine error types.
//!
//! Every fallible operation in the crate returns [`BltResult`]. The kinds
//! mirror what callers actually branch on: a failed descent surfaces as
//! [`BltError::Struct`], a split that could not obtain a page as
//! [`BltError::Overflow`], and host failures keep their original kind.
//! There is no retry machinery; latch contention blocks, everything else
//! bubbles up.

use thiserror::Error;

/// Result type for all engine operations.
pub type BltResult<T> = Result<T, BltError>;

/// Errors produced by the engine core and its host seam.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BltError {
    /// An invariant was violated during traversal, e.g. the descent fell off
    /// the right sibling chain or reached a page marked free. Fatal to the
    /// calling operation; the tree itself is not corrupted.
    #[error("tree structure violation: {0}")]
    Struct(&'static str),

    /// A split failed to obtain a new page from the host.
    #[error("page allocation overflow")]
    Overflow,

    /// The host reported a failure while a page was being read in.
    #[error("page read failed: {0}")]
    Read(&'static str),

    /// The host reported a failure while a page was being written out.
    #[error("page write failed: {0}")]
    Write(&'static str),

    /// The host violated its contract: unknown page id, allocation refusal,
    /// or an unpin of a page it never handed out.
    #[error("host contract violation: {0}")]
    Host(&'static str),

    /// Invalid open parameters or malformed user input (key length, reserved
    /// key bytes, page-size mismatch on reopen).
    #[error("invalid configuration: {0}")]
    Config(String),
}
