//! Error surface shared by every primitive in the crate

use thiserror::Error;

/// Why a wait or a queued work unit failed.
///
/// The variants form a closed set; callers are expected to pattern-match.
/// Cancellation is a value, not an unwound exception: both external
/// cancellation (a [`CancellationToken`](crate::CancellationToken) firing)
/// and deadline expiry fail the caller's future without disturbing the
/// primitive's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// The primitive was closed before, or while, the caller was waiting.
    #[error("primitive has been closed")]
    Closed,
    /// A caller-supplied cancellation fired before a grant.
    #[error("wait was cancelled")]
    Cancelled,
    /// The deadline expired before a grant; a timed-out wait is a cancelled
    /// wait with the deadline as the cause.
    #[error("wait timed out")]
    TimedOut,
    /// A user-supplied work unit or callback panicked.
    #[error("queued work panicked")]
    Faulted,
}
