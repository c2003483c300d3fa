//! Error types for cancellable semaphore acquisition

use thiserror::Error;

/// Reason a cancellable acquire returned without claiming a slot
///
/// Carried by the cancellation token future passed to
/// [`Semaphore::acquire_or_cancel`](crate::Semaphore::acquire_or_cancel) and
/// handed back verbatim when the token fires before a slot is claimed.
/// Cancellation is routine control flow for callers, not a system failure:
/// the semaphore state is left completely unchanged.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    /// The deadline carried by the cancellation token elapsed while waiting
    #[error("semaphore acquire aborted: deadline exceeded")]
    DeadlineExceeded,

    /// The cancellation token was triggered explicitly while waiting
    #[error("semaphore acquire aborted: cancelled")]
    Cancelled,
}
