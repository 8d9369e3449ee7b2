use std::fmt::{Display, Formatter};

/// The distinguished error value used by the [`crate::rt`] dispatcher to signal a
/// cancellation request at a suspension point.
///
/// `Cancelled` deliberately carries no payload. The *reason* for a cancellation is
/// reported as data on the [`crate::Scope`] that requested it (see
/// [`crate::CancelReason`]), never inside the error itself: task groups and other
/// structured-concurrency constructs dispatch on this exact type, and a richer
/// error would be misclassified by them.
///
/// Runtime suspension points ([`crate::rt::sleep`], [`crate::rt::Event::wait`],
/// [`crate::rt::pending`], ...) resolve to `Err(Cancelled)` when a cancellation
/// request is pending on the current task, so a cancellable body propagates it
/// with `?`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Cancelled;

/// A result of a cancellable operation.
pub type Cancellable<TResult> = Result<TResult, Cancelled>;

impl Display for Cancelled {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "task cancelled")
    }
}

impl std::error::Error for Cancelled {}
