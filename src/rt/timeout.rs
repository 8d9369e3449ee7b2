use crate::rt::dispatcher::schedule_at;
use crate::rt::task::current_task;
use crate::Cancellable;
use log::trace;
use std::cell::Cell;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// The deadline of a [`timeout`] elapsed before its body finished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Elapsed;

impl Display for Elapsed {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "deadline elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// The dispatcher's native single-deadline scope: run `body` with a time budget
/// of `duration`.
///
/// Returns `Ok(Ok(value))` when the body finishes in time, `Ok(Err(Elapsed))`
/// when the deadline interrupted it, and `Err(Cancelled)` when a cancellation
/// request from elsewhere reached the task, meaning the request belongs to an
/// outer owner and is never swallowed here.
///
/// This is the lightweight sibling of [`crate::Scope`]: one fixed trigger, no
/// reason reporting. The timer callback runs from the dispatcher, never from
/// inside the task, so it may request cancellation directly without the deferred
/// hand-off a [`crate::Scope`] needs for its pre-triggered entry path.
///
/// ```rust
/// use cancel_scope::rt::{self, Elapsed};
/// use std::time::Duration;
///
/// let outcome = rt::run(async {
///     rt::timeout(Duration::from_millis(10), async {
///         rt::sleep(Duration::from_secs(600)).await?;
///         Ok(())
///     })
///     .await
/// });
/// assert_eq!(outcome, Ok(Err(Elapsed)));
/// ```
pub async fn timeout<TOutput, TBody>(
    duration: Duration,
    body: TBody,
) -> Cancellable<Result<TOutput, Elapsed>>
where
    TBody: Future<Output = Cancellable<TOutput>>,
{
    let task = current_task();
    let baseline = task.cancel_requests();
    let fired = Rc::new(Cell::new(false));
    let timer = {
        let fired = fired.clone();
        let task = task.clone();
        schedule_at(Instant::now() + duration, move || {
            trace!("timeout deadline elapsed; requesting cancellation of task {}", task.id());
            fired.set(true);
            task.cancel_request();
        })
    };

    let result = body.await;
    timer.cancel();

    match result {
        Ok(value) => {
            if fired.get() && task.uncancel_request() <= baseline {
                // The body won the race against our own delivery; reclaim the
                // request so it cannot strike a later suspension point.
                task.clear_interrupt();
            }
            Ok(Ok(value))
        }
        Err(cancelled) => {
            if fired.get() {
                let outstanding = task.uncancel_request();
                if outstanding <= baseline {
                    task.clear_interrupt();
                    return Ok(Err(Elapsed));
                }
            }
            Err(cancelled)
        }
    }
}
