use crate::rt::dispatcher::{TimerHandle, schedule_at};
use crate::rt::task::take_current_interrupt;
use crate::{Cancellable, Cancelled};
use futures::future::FusedFuture;
use pin_project::pin_project;
use std::any::type_name;
use std::cell::RefCell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Suspend the current task until `duration` has elapsed.
///
/// Resolves to `Err(Cancelled)` instead when a cancellation request reaches the
/// task first.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        deadline: Instant::now() + duration,
        timer: None,
        waker_slot: Rc::new(RefCell::new(None)),
    }
}

/// Future returned by [`sleep`].
pub struct Sleep {
    deadline: Instant,
    timer: Option<TimerHandle>,
    waker_slot: Rc<RefCell<Option<Waker>>>,
}

impl Future for Sleep {
    type Output = Cancellable<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if take_current_interrupt() {
            if let Some(timer) = this.timer.take() {
                timer.cancel();
            }
            return Poll::Ready(Err(Cancelled));
        }
        if Instant::now() >= this.deadline {
            if let Some(timer) = this.timer.take() {
                timer.cancel();
            }
            return Poll::Ready(Ok(()));
        }
        *this.waker_slot.borrow_mut() = Some(cx.waker().clone());
        if this.timer.is_none() {
            let slot = this.waker_slot.clone();
            this.timer = Some(schedule_at(this.deadline, move || {
                if let Some(waker) = slot.borrow_mut().take() {
                    waker.wake();
                }
            }));
        }
        Poll::Pending
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}

/// Yield to the dispatcher once, giving queued callbacks and sibling tasks a
/// chance to run.
///
/// Like every runtime suspension point, this observes pending cancellation
/// requests and resolves to `Err(Cancelled)` when one has arrived.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Future returned by [`yield_now`].
pub struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = Cancellable<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if take_current_interrupt() {
            return Poll::Ready(Err(Cancelled));
        }
        let this = self.get_mut();
        if this.yielded {
            Poll::Ready(Ok(()))
        } else {
            this.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

/// A future that never completes on its own; it resolves only when the task
/// receives a cancellation request.
pub fn pending<TOutput>() -> Pending<TOutput> {
    Pending {
        _output: PhantomData,
    }
}

/// Future returned by [`pending`].
pub struct Pending<TOutput> {
    _output: PhantomData<TOutput>,
}

impl<TOutput> Future for Pending<TOutput> {
    type Output = Cancellable<TOutput>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        // No waker registration is needed: a cancellation request wakes the
        // task directly.
        if take_current_interrupt() {
            Poll::Ready(Err(Cancelled))
        } else {
            Poll::Pending
        }
    }
}

/// Wrap an arbitrary future so that its suspension points observe cancellation
/// requests of the current task.
///
/// The wrapped future does not need to cooperate in any way; every poll first
/// consumes a pending interrupt, and only then polls the inner future. Outside a
/// dispatcher the adapter is transparent. The inner future is dropped as soon as
/// the adapter resolves, whether interrupted or completed.
///
/// ```rust
/// use cancel_scope::{Cancellable, Cancelled, rt};
///
/// let outcome: Cancellable<u32> = rt::run(async {
///     let me = rt::current_task();
///     rt::schedule_soon(move || me.cancel_request());
///     // A foreign future with no knowledge of this crate.
///     rt::interruptible(std::future::pending::<u32>()).await
/// });
/// assert_eq!(outcome, Err(Cancelled));
/// ```
pub fn interruptible<TFuture: Future>(future: TFuture) -> Interruptible<TFuture> {
    Interruptible::Waiting { future }
}

/// Future returned by [`interruptible`].
#[pin_project(project = InterruptibleProjection)]
pub enum Interruptible<TFuture> {
    /// The inner future has not resolved yet.
    Waiting {
        #[pin]
        future: TFuture,
    },
    /// The adapter has resolved; the inner future is gone.
    Terminated,
}

impl<TFuture: Future> Future for Interruptible<TFuture> {
    type Output = Cancellable<TFuture::Output>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match self.as_mut().project() {
            InterruptibleProjection::Waiting { future } => {
                if take_current_interrupt() {
                    Poll::Ready(Err(Cancelled))
                } else {
                    future.poll(cx).map(Ok)
                }
            }
            InterruptibleProjection::Terminated => {
                panic!("{}::poll() called after completion", type_name::<Self>())
            }
        };
        // Fuse: drop the inner future as soon as the adapter resolves.
        if result.is_ready() {
            self.set(Interruptible::Terminated);
        }
        result
    }
}

impl<TFuture: Future> FusedFuture for Interruptible<TFuture> {
    fn is_terminated(&self) -> bool {
        matches!(self, Interruptible::Terminated)
    }
}
