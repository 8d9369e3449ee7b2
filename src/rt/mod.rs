//! A minimal single-threaded cooperative dispatcher: the host runtime that
//! [`crate::Scope`] runs against.
//!
//! The dispatcher owns three kinds of work, processed on one thread in strict
//! FIFO order: task polls, one-shot callbacks ([`schedule_soon`]) and timers
//! ([`schedule_at`]). Everything a [`crate::Scope`] consumes is here:
//!
//! * a *current task* ([`current_task`]) carrying an integer
//!   cancellation-request counter ([`TaskHandle::cancel_request`] /
//!   [`TaskHandle::uncancel_request`] / [`TaskHandle::cancel_requests`]);
//! * deferred one-shot callbacks that can be cancelled before they run;
//! * a distinguished cancellation signal, the [`crate::Cancelled`] error, which
//!   runtime suspension points ([`sleep`], [`yield_now`], [`pending`],
//!   [`Event::wait`], [`JoinHandle::join`]) resolve to when a cancellation
//!   request is pending on the task. Foreign futures are covered by the
//!   [`interruptible`] adapter.
//!
//! ## The cancellation-request protocol
//!
//! [`TaskHandle::cancel_request`] increments the task's request counter *and*
//! marks an interrupt for delivery at the task's next suspension point.
//! [`TaskHandle::uncancel_request`] decrements the counter but leaves a pending
//! delivery in place. A request made synchronously from inside the running task
//! therefore strikes the next suspension point even after the counter has been
//! balanced, which is exactly why [`crate::Scope`] defers its own requests
//! through [`schedule_soon`] and rescinds them when they were never delivered.
//!
//! Structured constructs on top of the primitives: [`TaskGroup`] for joining
//! and tearing down sets of tasks together, and [`timeout`] as the native
//! single-deadline scope.

mod dispatcher;
mod event;
mod futures;
mod group;
mod task;
mod timeout;

pub use dispatcher::{ScheduledHandle, TimerHandle, run, schedule_at, schedule_soon};
pub use event::{Event, EventWait};
pub use futures::{Interruptible, Pending, Sleep, YieldNow, interruptible, pending, sleep, yield_now};
pub use group::TaskGroup;
pub use task::{JoinHandle, TaskHandle, current_task, spawn};
pub use timeout::{Elapsed, timeout};
