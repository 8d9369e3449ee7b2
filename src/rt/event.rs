use crate::rt::task::take_current_interrupt;
use crate::{Cancellable, Cancelled};
use log::{error, trace};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A one-shot signal: starts unset, can be set exactly once, and stays set.
///
/// Tasks block on it with [`wait`](Self::wait); [`crate::EventTrigger`] attaches
/// to its internal notification list, so observing the signal never costs an
/// extra task. Events are shared through `Rc` and are bound to the thread of
/// the dispatcher that uses them.
///
/// ```rust
/// use cancel_scope::rt;
/// use std::time::Duration;
///
/// rt::run(async {
///     let event = rt::Event::new_rc();
///     let setter = event.clone();
///     rt::spawn(async move {
///         rt::sleep(Duration::from_millis(5)).await?;
///         setter.set();
///         Ok(())
///     });
///     event.wait().await.unwrap();
///     assert!(event.is_set());
/// });
/// ```
#[derive(Default)]
pub struct Event {
    set: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
    subscribers: RefCell<Vec<(u64, Box<dyn FnOnce()>)>>,
    next_subscription: Cell<u64>,
}

impl Event {
    /// Create a new, unset event.
    pub fn new() -> Self {
        Event::default()
    }

    /// Create a new, unset event behind an `Rc`, ready for sharing.
    pub fn new_rc() -> Rc<Self> {
        Rc::new(Event::new())
    }

    /// True once [`set`](Self::set) has been called.
    pub fn is_set(&self) -> bool {
        self.set.get()
    }

    /// Set the event, waking every waiting task and notifying every subscriber
    /// in registration order. Setting an already-set event has no effect.
    pub fn set(&self) {
        if self.set.get() {
            trace!("`Event[{:p}]` already set.", self);
            return;
        }
        self.set.set(true);
        trace!("`Event[{:p}]` set.", self);
        for waker in self.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
        let subscribers = std::mem::take(&mut *self.subscribers.borrow_mut());
        for (id, callback) in subscribers {
            // One misbehaving subscriber must not silence the ones behind it.
            if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback())) {
                error!(
                    "`Event[{:p}]` subscriber {id} panicked: {}",
                    self,
                    crate::rt::dispatcher::panic_message(&payload)
                );
            }
        }
    }

    /// Suspend the current task until the event is set.
    pub fn wait(&self) -> EventWait<'_> {
        EventWait { event: self }
    }

    /// Attach a one-shot callback to the notification list. Runs from [`set`],
    /// on the dispatcher thread, in registration order. Subscribing to an
    /// already-set event registers nothing, since the notification round has
    /// already been dispatched; callers check [`is_set`](Self::is_set) first.
    pub(crate) fn subscribe(&self, callback: Box<dyn FnOnce()>) -> u64 {
        let id = self.next_subscription.get();
        self.next_subscription.set(id + 1);
        if self.set.get() {
            trace!("`Event[{:p}]` already set; subscription {id} not registered.", self);
            return id;
        }
        self.subscribers.borrow_mut().push((id, callback));
        id
    }

    /// Remove a subscription. Safe to call after the event has been set (the
    /// subscription is gone by then) and more than once.
    pub(crate) fn unsubscribe(&self, subscription: u64) {
        self.subscribers
            .borrow_mut()
            .retain(|(id, _)| *id != subscription);
    }
}

/// Future returned by [`Event::wait`].
pub struct EventWait<'a> {
    event: &'a Event,
}

impl Future for EventWait<'_> {
    type Output = Cancellable<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if take_current_interrupt() {
            return Poll::Ready(Err(Cancelled));
        }
        if self.event.is_set() {
            return Poll::Ready(Ok(()));
        }
        let mut wakers = self.event.wakers.borrow_mut();
        if !wakers.iter().any(|known| known.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}
