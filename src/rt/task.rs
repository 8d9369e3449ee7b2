use crate::rt::dispatcher::{WorkItem, WorkQueue, with_dispatcher};
use crate::{Cancellable, Cancelled};
use futures::future::LocalBoxFuture;
use futures::task::ArcWake;
use log::trace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

thread_local! {
    /// The task currently being polled by the dispatcher, if any.
    static CURRENT_TASK: RefCell<Option<Rc<TaskCore>>> = const { RefCell::new(None) };
}

/// Per-task dispatcher state.
///
/// The cancellation protocol lives here: `cancel_requests` counts outstanding
/// cancellation requests, and `interrupt_pending` marks a request that has been
/// made but not yet observed at a suspension point. The two are deliberately
/// independent. Balancing the counter with [`TaskHandle::uncancel_request`] does
/// *not* clear a pending delivery, so a request made synchronously from inside
/// the running task still strikes the next suspension point; safe cancellation
/// of the current task must go through a deferred dispatcher callback instead.
pub(crate) struct TaskCore {
    id: u64,
    queue: Arc<WorkQueue>,
    future: RefCell<Option<LocalBoxFuture<'static, ()>>>,
    finished: Cell<bool>,
    cancel_requests: Cell<u32>,
    interrupt_pending: Cell<bool>,
    join_wakers: RefCell<Vec<Waker>>,
    cached_waker: RefCell<Option<Waker>>,
}

struct TaskWaker {
    id: u64,
    queue: Arc<WorkQueue>,
}

impl ArcWake for TaskWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.queue.push(WorkItem::PollTask(arc_self.id));
    }
}

impl TaskCore {
    pub(crate) fn new(id: u64, queue: Arc<WorkQueue>, future: LocalBoxFuture<'static, ()>) -> Rc<Self> {
        Rc::new(TaskCore {
            id,
            queue,
            future: RefCell::new(Some(future)),
            finished: Cell::new(false),
            cancel_requests: Cell::new(0),
            interrupt_pending: Cell::new(false),
            join_wakers: RefCell::new(Vec::new()),
            cached_waker: RefCell::new(None),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.get()
    }

    fn waker(&self) -> Waker {
        let mut cached = self.cached_waker.borrow_mut();
        cached
            .get_or_insert_with(|| {
                futures::task::waker(Arc::new(TaskWaker {
                    id: self.id,
                    queue: self.queue.clone(),
                }))
            })
            .clone()
    }

    /// Poll the task's future once. Returns true when the task has finished.
    pub(crate) fn poll(task: &Rc<TaskCore>) -> bool {
        if task.finished.get() {
            return true;
        }
        let Some(mut future) = task.future.borrow_mut().take() else {
            // The future is out: a duplicate wake landed while the task was
            // already on the queue. Harmless.
            return false;
        };
        let waker = task.waker();
        let mut context = Context::from_waker(&waker);
        let _guard = CurrentTaskGuard::enter(task.clone());
        match future.as_mut().poll(&mut context) {
            Poll::Ready(()) => {
                task.finished.set(true);
                trace!("task {} finished", task.id);
                for waker in task.join_wakers.borrow_mut().drain(..) {
                    waker.wake();
                }
                true
            }
            Poll::Pending => {
                *task.future.borrow_mut() = Some(future);
                false
            }
        }
    }

    /// Consume a pending interrupt, if one has been requested. Called by every
    /// runtime suspension point before anything else.
    pub(crate) fn take_interrupt(&self) -> bool {
        if self.interrupt_pending.get() {
            self.interrupt_pending.set(false);
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_interrupt(&self) {
        self.interrupt_pending.set(false);
    }

    fn register_join_waker(&self, waker: &Waker) {
        let mut wakers = self.join_wakers.borrow_mut();
        if !wakers.iter().any(|known| known.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

struct CurrentTaskGuard {
    previous: Option<Rc<TaskCore>>,
}

impl CurrentTaskGuard {
    fn enter(task: Rc<TaskCore>) -> Self {
        let previous = CURRENT_TASK.with(|cell| cell.borrow_mut().replace(task));
        CurrentTaskGuard { previous }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        CURRENT_TASK.with(|cell| *cell.borrow_mut() = self.previous.take());
    }
}

/// A cloneable reference to a task running on the dispatcher, exposing the
/// cancellation-request protocol consumed by [`crate::Scope`].
#[derive(Clone)]
pub struct TaskHandle {
    pub(crate) core: Rc<TaskCore>,
}

impl TaskHandle {
    /// A dispatcher-unique identity for the task.
    pub fn id(&self) -> u64 {
        self.core.id()
    }

    /// True once the task's future has completed.
    pub fn is_finished(&self) -> bool {
        self.core.is_finished()
    }

    /// Request cancellation of the task: increment the request counter, mark an
    /// interrupt as pending, and wake the task so that its next suspension point
    /// observes the request. Requests against a finished task are ignored.
    pub fn cancel_request(&self) {
        if self.core.is_finished() {
            trace!("cancel request for finished task {} ignored", self.id());
            return;
        }
        let requests = self.core.cancel_requests.get() + 1;
        self.core.cancel_requests.set(requests);
        self.core.interrupt_pending.set(true);
        trace!("task {} cancel requested (outstanding: {requests})", self.id());
        self.core.queue.push(WorkItem::PollTask(self.id()));
    }

    /// Withdraw one cancellation request and return the new outstanding count.
    ///
    /// This only balances the counter; a pending, not yet observed interrupt is
    /// left in place (see [`crate::rt`] module docs for why callers that own the
    /// request must clear up after themselves via scope resolution).
    ///
    /// # Panics
    ///
    /// Panics if there is no outstanding request to withdraw.
    pub fn uncancel_request(&self) -> u32 {
        let requests = self.core.cancel_requests.get();
        if requests == 0 {
            panic!("Invariant violation: cancellation request counter underflow.");
        }
        let requests = requests - 1;
        self.core.cancel_requests.set(requests);
        trace!("task {} cancel request withdrawn (outstanding: {requests})", self.id());
        requests
    }

    /// The number of outstanding cancellation requests against this task.
    pub fn cancel_requests(&self) -> u32 {
        self.core.cancel_requests.get()
    }

    /// Drop a pending, not yet observed interrupt without touching the counter.
    pub(crate) fn clear_interrupt(&self) {
        self.core.clear_interrupt();
    }

    pub(crate) fn wait_finished(&self) -> WaitFinished {
        WaitFinished {
            task: self.core.clone(),
        }
    }
}

/// The handle of the task that is currently being polled.
///
/// # Panics
///
/// Panics when called from outside a task (including from plain dispatcher
/// callbacks, which run on the dispatcher but on behalf of no task).
pub fn current_task() -> TaskHandle {
    CURRENT_TASK.with(|cell| match cell.borrow().as_ref() {
        Some(core) => TaskHandle { core: core.clone() },
        None => panic!("`rt::current_task` must be invoked from within a task"),
    })
}

/// Consume a pending interrupt of the currently polled task. False when no task
/// is current, so interrupt-aware futures degrade gracefully outside the
/// dispatcher.
pub(crate) fn take_current_interrupt() -> bool {
    CURRENT_TASK.with(|cell| {
        cell.borrow()
            .as_ref()
            .map(|core| core.take_interrupt())
            .unwrap_or(false)
    })
}

/// Spawn a new task on the current dispatcher.
///
/// The task starts running at the next dispatch tick. Dropping the returned
/// [`JoinHandle`] detaches the task; it keeps running until it finishes or the
/// dispatcher shuts down.
pub fn spawn<TOutput, TFuture>(future: TFuture) -> JoinHandle<TOutput>
where
    TFuture: Future<Output = Cancellable<TOutput>> + 'static,
    TOutput: 'static,
{
    let slot = Rc::new(RefCell::new(None));
    let result = slot.clone();
    let task = with_dispatcher(|dispatcher| {
        let task = TaskCore::new(
            dispatcher.next_id(),
            dispatcher.queue().clone(),
            Box::pin(async move {
                *result.borrow_mut() = Some(future.await);
            }),
        );
        trace!("task {} spawned", task.id());
        dispatcher.insert_task(task.clone());
        task
    });
    JoinHandle { task, slot }
}

/// Owner side of a spawned task: await its result with [`join`](Self::join), or
/// reach the task itself through [`handle`](Self::handle).
pub struct JoinHandle<TOutput> {
    task: Rc<TaskCore>,
    slot: Rc<RefCell<Option<Cancellable<TOutput>>>>,
}

impl<TOutput> JoinHandle<TOutput> {
    /// A [`TaskHandle`] for the spawned task.
    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            core: self.task.clone(),
        }
    }

    /// True once the spawned task has completed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the spawned task and return its result.
    ///
    /// Joining is itself a suspension point: when the *calling* task receives a
    /// cancellation request while waiting, `join` resolves to `Err(Cancelled)`
    /// and the spawned task keeps running detached.
    pub async fn join(self) -> Cancellable<TOutput> {
        WaitFinished { task: self.task }.await?;
        let result = self.slot.borrow_mut().take();
        result.expect("Invariant violation: joined task produced no result.")
    }
}

/// Future that waits for a task to finish, observing interrupts of the waiting
/// task.
pub(crate) struct WaitFinished {
    task: Rc<TaskCore>,
}

impl Future for WaitFinished {
    type Output = Cancellable<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if take_current_interrupt() {
            return Poll::Ready(Err(Cancelled));
        }
        if self.task.is_finished() {
            return Poll::Ready(Ok(()));
        }
        self.task.register_join_waker(cx.waker());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use crate::rt;
    use crate::{Cancellable, Cancelled};
    use std::time::Duration;

    #[test]
    fn spawned_task_result_is_joined() {
        let value = rt::run(async {
            let handle = rt::spawn(async { Ok(21) });
            handle.join().await.map(|v| v * 2)
        });
        assert_eq!(value, Ok(42));
    }

    #[test]
    fn counter_and_interrupt_are_independent() {
        rt::run(async {
            let task = rt::current_task();
            assert_eq!(task.cancel_requests(), 0);

            // A request made synchronously from inside the task leaves a pending
            // interrupt behind even after the counter has been balanced. This is
            // the hazard that scope resolution exists to contain.
            task.cancel_request();
            assert_eq!(task.cancel_requests(), 1);
            assert_eq!(task.uncancel_request(), 0);

            let outcome = rt::sleep(Duration::from_millis(1)).await;
            assert_eq!(outcome, Err(Cancelled));

            // The interrupt was consumed; later suspensions are clean.
            let outcome = rt::sleep(Duration::from_millis(1)).await;
            assert_eq!(outcome, Ok(()));
        });
    }

    #[test]
    fn cancel_request_interrupts_a_sleeping_task() {
        let outcome: Cancellable<()> = rt::run(async {
            let handle = rt::spawn(async {
                rt::sleep(Duration::from_secs(600)).await?;
                Ok(())
            });
            let task = handle.handle();
            rt::yield_now().await?;
            task.cancel_request();
            handle.join().await
        });
        assert_eq!(outcome, Err(Cancelled));
    }

    #[test]
    fn join_observes_interrupts_of_the_waiting_task() {
        rt::run(async {
            let child = rt::spawn(async {
                rt::sleep(Duration::from_secs(600)).await?;
                Ok(())
            });
            let me = rt::current_task();
            rt::schedule_soon(move || me.cancel_request());
            let joined = child.join().await;
            assert_eq!(joined, Err(Cancelled));
            Ok::<(), Cancelled>(())
        })
        .unwrap();
    }

    #[test]
    #[should_panic(expected = "must be invoked from within a task")]
    fn current_task_outside_a_task_is_a_usage_error() {
        let _ = rt::current_task();
    }

    #[test]
    #[should_panic(expected = "counter underflow")]
    fn uncancel_below_zero_is_a_bug() {
        rt::run(async {
            let task = rt::current_task();
            let _ = task.uncancel_request();
        });
    }
}
