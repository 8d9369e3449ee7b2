use crate::rt::task::TaskCore;
use log::{error, trace};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

thread_local! {
    /// The dispatcher currently driving this thread, installed by [`run`] for its
    /// whole duration. All `rt` entry points resolve against this value, in the
    /// same way the thread-local trigger chain of classic cooperative-cancellation
    /// crates resolves the ambient cancellation criteria.
    static CURRENT_DISPATCHER: RefCell<Option<Rc<Dispatcher>>> = const { RefCell::new(None) };
}

/// A unit of work processed by the dispatcher, in strict FIFO order.
pub(crate) enum WorkItem {
    /// Poll the task with the given id.
    PollTask(u64),
    /// Run the one-shot callback with the given id.
    RunCallback(u64),
}

enum Next {
    Work(WorkItem),
    TimerDue,
    Stalled,
}

/// The shared FIFO work queue. This is the only piece of dispatcher state behind
/// a lock: task wakers are `Send` and may be invoked from a foreign thread, in
/// which case they still only push a task id here.
pub(crate) struct WorkQueue {
    items: Mutex<VecDeque<WorkItem>>,
    available: Condvar,
}

impl WorkQueue {
    fn new() -> Self {
        WorkQueue {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, item: WorkItem) {
        let mut items = self
            .items
            .lock()
            .expect("Invariant violation: dispatcher work queue poisoned.");
        items.push_back(item);
        self.available.notify_one();
    }

    /// Pop the next work item, parking the thread until `timer_deadline` when the
    /// queue is empty. Reports a stall when there is nothing to wait for.
    fn next(&self, timer_deadline: Option<Instant>) -> Next {
        let mut items = self
            .items
            .lock()
            .expect("Invariant violation: dispatcher work queue poisoned.");
        loop {
            if let Some(item) = items.pop_front() {
                return Next::Work(item);
            }
            let Some(deadline) = timer_deadline else {
                return Next::Stalled;
            };
            let now = Instant::now();
            if now >= deadline {
                return Next::TimerDue;
            }
            let (guard, _) = self
                .available
                .wait_timeout(items, deadline - now)
                .expect("Invariant violation: dispatcher work queue poisoned.");
            items = guard;
        }
    }
}

struct OneShot {
    callback: Box<dyn FnOnce()>,
    cancelled: Rc<Cell<bool>>,
}

/// The single-threaded cooperative dispatcher. One instance exists per [`run`]
/// call; it owns every task, one-shot callback and timer scheduled on it.
pub(crate) struct Dispatcher {
    queue: Arc<WorkQueue>,
    tasks: RefCell<HashMap<u64, Rc<TaskCore>>>,
    callbacks: RefCell<HashMap<u64, OneShot>>,
    /// Timers reference entries in `callbacks`. The `(Instant, id)` key makes
    /// simultaneous timers fire in registration order.
    timers: RefCell<BinaryHeap<Reverse<(Instant, u64)>>>,
    next_id: Cell<u64>,
}

impl Dispatcher {
    fn new() -> Self {
        Dispatcher {
            queue: Arc::new(WorkQueue::new()),
            tasks: RefCell::new(HashMap::new()),
            callbacks: RefCell::new(HashMap::new()),
            timers: RefCell::new(BinaryHeap::new()),
            next_id: Cell::new(0),
        }
    }

    pub(crate) fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub(crate) fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    pub(crate) fn insert_task(&self, task: Rc<TaskCore>) {
        let id = task.id();
        self.tasks.borrow_mut().insert(id, task);
        self.queue.push(WorkItem::PollTask(id));
    }

    pub(crate) fn schedule_soon(&self, callback: Box<dyn FnOnce()>) -> ScheduledHandle {
        let id = self.next_id();
        let cancelled = Rc::new(Cell::new(false));
        self.callbacks.borrow_mut().insert(
            id,
            OneShot {
                callback,
                cancelled: cancelled.clone(),
            },
        );
        self.queue.push(WorkItem::RunCallback(id));
        trace!("callback {id} scheduled for the next dispatch tick");
        ScheduledHandle { cancelled }
    }

    pub(crate) fn schedule_at(&self, deadline: Instant, callback: Box<dyn FnOnce()>) -> TimerHandle {
        let id = self.next_id();
        let cancelled = Rc::new(Cell::new(false));
        self.callbacks.borrow_mut().insert(
            id,
            OneShot {
                callback,
                cancelled: cancelled.clone(),
            },
        );
        self.timers.borrow_mut().push(Reverse((deadline, id)));
        trace!("timer {id} scheduled");
        TimerHandle { cancelled }
    }

    /// Process one unit of work, parking until the next timer when idle.
    fn turn(&self) {
        match self.queue.next(self.next_timer()) {
            Next::Work(WorkItem::PollTask(id)) => self.poll_task(id),
            Next::Work(WorkItem::RunCallback(id)) => self.run_callback(id),
            Next::TimerDue => self.fire_due_timers(),
            Next::Stalled => panic!(
                "dispatcher stalled: no runnable tasks, pending callbacks or timers, \
                 but the main task has not finished"
            ),
        }
    }

    fn next_timer(&self) -> Option<Instant> {
        self.timers.borrow().peek().map(|Reverse((at, _))| *at)
    }

    fn poll_task(&self, id: u64) {
        let task = self.tasks.borrow().get(&id).cloned();
        let Some(task) = task else {
            trace!("stale wake for finished task {id}; ignoring");
            return;
        };
        if TaskCore::poll(&task) {
            self.tasks.borrow_mut().remove(&id);
        }
    }

    fn run_callback(&self, id: u64) {
        let entry = self.callbacks.borrow_mut().remove(&id);
        let Some(entry) = entry else {
            return;
        };
        if entry.cancelled.get() {
            trace!("callback {id} was cancelled before it ran");
            return;
        }
        // A panicking callback must not take down the dispatcher or starve the
        // callbacks queued behind it.
        let callback = entry.callback;
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || callback())) {
            error!("dispatcher callback {id} panicked: {}", panic_message(&payload));
        }
    }

    fn fire_due_timers(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut timers = self.timers.borrow_mut();
                match timers.peek() {
                    Some(Reverse((at, _))) if *at <= now => {
                        let Reverse((_, id)) = timers
                            .pop()
                            .expect("Invariant violation: peeked timer disappeared.");
                        Some(id)
                    }
                    _ => None,
                }
            };
            match due {
                Some(id) => self.run_callback(id),
                None => break,
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "(non-string panic payload)"
    }
}

/// Resolve the dispatcher installed on this thread, panicking with a usage error
/// when called from outside [`run`].
pub(crate) fn with_dispatcher<R>(f: impl FnOnce(&Rc<Dispatcher>) -> R) -> R {
    CURRENT_DISPATCHER.with(|cell| {
        let dispatcher = cell.borrow();
        match dispatcher.as_ref() {
            Some(dispatcher) => f(dispatcher),
            None => panic!("no dispatcher is running on this thread; enter one with `rt::run`"),
        }
    })
}

struct InstallGuard;

impl InstallGuard {
    fn install(dispatcher: Rc<Dispatcher>) -> Self {
        CURRENT_DISPATCHER.with(|cell| {
            let mut slot = cell.borrow_mut();
            if slot.is_some() {
                panic!("`rt::run` cannot be nested on a single thread");
            }
            *slot = Some(dispatcher);
        });
        InstallGuard
    }
}

impl Drop for InstallGuard {
    fn drop(&mut self) {
        CURRENT_DISPATCHER.with(|cell| cell.borrow_mut().take());
    }
}

/// Drive `main` (and every task it spawns) to completion on the calling thread
/// and return its output.
///
/// The dispatcher processes task polls and one-shot callbacks in strict FIFO
/// order, interleaved with expired timers, and parks the thread while nothing is
/// runnable. It returns as soon as the main task finishes; tasks that are still
/// pending at that point are dropped.
///
/// # Panics
///
/// Panics when nested inside another `run` on the same thread, and when the main
/// task is unfinished but no task, callback or timer remains that could ever make
/// progress. Wake sources outside the dispatcher's own primitives must keep at
/// least one live timer around, otherwise the wait for them is reported as such a
/// stall.
pub fn run<TOutput, TMain>(main: TMain) -> TOutput
where
    TMain: Future<Output = TOutput> + 'static,
    TOutput: 'static,
{
    let dispatcher = Rc::new(Dispatcher::new());
    let _guard = InstallGuard::install(dispatcher.clone());

    let output = Rc::new(RefCell::new(None));
    let slot = output.clone();
    let main_task = TaskCore::new(
        dispatcher.next_id(),
        dispatcher.queue().clone(),
        Box::pin(async move {
            *slot.borrow_mut() = Some(main.await);
        }),
    );
    trace!("main task {} created; dispatcher running", main_task.id());
    dispatcher.insert_task(main_task.clone());

    while !main_task.is_finished() {
        dispatcher.turn();
    }
    trace!("main task {} finished; dispatcher shutting down", main_task.id());

    let value = output.borrow_mut().take();
    value.expect("Invariant violation: main task finished without producing a value.")
}

/// A handle to a callback scheduled with [`schedule_soon`]. The callback can be
/// cancelled up until the tick on which it runs; cancelling it later, or more
/// than once, has no effect.
#[derive(Clone)]
pub struct ScheduledHandle {
    cancelled: Rc<Cell<bool>>,
}

impl ScheduledHandle {
    /// Prevent the callback from running. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// True if [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// A handle to a timer started with [`schedule_at`]. Cancelling it prevents the
/// callback from firing; cancelling after expiry, or more than once, has no
/// effect.
#[derive(Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    /// Prevent the timer callback from firing. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    /// True if [`cancel`](Self::cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

/// Schedule a one-shot callback for the next dispatch tick.
///
/// The callback runs from the dispatcher, never synchronously inside this call,
/// and can be cancelled through the returned handle until it has run.
pub fn schedule_soon(callback: impl FnOnce() + 'static) -> ScheduledHandle {
    with_dispatcher(|dispatcher| dispatcher.schedule_soon(Box::new(callback)))
}

/// Schedule a one-shot callback to fire once `deadline` has passed.
///
/// Timers that share a deadline fire in the order they were scheduled. The
/// callback can be cancelled through the returned handle until it has fired.
pub fn schedule_at(deadline: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
    with_dispatcher(|dispatcher| dispatcher.schedule_at(deadline, Box::new(callback)))
}
