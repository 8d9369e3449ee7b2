use crate::rt::task::{JoinHandle, TaskHandle, spawn};
use crate::{Cancellable, Cancelled};
use log::trace;
use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;

struct Child {
    handle: TaskHandle,
    /// Set by the child wrapper when the child's future resolved to
    /// `Err(Cancelled)`.
    interrupted: Rc<Cell<bool>>,
}

/// Structured spawning: a set of child tasks that are joined together and torn
/// down together.
///
/// [`join`](Self::join) waits for every child. When one child ends interrupted,
/// the remaining siblings are cancelled; when the *joining* task itself receives
/// a cancellation request, all children are cancelled and the request is
/// propagated once the children have wound down. Dropping the group cancels any
/// child that is still running.
///
/// ```rust
/// use cancel_scope::rt;
/// use std::time::Duration;
///
/// let outcome = rt::run(async {
///     let mut group = rt::TaskGroup::new();
///     group.spawn(async {
///         rt::sleep(Duration::from_millis(2)).await?;
///         Ok(())
///     });
///     group.spawn(async {
///         rt::sleep(Duration::from_millis(4)).await?;
///         Ok(())
///     });
///     group.join().await
/// });
/// assert_eq!(outcome, Ok(()));
/// ```
#[derive(Default)]
pub struct TaskGroup {
    children: Vec<Child>,
}

impl TaskGroup {
    /// Create an empty group.
    pub fn new() -> Self {
        TaskGroup::default()
    }

    /// Spawn a child task owned by this group.
    ///
    /// The returned [`JoinHandle`] can still be used to collect the child's
    /// individual result; the group only tracks completion and interruption.
    pub fn spawn<TOutput, TFuture>(&mut self, future: TFuture) -> JoinHandle<TOutput>
    where
        TFuture: Future<Output = Cancellable<TOutput>> + 'static,
        TOutput: 'static,
    {
        let interrupted = Rc::new(Cell::new(false));
        let flag = interrupted.clone();
        let handle = spawn(async move {
            let result = future.await;
            if result.is_err() {
                flag.set(true);
            }
            result
        });
        self.children.push(Child {
            handle: handle.handle(),
            interrupted,
        });
        handle
    }

    /// The number of children spawned into this group so far.
    pub fn len(&self) -> usize {
        self.children.len()
    }

    /// True if no child has been spawned yet.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Request cancellation of every child that has not finished yet.
    pub fn cancel_all(&self) {
        for child in &self.children {
            if !child.handle.is_finished() {
                child.handle.cancel_request();
            }
        }
    }

    /// Wait until every child has finished.
    ///
    /// Returns `Err(Cancelled)` when any child ended interrupted or when the
    /// joining task was itself cancelled while waiting; `Ok(())` otherwise.
    pub async fn join(&mut self) -> Cancellable<()> {
        let mut joiner_interrupted = false;
        let mut winding_down = false;
        let mut index = 0;
        while index < self.children.len() {
            match self.children[index].handle.wait_finished().await {
                Ok(()) => {
                    if self.children[index].interrupted.get() && !winding_down {
                        trace!("task group child ended interrupted; cancelling siblings");
                        winding_down = true;
                        self.cancel_all();
                    }
                    index += 1;
                }
                Err(Cancelled) => {
                    if joiner_interrupted {
                        // Interrupted a second time while winding down; stop
                        // waiting for the children.
                        return Err(Cancelled);
                    }
                    trace!("task group join interrupted; cancelling children");
                    joiner_interrupted = true;
                    winding_down = true;
                    self.cancel_all();
                }
            }
        }
        let any_interrupted = self.children.iter().any(|child| child.interrupted.get());
        if joiner_interrupted || any_interrupted {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

impl Drop for TaskGroup {
    fn drop(&mut self) {
        let unfinished = self
            .children
            .iter()
            .filter(|child| !child.handle.is_finished())
            .count();
        if unfinished > 0 {
            trace!("task group dropped with {unfinished} unfinished children; cancelling");
            self.cancel_all();
        }
    }
}
