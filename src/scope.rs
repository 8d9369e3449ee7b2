use crate::rt::{ScheduledHandle, TaskHandle};
use crate::{CancelReason, Cancellable, DynTrigger, TriggerHandle, rt};
use log::trace;
use std::cell::RefCell;
use std::future::Future;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// Tracks the one interruption a scope may schedule against its host task.
///
/// `Idle` until the first trigger fires. `Scheduled` once a deferred dispatcher
/// callback has been queued; the callback moves it to `Delivered` right before
/// requesting cancellation of the task, and exit moves it to `Rescinded` when
/// the callback never got to run. The `Scheduled -> Delivered` transition
/// happens at most once per scope.
enum CancelToken {
    Idle,
    Scheduled(ScheduledHandle),
    Delivered,
    Rescinded,
}

/// State shared between an active [`Scope`] and the callbacks of its armed
/// triggers. Trigger registrations reach it through [`Fire`]'s weak reference,
/// which stops resolving once the scope has settled.
pub(crate) struct ScopeCore {
    task: TaskHandle,
    baseline: u32,
    reasons: Vec<CancelReason>,
    token: CancelToken,
}

impl ScopeCore {
    /// Record a firing. The first reason latches the scope as cancelled and
    /// schedules the interruption; later firings only append their reason.
    fn fire(core: &Rc<RefCell<ScopeCore>>, reason: CancelReason) {
        let first = {
            let mut state = core.borrow_mut();
            trace!("`Scope[{:p}]` trigger fired: {reason}", Rc::as_ptr(core));
            let first = state.reasons.is_empty();
            state.reasons.push(reason);
            first
        };
        if first {
            ScopeCore::schedule_interruption(core);
        }
    }

    /// Ask the dispatcher to deliver a cancellation request to the host task on
    /// the next tick. Deferral is essential: requesting cancellation
    /// synchronously from inside the task would leave a pending interrupt that
    /// exit cannot always reclaim, striking the first suspension point *after*
    /// the scope.
    fn schedule_interruption(core: &Rc<RefCell<ScopeCore>>) {
        debug_assert!(matches!(core.borrow().token, CancelToken::Idle));
        let weak = Rc::downgrade(core);
        let scheduled = rt::schedule_soon(move || {
            let Some(core) = weak.upgrade() else {
                return;
            };
            let mut state = core.borrow_mut();
            if matches!(state.token, CancelToken::Scheduled(_)) {
                state.token = CancelToken::Delivered;
                trace!("`Scope[{:p}]` interruption delivered.", Rc::as_ptr(&core));
                state.task.cancel_request();
            }
        });
        let mut state = core.borrow_mut();
        state.token = CancelToken::Scheduled(scheduled);
        trace!("`Scope[{:p}]` interruption scheduled.", Rc::as_ptr(core));
    }
}

/// The one-shot firing capability handed to a [`crate::Trigger`] when it is
/// armed.
///
/// Calling [`fire`](Fire::fire) appends the reason to the owning scope and, on
/// the scope's first firing, schedules the interruption of its host task. The
/// capability holds only a weak reference: once the scope has settled, firing
/// is a no-op.
pub struct Fire {
    core: Weak<RefCell<ScopeCore>>,
}

impl Fire {
    /// Report that the trigger's condition became true.
    pub fn fire(self, reason: CancelReason) {
        let Some(core) = self.core.upgrade() else {
            trace!("trigger fired after its scope settled; reason discarded");
            return;
        };
        ScopeCore::fire(&core, reason);
    }
}

enum State {
    Idle,
    Active {
        core: Rc<RefCell<ScopeCore>>,
        handles: Vec<Box<dyn TriggerHandle>>,
    },
    Settled(Outcome),
}

struct Outcome {
    cancelled: bool,
    reasons: Vec<CancelReason>,
    remaining: Option<Duration>,
}

/// A multi-source cancellation scope: runs an asynchronous body and interrupts
/// it, at its next suspension point, as soon as any of the configured
/// [`crate::Trigger`]s fires.
///
/// Cancellation is lexical (only the body passed to [`run`](Scope::run) is
/// subject to interruption) and is reported as data, not as an error type of
/// its own: after `run` returns, [`cancelled`](Scope::cancelled),
/// [`reasons`](Scope::reasons) and [`cancelled_by`](Scope::cancelled_by)
/// describe what happened, in firing order. A cancellation request that this
/// scope did not cause (an outer scope, a task group winding down) is never
/// swallowed; it propagates as `Err(Cancelled)` for the outer owner, while this
/// scope still records its own reasons, if any.
///
/// A scope is single-use and bound to the task that enters it.
///
/// ```rust
/// use cancel_scope::{DeadlineTrigger, ReasonKind, Scope, rt};
/// use std::time::Duration;
///
/// rt::run(async {
///     let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
///         Duration::from_millis(20),
///     ))]);
///     let result = scope
///         .run(async {
///             rt::sleep(Duration::from_secs(600)).await?;
///             Ok("unreachable")
///         })
///         .await;
///
///     // Interrupted by this scope: suppressed and reported as data.
///     assert_eq!(result, Ok(None));
///     assert!(scope.cancelled());
///     assert_eq!(scope.reasons()[0].kind(), &ReasonKind::Deadline);
/// });
/// ```
///
/// ## Logging
///  - `[trace]` Scope entry and exit, every trigger firing, and every
///    interruption scheduled, delivered or rescinded.
pub struct Scope {
    triggers: Vec<DynTrigger>,
    state: State,
}

impl Scope {
    /// Create a scope watching the given triggers. A scope with no triggers is
    /// valid and transparent: the body runs exactly as if unwrapped.
    pub fn new(triggers: Vec<DynTrigger>) -> Self {
        Scope {
            triggers,
            state: State::Idle,
        }
    }

    /// Run `body` inside this scope.
    ///
    /// * `Ok(Some(value))`: the body finished; this includes the case where a
    ///   trigger had already fired but the body completed without suspending.
    /// * `Ok(None)`: a trigger of *this* scope fired and the resulting
    ///   interruption was claimed on exit.
    /// * `Err(Cancelled)`: a cancellation request this scope does not own is
    ///   propagating; the caller should forward it with `?`.
    ///
    /// # Panics
    ///
    /// Panics when the scope has been entered before, and when called from
    /// outside a task.
    pub async fn run<TOutput, TBody>(&mut self, body: TBody) -> Cancellable<Option<TOutput>>
    where
        TBody: Future<Output = Cancellable<TOutput>>,
    {
        self.enter();
        let result = body.await;
        self.exit(result)
    }

    fn enter(&mut self) {
        if !matches!(self.state, State::Idle) {
            panic!("a `Scope` can only be entered once");
        }
        let task = rt::current_task();
        let baseline = task.cancel_requests();
        trace!(
            "`Scope` entered on task {} (baseline: {baseline}).",
            task.id()
        );

        // Pre-check every trigger before arming any of them; a condition that
        // already holds makes arming pointless.
        let mut reasons = Vec::new();
        for trigger in &self.triggers {
            if let Some(reason) = trigger.check() {
                trace!("`{}` already satisfied on entry: {reason}", trigger.type_name());
                reasons.push(reason);
            }
        }
        let pre_triggered = !reasons.is_empty();

        let core = Rc::new(RefCell::new(ScopeCore {
            task,
            baseline,
            reasons,
            token: CancelToken::Idle,
        }));

        let mut handles = Vec::with_capacity(self.triggers.len());
        if pre_triggered {
            ScopeCore::schedule_interruption(&core);
        } else {
            for trigger in &self.triggers {
                handles.push(trigger.arm(Fire {
                    core: Rc::downgrade(&core),
                }));
            }
        }
        self.state = State::Active { core, handles };
    }

    fn exit<TOutput>(&mut self, result: Cancellable<TOutput>) -> Cancellable<Option<TOutput>> {
        let State::Active { core, mut handles } = mem::replace(&mut self.state, State::Idle) else {
            panic!("Invariant violation: `Scope::exit` without a matching entry.");
        };

        // Disarm strictly before resolving the token: nothing may fire once
        // resolution has started.
        for handle in handles.iter_mut() {
            handle.disarm();
        }
        drop(handles);

        let remaining = self.measure_remaining();

        let mut state = core.borrow_mut();
        let suppress = match mem::replace(&mut state.token, CancelToken::Rescinded) {
            CancelToken::Idle => false,
            CancelToken::Scheduled(scheduled) => {
                // The interruption never reached the task (for instance the
                // body finished without suspending). Rescind it.
                scheduled.cancel();
                trace!("`Scope[{:p}]` interruption rescinded.", Rc::as_ptr(&core));
                false
            }
            CancelToken::Delivered => {
                // Our request inflated the counter; withdraw it and decide
                // ownership of the propagating cancellation.
                let outstanding = state.task.uncancel_request();
                let owned = outstanding <= state.baseline;
                if owned {
                    // Once the counter is back at baseline, any interrupt still
                    // pending is ours and must not strike a later suspension.
                    state.task.clear_interrupt();
                }
                owned && result.is_err()
            }
            CancelToken::Rescinded => {
                panic!("Invariant violation: `Scope` token resolved twice.")
            }
        };
        let reasons = mem::take(&mut state.reasons);
        let cancelled = !reasons.is_empty();
        trace!(
            "`Scope[{:p}]` exited (cancelled: {cancelled}, suppress: {suppress}).",
            Rc::as_ptr(&core)
        );
        drop(state);
        drop(core);

        self.state = State::Settled(Outcome {
            cancelled,
            reasons,
            remaining,
        });

        match result {
            Ok(value) => Ok(Some(value)),
            Err(_) if suppress => Ok(None),
            Err(cancelled) => Err(cancelled),
        }
    }

    fn settled(&self, query: &str) -> &Outcome {
        match &self.state {
            State::Settled(outcome) => outcome,
            _ => panic!("`Scope::{query}` is only available after the scope has exited"),
        }
    }

    /// True iff at least one reason was recorded.
    ///
    /// # Panics
    ///
    /// Panics before the scope has exited.
    pub fn cancelled(&self) -> bool {
        self.settled("cancelled").cancelled
    }

    /// The recorded reasons, ordered by firing time.
    ///
    /// # Panics
    ///
    /// Panics before the scope has exited.
    pub fn reasons(&self) -> &[CancelReason] {
        &self.settled("reasons").reasons
    }

    /// True iff any recorded reason carries the given user code.
    ///
    /// # Panics
    ///
    /// Panics before the scope has exited.
    pub fn cancelled_by(&self, code: &str) -> bool {
        self.settled("cancelled_by")
            .reasons
            .iter()
            .any(|reason| reason.code() == Some(code))
    }

    /// The smallest unused budget across the scope's deadline-bearing triggers,
    /// or `None` when the scope holds no deadline.
    ///
    /// While the scope is active (or not yet entered) this samples the triggers
    /// directly; after exit it returns the value sampled at exit.
    pub fn remaining(&self) -> Option<Duration> {
        match &self.state {
            State::Settled(outcome) => outcome.remaining,
            _ => self.measure_remaining(),
        }
    }

    fn measure_remaining(&self) -> Option<Duration> {
        self.triggers
            .iter()
            .filter_map(|trigger| trigger.remaining())
            .min()
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let State::Active { core, handles } = &mut self.state {
            // The body was torn down without reaching exit (the host task was
            // dropped). Release every registration so nothing fires into the
            // dead scope.
            trace!(
                "`Scope[{:p}]` dropped while active; releasing registrations.",
                Rc::as_ptr(core)
            );
            for handle in handles.iter_mut() {
                handle.disarm();
            }
            let mut state = core.borrow_mut();
            if let CancelToken::Scheduled(scheduled) =
                mem::replace(&mut state.token, CancelToken::Rescinded)
            {
                scheduled.cancel();
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testkit::TickTrigger;
    use crate::scope::Fire;
    use crate::{
        CancelReason, Cancellable, Cancelled, DeadlineTrigger, DynTrigger, EventTrigger,
        ReasonKind, Scope, Trigger, TriggerHandle, rt,
    };
    use futures::FutureExt;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    #[test]
    fn deadline_interrupts_a_sleeping_body() {
        let _ = env_logger::builder().is_test(true).try_init();
        rt::run(async {
            let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
                Duration::from_millis(50),
            ))]);
            let result = scope
                .run(async {
                    rt::sleep(Duration::from_secs(10)).await?;
                    Ok(())
                })
                .await;

            assert_eq!(result, Ok(None));
            assert!(scope.cancelled());
            assert_eq!(scope.reasons().len(), 1);
            assert_eq!(scope.reasons()[0].kind(), &ReasonKind::Deadline);
            assert!(scope.reasons()[0].message().contains("0.05"));
            assert_eq!(rt::current_task().cancel_requests(), 0);
        });
    }

    #[test]
    fn event_interrupts_a_pending_body() {
        rt::run(async {
            let event = rt::Event::new_rc();
            let setter = event.clone();
            rt::spawn(async move {
                rt::sleep(Duration::from_millis(10)).await?;
                setter.set();
                Ok(())
            });

            let mut scope = Scope::new(vec![Box::new(
                EventTrigger::new(&event).with_code("shutdown"),
            )]);
            let result = scope.run(async { rt::pending::<()>().await }).await;

            assert_eq!(result, Ok(None));
            assert!(scope.cancelled());
            assert!(scope.cancelled_by("shutdown"));
            assert!(!scope.cancelled_by("reload"));
            assert_eq!(scope.reasons().len(), 1);
            assert_eq!(scope.reasons()[0].kind(), &ReasonKind::Event);
        });
    }

    #[test]
    fn pre_triggered_deadline_with_synchronous_body() {
        rt::run(async {
            let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(Duration::ZERO))]);
            let result = scope.run(async { Ok(42) }).await;

            // The body never suspended, so it ran to completion; the scope is
            // still reported as cancelled and the scheduled interruption was
            // rescinded.
            assert_eq!(result, Ok(Some(42)));
            assert!(scope.cancelled());
            assert_eq!(scope.reasons().len(), 1);
            assert_eq!(scope.reasons()[0].kind(), &ReasonKind::Deadline);

            // No pending interruption may remain after exit.
            assert_eq!(rt::current_task().cancel_requests(), 0);
            assert_eq!(rt::sleep(Duration::from_millis(1)).await, Ok(()));
        });
    }

    #[test]
    fn outer_cancellation_is_not_claimed() {
        rt::run(async {
            let me = rt::current_task();
            rt::schedule_soon(move || me.cancel_request());

            let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
                Duration::from_secs(600),
            ))]);
            let result = scope.run(async { rt::pending::<()>().await }).await;

            assert_eq!(result, Err(Cancelled));
            assert!(!scope.cancelled());
            assert!(scope.reasons().is_empty());

            // The request belongs to the "outer" mechanism (this test); balance
            // it before the task continues.
            assert_eq!(rt::current_task().cancel_requests(), 1);
            let _ = rt::current_task().uncancel_request();
        });
    }

    #[test]
    fn racing_triggers_record_both_reasons_but_interrupt_once() {
        rt::run(async {
            let mut scope = Scope::new(vec![
                Box::new(TickTrigger { ticks: 1, code: "a" }) as DynTrigger,
                Box::new(TickTrigger { ticks: 1, code: "b" }) as DynTrigger,
            ]);
            let result = scope.run(async { rt::pending::<()>().await }).await;

            assert_eq!(result, Ok(None));
            let codes: Vec<_> = scope.reasons().iter().filter_map(|r| r.code()).collect();
            assert_eq!(codes, vec!["a", "b"]);
            assert_eq!(rt::current_task().cancel_requests(), 0);
        });
    }

    #[test]
    fn inner_deadline_is_absorbed_and_the_outer_scope_continues() {
        rt::run(async {
            let mut outer = Scope::new(vec![Box::new(DeadlineTrigger::after(
                Duration::from_secs(5),
            ))]);
            let outer_result = outer
                .run(async {
                    let mut inner = Scope::new(vec![Box::new(DeadlineTrigger::after(
                        Duration::from_millis(50),
                    ))]);
                    let inner_result = inner
                        .run(async {
                            rt::sleep(Duration::from_secs(10)).await?;
                            Ok(())
                        })
                        .await;
                    assert_eq!(inner_result, Ok(None));
                    assert!(inner.cancelled());

                    // The outer budget is intact; the outer body resumes.
                    rt::sleep(Duration::from_millis(1)).await?;
                    Ok("outer finished")
                })
                .await;

            assert_eq!(outer_result, Ok(Some("outer finished")));
            assert!(!outer.cancelled());
            assert_eq!(rt::current_task().cancel_requests(), 0);
        });
    }

    #[test]
    fn own_trigger_and_outer_request_propagate_to_the_outer_owner() {
        rt::run(async {
            let mut scope = Scope::new(vec![Box::new(TickTrigger { ticks: 1, code: "inner" })]);
            let result = scope
                .run(async {
                    let interrupted = rt::pending::<()>().await;
                    // An outer mechanism requests cancellation while the body
                    // is winding down.
                    rt::current_task().cancel_request();
                    interrupted
                })
                .await;

            // The counter sits above baseline at exit: the exception is owed to
            // the outer owner, but this scope still reports its own firing.
            assert_eq!(result, Err(Cancelled));
            assert!(scope.cancelled());
            assert!(scope.cancelled_by("inner"));
            assert_eq!(rt::current_task().cancel_requests(), 1);
            let _ = rt::current_task().uncancel_request();
        });
    }

    #[test]
    fn scope_inside_a_task_group_is_invisible_when_it_owns_the_cancellation() {
        rt::run(async {
            let scope_cancelled = Rc::new(Cell::new(false));
            let seen = scope_cancelled.clone();
            let mut group = rt::TaskGroup::new();
            group.spawn(async move {
                let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
                    Duration::from_millis(5),
                ))]);
                let result = scope.run(async { rt::pending::<()>().await }).await;
                assert_eq!(result, Ok(None));
                seen.set(scope.cancelled());
                Ok(())
            });
            assert_eq!(group.join().await, Ok(()));
            assert!(scope_cancelled.get());
        });
    }

    #[test]
    fn scope_inside_a_cancelled_group_child_stays_silent() {
        rt::run(async {
            let scope_cancelled = Rc::new(Cell::new(true));
            let seen = scope_cancelled.clone();
            let mut group = rt::TaskGroup::new();
            let child = group.spawn(async move {
                let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
                    Duration::from_secs(600),
                ))]);
                let result = scope.run(async { rt::pending::<()>().await }).await;
                assert_eq!(result, Err(Cancelled));
                seen.set(scope.cancelled());
                result
            });
            child.handle().cancel_request();
            assert_eq!(group.join().await, Err(Cancelled));
            assert!(!scope_cancelled.get());
        });
    }

    #[test]
    fn scope_inside_a_group_reports_reasons_even_when_the_group_cancels_too() {
        rt::run(async {
            let seen = Rc::new(Cell::new(false));
            let observed = seen.clone();
            let mut group = rt::TaskGroup::new();
            group.spawn(async move {
                let mut scope = Scope::new(vec![Box::new(TickTrigger { ticks: 1, code: "inner" })]);
                let result = scope
                    .run(async {
                        let interrupted = rt::pending::<()>().await;
                        rt::current_task().cancel_request();
                        interrupted
                    })
                    .await;
                observed.set(scope.cancelled() && scope.cancelled_by("inner"));
                result.map(|_| ())
            });
            assert_eq!(group.join().await, Err(Cancelled));
            assert!(seen.get());
        });
    }

    #[test]
    fn a_scope_without_triggers_is_transparent() {
        rt::run(async {
            let mut scope = Scope::new(vec![]);
            let result = scope
                .run(async {
                    rt::yield_now().await?;
                    Ok(7)
                })
                .await;
            assert_eq!(result, Ok(Some(7)));
            assert!(!scope.cancelled());
            assert!(scope.reasons().is_empty());
            assert_eq!(scope.remaining(), None);
            assert_eq!(rt::current_task().cancel_requests(), 0);
        });
    }

    #[test]
    fn body_errors_pass_through_untouched() {
        rt::run(async {
            // A body may carry its own failure channel inside the success type;
            // the scope never inspects it.
            let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
                Duration::from_secs(600),
            ))]);
            let result: Cancellable<Option<Result<u32, &str>>> =
                scope.run(async { Ok(Err("domain failure")) }).await;
            assert_eq!(result, Ok(Some(Err("domain failure"))));
            assert!(!scope.cancelled());
        });
    }

    #[test]
    fn remaining_reports_the_tightest_deadline() {
        rt::run(async {
            let mut scope = Scope::new(vec![
                Box::new(DeadlineTrigger::after(Duration::from_secs(600))) as DynTrigger,
                Box::new(DeadlineTrigger::after(Duration::from_secs(10))) as DynTrigger,
            ]);
            let before = scope.remaining().unwrap();
            assert!(before <= Duration::from_secs(10));

            let result = scope.run(async { Ok(()) }).await;
            assert_eq!(result, Ok(Some(())));

            let after = scope.remaining().unwrap();
            assert!(after <= Duration::from_secs(10));
            assert!(after > Duration::from_secs(9));
        });
    }

    #[test]
    fn no_spurious_interruption_after_a_cancelled_scope() {
        rt::run(async {
            let mut scope = Scope::new(vec![Box::new(TickTrigger { ticks: 1, code: "x" })]);
            let result = scope.run(async { rt::pending::<()>().await }).await;
            assert_eq!(result, Ok(None));

            // Code after the scope on the same task must be undisturbed.
            assert_eq!(rt::yield_now().await, Ok(()));
            assert_eq!(rt::sleep(Duration::from_millis(1)).await, Ok(()));
        });
    }

    #[test]
    fn late_firing_after_exit_is_discarded() {
        // A trigger whose registration cannot stop the in-flight callback: the
        // firing lands after the scope has settled and must be discarded by the
        // severed back-reference.
        #[derive(Clone)]
        struct LeakyTrigger;
        struct LeakyHandle;
        impl Trigger for LeakyTrigger {
            fn check(&self) -> Option<CancelReason> {
                None
            }
            fn arm(&self, fire: Fire) -> Box<dyn TriggerHandle> {
                let reason = CancelReason::new(ReasonKind::Custom("LeakyTrigger"), "late");
                rt::schedule_soon(move || fire.fire(reason));
                Box::new(LeakyHandle)
            }
            fn type_name(&self) -> &'static str {
                "LeakyTrigger"
            }
        }
        impl TriggerHandle for LeakyHandle {
            fn disarm(&mut self) {}
        }

        rt::run(async {
            let mut scope = Scope::new(vec![Box::new(LeakyTrigger)]);
            // The body never suspends, so the callback can only run after exit.
            let result = scope.run(async { Ok(()) }).await;
            assert_eq!(result, Ok(Some(())));
            assert!(!scope.cancelled());

            rt::yield_now().await?;
            rt::yield_now().await?;
            assert_eq!(rt::current_task().cancel_requests(), 0);
            Ok::<(), Cancelled>(())
        })
        .unwrap();
    }

    #[test]
    fn a_panicking_trigger_callback_does_not_break_the_scope() {
        #[derive(Clone)]
        struct BrokenTrigger;
        struct NoopHandle;
        impl Trigger for BrokenTrigger {
            fn check(&self) -> Option<CancelReason> {
                None
            }
            fn arm(&self, _fire: Fire) -> Box<dyn TriggerHandle> {
                rt::schedule_soon(|| panic!("trigger bug"));
                Box::new(NoopHandle)
            }
            fn type_name(&self) -> &'static str {
                "BrokenTrigger"
            }
        }
        impl TriggerHandle for NoopHandle {
            fn disarm(&mut self) {}
        }

        rt::run(async {
            let mut scope = Scope::new(vec![
                Box::new(BrokenTrigger) as DynTrigger,
                Box::new(TickTrigger { ticks: 1, code: "ok" }) as DynTrigger,
            ]);
            let result = scope.run(async { rt::pending::<()>().await }).await;

            // The broken callback was isolated; the healthy trigger still fired
            // and the scope exited cleanly.
            assert_eq!(result, Ok(None));
            assert!(scope.cancelled_by("ok"));
            assert_eq!(rt::current_task().cancel_requests(), 0);
        });
    }

    #[test]
    fn disarm_is_idempotent() {
        #[derive(Clone)]
        struct CountingTrigger {
            disarms: Rc<Cell<u32>>,
        }
        struct CountingHandle {
            armed: bool,
            disarms: Rc<Cell<u32>>,
        }
        impl Trigger for CountingTrigger {
            fn check(&self) -> Option<CancelReason> {
                None
            }
            fn arm(&self, _fire: Fire) -> Box<dyn TriggerHandle> {
                Box::new(CountingHandle {
                    armed: true,
                    disarms: self.disarms.clone(),
                })
            }
            fn type_name(&self) -> &'static str {
                "CountingTrigger"
            }
        }
        impl TriggerHandle for CountingHandle {
            fn disarm(&mut self) {
                if self.armed {
                    self.armed = false;
                    self.disarms.set(self.disarms.get() + 1);
                }
            }
        }

        // Standalone: a second disarm is indistinguishable from the first.
        let disarms = Rc::new(Cell::new(0));
        let mut handle = CountingHandle {
            armed: true,
            disarms: disarms.clone(),
        };
        handle.disarm();
        handle.disarm();
        assert_eq!(disarms.get(), 1);

        // Through a scope: exit disarms each registration exactly once.
        let disarms = Rc::new(Cell::new(0));
        let trigger = CountingTrigger {
            disarms: disarms.clone(),
        };
        rt::run(async move {
            let mut scope = Scope::new(vec![Box::new(trigger)]);
            let _ = scope.run(async { Ok(()) }).await;
        });
        assert_eq!(disarms.get(), 1);
    }

    #[test]
    #[should_panic(expected = "entered once")]
    fn a_scope_cannot_be_entered_twice() {
        rt::run(async {
            let mut scope = Scope::new(vec![]);
            let _ = scope.run(async { Ok(()) }).await;
            let _ = scope.run(async { Ok(()) }).await;
        });
    }

    #[test]
    #[should_panic(expected = "must be invoked from within a task")]
    fn entering_outside_a_task_is_a_usage_error() {
        let mut scope = Scope::new(vec![]);
        let _ = scope.run(async { Ok(()) }).now_or_never();
    }

    #[test]
    #[should_panic(expected = "only available after the scope has exited")]
    fn querying_cancelled_before_exit_is_a_usage_error() {
        let scope = Scope::new(vec![]);
        let _ = scope.cancelled();
    }
}
