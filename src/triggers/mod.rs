use crate::CancelReason;
use crate::scope::Fire;
use dyn_clone::{DynClone, clone_trait_object};
use std::time::Duration;

mod deadline;
pub use deadline::*;

mod event;
pub use event::*;

/// Defines a cancellation source that a [`crate::Scope`] can watch.
///
/// A trigger is a *description* of a condition, stateless with respect to any
/// particular scope: the same trigger value (or a clone of it) may be used by
/// several scopes, and **cloning a trigger produces an object that reacts to the
/// same condition**.
///
/// The scope drives a trigger through two operations. On entry it first calls
/// [`check`](Trigger::check) on every trigger; only when no condition already
/// holds does it [`arm`](Trigger::arm) them. An armed trigger must invoke its
/// [`Fire`] exactly once, from the dispatcher's event dispatch, never
/// synchronously inside `arm`, even if the condition is already true at that
/// point (the scope covers that case through `check`).
pub trait Trigger: DynClone {
    /// Return a reason iff the cancellation condition *already* holds.
    ///
    /// Must be synchronous, non-blocking and safe to call any number of times.
    fn check(&self) -> Option<CancelReason>;

    /// Register `fire` to be invoked once when the condition becomes true, and
    /// return the live registration.
    ///
    /// The callback runs on the dispatcher thread and must do O(1) work: build
    /// its reason, call [`Fire::fire`], return.
    fn arm(&self, fire: Fire) -> Box<dyn TriggerHandle>;

    /// The unused time budget of a deadline-bearing trigger, clamped to zero.
    /// `None` for triggers with no notion of a deadline.
    fn remaining(&self) -> Option<Duration> {
        None
    }

    /// The name of this trigger type, used in log output.
    fn type_name(&self) -> &'static str;
}

clone_trait_object!(Trigger);

/// A dynamic boxed [`Trigger`].
pub type DynTrigger = Box<dyn Trigger>;

impl Trigger for DynTrigger {
    fn check(&self) -> Option<CancelReason> {
        self.as_ref().check()
    }

    fn arm(&self, fire: Fire) -> Box<dyn TriggerHandle> {
        self.as_ref().arm(fire)
    }

    fn remaining(&self) -> Option<Duration> {
        self.as_ref().remaining()
    }

    fn type_name(&self) -> &'static str {
        self.as_ref().type_name()
    }
}

/// The live registration of an armed [`Trigger`], released by
/// [`disarm`](TriggerHandle::disarm).
///
/// Invariants every implementation must uphold: after `disarm` the registered
/// callback must never be invoked; after the callback has fired it must not
/// fire again; and `disarm` is idempotent and safe to call after firing.
/// Disarming also severs whatever back-reference the registration holds to the
/// owning scope.
pub trait TriggerHandle {
    /// Release the registration. Idempotent; a no-op once the trigger fired.
    fn disarm(&mut self);
}
