//!
//! ### Simple example
//!
//! A [`Scope`] wraps an asynchronous body and interrupts it, at its next
//! suspension point, as soon as one of its triggers fires. The body does not
//! collaborate beyond propagating `?`; on exit the scope reports what happened
//! as data and the surrounding code resumes normally.
//!
//! ```rust
//! use cancel_scope::{DeadlineTrigger, ReasonKind, Scope, rt};
//! use std::time::Duration;
//!
//! rt::run(async {
//!     let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(
//!         Duration::from_millis(20),
//!     ))]);
//!     let result = scope
//!         .run(async {
//!             rt::sleep(Duration::from_secs(600)).await?;
//!             Ok("never reached")
//!         })
//!         .await;
//!
//!     assert_eq!(result, Ok(None));
//!     assert!(scope.cancelled());
//!     assert_eq!(scope.reasons()[0].kind(), &ReasonKind::Deadline);
//! });
//! ```
//!
//! ## Complex example
//!
//! Several independent triggers can watch one region of work, and scopes nest:
//! an inner scope that owns the interruption absorbs it, while a cancellation
//! it does not own propagates to the outer owner untouched.
//!
//! ```rust
//! use cancel_scope::{DeadlineTrigger, EventTrigger, Scope, rt};
//! use std::time::Duration;
//!
//! rt::run(async {
//!     let shutdown = rt::Event::new_rc();
//!     let setter = shutdown.clone();
//!     rt::spawn(async move {
//!         rt::sleep(Duration::from_millis(5)).await?;
//!         setter.set();
//!         Ok(())
//!     });
//!
//!     let mut outer = Scope::new(vec![Box::new(DeadlineTrigger::after(
//!         Duration::from_secs(600),
//!     ))]);
//!     let outer_result = outer
//!         .run(async {
//!             let mut inner = Scope::new(vec![Box::new(
//!                 EventTrigger::new(&shutdown).with_code("shutdown"),
//!             )]);
//!             let inner_result = inner.run(async { rt::pending::<()>().await }).await;
//!
//!             // The inner scope owned the interruption: it was absorbed here.
//!             assert_eq!(inner_result, Ok(None));
//!             assert!(inner.cancelled_by("shutdown"));
//!
//!             // The outer budget is untouched and the outer body carries on.
//!             rt::sleep(Duration::from_millis(1)).await?;
//!             Ok("outer finished")
//!         })
//!         .await;
//!
//!     assert_eq!(outer_result, Ok(Some("outer finished")));
//!     assert!(!outer.cancelled());
//! });
//! ```
//!
//! The heavy lifting happens at scope exit. While active, a scope may schedule
//! at most one *deferred* cancellation request against its host task; on exit
//! it disarms every trigger and then either rescinds the request (it never
//! reached the task), claims it (balancing the task's request counter and
//! swallowing the `Cancelled` error), or leaves it for an outer owner when the
//! counter shows that someone else requested cancellation too. See [`rt`] for
//! the dispatcher primitives this protocol is built on.
//!

/// Cancellation error type.
mod error;

/// Immutable records describing why a cancellation fired.
mod reason;

/// The scope itself, together with its interruption-ownership machinery.
mod scope;

/// Trigger contracts and the stock deadline/event triggers.
mod triggers;

/// The single-threaded cooperative dispatcher the scopes run against.
pub mod rt;

pub use error::*;
pub use reason::*;
pub use scope::{Fire, Scope};
pub use triggers::*;
