use crate::rt::Event;
use crate::scope::Fire;
use crate::{CancelReason, Cancellable, ReasonKind, Scope, Trigger, TriggerHandle};
use log::trace;
use std::future::Future;
use std::rc::Rc;

/// Run the given `body` in a [`Scope`] that cancels it once the externally held
/// `event` is set.
///
/// Returns `Ok(None)` when the event interrupted the body. Use a [`Scope`] with
/// an explicit [`EventTrigger`] to attach a user code or combine the event with
/// other triggers.
pub async fn on_event<TOutput, TBody>(
    event: &Rc<Event>,
    body: TBody,
) -> Cancellable<Option<TOutput>>
where
    TBody: Future<Output = Cancellable<TOutput>>,
{
    let mut scope = Scope::new(vec![Box::new(EventTrigger::new(event))]);
    scope.run(body).await
}

/// Implementation of [`Trigger`] that fires when an externally held one-shot
/// [`Event`] is set.
///
/// Arming attaches directly to the event's notification list (the same
/// primitive [`Event::wait`] uses), meaning watching an event costs no
/// additional task. The trigger holds the event through a shared `Rc`; clones
/// react to the same signal.
///
/// ```rust
/// # use cancel_scope::{EventTrigger, Scope, rt};
/// # use std::time::Duration;
/// # let _ = env_logger::builder().is_test(true).try_init();
/// let cancelled_by_shutdown = rt::run(async {
///     let event = rt::Event::new_rc();
///     let setter = event.clone();
///     rt::spawn(async move {
///         rt::sleep(Duration::from_millis(5)).await?;
///         setter.set();
///         Ok(())
///     });
///
///     let mut scope = Scope::new(vec![Box::new(
///         EventTrigger::new(&event).with_code("shutdown"),
///     )]);
///     let result = scope.run(async { rt::pending::<()>().await }).await;
///     assert_eq!(result, Ok(None));
///     scope.cancelled_by("shutdown")
/// });
/// assert!(cancelled_by_shutdown);
/// ```
///
/// ## Logging
///  - `[trace]` When the subscription is armed and when the event fires it.
#[derive(Clone)]
pub struct EventTrigger {
    event: Rc<Event>,
    code: Option<String>,
}

impl EventTrigger {
    /// Create a trigger watching the given event.
    pub fn new(event: &Rc<Event>) -> Self {
        EventTrigger {
            event: event.clone(),
            code: None,
        }
    }

    /// Attach a user code to the reasons this trigger produces, for
    /// [`Scope::cancelled_by`] queries.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    fn reason(&self) -> CancelReason {
        match &self.code {
            Some(code) => CancelReason::new(ReasonKind::Event, format!("event `{code}` signalled"))
                .with_code(code),
            None => CancelReason::new(ReasonKind::Event, "event signalled"),
        }
    }
}

impl Trigger for EventTrigger {
    fn check(&self) -> Option<CancelReason> {
        if self.event.is_set() {
            Some(self.reason())
        } else {
            None
        }
    }

    fn arm(&self, fire: Fire) -> Box<dyn TriggerHandle> {
        let reason = self.reason();
        let subscription = self.event.subscribe(Box::new(move || {
            trace!("`EventTrigger` subscription firing.");
            fire.fire(reason);
        }));
        trace!("`EventTrigger` armed (subscription {subscription}).");
        Box::new(EventHandle {
            event: self.event.clone(),
            subscription: Some(subscription),
        })
    }

    fn type_name(&self) -> &'static str {
        "EventTrigger"
    }
}

struct EventHandle {
    event: Rc<Event>,
    subscription: Option<u64>,
}

impl TriggerHandle for EventHandle {
    fn disarm(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.event.unsubscribe(subscription);
        }
    }
}
