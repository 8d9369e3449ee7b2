use crate::scope::Fire;
use crate::{CancelReason, Cancellable, ReasonKind, Scope, Trigger, TriggerHandle, rt};
use log::trace;
use std::future::Future;
use std::time::{Duration, Instant};

/// Run the given `body` in a [`Scope`] that cancels it once `duration` has
/// elapsed.
///
/// Returns `Ok(None)` when the deadline interrupted the body. Use a [`Scope`]
/// with an explicit [`DeadlineTrigger`] when the recorded reasons or the
/// remaining budget are needed afterwards.
///
/// ```rust
/// use cancel_scope::rt;
/// use std::time::Duration;
///
/// let result = rt::run(async {
///     cancel_scope::on_deadline(Duration::from_millis(10), async {
///         rt::sleep(Duration::from_secs(600)).await?;
///         Ok("unreachable")
///     })
///     .await
/// });
/// assert_eq!(result, Ok(None));
/// ```
pub async fn on_deadline<TOutput, TBody>(
    duration: Duration,
    body: TBody,
) -> Cancellable<Option<TOutput>>
where
    TBody: Future<Output = Cancellable<TOutput>>,
{
    let mut scope = Scope::new(vec![Box::new(DeadlineTrigger::after(duration))]);
    scope.run(body).await
}

/// Implementation of [`Trigger`] that fires once the specified [`Duration`] has
/// elapsed. The budget starts counting immediately upon creation.
///
/// A zero (or already exhausted) budget is reported by `check`, so a scope
/// holding such a trigger is cancelled on entry without arming anything.
///
/// ## Logging
///  - `[trace]` When the timer is armed and when the deadline fires.
#[derive(Debug, Clone)]
pub struct DeadlineTrigger {
    duration: Duration,
    deadline: Instant,
    code: Option<String>,
}

impl DeadlineTrigger {
    /// Create a trigger whose deadline lies `duration` from now.
    pub fn after(duration: Duration) -> Self {
        DeadlineTrigger {
            duration,
            deadline: Instant::now() + duration,
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
        let message = format!("deadline of {}s elapsed", self.duration.as_secs_f64());
        match &self.code {
            Some(code) => CancelReason::new(ReasonKind::Deadline, message).with_code(code),
            None => CancelReason::new(ReasonKind::Deadline, message),
        }
    }
}

impl Trigger for DeadlineTrigger {
    fn check(&self) -> Option<CancelReason> {
        if Instant::now() >= self.deadline {
            Some(self.reason())
        } else {
            None
        }
    }

    fn arm(&self, fire: Fire) -> Box<dyn TriggerHandle> {
        let reason = self.reason();
        let timer = rt::schedule_at(self.deadline, move || fire.fire(reason));
        trace!(
            "`DeadlineTrigger` armed; {}s remaining.",
            self.remaining().unwrap_or_default().as_secs_f64()
        );
        Box::new(DeadlineHandle { timer: Some(timer) })
    }

    fn remaining(&self) -> Option<Duration> {
        Some(self.deadline.saturating_duration_since(Instant::now()))
    }

    fn type_name(&self) -> &'static str {
        "DeadlineTrigger"
    }
}

struct DeadlineHandle {
    timer: Option<rt::TimerHandle>,
}

impl TriggerHandle for DeadlineHandle {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
    }
}
