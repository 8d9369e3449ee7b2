use std::fmt::{Display, Formatter};

/// Classifies the source of a [`CancelReason`].
///
/// The two stock variants cover the triggers shipped with this crate. User-defined
/// [`crate::Trigger`] implementations tag their reasons with [`ReasonKind::Custom`]
/// and a static name, similar to a type name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReasonKind {
    /// A deadline budget elapsed ([`crate::DeadlineTrigger`]).
    Deadline,
    /// An externally held one-shot signal was set ([`crate::EventTrigger`]).
    Event,
    /// A user-defined trigger fired.
    Custom(&'static str),
}

impl Display for ReasonKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReasonKind::Deadline => write!(f, "deadline"),
            ReasonKind::Event => write!(f, "event"),
            ReasonKind::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// An immutable record of *why* a cancellation fired.
///
/// Reasons are produced by [`crate::Trigger`] implementations and collected by the
/// owning [`crate::Scope`] in firing order. Once constructed, a reason never
/// changes.
///
/// The optional `code` is a short user-supplied identifier intended for
/// programmatic [`crate::Scope::cancelled_by`] queries, e.g. `"shutdown"`.
#[derive(Clone, Debug)]
pub struct CancelReason {
    kind: ReasonKind,
    message: String,
    code: Option<String>,
}

impl CancelReason {
    /// Create a new reason with the given kind and a short human-readable message.
    pub fn new(kind: ReasonKind, message: impl Into<String>) -> Self {
        CancelReason {
            kind,
            message: message.into(),
            code: None,
        }
    }

    /// Attach a user code used by [`crate::Scope::cancelled_by`].
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// The classification of the trigger that produced this reason.
    pub fn kind(&self) -> &ReasonKind {
        &self.kind
    }

    /// Short free-form human-readable text.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The user code attached to this reason, if any.
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

impl Display for CancelReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{}: {} (code `{}`)", self.kind, self.message, code),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}
