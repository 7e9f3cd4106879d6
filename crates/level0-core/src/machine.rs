//! The execution state machine.
//!
//! [`transition`] is a pure function from the current [`Execution`] and an
//! [`Event`] to the next execution record plus a [`Directive`] for the
//! driver. It performs no I/O; the driver persists the returned record
//! (compare-and-swap on [`Execution::version`]) before acting on the
//! directive.
//!
//! ```text
//!  Pending ──Start──▶ Routing ──Routed──▶ Importing ──ok──▶ Notifying ──ok──▶ Succeeded
//!                        │                 │  ▲  │              │  ▲  │
//!                   Unroutable      transient│  │permanent  transient│  │permanent
//!                        │           (budget)└──┘  │        (budget)└──┘  │
//!                        ▼                         ▼                      ▼
//!                     Failed ◀─────────────────────┴──────────────────────┘
//!
//!  Cancel: any non-terminal state ──▶ Failed(Cancelled)
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backoff::{RetryPolicies, RetryPolicy};
use crate::error::{ErrorKind, TransitionError};
use crate::models::{ExecutionId, FileDescriptor, ImportSummary};

/// Lifecycle state of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Pending,
    Routing,
    Importing,
    Notifying,
    Succeeded,
    Failed,
}

impl ExecutionState {
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Pending => matches!(target, Self::Routing | Self::Failed),
            Self::Routing => matches!(target, Self::Importing | Self::Failed),
            Self::Importing => matches!(target, Self::Importing | Self::Notifying | Self::Failed),
            Self::Notifying => matches!(target, Self::Notifying | Self::Succeeded | Self::Failed),
            Self::Succeeded | Self::Failed => false,
        }
    }

    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Routing => "routing",
            Self::Importing => "importing",
            Self::Notifying => "notifying",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for ExecutionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "pending" => Self::Pending,
            "routing" => Self::Routing,
            "importing" => Self::Importing,
            "notifying" => Self::Notifying,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            other => return Err(format!("unknown execution state '{}'", other)),
        })
    }
}

/// A classified step failure, as recorded on the execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
    /// Whether the step may be retried. Defaults to the kind's class.
    pub retryable: bool,
}

impl StepFailure {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.is_transient(),
        }
    }

    /// A failure of a normally transient kind that must not be retried.
    pub fn permanent(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
        }
    }
}

/// Durable record of one file's progress through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: ExecutionId,
    pub descriptor: FileDescriptor,
    pub state: ExecutionState,
    pub import_attempts: u32,
    pub notify_attempts: u32,
    pub last_error: Option<StepFailure>,
    /// When the next attempt of the current step is due.
    pub retry_at: Option<DateTime<Utc>>,
    /// Set once the import step has succeeded.
    pub summary: Option<ImportSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Row version for compare-and-swap; bumped by the store on every save.
    pub version: i64,
}

impl Execution {
    pub fn new(descriptor: FileDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id: descriptor.execution_id(),
            descriptor,
            state: ExecutionState::Pending,
            import_attempts: 0,
            notify_attempts: 0,
            last_error: None,
            retry_at: None,
            summary: None,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Attempts of the current step, or of the last step that ran.
    pub fn attempt_count(&self) -> u32 {
        if self.notify_attempts > 0 || self.state == ExecutionState::Notifying {
            self.notify_attempts
        } else {
            self.import_attempts
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// True when the pipeline finished but notification did not.
    pub fn is_partial_success(&self) -> bool {
        self.state == ExecutionState::Failed
            && self.summary.is_some()
            && self
                .last_error
                .as_ref()
                .map(|e| e.kind == ErrorKind::NotificationFailed)
                .unwrap_or(false)
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start,
    Routed,
    Unroutable { file_type: String },
    ImportSucceeded(ImportSummary),
    ImportFailed(StepFailure),
    NotifySucceeded { delivered: usize },
    NotifyFailed(StepFailure),
    Cancel { reason: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::Routed => "routed",
            Event::Unroutable { .. } => "unroutable",
            Event::ImportSucceeded(_) => "import_succeeded",
            Event::ImportFailed(_) => "import_failed",
            Event::NotifySucceeded { .. } => "notify_succeeded",
            Event::NotifyFailed(_) => "notify_failed",
            Event::Cancel { .. } => "cancel",
        }
    }
}

/// What the driver should do after persisting a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    Route,
    Import,
    Notify,
    /// Re-run the current step once the delay has elapsed.
    RetryAfter(Duration),
    Stop,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub execution: Execution,
    pub directive: Directive,
}

/// Apply `event` to `current`.
///
/// # Errors
///
/// [`TransitionError::Terminal`] for any event on a terminal execution and
/// [`TransitionError::Invalid`] for an event the current state does not
/// accept.
pub fn transition(
    current: &Execution,
    event: Event,
    policies: &RetryPolicies,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    use ExecutionState::*;

    if current.state.is_terminal() {
        return Err(TransitionError::Terminal(current.state));
    }

    let mut next = current.clone();
    next.updated_at = now;
    let invalid = TransitionError::Invalid {
        state: current.state,
        event: event.name(),
    };

    let directive = match (current.state, event) {
        (_, Event::Cancel { reason }) => {
            next.state = Failed;
            next.retry_at = None;
            next.last_error = Some(StepFailure::permanent(ErrorKind::Cancelled, reason));
            Directive::Stop
        }
        (Pending, Event::Start) => {
            next.state = Routing;
            Directive::Route
        }
        (Routing, Event::Routed) => {
            next.state = Importing;
            Directive::Import
        }
        (Routing, Event::Unroutable { file_type }) => {
            next.state = Failed;
            next.last_error = Some(StepFailure::permanent(
                ErrorKind::UnroutableFileType,
                format!("no import branch for file type '{}'", file_type),
            ));
            Directive::Stop
        }
        (Importing, Event::ImportSucceeded(summary)) => {
            next.import_attempts += 1;
            next.state = Notifying;
            next.summary = Some(summary);
            next.last_error = None;
            next.retry_at = None;
            Directive::Notify
        }
        (Importing, Event::ImportFailed(failure)) => {
            next.import_attempts += 1;
            let attempts = next.import_attempts;
            retry_or_fail(&mut next, failure, &policies.import, attempts, now)
        }
        (Notifying, Event::NotifySucceeded { .. }) => {
            next.notify_attempts += 1;
            next.state = Succeeded;
            next.last_error = None;
            next.retry_at = None;
            Directive::Stop
        }
        (Notifying, Event::NotifyFailed(failure)) => {
            next.notify_attempts += 1;
            let failure = StepFailure {
                kind: ErrorKind::NotificationFailed,
                ..failure
            };
            let attempts = next.notify_attempts;
            retry_or_fail(&mut next, failure, &policies.notify, attempts, now)
        }
        _ => return Err(invalid),
    };

    debug_assert!(current.state.can_transition_to(next.state) || current.state == next.state);
    Ok(Transition {
        execution: next,
        directive,
    })
}

fn retry_or_fail(
    next: &mut Execution,
    failure: StepFailure,
    policy: &RetryPolicy,
    attempts: u32,
    now: DateTime<Utc>,
) -> Directive {
    if failure.retryable && policy.allows_retry(attempts) {
        let delay = policy.delay_after(attempts);
        next.retry_at = Some(now + chrono::Duration::milliseconds(delay.as_millis() as i64));
        next.last_error = Some(failure);
        Directive::RetryAfter(delay)
    } else {
        next.state = ExecutionState::Failed;
        next.retry_at = None;
        next.last_error = Some(failure);
        Directive::Stop
    }
}
