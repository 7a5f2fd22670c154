//! Polling until a remote instance reaches a target state or a deadline.
//!
//! The waiter is an explicit state machine ([`WaitState`]) driven by an
//! injected [`Clock`] and an injected status read. Transient read failures
//! keep it waiting; only the deadline stops it.

mod clock;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::remote::{InstanceRepresentation, InstanceStatus};

pub use clock::{Clock, ClockFuture, TokioClock};

/// Default delay between successful status reads.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// Default delay after a failed status read.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// State the waiter polls for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConvergenceTarget {
    /// The instance reports `active`.
    Active,
    /// The instance no longer exists.
    Absent,
}

impl fmt::Display for ConvergenceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Absent => f.write_str("absent"),
        }
    }
}

/// Progress of a single wait.
#[derive(Debug)]
pub enum WaitState<E> {
    /// Still polling.
    Waiting {
        /// Status reads performed so far.
        reads: u32,
        /// Most recent read failure, if any.
        last_error: Option<E>,
    },
    /// The target was observed.
    Converged {
        /// Status reads performed.
        reads: u32,
        /// Final representation; `None` when the target is absence.
        representation: Option<InstanceRepresentation>,
    },
    /// The instance entered a state it cannot leave towards the target.
    Failed {
        /// Status reads performed.
        reads: u32,
        /// Representation carrying the terminal status.
        representation: InstanceRepresentation,
    },
    /// The deadline passed before the target was observed.
    TimedOut {
        /// Status reads performed.
        reads: u32,
        /// Most recent read failure, if any.
        last_error: Option<E>,
    },
}

impl<E> Default for WaitState<E> {
    fn default() -> Self {
        Self::Waiting {
            reads: 0,
            last_error: None,
        }
    }
}

impl<E> WaitState<E> {
    /// Applies one status read. Only [`WaitState::Waiting`] reacts.
    ///
    /// `Ok(None)` means the instance was not found.
    #[must_use]
    pub fn observe(
        self,
        target: ConvergenceTarget,
        read: Result<Option<InstanceRepresentation>, E>,
    ) -> Self {
        let Self::Waiting { reads, last_error } = self else {
            return self;
        };
        let count = reads.saturating_add(1);
        match (target, read) {
            (_, Err(err)) => Self::Waiting {
                reads: count,
                last_error: Some(err),
            },
            (ConvergenceTarget::Absent, Ok(None)) => Self::Converged {
                reads: count,
                representation: None,
            },
            (ConvergenceTarget::Active, Ok(Some(instance)))
                if instance.status == InstanceStatus::Active =>
            {
                Self::Converged {
                    reads: count,
                    representation: Some(instance),
                }
            }
            (ConvergenceTarget::Active, Ok(Some(instance)))
                if instance.status == InstanceStatus::Error =>
            {
                Self::Failed {
                    reads: count,
                    representation: instance,
                }
            }
            (_, Ok(_)) => Self::Waiting {
                reads: count,
                last_error,
            },
        }
    }

    /// Moves a waiting state to [`WaitState::TimedOut`].
    #[must_use]
    pub fn expire(self) -> Self {
        match self {
            Self::Waiting { reads, last_error } => Self::TimedOut { reads, last_error },
            other => other,
        }
    }

    /// Returns `true` while the waiter should keep polling.
    #[must_use]
    pub const fn is_waiting(&self) -> bool {
        matches!(self, Self::Waiting { .. })
    }

    /// Number of status reads performed.
    #[must_use]
    pub const fn reads(&self) -> u32 {
        match self {
            Self::Waiting { reads, .. }
            | Self::Converged { reads, .. }
            | Self::Failed { reads, .. }
            | Self::TimedOut { reads, .. } => *reads,
        }
    }
}

/// Terminal wait failures.
#[derive(Debug, Error)]
pub enum WaitError<E>
where
    E: std::error::Error + 'static,
{
    /// The deadline passed; recoverable by waiting again.
    #[error(
        "instance {instance_id} did not become {target} within {elapsed:?} ({reads} status reads)"
    )]
    TimedOut {
        /// Instance being waited on.
        instance_id: String,
        /// Target state.
        target: ConvergenceTarget,
        /// Time spent waiting.
        elapsed: Duration,
        /// Status reads performed.
        reads: u32,
        /// Most recent read failure, if any.
        last_error: Option<E>,
    },
    /// The instance reported a status it cannot converge from.
    #[error("instance {instance_id} reported status {status} while waiting for {target}")]
    Failed {
        /// Instance being waited on.
        instance_id: String,
        /// Terminal status observed.
        status: InstanceStatus,
        /// Target state.
        target: ConvergenceTarget,
    },
}

/// Polls a status read until convergence or a deadline.
#[derive(Clone, Debug)]
pub struct ConvergenceWaiter<C = TokioClock> {
    clock: C,
    poll_interval: Duration,
    error_backoff: Duration,
}

impl Default for ConvergenceWaiter<TokioClock> {
    fn default() -> Self {
        Self::new(TokioClock)
    }
}

impl<C: Clock> ConvergenceWaiter<C> {
    /// Creates a waiter with default intervals over `clock`.
    #[must_use]
    pub const fn new(clock: C) -> Self {
        Self {
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        }
    }

    /// Sets the delay between successful reads.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the delay after a failed read.
    #[must_use]
    pub const fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Returns the delay between successful reads.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Returns the delay after a failed read.
    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        self.error_backoff
    }

    /// Polls `read` until `instance_id` reaches `target` or `timeout` elapses.
    ///
    /// `read` resolves to `Ok(None)` when the instance does not exist. The
    /// first read happens immediately; the last happens at the deadline. A
    /// `timeout` too large to represent as an instant waits without limit.
    ///
    /// # Errors
    ///
    /// Returns [`WaitError::TimedOut`] when the deadline passes and
    /// [`WaitError::Failed`] when the instance reports `error` while waiting
    /// for [`ConvergenceTarget::Active`].
    pub async fn wait_for<E, F, Fut>(
        &self,
        instance_id: &str,
        target: ConvergenceTarget,
        timeout: Duration,
        mut read: F,
    ) -> Result<Option<InstanceRepresentation>, WaitError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<InstanceRepresentation>, E>>,
    {
        let started = self.clock.now();
        // A budget beyond the clock's range never expires.
        let deadline = started.checked_add(timeout);
        let mut state = WaitState::default();

        loop {
            let result = read().await;
            let pause = match &result {
                Ok(instance) => {
                    debug!(
                        instance_id,
                        %target,
                        status = %instance
                            .as_ref()
                            .map_or_else(|| String::from("absent"), |found| found.status.to_string()),
                        "polled instance status"
                    );
                    self.poll_interval
                }
                Err(err) => {
                    warn!(instance_id, %target, error = %err, "status read failed; retrying");
                    self.error_backoff
                }
            };

            state = state.observe(target, result);
            let now = self.clock.now();
            if state.is_waiting() && deadline.is_some_and(|limit| now >= limit) {
                state = state.expire();
            }

            match state {
                WaitState::Waiting { .. } => {
                    let remaining =
                        deadline.map_or(pause, |limit| limit.saturating_duration_since(now));
                    self.clock.sleep(pause.min(remaining)).await;
                }
                WaitState::Converged { representation, .. } => return Ok(representation),
                WaitState::Failed { representation, .. } => {
                    return Err(WaitError::Failed {
                        instance_id: instance_id.to_owned(),
                        status: representation.status,
                        target,
                    });
                }
                WaitState::TimedOut { reads, last_error } => {
                    return Err(WaitError::TimedOut {
                        instance_id: instance_id.to_owned(),
                        target,
                        elapsed: now.saturating_duration_since(started),
                        reads,
                        last_error,
                    });
                }
            }
        }
    }
}
