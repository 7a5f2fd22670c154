//! Errors surfaced by the reconciler.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::plan::PlanError;
use crate::remote::{ApiError, InstanceRepresentation, InstanceStatus};
use crate::wait::{ConvergenceTarget, WaitError};

/// Lifecycle operation requested by the caller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Operation {
    /// Provision a new instance.
    Create,
    /// Converge an existing instance.
    Update,
    /// Remove an existing instance.
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// Remote call issued by the reconciler, named in logs and errors.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Step {
    /// Instance creation.
    Create,
    /// Instance read.
    Read,
    /// Top-level field update.
    Update,
    /// Instance deletion.
    Delete,
    /// Instance listing.
    List,
    /// Interface creation on a network.
    Attach {
        /// Network attached to.
        network_id: String,
    },
    /// Interface removal from a network.
    Detach {
        /// Network detached from.
        network_id: String,
    },
    /// In-place interface update.
    UpdateAttachment {
        /// Network of the interface.
        network_id: String,
    },
    /// Public address binding.
    Associate {
        /// Address bound.
        address_id: String,
        /// Network of the interface.
        network_id: String,
    },
    /// Public address release.
    Disassociate {
        /// Address released.
        address_id: String,
    },
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => f.write_str("create"),
            Self::Read => f.write_str("read"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
            Self::List => f.write_str("list"),
            Self::Attach { network_id } => write!(f, "attach to {network_id}"),
            Self::Detach { network_id } => write!(f, "detach from {network_id}"),
            Self::UpdateAttachment { network_id } => {
                write!(f, "update interface on {network_id}")
            }
            Self::Associate {
                address_id,
                network_id,
            } => write!(f, "associate {address_id} on {network_id}"),
            Self::Disassociate { address_id } => write!(f, "disassociate {address_id}"),
        }
    }
}

/// Errors surfaced while reconciling an instance.
#[derive(Debug, Error)]
pub enum ReconcileError<E>
where
    E: ApiError,
{
    /// Planning failed; no remote call was made.
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),
    /// The operation needs a desired configuration the request lacks.
    #[error("{operation} requires a desired configuration")]
    MissingDesiredConfiguration {
        /// Requested operation.
        operation: Operation,
    },
    /// The operation needs observed state the request lacks.
    #[error("{operation} requires the observed state of an existing instance")]
    MissingObservedState {
        /// Requested operation.
        operation: Operation,
    },
    /// A remote call failed before anything was changed.
    #[error("remote {step} failed: {source}")]
    Remote {
        /// Failing call.
        step: Step,
        /// Provider-specific error.
        #[source]
        source: E,
    },
    /// A remote call failed after earlier steps were applied. Nothing is
    /// rolled back.
    #[error("instance {instance_id}: {step} failed after {applied} applied steps: {source}")]
    PartialUpdate {
        /// Instance being changed.
        instance_id: String,
        /// Failing call.
        step: Step,
        /// Steps that completed before the failure.
        applied: usize,
        /// Provider-specific error.
        #[source]
        source: E,
        /// Best known representation after the applied steps.
        instance: Option<Box<InstanceRepresentation>>,
    },
    /// The instance did not converge before the deadline.
    #[error("instance {instance_id} did not become {target} within {timeout_secs}s")]
    Timeout {
        /// Instance being waited on.
        instance_id: String,
        /// Target state.
        target: ConvergenceTarget,
        /// Wait budget in seconds.
        timeout_secs: u64,
        /// Most recent status read failure, if any.
        last_error: Option<E>,
        /// Representation of the instance that was waited on.
        instance: Option<Box<InstanceRepresentation>>,
    },
    /// The instance reported a status it cannot converge from.
    #[error("instance {instance_id} reported status {status} while waiting for {target}")]
    ConvergenceFailed {
        /// Instance being waited on.
        instance_id: String,
        /// Terminal status observed.
        status: InstanceStatus,
        /// Target state.
        target: ConvergenceTarget,
        /// Representation of the instance that was waited on.
        instance: Option<Box<InstanceRepresentation>>,
    },
}

impl<E: ApiError> ReconcileError<E> {
    /// Returns `true` when repeating the request may succeed without any
    /// change on the caller's side.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns `true` when a remote call reported a missing resource.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Remote { source, .. } | Self::PartialUpdate { source, .. } => {
                source.is_not_found()
            }
            _ => false,
        }
    }

    /// Returns the representation of an instance that exists remotely even
    /// though the request failed. Callers persist it so that a retry plans
    /// against the instance instead of creating another one.
    #[must_use]
    pub fn instance(&self) -> Option<&InstanceRepresentation> {
        match self {
            Self::PartialUpdate { instance, .. }
            | Self::Timeout { instance, .. }
            | Self::ConvergenceFailed { instance, .. } => instance.as_deref(),
            _ => None,
        }
    }

    pub(super) fn with_instance(mut self, representation: InstanceRepresentation) -> Self {
        if let Self::PartialUpdate { instance, .. }
        | Self::Timeout { instance, .. }
        | Self::ConvergenceFailed { instance, .. } = &mut self
        {
            *instance = Some(Box::new(representation));
        }
        self
    }

    pub(super) fn from_wait(err: WaitError<E>, timeout: Duration) -> Self {
        match err {
            WaitError::TimedOut {
                instance_id,
                target,
                last_error,
                ..
            } => Self::Timeout {
                instance_id,
                target,
                timeout_secs: timeout.as_secs(),
                last_error,
                instance: None,
            },
            WaitError::Failed {
                instance_id,
                status,
                target,
            } => Self::ConvergenceFailed {
                instance_id,
                status,
                target,
                instance: None,
            },
        }
    }
}
