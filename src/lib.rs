//! Core library for the Tether instance reconciler.
//!
//! The crate plans and applies changes to a remote compute instance and its
//! network attachments: per-attribute policies decide what a caller may
//! change, the attachment differ works out which interfaces to add, remove,
//! or patch in place, and the reconciler sequences the remote calls and
//! optionally waits for the instance to converge.

pub mod attachment;
pub mod config;
pub mod plan;
pub mod policy;
pub mod reconcile;
pub mod remote;
pub mod rest;
pub mod state_store;
pub mod test_support;
pub mod wait;

pub use attachment::{
    AttachmentChangeSet, AttachmentDelta, AttachmentRecord, DiffError, NetworkAttachment,
    PortPatch, TopologyKeyed, diff,
};
pub use config::{ApiConfig, ConfigError};
pub use plan::{DesiredDocument, DesiredInstance, Plan, PlanError, PlanReport, Planner};
pub use policy::{AttributeRegistry, AttributeValue, PlannedValue, Policy, PolicyConflict};
pub use reconcile::{
    ReconcileError, ReconcileOutcome, ReconcileRequest, Reconciler, DEFAULT_WAIT_TIMEOUT,
};
pub use remote::{ApiError, ComputeApi, Fields, InstanceRepresentation, InstanceStatus};
pub use rest::{RestApiError, RestComputeApi};
pub use state_store::{FileStateStore, StateStore, StateStoreError};
pub use wait::{ConvergenceTarget, ConvergenceWaiter, WaitError};
