//! Shared fixtures for reconcile BDD scenarios.

use std::time::Duration;

use rstest::fixture;
use serde_json::json;
use tether::test_support::{ManualClock, ScriptedComputeApi};
use tether::{
    AttachmentRecord, DesiredInstance, InstanceRepresentation, InstanceStatus, NetworkAttachment,
    ReconcileOutcome,
};

#[derive(Clone, Debug)]
pub struct ReconcileContext {
    pub api: ScriptedComputeApi,
    pub clock: ManualClock,
    pub observed: Option<InstanceRepresentation>,
    pub desired: DesiredInstance,
    pub wait: Option<Duration>,
    pub outcome: Option<ReconcileResult>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FailureKind {
    Conflict,
    Partial,
    Remote,
    Timeout,
    Convergence,
    Request,
}

#[derive(Clone, Debug)]
pub struct ReconcileFailure {
    pub kind: FailureKind,
    pub message: String,
    pub applied: Option<usize>,
    pub retryable: bool,
}

#[derive(Clone, Debug)]
pub enum ReconcileResult {
    Success(ReconcileOutcome),
    Failure(ReconcileFailure),
}

#[fixture]
pub fn reconcile_context() -> ReconcileContext {
    ReconcileContext {
        api: ScriptedComputeApi::new(),
        clock: ManualClock::new(),
        observed: None,
        desired: base_desired(),
        wait: None,
        outcome: None,
    }
}

pub fn base_desired() -> DesiredInstance {
    DesiredInstance::new()
        .attribute("name", json!("web-1"))
        .attribute("image_id", json!("img-a"))
        .attachment(NetworkAttachment::new("net-a").primary(true))
}

/// Instance `srv-1` with a primary interface on `net-a` and `fip-1` bound to
/// its interface on `net-c`.
pub fn existing_instance() -> InstanceRepresentation {
    InstanceRepresentation {
        id: String::from("srv-1"),
        status: InstanceStatus::Active,
        fields: [
            (String::from("name"), json!("web-1")),
            (String::from("image_id"), json!("img-a")),
            (String::from("access_ipv4"), json!("10.0.0.4")),
        ]
        .into_iter()
        .collect(),
        attachments: vec![
            AttachmentRecord::from(NetworkAttachment::new("net-a").primary(true)),
            AttachmentRecord::from(NetworkAttachment::new("net-c").public_address("fip-1")),
        ],
    }
}
