//! Unit tests for the reconciler against the scripted API.

use std::time::Duration;

use rstest::{fixture, rstest};
use serde_json::json;

use super::*;
use crate::attachment::{AttachmentRecord, NetworkAttachment};
use crate::remote::{Fields, InstanceStatus};
use crate::test_support::{
    ApiCall, CallKind, ManualClock, ReadScript, ScriptedApiError, ScriptedComputeApi,
};

type TestReconciler = Reconciler<ScriptedComputeApi, ManualClock>;

#[fixture]
fn observed() -> InstanceRepresentation {
    let fields: Fields = [
        ("name", json!("web-1")),
        ("image_id", json!("img-a")),
        ("key_pair", json!("deploy")),
        ("access_ipv4", json!("10.0.0.4")),
    ]
    .into_iter()
    .map(|(name, value)| (name.to_owned(), value))
    .collect();

    InstanceRepresentation {
        id: String::from("srv-1"),
        status: InstanceStatus::Active,
        fields,
        attachments: vec![
            AttachmentRecord::from(NetworkAttachment::new("net-a").primary(true)),
            AttachmentRecord::from(NetworkAttachment::new("net-c").public_address("fip-1")),
        ],
    }
}

fn base_desired() -> DesiredInstance {
    DesiredInstance::new()
        .attribute("name", json!("web-1"))
        .attribute("image_id", json!("img-a"))
        .attachment(NetworkAttachment::new("net-a").primary(true))
}

fn reconciler(api: &ScriptedComputeApi, clock: &ManualClock) -> TestReconciler {
    let planner = Planner::compute_instance().expect("built-in schema");
    Reconciler::new(api.clone(), planner).with_waiter(ConvergenceWaiter::new(clock.clone()))
}

fn seeded(observed: &InstanceRepresentation) -> (ScriptedComputeApi, ManualClock) {
    (
        ScriptedComputeApi::new().with_instance(observed.clone()),
        ManualClock::new(),
    )
}

#[rstest]
#[tokio::test]
async fn matching_configuration_makes_no_calls(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let desired =
        base_desired().attachment(NetworkAttachment::new("net-c").public_address("fip-1"));

    let outcome = reconciler(&api, &clock)
        .reconcile(ReconcileRequest::update(desired, observed.clone()))
        .await
        .unwrap_or_else(|err| panic!("reconcile failed: {err}"));

    assert_eq!(outcome, ReconcileOutcome::Unchanged(observed));
    assert!(api.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn deletions_run_before_creations(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let desired =
        base_desired().attachment(NetworkAttachment::new("net-b").public_address("fip-2"));

    let outcome = reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .unwrap_or_else(|err| panic!("update failed: {err}"));

    assert_eq!(
        api.mutating_calls(),
        vec![
            "disassociate fip-1",
            "detach net-c",
            "attach net-b",
            "associate fip-2 net-b",
        ]
    );
    let ReconcileOutcome::Updated(instance) = outcome else {
        panic!("expected update outcome");
    };
    let networks = instance
        .attachments
        .iter()
        .map(|record| record.spec.network_id.as_str())
        .collect::<Vec<_>>();
    assert_eq!(networks, vec!["net-a", "net-b"]);
}

#[rstest]
#[tokio::test]
async fn public_address_swap_releases_before_binding(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let desired =
        base_desired().attachment(NetworkAttachment::new("net-c").public_address("fip-2"));

    reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .unwrap_or_else(|err| panic!("update failed: {err}"));

    assert_eq!(
        api.mutating_calls(),
        vec!["disassociate fip-1", "associate fip-2 net-c"]
    );
}

#[rstest]
#[tokio::test]
async fn port_changes_use_a_single_patch(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let desired = DesiredInstance::new()
        .attachment(
            NetworkAttachment::new("net-a")
                .primary(true)
                .fixed_ip("10.0.0.9")
                .security_group("web"),
        )
        .attachment(NetworkAttachment::new("net-c").public_address("fip-1"));

    reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .unwrap_or_else(|err| panic!("update failed: {err}"));

    let patches = api
        .calls()
        .into_iter()
        .filter(|call| call.kind() == CallKind::UpdateAttachment)
        .collect::<Vec<_>>();
    assert_eq!(patches.len(), 1);
    let Some(ApiCall::UpdateAttachment { patch, .. }) = patches.first() else {
        panic!("expected an attachment patch");
    };
    assert_eq!(patch.fixed_ip, Some(Some(String::from("10.0.0.9"))));
    assert!(patch.security_groups.is_some());
}

#[rstest]
#[tokio::test]
async fn only_changed_fields_are_sent(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let desired = base_desired()
        .attribute("name", json!("web-2"))
        .attribute("key_pair", json!("ignored-after-create"))
        .attachment(NetworkAttachment::new("net-c").public_address("fip-1"));

    reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .unwrap_or_else(|err| panic!("update failed: {err}"));

    let expected: Fields = [(String::from("name"), json!("web-2"))].into_iter().collect();
    assert_eq!(
        api.calls(),
        vec![ApiCall::Update {
            id: String::from("srv-1"),
            fields: expected,
        }]
    );
}

#[rstest]
#[tokio::test]
async fn immutable_conflict_aborts_before_remote_calls(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let desired = base_desired()
        .attribute("image_id", json!("img-b"))
        .attachment(NetworkAttachment::new("net-z"));

    let err = reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .expect_err("conflict expected");

    assert!(matches!(err, ReconcileError::Plan(PlanError::Conflict(_))));
    assert!(api.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn failing_attachment_step_reports_partial_progress(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    api.fail_after(CallKind::Attach, 0);
    let desired = base_desired()
        .attribute("name", json!("web-2"))
        .attachment(NetworkAttachment::new("net-b"));

    let err = reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .expect_err("attach failure expected");

    match err {
        ReconcileError::PartialUpdate {
            instance_id,
            step,
            applied,
            source,
            ..
        } => {
            assert_eq!(instance_id, "srv-1");
            assert_eq!(
                step,
                Step::Attach {
                    network_id: String::from("net-b")
                }
            );
            assert_eq!(applied, 2);
            assert_eq!(
                source,
                ScriptedApiError::Failure {
                    call: CallKind::Attach
                }
            );
        }
        other => panic!("expected partial update, got {other:?}"),
    }
    assert!(
        !api.mutating_calls().iter().any(|call| call.starts_with("update")),
        "field update must not run after a failed attachment step"
    );
}

#[rstest]
#[tokio::test]
async fn partial_update_carries_the_state_reached(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    api.fail_after(CallKind::Attach, 0);
    let desired = base_desired()
        .attribute("name", json!("web-2"))
        .attachment(NetworkAttachment::new("net-b"));
    let subject = reconciler(&api, &clock);

    let err = subject
        .update(&desired, &observed, None)
        .await
        .expect_err("attach failure expected");
    let reached = err.instance().cloned().expect("state after partial update");
    let networks: Vec<_> = reached
        .attachments
        .iter()
        .map(|record| record.spec.network_id.as_str())
        .collect();
    assert_eq!(networks, vec!["net-a"]);
    assert_eq!(reached.fields.get("key_pair"), Some(&json!("deploy")));

    api.fail_after(CallKind::Attach, usize::MAX);
    subject
        .update(&desired, &reached, None)
        .await
        .unwrap_or_else(|err| panic!("rerun failed: {err}"));
    let detaches = api
        .mutating_calls()
        .iter()
        .filter(|call| call.starts_with("detach"))
        .count();
    assert_eq!(detaches, 1, "rerun must not detach net-c again");
}

#[rstest]
#[tokio::test]
async fn write_only_fields_reach_observed_state(observed: InstanceRepresentation) {
    let api = ScriptedComputeApi::new()
        .with_instance(observed.clone())
        .with_write_only(["admin_password"]);
    let clock = ManualClock::new();
    let desired = base_desired()
        .attribute("admin_password", json!("s3cret"))
        .attachment(NetworkAttachment::new("net-c").public_address("fip-1"));
    let subject = reconciler(&api, &clock);

    let first = subject
        .update(&desired, &observed, None)
        .await
        .unwrap_or_else(|err| panic!("update failed: {err}"));
    let ReconcileOutcome::Updated(recorded) = first else {
        panic!("expected update outcome");
    };
    assert_eq!(recorded.fields.get("admin_password"), Some(&json!("s3cret")));

    let second = subject
        .update(&desired, &recorded, None)
        .await
        .unwrap_or_else(|err| panic!("second update failed: {err}"));
    assert!(matches!(second, ReconcileOutcome::Unchanged(_)));
    assert_eq!(api.mutating_calls(), vec!["update srv-1"]);
}

#[rstest]
#[tokio::test]
async fn first_step_failure_is_a_remote_error(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    api.fail_after(CallKind::Update, 0);
    let desired = base_desired()
        .attribute("name", json!("web-2"))
        .attachment(NetworkAttachment::new("net-c").public_address("fip-1"));

    let err = reconciler(&api, &clock)
        .update(&desired, &observed, None)
        .await
        .expect_err("update failure expected");

    assert!(matches!(
        err,
        ReconcileError::Remote {
            step: Step::Update,
            ..
        }
    ));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn create_binds_addresses_and_waits_for_active() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    api.script_reads([
        ReadScript::Status(InstanceStatus::Pending),
        ReadScript::Status(InstanceStatus::Pending),
        ReadScript::Status(InstanceStatus::Active),
    ]);
    let desired =
        base_desired().attachment(NetworkAttachment::new("net-b").public_address("fip-9"));

    let outcome = reconciler(&api, &clock)
        .reconcile(ReconcileRequest::create(desired).wait(Duration::from_secs(300)))
        .await
        .unwrap_or_else(|err| panic!("create failed: {err}"));

    let ReconcileOutcome::Created(instance) = outcome else {
        panic!("expected create outcome");
    };
    assert_eq!(instance.status, InstanceStatus::Active);
    assert_eq!(api.mutating_calls(), vec!["create", "associate fip-9 net-b"]);
    let reads = api
        .calls()
        .iter()
        .filter(|call| call.kind() == CallKind::Read)
        .count();
    assert_eq!(reads, 3);
    assert_eq!(clock.elapsed(), Duration::from_secs(10));
}

#[tokio::test]
async fn create_without_wait_returns_pending_instance() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    let desired = base_desired()
        .attribute("access_ipv4", json!("203.0.113.5"))
        .attachment(NetworkAttachment::new("net-b").public_address("fip-9"));

    let outcome = reconciler(&api, &clock)
        .create(&desired, None)
        .await
        .unwrap_or_else(|err| panic!("create failed: {err}"));

    let ReconcileOutcome::Created(instance) = outcome else {
        panic!("expected create outcome");
    };
    assert_eq!(instance.status, InstanceStatus::Pending);
    assert!(!instance.fields.contains_key("access_ipv4"));
    let bound = instance
        .attachments
        .iter()
        .find(|record| record.spec.network_id == "net-b")
        .and_then(|record| record.spec.public_address.clone());
    assert_eq!(bound, Some(String::from("fip-9")));
}

#[tokio::test]
async fn create_wait_times_out_as_retryable() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();

    let err = reconciler(&api, &clock)
        .create(&base_desired(), Some(Duration::from_secs(30)))
        .await
        .expect_err("timeout expected");

    assert!(matches!(
        err,
        ReconcileError::Timeout {
            timeout_secs: 30,
            ..
        }
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn timed_out_create_is_not_created_twice() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    let subject = reconciler(&api, &clock);

    let err = subject
        .create(&base_desired(), Some(Duration::from_secs(30)))
        .await
        .expect_err("timeout expected");
    let saved = err.instance().cloned().expect("created instance");
    assert_eq!(saved.id, "srv-1");

    let outcome = subject
        .reconcile(ReconcileRequest::update(base_desired(), saved))
        .await
        .unwrap_or_else(|err| panic!("rerun failed: {err}"));

    assert!(matches!(outcome, ReconcileOutcome::Unchanged(_)));
    assert_eq!(api.mutating_calls(), vec!["create"]);
    let listed = subject.list().await.unwrap_or_else(|err| panic!("list: {err}"));
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn failed_address_binding_carries_created_instance() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    api.fail_after(CallKind::Associate, 0);
    let desired =
        base_desired().attachment(NetworkAttachment::new("net-b").public_address("fip-9"));

    let err = reconciler(&api, &clock)
        .create(&desired, None)
        .await
        .expect_err("associate failure expected");

    assert!(matches!(
        err,
        ReconcileError::PartialUpdate { applied: 1, .. }
    ));
    let created = err.instance().expect("created instance");
    assert_eq!(created.id, "srv-1");
    let bound = created
        .attachments
        .iter()
        .find(|record| record.spec.network_id == "net-b")
        .and_then(|record| record.spec.public_address.clone());
    assert_eq!(bound, None);
}

#[tokio::test]
async fn oversized_wait_budget_does_not_overflow() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    api.script_reads([ReadScript::Status(InstanceStatus::Active)]);

    let outcome = reconciler(&api, &clock)
        .create(&base_desired(), Some(Duration::from_secs(u64::MAX)))
        .await
        .unwrap_or_else(|err| panic!("create failed: {err}"));

    let instance = outcome.representation().expect("created instance");
    assert_eq!(instance.status, InstanceStatus::Active);
}

#[tokio::test]
async fn error_status_fails_convergence() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    api.script_reads([ReadScript::Status(InstanceStatus::Error)]);

    let err = reconciler(&api, &clock)
        .create(&base_desired(), Some(Duration::from_secs(300)))
        .await
        .expect_err("convergence failure expected");

    assert!(matches!(
        err,
        ReconcileError::ConvergenceFailed {
            status: InstanceStatus::Error,
            ..
        }
    ));
}

#[rstest]
#[tokio::test]
async fn deleting_a_missing_instance_succeeds(observed: InstanceRepresentation) {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();

    let outcome = reconciler(&api, &clock)
        .reconcile(ReconcileRequest::delete(observed).wait(Duration::from_secs(60)))
        .await
        .unwrap_or_else(|err| panic!("delete failed: {err}"));

    assert_eq!(outcome, ReconcileOutcome::Deleted);
    assert_eq!(api.mutating_calls(), vec!["delete srv-1"]);
}

#[rstest]
#[tokio::test]
async fn delete_waits_until_absent(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    api.script_reads([
        ReadScript::Status(InstanceStatus::Deleting),
        ReadScript::Status(InstanceStatus::Deleting),
    ]);

    let outcome = reconciler(&api, &clock)
        .delete(&observed, Some(Duration::from_secs(60)))
        .await
        .unwrap_or_else(|err| panic!("delete failed: {err}"));

    assert_eq!(outcome, ReconcileOutcome::Deleted);
    assert!(api.instance("srv-1").is_none());
    assert_eq!(clock.elapsed(), Duration::from_secs(10));
}

#[rstest]
#[case::missing_desired(
    ReconcileRequest {
        operation: Operation::Update,
        desired: None,
        observed: None,
        wait: false,
        timeout: DEFAULT_WAIT_TIMEOUT,
    },
    "desired configuration"
)]
#[case::missing_observed(
    ReconcileRequest {
        operation: Operation::Delete,
        desired: None,
        observed: None,
        wait: false,
        timeout: DEFAULT_WAIT_TIMEOUT,
    },
    "observed state"
)]
#[tokio::test]
async fn incomplete_requests_are_rejected(
    #[case] request: ReconcileRequest,
    #[case] expected: &str,
) {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();

    let err = reconciler(&api, &clock)
        .reconcile(request)
        .await
        .expect_err("incomplete request");

    assert!(err.to_string().contains(expected), "unexpected error: {err}");
    assert!(api.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn refresh_reports_missing_instance_as_none(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);
    let subject = reconciler(&api, &clock);

    let found = subject
        .refresh("srv-1")
        .await
        .unwrap_or_else(|err| panic!("refresh failed: {err}"));
    let missing = subject
        .refresh("srv-404")
        .await
        .unwrap_or_else(|err| panic!("refresh failed: {err}"));

    assert_eq!(found, Some(observed));
    assert_eq!(missing, None);
}

#[tokio::test]
async fn refresh_surfaces_transient_errors() {
    let api = ScriptedComputeApi::new();
    let clock = ManualClock::new();
    api.script_reads([ReadScript::Error]);

    let err = reconciler(&api, &clock)
        .refresh("srv-1")
        .await
        .expect_err("read failure expected");

    assert!(matches!(err, ReconcileError::Remote { step: Step::Read, .. }));
    assert!(!err.is_not_found());
}

#[rstest]
#[tokio::test]
async fn list_passes_through(observed: InstanceRepresentation) {
    let (api, clock) = seeded(&observed);

    let instances = reconciler(&api, &clock)
        .list()
        .await
        .unwrap_or_else(|err| panic!("list failed: {err}"));

    assert_eq!(instances, vec![observed]);
}
