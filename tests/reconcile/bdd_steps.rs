//! BDD step definitions for the reconcile workflow.

use std::time::Duration;

use rstest_bdd_macros::{given, then, when};
use tether::test_support::{CallKind, ReadScript, ScriptedApiError, ScriptedComputeApi};
use tether::wait::ConvergenceWaiter;
use tether::{
    InstanceStatus, NetworkAttachment, Planner, ReconcileError, ReconcileRequest, Reconciler,
};
use tokio::runtime::Runtime;

use super::test_helpers::{
    FailureKind, ReconcileContext, ReconcileFailure, ReconcileResult, base_desired,
    existing_instance,
};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("an existing instance with a public address on net-c")]
fn existing_with_address(mut reconcile_context: ReconcileContext) -> ReconcileContext {
    let instance = existing_instance();
    reconcile_context.api = ScriptedComputeApi::new().with_instance(instance.clone());
    reconcile_context.observed = Some(instance);
    reconcile_context.desired =
        base_desired().attachment(NetworkAttachment::new("net-c").public_address("fip-1"));
    reconcile_context
}

#[given("no existing instance")]
fn no_existing_instance(mut reconcile_context: ReconcileContext) -> ReconcileContext {
    reconcile_context.observed = None;
    reconcile_context
}

#[given("a recorded instance that no longer exists remotely")]
fn recorded_but_gone(mut reconcile_context: ReconcileContext) -> ReconcileContext {
    reconcile_context.api = ScriptedComputeApi::new();
    reconcile_context.observed = Some(existing_instance());
    reconcile_context
}

#[given("the desired configuration replaces net-c with net-b bound to \"{address}\"")]
fn replace_network(mut reconcile_context: ReconcileContext, address: String) -> ReconcileContext {
    reconcile_context.desired =
        base_desired().attachment(NetworkAttachment::new("net-b").public_address(address));
    reconcile_context
}

#[given("the desired configuration binds \"{address}\" to net-c")]
fn bind_address(mut reconcile_context: ReconcileContext, address: String) -> ReconcileContext {
    reconcile_context.desired =
        base_desired().attachment(NetworkAttachment::new("net-c").public_address(address));
    reconcile_context
}

#[given("the desired image is \"{image}\"")]
fn desired_image(mut reconcile_context: ReconcileContext, image: String) -> ReconcileContext {
    reconcile_context.desired = reconcile_context
        .desired
        .attribute("image_id", serde_json::Value::String(image));
    reconcile_context
}

#[given("attach calls fail")]
fn attach_fails(reconcile_context: ReconcileContext) -> ReconcileContext {
    reconcile_context.api.fail_after(CallKind::Attach, 0);
    reconcile_context
}

#[given("the instance becomes active after \"{reads}\" reads")]
fn active_after(reconcile_context: ReconcileContext, reads: usize) -> ReconcileContext {
    let pending = std::iter::repeat_n(
        ReadScript::Status(InstanceStatus::Pending),
        reads.saturating_sub(1),
    );
    reconcile_context
        .api
        .script_reads(pending.chain([ReadScript::Status(InstanceStatus::Active)]));
    reconcile_context
}

#[given("the caller waits up to \"{secs}\" seconds")]
fn caller_waits(mut reconcile_context: ReconcileContext, secs: u64) -> ReconcileContext {
    reconcile_context.wait = Some(Duration::from_secs(secs));
    reconcile_context
}

#[when("I reconcile the instance")]
fn reconcile_instance(reconcile_context: ReconcileContext) -> Result<ReconcileContext, StepError> {
    let request = match reconcile_context.observed.clone() {
        Some(observed) => ReconcileRequest::update(reconcile_context.desired.clone(), observed),
        None => ReconcileRequest::create(reconcile_context.desired.clone()),
    };
    execute(reconcile_context, request)
}

#[when("I delete the instance")]
fn delete_instance(reconcile_context: ReconcileContext) -> Result<ReconcileContext, StepError> {
    let observed = reconcile_context
        .observed
        .clone()
        .ok_or_else(|| StepError::Assertion(String::from("no recorded instance")))?;
    execute(reconcile_context, ReconcileRequest::delete(observed))
}

#[then("the reconcile succeeds")]
fn reconcile_succeeds(reconcile_context: &ReconcileContext) -> Result<(), StepError> {
    match reconcile_context.outcome {
        Some(ReconcileResult::Success(_)) => Ok(()),
        Some(ReconcileResult::Failure(ref failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

#[then("the reconcile error kind is \"{kind}\"")]
fn reconcile_error_kind(reconcile_context: &ReconcileContext, kind: String) -> Result<(), StepError> {
    let expected = parse_failure_kind(&kind)?;
    let failure = failure(reconcile_context)?;
    if failure.kind == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {expected:?}, got {:?}: {}",
            failure.kind, failure.message
        )))
    }
}

#[then("\"{count}\" steps were applied before the failure")]
fn steps_applied(reconcile_context: &ReconcileContext, count: usize) -> Result<(), StepError> {
    let failure = failure(reconcile_context)?;
    if failure.applied == Some(count) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} applied steps, got {:?}",
            failure.applied
        )))
    }
}

#[then("the error is retryable")]
fn error_retryable(reconcile_context: &ReconcileContext) -> Result<(), StepError> {
    if failure(reconcile_context)?.retryable {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "expected a retryable error",
        )))
    }
}

#[then("the remote calls are \"{calls}\"")]
fn remote_calls(reconcile_context: &ReconcileContext, calls: String) -> Result<(), StepError> {
    let recorded = reconcile_context.api.mutating_calls().join("; ");
    if recorded == calls {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected calls `{calls}`, got `{recorded}`"
        )))
    }
}

#[then("no remote calls are made")]
fn no_remote_calls(reconcile_context: &ReconcileContext) -> Result<(), StepError> {
    let calls = reconcile_context.api.calls();
    if calls.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no calls, got {calls:?}"
        )))
    }
}

#[then("the instance is \"{status}\"")]
fn instance_status(reconcile_context: &ReconcileContext, status: String) -> Result<(), StepError> {
    let Some(ReconcileResult::Success(ref outcome)) = reconcile_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected success outcome",
        )));
    };
    let actual = outcome
        .representation()
        .map(|instance| instance.status.to_string());
    if actual.as_deref() == Some(status.as_str()) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected status {status}, got {actual:?}"
        )))
    }
}

#[then("\"{secs}\" seconds elapsed")]
fn seconds_elapsed(reconcile_context: &ReconcileContext, secs: u64) -> Result<(), StepError> {
    let elapsed = reconcile_context.clock.elapsed();
    if elapsed == Duration::from_secs(secs) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {secs}s of virtual time, got {elapsed:?}"
        )))
    }
}

fn execute(
    reconcile_context: ReconcileContext,
    request: ReconcileRequest,
) -> Result<ReconcileContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let planner =
        Planner::compute_instance().map_err(|err| StepError::Assertion(err.to_string()))?;
    let reconciler = Reconciler::new(reconcile_context.api.clone(), planner)
        .with_waiter(ConvergenceWaiter::new(reconcile_context.clock.clone()));
    let timed = match reconcile_context.wait {
        Some(timeout) => request.wait(timeout),
        None => request,
    };

    let result = runtime.block_on(async move { reconciler.reconcile(timed).await });
    let outcome = match result {
        Ok(outcome) => ReconcileResult::Success(outcome),
        Err(err) => ReconcileResult::Failure(ReconcileFailure {
            kind: map_failure_kind(&err),
            message: err.to_string(),
            applied: applied_steps(&err),
            retryable: err.is_retryable(),
        }),
    };

    Ok(ReconcileContext {
        outcome: Some(outcome),
        ..reconcile_context
    })
}

fn failure(reconcile_context: &ReconcileContext) -> Result<&ReconcileFailure, StepError> {
    match reconcile_context.outcome {
        Some(ReconcileResult::Failure(ref failure)) => Ok(failure),
        _ => Err(StepError::Assertion(String::from(
            "expected failure outcome",
        ))),
    }
}

const fn map_failure_kind(err: &ReconcileError<ScriptedApiError>) -> FailureKind {
    match err {
        ReconcileError::Plan(_) => FailureKind::Conflict,
        ReconcileError::PartialUpdate { .. } => FailureKind::Partial,
        ReconcileError::Remote { .. } => FailureKind::Remote,
        ReconcileError::Timeout { .. } => FailureKind::Timeout,
        ReconcileError::ConvergenceFailed { .. } => FailureKind::Convergence,
        ReconcileError::MissingDesiredConfiguration { .. }
        | ReconcileError::MissingObservedState { .. } => FailureKind::Request,
    }
}

const fn applied_steps(err: &ReconcileError<ScriptedApiError>) -> Option<usize> {
    match err {
        ReconcileError::PartialUpdate { applied, .. } => Some(*applied),
        _ => None,
    }
}

fn parse_failure_kind(kind: &str) -> Result<FailureKind, StepError> {
    match kind {
        "conflict" => Ok(FailureKind::Conflict),
        "partial" => Ok(FailureKind::Partial),
        "remote" => Ok(FailureKind::Remote),
        "timeout" => Ok(FailureKind::Timeout),
        "convergence" => Ok(FailureKind::Convergence),
        "request" => Ok(FailureKind::Request),
        _ => Err(StepError::Assertion(format!(
            "unknown failure kind: {kind}"
        ))),
    }
}
