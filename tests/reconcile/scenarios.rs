//! BDD scenarios for the reconcile workflow.

use rstest_bdd_macros::scenario;

use super::test_helpers::{ReconcileContext, reconcile_context};

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Replace a network and its public address"
)]
fn scenario_replace_network(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Swap the public address of an existing attachment"
)]
fn scenario_swap_public_address(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Reject a change to an immutable attribute"
)]
fn scenario_reject_immutable_change(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Report partial progress when an attachment step fails"
)]
fn scenario_partial_progress(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Create waits for the instance to become active"
)]
fn scenario_create_waits(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Create times out while the instance stays pending"
)]
fn scenario_create_times_out(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}

#[scenario(
    path = "tests/features/reconcile.feature",
    name = "Deleting an instance that is already gone succeeds"
)]
fn scenario_delete_missing(reconcile_context: ReconcileContext) {
    drop(reconcile_context);
}
