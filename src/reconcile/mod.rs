//! Lifecycle orchestration for compute instances.
//!
//! The [`Reconciler`] plans each request, then issues remote calls in a fixed
//! order: attachment deletions, attachment creations, in-place attachment
//! updates, and finally a single top-level field update. When the caller asks
//! for synchronous behaviour, the [`ConvergenceWaiter`] polls until the
//! instance is active (or gone, for deletes).

mod error;

use std::time::Duration;

use tracing::{info, warn};

use crate::plan::{DesiredInstance, Plan, PlanError, Planner};
use crate::remote::{ApiError, ApiFuture, ComputeApi, Fields, InstanceRepresentation};
use crate::wait::{Clock, ConvergenceTarget, ConvergenceWaiter, TokioClock};

pub use error::{Operation, ReconcileError, Step};

/// Default wait budget for synchronous requests.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(300);

/// A single reconciliation request.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconcileRequest {
    /// Requested lifecycle operation.
    pub operation: Operation,
    /// Target configuration; required for create and update.
    pub desired: Option<DesiredInstance>,
    /// Last recorded state; required for update and delete.
    pub observed: Option<InstanceRepresentation>,
    /// Whether to wait for convergence before returning.
    pub wait: bool,
    /// Wait budget when `wait` is set.
    pub timeout: Duration,
}

impl ReconcileRequest {
    /// Requests creation of `desired`.
    #[must_use]
    pub const fn create(desired: DesiredInstance) -> Self {
        Self {
            operation: Operation::Create,
            desired: Some(desired),
            observed: None,
            wait: false,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Requests convergence of `observed` towards `desired`.
    #[must_use]
    pub const fn update(desired: DesiredInstance, observed: InstanceRepresentation) -> Self {
        Self {
            operation: Operation::Update,
            desired: Some(desired),
            observed: Some(observed),
            wait: false,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Requests removal of `observed`.
    #[must_use]
    pub const fn delete(observed: InstanceRepresentation) -> Self {
        Self {
            operation: Operation::Delete,
            desired: None,
            observed: Some(observed),
            wait: false,
            timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }

    /// Waits up to `timeout` for convergence before returning.
    #[must_use]
    pub fn wait(mut self, timeout: Duration) -> Self {
        self.wait = true;
        self.timeout = timeout;
        self
    }

    fn wait_budget(&self) -> Option<Duration> {
        self.wait.then_some(self.timeout)
    }
}

/// Result of a successful reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub enum ReconcileOutcome {
    /// A new instance was created.
    Created(InstanceRepresentation),
    /// An existing instance was changed.
    Updated(InstanceRepresentation),
    /// Nothing needed to change.
    Unchanged(InstanceRepresentation),
    /// The instance was removed.
    Deleted,
}

impl ReconcileOutcome {
    /// Returns the representation to persist as the new observed state, or
    /// `None` when the instance is gone.
    #[must_use]
    pub const fn representation(&self) -> Option<&InstanceRepresentation> {
        match self {
            Self::Created(instance) | Self::Updated(instance) | Self::Unchanged(instance) => {
                Some(instance)
            }
            Self::Deleted => None,
        }
    }
}

/// Sequences remote calls for one instance at a time.
#[derive(Clone, Debug)]
pub struct Reconciler<A, C = TokioClock> {
    api: A,
    planner: Planner,
    waiter: ConvergenceWaiter<C>,
}

impl<A: ComputeApi> Reconciler<A, TokioClock> {
    /// Creates a reconciler using the production waiter.
    #[must_use]
    pub fn new(api: A, planner: Planner) -> Self {
        Self {
            api,
            planner,
            waiter: ConvergenceWaiter::default(),
        }
    }
}

impl<A, C> Reconciler<A, C>
where
    A: ComputeApi,
    C: Clock,
{
    /// Replaces the convergence waiter.
    #[must_use]
    pub fn with_waiter<D: Clock>(self, waiter: ConvergenceWaiter<D>) -> Reconciler<A, D> {
        Reconciler {
            api: self.api,
            planner: self.planner,
            waiter,
        }
    }

    /// Returns the remote API handle.
    #[must_use]
    pub const fn api(&self) -> &A {
        &self.api
    }

    /// Computes the plan for `desired` without calling the remote API.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError`] on policy conflicts or malformed attachment
    /// lists.
    pub fn plan(
        &self,
        desired: &DesiredInstance,
        observed: Option<&InstanceRepresentation>,
    ) -> Result<Plan, PlanError> {
        self.planner.plan(desired, observed)
    }

    /// Executes a request.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when the request is incomplete, planning
    /// fails, a remote call fails, or the instance does not converge.
    pub async fn reconcile(
        &self,
        request: ReconcileRequest,
    ) -> Result<ReconcileOutcome, ReconcileError<A::Error>> {
        let wait = request.wait_budget();
        let operation = request.operation;
        match operation {
            Operation::Create => {
                let desired = request
                    .desired
                    .ok_or(ReconcileError::MissingDesiredConfiguration { operation })?;
                self.create(&desired, wait).await
            }
            Operation::Update => {
                let desired = request
                    .desired
                    .ok_or(ReconcileError::MissingDesiredConfiguration { operation })?;
                let observed = request
                    .observed
                    .ok_or(ReconcileError::MissingObservedState { operation })?;
                self.update(&desired, &observed, wait).await
            }
            Operation::Delete => {
                let observed = request
                    .observed
                    .ok_or(ReconcileError::MissingObservedState { operation })?;
                self.delete(&observed, wait).await
            }
        }
    }

    /// Creates an instance, binds requested public addresses, and optionally
    /// waits for it to become active.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError`] when planning, a remote call, or the wait
    /// fails.
    pub async fn create(
        &self,
        desired: &DesiredInstance,
        wait: Option<Duration>,
    ) -> Result<ReconcileOutcome, ReconcileError<A::Error>> {
        let plan = self.planner.plan(desired, None)?;
        let fields = plan.known_fields();
        info!(
            attachments = plan.attachments.len(),
            unresolved = plan.unresolved().count(),
            "creating instance"
        );
        let response = self
            .api
            .create(&fields, &plan.attachments)
            .await
            .map_err(|source| ReconcileError::Remote {
                step: Step::Create,
                source,
            })?;
        let mut created = fill_missing(response, &fields);

        let mut progress = Progress::started(&created.id);
        for attachment in &plan.attachments {
            let Some(address_id) = &attachment.public_address else {
                continue;
            };
            let step = Step::Associate {
                address_id: address_id.clone(),
                network_id: attachment.network_id.clone(),
            };
            let bound = progress
                .run(
                    step,
                    self.api
                        .associate(address_id, &created.id, &attachment.network_id),
                )
                .await;
            if let Err(err) = bound {
                return Err(err.with_instance(created));
            }
            if let Some(record) = created
                .attachments
                .iter_mut()
                .find(|record| record.spec.network_id == attachment.network_id)
            {
                record.spec.public_address = Some(address_id.clone());
            }
        }

        let converged = match wait {
            Some(timeout) => {
                let waited = self.await_active(&created.id, timeout).await;
                match waited {
                    Ok(found) => found,
                    Err(err) => return Err(err.with_instance(created)),
                }
            }
            None => None,
        };
        let instance = converged.map_or(created, |found| fill_missing(found, &fields));
        info!(instance_id = %instance.id, status = %instance.status, "instance created");
        Ok(ReconcileOutcome::Created(instance))
    }

    /// Converges an existing instance towards `desired`.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Plan`] before any remote call on conflicts,
    /// [`ReconcileError::Remote`] when the first remote call fails,
    /// [`ReconcileError::PartialUpdate`] when a later call fails, and wait
    /// errors when convergence is requested.
    pub async fn update(
        &self,
        desired: &DesiredInstance,
        observed: &InstanceRepresentation,
        wait: Option<Duration>,
    ) -> Result<ReconcileOutcome, ReconcileError<A::Error>> {
        let plan = self.planner.plan(desired, Some(observed))?;
        let id = observed.id.as_str();
        if plan.is_noop(&observed.fields) {
            info!(instance_id = id, "instance already matches desired configuration");
            return Ok(ReconcileOutcome::Unchanged(observed.clone()));
        }

        let mut progress = Progress::new(id);
        let applied = self.apply_plan(&plan, observed, &mut progress).await;
        let updated = match applied {
            Ok(instance) => fill_missing(instance, &plan.known_fields()),
            Err(err @ ReconcileError::PartialUpdate { .. }) => {
                return Err(self.with_current_state(err, observed).await);
            }
            Err(err) => return Err(err),
        };

        let converged = match wait {
            Some(timeout) => {
                let waited = self.await_active(id, timeout).await;
                match waited {
                    Ok(found) => found,
                    Err(err) => return Err(err.with_instance(updated)),
                }
            }
            None => None,
        };
        let instance = converged.map_or(updated, |found| {
            fill_missing(found, &plan.known_fields())
        });
        Ok(ReconcileOutcome::Updated(instance))
    }

    /// Deletes an instance. A missing instance counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Remote`] when the delete call fails for any
    /// reason other than the instance being missing, and wait errors when
    /// convergence is requested.
    pub async fn delete(
        &self,
        observed: &InstanceRepresentation,
        wait: Option<Duration>,
    ) -> Result<ReconcileOutcome, ReconcileError<A::Error>> {
        let id = observed.id.as_str();
        match self.api.delete(id).await {
            Ok(()) => info!(instance_id = id, "delete requested"),
            Err(err) if err.is_not_found() => {
                info!(instance_id = id, "instance already absent");
            }
            Err(source) => {
                return Err(ReconcileError::Remote {
                    step: Step::Delete,
                    source,
                });
            }
        }

        if let Some(timeout) = wait {
            let api = &self.api;
            self.waiter
                .wait_for(id, ConvergenceTarget::Absent, timeout, move || {
                    read_optional(api, id)
                })
                .await
                .map_err(|err| ReconcileError::from_wait(err, timeout))?;
        }
        Ok(ReconcileOutcome::Deleted)
    }

    /// Re-reads an instance, returning `None` when it no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Remote`] for any other read failure.
    pub async fn refresh(
        &self,
        id: &str,
    ) -> Result<Option<InstanceRepresentation>, ReconcileError<A::Error>> {
        read_optional(&self.api, id)
            .await
            .map_err(|source| ReconcileError::Remote {
                step: Step::Read,
                source,
            })
    }

    /// Lists every instance visible to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Remote`] when the list call fails.
    pub async fn list(&self) -> Result<Vec<InstanceRepresentation>, ReconcileError<A::Error>> {
        self.api
            .list()
            .await
            .map_err(|source| ReconcileError::Remote {
                step: Step::List,
                source,
            })
    }

    async fn apply_plan(
        &self,
        plan: &Plan,
        observed: &InstanceRepresentation,
        progress: &mut Progress<'_>,
    ) -> Result<InstanceRepresentation, ReconcileError<A::Error>> {
        let id = progress.instance_id;
        self.apply_attachment_changes(plan, progress).await?;

        let changed = plan.changed_fields(&observed.fields);
        if changed.is_empty() {
            progress.run(Step::Read, self.api.read(id)).await
        } else {
            info!(instance_id = id, fields = changed.len(), "updating instance fields");
            progress
                .run(Step::Update, self.api.update(id, &changed))
                .await
        }
    }

    /// Attaches the remote state reached after a partial update, so the
    /// caller does not keep planning against the state before the failure.
    async fn with_current_state(
        &self,
        err: ReconcileError<A::Error>,
        observed: &InstanceRepresentation,
    ) -> ReconcileError<A::Error> {
        match read_optional(&self.api, &observed.id).await {
            Ok(Some(current)) => err.with_instance(fill_missing(current, &observed.fields)),
            Ok(None) => err,
            Err(read_err) => {
                warn!(
                    instance_id = %observed.id,
                    error = %read_err,
                    "could not re-read instance after partial update"
                );
                err
            }
        }
    }

    async fn apply_attachment_changes(
        &self,
        plan: &Plan,
        progress: &mut Progress<'_>,
    ) -> Result<(), ReconcileError<A::Error>> {
        let id = progress.instance_id;
        let changes = &plan.changes;

        for (network_id, attachment) in &changes.delete {
            if let Some(address_id) = &attachment.public_address {
                let step = Step::Disassociate {
                    address_id: address_id.clone(),
                };
                progress
                    .run(step, self.api.disassociate(address_id))
                    .await?;
            }
            let step = Step::Detach {
                network_id: network_id.clone(),
            };
            progress
                .run(step, self.api.detach(id, network_id))
                .await?;
        }

        for (network_id, attachment) in &changes.create {
            let step = Step::Attach {
                network_id: network_id.clone(),
            };
            progress
                .run(step, self.api.attach(id, attachment))
                .await?;
            if let Some(address_id) = &attachment.public_address {
                let step = Step::Associate {
                    address_id: address_id.clone(),
                    network_id: network_id.clone(),
                };
                progress
                    .run(step, self.api.associate(address_id, id, network_id))
                    .await?;
            }
        }

        for (network_id, update) in &changes.update {
            if let Some(patch) = update.delta.port_patch() {
                let step = Step::UpdateAttachment {
                    network_id: network_id.clone(),
                };
                progress
                    .run(step, self.api.update_attachment(id, network_id, &patch))
                    .await?;
            }
            let Some(swap) = &update.delta.public_address else {
                continue;
            };
            if let Some(old) = &swap.from {
                let step = Step::Disassociate {
                    address_id: old.clone(),
                };
                progress.run(step, self.api.disassociate(old)).await?;
            }
            if let Some(new) = &swap.to {
                let step = Step::Associate {
                    address_id: new.clone(),
                    network_id: network_id.clone(),
                };
                progress
                    .run(step, self.api.associate(new, id, network_id))
                    .await?;
            }
        }
        Ok(())
    }

    async fn await_active(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<InstanceRepresentation>, ReconcileError<A::Error>> {
        let api = &self.api;
        self.waiter
            .wait_for(id, ConvergenceTarget::Active, timeout, move || {
                read_optional(api, id)
            })
            .await
            .map_err(|err| ReconcileError::from_wait(err, timeout))
    }
}

/// Carries planned values the API does not echo back, such as write-only
/// credentials, into the representation that becomes observed state.
fn fill_missing(mut instance: InstanceRepresentation, fields: &Fields) -> InstanceRepresentation {
    for (name, value) in fields {
        instance
            .fields
            .entry(name.clone())
            .or_insert_with(|| value.clone());
    }
    instance
}

async fn read_optional<A: ComputeApi>(
    api: &A,
    id: &str,
) -> Result<Option<InstanceRepresentation>, A::Error> {
    match api.read(id).await {
        Ok(instance) => Ok(Some(instance)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Counts applied steps so failures can report partial progress.
struct Progress<'a> {
    instance_id: &'a str,
    applied: usize,
}

impl<'a> Progress<'a> {
    const fn new(instance_id: &'a str) -> Self {
        Self {
            instance_id,
            applied: 0,
        }
    }

    /// Progress for an instance whose creation already counts as applied.
    const fn started(instance_id: &'a str) -> Self {
        Self {
            instance_id,
            applied: 1,
        }
    }

    async fn run<T, E: ApiError>(
        &mut self,
        step: Step,
        call: ApiFuture<'_, T, E>,
    ) -> Result<T, ReconcileError<E>> {
        info!(instance_id = self.instance_id, %step, "applying remote step");
        match call.await {
            Ok(value) => {
                self.applied += 1;
                Ok(value)
            }
            Err(source) if self.applied == 0 => Err(ReconcileError::Remote { step, source }),
            Err(source) => Err(ReconcileError::PartialUpdate {
                instance_id: self.instance_id.to_owned(),
                step,
                applied: self.applied,
                source,
                instance: None,
            }),
        }
    }
}

#[cfg(test)]
mod tests;
