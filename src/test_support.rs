//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::future::ready;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};

use crate::attachment::{AttachmentRecord, NetworkAttachment, PortPatch};
use crate::remote::{
    ApiError, ApiFuture, ComputeApi, Fields, InstanceRepresentation, InstanceStatus,
};
use crate::wait::{Clock, ClockFuture};

/// Kind of remote call, used for failure injection and assertions.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum CallKind {
    /// `create`.
    Create,
    /// `read`.
    Read,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
    /// `list`.
    List,
    /// `attach`.
    Attach,
    /// `detach`.
    Detach,
    /// `update_attachment`.
    UpdateAttachment,
    /// `associate`.
    Associate,
    /// `disassociate`.
    Disassociate,
}

/// Records a single call made through [`ScriptedComputeApi`].
#[derive(Clone, Debug, PartialEq)]
pub enum ApiCall {
    /// Instance creation with its fields and attachment networks.
    Create {
        /// Fields sent.
        fields: Fields,
        /// Networks of the initial attachments, in request order.
        networks: Vec<String>,
    },
    /// Instance read.
    Read {
        /// Instance identifier.
        id: String,
    },
    /// Top-level field update.
    Update {
        /// Instance identifier.
        id: String,
        /// Fields sent.
        fields: Fields,
    },
    /// Instance deletion.
    Delete {
        /// Instance identifier.
        id: String,
    },
    /// Instance listing.
    List,
    /// Interface creation.
    Attach {
        /// Instance identifier.
        instance_id: String,
        /// Network attached to.
        network_id: String,
    },
    /// Interface removal.
    Detach {
        /// Instance identifier.
        instance_id: String,
        /// Network detached from.
        network_id: String,
    },
    /// In-place interface update.
    UpdateAttachment {
        /// Instance identifier.
        instance_id: String,
        /// Network of the interface.
        network_id: String,
        /// Patch sent.
        patch: PortPatch,
    },
    /// Public address binding.
    Associate {
        /// Address identifier.
        address_id: String,
        /// Instance identifier.
        instance_id: String,
        /// Network of the interface.
        network_id: String,
    },
    /// Public address release.
    Disassociate {
        /// Address identifier.
        address_id: String,
    },
}

impl ApiCall {
    /// Returns the kind of call.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        match self {
            Self::Create { .. } => CallKind::Create,
            Self::Read { .. } => CallKind::Read,
            Self::Update { .. } => CallKind::Update,
            Self::Delete { .. } => CallKind::Delete,
            Self::List => CallKind::List,
            Self::Attach { .. } => CallKind::Attach,
            Self::Detach { .. } => CallKind::Detach,
            Self::UpdateAttachment { .. } => CallKind::UpdateAttachment,
            Self::Associate { .. } => CallKind::Associate,
            Self::Disassociate { .. } => CallKind::Disassociate,
        }
    }
}

impl fmt::Display for ApiCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create { .. } => f.write_str("create"),
            Self::Read { id } => write!(f, "read {id}"),
            Self::Update { id, .. } => write!(f, "update {id}"),
            Self::Delete { id } => write!(f, "delete {id}"),
            Self::List => f.write_str("list"),
            Self::Attach { network_id, .. } => write!(f, "attach {network_id}"),
            Self::Detach { network_id, .. } => write!(f, "detach {network_id}"),
            Self::UpdateAttachment { network_id, .. } => {
                write!(f, "update_attachment {network_id}")
            }
            Self::Associate {
                address_id,
                network_id,
                ..
            } => write!(f, "associate {address_id} {network_id}"),
            Self::Disassociate { address_id } => write!(f, "disassociate {address_id}"),
        }
    }
}

/// Scripted outcome of one `read` call.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReadScript {
    /// The instance reports this status.
    Status(InstanceStatus),
    /// The instance is reported missing.
    NotFound,
    /// The read fails with a transient error.
    Error,
}

/// Errors returned by [`ScriptedComputeApi`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptedApiError {
    /// The addressed resource does not exist.
    #[error("{resource} not found")]
    NotFound {
        /// Description of the missing resource.
        resource: String,
    },
    /// An injected failure.
    #[error("scripted {call:?} failure")]
    Failure {
        /// Call that failed.
        call: CallKind,
    },
}

impl ApiError for ScriptedApiError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    instances: BTreeMap<String, InstanceRepresentation>,
    reads: VecDeque<ReadScript>,
    failures: BTreeMap<CallKind, usize>,
    successes: BTreeMap<CallKind, usize>,
    calls: Vec<ApiCall>,
    write_only: BTreeSet<String>,
    next_id: u32,
}

impl ScriptState {
    fn record(&mut self, call: ApiCall) -> Result<(), ScriptedApiError> {
        let kind = call.kind();
        self.calls.push(call);
        let succeeded = self.successes.entry(kind).or_default();
        if self
            .failures
            .get(&kind)
            .is_some_and(|allowed| *succeeded >= *allowed)
        {
            return Err(ScriptedApiError::Failure { call: kind });
        }
        *succeeded += 1;
        Ok(())
    }

    /// Fields as the API stores them: write-only attributes are accepted but
    /// never returned.
    fn echoed(&self, fields: &Fields) -> Fields {
        fields
            .iter()
            .filter(|(name, _)| !self.write_only.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }

    fn instance_mut(&mut self, id: &str) -> Result<&mut InstanceRepresentation, ScriptedApiError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| ScriptedApiError::NotFound {
                resource: format!("instance {id}"),
            })
    }

    fn record_mut(
        &mut self,
        instance_id: &str,
        network_id: &str,
    ) -> Result<&mut AttachmentRecord, ScriptedApiError> {
        self.instance_mut(instance_id)?
            .attachments
            .iter_mut()
            .find(|record| record.spec.network_id == network_id)
            .ok_or_else(|| ScriptedApiError::NotFound {
                resource: format!("interface on {network_id}"),
            })
    }
}

fn port_for(spec: &NetworkAttachment) -> AttachmentRecord {
    AttachmentRecord {
        spec: NetworkAttachment {
            public_address: None,
            ..spec.clone()
        },
        port_id: Some(format!("port-{}", spec.network_id)),
        address: spec.fixed_ip.clone(),
    }
}

/// In-memory [`ComputeApi`] that records every call and supports scripted
/// reads and failure injection.
///
/// Clones share state, so a test can keep a handle for assertions while the
/// reconciler owns another.
#[derive(Clone, Debug, Default)]
pub struct ScriptedComputeApi {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedComputeApi {
    /// Creates an API with no instances.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds an existing instance.
    #[must_use]
    pub fn with_instance(self, instance: InstanceRepresentation) -> Self {
        self.with_state(|state| {
            state.instances.insert(instance.id.clone(), instance);
        });
        self
    }

    /// Marks attributes the API accepts but never returns.
    #[must_use]
    pub fn with_write_only<'a>(self, names: impl IntoIterator<Item = &'a str>) -> Self {
        self.with_state(|state| {
            state.write_only.extend(names.into_iter().map(str::to_owned));
        });
        self
    }

    /// Queues scripted outcomes for subsequent `read` calls. Once the queue
    /// is empty, reads return the stored instance or `NotFound`.
    pub fn script_reads(&self, reads: impl IntoIterator<Item = ReadScript>) {
        self.with_state(|state| state.reads.extend(reads));
    }

    /// Makes every call of `kind` fail after `successes` successful calls.
    pub fn fail_after(&self, kind: CallKind, successes: usize) {
        self.with_state(|state| {
            state.failures.insert(kind, successes);
        });
    }

    /// Returns a snapshot of every call recorded so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ApiCall> {
        self.with_state(|state| state.calls.clone())
    }

    /// Returns recorded calls rendered as short strings, excluding reads.
    #[must_use]
    pub fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .iter()
            .filter(|call| !matches!(call.kind(), CallKind::Read | CallKind::List))
            .map(ToString::to_string)
            .collect()
    }

    /// Returns the stored instance, if present.
    #[must_use]
    pub fn instance(&self, id: &str) -> Option<InstanceRepresentation> {
        self.with_state(|state| state.instances.get(id).cloned())
    }

    fn with_state<T>(&self, apply: impl FnOnce(&mut ScriptState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        apply(&mut state)
    }

    fn respond<'a, T: Send + 'a>(
        &self,
        call: ApiCall,
        apply: impl FnOnce(&mut ScriptState) -> Result<T, ScriptedApiError>,
    ) -> ApiFuture<'a, T, ScriptedApiError> {
        let result = self.with_state(|state| {
            state.record(call)?;
            apply(state)
        });
        Box::pin(ready(result))
    }
}

impl ComputeApi for ScriptedComputeApi {
    type Error = ScriptedApiError;

    fn create<'a>(
        &'a self,
        fields: &'a Fields,
        attachments: &'a [NetworkAttachment],
    ) -> ApiFuture<'a, InstanceRepresentation, Self::Error> {
        let call = ApiCall::Create {
            fields: fields.clone(),
            networks: attachments
                .iter()
                .map(|spec| spec.network_id.clone())
                .collect(),
        };
        self.respond(call, |state| {
            state.next_id += 1;
            let instance = InstanceRepresentation {
                id: format!("srv-{}", state.next_id),
                status: InstanceStatus::Pending,
                fields: state.echoed(fields),
                attachments: attachments.iter().map(port_for).collect(),
            };
            state
                .instances
                .insert(instance.id.clone(), instance.clone());
            Ok(instance)
        })
    }

    fn read<'a>(&'a self, id: &'a str) -> ApiFuture<'a, InstanceRepresentation, Self::Error> {
        let call = ApiCall::Read { id: id.to_owned() };
        self.respond(call, |state| match state.reads.pop_front() {
            Some(ReadScript::Error) => Err(ScriptedApiError::Failure {
                call: CallKind::Read,
            }),
            Some(ReadScript::NotFound) => Err(ScriptedApiError::NotFound {
                resource: format!("instance {id}"),
            }),
            Some(ReadScript::Status(status)) => {
                let Some(instance) = state.instances.get_mut(id) else {
                    return Ok(InstanceRepresentation {
                        id: id.to_owned(),
                        status,
                        ..InstanceRepresentation::default()
                    });
                };
                instance.status = status;
                Ok(instance.clone())
            }
            None => state.instance_mut(id).map(|instance| instance.clone()),
        })
    }

    fn update<'a>(
        &'a self,
        id: &'a str,
        fields: &'a Fields,
    ) -> ApiFuture<'a, InstanceRepresentation, Self::Error> {
        let call = ApiCall::Update {
            id: id.to_owned(),
            fields: fields.clone(),
        };
        self.respond(call, |state| {
            let stored = state.echoed(fields);
            let instance = state.instance_mut(id)?;
            instance.fields.extend(stored);
            Ok(instance.clone())
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> ApiFuture<'a, (), Self::Error> {
        let call = ApiCall::Delete { id: id.to_owned() };
        self.respond(call, |state| {
            state
                .instances
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ScriptedApiError::NotFound {
                    resource: format!("instance {id}"),
                })
        })
    }

    fn list(&self) -> ApiFuture<'_, Vec<InstanceRepresentation>, Self::Error> {
        self.respond(ApiCall::List, |state| {
            Ok(state.instances.values().cloned().collect())
        })
    }

    fn attach<'a>(
        &'a self,
        instance_id: &'a str,
        attachment: &'a NetworkAttachment,
    ) -> ApiFuture<'a, AttachmentRecord, Self::Error> {
        let call = ApiCall::Attach {
            instance_id: instance_id.to_owned(),
            network_id: attachment.network_id.clone(),
        };
        self.respond(call, |state| {
            let record = port_for(attachment);
            state
                .instance_mut(instance_id)?
                .attachments
                .push(record.clone());
            Ok(record)
        })
    }

    fn detach<'a>(
        &'a self,
        instance_id: &'a str,
        network_id: &'a str,
    ) -> ApiFuture<'a, (), Self::Error> {
        let call = ApiCall::Detach {
            instance_id: instance_id.to_owned(),
            network_id: network_id.to_owned(),
        };
        self.respond(call, |state| {
            let instance = state.instance_mut(instance_id)?;
            let before = instance.attachments.len();
            instance
                .attachments
                .retain(|record| record.spec.network_id != network_id);
            if instance.attachments.len() == before {
                return Err(ScriptedApiError::NotFound {
                    resource: format!("interface on {network_id}"),
                });
            }
            Ok(())
        })
    }

    fn update_attachment<'a>(
        &'a self,
        instance_id: &'a str,
        network_id: &'a str,
        patch: &'a PortPatch,
    ) -> ApiFuture<'a, AttachmentRecord, Self::Error> {
        let call = ApiCall::UpdateAttachment {
            instance_id: instance_id.to_owned(),
            network_id: network_id.to_owned(),
            patch: patch.clone(),
        };
        self.respond(call, |state| {
            let record = state.record_mut(instance_id, network_id)?;
            if let Some(fixed_ip) = &patch.fixed_ip {
                record.spec.fixed_ip.clone_from(fixed_ip);
                record.address.clone_from(fixed_ip);
            }
            if let Some(groups) = &patch.security_groups {
                record.spec.security_groups.clone_from(groups);
            }
            Ok(record.clone())
        })
    }

    fn associate<'a>(
        &'a self,
        address_id: &'a str,
        instance_id: &'a str,
        network_id: &'a str,
    ) -> ApiFuture<'a, (), Self::Error> {
        let call = ApiCall::Associate {
            address_id: address_id.to_owned(),
            instance_id: instance_id.to_owned(),
            network_id: network_id.to_owned(),
        };
        self.respond(call, |state| {
            let bound = state.instances.values().any(|instance| {
                instance
                    .attachments
                    .iter()
                    .any(|record| record.spec.public_address.as_deref() == Some(address_id))
            });
            if bound {
                return Err(ScriptedApiError::Failure {
                    call: CallKind::Associate,
                });
            }
            state.record_mut(instance_id, network_id)?.spec.public_address =
                Some(address_id.to_owned());
            Ok(())
        })
    }

    fn disassociate<'a>(&'a self, address_id: &'a str) -> ApiFuture<'a, (), Self::Error> {
        let call = ApiCall::Disassociate {
            address_id: address_id.to_owned(),
        };
        self.respond(call, |state| {
            state
                .instances
                .values_mut()
                .flat_map(|instance| instance.attachments.iter_mut())
                .filter(|record| record.spec.public_address.as_deref() == Some(address_id))
                .for_each(|record| record.spec.public_address = None);
            Ok(())
        })
    }
}

/// Virtual clock whose `sleep` advances time instantly.
///
/// Clones share the same elapsed time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    origin: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Creates a clock at virtual time zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Virtual time elapsed since creation.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances virtual time.
    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self.elapsed.lock().unwrap_or_else(PoisonError::into_inner);
        *elapsed += duration;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> ClockFuture<'_> {
        self.advance(duration);
        Box::pin(ready(()))
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: AsyncMutex<()> = AsyncMutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(value) => env::set_var(key, value),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
