//! Remote compute API abstraction consumed by the reconciler.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::attachment::{AttachmentRecord, NetworkAttachment, PortPatch};

/// Attribute name to JSON value map exchanged with the remote API.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Future returned by remote API operations.
pub type ApiFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Lifecycle status reported by the remote API.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    /// Accepted but not yet running.
    #[default]
    Pending,
    /// Running and converged.
    Active,
    /// Provisioned but powered off.
    Stopped,
    /// Teardown in progress.
    Deleting,
    /// The provider gave up on the instance.
    Error,
    /// Any status this client does not recognise.
    #[serde(other)]
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Stopped => "stopped",
            Self::Deleting => "deleting",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Resource representation returned by the remote API and persisted as the
/// observed state between cycles.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceRepresentation {
    /// API-assigned identity. Never sent back in field maps.
    pub id: String,
    /// Current lifecycle status.
    #[serde(default)]
    pub status: InstanceStatus,
    /// Attribute values as last reported.
    #[serde(default)]
    pub fields: Fields,
    /// Network interfaces as last reported.
    #[serde(default)]
    pub attachments: Vec<AttachmentRecord>,
}

impl InstanceRepresentation {
    /// Settings of every observed attachment, dropping port-level details.
    #[must_use]
    pub fn attachment_specs(&self) -> Vec<NetworkAttachment> {
        self.attachments
            .iter()
            .map(|record| record.spec.clone())
            .collect()
    }
}

/// Error contract shared by remote API implementations.
pub trait ApiError: std::error::Error + Send + Sync + 'static {
    /// Returns `true` when the error reports that the resource does not exist.
    fn is_not_found(&self) -> bool;
}

/// Minimal interface implemented by compute providers.
pub trait ComputeApi {
    /// Provider specific error type.
    type Error: ApiError;

    /// Creates an instance with the given fields and initial attachments.
    fn create<'a>(
        &'a self,
        fields: &'a Fields,
        attachments: &'a [NetworkAttachment],
    ) -> ApiFuture<'a, InstanceRepresentation, Self::Error>;

    /// Reads the current representation of an instance.
    fn read<'a>(&'a self, id: &'a str) -> ApiFuture<'a, InstanceRepresentation, Self::Error>;

    /// Applies changed top-level fields to an instance.
    fn update<'a>(
        &'a self,
        id: &'a str,
        fields: &'a Fields,
    ) -> ApiFuture<'a, InstanceRepresentation, Self::Error>;

    /// Requests deletion of an instance.
    fn delete<'a>(&'a self, id: &'a str) -> ApiFuture<'a, (), Self::Error>;

    /// Lists every instance visible to the caller.
    fn list(&self) -> ApiFuture<'_, Vec<InstanceRepresentation>, Self::Error>;

    /// Attaches the instance to a network.
    fn attach<'a>(
        &'a self,
        instance_id: &'a str,
        attachment: &'a NetworkAttachment,
    ) -> ApiFuture<'a, AttachmentRecord, Self::Error>;

    /// Removes the instance's interface on a network.
    fn detach<'a>(
        &'a self,
        instance_id: &'a str,
        network_id: &'a str,
    ) -> ApiFuture<'a, (), Self::Error>;

    /// Updates port-level settings of an existing interface in place.
    fn update_attachment<'a>(
        &'a self,
        instance_id: &'a str,
        network_id: &'a str,
        patch: &'a PortPatch,
    ) -> ApiFuture<'a, AttachmentRecord, Self::Error>;

    /// Binds a public address to the instance's interface on a network.
    fn associate<'a>(
        &'a self,
        address_id: &'a str,
        instance_id: &'a str,
        network_id: &'a str,
    ) -> ApiFuture<'a, (), Self::Error>;

    /// Releases a public address from whatever it is bound to.
    fn disassociate<'a>(&'a self, address_id: &'a str) -> ApiFuture<'a, (), Self::Error>;
}
