//! Network attachments and the topology-keyed attachment differ.
//!
//! An attachment binds an instance to one network. Attachments are identified
//! by the network they bind to (their topology key), never by their position
//! in a list, so reordering a desired list is not a change.

mod diff;

use std::collections::BTreeSet;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

pub use diff::{AttachmentChangeSet, AttachmentUpdate, ChangeSet, DiffError, ListSide, diff};

/// Extracts the stable identity of an attachment and compares mutable fields.
///
/// Implemented once per attachment type; the differ never falls back to list
/// offsets.
pub trait TopologyKeyed {
    /// Business identity of the attachment.
    type Key: Clone + Display + Ord;
    /// Field-level difference between two attachments sharing a key.
    type Delta;

    /// Returns the topology key for this attachment.
    fn topology_key(&self) -> Self::Key;

    /// Compares `self` (desired) against `observed`, returning only the
    /// sub-fields that differ, or `None` when nothing mutable changed.
    fn delta_from(&self, observed: &Self) -> Option<Self::Delta>;
}

/// Desired network interface of an instance.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    /// Network the interface binds to. This is the topology key.
    pub network_id: String,
    /// Fixed address requested on the network, when the caller pins one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<String>,
    /// Whether the interface is the instance's primary interface.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub primary: bool,
    /// Security groups applied to the interface.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub security_groups: BTreeSet<String>,
    /// Identifier of an externally-allocated public address bound to the
    /// interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

impl NetworkAttachment {
    /// Creates an attachment to `network_id` with no optional settings.
    #[must_use]
    pub fn new(network_id: impl Into<String>) -> Self {
        Self {
            network_id: network_id.into().trim().to_owned(),
            ..Self::default()
        }
    }

    /// Pins a fixed address.
    #[must_use]
    pub fn fixed_ip(mut self, address: impl Into<String>) -> Self {
        self.fixed_ip = Some(address.into().trim().to_owned());
        self
    }

    /// Marks the attachment as primary.
    #[must_use]
    pub const fn primary(mut self, primary: bool) -> Self {
        self.primary = primary;
        self
    }

    /// Adds a security group.
    #[must_use]
    pub fn security_group(mut self, group: impl Into<String>) -> Self {
        self.security_groups.insert(group.into().trim().to_owned());
        self
    }

    /// Binds an externally-allocated public address.
    #[must_use]
    pub fn public_address(mut self, address_id: impl Into<String>) -> Self {
        self.public_address = Some(address_id.into().trim().to_owned());
        self
    }
}

impl TopologyKeyed for NetworkAttachment {
    type Key = String;
    type Delta = AttachmentDelta;

    fn topology_key(&self) -> Self::Key {
        self.network_id.clone()
    }

    fn delta_from(&self, observed: &Self) -> Option<Self::Delta> {
        let delta = AttachmentDelta {
            fixed_ip: Change::between(&observed.fixed_ip, &self.fixed_ip),
            security_groups: Change::between(&observed.security_groups, &self.security_groups),
            public_address: Change::between(&observed.public_address, &self.public_address),
        };
        (!delta.is_empty()).then_some(delta)
    }
}

/// Observed network interface as reported by the remote API.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Settings the interface currently carries.
    #[serde(flatten)]
    pub spec: NetworkAttachment,
    /// Remote port identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
    /// Address assigned by the network.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl From<NetworkAttachment> for AttachmentRecord {
    fn from(spec: NetworkAttachment) -> Self {
        Self {
            spec,
            port_id: None,
            address: None,
        }
    }
}

/// Old and new value of a single sub-field.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct Change<T> {
    /// Observed value.
    pub from: T,
    /// Desired value.
    pub to: T,
}

impl<T: Clone + PartialEq> Change<T> {
    fn between(from: &T, to: &T) -> Option<Self> {
        (from != to).then(|| Self {
            from: from.clone(),
            to: to.clone(),
        })
    }
}

/// Sub-fields that differ between a desired and an observed attachment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AttachmentDelta {
    /// Fixed address request change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<Change<Option<String>>>,
    /// Security group set change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<Change<BTreeSet<String>>>,
    /// Public address binding change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_address: Option<Change<Option<String>>>,
}

impl AttachmentDelta {
    /// Returns `true` when no sub-field changed.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.fixed_ip.is_none() && self.security_groups.is_none() && self.public_address.is_none()
    }

    /// Names of the changed sub-fields, in a fixed order.
    #[must_use]
    pub fn changed_fields(&self) -> Vec<&'static str> {
        [
            ("fixed_ip", self.fixed_ip.is_some()),
            ("security_groups", self.security_groups.is_some()),
            ("public_address", self.public_address.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, changed)| changed.then_some(name))
        .collect()
    }

    /// Port-level part of the delta, applied with a single attachment update.
    ///
    /// Public address changes are excluded; they go through the address
    /// binding calls instead.
    #[must_use]
    pub fn port_patch(&self) -> Option<PortPatch> {
        let patch = PortPatch {
            fixed_ip: self.fixed_ip.as_ref().map(|change| change.to.clone()),
            security_groups: self
                .security_groups
                .as_ref()
                .map(|change| change.to.clone()),
        };
        (patch.fixed_ip.is_some() || patch.security_groups.is_some()).then_some(patch)
    }
}

/// In-place update sent for an existing attachment.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PortPatch {
    /// New fixed address request; `Some(None)` clears a pinned address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<Option<String>>,
    /// Replacement security group set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_groups: Option<BTreeSet<String>>,
}
