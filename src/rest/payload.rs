//! JSON request and response envelopes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::attachment::{AttachmentRecord, NetworkAttachment, PortPatch};
use crate::remote::{Fields, InstanceRepresentation, InstanceStatus};

/// Interface settings sent when creating a server or attaching a network.
///
/// Public addresses are bound separately and never sent here.
#[derive(Debug, Serialize)]
pub(super) struct InterfaceRequest<'a> {
    network_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    fixed_ip: Option<&'a str>,
    primary: bool,
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    security_groups: &'a BTreeSet<String>,
}

impl<'a> From<&'a NetworkAttachment> for InterfaceRequest<'a> {
    fn from(attachment: &'a NetworkAttachment) -> Self {
        Self {
            network_id: &attachment.network_id,
            fixed_ip: attachment.fixed_ip.as_deref(),
            primary: attachment.primary,
            security_groups: &attachment.security_groups,
        }
    }
}

#[derive(Debug, Serialize)]
pub(super) struct NewServer<'a> {
    #[serde(flatten)]
    fields: &'a Fields,
    interfaces: Vec<InterfaceRequest<'a>>,
}

/// `POST /servers` body.
#[derive(Debug, Serialize)]
pub(super) struct CreateServerRequest<'a> {
    server: NewServer<'a>,
}

impl<'a> CreateServerRequest<'a> {
    pub(super) fn new(fields: &'a Fields, attachments: &'a [NetworkAttachment]) -> Self {
        Self {
            server: NewServer {
                fields,
                interfaces: attachments.iter().map(InterfaceRequest::from).collect(),
            },
        }
    }
}

/// `PATCH /servers/{id}` body.
#[derive(Debug, Serialize)]
pub(super) struct UpdateServerRequest<'a> {
    pub(super) server: &'a Fields,
}

/// `POST /servers/{id}/interfaces` body.
#[derive(Debug, Serialize)]
pub(super) struct AttachRequest<'a> {
    pub(super) interface: InterfaceRequest<'a>,
}

/// `PATCH /servers/{id}/interfaces/{network_id}` body.
#[derive(Debug, Serialize)]
pub(super) struct InterfacePatchRequest<'a> {
    pub(super) interface: &'a PortPatch,
}

/// `POST /addresses/{id}/associate` body.
#[derive(Debug, Serialize)]
pub(super) struct AssociateRequest<'a> {
    pub(super) server_id: &'a str,
    pub(super) network_id: &'a str,
}

/// Server as returned on the wire: identity, status, interfaces, and every
/// other key as an attribute field.
#[derive(Debug, Deserialize)]
pub(super) struct ServerBody {
    id: String,
    #[serde(default)]
    status: InstanceStatus,
    #[serde(default)]
    interfaces: Vec<AttachmentRecord>,
    #[serde(flatten)]
    fields: Fields,
}

impl From<ServerBody> for InstanceRepresentation {
    fn from(body: ServerBody) -> Self {
        Self {
            id: body.id,
            status: body.status,
            fields: body.fields,
            attachments: body.interfaces,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerEnvelope {
    pub(super) server: ServerBody,
}

#[derive(Debug, Deserialize)]
pub(super) struct ServerListEnvelope {
    pub(super) servers: Vec<ServerBody>,
}

#[derive(Debug, Deserialize)]
pub(super) struct InterfaceEnvelope {
    pub(super) interface: AttachmentRecord,
}
