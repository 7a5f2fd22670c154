//! HTTP implementation of [`ComputeApi`] for a JSON compute service.
//!
//! Every request carries the configured token in `X-Auth-Token` and a fresh
//! `X-Request-Id`. A 404 surfaces as [`RestApiError::NotFound`] so that
//! refresh and delete can treat a missing instance as absent.

mod error;
mod payload;

use reqwest::{Method, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use crate::attachment::{AttachmentRecord, NetworkAttachment, PortPatch};
use crate::config::ApiConfig;
use crate::remote::{ApiFuture, ComputeApi, Fields, InstanceRepresentation};

pub use error::RestApiError;
use payload::{
    AssociateRequest, AttachRequest, CreateServerRequest, InterfaceEnvelope,
    InterfacePatchRequest, InterfaceRequest, ServerEnvelope, ServerListEnvelope,
    UpdateServerRequest,
};

/// Compute API client over HTTPS.
#[derive(Clone, Debug)]
pub struct RestComputeApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestComputeApi {
    /// Builds a client from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`RestApiError::Config`] when the configuration is invalid or
    /// the HTTP client cannot be constructed.
    pub fn new(config: &ApiConfig) -> Result<Self, RestApiError> {
        config
            .validate()
            .map_err(|err| RestApiError::Config(err.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| RestApiError::Config(err.to_string()))?;
        Ok(Self {
            client,
            base_url: config.base_url().to_owned(),
            token: config.token.trim().to_owned(),
        })
    }

    /// Base URL requests are issued against.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let request_id = Uuid::new_v4();
        debug!(%method, path, %request_id, "sending compute API request");
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header("X-Auth-Token", &self.token)
            .header("X-Request-Id", request_id.to_string())
    }
}

async fn send(builder: RequestBuilder, path: &str) -> Result<String, RestApiError> {
    let response = builder.send().await?;
    let status = response.status().as_u16();
    let body = response.text().await?;
    error::classify(status, path, body)
}

async fn fetch<T: DeserializeOwned>(builder: RequestBuilder, path: &str) -> Result<T, RestApiError> {
    let body = send(builder, path).await?;
    decode(path, &body)
}

fn decode<T: DeserializeOwned>(path: &str, body: &str) -> Result<T, RestApiError> {
    serde_json::from_str(body).map_err(|err| RestApiError::Decode {
        path: path.to_owned(),
        message: err.to_string(),
    })
}

fn server_path(id: &str) -> String {
    format!("/servers/{id}")
}

fn interface_path(instance_id: &str, network_id: &str) -> String {
    format!("/servers/{instance_id}/interfaces/{network_id}")
}

impl ComputeApi for RestComputeApi {
    type Error = RestApiError;

    fn create<'a>(
        &'a self,
        fields: &'a Fields,
        attachments: &'a [NetworkAttachment],
    ) -> ApiFuture<'a, InstanceRepresentation, Self::Error> {
        Box::pin(async move {
            let path = "/servers";
            let body = CreateServerRequest::new(fields, attachments);
            let envelope: ServerEnvelope =
                fetch(self.request(Method::POST, path).json(&body), path).await?;
            Ok(envelope.server.into())
        })
    }

    fn read<'a>(&'a self, id: &'a str) -> ApiFuture<'a, InstanceRepresentation, Self::Error> {
        Box::pin(async move {
            let path = server_path(id);
            let envelope: ServerEnvelope =
                fetch(self.request(Method::GET, &path), &path).await?;
            Ok(envelope.server.into())
        })
    }

    fn update<'a>(
        &'a self,
        id: &'a str,
        fields: &'a Fields,
    ) -> ApiFuture<'a, InstanceRepresentation, Self::Error> {
        Box::pin(async move {
            let path = server_path(id);
            let body = UpdateServerRequest { server: fields };
            let envelope: ServerEnvelope =
                fetch(self.request(Method::PATCH, &path).json(&body), &path).await?;
            Ok(envelope.server.into())
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> ApiFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = server_path(id);
            send(self.request(Method::DELETE, &path), &path)
                .await
                .map(drop)
        })
    }

    fn list(&self) -> ApiFuture<'_, Vec<InstanceRepresentation>, Self::Error> {
        Box::pin(async move {
            let path = "/servers";
            let envelope: ServerListEnvelope =
                fetch(self.request(Method::GET, path), path).await?;
            Ok(envelope.servers.into_iter().map(Into::into).collect())
        })
    }

    fn attach<'a>(
        &'a self,
        instance_id: &'a str,
        attachment: &'a NetworkAttachment,
    ) -> ApiFuture<'a, AttachmentRecord, Self::Error> {
        Box::pin(async move {
            let path = format!("/servers/{instance_id}/interfaces");
            let body = AttachRequest {
                interface: InterfaceRequest::from(attachment),
            };
            let envelope: InterfaceEnvelope =
                fetch(self.request(Method::POST, &path).json(&body), &path).await?;
            Ok(envelope.interface)
        })
    }

    fn detach<'a>(
        &'a self,
        instance_id: &'a str,
        network_id: &'a str,
    ) -> ApiFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = interface_path(instance_id, network_id);
            send(self.request(Method::DELETE, &path), &path)
                .await
                .map(drop)
        })
    }

    fn update_attachment<'a>(
        &'a self,
        instance_id: &'a str,
        network_id: &'a str,
        patch: &'a PortPatch,
    ) -> ApiFuture<'a, AttachmentRecord, Self::Error> {
        Box::pin(async move {
            let path = interface_path(instance_id, network_id);
            let body = InterfacePatchRequest { interface: patch };
            let envelope: InterfaceEnvelope =
                fetch(self.request(Method::PATCH, &path).json(&body), &path).await?;
            Ok(envelope.interface)
        })
    }

    fn associate<'a>(
        &'a self,
        address_id: &'a str,
        instance_id: &'a str,
        network_id: &'a str,
    ) -> ApiFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("/addresses/{address_id}/associate");
            let body = AssociateRequest {
                server_id: instance_id,
                network_id,
            };
            send(self.request(Method::POST, &path).json(&body), &path)
                .await
                .map(drop)
        })
    }

    fn disassociate<'a>(&'a self, address_id: &'a str) -> ApiFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let path = format!("/addresses/{address_id}/disassociate");
            match send(self.request(Method::POST, &path), &path).await {
                Ok(_) | Err(RestApiError::NotFound { .. }) => Ok(()),
                Err(err) => Err(err),
            }
        })
    }
}
