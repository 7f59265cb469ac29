//! Outbound adapters: payment, delivery carriers, CRM, AI and the narrow
//! interfaces of external collaborators.

pub mod amocrm;
pub mod cdek;
pub mod collaborators;
pub mod openai;
pub mod yandex;
pub mod yookassa;

use std::time::Duration;

use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
pub const HEAVY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("{service} is not configured")]
    NotConfigured { service: &'static str },

    #[error("{service} {stage}: transport error: {source}")]
    Transport {
        service: &'static str,
        stage: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} {stage}: HTTP {status}: {body}")]
    Status { service: &'static str, stage: &'static str, status: u16, body: String },

    #[error("{service} {stage}: unexpected response: {message}")]
    Decode { service: &'static str, stage: &'static str, message: String },

    #[error("{service}: authorization failed: {message}")]
    Auth { service: &'static str, message: String },
}

impl UpstreamError {
    pub fn service(&self) -> &'static str {
        match self {
            Self::NotConfigured { service }
            | Self::Transport { service, .. }
            | Self::Status { service, .. }
            | Self::Decode { service, .. }
            | Self::Auth { service, .. } => service,
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Transport { stage, .. } | Self::Status { stage, .. } | Self::Decode { stage, .. } => stage,
            Self::NotConfigured { .. } => "configuration",
            Self::Auth { .. } => "authorization",
        }
    }

    pub fn body(&self) -> String {
        match self {
            Self::Status { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }

    /// Network failures, 5xx and 429 are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_unauthorized(&self) -> bool { matches!(self, Self::Status { status: 401 | 403, .. }) }

    pub fn transport(service: &'static str, stage: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| Self::Transport { service, stage, source }
    }
}

pub fn http_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder().connect_timeout(CONNECT_TIMEOUT).timeout(timeout).build()
}

/// Turns a non-2xx response into `UpstreamError::Status`, keeping at most
/// 2 KiB of the body for diagnostics.
pub async fn check_status(service: &'static str, stage: &'static str, response: Response) -> Result<Response, UpstreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(UpstreamError::Status { service, stage, status: status.as_u16(), body: body.chars().take(2048).collect() })
}

pub async fn read_json<T: DeserializeOwned>(service: &'static str, stage: &'static str, response: Response) -> Result<T, UpstreamError> {
    let response = check_status(service, stage, response).await?;
    let bytes = response.bytes().await.map_err(UpstreamError::transport(service, stage))?;
    serde_json::from_slice(&bytes).map_err(|e| UpstreamError::Decode { service, stage, message: e.to_string() })
}
