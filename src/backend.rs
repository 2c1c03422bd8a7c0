use crate::config::BackendConfig;
use crate::session::{Credential, Host};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Transport(String),
    #[error("backend rejected the request: {0}")]
    Rejected(String),
}

/// Outcome of one metrics fetch, as signalled by the backend. The poller
/// turns these into the published per-host error state.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("host has no active session on the backend")]
    NotConnected,
    #[error("remote metrics command failed: {0}")]
    RemoteFetch(String),
    #[error("could not reach backend: {0}")]
    Transport(String),
}

/// Remote-session and metrics collaborator. Discovery, the SSH/kinit
/// handshake, and the remote monitoring command all happen behind it; this
/// daemon only consumes the results.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn discover(&self, range: &str) -> Result<Vec<Host>, BackendError>;
    async fn request_session(
        &self,
        host: &Host,
        credential: &Credential,
    ) -> Result<(), BackendError>;
    async fn fetch_metrics(&self, host: &Host) -> Result<Value, FetchError>;
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
}

impl HttpBackend {
    pub fn new(cfg: &BackendConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent("fleetmond/0.1.0")
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn discover(&self, range: &str) -> Result<Vec<Host>, BackendError> {
        let url = format!("{}/servers/discover", self.base_url);
        let response = self
            .client
            .get(url)
            .query(&[("subnet", range)])
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "discovery request rejected");
            return Err(BackendError::Rejected(format!("HTTP {status}: {body}")));
        }

        let hosts: Vec<String> = response
            .json()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;
        Ok(hosts.into_iter().map(Host::from).collect())
    }

    async fn request_session(
        &self,
        host: &Host,
        credential: &Credential,
    ) -> Result<(), BackendError> {
        let url = format!("{}/servers/connect", self.base_url);
        let body = serde_json::json!({
            "host": host.as_str(),
            "user": credential.ssh_user,
            "principal": credential.principal,
            "kinit_password": credential.kinit_password,
            "password": credential.ssh_password,
        });

        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|err| BackendError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            warn!(host = %host, %status, "session request rejected");
            return Err(BackendError::Rejected(format!("HTTP {status}: {detail}")));
        }

        Ok(())
    }

    async fn fetch_metrics(&self, host: &Host) -> Result<Value, FetchError> {
        let url = format!("{}/servers/{}/metrics", self.base_url, host.as_str());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        response
            .json()
            .await
            .map_err(|err| FetchError::Transport(format!("invalid response body: {err}")))
    }
}

/// The backend signals "no active session" with 400 and "remote command
/// failed" with 502; everything else is a transport-level failure.
fn classify_status(status: StatusCode, body: String) -> FetchError {
    match status {
        StatusCode::BAD_REQUEST => FetchError::NotConnected,
        StatusCode::BAD_GATEWAY => FetchError::RemoteFetch(body),
        _ => FetchError::Transport(format!("HTTP {status}: {body}")),
    }
}
