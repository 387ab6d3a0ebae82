//! Client side of the local device-control agent.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use crate::error::ClientError;
use crate::http::{build_client, decode_json, join_url};
use crate::model::{Device, InstallNewReply, InstallNewRequest, InstallOldReply, InstallOldRequest};

#[async_trait]
pub trait AgentApi: Send + Sync + 'static {
    /// Bounded health check; any error, timeout or non-2xx answer means unreachable.
    async fn probe(&self, timeout: Duration) -> bool;

    /// Device listing under the same bound as `probe`; a listing that runs
    /// over it is a failure, not a late answer.
    async fn list_devices(&self, timeout: Duration) -> Result<Vec<Device>, ClientError>;

    async fn install_old(&self, req: &InstallOldRequest) -> Result<InstallOldReply, ClientError>;

    async fn install_new(&self, req: &InstallNewRequest) -> Result<InstallNewReply, ClientError>;
}

#[derive(Clone)]
pub struct HttpAgent {
    client: Client,
    base_url: String,
}

impl HttpAgent {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client("upt-core"),
            base_url: upt_util::normalize_base_url(&base_url.into()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(upt_util::agent_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AgentApi for HttpAgent {
    async fn probe(&self, timeout: Duration) -> bool {
        let url = match join_url(&self.base_url, &["devices"]) {
            Ok(url) => url,
            Err(_) => return false,
        };
        // Dropping the send future on timeout aborts the request.
        let request = self.client.get(url).timeout(timeout).send();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(resp)) => resp.status().is_success(),
            Ok(Err(err)) => {
                debug!("agent probe failed: {err}");
                false
            }
            Err(_) => {
                debug!("agent probe timed out after {timeout:?}");
                false
            }
        }
    }

    async fn list_devices(&self, timeout: Duration) -> Result<Vec<Device>, ClientError> {
        let url = join_url(&self.base_url, &["devices"])?;
        let request = self.client.get(url).timeout(timeout).send();
        let resp = match tokio::time::timeout(timeout, request).await {
            Ok(resp) => resp?,
            Err(_) => return Err(ClientError::Timeout(timeout)),
        };
        decode_json(resp).await
    }

    async fn install_old(&self, req: &InstallOldRequest) -> Result<InstallOldReply, ClientError> {
        let url = join_url(&self.base_url, &["install_old"])?;
        let resp = self.client.post(url).json(req).send().await?;
        decode_json(resp).await
    }

    async fn install_new(&self, req: &InstallNewRequest) -> Result<InstallNewReply, ClientError> {
        let url = join_url(&self.base_url, &["install_new"])?;
        let resp = self.client.post(url).json(req).send().await?;
        decode_json(resp).await
    }
}
