//! Client side of the remote artifact server.

use std::path::Path;

use async_trait::async_trait;
use reqwest::{multipart, Client};

use crate::error::ClientError;
use crate::http::{build_client, decode_json, join_url};
use crate::model::{ArtifactListing, FetchJobRequest, FetchProgress, FetchSubmitReply, ServerReply};

#[derive(Clone, Debug, Default)]
pub struct UploadOptions {
    pub remark: Option<String>,
    pub custom_filename: Option<String>,
}

#[async_trait]
pub trait ArtifactApi: Send + Sync + 'static {
    async fn list_artifacts(&self) -> Result<ArtifactListing, ClientError>;

    async fn upload(&self, path: &Path, opts: &UploadOptions) -> Result<ServerReply, ClientError>;

    async fn delete(&self, filename: &str) -> Result<ServerReply, ClientError>;

    async fn submit_fetch(&self, req: &FetchJobRequest) -> Result<FetchSubmitReply, ClientError>;

    async fn fetch_progress(&self, task_id: &str) -> Result<FetchProgress, ClientError>;

    /// URL the agent downloads the raw build from; never fetched by the core itself.
    fn artifact_url(&self, filename: &str) -> String;
}

#[derive(Clone)]
pub struct HttpArtifactServer {
    client: Client,
    base_url: String,
}

impl HttpArtifactServer {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: build_client("upt-core"),
            base_url: upt_util::normalize_base_url(&base_url.into()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(upt_util::server_url())
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ArtifactApi for HttpArtifactServer {
    async fn list_artifacts(&self) -> Result<ArtifactListing, ClientError> {
        let url = join_url(&self.base_url, &["apks"])?;
        let resp = self.client.get(url).send().await?;
        decode_json(resp).await
    }

    async fn upload(&self, path: &Path, opts: &UploadOptions) -> Result<ServerReply, ClientError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.apk".into());
        let part = multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("application/octet-stream")?;
        let mut form = multipart::Form::new().part("file", part);
        if let Some(remark) = opts.remark.as_ref().filter(|v| !v.trim().is_empty()) {
            form = form.text("remark", remark.clone());
        }
        if let Some(name) = opts.custom_filename.as_ref().filter(|v| !v.trim().is_empty()) {
            form = form.text("custom_filename", name.clone());
        }

        let url = join_url(&self.base_url, &["upload"])?;
        let resp = self.client.post(url).multipart(form).send().await?;
        decode_json(resp).await
    }

    async fn delete(&self, filename: &str) -> Result<ServerReply, ClientError> {
        let url = join_url(&self.base_url, &["apks", filename])?;
        let resp = self.client.delete(url).send().await?;
        decode_json(resp).await
    }

    async fn submit_fetch(&self, req: &FetchJobRequest) -> Result<FetchSubmitReply, ClientError> {
        let url = join_url(&self.base_url, &["fetch_job"])?;
        let resp = self.client.post(url).json(req).send().await?;
        decode_json(resp).await
    }

    async fn fetch_progress(&self, task_id: &str) -> Result<FetchProgress, ClientError> {
        let url = join_url(&self.base_url, &["fetch_job", task_id, "progress"])?;
        let resp = self.client.get(url).send().await?;
        decode_json(resp).await
    }

    fn artifact_url(&self, filename: &str) -> String {
        match join_url(&self.base_url, &["uploads", filename]) {
            Ok(url) => url.to_string(),
            Err(_) => format!("{}/uploads/{filename}", self.base_url),
        }
    }
}
