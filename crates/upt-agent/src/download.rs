use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

/// A build fetched into the scratch directory. The file is removed on drop.
#[derive(Debug)]
pub(crate) struct TempBuild {
    path: PathBuf,
    pub(crate) sha256: String,
    pub(crate) bytes: u64,
}

impl TempBuild {
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempBuild {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("removed temporary build {}", self.path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove {}: {err}", self.path.display()),
        }
    }
}

pub(crate) fn is_remote_url(url: &str) -> bool {
    url.starts_with("https://") || url.starts_with("http://")
}

pub(crate) async fn download_build(
    client: &Client,
    url: &str,
    scratch: &Path,
) -> Result<TempBuild, String> {
    if !is_remote_url(url) {
        return Err(format!("unsupported build URL: {url}"));
    }
    tokio::fs::create_dir_all(scratch)
        .await
        .map_err(|e| format!("failed to create scratch dir: {e}"))?;

    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("download failed: {e}"))?;
    if !resp.status().is_success() {
        return Err(format!("download failed with status {}", resp.status()));
    }

    let mut build = TempBuild {
        path: scratch.join(format!("build-{}.apk", Uuid::new_v4())),
        sha256: String::new(),
        bytes: 0,
    };
    let mut file = tokio::fs::File::create(build.path())
        .await
        .map_err(|e| format!("failed to create temp file: {e}"))?;

    let mut hasher = Sha256::new();
    let mut bytes = 0u64;
    let mut stream = resp.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| format!("download read failed: {e}"))?;
        hasher.update(&chunk);
        bytes += chunk.len() as u64;
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("failed to write temp file: {e}"))?;
    }
    file.flush()
        .await
        .map_err(|e| format!("failed to flush temp file: {e}"))?;
    drop(file);

    build.sha256 = hex_encode(&hasher.finalize());
    build.bytes = bytes;
    info!(
        "downloaded {url} ({} bytes, sha256 {})",
        build.bytes,
        &build.sha256[..12]
    );
    Ok(build)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use axum::{routing::get, Router};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn build_is_streamed_to_scratch_and_removed_on_drop() {
        let app = Router::new().route("/uploads/app.apk", get(|| async { "PK-not-really-a-zip" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let scratch = std::env::temp_dir().join(format!("upt-agent-test-{}", Uuid::new_v4()));
        let build = download_build(
            &Client::new(),
            &format!("http://{addr}/uploads/app.apk"),
            &scratch,
        )
        .await
        .unwrap();

        let path = build.path().to_path_buf();
        assert_eq!(std::fs::read(&path).unwrap(), b"PK-not-really-a-zip");
        assert_eq!(build.bytes, 19);
        assert_eq!(build.sha256.len(), 64);
        drop(build);
        assert!(!path.exists());
        let _ = std::fs::remove_dir(&scratch);
    }

    #[tokio::test]
    async fn non_http_urls_are_refused() {
        let err = download_build(&Client::new(), "file:///etc/passwd", Path::new("/tmp"))
            .await
            .unwrap_err();
        assert!(err.starts_with("unsupported build URL"));
    }
}
