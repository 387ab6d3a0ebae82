//! Submit-then-poll protocol for server-side build downloads (share links).

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::model::{FetchJob, FetchJobRequest, FetchStatus};
use crate::server::ArtifactApi;

pub(crate) fn cancel_requested(cancel_rx: &watch::Receiver<bool>) -> bool {
    *cancel_rx.borrow()
}

pub struct FetchPoller<S> {
    server: Arc<S>,
    interval: Duration,
}

impl<S: ArtifactApi> FetchPoller<S> {
    pub fn new(server: Arc<S>, interval: Duration) -> Self {
        Self { server, interval }
    }

    /// Starts a server-side fetch and returns its task id without waiting for the download.
    pub async fn submit(&self, source_url: &str, remark: Option<&str>) -> Result<String, FetchError> {
        let source_url = source_url.trim();
        if source_url.is_empty() {
            return Err(FetchError::Rejected {
                message: "source URL is empty".into(),
            });
        }
        let req = FetchJobRequest {
            url: source_url.to_string(),
            remark: remark
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        };
        let reply = self
            .server
            .submit_fetch(&req)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        if reply.status != "started" {
            let message = reply
                .message
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| format!("server answered status={}", reply.status));
            return Err(FetchError::Rejected { message });
        }
        let task_id = reply
            .task_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FetchError::Rejected {
                message: "server returned no task id".into(),
            })?;
        info!("fetch job {task_id} started for {source_url}");
        Ok(task_id)
    }

    pub async fn poll(&self, task_id: &str) -> Result<FetchJob, FetchError> {
        let progress = self
            .server
            .fetch_progress(task_id)
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(FetchJob::from_progress(task_id, progress))
    }

    /// Polls `task_id` until it reaches a terminal state or `cancel_rx` fires.
    ///
    /// `on_tick` sees every poll result, changed or not. No request is issued
    /// after a terminal state, after cancellation, or once the cancel sender is
    /// dropped. Failures are not retried.
    pub async fn run<F>(
        &self,
        task_id: &str,
        mut cancel_rx: watch::Receiver<bool>,
        mut on_tick: F,
    ) -> Result<FetchJob, FetchError>
    where
        F: FnMut(&FetchJob),
    {
        loop {
            if cancel_requested(&cancel_rx) {
                return Err(FetchError::Cancelled);
            }

            let job = tokio::select! {
                job = self.poll(task_id) => job?,
                _ = cancel_rx.changed() => return Err(FetchError::Cancelled),
            };
            debug!(
                "fetch job {task_id}: {:?} {}% {}",
                job.status, job.percent, job.message
            );
            on_tick(&job);

            match job.status {
                FetchStatus::Success => {
                    info!("fetch job {task_id} finished: {:?}", job.filename);
                    return Ok(job);
                }
                FetchStatus::Error | FetchStatus::Unknown => {
                    let message = if job.message.trim().is_empty() {
                        "fetch job failed".to_string()
                    } else {
                        job.message.clone()
                    };
                    warn!("fetch job {task_id} failed: {message}");
                    return Err(FetchError::Failed { message });
                }
                FetchStatus::Pending | FetchStatus::Running => {}
            }

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = cancel_rx.changed() => {
                    if changed.is_err() || cancel_requested(&cancel_rx) {
                        return Err(FetchError::Cancelled);
                    }
                }
            }
        }
    }
}
