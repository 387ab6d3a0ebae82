//! In-process stand-ins for the agent and artifact server, counting every call.

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::agent::AgentApi;
use crate::error::ClientError;
use crate::model::{
    ArtifactListing, Device, FetchJobRequest, FetchProgress, FetchSubmitReply, InstallNewReply,
    InstallNewRequest, InstallOldReply, InstallOldRequest, Platform, ServerReply,
};
use crate::server::{ArtifactApi, UploadOptions};

fn unavailable(body: &str) -> ClientError {
    ClientError::Status {
        status: 503,
        body: body.to_string(),
    }
}

fn parse<T: serde::de::DeserializeOwned>(json: &str) -> Result<T, ClientError> {
    serde_json::from_str(json).map_err(|e| ClientError::Decode(e.to_string()))
}

pub(crate) fn device(serial: &str, screen_on: bool, unlocked: bool) -> Device {
    Device {
        serial: serial.into(),
        model: format!("Pixel {serial}"),
        platform: Platform::Android,
        state: "device".into(),
        screen_on,
        unlocked,
        product: None,
    }
}

pub(crate) fn ready(serial: &str) -> Device {
    device(serial, true, true)
}

#[derive(Default)]
pub(crate) struct FakeAgent {
    pub(crate) reachable: AtomicBool,
    devices: Mutex<Option<Vec<Device>>>,
    old_reply: Mutex<Option<String>>,
    new_reply: Mutex<Option<String>>,
    install_gate: Mutex<Option<Arc<Notify>>>,
    pub(crate) install_entered: Notify,
    list_delay: Mutex<Duration>,
    list_gate: Mutex<Option<Arc<Notify>>>,
    pub(crate) probe_calls: AtomicUsize,
    pub(crate) list_calls: AtomicUsize,
    pub(crate) install_old_calls: AtomicUsize,
    pub(crate) install_new_calls: AtomicUsize,
    pub(crate) last_old: Mutex<Option<InstallOldRequest>>,
    pub(crate) last_new: Mutex<Option<InstallNewRequest>>,
}

impl FakeAgent {
    pub(crate) fn with_devices(devices: Vec<Device>) -> Self {
        let agent = Self::default();
        agent.set_devices(devices);
        agent
    }

    pub(crate) fn set_devices(&self, devices: Vec<Device>) {
        self.reachable.store(true, Ordering::SeqCst);
        *self.devices.lock().unwrap() = Some(devices);
    }

    /// Agent stops answering: probes fail and listings error out.
    pub(crate) fn go_offline(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        *self.devices.lock().unwrap() = None;
    }

    pub(crate) fn set_old_reply(&self, json: &str) {
        *self.old_reply.lock().unwrap() = Some(json.to_string());
    }

    pub(crate) fn set_new_reply(&self, json: &str) {
        *self.new_reply.lock().unwrap() = Some(json.to_string());
    }

    /// Installs block until the returned handle is notified.
    pub(crate) fn hold_installs(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.install_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    /// Every listing takes `delay` before answering.
    pub(crate) fn slow_listing(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = delay;
    }

    /// Listings read the device set on entry, then block until the returned handle is notified.
    pub(crate) fn hold_listings(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub(crate) fn install_calls(&self) -> usize {
        self.install_old_calls.load(Ordering::SeqCst) + self.install_new_calls.load(Ordering::SeqCst)
    }

    async fn wait_gate(&self) {
        self.install_entered.notify_one();
        let gate = self.install_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl AgentApi for FakeAgent {
    async fn probe(&self, _timeout: Duration) -> bool {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        self.reachable.load(Ordering::SeqCst)
    }

    async fn list_devices(&self, timeout: Duration) -> Result<Vec<Device>, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let devices = self.devices.lock().unwrap().clone();
        let gate = self.list_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = *self.list_delay.lock().unwrap();
        if delay > timeout {
            tokio::time::sleep(timeout).await;
            return Err(ClientError::Timeout(timeout));
        }
        tokio::time::sleep(delay).await;
        devices.ok_or_else(|| unavailable("agent offline"))
    }

    async fn install_old(&self, req: &InstallOldRequest) -> Result<InstallOldReply, ClientError> {
        self.install_old_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_old.lock().unwrap() = Some(req.clone());
        self.wait_gate().await;
        let reply = self.old_reply.lock().unwrap().clone();
        match reply {
            Some(json) => parse(&json),
            None => Err(unavailable("no scripted install_old reply")),
        }
    }

    async fn install_new(&self, req: &InstallNewRequest) -> Result<InstallNewReply, ClientError> {
        self.install_new_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_new.lock().unwrap() = Some(req.clone());
        self.wait_gate().await;
        let reply = self.new_reply.lock().unwrap().clone();
        match reply {
            Some(json) => parse(&json),
            None => Err(unavailable("no scripted install_new reply")),
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeServer {
    listing: Mutex<Option<String>>,
    progress: Mutex<VecDeque<String>>,
    submit_reply: Mutex<Option<String>>,
    submitted: Mutex<Option<FetchJobRequest>>,
    deleted: Mutex<Vec<String>>,
    pub(crate) list_calls: AtomicUsize,
    pub(crate) progress_calls: AtomicUsize,
}

impl FakeServer {
    pub(crate) fn with_listing(json: &str) -> Self {
        let server = Self::default();
        server.set_listing(json);
        server
    }

    pub(crate) fn set_listing(&self, json: &str) {
        *self.listing.lock().unwrap() = Some(json.to_string());
    }

    /// A `"panic"` entry makes that poll panic.
    pub(crate) fn script_progress(&self, replies: &[&str]) {
        let mut queue = self.progress.lock().unwrap();
        queue.clear();
        queue.extend(replies.iter().map(|r| r.to_string()));
    }

    pub(crate) fn set_submit_reply(&self, json: &str) {
        *self.submit_reply.lock().unwrap() = Some(json.to_string());
    }

    pub(crate) fn last_submit(&self) -> Option<FetchJobRequest> {
        self.submitted.lock().unwrap().clone()
    }

    pub(crate) fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactApi for FakeServer {
    async fn list_artifacts(&self) -> Result<ArtifactListing, ClientError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let listing = self.listing.lock().unwrap().clone();
        match listing {
            Some(json) => parse(&json),
            None => Err(unavailable("no listing")),
        }
    }

    async fn upload(&self, path: &Path, _opts: &UploadOptions) -> Result<ServerReply, ClientError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        parse(&format!(r#"{{"status":"success","filename":"{name}"}}"#))
    }

    async fn delete(&self, filename: &str) -> Result<ServerReply, ClientError> {
        self.deleted.lock().unwrap().push(filename.to_string());
        parse(r#"{"status":"success","message":"deleted"}"#)
    }

    async fn submit_fetch(&self, req: &FetchJobRequest) -> Result<FetchSubmitReply, ClientError> {
        *self.submitted.lock().unwrap() = Some(req.clone());
        let reply = self.submit_reply.lock().unwrap().clone();
        match reply {
            Some(json) => parse(&json),
            None => Err(unavailable("no scripted submit reply")),
        }
    }

    async fn fetch_progress(&self, _task_id: &str) -> Result<FetchProgress, ClientError> {
        self.progress_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.progress.lock().unwrap().pop_front();
        match next {
            Some(json) if json == "panic" => panic!("progress handler crashed"),
            Some(json) => parse(&json),
            None => Err(unavailable("progress script exhausted")),
        }
    }

    fn artifact_url(&self, filename: &str) -> String {
        format!("http://server.test/uploads/{filename}")
    }
}
