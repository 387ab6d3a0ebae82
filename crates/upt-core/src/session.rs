//! The single context object owning all mutable orchestration state.
//!
//! Connectivity, the device registry, the active selection, the install
//! session and the artifact catalog live behind one lock. Every mutation goes
//! through `UpgradeSession` methods, and no network call is made while the lock
//! is held.

use std::{path::Path, sync::Arc};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::agent::AgentApi;
use crate::catalog::ArtifactCatalog;
use crate::connectivity::{ConnectivityEdge, ConnectivityMonitor};
use crate::error::{ClientError, FetchError, InstallError, SelectError};
use crate::events::{EventSink, SessionEvent};
use crate::fetch::{cancel_requested, FetchPoller};
use crate::model::{Device, FetchJob, InstalledPackage, Platform, ServerReply};
use crate::orchestrator::{InstallOrchestrator, InstallPhase, InstallSession};
use crate::registry::{DeviceRegistry, RegistryDiff};
use crate::selection::{ActiveSelection, SelectionPolicy};
use crate::server::{ArtifactApi, UploadOptions};
use crate::CoreConfig;

#[derive(Default)]
struct SessionState {
    connectivity: ConnectivityMonitor,
    registry: DeviceRegistry,
    selection: SelectionPolicy,
    orchestrator: InstallOrchestrator,
    catalog: ArtifactCatalog,
}

pub struct UpgradeSession<A, S> {
    agent: Arc<A>,
    server: Arc<S>,
    config: CoreConfig,
    state: Mutex<SessionState>,
    events: EventSink,
}

impl<A: AgentApi, S: ArtifactApi> UpgradeSession<A, S> {
    pub fn new(agent: Arc<A>, server: Arc<S>, config: CoreConfig) -> Self {
        Self {
            agent,
            server,
            config,
            state: Mutex::new(SessionState::default()),
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub async fn is_agent_reachable(&self) -> bool {
        self.state.lock().await.connectivity.is_reachable()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.state.lock().await.registry.devices().to_vec()
    }

    pub async fn selection(&self) -> Option<ActiveSelection> {
        self.state.lock().await.selection.current().cloned()
    }

    pub async fn install_session(&self) -> Option<InstallSession> {
        self.state.lock().await.orchestrator.session().cloned()
    }

    pub async fn install_phase(&self) -> InstallPhase {
        self.state.lock().await.orchestrator.phase()
    }

    pub async fn catalog(&self) -> ArtifactCatalog {
        self.state.lock().await.catalog.clone()
    }

    /// Bounded health check of the agent. Losing it empties the registry and
    /// drops the selection together with any install session.
    pub async fn probe_agent(&self) -> bool {
        let reachable = self.agent.probe(self.config.probe_timeout).await;
        let mut guard = self.state.lock().await;
        self.observe_connectivity(&mut guard, reachable);
        reachable
    }

    /// Re-reads the attached devices with one bounded listing, which doubles as
    /// the connectivity check. Never fails: an unreachable agent yields an empty
    /// list and flips connectivity.
    ///
    /// A listing overtaken by a newer one or by a connectivity loss changes
    /// nothing, including the connectivity flag.
    pub async fn refresh_devices(&self) -> Vec<Device> {
        let generation = self.state.lock().await.registry.begin_refresh();
        let listing = self.agent.list_devices(self.config.probe_timeout).await;

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.registry.is_superseded(generation) {
            debug!("device listing {generation} superseded, ignoring its outcome");
            return state.registry.devices().to_vec();
        }
        match listing {
            Ok(devices) => {
                if let Some(diff) = state.registry.apply(generation, devices) {
                    self.observe_connectivity(state, true);
                    self.reconcile(state, &diff);
                }
                state.registry.devices().to_vec()
            }
            Err(err) => {
                warn!("device listing failed: {err}");
                self.observe_connectivity(state, false);
                Vec::new()
            }
        }
    }

    /// Manual selection. A rejection is published as an event as well as returned.
    pub async fn select_device(
        &self,
        serial: &str,
        platform: Option<Platform>,
    ) -> Result<ActiveSelection, SelectError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let result = if state.connectivity.is_reachable() {
            state.selection.select(&state.registry, serial, platform)
        } else {
            Err(SelectError::AgentUnreachable)
        };
        match result {
            Ok(selection) => {
                let other_device = state
                    .orchestrator
                    .session()
                    .is_some_and(|s| s.device_serial != selection.device_serial);
                if other_device {
                    self.drop_install_session(state, "selected another device");
                }
                self.events
                    .send(SessionEvent::SelectionChanged(selection.clone()));
                Ok(selection)
            }
            Err(err) => {
                warn!("selection of {serial} rejected: {err}");
                self.events.send(SessionEvent::SelectionRejected {
                    serial: serial.to_string(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }

    /// Step 1: install the old build on the selected device.
    pub async fn start_old(&self, filename: &str) -> Result<InstalledPackage, InstallError> {
        let platform = {
            let state = self.state.lock().await;
            state
                .orchestrator
                .preflight_old(state.selection.current(), &state.registry)?
                .platform
        };
        self.require_agent().await?;
        let artifact_url = self.resolve_artifact(platform, filename).await?;

        let dispatch = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let dispatch = state.orchestrator.begin_old(
                state.selection.current(),
                &state.registry,
                filename,
                artifact_url,
            )?;
            self.publish_phase(state, &dispatch.request.device_serial);
            dispatch
        };

        let outcome = match self.agent.install_old(&dispatch.request).await {
            Ok(reply) => reply
                .into_outcome()
                .map_err(|reason| InstallError::Rejected { reason }),
            Err(err) => Err(InstallError::Transport(err.to_string())),
        };

        let mut guard = self.state.lock().await;
        let result = guard.orchestrator.complete_old(dispatch.epoch, outcome);
        if !matches!(result, Err(InstallError::Superseded)) {
            self.publish_phase(&guard, &dispatch.request.device_serial);
        }
        result
    }

    /// Step 2: overwrite the package captured by step 1 with the new build.
    ///
    /// All local preconditions are checked before anything goes on the wire.
    pub async fn start_new(&self, filename: &str) -> Result<String, InstallError> {
        let platform = {
            let state = self.state.lock().await;
            state
                .orchestrator
                .preflight_new(state.selection.current(), &state.registry)?;
            state
                .selection
                .current()
                .map(|s| s.platform)
                .ok_or(InstallError::NoSelection)?
        };
        self.require_agent().await?;
        let artifact_url = self.resolve_artifact(platform, filename).await?;

        let dispatch = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let dispatch = state.orchestrator.begin_new(
                state.selection.current(),
                &state.registry,
                filename,
                artifact_url,
            )?;
            self.publish_phase(state, &dispatch.request.device_serial);
            dispatch
        };

        let outcome = match self.agent.install_new(&dispatch.request).await {
            Ok(reply) => reply
                .into_outcome()
                .map_err(|reason| InstallError::Rejected { reason }),
            Err(err) => Err(InstallError::Transport(err.to_string())),
        };

        let mut guard = self.state.lock().await;
        let result = guard.orchestrator.complete_new(dispatch.epoch, outcome);
        if !matches!(result, Err(InstallError::Superseded)) {
            self.publish_phase(&guard, &dispatch.request.device_serial);
        }
        result
    }

    pub async fn reset_install(&self) {
        let mut guard = self.state.lock().await;
        self.drop_install_session(&mut guard, "reset by operator");
    }

    pub async fn refresh_catalog(&self) -> Result<usize, ClientError> {
        let listing = self.server.list_artifacts().await?;
        let mut state = self.state.lock().await;
        state.catalog.replace(listing);
        let builds = state.catalog.len();
        self.events.send(SessionEvent::CatalogRefreshed { builds });
        Ok(builds)
    }

    /// Uploads a build and refreshes the catalog whatever the server answered.
    pub async fn upload_build(
        &self,
        path: &Path,
        opts: &UploadOptions,
    ) -> Result<ServerReply, ClientError> {
        let reply = self.server.upload(path, opts).await?;
        info!("upload of {}: {}", path.display(), reply.detail());
        self.refresh_catalog_quietly().await;
        Ok(reply)
    }

    pub async fn delete_build(&self, filename: &str) -> Result<ServerReply, ClientError> {
        let reply = self.server.delete(filename).await?;
        info!("delete of {filename}: {}", reply.detail());
        self.refresh_catalog_quietly().await;
        Ok(reply)
    }

    pub async fn submit_fetch(
        &self,
        source_url: &str,
        remark: Option<&str>,
    ) -> Result<String, FetchError> {
        self.poller().submit(source_url, remark).await
    }

    /// Polls a fetch job to its end. On success the catalog is refreshed and
    /// guaranteed to list the fetched file before this returns.
    pub async fn run_fetch(
        &self,
        task_id: &str,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<FetchJob, FetchError> {
        let result = self
            .poller()
            .run(task_id, cancel_rx, |job| {
                self.events.send(SessionEvent::FetchProgress {
                    task_id: job.task_id.clone(),
                    percent: job.percent,
                    message: job.message.clone(),
                })
            })
            .await;

        match &result {
            Ok(job) => {
                self.refresh_catalog_quietly().await;
                if let Some(filename) = job.filename.as_deref() {
                    if self.state.lock().await.catalog.ensure_listed(filename) {
                        debug!("catalog listing lags behind; added {filename} locally");
                    }
                }
                self.events.send(SessionEvent::FetchFinished {
                    task_id: task_id.to_string(),
                    filename: job.filename.clone(),
                });
            }
            Err(FetchError::Cancelled) => debug!("fetch job {task_id}: polling cancelled"),
            Err(err) => self.events.send(SessionEvent::FetchFailed {
                task_id: task_id.to_string(),
                message: err.to_string(),
            }),
        }
        result
    }

    /// Polls `task_id` on a background task that stops when the handle is dropped.
    pub fn watch_fetch(self: &Arc<Self>, task_id: impl Into<String>) -> FetchWatch {
        let task_id = task_id.into();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let session = Arc::clone(self);
        let handle = tokio::spawn(async move { session.run_fetch(&task_id, cancel_rx).await });
        FetchWatch {
            cancel_tx,
            handle: Some(handle),
        }
    }

    /// Periodic connectivity probe plus device refresh until the handle is stopped or dropped.
    pub fn spawn_monitor(self: &Arc<Self>) -> MonitorHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let session = Arc::clone(self);
        let interval = self.config.probe_interval;
        let handle = tokio::spawn(async move {
            loop {
                if cancel_requested(&cancel_rx) {
                    break;
                }
                session.refresh_devices().await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || cancel_requested(&cancel_rx) {
                            break;
                        }
                    }
                }
            }
            debug!("device monitor stopped");
        });
        MonitorHandle {
            cancel_tx,
            handle: Some(handle),
        }
    }

    fn poller(&self) -> FetchPoller<S> {
        FetchPoller::new(Arc::clone(&self.server), self.config.poll_interval)
    }

    async fn require_agent(&self) -> Result<(), InstallError> {
        if self.probe_agent().await {
            Ok(())
        } else {
            Err(InstallError::AgentUnreachable)
        }
    }

    async fn resolve_artifact(
        &self,
        platform: Platform,
        filename: &str,
    ) -> Result<String, InstallError> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(InstallError::ArtifactNotFound(String::new()));
        }
        let known = self.state.lock().await.catalog.find(platform, filename).is_some();
        if !known {
            self.refresh_catalog_quietly().await;
            let known = self.state.lock().await.catalog.find(platform, filename).is_some();
            if !known {
                return Err(InstallError::ArtifactNotFound(filename.to_string()));
            }
        }
        Ok(self.server.artifact_url(filename))
    }

    async fn refresh_catalog_quietly(&self) {
        if let Err(err) = self.refresh_catalog().await {
            warn!("artifact catalog refresh failed: {err}");
        }
    }

    fn observe_connectivity(&self, state: &mut SessionState, reachable: bool) {
        let Some(edge) = state.connectivity.observe(reachable) else {
            return;
        };
        self.events.send(SessionEvent::Connectivity(edge));
        if edge == ConnectivityEdge::Lost {
            let diff = state.registry.clear();
            self.publish_diff(&diff);
            if let Some(selection) = state.selection.clear() {
                self.events.send(SessionEvent::SelectionCleared {
                    serial: selection.device_serial,
                });
            }
            self.drop_install_session(state, "local agent lost");
        }
    }

    fn reconcile(&self, state: &mut SessionState, diff: &RegistryDiff) {
        if !diff.is_unchanged() {
            info!(
                "devices: +{:?} -{:?} ({} kept)",
                diff.appeared,
                diff.vanished,
                diff.persisted.len()
            );
        }
        self.publish_diff(diff);
        for serial in &diff.vanished {
            if state.orchestrator.invalidate_device(serial) {
                self.events.send(SessionEvent::InstallPhase {
                    device_serial: serial.clone(),
                    phase: InstallPhase::Idle,
                    message: Some("device disconnected".into()),
                });
            }
        }

        let reconciled = state.selection.reconcile(&state.registry);
        if let Some(serial) = reconciled.invalidated {
            self.events.send(SessionEvent::SelectionCleared { serial });
        }
        if let Some(selection) = reconciled.auto_selected {
            let other_device = state
                .orchestrator
                .session()
                .is_some_and(|s| s.device_serial != selection.device_serial);
            if other_device {
                self.drop_install_session(state, "selection moved to another device");
            }
            self.events.send(SessionEvent::SelectionChanged(selection));
        }
    }

    fn publish_diff(&self, diff: &RegistryDiff) {
        for serial in &diff.appeared {
            self.events.send(SessionEvent::DeviceAppeared {
                serial: serial.clone(),
            });
        }
        for serial in &diff.vanished {
            self.events.send(SessionEvent::DeviceVanished {
                serial: serial.clone(),
            });
        }
    }

    fn drop_install_session(&self, state: &mut SessionState, why: &str) {
        let Some(serial) = state.orchestrator.session().map(|s| s.device_serial.clone()) else {
            return;
        };
        debug!("dropping install session on {serial}: {why}");
        state.orchestrator.reset();
        self.events.send(SessionEvent::InstallPhase {
            device_serial: serial,
            phase: InstallPhase::Idle,
            message: Some(why.to_string()),
        });
    }

    fn publish_phase(&self, state: &SessionState, device_serial: &str) {
        let (phase, message) = state
            .orchestrator
            .session()
            .map(|s| (s.phase, s.last_message.clone()))
            .unwrap_or((InstallPhase::Idle, None));
        self.events.send(SessionEvent::InstallPhase {
            device_serial: device_serial.to_string(),
            phase,
            message,
        });
    }
}

/// Background fetch poll; dropping it stops the poll loop.
pub struct FetchWatch {
    cancel_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<Result<FetchJob, FetchError>>>,
}

impl FetchWatch {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub async fn wait(mut self) -> Result<FetchJob, FetchError> {
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(err) => {
                    error!("fetch poll task ended abnormally: {err}");
                    Err(FetchError::Aborted(err.to_string()))
                }
            },
            None => Err(FetchError::Cancelled),
        }
    }
}

impl Drop for FetchWatch {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}

pub struct MonitorHandle {
    cancel_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    pub async fn stop(mut self) {
        let _ = self.cancel_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        let _ = self.cancel_tx.send(true);
    }
}
