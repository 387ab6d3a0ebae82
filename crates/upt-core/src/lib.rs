//! Orchestration core for two-step app upgrade tests on attached devices.
//!
//! The core talks to two collaborators over HTTP: the local device-control
//! agent (device listing and installs) and the remote artifact server (build
//! catalog, uploads and server-side fetch jobs). [`UpgradeSession`] owns all
//! mutable state; the other modules are the pure pieces it is built from.

use std::time::Duration;

pub mod agent;
pub mod catalog;
pub mod connectivity;
pub mod error;
pub mod events;
pub mod fetch;
mod http;
pub mod model;
pub mod orchestrator;
pub mod registry;
pub mod selection;
pub mod server;
pub mod session;

#[cfg(test)]
mod testing;

pub use agent::{AgentApi, HttpAgent};
pub use catalog::ArtifactCatalog;
pub use connectivity::{ConnectivityEdge, ConnectivityMonitor};
pub use error::{ClientError, FetchError, InstallError, SelectError};
pub use events::{EventSink, SessionEvent};
pub use fetch::FetchPoller;
pub use model::{BuildArtifact, Device, FetchJob, FetchStatus, InstalledPackage, Platform};
pub use orchestrator::{InstallOrchestrator, InstallPhase, InstallSession};
pub use registry::{DeviceRegistry, RegistryDiff};
pub use selection::{selectable, ActiveSelection, SelectionPolicy};
pub use server::{ArtifactApi, HttpArtifactServer, UploadOptions};
pub use session::{FetchWatch, MonitorHandle, UpgradeSession};

/// Timing knobs of the session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            probe_interval: upt_util::DEFAULT_PROBE_INTERVAL,
            probe_timeout: upt_util::DEFAULT_PROBE_TIMEOUT,
            poll_interval: upt_util::DEFAULT_POLL_INTERVAL,
        }
    }
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            probe_interval: upt_util::env_duration_ms(
                "UPT_PROBE_INTERVAL_MS",
                upt_util::DEFAULT_PROBE_INTERVAL,
            ),
            probe_timeout: upt_util::env_duration_ms(
                "UPT_PROBE_TIMEOUT_MS",
                upt_util::DEFAULT_PROBE_TIMEOUT,
            ),
            poll_interval: upt_util::env_duration_ms(
                "UPT_POLL_INTERVAL_MS",
                upt_util::DEFAULT_POLL_INTERVAL,
            ),
        }
    }
}
