use std::time::Duration;

use thiserror::Error;

use crate::orchestrator::InstallPhase;

/// Failure talking to the agent or the artifact server.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid URL: {0}")]
    Url(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectError {
    #[error("local agent is not reachable")]
    AgentUnreachable,
    #[error("device {0} is not attached")]
    UnknownDevice(String),
    #[error("device {serial} is not ready: {reason}")]
    NotReady { serial: String, reason: String },
    #[error("device {serial} is {actual}, not {requested}")]
    PlatformMismatch {
        serial: String,
        requested: String,
        actual: String,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InstallError {
    #[error("no device selected")]
    NoSelection,
    #[error("local agent is not reachable")]
    AgentUnreachable,
    #[error("device {0} is no longer attached")]
    DeviceGone(String),
    #[error("device {serial} is not ready: {reason}")]
    DeviceNotReady { serial: String, reason: String },
    #[error("build {0} is not in the catalog")]
    ArtifactNotFound(String),
    #[error("an install is already running ({0})")]
    Busy(InstallPhase),
    #[error("step 2 needs a successful step 1 first (session is {0})")]
    WrongPhase(InstallPhase),
    #[error("no package identifier was captured by step 1")]
    MissingPackage,
    #[error("install session belongs to {session}, selected device is {selected}")]
    DeviceMismatch { session: String, selected: String },
    #[error("{reason}")]
    Rejected { reason: String },
    #[error("agent request failed: {0}")]
    Transport(String),
    #[error("install session was reset while the request was in flight")]
    Superseded,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("fetch request rejected: {message}")]
    Rejected { message: String },
    #[error("fetch job failed: {message}")]
    Failed { message: String },
    #[error("server request failed: {0}")]
    Transport(String),
    #[error("fetch polling cancelled")]
    Cancelled,
    #[error("fetch polling stopped unexpectedly: {0}")]
    Aborted(String),
}
