//! Two-step upgrade install: old build, manual checkpoint, overwrite with the new build.
//!
//! The orchestrator itself performs no I/O. Each step is split into `begin_*`,
//! which validates and moves the session into its in-flight phase, and
//! `complete_*`, which applies the agent's answer. Every dispatch carries an
//! epoch; an answer whose epoch no longer matches the live session is
//! discarded, so a reset or device loss during an install cannot be undone by
//! a late reply.

use std::fmt;

use tracing::{info, warn};

use crate::error::InstallError;
use crate::model::{InstallNewRequest, InstallOldRequest, InstalledPackage};
use crate::registry::DeviceRegistry;
use crate::selection::ActiveSelection;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum InstallPhase {
    #[default]
    Idle,
    OldInstalling,
    OldInstalled,
    NewInstalling,
    Completed,
    Failed,
}

impl InstallPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            InstallPhase::Idle => "idle",
            InstallPhase::OldInstalling => "old_installing",
            InstallPhase::OldInstalled => "old_installed",
            InstallPhase::NewInstalling => "new_installing",
            InstallPhase::Completed => "completed",
            InstallPhase::Failed => "failed",
        }
    }

    pub fn in_flight(self) -> bool {
        matches!(self, InstallPhase::OldInstalling | InstallPhase::NewInstalling)
    }
}

impl fmt::Display for InstallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallSession {
    pub device_serial: String,
    pub package_identifier: Option<String>,
    pub version_name: Option<String>,
    pub version_code: Option<String>,
    pub phase: InstallPhase,
    pub old_artifact: String,
    pub new_artifact: Option<String>,
    /// Last operator-facing result text (agent message or failure reason).
    pub last_message: Option<String>,
    epoch: u64,
}

/// A validated request ready to send, tagged with the epoch its reply must match.
#[derive(Clone, Debug)]
pub struct Dispatch<R> {
    pub epoch: u64,
    pub request: R,
}

#[derive(Clone, Debug, Default)]
pub struct InstallOrchestrator {
    session: Option<InstallSession>,
    next_epoch: u64,
}

impl InstallOrchestrator {
    pub fn session(&self) -> Option<&InstallSession> {
        self.session.as_ref()
    }

    pub fn phase(&self) -> InstallPhase {
        self.session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(InstallPhase::Idle)
    }

    /// Drops the session. A reply still in flight becomes stale.
    pub fn reset(&mut self) {
        if let Some(session) = self.session.take() {
            info!(
                "install session on {} reset from {}",
                session.device_serial, session.phase
            );
        }
    }

    /// Resets the session if it belongs to `serial`. Returns whether it did.
    pub fn invalidate_device(&mut self, serial: &str) -> bool {
        let owned = self
            .session
            .as_ref()
            .is_some_and(|s| s.device_serial == serial);
        if owned {
            warn!("device {serial} lost; invalidating its install session");
            self.session = None;
        }
        owned
    }

    /// Local checks for step 1; issues no request.
    pub fn preflight_old<'a>(
        &self,
        selection: Option<&'a ActiveSelection>,
        registry: &DeviceRegistry,
    ) -> Result<&'a ActiveSelection, InstallError> {
        let phase = self.phase();
        if phase.in_flight() {
            return Err(InstallError::Busy(phase));
        }
        ready_target(selection, registry)
    }

    pub fn begin_old(
        &mut self,
        selection: Option<&ActiveSelection>,
        registry: &DeviceRegistry,
        artifact_name: &str,
        artifact_url: String,
    ) -> Result<Dispatch<InstallOldRequest>, InstallError> {
        let target = self.preflight_old(selection, registry)?;
        self.reset();

        let epoch = self.bump_epoch();
        let device_serial = target.device_serial.clone();
        info!("step 1: installing {artifact_name} on {device_serial}");
        self.session = Some(InstallSession {
            device_serial: device_serial.clone(),
            package_identifier: None,
            version_name: None,
            version_code: None,
            phase: InstallPhase::OldInstalling,
            old_artifact: artifact_name.to_string(),
            new_artifact: None,
            last_message: None,
            epoch,
        });
        Ok(Dispatch {
            epoch,
            request: InstallOldRequest {
                device_serial,
                apk_url: artifact_url,
                old_apk_name: Some(artifact_name.to_string()),
            },
        })
    }

    pub fn complete_old(
        &mut self,
        epoch: u64,
        outcome: Result<InstalledPackage, InstallError>,
    ) -> Result<InstalledPackage, InstallError> {
        let session = self.live_session(epoch, InstallPhase::OldInstalling)?;
        match outcome {
            Ok(package) => {
                info!(
                    "step 1 done on {}: {} {} ({})",
                    session.device_serial,
                    package.package_identifier,
                    package.version_name,
                    package.version_code
                );
                session.package_identifier = Some(package.package_identifier.clone());
                session.version_name = Some(package.version_name.clone());
                session.version_code = Some(package.version_code.clone());
                session.phase = InstallPhase::OldInstalled;
                session.last_message = None;
                Ok(package)
            }
            Err(err) => {
                warn!("step 1 failed on {}: {err}", session.device_serial);
                session.phase = InstallPhase::Failed;
                session.last_message = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Local checks for step 2; issues no request. Returns the captured package identifier.
    pub fn preflight_new(
        &self,
        selection: Option<&ActiveSelection>,
        registry: &DeviceRegistry,
    ) -> Result<String, InstallError> {
        let session = self
            .session
            .as_ref()
            .ok_or(InstallError::WrongPhase(InstallPhase::Idle))?;
        if session.phase != InstallPhase::OldInstalled {
            return Err(InstallError::WrongPhase(session.phase));
        }
        let package = session
            .package_identifier
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(InstallError::MissingPackage)?;
        let target = ready_target(selection, registry)?;
        if target.device_serial != session.device_serial {
            return Err(InstallError::DeviceMismatch {
                session: session.device_serial.clone(),
                selected: target.device_serial.clone(),
            });
        }
        Ok(package.to_string())
    }

    pub fn begin_new(
        &mut self,
        selection: Option<&ActiveSelection>,
        registry: &DeviceRegistry,
        artifact_name: &str,
        artifact_url: String,
    ) -> Result<Dispatch<InstallNewRequest>, InstallError> {
        let package_name = self.preflight_new(selection, registry)?;
        let epoch = self.bump_epoch();
        let session = self
            .session
            .as_mut()
            .ok_or(InstallError::WrongPhase(InstallPhase::Idle))?;
        info!(
            "step 2: overwriting {package_name} with {artifact_name} on {}",
            session.device_serial
        );
        session.phase = InstallPhase::NewInstalling;
        session.new_artifact = Some(artifact_name.to_string());
        session.epoch = epoch;
        Ok(Dispatch {
            epoch,
            request: InstallNewRequest {
                device_serial: session.device_serial.clone(),
                package_name,
                apk_url: artifact_url,
                new_apk_name: Some(artifact_name.to_string()),
            },
        })
    }

    pub fn complete_new(
        &mut self,
        epoch: u64,
        outcome: Result<String, InstallError>,
    ) -> Result<String, InstallError> {
        let session = self.live_session(epoch, InstallPhase::NewInstalling)?;
        match outcome {
            Ok(message) => {
                info!("step 2 done on {}: {message}", session.device_serial);
                session.phase = InstallPhase::Completed;
                session.last_message = Some(message.clone());
                Ok(message)
            }
            Err(err) => {
                warn!("step 2 failed on {}: {err}", session.device_serial);
                session.phase = InstallPhase::Failed;
                session.last_message = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn live_session(
        &mut self,
        epoch: u64,
        expected: InstallPhase,
    ) -> Result<&mut InstallSession, InstallError> {
        match self.session.as_mut() {
            Some(session) if session.epoch == epoch && session.phase == expected => Ok(session),
            _ => {
                warn!("discarding stale install reply (epoch {epoch})");
                Err(InstallError::Superseded)
            }
        }
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }
}

fn ready_target<'a>(
    selection: Option<&'a ActiveSelection>,
    registry: &DeviceRegistry,
) -> Result<&'a ActiveSelection, InstallError> {
    let selection = selection.ok_or(InstallError::NoSelection)?;
    let device = registry
        .get(&selection.device_serial)
        .ok_or_else(|| InstallError::DeviceGone(selection.device_serial.clone()))?;
    if let Some(reason) = device.not_ready_reason() {
        return Err(InstallError::DeviceNotReady {
            serial: selection.device_serial.clone(),
            reason,
        });
    }
    Ok(selection)
}
