use tracing::info;

use crate::error::SelectError;
use crate::model::{Device, Platform};
use crate::registry::DeviceRegistry;

/// A device may take installs only when connected, screen on and unlocked.
pub fn selectable(device: &Device) -> bool {
    device.is_ready()
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveSelection {
    pub device_serial: String,
    pub platform: Platform,
}

/// Result of reconciling the selection with a fresh registry snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciled {
    /// Serial of a selection dropped because its device disappeared.
    pub invalidated: Option<String>,
    /// Selection made automatically during this pass.
    pub auto_selected: Option<ActiveSelection>,
}

#[derive(Clone, Debug, Default)]
pub struct SelectionPolicy {
    current: Option<ActiveSelection>,
}

impl SelectionPolicy {
    pub fn current(&self) -> Option<&ActiveSelection> {
        self.current.as_ref()
    }

    /// Manual selection. Accepted only for a device present and ready in the latest snapshot.
    pub fn select(
        &mut self,
        registry: &DeviceRegistry,
        serial: &str,
        platform: Option<Platform>,
    ) -> Result<ActiveSelection, SelectError> {
        let device = registry
            .get(serial)
            .ok_or_else(|| SelectError::UnknownDevice(serial.to_string()))?;
        if let Some(requested) = platform {
            if requested != device.platform {
                return Err(SelectError::PlatformMismatch {
                    serial: serial.to_string(),
                    requested: requested.to_string(),
                    actual: device.platform.to_string(),
                });
            }
        }
        if let Some(reason) = device.not_ready_reason() {
            return Err(SelectError::NotReady {
                serial: serial.to_string(),
                reason,
            });
        }
        let selection = ActiveSelection {
            device_serial: device.serial.clone(),
            platform: device.platform,
        };
        info!(
            "selected device {} ({})",
            selection.device_serial, selection.platform
        );
        self.current = Some(selection.clone());
        Ok(selection)
    }

    pub fn clear(&mut self) -> Option<ActiveSelection> {
        self.current.take()
    }

    /// Applies the auto-selection rules against `registry`.
    ///
    /// A selection whose device is still present is kept untouched, even if the
    /// device is momentarily not ready; installs re-check readiness at dispatch.
    /// A selection whose device vanished is dropped. With no valid selection the
    /// first ready device in registry order is chosen; non-ready devices are
    /// never auto-selected.
    pub fn reconcile(&mut self, registry: &DeviceRegistry) -> Reconciled {
        let mut outcome = Reconciled::default();

        if let Some(current) = self.current.as_ref() {
            if registry.contains(&current.device_serial) {
                return outcome;
            }
            info!(
                "selected device {} disappeared; clearing selection",
                current.device_serial
            );
            outcome.invalidated = self.current.take().map(|s| s.device_serial);
        }

        if let Some(device) = registry.devices().iter().find(|d| selectable(d)) {
            let selection = ActiveSelection {
                device_serial: device.serial.clone(),
                platform: device.platform,
            };
            info!("auto-selected ready device {}", selection.device_serial);
            self.current = Some(selection.clone());
            outcome.auto_selected = Some(selection);
        }

        outcome
    }
}
