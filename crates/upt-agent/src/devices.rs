//! Device enumeration, with Android screen/lock readiness over `adb shell dumpsys`.

use futures_util::future::join_all;
use tracing::{debug, warn};
use upt_core::model::{Device, Platform, CONNECTED_STATE};

use crate::adb::{adb_failure_message, adb_get_prop, adb_shell, list_adb_devices, AdbDevice, AdbFailure};
use crate::ios::list_ios_devices;

/// One dumpsys command and the markers that prove the facet holds.
pub(crate) struct Probe {
    pub(crate) command: &'static str,
    pub(crate) markers: &'static [&'static str],
}

pub(crate) const SCREEN_PROBES: &[Probe] = &[
    Probe {
        command: "dumpsys power",
        markers: &["mWakefulness=Awake"],
    },
    Probe {
        command: "dumpsys deviceidle",
        markers: &["mScreenOn=true"],
    },
    Probe {
        command: "dumpsys display",
        markers: &["state=ON"],
    },
];

pub(crate) const UNLOCK_PROBES: &[Probe] = &[
    Probe {
        command: "dumpsys window policy",
        markers: &["mShowingLockscreen=false", "mDreamingLockscreen=false"],
    },
    Probe {
        command: "dumpsys trust",
        markers: &["mDeviceLocked=false"],
    },
    Probe {
        command: "dumpsys activity activities",
        markers: &["mKeyguardShowing=false"],
    },
];

/// `Some(verdict)` ends the probe chain, `None` moves on to the next probe.
///
/// A command that cannot run at all counts as a pass so a broken dumpsys
/// does not lock the operator out.
pub(crate) fn verdict(probe: &Probe, output: &Result<String, AdbFailure>) -> Option<bool> {
    match output {
        Ok(text) => probe
            .markers
            .iter()
            .any(|marker| text.contains(marker))
            .then_some(true),
        Err(err) => {
            warn!(
                "{} failed, assuming pass: {}",
                probe.command,
                adb_failure_message(err)
            );
            Some(true)
        }
    }
}

pub(crate) async fn check(serial: &str, probes: &[Probe]) -> bool {
    for probe in probes {
        let output = adb_shell(serial, probe.command).await;
        if let Some(result) = verdict(probe, &output) {
            return result;
        }
    }
    debug!("{serial}: no probe confirmed the facet");
    false
}

pub(crate) async fn screen_on(serial: &str) -> bool {
    check(serial, SCREEN_PROBES).await
}

pub(crate) async fn unlocked(serial: &str) -> bool {
    check(serial, UNLOCK_PROBES).await
}

async fn describe(entry: AdbDevice) -> Device {
    let connected = entry.state == CONNECTED_STATE;
    let (screen_on, unlocked, model) = if connected {
        let model = adb_get_prop(&entry.serial, "ro.product.model").await;
        (screen_on(&entry.serial).await, unlocked(&entry.serial).await, model)
    } else {
        (false, false, None)
    };
    Device {
        model: model.or(entry.model).unwrap_or_default(),
        serial: entry.serial,
        platform: Platform::Android,
        state: entry.state,
        screen_on,
        unlocked,
        product: entry.product,
    }
}

/// Attached Android devices, each inspected concurrently.
pub(crate) async fn list_android_devices() -> Result<Vec<Device>, AdbFailure> {
    let entries = list_adb_devices().await?;
    Ok(join_all(entries.into_iter().map(describe)).await)
}

/// Every attached device, sorted by serial. A broken adb leaves only the iOS
/// devices, it does not fail the listing.
pub(crate) async fn list_devices() -> Vec<Device> {
    let (android, ios) = tokio::join!(list_android_devices(), list_ios_devices());
    let mut devices = android.unwrap_or_else(|err| {
        warn!("android device listing failed: {}", adb_failure_message(&err));
        Vec::new()
    });
    devices.extend(ios);
    devices.sort_by(|a, b| a.serial.cmp(&b.serial));
    devices
}
