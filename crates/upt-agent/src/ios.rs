//! iOS devices as seen by libimobiledevice (`idevice_id`, `ideviceinfo`).
//!
//! They are listed so operators see them, with screen and lock state assumed
//! good since neither tool reports it. Installs stay Android-only.

use std::{collections::HashSet, io, path::PathBuf, process::Stdio, time::Duration};

use futures_util::future::join_all;
use tokio::process::Command;
use tracing::{debug, warn};
use upt_core::model::{Device, Platform, CONNECTED_STATE};

const INFO_TIMEOUT: Duration = Duration::from_secs(2);

fn tool(name: &str) -> PathBuf {
    match std::env::var("UPT_IMOBILEDEVICE_DIR") {
        Ok(dir) if !dir.trim().is_empty() => PathBuf::from(dir).join(name),
        _ => PathBuf::from(name),
    }
}

async fn run(name: &str, args: &[&str]) -> io::Result<String> {
    let output = Command::new(tool(name))
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;
    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        Err(io::Error::other(format!(
            "{name} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// UDIDs from `idevice_id -l`; network entries carry a ` (Network)` suffix.
pub(crate) fn parse_udids(output: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|udid| seen.insert(*udid))
        .map(str::to_string)
        .collect()
}

async fn device_value(udid: &str, key: &str) -> Option<String> {
    let args = ["-u", udid, "-k", key];
    match tokio::time::timeout(INFO_TIMEOUT, run("ideviceinfo", &args)).await {
        Ok(Ok(value)) => Some(value.trim().to_string()).filter(|v| !v.is_empty()),
        Ok(Err(err)) => {
            debug!("ideviceinfo {key} for {udid} failed: {err}");
            None
        }
        Err(_) => {
            debug!("ideviceinfo {key} for {udid} timed out");
            None
        }
    }
}

pub(crate) fn ios_device(udid: String, name: Option<String>, product: Option<String>) -> Device {
    Device {
        serial: udid,
        model: name.unwrap_or_else(|| "iOS Device".into()),
        platform: Platform::Ios,
        state: CONNECTED_STATE.into(),
        screen_on: true,
        unlocked: true,
        product,
    }
}

async fn describe(udid: String) -> Device {
    let name = device_value(&udid, "DeviceName").await;
    let product = device_value(&udid, "ProductType").await;
    ios_device(udid, name, product)
}

/// Attached iOS devices; empty when libimobiledevice is missing or fails.
pub(crate) async fn list_ios_devices() -> Vec<Device> {
    let output = match run("idevice_id", &["-l"]).await {
        Ok(output) => output,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            debug!("idevice_id not installed, iOS devices are not listed");
            return Vec::new();
        }
        Err(err) => {
            warn!("iOS device listing failed: {err}");
            return Vec::new();
        }
    };
    join_all(parse_udids(&output).into_iter().map(describe)).await
}
