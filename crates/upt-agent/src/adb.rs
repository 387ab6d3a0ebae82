use std::{io, path::Path, path::PathBuf, process::Output};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub(crate) enum AdbFailure {
    #[error("adb not found (set UPT_ADB_PATH or ANDROID_SDK_ROOT)")]
    NotFound,
    #[error("adb failed: {0}")]
    Io(String),
    #[error("adb command failed with exit {status}{}", exit_detail(.stdout, .stderr))]
    Exit {
        status: i32,
        stdout: String,
        stderr: String,
    },
}

pub(crate) fn adb_path() -> PathBuf {
    if let Ok(path) = std::env::var("UPT_ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(sdk_root) =
        std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
    {
        let tools = PathBuf::from(&sdk_root).join("platform-tools");
        for name in ["adb", "adb.exe"] {
            let candidate = tools.join(name);
            if candidate.exists() {
                return candidate;
            }
        }
    }
    PathBuf::from("adb")
}

pub(crate) async fn adb_output(args: &[&str]) -> Result<Output, AdbFailure> {
    debug!("adb {}", args.join(" "));
    let mut cmd = Command::new(adb_path());
    cmd.args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());
    let output = cmd.output().await.map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            AdbFailure::NotFound
        } else {
            AdbFailure::Io(e.to_string())
        }
    })?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(AdbFailure::Exit {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

pub(crate) fn format_adb_output(stdout: &str, stderr: &str) -> String {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

fn exit_detail(stdout: &str, stderr: &str) -> String {
    let detail = format_adb_output(stdout, stderr);
    if detail.is_empty() {
        detail
    } else {
        format!(": {detail}")
    }
}

pub(crate) fn adb_failure_message(err: &AdbFailure) -> String {
    err.to_string()
}

pub(crate) async fn adb_shell(serial: &str, cmd: &str) -> Result<String, AdbFailure> {
    let output = adb_output(&["-s", serial, "shell", cmd]).await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

pub(crate) async fn adb_get_prop(serial: &str, prop: &str) -> Option<String> {
    let timeout = std::time::Duration::from_secs(2);
    let args = ["-s", serial, "shell", "getprop", prop];
    match tokio::time::timeout(timeout, adb_output(&args)).await {
        Ok(Ok(output)) => {
            let value = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!value.is_empty()).then_some(value)
        }
        _ => None,
    }
}

/// Runs `adb install` with `flags`. Older adb versions exit 0 and print
/// `Failure [...]`, so stdout is checked too.
pub(crate) async fn adb_install(serial: &str, apk: &Path, flags: &[&str]) -> Result<(), AdbFailure> {
    let apk = apk.to_string_lossy();
    let mut args = vec!["-s", serial, "install"];
    args.extend_from_slice(flags);
    args.push(&*apk);
    let output = adb_output(&args).await?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    match install_failure(&stdout) {
        Some(reason) => Err(AdbFailure::Exit {
            status: 0,
            stdout: reason,
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }),
        None => Ok(()),
    }
}

pub(crate) async fn adb_uninstall(serial: &str, package: &str) -> Result<(), AdbFailure> {
    adb_output(&["-s", serial, "uninstall", package]).await.map(|_| ())
}

pub(crate) async fn launch_app(serial: &str, package: &str) -> Result<(), AdbFailure> {
    let cmd = format!("monkey -p {package} -c android.intent.category.LAUNCHER 1");
    let output = adb_shell(serial, &cmd).await?;
    if output.contains("No activities found") {
        return Err(AdbFailure::Exit {
            status: 0,
            stdout: output.trim().to_string(),
            stderr: String::new(),
        });
    }
    Ok(())
}

/// Package of the activity currently in front, if adb can tell.
pub(crate) async fn foreground_package(serial: &str) -> Option<String> {
    for cmd in ["dumpsys window", "dumpsys activity activities"] {
        if let Ok(output) = adb_shell(serial, cmd).await {
            if let Some(package) = parse_foreground_package(&output) {
                return Some(package);
            }
        }
    }
    None
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct AdbDevice {
    pub(crate) serial: String,
    pub(crate) state: String,
    pub(crate) model: Option<String>,
    pub(crate) product: Option<String>,
}

pub(crate) async fn list_adb_devices() -> Result<Vec<AdbDevice>, AdbFailure> {
    let output = adb_output(&["devices", "-l"]).await?;
    Ok(parse_adb_devices(&String::from_utf8_lossy(&output.stdout)))
}

pub(crate) fn parse_adb_devices(output: &str) -> Vec<AdbDevice> {
    let mut devices = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("List of devices attached") || line.starts_with('*')
        {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(serial), Some(state)) = (parts.next(), parts.next()) else {
            continue;
        };

        let mut device = AdbDevice {
            serial: serial.to_string(),
            state: state.to_string(),
            ..AdbDevice::default()
        };
        for part in parts {
            match part.split_once(':') {
                Some(("model", value)) => device.model = Some(value.replace('_', " ")),
                Some(("product", value)) => device.product = Some(value.to_string()),
                _ => {}
            }
        }
        devices.push(device);
    }

    devices
}

fn install_failure(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("Failure") || line.contains("INSTALL_FAILED"))
        .map(str::to_string)
}

const FOCUS_KEYS: [&str; 4] = [
    "mCurrentFocus",
    "mFocusedApp",
    "topResumedActivity",
    "mResumedActivity",
];

pub(crate) fn parse_foreground_package(output: &str) -> Option<String> {
    output
        .lines()
        .filter(|line| FOCUS_KEYS.iter().any(|key| line.contains(key)))
        .flat_map(|line| line.split_whitespace())
        .filter_map(|token| token.split_once('/').map(|(package, _)| package))
        .map(|package| package.trim_start_matches('{'))
        .find(|package| package.contains('.') && !package.contains('='))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEVICES_L: &str = "List of devices attached\n\
        * daemon started successfully\n\
        R58M123ABC             device usb:1-1 product:beyond1lteeea model:SM_G973F device:beyond1 transport_id:3\n\
        emulator-5554          unauthorized usb:1-2 transport_id:4\n\
        \n";

    #[test]
    fn devices_listing_is_parsed() {
        let devices = parse_adb_devices(DEVICES_L);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].serial, "R58M123ABC");
        assert_eq!(devices[0].state, "device");
        assert_eq!(devices[0].model.as_deref(), Some("SM G973F"));
        assert_eq!(devices[0].product.as_deref(), Some("beyond1lteeea"));
        assert_eq!(devices[1].state, "unauthorized");
        assert_eq!(devices[1].model, None);
    }

    #[test]
    fn foreground_package_from_window_dump() {
        let window = "  mCurrentFocus=Window{5c3e2a1 u0 com.example.shop/com.example.shop.MainActivity}\n  mFocusedApp=ActivityRecord{1f u0 com.example.shop/.MainActivity t42}";
        assert_eq!(
            parse_foreground_package(window).as_deref(),
            Some("com.example.shop")
        );
        let activities = "    topResumedActivity=ActivityRecord{9a0b u0 com.android.launcher3/.uioverrides.QuickstepLauncher t1}";
        assert_eq!(
            parse_foreground_package(activities).as_deref(),
            Some("com.android.launcher3")
        );
        assert_eq!(parse_foreground_package("mCurrentFocus=null"), None);
    }

    #[test]
    fn silent_install_failure_is_detected() {
        assert_eq!(
            install_failure("Performing Streamed Install\nFailure [INSTALL_FAILED_VERSION_DOWNGRADE]\n")
                .as_deref(),
            Some("Failure [INSTALL_FAILED_VERSION_DOWNGRADE]")
        );
        assert_eq!(install_failure("Performing Streamed Install\nSuccess\n"), None);
    }

    #[test]
    fn failure_messages_are_readable() {
        let err = AdbFailure::Exit {
            status: 1,
            stdout: String::new(),
            stderr: "error: device 'X' not found\n".into(),
        };
        assert_eq!(
            adb_failure_message(&err),
            "adb command failed with exit 1: error: device 'X' not found"
        );
        assert!(adb_failure_message(&AdbFailure::NotFound).contains("UPT_ADB_PATH"));
    }
}
