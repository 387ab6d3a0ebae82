//! The two install steps as the agent performs them on a device.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use upt_core::model::Platform;

use crate::adb::{
    adb_failure_message, adb_install, adb_uninstall, foreground_package, launch_app,
};
use crate::apk::read_apk_info;
use crate::devices;
use crate::download::{download_build, TempBuild};
use crate::inventory::DeviceCache;

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct InstallOldBody {
    pub(crate) device_serial: Option<String>,
    pub(crate) apk_url: Option<String>,
    pub(crate) old_apk_name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct InstallNewBody {
    pub(crate) device_serial: Option<String>,
    pub(crate) package_name: Option<String>,
    pub(crate) apk_url: Option<String>,
    pub(crate) new_apk_name: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub(crate) struct AgentReply {
    pub(crate) status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) package_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) version_code: Option<String>,
}

impl AgentReply {
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        warn!("install rejected: {reason}");
        Self {
            status: "error".into(),
            reason: Some(reason),
            ..Self::default()
        }
    }

    pub(crate) fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".into(),
            message: Some(message.into()),
            ..Self::default()
        }
    }
}

fn required(value: Option<String>, what: &str) -> Result<String, AgentReply> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AgentReply::failed(format!("missing {what}")))
}

pub(crate) struct Installer {
    client: Client,
    scratch: PathBuf,
    settle: Duration,
    devices: Arc<DeviceCache>,
    busy: Mutex<HashSet<String>>,
}

/// Marks a device busy for the lifetime of one install.
struct DeviceClaim<'a> {
    busy: &'a Mutex<HashSet<String>>,
    serial: String,
}

impl Drop for DeviceClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.busy.lock() {
            busy.remove(&self.serial);
        }
    }
}

impl Installer {
    pub(crate) fn new(
        client: Client,
        scratch: PathBuf,
        settle: Duration,
        devices: Arc<DeviceCache>,
    ) -> Self {
        Self {
            client,
            scratch,
            settle,
            devices,
            busy: Mutex::new(HashSet::new()),
        }
    }

    async fn require_android(&self, serial: &str) -> Result<(), AgentReply> {
        match self.devices.platform_of(serial).await {
            Some(Platform::Ios) => Err(AgentReply::failed(format!(
                "{serial} is an iOS device; this agent installs on Android only"
            ))),
            _ => Ok(()),
        }
    }

    fn claim(&self, serial: &str) -> Result<DeviceClaim<'_>, AgentReply> {
        let mut busy = self
            .busy
            .lock()
            .map_err(|_| AgentReply::failed("installer state poisoned"))?;
        if !busy.insert(serial.to_string()) {
            return Err(AgentReply::failed(format!(
                "another install is running on {serial}"
            )));
        }
        Ok(DeviceClaim {
            busy: &self.busy,
            serial: serial.to_string(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<TempBuild, AgentReply> {
        download_build(&self.client, url, &self.scratch)
            .await
            .map_err(AgentReply::failed)
    }

    async fn settle_and_check(&self, serial: &str, package: &str) -> Result<(), String> {
        tokio::time::sleep(self.settle).await;
        match foreground_package(serial).await {
            Some(current) if current == package => Ok(()),
            Some(current) => Err(current),
            None => Err("unknown".into()),
        }
    }

    /// Step 1: clean install of the old build, then launch it for the operator to inspect.
    pub(crate) async fn install_old(&self, body: InstallOldBody) -> AgentReply {
        match self.try_install_old(body).await {
            Ok(reply) | Err(reply) => reply,
        }
    }

    async fn try_install_old(&self, body: InstallOldBody) -> Result<AgentReply, AgentReply> {
        let serial = required(body.device_serial, "device_serial")?;
        let url = required(body.apk_url, "apk_url")?;
        let label = body.old_apk_name.unwrap_or_else(|| url.clone());
        self.require_android(&serial).await?;
        let _claim = self.claim(&serial)?;

        if !devices::screen_on(&serial).await {
            return Err(AgentReply::failed("screen is off, turn it on first"));
        }
        if !devices::unlocked(&serial).await {
            return Err(AgentReply::failed("device is locked, unlock it first"));
        }

        let build = self.fetch(&url).await?;
        let apk = read_apk_info(build.path()).await.map_err(AgentReply::failed)?;
        info!(
            "step 1 on {serial}: {label} ({} {} / {})",
            apk.package, apk.version_name, apk.version_code
        );

        if let Err(err) = adb_uninstall(&serial, &apk.package).await {
            info!(
                "uninstall of {} skipped: {}",
                apk.package,
                adb_failure_message(&err)
            );
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        adb_install(&serial, build.path(), &["-r", "-t"])
            .await
            .map_err(|err| AgentReply::failed(adb_failure_message(&err)))?;
        drop(build);

        if let Err(err) = launch_app(&serial, &apk.package).await {
            warn!("launch of {} failed: {}", apk.package, adb_failure_message(&err));
        }
        if let Err(current) = self.settle_and_check(&serial, &apk.package).await {
            warn!(
                "{} may not have started; foreground is {current}",
                apk.package
            );
        }

        Ok(AgentReply {
            package_name: Some(apk.package.clone()),
            version_name: Some(apk.version_name.clone()),
            version_code: Some(apk.version_code.clone()),
            ..AgentReply::success(format!(
                "old build installed: {} (v{})",
                apk.package, apk.version_name
            ))
        })
    }

    /// Step 2: overwrite install keeping app data, then verify the app comes up.
    pub(crate) async fn install_new(&self, body: InstallNewBody) -> AgentReply {
        match self.try_install_new(body).await {
            Ok(reply) | Err(reply) => reply,
        }
    }

    async fn try_install_new(&self, body: InstallNewBody) -> Result<AgentReply, AgentReply> {
        let serial = required(body.device_serial, "device_serial")?;
        let url = required(body.apk_url, "apk_url")?;
        let package = required(body.package_name, "package_name")?;
        let label = body.new_apk_name.unwrap_or_else(|| url.clone());
        self.require_android(&serial).await?;
        let _claim = self.claim(&serial)?;

        let build = self.fetch(&url).await?;
        let (version_name, version_code) = match read_apk_info(build.path()).await {
            Ok(apk) if apk.package != package => {
                return Err(AgentReply::failed(format!(
                    "package name mismatch: installed {package}, new build is {}",
                    apk.package
                )));
            }
            Ok(apk) => (apk.version_name, apk.version_code),
            Err(err) => {
                warn!("could not read {label}: {err}; installing anyway");
                (String::from("?"), String::from("?"))
            }
        };
        info!("step 2 on {serial}: {label} over {package} ({version_name} / {version_code})");

        adb_install(&serial, build.path(), &["-r"])
            .await
            .map_err(|err| AgentReply::failed(adb_failure_message(&err)))?;
        drop(build);

        if let Err(err) = launch_app(&serial, &package).await {
            warn!("launch of {package} failed: {}", adb_failure_message(&err));
        }
        match self.settle_and_check(&serial, &package).await {
            Ok(()) => Ok(AgentReply::success(format!(
                "update succeeded, app is running: version {version_name} ({version_code})"
            ))),
            Err(current) => Err(AgentReply::failed(format!(
                "app is not in foreground after update (current: {current})"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn installer() -> Installer {
        Installer::new(
            Client::new(),
            std::env::temp_dir().join("upt-agent-install-test"),
            Duration::ZERO,
            Arc::new(DeviceCache::default()),
        )
    }

    #[tokio::test]
    async fn missing_fields_are_rejected_before_touching_the_device() {
        let installer = installer();
        let reply = installer.install_old(InstallOldBody::default()).await;
        assert_eq!(reply.status, "error");
        assert_eq!(reply.reason.as_deref(), Some("missing device_serial"));

        let reply = installer
            .install_new(InstallNewBody {
                device_serial: Some("R58M".into()),
                apk_url: Some("http://server/uploads/new.apk".into()),
                package_name: Some("  ".into()),
                new_apk_name: None,
            })
            .await;
        assert_eq!(reply.reason.as_deref(), Some("missing package_name"));
    }

    #[tokio::test]
    async fn ios_devices_are_refused_before_any_download() {
        let installer = installer();
        installer
            .devices
            .store(vec![crate::ios::ios_device("00008030".into(), None, None)])
            .await;
        let reply = installer
            .install_old(InstallOldBody {
                device_serial: Some("00008030".into()),
                apk_url: Some("http://127.0.0.1:9/uploads/old.apk".into()),
                old_apk_name: None,
            })
            .await;
        assert_eq!(reply.status, "error");
        assert!(reply.reason.unwrap().contains("Android only"));
    }

    #[test]
    fn a_device_takes_one_install_at_a_time() {
        let installer = installer();
        let claim = installer.claim("R58M").unwrap();
        assert!(installer.claim("R58M").is_err());
        assert!(installer.claim("other").is_ok());
        drop(claim);
        assert!(installer.claim("R58M").is_ok());
    }

    #[test]
    fn replies_serialize_to_the_wire_shape() {
        let reply = AgentReply {
            package_name: Some("com.x".into()),
            version_name: Some("1.0".into()),
            version_code: Some("10".into()),
            ..AgentReply::success("ok")
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["package_name"], "com.x");
        assert!(json.get("reason").is_none());

        let json = serde_json::to_value(AgentReply::failed("INSTALL_FAILED")).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["reason"], "INSTALL_FAILED");
    }
}
