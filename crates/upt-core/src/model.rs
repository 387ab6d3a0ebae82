use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[default]
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Android => "android",
            Platform::Ios => "ios",
        }
    }

    /// Best guess from a build file name; anything that is not an `.ipa` is treated as Android.
    pub fn from_filename(filename: &str) -> Self {
        if filename.to_ascii_lowercase().ends_with(".ipa") {
            Platform::Ios
        } else {
            Platform::Android
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Platform::Android),
            "ios" => Ok(Platform::Ios),
            other => Err(format!("unknown platform: {other}")),
        }
    }
}

/// A device as reported by the agent's `GET /devices`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub serial: String,
    pub model: String,
    pub platform: Platform,
    pub state: String,
    pub screen_on: bool,
    pub unlocked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
}

pub const CONNECTED_STATE: &str = "device";

impl Device {
    pub fn is_connected(&self) -> bool {
        self.state == CONNECTED_STATE
    }

    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.screen_on && self.unlocked
    }

    /// Operator-facing explanation of why the device cannot take an install.
    pub fn not_ready_reason(&self) -> Option<String> {
        if !self.is_connected() {
            return Some(format!("device state is {}", display_state(&self.state)));
        }
        match (self.screen_on, self.unlocked) {
            (true, true) => None,
            (false, true) => Some("screen is off".into()),
            (true, false) => Some("device is locked".into()),
            (false, false) => Some("screen is off and device is locked".into()),
        }
    }

    pub fn display_name(&self) -> &str {
        if self.model.trim().is_empty() {
            &self.serial
        } else {
            &self.model
        }
    }
}

fn display_state(state: &str) -> &str {
    if state.trim().is_empty() {
        "unknown"
    } else {
        state
    }
}

/// A build file held by the artifact server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildArtifact {
    pub filename: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub custom_name: String,
    #[serde(rename = "package_name", alias = "bundle_id")]
    pub package_identifier: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version_name: String,
    #[serde(deserialize_with = "string_or_number")]
    pub version_code: String,
    pub upload_time: String,
}

impl BuildArtifact {
    pub fn display_name(&self) -> &str {
        if self.custom_name.trim().is_empty() {
            &self.filename
        } else {
            &self.custom_name
        }
    }
}

/// `GET /apks` answers either a flat list (older servers) or a per-platform map.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ArtifactListing {
    Flat(Vec<BuildArtifact>),
    ByPlatform {
        #[serde(default)]
        android: Vec<BuildArtifact>,
        #[serde(default)]
        ios: Vec<BuildArtifact>,
    },
}

/// Generic `{status, message}` reply used by upload and delete.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerReply {
    pub status: String,
    pub message: Option<String>,
    pub filename: Option<String>,
    pub error: Option<String>,
}

impl ServerReply {
    pub fn is_success(&self) -> bool {
        self.status == "success"
    }

    pub fn detail(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| format!("status={}", display_state(&self.status)))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstallOldRequest {
    pub device_serial: String,
    pub apk_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_apk_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstallNewRequest {
    pub device_serial: String,
    pub package_name: String,
    pub apk_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_apk_name: Option<String>,
}

/// Wire reply of `POST /install_old`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct InstallOldReply {
    pub status: String,
    pub package_name: Option<String>,
    #[serde(deserialize_with = "opt_string_or_number")]
    pub version_name: Option<String>,
    #[serde(deserialize_with = "opt_string_or_number")]
    pub version_code: Option<String>,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Wire reply of `POST /install_new`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct InstallNewReply {
    pub status: String,
    pub message: Option<String>,
    pub reason: Option<String>,
}

/// What step one leaves behind on the device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstalledPackage {
    pub package_identifier: String,
    pub version_name: String,
    pub version_code: String,
}

impl InstallOldReply {
    /// A reply counts as success only when it names the installed package.
    pub fn into_outcome(self) -> Result<InstalledPackage, String> {
        if self.status != "success" {
            return Err(failure_reason(self.reason, self.message, &self.status));
        }
        let package = self
            .package_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        match package {
            Some(package_identifier) => Ok(InstalledPackage {
                package_identifier,
                version_name: self.version_name.unwrap_or_default(),
                version_code: self.version_code.unwrap_or_default(),
            }),
            None => Err("agent reported success without a package name".into()),
        }
    }
}

impl InstallNewReply {
    pub fn into_outcome(self) -> Result<String, String> {
        if self.status == "success" {
            Ok(self.message.unwrap_or_else(|| "overwrite install succeeded".into()))
        } else {
            Err(failure_reason(self.reason, self.message, &self.status))
        }
    }
}

fn failure_reason(reason: Option<String>, message: Option<String>, status: &str) -> String {
    reason
        .or(message)
        .filter(|text| !text.trim().is_empty())
        .unwrap_or_else(|| format!("install failed (status={})", display_state(status)))
}

#[derive(Clone, Debug, Serialize)]
pub struct FetchJobRequest {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FetchSubmitReply {
    pub status: String,
    pub task_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    #[default]
    Pending,
    Running,
    Success,
    Error,
    /// Anything the server invents later; treated as a terminal failure so polling cannot spin forever.
    #[serde(other)]
    Unknown,
}

impl FetchStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, FetchStatus::Pending | FetchStatus::Running)
    }
}

/// Wire reply of `GET /fetch_job/{task_id}/progress`.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FetchProgress {
    pub status: FetchStatus,
    pub percent: f64,
    pub message: String,
    pub filename: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FetchJob {
    pub task_id: String,
    pub status: FetchStatus,
    pub percent: u8,
    pub message: String,
    pub filename: Option<String>,
}

impl FetchJob {
    pub fn from_progress(task_id: &str, progress: FetchProgress) -> Self {
        let percent = if progress.percent.is_finite() {
            progress.percent.clamp(0.0, 100.0).round() as u8
        } else {
            0
        };
        Self {
            task_id: task_id.to_string(),
            status: progress.status,
            percent,
            message: progress.message,
            filename: progress.filename.filter(|name| !name.trim().is_empty()),
        }
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(opt_string_or_number(deserializer)?.unwrap_or_default())
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(text)) => Some(text),
        Some(other) => Some(other.to_string()),
    })
}
