//! Package metadata of a downloaded build, read with `aapt dump badging`.

use std::{
    fs, io,
    path::{Path, PathBuf},
    process::Stdio,
};

use tokio::process::Command;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct ApkInfo {
    pub(crate) package: String,
    pub(crate) version_name: String,
    pub(crate) version_code: String,
}

pub(crate) fn aapt_path() -> PathBuf {
    if let Ok(path) = std::env::var("UPT_AAPT_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(sdk_root) =
        std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME"))
    {
        if let Some(candidate) = newest_build_tools_aapt(&Path::new(&sdk_root).join("build-tools"))
        {
            return candidate;
        }
    }
    PathBuf::from("aapt")
}

fn newest_build_tools_aapt(build_tools: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(build_tools).ok()?;
    let mut versions: Vec<(Vec<u32>, PathBuf)> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|dir| dir.join("aapt").is_file())
        .map(|dir| {
            let name = dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            (version_key(&name), dir.join("aapt"))
        })
        .collect();
    versions.sort();
    versions.pop().map(|(_, path)| path)
}

fn version_key(name: &str) -> Vec<u32> {
    name.split(['.', '-'])
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

pub(crate) async fn read_apk_info(apk: &Path) -> Result<ApkInfo, String> {
    let output = Command::new(aapt_path())
        .arg("dump")
        .arg("badging")
        .arg(apk)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                "aapt not found (set UPT_AAPT_PATH or ANDROID_SDK_ROOT)".to_string()
            } else {
                format!("failed to run aapt: {e}")
            }
        })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    if let Some(info) = parse_badging(&stdout) {
        return Ok(info);
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(format!(
        "could not parse package name from APK: {}",
        stderr.trim()
    ))
}

/// Reads the `package:` line of `aapt dump badging` output.
pub(crate) fn parse_badging(output: &str) -> Option<ApkInfo> {
    let line = output
        .lines()
        .find_map(|line| line.trim().strip_prefix("package:"))?;
    let package = quoted_attr(line, "name")?;
    if package.is_empty() {
        return None;
    }
    Some(ApkInfo {
        package,
        version_name: quoted_attr(line, "versionName").unwrap_or_default(),
        version_code: quoted_attr(line, "versionCode").unwrap_or_default(),
    })
}

fn quoted_attr(line: &str, key: &str) -> Option<String> {
    let needle = format!(" {key}='");
    let start = format!(" {line}").find(&needle)? + needle.len() - 1;
    let rest = &line[start..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}
