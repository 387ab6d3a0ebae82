use std::{path::PathBuf, time::Duration};

pub const DEFAULT_AGENT_URL: &str = "http://127.0.0.1:8791";
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_AGENT_ADDR: &str = "127.0.0.1:8791";

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_LAUNCH_SETTLE: Duration = Duration::from_secs(5);
pub const DEFAULT_DEVICE_REFRESH: Duration = Duration::from_secs(2);

pub fn env_addr(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

/// Base URL of the local device-control agent as seen by clients.
pub fn agent_url() -> String {
    normalize_base_url(&env_addr("UPT_AGENT_URL", DEFAULT_AGENT_URL))
}

/// Base URL of the remote artifact server.
pub fn server_url() -> String {
    normalize_base_url(&env_addr("UPT_SERVER_URL", DEFAULT_SERVER_URL))
}

/// Socket address the agent binds to.
pub fn agent_bind_addr() -> String {
    env_addr("UPT_AGENT_ADDR", DEFAULT_AGENT_ADDR)
}

/// Accepts `host:port` as shorthand for `http://host:port` and strips trailing slashes.
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

pub fn env_duration_ms(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

pub fn data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".local/share/upt")
    } else {
        PathBuf::from("/tmp/upt")
    }
}

pub fn scratch_dir() -> PathBuf {
    data_dir().join("scratch")
}

pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing_with("info")
}

/// Like [`init_tracing`] with another default level; `RUST_LOG` still applies.
pub fn init_tracing_with(default_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.parse()?),
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_gets_scheme_and_loses_trailing_slash() {
        assert_eq!(normalize_base_url("127.0.0.1:8791/"), "http://127.0.0.1:8791");
        assert_eq!(
            normalize_base_url(" https://builds.example.com// "),
            "https://builds.example.com"
        );
    }

    #[test]
    fn unset_env_falls_back_to_default() {
        assert_eq!(
            env_addr("UPT_TEST_SURELY_UNSET_KEY", "127.0.0.1:1"),
            "127.0.0.1:1"
        );
        assert_eq!(
            env_duration_ms("UPT_TEST_SURELY_UNSET_MS", Duration::from_millis(250)),
            Duration::from_millis(250)
        );
    }
}
