use std::{error::Error, path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::debug;
use upt_core::{
    ConnectivityEdge, CoreConfig, EventSink, FetchError, HttpAgent, HttpArtifactServer, Platform,
    SessionEvent, UpgradeSession, UploadOptions,
};

type Session = UpgradeSession<HttpAgent, HttpArtifactServer>;

#[derive(Parser, Debug)]
#[command(
    name = "upt-cli",
    version,
    about = "Two-step app upgrade tests against a local device agent"
)]
struct Cli {
    /// Base URL of the local device agent
    #[arg(long, global = true, default_value_t = upt_util::agent_url())]
    agent_url: String,
    /// Base URL of the artifact server
    #[arg(long, global = true, default_value_t = upt_util::server_url())]
    server_url: String,
    /// Agent health check timeout
    #[arg(long, global = true)]
    probe_timeout_ms: Option<u64>,
    /// Fetch job polling interval
    #[arg(long, global = true)]
    poll_interval_ms: Option<u64>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// List attached devices and whether they can take an install
    Devices {
        #[arg(long)]
        json: bool,
    },
    /// List builds held by the artifact server
    Builds {
        #[arg(long)]
        platform: Option<Platform>,
        #[arg(long)]
        json: bool,
    },
    /// Upload a build file to the artifact server
    Upload {
        path: PathBuf,
        #[arg(long)]
        remark: Option<String>,
        /// Store the build under this name instead of the file name
        #[arg(long)]
        name: Option<String>,
    },
    /// Delete a build from the artifact server
    Delete { filename: String },
    /// Have the artifact server download a build from a share link
    Fetch {
        url: String,
        #[arg(long)]
        remark: Option<String>,
    },
    /// Install the old build, wait for the operator to check it on the device,
    /// then install the new build over it
    Upgrade {
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        /// Device serial; defaults to the first ready device
        #[arg(long)]
        device: Option<String>,
    },
    /// Follow agent connectivity and device changes until interrupted
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    upt_util::init_tracing_with("warn")?;
    let cli = Cli::parse();

    let config = core_config(&cli);
    debug!(
        "agent={} server={} config={config:?}",
        cli.agent_url, cli.server_url
    );
    let (events, rx) = EventSink::channel();
    let session = Arc::new(
        UpgradeSession::new(
            Arc::new(HttpAgent::new(cli.agent_url.clone())),
            Arc::new(HttpArtifactServer::new(cli.server_url.clone())),
            config,
        )
        .with_events(events),
    );

    match cli.cmd {
        Cmd::Devices { json } => devices(&session, &cli.agent_url, json).await?,
        Cmd::Builds { platform, json } => builds(&session, platform, json).await?,
        Cmd::Upload { path, remark, name } => {
            let options = UploadOptions {
                remark,
                custom_filename: name,
            };
            let reply = session.upload_build(&path, &options).await?;
            if !reply.is_success() {
                return Err(format!("upload rejected: {}", reply.detail()).into());
            }
            println!("uploaded {}: {}", path.display(), reply.detail());
        }
        Cmd::Delete { filename } => {
            let reply = session.delete_build(&filename).await?;
            if !reply.is_success() {
                return Err(format!("delete rejected: {}", reply.detail()).into());
            }
            println!("deleted {filename}");
        }
        Cmd::Fetch { url, remark } => fetch(&session, rx, &url, remark.as_deref()).await?,
        Cmd::Upgrade { old, new, device } => {
            upgrade(&session, &cli.agent_url, &old, &new, device).await?
        }
        Cmd::Watch => watch(&session, rx).await?,
    }

    Ok(())
}

fn core_config(cli: &Cli) -> CoreConfig {
    let mut config = CoreConfig::from_env();
    if let Some(ms) = cli.probe_timeout_ms {
        config.probe_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = cli.poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    config
}

async fn require_agent(session: &Session, agent_url: &str) -> Result<(), Box<dyn Error>> {
    if session.is_agent_reachable().await {
        Ok(())
    } else {
        Err(format!("local agent at {agent_url} is not reachable; is upt-agent running?").into())
    }
}

async fn devices(session: &Session, agent_url: &str, json: bool) -> Result<(), Box<dyn Error>> {
    let devices = session.refresh_devices().await;
    require_agent(session, agent_url).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if devices.is_empty() {
        println!("no devices attached");
        return Ok(());
    }
    let selected = session.selection().await.map(|s| s.device_serial);
    for device in &devices {
        let marker = if selected.as_deref() == Some(device.serial.as_str()) {
            "*"
        } else {
            " "
        };
        let status = device
            .not_ready_reason()
            .unwrap_or_else(|| "ready".to_string());
        println!(
            "{marker} {:<24} {:<20} {:<8} {status}",
            device.serial,
            device.display_name(),
            device.platform
        );
    }
    Ok(())
}

async fn builds(
    session: &Session,
    platform: Option<Platform>,
    json: bool,
) -> Result<(), Box<dyn Error>> {
    session.refresh_catalog().await?;
    let catalog = session.catalog().await;
    let platforms = match platform {
        Some(platform) => vec![platform],
        None => vec![Platform::Android, Platform::Ios],
    };

    if json {
        let mut out = serde_json::Map::new();
        for platform in platforms {
            out.insert(
                platform.to_string(),
                serde_json::to_value(catalog.for_platform(platform))?,
            );
        }
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    for platform in platforms {
        let builds = catalog.for_platform(platform);
        println!("{platform} ({})", builds.len());
        for build in builds {
            println!(
                "  {:<32} {:<28} {} ({})  {}",
                build.display_name(),
                build.package_identifier,
                build.version_name,
                build.version_code,
                build.upload_time
            );
            if build.display_name() != build.filename {
                println!("  {:<32} file: {}", "", build.filename);
            }
        }
    }
    Ok(())
}

async fn fetch(
    session: &Arc<Session>,
    mut rx: UnboundedReceiver<SessionEvent>,
    url: &str,
    remark: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let task_id = session.submit_fetch(url, remark).await?;
    println!("fetch job {task_id} started");

    // Dropping the pending wait stops the polling task.
    let wait = session.watch_fetch(task_id).wait();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(wait, ctrl_c);
    let result = loop {
        tokio::select! {
            result = &mut wait => break result,
            _ = &mut ctrl_c => break Err(FetchError::Cancelled),
            Some(event) = rx.recv() => print_event(&event),
        }
    };
    // The poll task publishes its last events before it returns.
    for line in drain_lines(&mut rx) {
        println!("{line}");
    }

    let job = result?;
    match job.filename {
        Some(filename) => println!("build stored as {filename}"),
        None => println!("fetch finished"),
    }
    Ok(())
}

async fn upgrade(
    session: &Session,
    agent_url: &str,
    old: &str,
    new: &str,
    device: Option<String>,
) -> Result<(), Box<dyn Error>> {
    session.refresh_devices().await;
    require_agent(session, agent_url).await?;
    let selection = match device {
        Some(serial) => session.select_device(&serial, None).await?,
        None => session
            .selection()
            .await
            .ok_or("no ready device attached; turn on and unlock a device or pass --device")?,
    };
    println!(
        "device {} ({})",
        selection.device_serial, selection.platform
    );
    session.refresh_catalog().await?;

    println!("step 1: installing {old}");
    let installed = session.start_old(old).await?;
    println!(
        "step 1 done: {} {} ({})",
        installed.package_identifier, installed.version_name, installed.version_code
    );

    if !confirm("check the old build on the device, then press Enter to continue (q to stop): ")
        .await?
    {
        println!("stopped after step 1");
        return Ok(());
    }

    // The device may have locked or gone away during the manual check.
    session.refresh_devices().await;
    println!("step 2: installing {new} over {}", installed.package_identifier);
    let message = session.start_new(new).await?;
    println!("step 2 done: {message}");
    Ok(())
}

async fn confirm(prompt: &str) -> std::io::Result<bool> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(prompt.as_bytes()).await?;
    stdout.flush().await?;

    let mut line = String::new();
    let read = BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await?;
    Ok(read > 0 && !is_stop_answer(&line))
}

fn is_stop_answer(line: &str) -> bool {
    matches!(
        line.trim().to_ascii_lowercase().as_str(),
        "q" | "quit" | "n" | "no"
    )
}

async fn watch(
    session: &Arc<Session>,
    mut rx: UnboundedReceiver<SessionEvent>,
) -> Result<(), Box<dyn Error>> {
    let monitor = session.spawn_monitor();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            interrupted = &mut ctrl_c => {
                interrupted?;
                break;
            }
            Some(event) = rx.recv() => print_event(&event),
        }
    }
    monitor.stop().await;
    for line in drain_lines(&mut rx) {
        println!("{line}");
    }
    Ok(())
}

fn print_event(event: &SessionEvent) {
    if let Some(line) = describe(event) {
        println!("{line}");
    }
}

/// Lines for every event already queued, without waiting for more.
fn drain_lines(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<String> {
    std::iter::from_fn(|| rx.try_recv().ok())
        .filter_map(|event| describe(&event))
        .collect()
}

fn describe(event: &SessionEvent) -> Option<String> {
    let line = match event {
        SessionEvent::Connectivity(ConnectivityEdge::Gained) => "agent reachable".to_string(),
        SessionEvent::Connectivity(ConnectivityEdge::Lost) => "agent unreachable".to_string(),
        SessionEvent::DeviceAppeared { serial } => format!("+ {serial}"),
        SessionEvent::DeviceVanished { serial } => format!("- {serial}"),
        SessionEvent::SelectionChanged(selection) => format!(
            "selected {} ({})",
            selection.device_serial, selection.platform
        ),
        SessionEvent::SelectionCleared { serial } => format!("{serial} is no longer selected"),
        SessionEvent::SelectionRejected { serial, reason } => {
            format!("cannot select {serial}: {reason}")
        }
        SessionEvent::InstallPhase {
            device_serial,
            phase,
            message,
        } => match message {
            Some(message) => format!("[{device_serial}] {phase}: {message}"),
            None => format!("[{device_serial}] {phase}"),
        },
        SessionEvent::FetchProgress {
            task_id,
            percent,
            message,
        } => format!("fetch {task_id}: {percent:>3}% {message}"),
        SessionEvent::FetchFinished { task_id, filename } => match filename {
            Some(filename) => format!("fetch {task_id}: done ({filename})"),
            None => format!("fetch {task_id}: done"),
        },
        SessionEvent::FetchFailed { task_id, message } => {
            format!("fetch {task_id}: failed: {message}")
        }
        SessionEvent::CatalogRefreshed { .. } => return None,
    };
    Some(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "upt-cli",
            "upgrade",
            "--old",
            "shop-4.0.apk",
            "--new",
            "shop-4.1.apk",
            "--agent-url",
            "http://127.0.0.1:9999",
            "--probe-timeout-ms",
            "250",
        ])
        .unwrap();
        assert_eq!(cli.agent_url, "http://127.0.0.1:9999");
        assert_eq!(
            core_config(&cli).probe_timeout,
            Duration::from_millis(250)
        );
        match cli.cmd {
            Cmd::Upgrade { old, new, device } => {
                assert_eq!(old, "shop-4.0.apk");
                assert_eq!(new, "shop-4.1.apk");
                assert_eq!(device, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn upgrade_has_no_way_around_the_manual_check() {
        let skip = Cli::try_parse_from([
            "upt-cli", "upgrade", "--old", "a.apk", "--new", "b.apk", "--yes",
        ]);
        assert!(skip.is_err());
    }

    #[test]
    fn queued_fetch_events_are_all_drained() {
        let (events, mut rx) = EventSink::channel();
        events.send(SessionEvent::FetchProgress {
            task_id: "t1".into(),
            percent: 100,
            message: "saved".into(),
        });
        events.send(SessionEvent::CatalogRefreshed { builds: 2 });
        events.send(SessionEvent::FetchFinished {
            task_id: "t1".into(),
            filename: Some("build.apk".into()),
        });

        assert_eq!(
            drain_lines(&mut rx),
            ["fetch t1: 100% saved", "fetch t1: done (build.apk)"]
        );
        assert!(drain_lines(&mut rx).is_empty());
    }

    #[test]
    fn platform_filter_is_parsed() {
        let cli = Cli::try_parse_from(["upt-cli", "builds", "--platform", "ios"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Cmd::Builds {
                platform: Some(Platform::Ios),
                json: false
            }
        ));
        assert!(Cli::try_parse_from(["upt-cli", "builds", "--platform", "symbian"]).is_err());
    }

    #[test]
    fn stop_answers() {
        assert!(is_stop_answer("q\n"));
        assert!(is_stop_answer(" No "));
        assert!(!is_stop_answer("\n"));
        assert!(!is_stop_answer("y\n"));
    }

    #[test]
    fn events_render_as_single_lines() {
        assert_eq!(
            describe(&SessionEvent::FetchProgress {
                task_id: "t1".into(),
                percent: 40,
                message: "downloading".into(),
            })
            .as_deref(),
            Some("fetch t1:  40% downloading")
        );
        assert_eq!(
            describe(&SessionEvent::DeviceVanished {
                serial: "R58M".into()
            })
            .as_deref(),
            Some("- R58M")
        );
        assert_eq!(describe(&SessionEvent::CatalogRefreshed { builds: 3 }), None);
    }
}
