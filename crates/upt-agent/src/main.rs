mod adb;
mod apk;
mod devices;
mod download;
mod install;
mod inventory;
mod ios;

use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tracing::info;
use upt_core::model::Device;

use crate::install::{AgentReply, InstallNewBody, InstallOldBody, Installer};
use crate::inventory::{spawn_refresher, DeviceCache};

#[derive(Clone)]
struct AgentState {
    installer: Arc<Installer>,
    devices: Arc<DeviceCache>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    upt_util::init_tracing()?;

    let addr: SocketAddr = upt_util::agent_bind_addr().parse()?;
    let settle = upt_util::env_duration_ms("UPT_LAUNCH_SETTLE_MS", upt_util::DEFAULT_LAUNCH_SETTLE);
    let refresh = upt_util::env_duration_ms("UPT_DEVICE_REFRESH_MS", upt_util::DEFAULT_DEVICE_REFRESH);
    let client = reqwest::Client::builder().user_agent("upt-agent").build()?;

    let cache = Arc::new(DeviceCache::default());
    cache.store(devices::list_devices().await).await;
    let _refresher = spawn_refresher(Arc::clone(&cache), refresh, devices::list_devices);

    let state = AgentState {
        installer: Arc::new(Installer::new(
            client,
            upt_util::scratch_dir(),
            settle,
            Arc::clone(&cache),
        )),
        devices: cache,
    };
    let app = Router::new()
        .route("/devices", get(list_devices))
        .route("/install_old", post(install_old))
        .route("/install_new", post(install_new))
        .with_state(state);

    info!(
        "upt-agent listening on {addr} (adb: {}, device refresh every {refresh:?})",
        adb::adb_path().display()
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn list_devices(State(state): State<AgentState>) -> Json<Vec<Device>> {
    Json(state.devices.snapshot().await)
}

async fn install_old(
    State(state): State<AgentState>,
    Json(body): Json<InstallOldBody>,
) -> Json<AgentReply> {
    Json(state.installer.install_old(body).await)
}

async fn install_new(
    State(state): State<AgentState>,
    Json(body): Json<InstallNewBody>,
) -> Json<AgentReply> {
    Json(state.installer.install_new(body).await)
}
