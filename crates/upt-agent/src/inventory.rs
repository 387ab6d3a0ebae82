//! The last device listing, kept current by a background task.
//!
//! Enumerating devices costs several adb round trips per device, far more
//! than a client's health check allows, so `/devices` serves this snapshot.

use std::{future::Future, sync::Arc, time::Duration};

use tokio::{
    sync::RwLock,
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info};
use upt_core::model::{Device, Platform};

#[derive(Debug, Default)]
pub(crate) struct DeviceCache {
    devices: RwLock<Vec<Device>>,
}

impl DeviceCache {
    pub(crate) async fn snapshot(&self) -> Vec<Device> {
        self.devices.read().await.clone()
    }

    pub(crate) async fn store(&self, devices: Vec<Device>) {
        let mut current = self.devices.write().await;
        if serials(&current) != serials(&devices) {
            info!("devices now: {:?}", serials(&devices));
        }
        *current = devices;
    }

    pub(crate) async fn platform_of(&self, serial: &str) -> Option<Platform> {
        self.devices
            .read()
            .await
            .iter()
            .find(|d| d.serial == serial)
            .map(|d| d.platform)
    }
}

fn serials(devices: &[Device]) -> Vec<&str> {
    devices.iter().map(|d| d.serial.as_str()).collect()
}

/// Re-lists every `period` and stores the result. The cache is never locked
/// while a listing runs, so readers are not held up by a slow enumeration.
pub(crate) fn spawn_refresher<F, Fut>(
    cache: Arc<DeviceCache>,
    period: Duration,
    list: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Vec<Device>> + Send,
{
    tokio::spawn(async move {
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticks.tick().await;
            let devices = list().await;
            debug!("device refresh: {} attached", devices.len());
            cache.store(devices).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;

    fn android(serial: &str) -> Device {
        Device {
            serial: serial.into(),
            platform: Platform::Android,
            state: "device".into(),
            screen_on: true,
            unlocked: true,
            ..Device::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_answers_while_a_slow_listing_runs() {
        let cache = Arc::new(DeviceCache::default());
        cache.store(vec![android("R58M")]).await;

        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = spawn_refresher(Arc::clone(&cache), Duration::from_secs(2), {
            let gate = Arc::clone(&gate);
            let calls = Arc::clone(&calls);
            move || {
                let gate = Arc::clone(&gate);
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    vec![android("R58M"), android("emulator-5554")]
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // The listing is stuck; a read must still come back well inside a health-check budget.
        let started = Instant::now();
        let snapshot = cache.snapshot().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(serials(&snapshot), ["R58M"]);

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(serials(&cache.snapshot().await), ["R58M", "emulator-5554"]);
        refresher.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn refresher_relists_on_its_period() {
        let cache = Arc::new(DeviceCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let refresher = spawn_refresher(Arc::clone(&cache), Duration::from_secs(2), {
            let calls = Arc::clone(&calls);
            move || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { (0..=n).map(|i| android(&format!("dev-{i}"))).collect() }
            }
        });

        tokio::time::sleep(Duration::from_millis(6100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(cache.snapshot().await.len(), 3);
        assert_eq!(cache.platform_of("dev-0").await, Some(Platform::Android));
        assert_eq!(cache.platform_of("missing").await, None);
        refresher.abort();
    }
}
