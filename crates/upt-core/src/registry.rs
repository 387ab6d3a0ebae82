use std::collections::HashSet;

use tracing::debug;

use crate::model::Device;

/// Set difference between two consecutive registry snapshots, by serial.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    pub appeared: Vec<String>,
    pub persisted: Vec<String>,
    pub vanished: Vec<String>,
}

impl RegistryDiff {
    pub fn between(previous: &[Device], current: &[Device]) -> Self {
        let before: HashSet<&str> = previous.iter().map(|d| d.serial.as_str()).collect();
        let after: HashSet<&str> = current.iter().map(|d| d.serial.as_str()).collect();

        let mut diff = RegistryDiff::default();
        for device in current {
            if before.contains(device.serial.as_str()) {
                diff.persisted.push(device.serial.clone());
            } else {
                diff.appeared.push(device.serial.clone());
            }
        }
        for device in previous {
            if !after.contains(device.serial.as_str()) {
                diff.vanished.push(device.serial.clone());
            }
        }
        diff
    }

    pub fn lost(&self, serial: &str) -> bool {
        self.vanished.iter().any(|s| s == serial)
    }

    pub fn is_unchanged(&self) -> bool {
        self.appeared.is_empty() && self.vanished.is_empty()
    }
}

/// Latest snapshot of attached devices.
///
/// Refreshes are numbered when issued; a response is applied only if it is
/// newer than the last applied one, so the last-completed request wins and a
/// slow stale response cannot overwrite fresher data.
#[derive(Clone, Debug, Default)]
pub struct DeviceRegistry {
    devices: Vec<Device>,
    issued: u64,
    applied: u64,
}

impl DeviceRegistry {
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn get(&self, serial: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.serial == serial)
    }

    pub fn contains(&self, serial: &str) -> bool {
        self.get(serial).is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn begin_refresh(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// True once a newer listing was applied or the registry was cleared after `generation` was issued.
    pub fn is_superseded(&self, generation: u64) -> bool {
        generation <= self.applied
    }

    /// Applies a listing fetched under `generation`; `None` when it was superseded.
    pub fn apply(&mut self, generation: u64, devices: Vec<Device>) -> Option<RegistryDiff> {
        if self.is_superseded(generation) {
            debug!(
                "dropping stale device listing (generation {generation}, applied {})",
                self.applied
            );
            return None;
        }
        self.applied = generation;
        let devices = normalize(devices);
        let diff = RegistryDiff::between(&self.devices, &devices);
        self.devices = devices;
        Some(diff)
    }

    /// Empties the registry, e.g. after the agent became unreachable.
    ///
    /// Also supersedes any listing still in flight.
    pub fn clear(&mut self) -> RegistryDiff {
        self.applied = self.issued;
        let diff = RegistryDiff::between(&self.devices, &[]);
        self.devices.clear();
        diff
    }
}

fn normalize(mut devices: Vec<Device>) -> Vec<Device> {
    devices.retain(|d| !d.serial.trim().is_empty());
    devices.sort_by(|a, b| a.serial.cmp(&b.serial));
    devices.dedup_by(|a, b| a.serial == b.serial);
    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(serial: &str) -> Device {
        Device {
            serial: serial.into(),
            state: "device".into(),
            ..Device::default()
        }
    }

    #[test]
    fn snapshot_is_sorted_and_deduplicated() {
        let mut registry = DeviceRegistry::default();
        let generation = registry.begin_refresh();
        registry.apply(generation, vec![dev("c"), dev("a"), dev("b"), dev("a"), dev(" ")]);
        let serials: Vec<_> = registry.devices().iter().map(|d| d.serial.as_str()).collect();
        assert_eq!(serials, ["a", "b", "c"]);
    }

    #[test]
    fn diff_reports_appeared_persisted_vanished() {
        let mut registry = DeviceRegistry::default();
        let first = registry.begin_refresh();
        registry.apply(first, vec![dev("a"), dev("b")]);
        let second = registry.begin_refresh();
        let diff = registry.apply(second, vec![dev("b"), dev("c")]).unwrap();
        assert_eq!(diff.appeared, ["c"]);
        assert_eq!(diff.persisted, ["b"]);
        assert_eq!(diff.vanished, ["a"]);
        assert!(diff.lost("a"));
        assert!(!diff.is_unchanged());
    }

    #[test]
    fn older_generation_is_dropped() {
        let mut registry = DeviceRegistry::default();
        let slow = registry.begin_refresh();
        let fast = registry.begin_refresh();
        assert!(registry.apply(fast, vec![dev("b")]).is_some());
        assert!(registry.apply(slow, vec![dev("a")]).is_none());
        assert!(registry.contains("b"));
        assert!(!registry.contains("a"));
    }

    #[test]
    fn clear_supersedes_in_flight_listing() {
        let mut registry = DeviceRegistry::default();
        let first = registry.begin_refresh();
        registry.apply(first, vec![dev("a")]);
        let in_flight = registry.begin_refresh();
        let diff = registry.clear();
        assert_eq!(diff.vanished, ["a"]);
        assert!(registry.apply(in_flight, vec![dev("a")]).is_none());
        assert!(registry.is_empty());
    }
}
