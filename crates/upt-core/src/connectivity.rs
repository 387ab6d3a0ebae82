use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityEdge {
    Gained,
    Lost,
}

/// Process-wide view of whether the local agent answers.
///
/// Starts unreachable. `observe` reports a change only on an actual edge so
/// dependents are not re-triggered on every poll.
#[derive(Clone, Debug, Default)]
pub struct ConnectivityMonitor {
    reachable: bool,
    last_change_millis: Option<i64>,
}

impl ConnectivityMonitor {
    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn last_change_millis(&self) -> Option<i64> {
        self.last_change_millis
    }

    pub fn observe(&mut self, reachable: bool) -> Option<ConnectivityEdge> {
        if reachable == self.reachable {
            return None;
        }
        self.reachable = reachable;
        self.last_change_millis = Some(upt_util::now_millis());
        let edge = if reachable {
            ConnectivityEdge::Gained
        } else {
            ConnectivityEdge::Lost
        };
        info!("local agent connectivity: {edge:?}");
        Some(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edges_fire_once_per_change() {
        let mut monitor = ConnectivityMonitor::default();
        assert!(!monitor.is_reachable());
        assert_eq!(monitor.observe(false), None);
        assert_eq!(monitor.observe(true), Some(ConnectivityEdge::Gained));
        assert_eq!(monitor.observe(true), None);
        assert_eq!(monitor.observe(true), None);
        assert_eq!(monitor.observe(false), Some(ConnectivityEdge::Lost));
        assert_eq!(monitor.observe(false), None);
        assert!(monitor.last_change_millis().is_some());
    }
}
