//! Operator notices published by the session for whatever front end is attached.

use tokio::sync::mpsc;

use crate::connectivity::ConnectivityEdge;
use crate::orchestrator::InstallPhase;
use crate::selection::ActiveSelection;

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    Connectivity(ConnectivityEdge),
    DeviceAppeared {
        serial: String,
    },
    DeviceVanished {
        serial: String,
    },
    SelectionChanged(ActiveSelection),
    SelectionCleared {
        serial: String,
    },
    SelectionRejected {
        serial: String,
        reason: String,
    },
    InstallPhase {
        device_serial: String,
        phase: InstallPhase,
        message: Option<String>,
    },
    FetchProgress {
        task_id: String,
        percent: u8,
        message: String,
    },
    FetchFinished {
        task_id: String,
        filename: Option<String>,
    },
    FetchFailed {
        task_id: String,
        message: String,
    },
    CatalogRefreshed {
        builds: usize,
    },
}

/// Fire-and-forget event publisher; a missing or closed receiver is not an error.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn send(&self, event: SessionEvent) {
        if let Some(tx) = self.tx.as_ref() {
            let _ = tx.send(event);
        }
    }
}
