//! Coordination events
//!
//! The telemetry sink itself lives outside the crate; this is the channel
//! surface the engine emits into when monitoring is enabled. Send failures
//! are logged and dropped, never propagated.

mod types;

pub use types::{CoordinationEvent, CoordinationEventKind, MonitoringConfig};

use tokio::sync::mpsc;
use tracing::{trace, warn};

/// Shared handle for emitting events; cheap to clone, no-op when disabled
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::Sender<CoordinationEvent>>,
}

impl EventSender {
    /// Builds the sender/receiver pair the configuration asks for. Returns
    /// `None` for the receiver when monitoring is disabled.
    pub fn from_config(
        config: &MonitoringConfig,
    ) -> (Self, Option<mpsc::Receiver<CoordinationEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size);
            (Self { tx: Some(tx) }, Some(rx))
        } else {
            (Self { tx: None }, None)
        }
    }

    pub async fn send(&self, event: CoordinationEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event).await {
                warn!(error = %e, "Failed to send coordination event");
            } else {
                trace!("Sent coordination event");
            }
        }
    }
}
