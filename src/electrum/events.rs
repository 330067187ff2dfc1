//! Electrum client event sink.

use tokio::sync::mpsc;

/// Push notifications from the server pool. Called from the driver task;
/// implementations must not block.
pub trait ElectrumEvents: Send + Sync {
    /// `key` is the script hash (or the address for legacy address subscriptions).
    fn on_address_status_changed(&self, key: &str, status: Option<&str>);
    fn on_block_height_changed(&self, height: u64);
    /// Every connection is gone; the client stays down until `connect()`.
    fn on_disconnect(&self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectrumEvent {
    StatusChanged { key: String, status: Option<String> },
    HeightChanged(u64),
    Disconnected,
}

impl ElectrumEvents for mpsc::UnboundedSender<ElectrumEvent> {
    fn on_address_status_changed(&self, key: &str, status: Option<&str>) {
        let _ = self.send(ElectrumEvent::StatusChanged { key: key.to_string(), status: status.map(str::to_string) });
    }

    fn on_block_height_changed(&self, height: u64) {
        let _ = self.send(ElectrumEvent::HeightChanged(height));
    }

    fn on_disconnect(&self) {
        let _ = self.send(ElectrumEvent::Disconnected);
    }
}
