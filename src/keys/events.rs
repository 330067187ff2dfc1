//! KeyManager event sink.

use super::manager::SerializedKeys;
use tokio::sync::mpsc;

/// Receives new addresses and newly computed branch keys.
///
/// Called while a ring is locked; implementations must not block.
pub trait KeyManagerEvents: Send + Sync {
    fn on_new_address(&self, script_hash: &str, address: &str, path: &str);
    fn on_new_key(&self, keys: &SerializedKeys);
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyEvent {
    NewAddress { script_hash: String, address: String, path: String },
    NewKey(SerializedKeys),
}

/// Ordered channel alternative to callbacks.
impl KeyManagerEvents for mpsc::UnboundedSender<KeyEvent> {
    fn on_new_address(&self, script_hash: &str, address: &str, path: &str) {
        let _ = self.send(KeyEvent::NewAddress {
            script_hash: script_hash.to_string(),
            address: address.to_string(),
            path: path.to_string(),
        });
    }

    fn on_new_key(&self, keys: &SerializedKeys) {
        let _ = self.send(KeyEvent::NewKey(keys.clone()));
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopKeyEvents;

impl KeyManagerEvents for NoopKeyEvents {
    fn on_new_address(&self, _: &str, _: &str, _: &str) {}
    fn on_new_key(&self, _: &SerializedKeys) {}
}
