//! Electrum - multi-server client for the Electrum protocol
//!
//! # Connection lifecycle
//!
//! ```text
//! Closed ──dial──▶ Connecting ──socket──▶ Ready ──server.version + headers.subscribe──▶ verified
//!   ▲                  │                    │
//!   └── error / EOF / lag / ping timeout ───┘
//! ```
//!
//! # Routing
//!
//! | Call | Connections |
//! |------|-------------|
//! | RPC | one verified connection, round-robin |
//! | `*.subscribe` | primary + `floor(redundancy × other verified)` copies |
//! | Notification | dispatched by topic, whichever connection delivered it |
//!
//! When a connection drops, its caller requests are resent verbatim (same id)
//! on another verified connection. With nothing left alive every request
//! fails with [`ElectrumError::NoLiveConnections`] and `on_disconnect` fires.

mod client;
mod config;
mod events;
mod transport;
mod wire;

pub use client::{ClientStatus, ConnectionState, ConnectionStatus, ElectrumClient, HistoryItem};
pub use config::{ElectrumConfig, Endpoint};
pub use events::{ElectrumEvent, ElectrumEvents};
pub use transport::{BoxedStream, ElectrumStream, SocketFactory, TcpSocketFactory};
pub use wire::{encode_request, parse_error, parse_incoming, Incoming, LineBuffer, Topic};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ElectrumError {
    #[error("No live Electrum connections")]
    NoLiveConnections,
    #[error("Server error{}: {message}", .code.map(|c| format!(" {}", c)).unwrap_or_default())]
    Server { code: Option<i64>, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Electrum client shut down")]
    Shutdown,
}
