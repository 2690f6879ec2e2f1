pub mod backoff;
pub mod channel;
pub mod protocol;

pub use channel::{ConnectionState, EventHandler, Identity, TransportChannel};
pub use protocol::{OutboundMessage, RemoteEvent};

/// Outbound half of the real-time connection as seen by the sync layer.
pub trait Transport: Send + Sync {
    /// Queues a message. Returns `false` if it was dropped because the
    /// connection is down; nothing is retried.
    fn send(&self, message: &OutboundMessage) -> bool;

    fn is_connected(&self) -> bool;
}
