//! Transport abstraction between the provider and the relay connection.
//!
//! A transport moves opaque frames and reports connectivity. It never
//! interprets frames and never retries on its own; reconnection policy lives
//! in the provider.

pub mod ws;

pub use ws::WsTransport;

use crate::sync::codec::WireFrame;

/// Transport errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("Transport is not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,
}

/// Why a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The relay closed the connection
    ServerDisconnect,
    /// The underlying stream ended
    TransportClose,
    /// The underlying stream failed
    TransportError,
    /// The relay stopped answering
    PingTimeout,
    /// This side closed the connection on purpose
    ClientDisconnect,
}

impl DisconnectReason {
    /// Whether this reason should schedule a reconnect
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::ClientDisconnect)
    }
}

/// Events a transport delivers to the provider
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected(DisconnectReason),
    Frame(WireFrame),
}

/// A bidirectional frame channel to the relay
pub trait Transport: Send + 'static {
    /// Queue a frame for delivery
    fn send(&mut self, frame: WireFrame) -> Result<(), TransportError>;

    /// Whether the transport currently holds a live connection
    fn is_active(&self) -> bool;

    /// Start connecting; the outcome arrives as a [`TransportEvent`]
    fn connect(&mut self);

    /// Drop the connection at once without reporting a disconnect event
    fn disconnect(&mut self);

    /// Like [`Transport::disconnect`], but frames already accepted by
    /// [`Transport::send`] are still delivered first
    fn close(&mut self) {
        self.disconnect();
    }
}
