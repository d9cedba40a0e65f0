//! Physical transport boundary
//!
//! The engine consumes transports through this trait only. Discovery and
//! radio/accessory session management live outside the crate; whatever owns
//! them hands a connected transport to [`Connection::transport_opened`] and
//! reports loss through [`Connection::transport_lost`].
//!
//! [`Connection::transport_opened`]: crate::connection::Connection::transport_opened
//! [`Connection::transport_lost`]: crate::connection::Connection::transport_lost

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The round-trip failed; the link may still be alive.
    #[error("transmit failed: {0}")]
    Transmit(String),

    /// The physical link is gone (tag left the field, cable unplugged).
    #[error("transport lost: {0}")]
    Lost(String),
}

/// One half-duplex round-trip to the device.
///
/// `transmit` is blocking; the engine only ever calls it from the
/// connection's worker thread, so callers never block on hardware.
pub trait Transport: Send {
    fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Lifecycle events produced by a transport discovery layer, consumed by
/// [`Connection::handle_event`].
///
/// [`Connection::handle_event`]: crate::connection::Connection::handle_event
pub enum TransportEvent {
    Opened(Box<dyn Transport>),
    Lost(TransportError),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportEvent::Opened(_) => f.write_str("Opened(..)"),
            TransportEvent::Lost(err) => write!(f, "Lost({err})"),
        }
    }
}
