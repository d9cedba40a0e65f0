//! Engine error taxonomy
//!
//! Every error is delivered through the failing call's completion; the
//! engine never drops one silently. `Protocol` and `Transport` additionally
//! force the connection to Closed, since both mean the device side can no
//! longer be trusted.

use cardlink_apdu::EncodeError;
use thiserror::Error;

use crate::transport::TransportError;

/// Result alias for engine operations.
pub type CardResult<T> = Result<T, CardError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CardError {
    /// The command could not be encoded; nothing was sent.
    #[error("command encoding failed: {0}")]
    Encode(#[from] EncodeError),

    /// A command was submitted while the connection was not open.
    #[error("connection is not open")]
    NotOpen,

    /// The unit exceeded its deadline. Only this unit fails; the queue
    /// moves on and the transport stays up.
    #[error("command timed out")]
    Timeout,

    /// The device rejected the command; the status word is reported
    /// verbatim.
    #[error("device returned status {sw:04X}")]
    Device { sw: u16 },

    /// Selecting the target application failed; the selection cache was
    /// left unset.
    #[error("application selection failed with status {sw:04X}")]
    Selection { sw: u16 },

    /// The device misbehaved at the framing level (endless continuation,
    /// truncated response). Treated as connection-level distrust.
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// The unit was removed from the queue before it started.
    #[error("command cancelled")]
    Cancelled,

    /// The transport disappeared while work was queued or in flight.
    #[error("connection lost")]
    ConnectionLost,

    /// The transport itself failed mid-exchange.
    #[error("transport failed: {0}")]
    Transport(#[from] TransportError),
}
