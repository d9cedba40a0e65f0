//! cardlink - smart-card command engine
//!
//! Transport-level plumbing for talking to a security token over NFC,
//! PC/SC or an accessory link: APDU framing and chaining, GET RESPONSE
//! reassembly, a sequential per-connection dispatch queue with timeouts
//! and cancellation, a connection state machine, and a cached application
//! selector. Application-layer command sets (OTP, FIDO, OATH, PIV) sit on
//! top of [`SmartCardInterface`]; physical discovery sits below
//! [`Transport`].

pub mod connection;
pub mod error;
pub mod queue;
pub mod transport;

mod exchange;

#[cfg(feature = "pcsc")]
pub mod reader;

pub use connection::{Aid, Connection, ConnectionState, DrainHandle, SmartCardInterface};
pub use error::{CardError, CardResult};
pub use queue::{CommandConfiguration, CommandOutput, PendingResponse};
pub use transport::{Transport, TransportError, TransportEvent};

/// Re-export commonly used APDU types.
pub use cardlink_apdu::{apdu::commands, Apdu, ApduKind, Response, SendRemaining};

#[cfg(feature = "pcsc")]
pub use reader::{PcscReader, PcscTransport};
