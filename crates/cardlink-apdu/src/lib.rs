//! APDU encoding and response parsing for smart-card transports
//!
//! This crate holds the pure, transport-agnostic half of the protocol: the
//! APDU command model with short and extended encodings, command chaining
//! when a payload exceeds the transport fragment size, GET RESPONSE
//! continuation frames, and status-word handling. No I/O happens here.

pub mod apdu;
pub mod frame;
pub mod status;

pub use apdu::{Apdu, ApduKind, EncodeError, Response};
pub use frame::{build_frames, Frame, MAX_FRAGMENT_LEN};
pub use status::{SendRemaining, SW_CONDITIONS_NOT_SATISFIED, SW_MORE_DATA_SW1, SW_SUCCESS};
