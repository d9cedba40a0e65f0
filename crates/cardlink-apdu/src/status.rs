//! Status words and response continuation

/// Command completed normally.
pub const SW_SUCCESS: u16 = 0x9000;

/// SW1 value announcing that SW2 more bytes are available via GET RESPONSE.
pub const SW_MORE_DATA_SW1: u8 = 0x61;

/// "Conditions of use not satisfied" - the one status treated as a
/// recoverable busy signal when a command opts into retry.
pub const SW_CONDITIONS_NOT_SATISFIED: u16 = 0x6985;

/// Which GET RESPONSE instruction to use when the card reports more data.
///
/// The OATH applet exposes its own continuation instruction (0xA5) instead
/// of the ISO one (0xC0). The two never behave interchangeably, so the
/// variant is resolved per command rather than guessed from state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendRemaining {
    /// ISO 7816-4 GET RESPONSE (INS 0xC0).
    #[default]
    Normal,
    /// OATH applet SEND REMAINING (INS 0xA5).
    Oath,
}

impl SendRemaining {
    pub fn instruction(self) -> u8 {
        match self {
            SendRemaining::Normal => 0xC0,
            SendRemaining::Oath => 0xA5,
        }
    }

    /// Build the continuation frame requesting `len` more bytes
    /// (0 requests the maximum 256).
    pub fn continuation_frame(self, len: u8) -> Vec<u8> {
        vec![0x00, self.instruction(), 0x00, 0x00, len]
    }
}
