//! APDU command and response types

use thiserror::Error;

/// Largest payload an APDU can carry in either encoding.
pub const MAX_PAYLOAD_LEN: usize = 65_535;

/// Errors produced while encoding a command, before any I/O happens.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {0} bytes exceeds the 65535 byte APDU limit")]
    PayloadTooLarge(usize),

    #[error("expected response length {0} is outside the valid range for this encoding")]
    ExpectedLengthOutOfRange(u16),

    #[error("payload of {0} bytes does not fit a single short frame")]
    PayloadNeedsChaining(usize),

    #[error("fragment size {0} is not in 1..=255")]
    InvalidFragmentSize(usize),

    #[error("response shorter than a status word ({0} bytes)")]
    ResponseTooShort(usize),
}

/// Short (1-byte length fields) or extended (3-byte Lc, 2/3-byte Le) form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ApduKind {
    #[default]
    Short,
    Extended,
}

/// A logical command: header, payload and expected-response-length hint.
///
/// Built once by the caller and immutable after submission; the frame
/// builder turns it into one or more wire frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Apdu {
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: Vec<u8>,
    le: Option<u16>,
    kind: ApduKind,
}

impl Apdu {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data: Vec::new(),
            le: None,
            kind: ApduKind::Short,
        }
    }

    /// Set the command payload.
    pub fn data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }

    /// Set the expected response length. 256 encodes as `00` in short form;
    /// extended form accepts up to 65 535.
    pub fn expect(mut self, le: u16) -> Self {
        self.le = Some(le);
        self
    }

    /// Switch to the extended encoding.
    pub fn extended(mut self) -> Self {
        self.kind = ApduKind::Extended;
        self
    }

    pub fn cla(&self) -> u8 {
        self.cla
    }

    pub fn ins(&self) -> u8 {
        self.ins
    }

    pub fn p1(&self) -> u8 {
        self.p1
    }

    pub fn p2(&self) -> u8 {
        self.p2
    }

    pub fn kind(&self) -> ApduKind {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn expected_len(&self) -> Option<u16> {
        self.le
    }

    pub(crate) fn validate(&self) -> Result<(), EncodeError> {
        if self.data.len() > MAX_PAYLOAD_LEN {
            return Err(EncodeError::PayloadTooLarge(self.data.len()));
        }
        if let Some(le) = self.le {
            let valid = match self.kind {
                ApduKind::Short => (1..=256).contains(&(le as u32)),
                ApduKind::Extended => le >= 1,
            };
            if !valid {
                return Err(EncodeError::ExpectedLengthOutOfRange(le));
            }
        }
        Ok(())
    }

    /// Encode as a single wire frame in the command's own form. Fails when
    /// a short-form payload needs chaining; `build_frames` handles that.
    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        self.validate()?;
        match self.kind {
            ApduKind::Short => {
                if self.data.len() > 255 {
                    return Err(EncodeError::PayloadNeedsChaining(self.data.len()));
                }
                Ok(encode_short(
                    self.cla, self.ins, self.p1, self.p2, &self.data, self.le,
                ))
            }
            ApduKind::Extended => Ok(self.encode_extended()),
        }
    }

    fn encode_extended(&self) -> Vec<u8> {
        let mut out = vec![self.cla, self.ins, self.p1, self.p2];
        if !self.data.is_empty() {
            out.push(0x00);
            out.extend_from_slice(&(self.data.len() as u16).to_be_bytes());
            out.extend_from_slice(&self.data);
        }
        if let Some(le) = self.le {
            // Without an Lc field the extended Le carries its own leading zero.
            if self.data.is_empty() {
                out.push(0x00);
            }
            out.extend_from_slice(&le.to_be_bytes());
        }
        out
    }
}

pub(crate) fn encode_short(
    cla: u8,
    ins: u8,
    p1: u8,
    p2: u8,
    data: &[u8],
    le: Option<u16>,
) -> Vec<u8> {
    let mut out = vec![cla, ins, p1, p2];
    if !data.is_empty() {
        out.push(data.len() as u8);
        out.extend_from_slice(data);
    }
    if let Some(le) = le {
        out.push(if le == 256 { 0x00 } else { le as u8 });
    }
    out
}

/// A reassembled response: payload plus the final status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub data: Vec<u8>,
    pub sw1: u8,
    pub sw2: u8,
}

impl Response {
    /// Split raw transport bytes into payload and trailing status word.
    pub fn parse(raw: &[u8]) -> Result<Self, EncodeError> {
        if raw.len() < 2 {
            return Err(EncodeError::ResponseTooShort(raw.len()));
        }
        Ok(Self {
            data: raw[..raw.len() - 2].to_vec(),
            sw1: raw[raw.len() - 2],
            sw2: raw[raw.len() - 1],
        })
    }

    pub fn is_success(&self) -> bool {
        self.status_word() == crate::status::SW_SUCCESS
    }

    pub fn status_word(&self) -> u16 {
        ((self.sw1 as u16) << 8) | (self.sw2 as u16)
    }

    /// Status word as hex string (e.g. "9000").
    pub fn status_string(&self) -> String {
        format!("{:02X}{:02X}", self.sw1, self.sw2)
    }

    /// The number of bytes still waiting on the card, when SW1 is 0x61.
    pub fn more_data(&self) -> Option<u8> {
        (self.sw1 == crate::status::SW_MORE_DATA_SW1).then_some(self.sw2)
    }
}

/// Command constructors shared by every application session.
pub mod commands {
    use super::Apdu;

    /// ISO SELECT by name: addresses an on-device application by AID.
    pub fn select_application(aid: &[u8]) -> Apdu {
        Apdu::new(0x00, 0xA4, 0x04, 0x00)
            .data(aid.to_vec())
            .expect(256)
    }
}
