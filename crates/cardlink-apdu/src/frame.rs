//! Wire frame construction with ISO 7816-4 command chaining

use crate::apdu::{encode_short, Apdu, ApduKind, EncodeError};

/// CLA bit marking "more frames of this command follow".
pub const CLA_CHAIN: u8 = 0x10;

/// Largest payload a single short frame carries.
pub const MAX_FRAGMENT_LEN: usize = 255;

/// One wire-level unit derived from a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
    // Byte range of the Lc payload inside `bytes`; differs between the
    // short (1-byte Lc) and extended (3-byte Lc) headers.
    fragment_start: usize,
    fragment_len: usize,
}

impl Frame {
    pub(crate) fn new(bytes: Vec<u8>, fragment_start: usize, fragment_len: usize) -> Self {
        Self {
            bytes,
            fragment_start,
            fragment_len,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether the chaining-continue bit is set, i.e. another frame of the
    /// same command follows.
    pub fn is_chained(&self) -> bool {
        self.bytes[0] & CLA_CHAIN != 0
    }

    /// The payload fragment carried by this frame (Lc bytes).
    pub fn fragment(&self) -> &[u8] {
        &self.bytes[self.fragment_start..self.fragment_start + self.fragment_len]
    }
}

/// Split a command into wire frames.
///
/// A payload that fits one fragment yields exactly one frame with the
/// chaining bit clear. Larger payloads chain: every fragment but the last
/// carries CLA | 0x10, and the expected-length byte rides only on the final
/// frame. Extended-form commands always encode as a single frame.
pub fn build_frames(apdu: &Apdu, max_fragment: usize) -> Result<Vec<Frame>, EncodeError> {
    apdu.validate()?;

    if apdu.kind() == ApduKind::Extended {
        let start = if apdu.payload().is_empty() { 0 } else { 7 };
        return Ok(vec![Frame::new(apdu.encode()?, start, apdu.payload().len())]);
    }

    if max_fragment == 0 || max_fragment > MAX_FRAGMENT_LEN {
        return Err(EncodeError::InvalidFragmentSize(max_fragment));
    }

    let data = apdu.payload();
    if data.len() <= max_fragment {
        let start = if data.is_empty() { 0 } else { 5 };
        return Ok(vec![Frame::new(
            encode_short(
                apdu.cla(),
                apdu.ins(),
                apdu.p1(),
                apdu.p2(),
                data,
                apdu.expected_len(),
            ),
            start,
            data.len(),
        )]);
    }

    let mut frames = Vec::with_capacity(data.len().div_ceil(max_fragment));
    let last = data.len().div_ceil(max_fragment) - 1;
    for (i, chunk) in data.chunks(max_fragment).enumerate() {
        let (cla, le) = if i == last {
            (apdu.cla(), apdu.expected_len())
        } else {
            (apdu.cla() | CLA_CHAIN, None)
        };
        frames.push(Frame::new(
            encode_short(cla, apdu.ins(), apdu.p1(), apdu.p2(), chunk, le),
            5,
            chunk.len(),
        ));
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apdu::commands;

    #[test]
    fn small_payload_yields_one_unchained_frame() {
        let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00).data(vec![0xAA; 255]);
        let frames = build_frames(&apdu, 255).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_chained());
        assert_eq!(frames[0].fragment(), &[0xAA; 255][..]);
    }

    #[test]
    fn frame_count_is_payload_over_fragment_rounded_up() {
        for (len, max, expected) in [(256usize, 255usize, 2usize), (510, 255, 2), (511, 255, 3), (10, 4, 3)] {
            let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00).data(vec![0x11; len]);
            let frames = build_frames(&apdu, max).unwrap();
            assert_eq!(frames.len(), expected, "len {len} max {max}");
        }
    }

    #[test]
    fn all_frames_but_last_are_chained() {
        let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00).data(vec![0x22; 600]).expect(256);
        let frames = build_frames(&apdu, 255).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(frames[0].is_chained());
        assert!(frames[1].is_chained());
        assert!(!frames[2].is_chained());
        // Le only on the final frame
        assert_eq!(*frames[2].as_bytes().last().unwrap(), 0x00);
        assert_eq!(frames[0].as_bytes().len(), 5 + 255);
    }

    #[test]
    fn fragments_reassemble_to_the_original_payload() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00).data(payload.clone());
        let frames = build_frames(&apdu, 255).unwrap();
        let rebuilt: Vec<u8> = frames.iter().flat_map(|f| f.fragment().to_vec()).collect();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn extended_commands_never_chain() {
        let apdu = Apdu::new(0x00, 0xD6, 0x00, 0x00)
            .data(vec![0x33; 600])
            .extended();
        let frames = build_frames(&apdu, 255).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(!frames[0].is_chained());
    }

    #[test]
    fn zero_fragment_size_is_rejected() {
        let apdu = commands::select_application(&[0xA0, 0x00]);
        assert_eq!(
            build_frames(&apdu, 0),
            Err(EncodeError::InvalidFragmentSize(0))
        );
    }

    #[test]
    fn oversized_fragment_size_is_rejected() {
        let apdu = commands::select_application(&[0xA0, 0x00]);
        assert_eq!(
            build_frames(&apdu, 256),
            Err(EncodeError::InvalidFragmentSize(256))
        );
    }
}
