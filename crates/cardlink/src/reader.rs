//! PC/SC transport adapter
//!
//! Bridges a PC/SC card handle into the engine's [`Transport`] trait and
//! wraps reader discovery. Only compiled with the `pcsc` feature, which
//! links against the system pcsclite library.

use pcsc::{Card, Context, Protocols, Scope, ShareMode, MAX_BUFFER_SIZE};

use crate::transport::{Transport, TransportError};

/// A connected PC/SC card as an engine transport.
pub struct PcscTransport {
    card: Card,
}

impl PcscTransport {
    pub fn new(card: Card) -> Self {
        Self { card }
    }
}

impl Transport for PcscTransport {
    fn transmit(&mut self, frame: &[u8]) -> Result<Vec<u8>, TransportError> {
        let mut buf = [0; MAX_BUFFER_SIZE];
        let raw = self.card.transmit(frame, &mut buf).map_err(|e| match e {
            pcsc::Error::RemovedCard | pcsc::Error::NoSmartcard | pcsc::Error::ReaderUnavailable => {
                TransportError::Lost(e.to_string())
            }
            other => TransportError::Transmit(other.to_string()),
        })?;
        Ok(raw.to_vec())
    }
}

/// Reader discovery over a PC/SC context.
pub struct PcscReader {
    context: Context,
}

impl PcscReader {
    pub fn new() -> Result<Self, pcsc::Error> {
        let context = Context::establish(Scope::User)?;
        Ok(Self { context })
    }

    /// List all available reader names.
    pub fn list_readers(&self) -> Result<Vec<String>, pcsc::Error> {
        let mut readers_buf = [0; 2048];
        let readers = self.context.list_readers(&mut readers_buf)?;
        Ok(readers
            .map(|r| r.to_str().unwrap_or("Unknown").to_string())
            .collect())
    }

    /// Connect to the first reader with a card present and wrap it as a
    /// transport.
    pub fn connect_first(&self) -> Result<(PcscTransport, String), pcsc::Error> {
        let mut readers_buf = [0; 2048];
        let mut readers = self.context.list_readers(&mut readers_buf)?;

        if let Some(reader) = readers.next() {
            let reader_name = reader.to_str().unwrap_or("Unknown").to_string();
            let card = self
                .context
                .connect(reader, ShareMode::Shared, Protocols::ANY)?;
            Ok((PcscTransport::new(card), reader_name))
        } else {
            Err(pcsc::Error::NoReadersAvailable)
        }
    }
}
