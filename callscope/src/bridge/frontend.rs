//! Consumers of profiler messages

use super::protocol::Message;
use crate::domain::BridgeError;
use std::io::Write;

/// Receiver of [`Message`]s; transport and framing are up to the implementor
pub trait Frontend: Send {
    /// Deliver one message
    ///
    /// # Errors
    /// Implementation specific; the bridge logs and carries on.
    fn send(&mut self, message: &Message) -> Result<(), BridgeError>;
}

/// One JSON document per line, flushed after every message
pub struct JsonLinesFrontend<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesFrontend<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> Frontend for JsonLinesFrontend<W> {
    fn send(&mut self, message: &Message) -> Result<(), BridgeError> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}
