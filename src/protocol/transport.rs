use std::{
    io::{self, Read, Write},
    sync::Arc,
};

use log::trace;
use thiserror::Error;

use super::{
    codec::{Codec, Decodable, ProtocolError},
    message::Message,
};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport IO error: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed by peer")]
    Closed,
}

/// Reads and writes framed messages over a byte stream.
///
/// Inbound bytes accumulate in a buffer until the codec reports a complete frame; a frame is
/// only removed from the buffer once it decoded successfully.
pub struct ProtocolTransport<T> {
    stream: T,
    codec: Arc<Codec>,
    buffer: Vec<u8>,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T, codec: Arc<Codec>) -> Self {
        Self {
            stream,
            codec,
            buffer: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    /// Bytes received but not yet decoded.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }
}

impl<T: Read> ProtocolTransport<T> {
    pub fn read_message(&mut self) -> Result<Message, TransportError> {
        let mut chunk = [0; READ_CHUNK];
        loop {
            match self.codec.decodable(&self.buffer) {
                Decodable::Ready(_) => {
                    let (message, used) = self.codec.decode(&self.buffer)?;
                    self.buffer.drain(..used);
                    trace!("read {:?} frame of {used} bytes", message.kind());
                    return Ok(message);
                }
                Decodable::Corrupt(e) => return Err(e.into()),
                Decodable::NeedMore(_) => {}
            }

            let read = match self.stream.read(&mut chunk) {
                Ok(read) => read,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            if read == 0 {
                if self.buffer.is_empty() {
                    return Err(TransportError::Closed);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream ended inside a frame ({} bytes)", self.buffer.len()),
                )
                .into());
            }
            self.buffer.extend_from_slice(&chunk[..read]);
        }
    }
}

impl<T: Write> ProtocolTransport<T> {
    /// Write one frame and flush it; returns once the bytes are handed to the OS.
    pub fn write_message(&mut self, message: &Message) -> Result<(), TransportError> {
        let frame = self.codec.encode(message)?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;
        trace!("wrote {:?} frame of {} bytes", message.kind(), frame.len());
        Ok(())
    }
}
