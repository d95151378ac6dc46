//! Byte streams carried over a session.
use std::io::{self, Write};

use super::{
    message::{MessageId, Output, OutputStream, ResponseKind, StreamData},
    session::Session,
};

/// Largest chunk a [`ReplyStream`] holds before sending it.
pub const REPLY_CHUNK: usize = 4 * 1024;

/// Sends each write as one unsolicited [`StreamData`] message on a channel.
pub struct SessionStream {
    session: Session,
    channel: u32,
}

impl SessionStream {
    pub(crate) fn new(session: Session, channel: u32) -> Self {
        Self { session, channel }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }
}

impl Write for SessionStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.session
            .send(StreamData {
                channel: self.channel,
                data: buf.to_vec(),
            })
            .map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Buffers output and sends it to a request as `Partial` [`Output`] replies.
///
/// Nothing is sent on drop; call [`flush`](Write::flush) when done.
pub struct ReplyStream {
    session: Session,
    request: MessageId,
    stream: OutputStream,
    buffer: Vec<u8>,
    chunks: usize,
}

impl ReplyStream {
    pub(crate) fn new(session: Session, request: MessageId, stream: OutputStream) -> Self {
        Self {
            session,
            request,
            stream,
            buffer: Vec::new(),
            chunks: 0,
        }
    }

    /// Number of replies sent so far.
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffer);
        self.session
            .reply_to(
                self.request,
                ResponseKind::Partial,
                Output {
                    stream: self.stream,
                    data,
                },
            )
            .map_err(io::Error::other)?;
        self.chunks += 1;
        Ok(())
    }
}

impl Write for ReplyStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = REPLY_CHUNK - self.buffer.len();
        let take = buf.len().min(room);
        self.buffer.extend_from_slice(&buf[..take]);
        if self.buffer.len() >= REPLY_CHUNK {
            self.send()?;
        }
        Ok(take)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()
    }
}
