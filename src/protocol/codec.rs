//! Frame encoding and decoding.
//!
//! Every message travels as one frame:
//!
//! ```text
//! MAGIC(4) | VERSION(1) | TYPE(1) | LENGTH(4, big-endian) | BODY(LENGTH)
//! ```
//!
//! The body starts with the envelope (16-byte message id, a reply flag, and the 16-byte
//! correlation id when the flag is set) followed by the payload, which is written by the
//! [`Marshaller`] registered for the frame's type.
use std::{collections::HashMap, marker::PhantomData};

use bincode::{
    config::{BigEndian, Configuration, Fixint},
    error::{DecodeError, EncodeError},
};
use thiserror::Error;

use super::message::{Body, Correlation, Message, MessageId, MessageKind, Payload, ResponseKind};
use super::message::{
    Banner, Close, Echo, Execute, Exit, Fault, Output, Ping, Pong, StreamData,
};

pub const MAGIC: [u8; 4] = *b"RSH\xfe";
pub const VERSION: u8 = 1;

const MAGIC_SIZE: usize = MAGIC.len();
const VERSION_SIZE: usize = size_of::<u8>();
const TYPE_SIZE: usize = size_of::<u8>();
const LENGTH_SIZE: usize = size_of::<u32>();

const VERSION_OFFSET: usize = MAGIC_SIZE;
const TYPE_OFFSET: usize = VERSION_OFFSET + VERSION_SIZE;
const LENGTH_OFFSET: usize = TYPE_OFFSET + TYPE_SIZE;

pub const HEADER_LENGTH: usize = LENGTH_OFFSET + LENGTH_SIZE;

const ID_SIZE: usize = size_of::<u128>();
const FLAG_SIZE: usize = size_of::<u8>();
const ENVELOPE_MIN: usize = ID_SIZE + FLAG_SIZE;

/// Largest body accepted or produced by default.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("bad magic {0:02x?}")]
    BadMagic(Vec<u8>),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type 0x{0:02x}")]
    UnknownType(u8),

    #[error("body length {declared} exceeds frame limit {limit}")]
    TooLarge { declared: usize, limit: usize },

    #[error("body length {declared} inconsistent with contents ({actual} bytes)")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("truncated frame, {missing} more bytes needed")]
    Truncated { missing: usize },

    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("failed to marshal body: {0}")]
    Marshal(#[from] EncodeError),

    #[error("failed to unmarshal body: {0}")]
    Unmarshal(#[from] DecodeError),
}

/// Outcome of inspecting the front of a receive buffer.
#[derive(Debug)]
pub enum Decodable {
    /// At least this many more bytes are required before anything can be decided.
    NeedMore(usize),
    /// A complete frame of this many bytes is at the front of the buffer.
    Ready(usize),
    /// The buffer can never become a valid frame.
    Corrupt(ProtocolError),
}

pub(crate) fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Converts one kind of [`Body`] to and from payload bytes.
pub trait Marshaller: Send + Sync {
    fn marshal(&self, body: &Body, out: &mut Vec<u8>) -> Result<(), ProtocolError>;

    fn unmarshal(&self, bytes: &[u8]) -> Result<Body, ProtocolError>;
}

/// Marshals a [`Payload`] with bincode.
pub struct BincodeMarshaller<P>(PhantomData<fn() -> P>);

impl<P> Default for BincodeMarshaller<P> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<P: Payload> Marshaller for BincodeMarshaller<P> {
    fn marshal(&self, body: &Body, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let payload = P::from_body(body).ok_or_else(|| {
            ProtocolError::Envelope(format!(
                "{:?} body handed to the {:?} marshaller",
                body.kind(),
                P::KIND
            ))
        })?;
        bincode::encode_into_std_write(payload, out, config())?;
        Ok(())
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Body, ProtocolError> {
        let (payload, read): (P, usize) = bincode::decode_from_slice(bytes, config())?;
        if read != bytes.len() {
            return Err(ProtocolError::LengthMismatch {
                declared: bytes.len(),
                actual: read,
            });
        }
        Ok(payload.into())
    }
}

/// Frames messages, delegating payloads to per-type marshallers.
pub struct Codec {
    marshallers: HashMap<MessageKind, Box<dyn Marshaller>>,
    max_frame_length: usize,
}

impl Default for Codec {
    fn default() -> Self {
        let mut codec = Self::empty();
        codec.register(MessageKind::Ping, BincodeMarshaller::<Ping>::default());
        codec.register(MessageKind::Pong, BincodeMarshaller::<Pong>::default());
        codec.register(MessageKind::Echo, BincodeMarshaller::<Echo>::default());
        codec.register(MessageKind::Execute, BincodeMarshaller::<Execute>::default());
        codec.register(MessageKind::Output, BincodeMarshaller::<Output>::default());
        codec.register(MessageKind::Exit, BincodeMarshaller::<Exit>::default());
        codec.register(MessageKind::Fault, BincodeMarshaller::<Fault>::default());
        codec.register(
            MessageKind::StreamData,
            BincodeMarshaller::<StreamData>::default(),
        );
        codec.register(MessageKind::Banner, BincodeMarshaller::<Banner>::default());
        codec.register(MessageKind::Close, BincodeMarshaller::<Close>::default());
        codec
    }
}

impl Codec {
    /// A codec that knows no message types.
    pub fn empty() -> Self {
        Self {
            marshallers: HashMap::new(),
            max_frame_length: MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, limit: usize) -> Self {
        self.max_frame_length = limit;
        self
    }

    /// Install the marshaller for `kind`, returning the one it replaces.
    pub fn register<M: Marshaller + 'static>(
        &mut self,
        kind: MessageKind,
        marshaller: M,
    ) -> Option<Box<dyn Marshaller>> {
        self.marshallers.insert(kind, Box::new(marshaller))
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Check whether `buf` starts with a complete frame without decoding it.
    pub fn decodable(&self, buf: &[u8]) -> Decodable {
        let magic = &buf[..buf.len().min(MAGIC_SIZE)];
        if magic != &MAGIC[..magic.len()] {
            return Decodable::Corrupt(ProtocolError::BadMagic(magic.to_vec()));
        }
        if buf.len() > VERSION_OFFSET && buf[VERSION_OFFSET] != VERSION {
            return Decodable::Corrupt(ProtocolError::UnsupportedVersion(buf[VERSION_OFFSET]));
        }
        if buf.len() > TYPE_OFFSET {
            if let Err(e) = self.marshaller(buf[TYPE_OFFSET]) {
                return Decodable::Corrupt(e);
            }
        }
        if buf.len() < HEADER_LENGTH {
            return Decodable::NeedMore(HEADER_LENGTH - buf.len());
        }

        let declared = read_length(buf);
        if declared > self.max_frame_length {
            return Decodable::Corrupt(ProtocolError::TooLarge {
                declared,
                limit: self.max_frame_length,
            });
        }
        if declared < ENVELOPE_MIN {
            return Decodable::Corrupt(ProtocolError::LengthMismatch {
                declared,
                actual: ENVELOPE_MIN,
            });
        }

        let total = HEADER_LENGTH + declared;
        if buf.len() < total {
            Decodable::NeedMore(total - buf.len())
        } else {
            Decodable::Ready(total)
        }
    }

    /// Encode `message` into a new frame.
    pub fn encode(&self, message: &Message) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(HEADER_LENGTH + ENVELOPE_MIN + ID_SIZE);
        self.encode_into(message, &mut buf)?;
        Ok(buf)
    }

    /// Append the frame for `message` to `buf`. On error `buf` is left as it was.
    pub fn encode_into(&self, message: &Message, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let start = buf.len();
        let result = self.write_frame(message, buf);
        if result.is_err() {
            buf.truncate(start);
        }
        result
    }

    fn write_frame(&self, message: &Message, buf: &mut Vec<u8>) -> Result<(), ProtocolError> {
        let kind = message.kind() as u8;
        let marshaller = self.marshaller(kind)?;

        let header = buf.len();
        buf.extend_from_slice(&MAGIC);
        buf.push(VERSION);
        buf.push(kind);
        buf.extend_from_slice(&[0; LENGTH_SIZE]);

        let body = buf.len();
        buf.extend_from_slice(&message.id.0.to_be_bytes());
        match message.correlation {
            Some(correlation) => {
                buf.push(correlation.kind.flag());
                buf.extend_from_slice(&correlation.id.0.to_be_bytes());
            }
            None => buf.push(0),
        }
        marshaller.marshal(&message.body, buf)?;

        // Body size is only known once the payload is marshalled.
        let length = buf.len() - body;
        if length > self.max_frame_length {
            return Err(ProtocolError::TooLarge {
                declared: length,
                limit: self.max_frame_length,
            });
        }
        let at = header + LENGTH_OFFSET;
        buf[at..at + LENGTH_SIZE].copy_from_slice(&(length as u32).to_be_bytes());
        Ok(())
    }

    /// Decode the frame at the front of `buf`, returning the message and the bytes it used.
    pub fn decode(&self, buf: &[u8]) -> Result<(Message, usize), ProtocolError> {
        let total = match self.decodable(buf) {
            Decodable::Ready(total) => total,
            Decodable::NeedMore(missing) => return Err(ProtocolError::Truncated { missing }),
            Decodable::Corrupt(e) => return Err(e),
        };

        let kind = MessageKind::try_from(buf[TYPE_OFFSET])?;
        let marshaller = self.marshaller(kind as u8)?;
        let body = &buf[HEADER_LENGTH..total];

        let id = MessageId(read_u128(&body[..ID_SIZE]));
        let correlation = match ResponseKind::from_flag(body[ID_SIZE])? {
            Some(kind) => {
                let end = ENVELOPE_MIN + ID_SIZE;
                if body.len() < end {
                    return Err(ProtocolError::LengthMismatch {
                        declared: body.len(),
                        actual: end,
                    });
                }
                Some(Correlation {
                    id: MessageId(read_u128(&body[ENVELOPE_MIN..end])),
                    kind,
                })
            }
            None => None,
        };

        let payload = match correlation {
            Some(_) => &body[ENVELOPE_MIN + ID_SIZE..],
            None => &body[ENVELOPE_MIN..],
        };
        let decoded = marshaller.unmarshal(payload)?;
        if decoded.kind() != kind {
            return Err(ProtocolError::Envelope(format!(
                "{kind:?} frame decoded as {:?}",
                decoded.kind()
            )));
        }

        Ok((
            Message {
                id,
                correlation,
                body: decoded,
            },
            total,
        ))
    }

    fn marshaller(&self, kind: u8) -> Result<&dyn Marshaller, ProtocolError> {
        let known = MessageKind::try_from(kind)?;
        self.marshallers
            .get(&known)
            .map(|m| m.as_ref())
            .ok_or(ProtocolError::UnknownType(kind))
    }
}

fn read_length(buf: &[u8]) -> usize {
    let mut bytes = [0; LENGTH_SIZE];
    bytes.copy_from_slice(&buf[LENGTH_OFFSET..LENGTH_OFFSET + LENGTH_SIZE]);
    u32::from_be_bytes(bytes) as usize
}

fn read_u128(bytes: &[u8]) -> u128 {
    let mut id = [0; ID_SIZE];
    id.copy_from_slice(bytes);
    u128::from_be_bytes(id)
}
