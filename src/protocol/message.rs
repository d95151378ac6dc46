//! Protocol messages and their identities.
//!
//! A [`Message`] is an immutable envelope: the sender-assigned [`MessageId`], an optional
//! [`Correlation`] naming the request it answers, and a typed [`Body`]. The body's
//! [`MessageKind`] is the type discriminator written into every frame header and is used by
//! the codec to pick a marshaller and by the dispatcher to pick a handler.
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use bincode::{Decode, Encode};
use uuid::Uuid;

use super::codec::ProtocolError;

/// Identifies one outbound message. Replies carry the id of the request they answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub u128);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 <= u64::MAX as u128 {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#{:032x}", self.0)
        }
    }
}

/// How new message ids are produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdStrategy {
    /// Monotonic counter starting at 1.
    #[default]
    Sequential,
    /// Random 128-bit UUID v4 tokens.
    Random,
}

/// Generates [`MessageId`]s for one session.
#[derive(Debug, Default)]
pub struct IdGenerator {
    strategy: IdStrategy,
    counter: AtomicU64,
}

impl IdGenerator {
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            counter: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    pub fn next(&self) -> MessageId {
        match self.strategy {
            IdStrategy::Sequential => {
                MessageId(self.counter.fetch_add(1, Ordering::Relaxed) as u128 + 1)
            }
            IdStrategy::Random => MessageId(Uuid::new_v4().as_u128()),
        }
    }
}

/// How a reply relates to the stream of replies for its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    /// The single, complete answer.
    Whole,
    /// One chunk of a multi-part answer; more will follow.
    Partial,
    /// The final chunk of a multi-part answer.
    PartialLast,
}

impl ResponseKind {
    /// True when no further replies follow this one.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ResponseKind::Partial)
    }

    pub(crate) fn flag(self) -> u8 {
        match self {
            ResponseKind::Whole => 1,
            ResponseKind::Partial => 2,
            ResponseKind::PartialLast => 3,
        }
    }

    pub(crate) fn from_flag(flag: u8) -> Result<Option<Self>, ProtocolError> {
        match flag {
            0 => Ok(None),
            1 => Ok(Some(ResponseKind::Whole)),
            2 => Ok(Some(ResponseKind::Partial)),
            3 => Ok(Some(ResponseKind::PartialLast)),
            flag => Err(ProtocolError::Envelope(format!("invalid reply flag {flag}"))),
        }
    }
}

/// Marks a message as a reply to an earlier request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub id: MessageId,
    pub kind: ResponseKind,
}

/// One-byte type discriminator written into every frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0x01,
    Pong = 0x02,
    Echo = 0x03,
    Execute = 0x10,
    Output = 0x11,
    Exit = 0x12,
    Fault = 0x13,
    StreamData = 0x20,
    Banner = 0x21,
    Close = 0x7f,
}

impl MessageKind {
    pub const ALL: [MessageKind; 10] = [
        MessageKind::Ping,
        MessageKind::Pong,
        MessageKind::Echo,
        MessageKind::Execute,
        MessageKind::Output,
        MessageKind::Exit,
        MessageKind::Fault,
        MessageKind::StreamData,
        MessageKind::Banner,
        MessageKind::Close,
    ];
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        MessageKind::ALL
            .into_iter()
            .find(|kind| *kind as u8 == value)
            .ok_or(ProtocolError::UnknownType(value))
    }
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Ping;

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Pong;

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Echo {
    pub text: String,
}

/// Run a command line in the remote shell.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Execute {
    pub line: String,
}

/// Which of a command's output streams a chunk belongs to.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Output {
    pub stream: OutputStream,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Exit {
    pub code: i32,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Fault {
    pub reason: String,
}

/// A chunk of a raw byte stream multiplexed over the session.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct StreamData {
    pub channel: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Banner {
    pub text: String,
}

#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct Close;

/// A typed message body with a fixed discriminator.
pub trait Payload: Encode + Decode<()> + Into<Body> + Sized {
    const KIND: MessageKind;

    fn from_body(body: &Body) -> Option<&Self>;
}

macro_rules! bodies {
    ($($kind:ident),* $(,)?) => {
        /// Every payload the protocol can carry.
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub enum Body {
            $($kind($kind),)*
        }

        impl Body {
            pub fn kind(&self) -> MessageKind {
                match self {
                    $(Body::$kind(_) => MessageKind::$kind,)*
                }
            }
        }

        $(
            impl Payload for $kind {
                const KIND: MessageKind = MessageKind::$kind;

                fn from_body(body: &Body) -> Option<&Self> {
                    match body {
                        Body::$kind(payload) => Some(payload),
                        _ => None,
                    }
                }
            }

            impl From<$kind> for Body {
                fn from(payload: $kind) -> Self {
                    Body::$kind(payload)
                }
            }
        )*
    };
}

bodies!(
    Ping, Pong, Echo, Execute, Output, Exit, Fault, StreamData, Banner, Close,
);

/// An immutable protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub correlation: Option<Correlation>,
    pub body: Body,
}

impl Message {
    pub fn new(id: MessageId, body: impl Into<Body>) -> Self {
        Self {
            id,
            correlation: None,
            body: body.into(),
        }
    }

    /// Build a reply to `request`.
    pub fn reply(
        id: MessageId,
        request: MessageId,
        kind: ResponseKind,
        body: impl Into<Body>,
    ) -> Self {
        Self {
            id,
            correlation: Some(Correlation { id: request, kind }),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    /// The request this message answers, if it is a reply.
    pub fn correlation_id(&self) -> Option<MessageId> {
        self.correlation.map(|c| c.id)
    }

    pub fn payload<P: Payload>(&self) -> Option<&P> {
        P::from_body(&self.body)
    }
}
