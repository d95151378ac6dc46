//! Client-server communication protocol.
//!
//! This module defines how a shell client and server talk: the frame format, message
//! identities, and the machinery that turns an asynchronous, bidirectional byte stream into
//! a "send and wait for the reply, with a timeout" API usable from many threads at once.
//!
//! # Overview
//!
//! Every message is a [`Message`]: an id, an optional correlation naming the request it
//! answers, and a typed [`Body`]. Messages are framed by the [`Codec`] and exchanged over a
//! [`Session`], which runs one reader thread per connection.
//!
//! Outbound requests go through a [`Requestor`]. Each request is registered in the session's
//! [`RequestRegistry`] before it is written, activated (its timeout started) after the write
//! completes, and resolved by whichever comes first: a terminal reply, a cancellation, a
//! timeout, or the session closing. Inbound replies are routed by the [`Dispatcher`] to the
//! registry; all other inbound messages go to the handler registered for their kind.
//!
//! # Binary Format
//!
//! - A fixed header: magic, version byte, type byte, and a big-endian `u32` body length.
//! - The body: the message id, a reply flag with the correlation id, then the payload.
//! - Payloads are bincode encoded, big-endian with fixed-width integers.
//!
//! Frames can be checked for completeness with [`Codec::decodable`] before decoding, which
//! lets the transport accumulate partial reads.
//!
//! # Replies
//!
//! A request is answered either by one `Whole` reply or by any number of `Partial` replies
//! closed by a `PartialLast`. Callers see them in arrival order through
//! [`RequestHandle::await_response`].
//!
//! # See Also
//!
//! - [`shell`](crate::shell): Commands executed on behalf of `Execute` requests.
mod codec;
mod dispatch;
mod message;
mod registry;
mod request;
mod requestor;
mod response;
mod server;
mod session;
mod stream;
mod thread;
mod timer;
mod transport;

pub use codec::{
    BincodeMarshaller, Codec, Decodable, HEADER_LENGTH, MAGIC, MAX_FRAME_LENGTH, Marshaller,
    ProtocolError, VERSION,
};
pub use dispatch::{Dispatcher, Handler, Routed};
pub use message::{
    Banner, Body, Close, Correlation, Echo, Execute, Exit, Fault, IdGenerator, IdStrategy,
    Message, MessageId, MessageKind, Output, OutputStream, Payload, Ping, Pong, ResponseKind,
    StreamData,
};
pub use registry::{Race, RegistryError, RequestRegistry, Transition};
pub use request::{PendingRequest, RequestError, RequestState};
pub use requestor::{DEFAULT_TIMEOUT, RequestHandle, Requestor};
pub use response::Response;
pub use server::{DEFAULT_WORKERS, ServerError, ShellServer};
pub use session::{DEFAULT_WRITE_TIMEOUT, Duplex, Session, SessionOptions};
pub use stream::{ReplyStream, SessionStream};
pub use thread::ThreadPool;
pub use timer::{Timer, TimerHandle};
pub use transport::{ProtocolTransport, TransportError};
