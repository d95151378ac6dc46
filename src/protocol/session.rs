//! One logical, bidirectional connection.
//!
//! A [`Session`] owns a byte stream split in two: a dedicated reader thread decodes frames
//! and hands them to the [`Dispatcher`], while any number of caller threads write frames
//! through a shared, mutex-guarded writer. Each session has its own [`RequestRegistry`] and
//! [`IdGenerator`]; they are built here and handed to collaborators explicitly.
use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use super::{
    codec::Codec,
    dispatch::Dispatcher,
    message::{
        Body, Close, IdGenerator, IdStrategy, Message, MessageId, MessageKind, OutputStream,
        ResponseKind,
    },
    registry::RequestRegistry,
    requestor::Requestor,
    stream::{ReplyStream, SessionStream},
    timer::Timer,
    transport::{ProtocolTransport, TransportError},
};

/// Longest a single write may make no progress before the session gives up on the peer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// A byte stream that can be split into independently owned halves and shut down.
pub trait Duplex: Read + Write + Send + Sync + Sized + 'static {
    fn try_clone(&self) -> io::Result<Self>;

    fn shutdown(&self) -> io::Result<()>;

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    fn describe(&self) -> String;
}

impl Duplex for TcpStream {
    fn try_clone(&self) -> io::Result<Self> {
        TcpStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }

    fn describe(&self) -> String {
        match self.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp".to_string(),
        }
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn try_clone(&self) -> io::Result<Self> {
        std::os::unix::net::UnixStream::try_clone(self)
    }

    fn shutdown(&self) -> io::Result<()> {
        std::os::unix::net::UnixStream::shutdown(self, Shutdown::Both)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }

    fn describe(&self) -> String {
        "unix".to_string()
    }
}

/// Per-session settings.
#[derive(Clone)]
pub struct SessionOptions {
    pub ids: IdStrategy,
    pub timer: Timer,
    pub codec: Arc<Codec>,
    /// `None` lets writes block for as long as the peer stalls.
    pub write_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ids: IdStrategy::default(),
            timer: Timer::global(),
            codec: Arc::new(Codec::default()),
            write_timeout: Some(DEFAULT_WRITE_TIMEOUT),
        }
    }
}

impl SessionOptions {
    pub fn with_ids(mut self, ids: IdStrategy) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_timer(mut self, timer: Timer) -> Self {
        self.timer = timer;
        self
    }

    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }
}

type ShutdownFn = Box<dyn Fn() -> io::Result<()> + Send + Sync>;

struct Inner {
    name: String,
    writer: Mutex<ProtocolTransport<Box<dyn Write + Send>>>,
    shutdown: ShutdownFn,
    registry: RequestRegistry,
    dispatcher: Dispatcher,
    ids: IdGenerator,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connect over TCP and start the session.
    pub fn connect<A: ToSocketAddrs>(
        address: A,
        dispatcher: Dispatcher,
        options: SessionOptions,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Self::start(stream, dispatcher, options)
    }

    /// Take over `stream` and start the reader thread.
    pub fn start<S: Duplex>(
        stream: S,
        dispatcher: Dispatcher,
        options: SessionOptions,
    ) -> Result<Self, TransportError> {
        let name = stream.describe();
        stream.set_write_timeout(options.write_timeout)?;
        let reader = stream.try_clone()?;
        let control = stream.try_clone()?;
        let writer: Box<dyn Write + Send> = Box::new(stream);

        let session = Session {
            inner: Arc::new(Inner {
                name,
                writer: Mutex::new(ProtocolTransport::new(writer, Arc::clone(&options.codec))),
                shutdown: Box::new(move || control.shutdown()),
                registry: RequestRegistry::new(options.timer),
                dispatcher,
                ids: IdGenerator::new(options.ids),
                closed: AtomicBool::new(false),
                reader: Mutex::new(None),
            }),
        };

        let transport = ProtocolTransport::new(reader, options.codec);
        let handle = {
            let session = session.clone();
            thread::Builder::new()
                .name(format!("session-{}", session.name()))
                .spawn(move || read_loop(session, transport))?
        };
        *session.inner.reader.lock().unwrap() = Some(handle);

        debug!("{}: session started", session.name());
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn registry(&self) -> &RequestRegistry {
        &self.inner.registry
    }

    pub fn requestor(&self) -> Requestor {
        Requestor::new(self.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn next_id(&self) -> MessageId {
        self.inner.ids.next()
    }

    /// Fire-and-forget send of an unsolicited message.
    pub fn send(&self, body: impl Into<Body>) -> Result<MessageId, TransportError> {
        let message = Message::new(self.next_id(), body);
        self.write(&message)?;
        Ok(message.id)
    }

    /// Answer `request`.
    pub fn reply(
        &self,
        request: &Message,
        kind: ResponseKind,
        body: impl Into<Body>,
    ) -> Result<(), TransportError> {
        self.reply_to(request.id, kind, body)
    }

    /// Answer the request with id `request`.
    pub fn reply_to(
        &self,
        request: MessageId,
        kind: ResponseKind,
        body: impl Into<Body>,
    ) -> Result<(), TransportError> {
        self.write(&Message::reply(self.next_id(), request, kind, body))
    }

    /// A writer that sends everything written to it as [`StreamData`](super::message::StreamData) on `channel`.
    pub fn stream(&self, channel: u32) -> SessionStream {
        SessionStream::new(self.clone(), channel)
    }

    /// A writer that streams output back to `request` as partial replies.
    pub fn reply_stream(&self, request: &Message, stream: OutputStream) -> ReplyStream {
        ReplyStream::new(self.clone(), request.id, stream)
    }

    /// Write a registered request and start its timeout once it is flushed.
    pub(crate) fn send_request(&self, message: &Message) -> Result<(), TransportError> {
        self.write(message)?;
        self.inner.dispatcher.on_sent(&self.inner.registry, message);
        Ok(())
    }

    /// Write one frame. An I/O failure leaves a partial frame on the wire, so it ends the session.
    fn write(&self, message: &Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let result = {
            let mut writer = self.inner.writer.lock().unwrap();
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
            writer.write_message(message)
        };

        if let Err(TransportError::Io(e)) = &result {
            if !self.is_closed() {
                warn!("{}: write failed, closing session: {e}", self.name());
            }
            self.terminate();
        }
        result
    }

    /// Tell the peer we are leaving, then tear the session down.
    ///
    /// Never waits behind a blocked writer: if the writer is busy the announcement is skipped,
    /// and shutting the stream down releases the blocked write.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }

        match self.inner.writer.try_lock() {
            Ok(mut writer) => {
                let message = Message::new(self.next_id(), Close);
                if let Err(e) = writer.write_message(&message) {
                    debug!("{}: could not announce close: {e}", self.name());
                }
            }
            Err(_) => debug!("{}: writer busy, closing unannounced", self.name()),
        }
        self.terminate();
    }

    /// Block until the reader thread has exited.
    pub fn wait(&self) {
        let handle = self.inner.reader.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("{}: reader thread panicked", self.name());
            }
        }
    }

    /// Fail pending requests, shut the stream down and run close hooks. Runs once.
    fn terminate(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let failed = self.inner.registry.close();
        if let Err(e) = (self.inner.shutdown)() {
            if e.kind() != io::ErrorKind::NotConnected {
                debug!("{}: shutdown failed: {e}", self.name());
            }
        }
        self.inner.dispatcher.closed(self);
        info!("{}: session closed ({failed} requests failed)", self.name());
    }
}

fn read_loop<S: Read>(session: Session, mut transport: ProtocolTransport<S>) {
    loop {
        let message = match transport.read_message() {
            Ok(message) => message,
            Err(TransportError::Closed) => {
                debug!("{}: peer closed the connection", session.name());
                break;
            }
            Err(e) => {
                if !session.is_closed() {
                    warn!("{}: {e}", session.name());
                }
                break;
            }
        };

        let closing = message.correlation.is_none() && message.kind() == MessageKind::Close;
        session
            .inner
            .dispatcher
            .dispatch(&session.inner.registry, &session, message);

        if closing {
            debug!("{}: peer announced close", session.name());
            break;
        }
    }

    session.terminate();
}
