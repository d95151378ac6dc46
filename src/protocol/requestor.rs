//! Synchronous-looking request/reply over an asynchronous session.
//!
//! [`Requestor::submit`] registers a fresh [`PendingRequest`] *before* writing the request,
//! so a reply can never beat its registration, and the session activates the request (starting
//! its timeout) only after the frame was flushed. [`Requestor::request`] is submit plus a
//! blocking wait for the terminal reply.
use std::{sync::Arc, time::Duration};

use log::debug;

use super::{
    message::{Body, Message, MessageId},
    registry::{RegistryError, RequestRegistry, Transition},
    request::{PendingRequest, RequestError, RequestState},
    response::Response,
    session::Session,
};

/// Timeout used by callers that have no better idea.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Issues requests on one session. Cheap to clone; holds no per-request state.
#[derive(Clone)]
pub struct Requestor {
    session: Session,
}

impl Requestor {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    /// Send `body` as a tracked request without waiting for the reply.
    pub fn submit(
        &self,
        body: impl Into<Body>,
        timeout: Duration,
    ) -> Result<RequestHandle, RequestError> {
        let message = Message::new(self.session.next_id(), body);
        let pending = Arc::new(PendingRequest::new(message.id, message.kind(), timeout));
        let registry = self.session.registry();

        registry
            .register(Arc::clone(&pending))
            .map_err(|e| match e {
                RegistryError::Closed(id) => RequestError::SessionClosed(id),
                e => e.into(),
            })?;

        if let Err(e) = self.session.send_request(&message) {
            registry.deregister(message.id);
            return Err(e.into());
        }

        Ok(RequestHandle {
            pending,
            registry: registry.clone(),
        })
    }

    /// Send `body` and block until its terminal reply, or fail on timeout.
    ///
    /// Partial replies that precede the terminal one are discarded.
    pub fn request(&self, body: impl Into<Body>, timeout: Duration) -> Result<Message, RequestError> {
        self.submit(body, timeout)?.wait()
    }
}

/// The caller's side of one submitted request.
///
/// Dropping a handle whose request is still pending deregisters it.
pub struct RequestHandle {
    pending: Arc<PendingRequest>,
    registry: RequestRegistry,
}

impl RequestHandle {
    pub fn id(&self) -> MessageId {
        self.pending.id()
    }

    pub fn state(&self) -> RequestState {
        self.pending.state()
    }

    pub fn await_response(&self) -> Result<Response, RequestError> {
        self.pending.await_response()
    }

    pub fn await_response_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Response>, RequestError> {
        self.pending.await_response_timeout(timeout)
    }

    /// Abandon the request; a waiting caller receives [`RequestError::Cancelled`].
    pub fn cancel(&self) -> Transition {
        self.registry.deactivate(self.id())
    }

    /// Wait for the terminal reply.
    pub fn wait(self) -> Result<Message, RequestError> {
        loop {
            let response = self.await_response()?;
            if response.is_terminal() {
                return Ok(response.into_message());
            }
        }
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        if self.registry.deregister(self.id()).is_some() {
            debug!("handle for {} dropped while pending, deregistered", self.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::{TcpListener, TcpStream},
        sync::mpsc,
        thread,
        time::Instant,
    };

    use super::super::{
        dispatch::Dispatcher,
        message::{
            Echo, Execute, Exit, IdStrategy, MessageKind, Output, OutputStream, Ping, Pong,
            ResponseKind, StreamData,
        },
        registry::Race,
        session::SessionOptions,
        timer::Timer,
        transport::TransportError,
    };
    use super::*;

    /// Start a connected (client, server) session pair over loopback TCP.
    fn pair(client: Dispatcher, server: Dispatcher) -> (Session, Session) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let connecting = thread::spawn(move || TcpStream::connect(address).unwrap());
        let (accepted, _) = listener.accept().unwrap();
        let connected = connecting.join().unwrap();

        let options = SessionOptions::default().with_timer(Timer::new(2));
        let client = Session::start(connected, client, options.clone()).unwrap();
        let server = Session::start(accepted, server, options).unwrap();
        (client, server)
    }

    fn pong(session: &Session, message: Message) -> Result<(), TransportError> {
        session.reply(&message, ResponseKind::Whole, Pong)
    }

    fn echo(session: &Session, message: Message) -> Result<(), TransportError> {
        let text = message.payload::<Echo>().map(|e| e.text.clone()).unwrap_or_default();
        session.reply(&message, ResponseKind::Whole, Echo { text })
    }

    #[test]
    fn whole_reply_completes_request() {
        let (client, _server) = pair(
            Dispatcher::new(),
            Dispatcher::new().on(MessageKind::Ping, pong),
        );

        let reply = client
            .requestor()
            .request(Ping, Duration::from_millis(100))
            .unwrap();

        assert_eq!(reply.payload::<Pong>(), Some(&Pong));
        assert_eq!(reply.correlation_id(), Some(MessageId(1)));
        assert!(!client.registry().contains(MessageId(1)));
    }

    #[test]
    fn unanswered_request_times_out() {
        let (client, _server) = pair(Dispatcher::new(), Dispatcher::new());
        let requestor = client.requestor();

        let handle = requestor.submit(Ping, Duration::from_millis(50)).unwrap();
        let id = handle.id();
        let started = Instant::now();

        assert!(matches!(
            handle.wait(),
            Err(RequestError::Timeout { id: timed_out, .. }) if timed_out == id
        ));
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert!(!client.registry().contains(id));
    }

    #[test]
    fn partial_replies_are_observed_in_order() {
        let stream = |session: &Session, message: Message| -> Result<(), TransportError> {
            for chunk in ["one", "two"] {
                session.reply(
                    &message,
                    ResponseKind::Partial,
                    Output {
                        stream: OutputStream::Stdout,
                        data: chunk.as_bytes().to_vec(),
                    },
                )?;
            }
            session.reply(&message, ResponseKind::PartialLast, Exit { code: 0 })
        };
        let (client, _server) = pair(
            Dispatcher::new(),
            Dispatcher::new().on(MessageKind::Execute, stream),
        );

        let handle = client
            .requestor()
            .submit(
                Execute {
                    line: "anything".to_string(),
                },
                Duration::from_secs(1),
            )
            .unwrap();

        let first = handle.await_response().unwrap();
        let second = handle.await_response().unwrap();
        let third = handle.await_response().unwrap();
        assert_eq!(first.kind, ResponseKind::Partial);
        assert_eq!(first.payload::<Output>().unwrap().data, b"one");
        assert_eq!(second.payload::<Output>().unwrap().data, b"two");
        assert_eq!(third.kind, ResponseKind::PartialLast);
        assert_eq!(third.payload::<Exit>(), Some(&Exit { code: 0 }));
        assert!(matches!(
            handle.await_response(),
            Err(RequestError::IllegalState(_))
        ));
        assert_eq!(handle.state(), RequestState::Resolved);
    }

    #[test]
    fn session_close_unblocks_pending_request() {
        let hang_up = |session: &Session, _: Message| -> Result<(), TransportError> {
            session.close();
            Ok(())
        };
        let (client, server) = pair(
            Dispatcher::new(),
            Dispatcher::new().on(MessageKind::Ping, hang_up),
        );

        let started = Instant::now();
        let result = client.requestor().request(Ping, Duration::from_secs(30));

        assert!(matches!(result, Err(RequestError::SessionClosed(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
        client.wait();
        server.wait();
        assert!(client.is_closed());
        assert!(client.registry().is_empty());
        assert!(matches!(
            client.requestor().request(Ping, Duration::from_secs(1)),
            Err(RequestError::SessionClosed(_))
        ));
    }

    #[test]
    fn cancel_releases_the_caller() {
        let (client, _server) = pair(Dispatcher::new(), Dispatcher::new());
        let handle = client
            .requestor()
            .submit(Ping, Duration::from_secs(30))
            .unwrap();

        assert_eq!(handle.cancel(), Transition::Applied);
        assert_eq!(handle.cancel(), Transition::Ignored(Race::NotRegistered));
        assert!(matches!(
            handle.await_response(),
            Err(RequestError::Cancelled(_))
        ));
        assert_eq!(handle.state(), RequestState::Deactive);
    }

    #[test]
    fn dropping_a_handle_deregisters() {
        let (client, _server) = pair(Dispatcher::new(), Dispatcher::new());
        let handle = client
            .requestor()
            .submit(Ping, Duration::from_secs(30))
            .unwrap();
        let id = handle.id();
        assert!(client.registry().contains(id));

        drop(handle);
        assert!(!client.registry().contains(id));
    }

    #[test]
    fn concurrent_callers_get_their_own_replies() {
        let (client, _server) = pair(
            Dispatcher::new(),
            Dispatcher::new().on(MessageKind::Echo, echo),
        );

        let callers: Vec<_> = (0..8)
            .map(|caller| {
                let requestor = client.requestor();
                thread::spawn(move || {
                    for n in 0..50 {
                        let text = format!("{caller}-{n}");
                        let reply = requestor
                            .request(Echo { text: text.clone() }, Duration::from_secs(5))
                            .unwrap();
                        assert_eq!(reply.payload::<Echo>().unwrap().text, text);
                    }
                })
            })
            .collect();

        for caller in callers {
            caller.join().unwrap();
        }
        assert!(client.registry().is_empty());
    }

    #[test]
    fn unsolicited_messages_reach_their_handler() {
        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        let collect = move |_: &Session, message: Message| -> Result<(), TransportError> {
            if let Some(chunk) = message.payload::<StreamData>() {
                tx.lock().unwrap().send(chunk.clone()).unwrap();
            }
            Ok(())
        };
        let (client, server) = pair(
            Dispatcher::new().on(MessageKind::StreamData, collect),
            Dispatcher::new(),
        );

        use std::io::Write;
        let mut stream = server.stream(7);
        stream.write_all(b"raw bytes").unwrap();

        let chunk = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(chunk.channel, 7);
        assert_eq!(chunk.data, b"raw bytes");
        assert!(client.registry().is_empty());
    }

    /// Connect to a peer that accepts but never reads.
    fn stalled(options: SessionOptions) -> (Session, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let client = Session::connect(address, Dispatcher::new(), options).unwrap();
        let (peer, _) = listener.accept().unwrap();
        (client, peer)
    }

    fn oversized() -> Echo {
        Echo {
            text: "x".repeat(15 * 1024 * 1024),
        }
    }

    #[test]
    fn stalled_peer_cannot_hold_requests_forever() {
        let options =
            SessionOptions::default().with_write_timeout(Some(Duration::from_millis(200)));
        let (client, _peer) = stalled(options);
        let started = Instant::now();

        let blocked = {
            let requestor = client.requestor();
            thread::spawn(move || {
                requestor
                    .request(oversized(), Duration::from_millis(50))
                    .is_err()
            })
        };
        thread::sleep(Duration::from_millis(100));
        let queued = client.requestor().request(Ping, Duration::from_millis(50));

        assert!(blocked.join().unwrap());
        assert!(queued.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(client.is_closed());
        assert!(client.registry().is_empty());
    }

    #[test]
    fn close_does_not_wait_for_a_blocked_writer() {
        let options = SessionOptions::default().with_write_timeout(None);
        let (client, _peer) = stalled(options);

        let blocked = {
            let requestor = client.requestor();
            thread::spawn(move || {
                requestor
                    .request(oversized(), Duration::from_millis(50))
                    .is_err()
            })
        };
        thread::sleep(Duration::from_millis(200));

        let started = Instant::now();
        client.close();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(blocked.join().unwrap());
        assert!(client.registry().is_empty());
        assert!(matches!(
            client.requestor().submit(Ping, Duration::from_secs(1)),
            Err(RequestError::SessionClosed(_))
        ));
    }

    #[test]
    fn random_ids_correlate_too() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let session = Session::start(
                stream,
                Dispatcher::new().on(MessageKind::Ping, pong),
                SessionOptions::default(),
            )
            .unwrap();
            session.wait();
        });

        let client = Session::connect(
            address,
            Dispatcher::new(),
            SessionOptions::default().with_ids(IdStrategy::Random),
        )
        .unwrap();
        let reply = client
            .requestor()
            .request(Ping, Duration::from_secs(2))
            .unwrap();
        assert!(reply.payload::<Pong>().is_some());

        client.close();
        server.join().unwrap();
    }
}
