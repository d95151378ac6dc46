//! Client side of the remote shell.
//!
//! [`ShellClient`] wraps a [`Session`] and turns `Execute` requests into something that looks
//! like running a local command: output is copied to the caller's writers as it streams in,
//! and the exit code is returned at the end.
use std::{
    io::{self, Write},
    net::ToSocketAddrs,
    sync::{
        Mutex,
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver},
    },
    time::{Duration, Instant},
};

use log::{debug, info};
use thiserror::Error;

use crate::protocol::{
    Banner, Dispatcher, Execute, Exit, Fault, Message, MessageKind, Output, OutputStream, Ping,
    Pong, RequestError, Requestor, Session, SessionOptions, StreamData, TransportError,
};

/// How often a running command checks for an interrupt.
const INTERRUPT_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Request(#[from] RequestError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to write output: {0}")]
    Io(#[from] io::Error),

    #[error("server fault: {0}")]
    Fault(String),

    #[error("unexpected {0:?} reply")]
    Unexpected(MessageKind),

    #[error("interrupted")]
    Interrupted,
}

pub struct ShellClient {
    session: Session,
    requestor: Requestor,
    banners: Mutex<Receiver<String>>,
}

impl ShellClient {
    /// Connect to a shell server.
    ///
    /// Unsolicited [`StreamData`] is copied to this process's stdout; banners are kept for
    /// [`banner`](Self::banner).
    pub fn connect<A: ToSocketAddrs>(
        address: A,
        options: SessionOptions,
    ) -> Result<Self, ClientError> {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);

        let dispatcher = Dispatcher::new()
            .on(
                MessageKind::Banner,
                move |_: &Session, message: Message| -> Result<(), TransportError> {
                    if let Some(Banner { text }) = message.payload::<Banner>() {
                        let _ = tx.lock().unwrap().send(text.clone());
                    }
                    Ok(())
                },
            )
            .on(
                MessageKind::StreamData,
                |_: &Session, message: Message| -> Result<(), TransportError> {
                    if let Some(StreamData { data, .. }) = message.payload::<StreamData>() {
                        let mut stdout = io::stdout().lock();
                        stdout.write_all(data)?;
                        stdout.flush()?;
                    }
                    Ok(())
                },
            )
            .on(
                MessageKind::Close,
                |session: &Session, _: Message| -> Result<(), TransportError> {
                    info!("{}: server closed the session", session.name());
                    Ok(())
                },
            );

        let session = Session::connect(address, dispatcher, options)?;
        Ok(Self {
            requestor: session.requestor(),
            session,
            banners: Mutex::new(rx),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_closed(&self) -> bool {
        self.session.is_closed()
    }

    /// The next greeting from the server, waiting at most `timeout`.
    pub fn banner(&self, timeout: Duration) -> Option<String> {
        self.banners.lock().unwrap().recv_timeout(timeout).ok()
    }

    /// Run `line` remotely and return its exit code.
    ///
    /// Setting `interrupted` while the command runs cancels the request and returns
    /// [`ClientError::Interrupted`]. The flag is cleared on entry and when it is consumed.
    pub fn execute(
        &self,
        line: &str,
        timeout: Duration,
        out: &mut dyn Write,
        err: &mut dyn Write,
        interrupted: &AtomicBool,
    ) -> Result<i32, ClientError> {
        interrupted.store(false, Ordering::Release);
        let handle = self.requestor.submit(
            Execute {
                line: line.to_string(),
            },
            timeout,
        )?;

        loop {
            if interrupted.swap(false, Ordering::AcqRel) {
                debug!("cancelling {} on interrupt", handle.id());
                handle.cancel();
                return Err(ClientError::Interrupted);
            }

            let Some(response) = handle.await_response_timeout(INTERRUPT_POLL)? else {
                continue;
            };

            if let Some(Output { stream, data }) = response.payload::<Output>() {
                match stream {
                    OutputStream::Stdout => {
                        out.write_all(data)?;
                        out.flush()?;
                    }
                    OutputStream::Stderr => {
                        err.write_all(data)?;
                        err.flush()?;
                    }
                }
            }

            if response.is_terminal() {
                if let Some(Exit { code }) = response.payload::<Exit>() {
                    return Ok(*code);
                }
                if let Some(Fault { reason }) = response.payload::<Fault>() {
                    return Err(ClientError::Fault(reason.clone()));
                }
                return Err(ClientError::Unexpected(response.message.kind()));
            }
        }
    }

    /// Round trip time of one ping.
    pub fn ping(&self, timeout: Duration) -> Result<Duration, ClientError> {
        let started = Instant::now();
        let reply = self.requestor.request(Ping, timeout)?;
        match reply.payload::<Pong>() {
            Some(_) => Ok(started.elapsed()),
            None => Err(ClientError::Unexpected(reply.kind())),
        }
    }

    /// Say goodbye and wait for the session to wind down.
    pub fn close(&self) {
        self.session.close();
        self.session.wait();
    }
}

impl Drop for ShellClient {
    fn drop(&mut self) {
        self.session.close();
    }
}
