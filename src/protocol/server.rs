use std::{
    io::{self, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    path::PathBuf,
    sync::Arc,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::shell::{CommandRegistry, FileSystem, LocalFileSystem, Shell};

use super::{
    ThreadPool,
    dispatch::Dispatcher,
    message::{
        Banner, Echo, Execute, Exit, Fault, Message, MessageKind, OutputStream, Pong, ResponseKind,
    },
    session::{Session, SessionOptions},
    transport::TransportError,
};

/// Worker threads used when the caller does not say.
pub const DEFAULT_WORKERS: usize = 8;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("'{0}' is not a directory")]
    NotADirectory(PathBuf),

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Serves a directory through the remote shell.
///
/// Each connection gets its own [`Session`] and its own [`Shell`] (and so its own working
/// directory). A session runs on its own reader thread, so the number of clients is not
/// bounded by the pool; `Execute` requests run on the pool, so a slow command never stalls
/// a session's reader.
pub struct ShellServer {
    address: SocketAddr,
    commands: Arc<CommandRegistry>,
    fs: Arc<dyn FileSystem>,
    options: SessionOptions,
    jobs: Arc<ThreadPool>,
}

impl ShellServer {
    pub fn new(address: SocketAddr, root: PathBuf, workers: usize) -> Result<Self, ServerError> {
        if !root.is_dir() {
            return Err(ServerError::NotADirectory(root));
        }
        if workers == 0 {
            return Err(ServerError::NoWorkers);
        }

        Ok(Self {
            address,
            commands: Arc::new(CommandRegistry::builtin()),
            fs: Arc::new(LocalFileSystem::new(root)),
            options: SessionOptions::default(),
            jobs: Arc::new(ThreadPool::new("execute", workers)),
        })
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn listen(self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.address)?;
        self.serve(listener)
    }

    /// Accept connections on an already bound listener until it fails.
    pub fn serve(self, listener: TcpListener) -> Result<(), ServerError> {
        info!("listening at {}", listener.local_addr()?);

        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let shell = Shell::new(Arc::clone(&self.commands), Arc::clone(&self.fs));
                    let jobs = Arc::clone(&self.jobs);
                    if let Err(e) = handle_connection(stream, shell, jobs, self.options.clone()) {
                        warn!("failed to handle connection: {e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

/// Start the session for one accepted connection and greet the client.
fn handle_connection(
    stream: TcpStream,
    shell: Shell,
    jobs: Arc<ThreadPool>,
    options: SessionOptions,
) -> Result<Session, TransportError> {
    stream.set_nodelay(true)?;
    let shell = Arc::new(shell);

    let dispatcher = Dispatcher::new()
        .on(
            MessageKind::Ping,
            |session: &Session, message: Message| -> Result<(), TransportError> {
                session.reply(&message, ResponseKind::Whole, Pong)
            },
        )
        .on(
            MessageKind::Echo,
            |session: &Session, message: Message| -> Result<(), TransportError> {
                let text = message
                    .payload::<Echo>()
                    .map(|echo| echo.text.clone())
                    .unwrap_or_default();
                session.reply(&message, ResponseKind::Whole, Echo { text })
            },
        )
        .on(
            MessageKind::Execute,
            move |session: &Session, message: Message| -> Result<(), TransportError> {
                let Some(Execute { line }) = message.payload::<Execute>().cloned() else {
                    let reason = "malformed execute request".to_string();
                    return session.reply(&message, ResponseKind::Whole, Fault { reason });
                };

                let shell = Arc::clone(&shell);
                let session = session.clone();
                jobs.execute(move || {
                    if let Err(e) = execute(&shell, &session, &message, &line) {
                        warn!("{}: '{line}' failed: {e}", session.name());
                    }
                });
                Ok(())
            },
        )
        .on(
            MessageKind::Close,
            |session: &Session, _: Message| -> Result<(), TransportError> {
                info!("{}: client disconnected", session.name());
                Ok(())
            },
        )
        .on_close(|session: &Session| debug!("{}: connection finished", session.name()));

    let session = Session::start(stream, dispatcher, options)?;
    info!("{}: connected", session.name());

    let text = format!("rsh {}: type 'help' for commands", env!("CARGO_PKG_VERSION"));
    session.send(Banner { text })?;
    Ok(session)
}

/// Run `line` and stream its output back, ending with the exit code.
///
/// The exit code is the only reply (`Whole`) when the command printed nothing; otherwise it
/// closes the stream of `Partial` output replies (`PartialLast`).
fn execute(
    shell: &Shell,
    session: &Session,
    request: &Message,
    line: &str,
) -> Result<(), TransportError> {
    let mut out = session.reply_stream(request, OutputStream::Stdout);
    let mut err = session.reply_stream(request, OutputStream::Stderr);

    let code = shell.execute(line, &mut out, &mut err);
    out.flush()?;
    err.flush()?;

    let kind = if out.chunks() + err.chunks() == 0 {
        ResponseKind::Whole
    } else {
        ResponseKind::PartialLast
    };
    debug!("{}: '{line}' exited with {code}", session.name());
    session.reply(request, kind, Exit { code })
}
