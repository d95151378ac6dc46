//! Inbound message routing.
//!
//! The session's reader thread hands every decoded message to the [`Dispatcher`]. Replies
//! (messages with a correlation id) go to the [`RequestRegistry`] and nowhere else; anything
//! else goes to the [`Handler`] registered for its [`MessageKind`].
use std::collections::HashMap;

use log::{debug, warn};

use super::{
    message::{Message, MessageKind},
    registry::{RequestRegistry, Transition},
    session::Session,
    transport::TransportError,
};

/// Handles unsolicited messages of one kind.
pub trait Handler: Send + Sync {
    fn handle(&self, session: &Session, message: Message) -> Result<(), TransportError>;
}

impl<F> Handler for F
where
    F: Fn(&Session, Message) -> Result<(), TransportError> + Send + Sync,
{
    fn handle(&self, session: &Session, message: Message) -> Result<(), TransportError> {
        self(session, message)
    }
}

type CloseHook = Box<dyn Fn(&Session) + Send + Sync>;

/// What became of an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// A reply, handed to the registry.
    Reply(Transition),
    /// An unsolicited message, handed to its handler.
    Handled,
    /// No handler was registered for the kind.
    Unhandled(MessageKind),
}

/// Handler table for one session.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<MessageKind, Box<dyn Handler>>,
    close_hooks: Vec<CloseHook>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route unsolicited messages of `kind` to `handler`, replacing any previous one.
    pub fn on<H: Handler + 'static>(mut self, kind: MessageKind, handler: H) -> Self {
        self.handlers.insert(kind, Box::new(handler));
        self
    }

    /// Run `hook` once when the session ends.
    pub fn on_close<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        self.close_hooks.push(Box::new(hook));
        self
    }

    pub fn handles(&self, kind: MessageKind) -> bool {
        self.handlers.contains_key(&kind)
    }

    pub(crate) fn dispatch(
        &self,
        registry: &RequestRegistry,
        session: &Session,
        message: Message,
    ) -> Routed {
        if message.correlation.is_some() {
            return Routed::Reply(registry.deliver(message));
        }

        let kind = message.kind();
        match self.handlers.get(&kind) {
            Some(handler) => {
                let id = message.id;
                if let Err(e) = handler.handle(session, message) {
                    warn!("{}: {kind:?} handler for {id} failed: {e}", session.name());
                }
                Routed::Handled
            }
            None => {
                debug!("{}: no handler for {kind:?}, dropping {}", session.name(), message.id);
                Routed::Unhandled(kind)
            }
        }
    }

    /// A tracked request has been written out; its timeout may start.
    pub(crate) fn on_sent(&self, registry: &RequestRegistry, message: &Message) -> Transition {
        registry.activate(message.id)
    }

    pub(crate) fn closed(&self, session: &Session) {
        for hook in &self.close_hooks {
            hook(session);
        }
    }
}
