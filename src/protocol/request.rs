//! Tracking for one in-flight request.
//!
//! A [`PendingRequest`] is shared between the [`RequestRegistry`](super::RequestRegistry),
//! which drives its lifecycle, and the caller waiting on it. Replies and failures are queued
//! in arrival order; the first terminal item closes the stream and later signals are dropped.
use std::{
    collections::VecDeque,
    sync::{
        Condvar, Mutex,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use thiserror::Error;

use super::{
    message::{MessageId, MessageKind},
    registry::RegistryError,
    response::Response,
    transport::TransportError,
};

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request {id} timed out after {timeout:?}")]
    Timeout { id: MessageId, timeout: Duration },

    #[error("session closed while request {0} was pending")]
    SessionClosed(MessageId),

    #[error("request {0} was cancelled")]
    Cancelled(MessageId),

    #[error("all responses to request {0} already retrieved")]
    IllegalState(MessageId),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Lifecycle of a pending request. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestState {
    /// Registered, not yet on the wire.
    Pending,
    /// Sent; the timeout clock is running.
    Active,
    /// Cancelled by the caller.
    Deactive,
    /// No terminal reply arrived in time, or the session closed.
    TimedOut,
    /// A terminal reply was delivered.
    Resolved,
}

impl RequestState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RequestState::Pending,
            1 => RequestState::Active,
            2 => RequestState::Deactive,
            3 => RequestState::TimedOut,
            _ => RequestState::Resolved,
        }
    }

    fn rank(self) -> u8 {
        match self {
            RequestState::Pending => 0,
            RequestState::Active => 1,
            RequestState::Deactive | RequestState::TimedOut | RequestState::Resolved => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }
}

#[derive(Debug, Default)]
struct Delivery {
    queue: VecDeque<Result<Response, RequestError>>,
    finished: bool,
}

#[derive(Debug)]
pub struct PendingRequest {
    id: MessageId,
    kind: MessageKind,
    timeout: Duration,
    state: AtomicU8,
    delivery: Mutex<Delivery>,
    ready: Condvar,
}

impl PendingRequest {
    pub fn new(id: MessageId, kind: MessageKind, timeout: Duration) -> Self {
        Self {
            id,
            kind,
            timeout,
            state: AtomicU8::new(RequestState::Pending as u8),
            delivery: Mutex::new(Delivery::default()),
            ready: Condvar::new(),
        }
    }

    pub fn id(&self) -> MessageId {
        self.id
    }

    /// Kind of the request message.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `next` if that is a forward transition. Only called under the registry lock.
    pub(crate) fn advance(&self, next: RequestState) -> bool {
        let current = self.state();
        if next.rank() <= current.rank() {
            return false;
        }
        self.state.store(next as u8, Ordering::Release);
        true
    }

    /// True once a terminal response or failure has been queued.
    pub fn is_finished(&self) -> bool {
        self.delivery.lock().unwrap().finished
    }

    /// Queue a response or failure for the waiting caller.
    ///
    /// Returns `false` if the stream had already ended and `item` was dropped.
    pub fn signal(&self, item: Result<Response, RequestError>) -> bool {
        let terminal = match &item {
            Ok(response) => response.is_terminal(),
            Err(_) => true,
        };

        let mut delivery = self.delivery.lock().unwrap();
        if delivery.finished {
            return false;
        }
        delivery.queue.push_back(item);
        delivery.finished = terminal;
        drop(delivery);

        self.ready.notify_all();
        true
    }

    /// Block until the next response or failure.
    pub fn await_response(&self) -> Result<Response, RequestError> {
        let mut delivery = self.delivery.lock().unwrap();
        while delivery.queue.is_empty() && !delivery.finished {
            delivery = self.ready.wait(delivery).unwrap();
        }
        self.take(&mut delivery)
    }

    /// Like [`await_response`](Self::await_response), but gives up after `timeout`.
    ///
    /// `Ok(None)` means nothing arrived in time; the request stays pending.
    pub fn await_response_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<Response>, RequestError> {
        let delivery = self.delivery.lock().unwrap();
        let (mut delivery, _) = self
            .ready
            .wait_timeout_while(delivery, timeout, |d| d.queue.is_empty() && !d.finished)
            .unwrap();

        if delivery.queue.is_empty() && !delivery.finished {
            return Ok(None);
        }
        self.take(&mut delivery).map(Some)
    }

    fn take(&self, delivery: &mut Delivery) -> Result<Response, RequestError> {
        match delivery.queue.pop_front() {
            Some(item) => item,
            None => Err(RequestError::IllegalState(self.id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Instant};

    use super::super::message::{Echo, Message, ResponseKind};
    use super::*;

    fn response(request: &PendingRequest, n: u128, kind: ResponseKind) -> Response {
        Response::from_message(Message::reply(
            MessageId(100 + n),
            request.id(),
            kind,
            Echo {
                text: n.to_string(),
            },
        ))
        .unwrap()
    }

    fn pending() -> PendingRequest {
        PendingRequest::new(MessageId(1), MessageKind::Echo, Duration::from_secs(1))
    }

    #[test]
    fn states_only_move_forward() {
        let request = pending();
        assert_eq!(request.state(), RequestState::Pending);

        assert!(request.advance(RequestState::Active));
        assert!(!request.advance(RequestState::Pending));
        assert!(!request.advance(RequestState::Active));
        assert!(request.advance(RequestState::Resolved));
        assert!(!request.advance(RequestState::TimedOut));
        assert_eq!(request.state(), RequestState::Resolved);
    }

    #[test]
    fn partials_arrive_in_order_then_illegal_state() {
        let request = pending();
        assert!(request.signal(Ok(response(&request, 1, ResponseKind::Partial))));
        assert!(request.signal(Ok(response(&request, 2, ResponseKind::Partial))));
        assert!(!request.is_finished());
        assert!(request.signal(Ok(response(&request, 3, ResponseKind::PartialLast))));
        assert!(request.is_finished());

        for n in 1..=3u128 {
            let got = request.await_response().unwrap();
            assert_eq!(got.message.id, MessageId(100 + n));
        }
        assert!(matches!(
            request.await_response(),
            Err(RequestError::IllegalState(MessageId(1)))
        ));
    }

    #[test]
    fn signals_after_the_end_are_dropped() {
        let request = pending();
        assert!(request.signal(Ok(response(&request, 1, ResponseKind::Whole))));
        assert!(!request.signal(Err(RequestError::Timeout {
            id: request.id(),
            timeout: request.timeout(),
        })));

        assert!(request.await_response().is_ok());
        assert!(matches!(
            request.await_response(),
            Err(RequestError::IllegalState(_))
        ));
    }

    #[test]
    fn bounded_wait_returns_none_when_idle() {
        let request = pending();
        let started = Instant::now();

        assert!(
            request
                .await_response_timeout(Duration::from_millis(30))
                .unwrap()
                .is_none()
        );
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn blocked_caller_wakes_on_signal() {
        let request = Arc::new(pending());
        let waiter = {
            let request = Arc::clone(&request);
            thread::spawn(move || request.await_response())
        };

        thread::sleep(Duration::from_millis(20));
        request.signal(Ok(response(&request, 7, ResponseKind::Whole)));

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got.payload::<Echo>().unwrap().text, "7");
    }
}
