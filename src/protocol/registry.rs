//! In-flight request tracking.
//!
//! The [`RequestRegistry`] maps each outstanding [`MessageId`] to its [`PendingRequest`] and
//! drives the request lifecycle:
//!
//! ```text
//! register ──► PENDING ──activate──► ACTIVE ──┬── deliver(terminal) ──► RESOLVED
//!                 │                           ├── deactivate ─────────► DEACTIVE
//!                 └── deliver/deactivate      └── timeout / close ────► TIMEDOUT
//! ```
//!
//! Every transition happens under one mutex, held only for the map operation. Whichever of
//! delivery, cancellation, or timeout removes the entry first wins; the others find nothing
//! and become no-ops. Those expected races are reported as [`Transition::Ignored`] rather
//! than errors.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use log::{debug, trace, warn};
use thiserror::Error;

use super::{
    message::{Message, MessageId},
    request::{PendingRequest, RequestError, RequestState},
    response::Response,
    timer::{Timer, TimerHandle},
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("request {0} is already pending")]
    DuplicateRequest(MessageId),

    #[error("session closed, request {0} refused")]
    Closed(MessageId),
}

/// Expected outcomes of racing transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Race {
    /// The id is not (or no longer) in the registry.
    NotRegistered,
    /// A timeout fired after the request was resolved, cancelled, or re-armed.
    TimeoutAborted,
    /// The request already left the state the transition starts from.
    NotPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored(Race),
}

impl Transition {
    pub fn is_applied(self) -> bool {
        self == Transition::Applied
    }
}

struct Entry {
    request: Arc<PendingRequest>,
    timer: Option<TimerHandle>,
    arming: u64,
}

impl Entry {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            if !timer.cancel() {
                debug!(
                    "timeout for {} already firing, leaving it to abort",
                    self.request.id()
                );
            }
        }
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<MessageId, Entry>,
    closed: bool,
}

struct Shared {
    entries: Mutex<Entries>,
    timer: Timer,
}

/// Registry of pending requests for one session.
#[derive(Clone)]
pub struct RequestRegistry {
    shared: Arc<Shared>,
}

impl Default for RequestRegistry {
    fn default() -> Self {
        Self::new(Timer::global())
    }
}

impl RequestRegistry {
    pub fn new(timer: Timer) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(Entries::default()),
                timer,
            }),
        }
    }

    /// Track `request` as PENDING. Must complete before the request is handed to the transport.
    pub fn register(&self, request: Arc<PendingRequest>) -> Result<(), RegistryError> {
        let id = request.id();
        let mut entries = self.shared.entries.lock().unwrap();
        if entries.closed {
            return Err(RegistryError::Closed(id));
        }
        if entries.map.contains_key(&id) {
            return Err(RegistryError::DuplicateRequest(id));
        }
        entries.map.insert(
            id,
            Entry {
                request,
                timer: None,
                arming: 0,
            },
        );
        trace!("registered request {id}");
        Ok(())
    }

    /// PENDING → ACTIVE once the request is on the wire; starts the timeout clock.
    pub fn activate(&self, id: MessageId) -> Transition {
        let mut entries = self.shared.entries.lock().unwrap();
        let Some(entry) = entries.map.get_mut(&id) else {
            return ignored("activate", id, Race::NotRegistered);
        };
        if !entry.request.advance(RequestState::Active) {
            return ignored("activate", id, Race::NotPending);
        }
        self.arm(entry);
        trace!("activated request {id}");
        Transition::Applied
    }

    /// Cancel a request on behalf of its caller, who receives [`RequestError::Cancelled`].
    pub fn deactivate(&self, id: MessageId) -> Transition {
        let Some(request) = self.remove(id, RequestState::Deactive) else {
            return ignored("deactivate", id, Race::NotRegistered);
        };
        request.signal(Err(RequestError::Cancelled(id)));
        debug!("deactivated request {id}");
        Transition::Applied
    }

    /// Remove a request without notifying anyone, returning it if it was still tracked.
    pub fn deregister(&self, id: MessageId) -> Option<Arc<PendingRequest>> {
        self.remove(id, RequestState::Deactive)
    }

    /// Route a correlated reply to its pending request.
    ///
    /// A terminal reply resolves and removes the request; a partial one re-arms its timeout.
    pub fn deliver(&self, message: Message) -> Transition {
        let Some(response) = Response::from_message(message) else {
            warn!("uncorrelated message handed to the registry");
            return Transition::Ignored(Race::NotRegistered);
        };
        let id = response.request;

        let request = if response.is_terminal() {
            match self.remove(id, RequestState::Resolved) {
                Some(request) => request,
                None => return ignored("deliver", id, Race::NotRegistered),
            }
        } else {
            let mut entries = self.shared.entries.lock().unwrap();
            let Some(entry) = entries.map.get_mut(&id) else {
                return ignored("deliver", id, Race::NotRegistered);
            };
            if entry.request.state() == RequestState::Active {
                entry.disarm();
                self.arm(entry);
            }
            Arc::clone(&entry.request)
        };

        trace!("delivering {:?} response to {id}", response.kind);
        request.signal(Ok(response));
        Transition::Applied
    }

    /// Fail every pending request with [`RequestError::SessionClosed`] and refuse new ones.
    pub fn close(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut entries = self.shared.entries.lock().unwrap();
            entries.closed = true;
            entries.map.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for mut entry in drained {
            entry.disarm();
            entry.request.advance(RequestState::TimedOut);
            entry
                .request
                .signal(Err(RequestError::SessionClosed(entry.request.id())));
        }
        if count > 0 {
            debug!("closed registry with {count} pending requests");
        }
        count
    }

    pub fn contains(&self, id: MessageId) -> bool {
        self.shared.entries.lock().unwrap().map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.shared.entries.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.entries.lock().unwrap().closed
    }

    fn remove(&self, id: MessageId, state: RequestState) -> Option<Arc<PendingRequest>> {
        let mut entries = self.shared.entries.lock().unwrap();
        let mut entry = entries.map.remove(&id)?;
        entry.disarm();
        entry.request.advance(state);
        Some(entry.request)
    }

    /// Schedule a fresh timeout for `entry`. Called with the lock held.
    fn arm(&self, entry: &mut Entry) {
        entry.arming += 1;
        let id = entry.request.id();
        let arming = entry.arming;
        let registry = Arc::downgrade(&self.shared);

        entry.timer = Some(
            self.shared
                .timer
                .schedule(entry.request.timeout(), move || expire(registry, id, arming)),
        );
    }

    /// Timeout callback body: time the request out unless it already lost the race.
    fn expire(&self, id: MessageId, arming: u64) -> Transition {
        let request = {
            let mut entries = self.shared.entries.lock().unwrap();
            let Some(entry) = entries.map.get(&id) else {
                return ignored("timeout", id, Race::NotRegistered);
            };
            if entry.arming != arming
                || entry.request.state() != RequestState::Active
                || entry.request.is_finished()
            {
                return ignored("timeout", id, Race::TimeoutAborted);
            }
            let Some(entry) = entries.map.remove(&id) else {
                return ignored("timeout", id, Race::NotRegistered);
            };
            entry.request.advance(RequestState::TimedOut);
            entry.request
        };

        debug!("request {id} timed out after {:?}", request.timeout());
        request.signal(Err(RequestError::Timeout {
            id,
            timeout: request.timeout(),
        }));
        Transition::Applied
    }
}

fn expire(registry: Weak<Shared>, id: MessageId, arming: u64) {
    if let Some(shared) = registry.upgrade() {
        RequestRegistry { shared }.expire(id, arming);
    }
}

fn ignored(operation: &str, id: MessageId, race: Race) -> Transition {
    debug!("{operation} for {id} ignored: {race:?}");
    Transition::Ignored(race)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::mpsc,
        thread,
        time::{Duration, Instant},
    };

    use super::super::message::{Echo, MessageKind, Pong, ResponseKind};
    use super::*;

    fn pending(id: u128, timeout: Duration) -> Arc<PendingRequest> {
        Arc::new(PendingRequest::new(
            MessageId(id),
            MessageKind::Ping,
            timeout,
        ))
    }

    fn reply(id: u128, kind: ResponseKind) -> Message {
        Message::reply(MessageId(1000 + id), MessageId(id), kind, Pong)
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let registry = RequestRegistry::new(Timer::new(1));
        registry
            .register(pending(1, Duration::from_secs(1)))
            .unwrap();

        assert!(matches!(
            registry.register(pending(1, Duration::from_secs(1))),
            Err(RegistryError::DuplicateRequest(MessageId(1)))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn activating_unknown_id_is_benign() {
        let registry = RequestRegistry::new(Timer::new(1));

        assert_eq!(
            registry.activate(MessageId(42)),
            Transition::Ignored(Race::NotRegistered)
        );
    }

    #[test]
    fn activate_twice_does_not_rearm() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(1, Duration::from_secs(5));
        registry.register(Arc::clone(&request)).unwrap();

        assert_eq!(registry.activate(MessageId(1)), Transition::Applied);
        assert_eq!(
            registry.activate(MessageId(1)),
            Transition::Ignored(Race::NotPending)
        );
        assert_eq!(request.state(), RequestState::Active);
    }

    #[test]
    fn deactivate_twice_is_a_no_op() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(1, Duration::from_millis(50));
        registry.register(Arc::clone(&request)).unwrap();
        registry.activate(MessageId(1));

        assert_eq!(registry.deactivate(MessageId(1)), Transition::Applied);
        assert_eq!(
            registry.deactivate(MessageId(1)),
            Transition::Ignored(Race::NotRegistered)
        );
        assert_eq!(request.state(), RequestState::Deactive);

        // The cancelled timer must not add a timeout after the cancellation.
        thread::sleep(Duration::from_millis(100));
        assert!(matches!(
            request.await_response(),
            Err(RequestError::Cancelled(MessageId(1)))
        ));
        assert!(matches!(
            request.await_response(),
            Err(RequestError::IllegalState(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unanswered_request_times_out() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(2, Duration::from_millis(50));
        registry.register(Arc::clone(&request)).unwrap();

        let started = Instant::now();
        registry.activate(MessageId(2));

        assert!(matches!(
            request.await_response(),
            Err(RequestError::Timeout { id: MessageId(2), .. })
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(request.state(), RequestState::TimedOut);
        assert!(!registry.contains(MessageId(2)));
    }

    #[test]
    fn timeout_clock_starts_on_activation() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(3, Duration::from_millis(20));
        registry.register(Arc::clone(&request)).unwrap();

        thread::sleep(Duration::from_millis(60));
        assert!(registry.contains(MessageId(3)));
        assert!(
            request
                .await_response_timeout(Duration::from_millis(1))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn reply_before_activation_resolves() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(4, Duration::from_millis(20));
        registry.register(Arc::clone(&request)).unwrap();

        assert_eq!(
            registry.deliver(reply(4, ResponseKind::Whole)),
            Transition::Applied
        );
        assert_eq!(
            registry.activate(MessageId(4)),
            Transition::Ignored(Race::NotRegistered)
        );

        thread::sleep(Duration::from_millis(50));
        assert!(request.await_response().unwrap().is_terminal());
        assert_eq!(request.state(), RequestState::Resolved);
    }

    #[test]
    fn partial_replies_rearm_the_timeout() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(5, Duration::from_millis(100));
        registry.register(Arc::clone(&request)).unwrap();
        registry.activate(MessageId(5));

        thread::sleep(Duration::from_millis(60));
        registry.deliver(reply(5, ResponseKind::Partial));
        thread::sleep(Duration::from_millis(70));

        // Past the original deadline, but the partial pushed it back.
        assert!(registry.contains(MessageId(5)));
        assert_eq!(request.await_response().unwrap().kind, ResponseKind::Partial);
        assert!(matches!(
            request.await_response(),
            Err(RequestError::Timeout { .. })
        ));
    }

    #[test]
    fn delivery_wins_over_a_timer_already_due() {
        let timer = Timer::new(1);
        let registry = RequestRegistry::new(timer.clone());
        let request = pending(6, Duration::from_millis(5));
        registry.register(Arc::clone(&request)).unwrap();

        // Occupy the only timer worker so the due timeout queues behind it.
        let (release, blocked) = mpsc::channel::<()>();
        timer.schedule(Duration::ZERO, move || {
            blocked.recv().unwrap();
        });
        registry.activate(MessageId(6));
        thread::sleep(Duration::from_millis(40));

        assert_eq!(
            registry.deliver(reply(6, ResponseKind::Whole)),
            Transition::Applied
        );
        release.send(()).unwrap();
        thread::sleep(Duration::from_millis(40));

        assert!(request.await_response().is_ok());
        assert!(matches!(
            request.await_response(),
            Err(RequestError::IllegalState(_))
        ));
        assert_eq!(request.state(), RequestState::Resolved);
    }

    #[test]
    fn stale_timeout_is_aborted() {
        let registry = RequestRegistry::new(Timer::new(1));
        let request = pending(7, Duration::from_secs(5));
        registry.register(Arc::clone(&request)).unwrap();
        registry.activate(MessageId(7));
        registry.deliver(reply(7, ResponseKind::Partial));

        // Arming 1 was replaced by the partial reply.
        assert_eq!(
            registry.expire(MessageId(7), 1),
            Transition::Ignored(Race::TimeoutAborted)
        );
        assert_eq!(registry.expire(MessageId(7), 2), Transition::Applied);
        assert_eq!(
            registry.expire(MessageId(7), 2),
            Transition::Ignored(Race::NotRegistered)
        );
    }

    #[test]
    fn exactly_one_outcome_under_contention() {
        let registry = RequestRegistry::new(Timer::new(4));
        let requests: Vec<_> = (1..=200)
            .map(|id| {
                let request = pending(id, Duration::from_millis(2));
                registry.register(Arc::clone(&request)).unwrap();
                registry.activate(MessageId(id));
                request
            })
            .collect();

        let deliverer = {
            let registry = registry.clone();
            thread::spawn(move || {
                for id in 1..=200 {
                    registry.deliver(reply(id, ResponseKind::Whole));
                }
            })
        };
        deliverer.join().unwrap();

        for request in requests {
            match request.await_response() {
                Ok(response) => assert!(response.is_terminal()),
                Err(RequestError::Timeout { .. }) => {}
                Err(e) => panic!("unexpected outcome {e}"),
            }
            assert!(matches!(
                request.await_response(),
                Err(RequestError::IllegalState(_))
            ));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn close_fails_everything_pending() {
        let registry = RequestRegistry::new(Timer::new(1));
        let first = pending(8, Duration::from_secs(5));
        let second = pending(9, Duration::from_secs(5));
        registry.register(Arc::clone(&first)).unwrap();
        registry.register(Arc::clone(&second)).unwrap();
        registry.activate(MessageId(8));

        assert_eq!(registry.close(), 2);
        for request in [first, second] {
            assert!(matches!(
                request.await_response(),
                Err(RequestError::SessionClosed(_))
            ));
            assert_eq!(request.state(), RequestState::TimedOut);
        }
        assert!(matches!(
            registry.register(pending(10, Duration::from_secs(1))),
            Err(RegistryError::Closed(MessageId(10)))
        ));
    }

    #[test]
    fn uncorrelated_delivery_is_ignored() {
        let registry = RequestRegistry::new(Timer::new(1));

        assert_eq!(
            registry.deliver(Message::new(
                MessageId(1),
                Echo {
                    text: String::new()
                }
            )),
            Transition::Ignored(Race::NotRegistered)
        );
    }
}
