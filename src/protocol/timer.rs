//! Shared scheduled-timer facility.
//!
//! A single scheduler thread sleeps until the earliest deadline and hands due callbacks to a
//! [`ThreadPool`], so a slow callback never delays the others. Each scheduled callback has a
//! [`TimerHandle`]; cancelling and firing race on one atomic and exactly one of them wins.
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        Arc, Condvar, Mutex, OnceLock, Weak,
        atomic::{AtomicU8, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, trace};

use super::thread::{Job, ThreadPool};

pub const DEFAULT_TIMER_WORKERS: usize = 2;

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Stale heap entries tolerated beyond the live task count before the heap is rebuilt.
const STALE_DEADLINES: usize = 64;

const SCHEDULED: u8 = 0;
const CANCELLED: u8 = 1;
const FIRED: u8 = 2;

/// Handle to one scheduled callback.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    status: Arc<AtomicU8>,
    seq: u64,
    shared: Weak<Shared>,
}

impl TimerHandle {
    /// Prevent the callback from running. Returns `false` if it already started.
    ///
    /// A successful cancel drops the callback right away rather than at its deadline.
    pub fn cancel(&self) -> bool {
        match self
            .status
            .compare_exchange(SCHEDULED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                self.forget();
                true
            }
            Err(status) => status == CANCELLED,
        }
    }

    fn forget(&self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let task = {
            let mut schedule = shared.schedule.lock().unwrap();
            let task = schedule.tasks.remove(&self.seq);
            let Schedule {
                deadlines, tasks, ..
            } = &mut *schedule;
            if deadlines.len() > 2 * tasks.len() + STALE_DEADLINES {
                deadlines.retain(|Reverse((_, seq))| tasks.contains_key(seq));
            }
            task
        };
        if task.is_some() {
            trace!("timer task {} removed on cancel", self.seq);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.load(Ordering::Acquire) == CANCELLED
    }

    pub fn has_fired(&self) -> bool {
        self.status.load(Ordering::Acquire) == FIRED
    }

    fn fire(&self) -> bool {
        self.status
            .compare_exchange(SCHEDULED, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

struct Task {
    handle: TimerHandle,
    job: Job,
}

#[derive(Default)]
struct Schedule {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    tasks: HashMap<u64, Task>,
    next: u64,
    shutdown: bool,
}

struct Shared {
    schedule: Mutex<Schedule>,
    wakeup: Condvar,
}

/// Stops the scheduler thread once the last [`Timer`] clone goes away.
struct Shutdown(Arc<Shared>);

impl Drop for Shutdown {
    fn drop(&mut self) {
        if let Ok(mut schedule) = self.0.schedule.lock() {
            schedule.shutdown = true;
        }
        self.0.wakeup.notify_all();
    }
}

/// Cloneable handle to a running timer.
#[derive(Clone)]
pub struct Timer {
    shared: Arc<Shared>,
    _shutdown: Arc<Shutdown>,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new(DEFAULT_TIMER_WORKERS)
    }
}

impl Timer {
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            schedule: Mutex::new(Schedule::default()),
            wakeup: Condvar::new(),
        });
        let pool = ThreadPool::new("timer", workers);

        let scheduler = Arc::clone(&shared);
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || run(scheduler, pool))
            .expect("failed to spawn timer thread");

        Self {
            _shutdown: Arc::new(Shutdown(Arc::clone(&shared))),
            shared,
        }
    }

    /// The process-wide timer shared by sessions that are not given one.
    pub fn global() -> Timer {
        static GLOBAL: OnceLock<Timer> = OnceLock::new();
        GLOBAL.get_or_init(Timer::default).clone()
    }

    /// Run `f` on a timer worker after `delay` unless the returned handle is cancelled.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);

        let mut schedule = self.shared.schedule.lock().unwrap();
        let seq = schedule.next;
        schedule.next += 1;
        let handle = TimerHandle {
            status: Arc::new(AtomicU8::new(SCHEDULED)),
            seq,
            shared: Arc::downgrade(&self.shared),
        };
        schedule.deadlines.push(Reverse((deadline, seq)));
        schedule.tasks.insert(
            seq,
            Task {
                handle: handle.clone(),
                job: Box::new(f),
            },
        );
        drop(schedule);

        trace!("timer task {seq} scheduled in {delay:?}");
        self.shared.wakeup.notify_one();
        handle
    }

    /// Number of callbacks waiting for their deadline.
    pub fn queued(&self) -> usize {
        self.shared.schedule.lock().unwrap().tasks.len()
    }
}

fn run(shared: Arc<Shared>, pool: ThreadPool) {
    let mut schedule = match shared.schedule.lock() {
        Ok(schedule) => schedule,
        Err(_) => return,
    };

    loop {
        if schedule.shutdown {
            break;
        }

        let now = Instant::now();
        let wait = match schedule.deadlines.peek() {
            Some(Reverse((deadline, _))) if *deadline <= now => None,
            Some(Reverse((deadline, _))) => Some(*deadline - now),
            None => Some(Duration::MAX),
        };

        match wait {
            None => {
                let Some(Reverse((_, seq))) = schedule.deadlines.pop() else {
                    continue;
                };
                let Some(task) = schedule.tasks.remove(&seq) else {
                    continue;
                };
                if task.handle.is_cancelled() {
                    trace!("timer task {seq} was cancelled");
                    continue;
                }
                pool.execute(move || {
                    if task.handle.fire() {
                        (task.job)();
                    } else {
                        trace!("timer task {seq} cancelled before it ran");
                    }
                });
            }
            Some(wait) if wait == Duration::MAX => {
                schedule = match shared.wakeup.wait(schedule) {
                    Ok(schedule) => schedule,
                    Err(_) => return,
                };
            }
            Some(wait) => {
                schedule = match shared.wakeup.wait_timeout(schedule, wait) {
                    Ok((schedule, _)) => schedule,
                    Err(_) => return,
                };
            }
        }
    }

    let dropped = schedule.tasks.len();
    drop(schedule);
    debug!("timer stopped with {dropped} tasks outstanding");
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let timer = Timer::new(1);
        let (tx, rx) = mpsc::channel();

        for (delay, tag) in [(60, "c"), (20, "a"), (40, "b")] {
            let tx = tx.clone();
            timer.schedule(Duration::from_millis(delay), move || {
                tx.send(tag).unwrap();
            });
        }

        let order: Vec<&str> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn cancelled_callback_never_runs() {
        let timer = Timer::new(1);
        let (tx, rx) = mpsc::channel();

        let handle = timer.schedule(Duration::from_millis(30), move || {
            tx.send(()).unwrap();
        });
        assert!(handle.cancel());
        assert!(handle.cancel());
        assert!(handle.is_cancelled());

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
        assert!(!handle.has_fired());
    }

    #[test]
    fn cancel_fails_once_fired() {
        let timer = Timer::new(1);
        let (tx, rx) = mpsc::channel();

        let handle = timer.schedule(Duration::ZERO, move || {
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(2)).unwrap();

        assert!(handle.has_fired());
        assert!(!handle.cancel());
    }

    #[test]
    fn due_callback_queued_behind_busy_worker_can_still_be_cancelled() {
        let timer = Timer::new(1);
        let (release, blocked) = mpsc::channel::<()>();
        let (tx, rx) = mpsc::channel();

        timer.schedule(Duration::ZERO, move || {
            blocked.recv().unwrap();
        });
        let handle = timer.schedule(Duration::from_millis(5), move || {
            tx.send(()).unwrap();
        });

        thread::sleep(Duration::from_millis(50));
        assert!(handle.cancel());
        release.send(()).unwrap();

        assert!(rx.recv_timeout(Duration::from_millis(150)).is_err());
    }

    #[test]
    fn cancel_releases_the_callback_immediately() {
        let timer = Timer::new(1);
        let captured = Arc::new(());

        let held = Arc::clone(&captured);
        let handle = timer.schedule(Duration::MAX, move || drop(held));
        assert_eq!(timer.queued(), 1);
        assert_eq!(Arc::strong_count(&captured), 2);

        assert!(handle.cancel());
        assert_eq!(timer.queued(), 0);
        assert_eq!(Arc::strong_count(&captured), 1);
    }

    #[test]
    fn cancelled_deadlines_do_not_pile_up() {
        let timer = Timer::new(1);
        for _ in 0..1_000 {
            timer.schedule(Duration::from_secs(3600), || {}).cancel();
        }

        let schedule = timer.shared.schedule.lock().unwrap();
        assert!(schedule.tasks.is_empty());
        assert!(schedule.deadlines.len() <= STALE_DEADLINES + 1);
    }
}
