//! Worker and timer plumbing backing the association runtime.
//!
//! An [`Executor`] decides where association worker loops run,
//! defaulting to dedicated OS threads.
//! A [`Scheduler`] runs callbacks at deadlines on a single timer thread,
//! so that an association can arm its timeouts
//! without spawning a thread per timer.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::sync::atomic::{self, AtomicBool};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// A place to run association worker loops.
///
/// The provided [`ThreadExecutor`] spawns a named OS thread per worker.
/// An alternative implementation may instead hand the work
/// to a shared thread pool.
pub trait Executor: fmt::Debug + Send + Sync {
    /// Run the given work on a dedicated worker.
    ///
    /// The work owns its resources and runs until the association
    /// it serves is taken down,
    /// so the executor must not block the caller on its completion.
    fn spawn(&self, name: &str, work: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()>;
}

/// The default executor,
/// which runs each worker on its own named OS thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutor;

impl Executor for ThreadExecutor {
    fn spawn(&self, name: &str, work: Box<dyn FnOnce() + Send + 'static>) -> io::Result<()> {
        thread::Builder::new().name(name.to_string()).spawn(work)?;
        Ok(())
    }
}

/// A handle to a callback scheduled on a [`Scheduler`].
///
/// Dropping the handle does not cancel the callback.
#[derive(Debug)]
pub struct ScheduledTask {
    canceled: Arc<AtomicBool>,
}

impl ScheduledTask {
    /// Cancel the callback if it has not started running yet.
    ///
    /// Cancellation is idempotent and
    /// does not interrupt a callback already in progress.
    pub fn cancel(&self) {
        self.canceled.store(true, atomic::Ordering::Release);
    }
}

struct Entry {
    at: Instant,
    id: u64,
    canceled: Arc<AtomicBool>,
    work: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // reversed so that the earliest deadline surfaces first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

#[derive(Default)]
struct SchedulerState {
    queue: BinaryHeap<Entry>,
    next_id: u64,
    shutdown: bool,
}

struct SchedulerInner {
    state: Mutex<SchedulerState>,
    cond: Condvar,
}

impl SchedulerInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A deadline timer running callbacks on a single background thread.
///
/// Callbacks run one at a time in deadline order.
/// Dropping the scheduler discards any callbacks still pending.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler").finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Start a scheduler and its timer thread.
    pub fn new() -> io::Result<Self> {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(SchedulerState::default()),
            cond: Condvar::new(),
        });

        let worker = Arc::clone(&inner);
        thread::Builder::new()
            .name("dicom-net-timer".to_string())
            .spawn(move || run_timer(&worker))?;

        Ok(Scheduler { inner })
    }

    /// Schedule the given work to run once the delay has elapsed.
    pub fn schedule(
        &self,
        delay: Duration,
        work: Box<dyn FnOnce() + Send + 'static>,
    ) -> ScheduledTask {
        let canceled = Arc::new(AtomicBool::new(false));
        let mut state = self.inner.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.queue.push(Entry {
            at: Instant::now() + delay,
            id,
            canceled: Arc::clone(&canceled),
            work,
        });
        drop(state);
        // the timer thread may be sleeping until a later deadline
        self.inner.cond.notify_one();

        ScheduledTask { canceled }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.inner.lock().shutdown = true;
        self.inner.cond.notify_all();
    }
}

fn run_timer(inner: &SchedulerInner) {
    let mut state = inner.lock();
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let wait = match state.queue.peek() {
            Some(entry) if entry.at <= now => {
                let entry = state.queue.pop().unwrap();
                if entry.canceled.load(atomic::Ordering::Acquire) {
                    continue;
                }
                drop(state);
                (entry.work)();
                state = inner.lock();
                continue;
            }
            Some(entry) => Some(entry.at - now),
            None => None,
        };
        state = match wait {
            Some(wait) => inner
                .cond
                .wait_timeout(state, wait)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0),
            None => inner
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn executor_runs_work_on_a_named_thread() {
        let (tx, rx) = mpsc::channel();
        ThreadExecutor
            .spawn(
                "test-worker",
                Box::new(move || {
                    let name = thread::current().name().map(|n| n.to_string());
                    tx.send(name).unwrap();
                }),
            )
            .unwrap();

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-worker"));
    }

    #[test]
    fn scheduled_work_fires_after_its_delay() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        let _task = scheduler.schedule(
            Duration::from_millis(20),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn canceled_work_does_not_fire() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let task = scheduler.schedule(
            Duration::from_millis(50),
            Box::new(move || {
                tx.send(()).unwrap();
            }),
        );
        task.cancel();

        assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    }

    #[test]
    fn work_fires_in_deadline_order() {
        let scheduler = Scheduler::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        let _later = scheduler.schedule(Duration::from_millis(60), Box::new(move || {
            tx.send("later").unwrap();
        }));
        let _sooner = scheduler.schedule(Duration::from_millis(10), Box::new(move || {
            tx2.send("sooner").unwrap();
        }));

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "sooner");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "later");
    }
}
