//! Outstanding operation registry.
//!
//! An established association multiplexes many operations:
//! requests invoked by this node which still await responses,
//! and requests from the peer which are still being performed.
//! This module keeps both under a single lock,
//! correlating responses to their handlers by message ID,
//! enforcing the negotiated bound on invoked operations
//! through cooperative blocking,
//! and deferring the release reply until performed operations drain.
//!
//! Every wait re-checks the terminal cause on wake,
//! so a broken connection unblocks all callers with a failure
//! instead of leaving them hanging.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use dicom_object::InMemDicomObject;
use snafu::{ensure, OptionExt};

use super::{ClosedSnafu, DuplicateMessageIdSnafu, Error, UnmatchedResponseSnafu};

/// Continuation for the responses to one invoked operation.
///
/// Registered under the request's message ID before the request
/// is put on the wire, and dropped once a terminal response arrives.
pub trait ResponseHandler: Send {
    /// Called on the association worker for every response
    /// carrying this handler's message ID, in receipt order:
    /// zero or more pending responses followed by one terminal response.
    fn on_response(&mut self, command: &InMemDicomObject, dataset: Option<Vec<u8>>);

    /// Called once if the association terminates
    /// while the operation is still outstanding.
    fn on_close(&mut self, cause: Arc<Error>);
}

/// Callback invoked when the peer cancels an operation
/// which this node is performing.
pub type CancelCallback = Box<dyn FnOnce() + Send>;

struct Inner {
    /// handlers for invoked operations awaiting responses;
    /// a slot is empty while a response for it is being delivered
    invoked: BTreeMap<u16, Option<Box<dyn ResponseHandler>>>,
    /// cancel callbacks for operations being performed by this node
    cancelable: BTreeMap<u16, CancelCallback>,
    /// upper bound on simultaneously invoked operations, 0 for no bound
    max_invoked: u16,
    /// number of peer requests currently being performed
    performing: usize,
    /// the peer asked to release while operations were still performing
    release_deferred: bool,
    /// terminal cause, set exactly once
    closed: Option<Arc<Error>>,
}

/// Message-ID-keyed broker for the operations in flight
/// on one association.
pub struct OperationRegistry {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("OperationRegistry")
            .field("invoked", &inner.invoked.keys().collect::<Vec<_>>())
            .field("cancelable", &inner.cancelable.keys().collect::<Vec<_>>())
            .field("max_invoked", &inner.max_invoked)
            .field("performing", &inner.performing)
            .field("release_deferred", &inner.release_deferred)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl OperationRegistry {
    /// Create a registry bounded to `max_invoked`
    /// simultaneously outstanding requests, where 0 means no bound.
    pub fn new(max_invoked: u16) -> Self {
        OperationRegistry {
            inner: Mutex::new(Inner {
                invoked: BTreeMap::new(),
                cancelable: BTreeMap::new(),
                max_invoked,
                performing: 0,
                release_deferred: false,
                closed: None,
            }),
            cond: Condvar::new(),
        }
    }

    // a poisoned lock means a panic elsewhere, the data is still sound
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Adjust the invoked operation bound
    /// once the asynchronous operations window has been negotiated.
    pub fn set_max_invoked(&self, max_invoked: u16) {
        let mut inner = self.lock();
        inner.max_invoked = max_invoked;
        self.cond.notify_all();
    }

    /// Register the continuation for a new outgoing request.
    ///
    /// Blocks while the number of outstanding requests
    /// has reached the negotiated bound,
    /// resuming when a terminal response removes an entry.
    /// Fails fast with the association's terminal cause if it closes,
    /// and with a precondition error if the message ID
    /// is already in flight.
    pub fn register(
        &self,
        message_id: u16,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        loop {
            if let Some(cause) = &inner.closed {
                return ClosedSnafu {
                    cause: cause.clone(),
                }
                .fail();
            }
            ensure!(
                !inner.invoked.contains_key(&message_id),
                DuplicateMessageIdSnafu { message_id }
            );
            if inner.max_invoked == 0 || inner.invoked.len() < inner.max_invoked as usize {
                break;
            }
            inner = self.wait(inner);
        }
        inner.invoked.insert(message_id, Some(handler));
        Ok(())
    }

    /// Withdraw the handler of a request which never reached the wire.
    pub fn unregister(&self, message_id: u16) {
        let mut inner = self.lock();
        inner.invoked.remove(&message_id);
        self.cond.notify_all();
    }

    /// Deliver one response to the handler registered under `message_id`.
    ///
    /// The callback runs without the registry lock held.
    /// A terminal response removes the entry
    /// and wakes callers blocked on the invoked bound;
    /// a pending response keeps the operation outstanding.
    /// A response for an ID with no registered handler
    /// is reported as a protocol violation.
    pub fn deliver<F>(&self, message_id: u16, terminal: bool, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut dyn ResponseHandler),
    {
        let mut handler = {
            let mut inner = self.lock();
            if let Some(cause) = &inner.closed {
                return ClosedSnafu {
                    cause: cause.clone(),
                }
                .fail();
            }
            inner
                .invoked
                .get_mut(&message_id)
                .and_then(|slot| slot.take())
                .context(UnmatchedResponseSnafu { message_id })?
        };

        f(&mut *handler);

        let mut inner = self.lock();
        if let Some(cause) = inner.closed.clone() {
            // the association closed while the handler was detached
            drop(inner);
            if !terminal {
                handler.on_close(cause);
            }
            return Ok(());
        }
        if terminal {
            inner.invoked.remove(&message_id);
            self.cond.notify_all();
        } else if let Some(slot) = inner.invoked.get_mut(&message_id) {
            *slot = Some(handler);
        }
        Ok(())
    }

    /// Make an operation being performed by this node cancelable.
    pub fn register_cancel(&self, message_id: u16, on_cancel: CancelCallback) {
        let mut inner = self.lock();
        if inner.closed.is_some() {
            return;
        }
        inner.cancelable.insert(message_id, on_cancel);
    }

    /// Dispatch an inbound cancel request to its operation.
    ///
    /// The callback is removed before it runs,
    /// so each operation sees at most one cancel.
    /// Returns whether a cancelable operation with this ID existed.
    pub fn dispatch_cancel(&self, message_id: u16) -> bool {
        let callback = self.lock().cancelable.remove(&message_id);
        match callback {
            Some(f) => {
                f();
                true
            }
            None => false,
        }
    }

    /// Discard the cancel callback of a completed performed operation.
    pub fn unregister_cancel(&self, message_id: u16) {
        self.lock().cancelable.remove(&message_id);
    }

    /// Count one request from the peer entering execution.
    pub fn begin_performing(&self) {
        self.lock().performing += 1;
    }

    /// Count one performed request as complete.
    ///
    /// Returns `true` when this was the last one
    /// and the peer's release request is waiting on the drain,
    /// in which case the caller must now send the release reply.
    pub fn end_performing(&self) -> bool {
        let mut inner = self.lock();
        inner.performing = inner.performing.saturating_sub(1);
        let reply_now = inner.performing == 0 && inner.release_deferred;
        if reply_now {
            inner.release_deferred = false;
        }
        self.cond.notify_all();
        reply_now
    }

    /// Record the peer's release request.
    ///
    /// Returns `true` when no operation is being performed
    /// and the reply may go out immediately;
    /// otherwise the reply is deferred until
    /// [`end_performing`](Self::end_performing) drains the counter.
    pub fn note_release_requested(&self) -> bool {
        let mut inner = self.lock();
        if inner.performing == 0 {
            true
        } else {
            inner.release_deferred = true;
            false
        }
    }

    /// Block until no invoked operation is outstanding.
    ///
    /// Used before an orderly release so that no response is lost.
    /// Fails with the association's terminal cause if it closes first.
    pub fn wait_drained(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        loop {
            if let Some(cause) = &inner.closed {
                return ClosedSnafu {
                    cause: cause.clone(),
                }
                .fail();
            }
            if inner.invoked.is_empty() {
                return Ok(());
            }
            inner = self.wait(inner);
        }
    }

    /// Mark the registry closed with the association's terminal cause.
    ///
    /// Every still-registered handler receives the failure
    /// so that no caller stays blocked, and all waiters wake.
    /// Closing twice keeps the first cause.
    pub fn close(&self, cause: Arc<Error>) {
        let orphans = {
            let mut inner = self.lock();
            if inner.closed.is_some() {
                return;
            }
            inner.closed = Some(cause.clone());
            inner.cancelable.clear();
            self.cond.notify_all();
            std::mem::take(&mut inner.invoked)
        };
        for (_, slot) in orphans {
            if let Some(mut handler) = slot {
                handler.on_close(cause.clone());
            }
        }
    }

    /// The terminal cause, once the registry is closed.
    pub fn closed_cause(&self) -> Option<Arc<Error>> {
        self.lock().closed.clone()
    }

    /// The number of invoked operations currently outstanding.
    pub fn outstanding(&self) -> usize {
        self.lock().invoked.len()
    }

    /// Whether no operation is in flight in either direction.
    ///
    /// Both counters are read under the same lock,
    /// so the answer is a consistent snapshot
    /// suitable for idle timeout arming decisions.
    pub fn is_quiet(&self) -> bool {
        let inner = self.lock();
        inner.invoked.is_empty() && inner.performing == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::association::ReleasedSnafu;

    struct Recorder {
        label: &'static str,
        events: mpsc::Sender<String>,
    }

    impl ResponseHandler for Recorder {
        fn on_response(&mut self, _command: &InMemDicomObject, _dataset: Option<Vec<u8>>) {
            self.events.send(format!("{} response", self.label)).unwrap();
        }

        fn on_close(&mut self, _cause: Arc<Error>) {
            self.events.send(format!("{} closed", self.label)).unwrap();
        }
    }

    fn recorder(label: &'static str, events: &mpsc::Sender<String>) -> Box<dyn ResponseHandler> {
        Box::new(Recorder {
            label,
            events: events.clone(),
        })
    }

    #[test]
    fn register_blocks_at_the_invoked_bound() {
        let registry = Arc::new(OperationRegistry::new(1));
        let (events, log) = mpsc::channel();

        registry.register(1, recorder("first", &events)).unwrap();

        let second = {
            let registry = Arc::clone(&registry);
            let events = events.clone();
            thread::spawn(move || {
                events.send("second registering".to_string()).unwrap();
                registry.register(2, recorder("second", &events)).unwrap();
                events.send("second registered".to_string()).unwrap();
            })
        };

        assert_eq!(log.recv().unwrap(), "second registering");
        // the bound is 1, so the second register call must be parked
        assert!(log.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(registry.outstanding(), 1);

        registry
            .deliver(1, true, |handler| {
                handler.on_response(&InMemDicomObject::new_empty(), None)
            })
            .unwrap();

        assert_eq!(log.recv().unwrap(), "first response");
        assert_eq!(log.recv().unwrap(), "second registered");
        assert_eq!(registry.outstanding(), 1);
        second.join().unwrap();
    }

    #[test]
    fn pending_responses_keep_the_operation_outstanding() {
        let registry = OperationRegistry::new(4);
        let (events, log) = mpsc::channel();
        registry.register(7, recorder("op", &events)).unwrap();

        let respond = |handler: &mut dyn ResponseHandler| {
            handler.on_response(&InMemDicomObject::new_empty(), None)
        };
        registry.deliver(7, false, respond).unwrap();
        registry.deliver(7, false, respond).unwrap();
        assert_eq!(registry.outstanding(), 1);

        registry.deliver(7, true, respond).unwrap();
        assert_eq!(registry.outstanding(), 0);
        assert_eq!(log.try_iter().count(), 3);

        // no handler left for this ID
        let err = registry.deliver(7, true, respond).unwrap_err();
        assert!(matches!(err, Error::UnmatchedResponse { message_id: 7, .. }));
    }

    #[test]
    fn duplicate_message_id_is_rejected() {
        let registry = OperationRegistry::new(0);
        let (events, _log) = mpsc::channel();
        registry.register(5, recorder("a", &events)).unwrap();
        let err = registry.register(5, recorder("b", &events)).unwrap_err();
        assert!(matches!(err, Error::DuplicateMessageId { message_id: 5, .. }));
    }

    #[test]
    fn close_delivers_a_failure_to_every_outstanding_handler() {
        let registry = Arc::new(OperationRegistry::new(1));
        let (events, log) = mpsc::channel();
        registry.register(1, recorder("first", &events)).unwrap();

        let blocked = {
            let registry = Arc::clone(&registry);
            let events = events.clone();
            thread::spawn(move || {
                let outcome = registry.register(2, recorder("second", &events));
                events
                    .send(format!("second outcome ok={}", outcome.is_ok()))
                    .unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        registry.close(Arc::new(ReleasedSnafu.build()));

        let mut seen: Vec<_> = vec![log.recv().unwrap(), log.recv().unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["first closed", "second outcome ok=false"]);
        blocked.join().unwrap();

        // closing again keeps the first cause and does not redeliver
        registry.close(Arc::new(ReleasedSnafu.build()));
        assert!(log.try_recv().is_err());
    }

    #[test]
    fn wait_drained_wakes_on_close() {
        let registry = Arc::new(OperationRegistry::new(0));
        let (events, _log) = mpsc::channel();
        registry.register(3, recorder("op", &events)).unwrap();

        let waiter = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || registry.wait_drained())
        };

        thread::sleep(Duration::from_millis(50));
        registry.close(Arc::new(ReleasedSnafu.build()));
        let outcome = waiter.join().unwrap();
        assert!(matches!(outcome, Err(Error::Closed { .. })));
    }

    #[test]
    fn cancel_is_dispatched_at_most_once() {
        let registry = OperationRegistry::new(0);
        let (events, log) = mpsc::channel();
        let sender = events.clone();
        registry.register_cancel(
            9,
            Box::new(move || sender.send("canceled".to_string()).unwrap()),
        );

        assert!(registry.dispatch_cancel(9));
        assert!(!registry.dispatch_cancel(9));
        assert_eq!(log.recv().unwrap(), "canceled");
        assert!(log.try_recv().is_err());

        // unknown IDs are reported to the caller
        assert!(!registry.dispatch_cancel(10));
    }

    #[test]
    fn release_reply_waits_for_the_performing_drain() {
        let registry = OperationRegistry::new(0);

        registry.begin_performing();
        registry.begin_performing();
        assert!(!registry.note_release_requested());

        assert!(!registry.end_performing());
        // last completion surfaces the deferred release reply exactly once
        assert!(registry.end_performing());
        assert!(!registry.end_performing());

        // with nothing performing the reply may go out immediately
        assert!(registry.note_release_requested());
    }
}
