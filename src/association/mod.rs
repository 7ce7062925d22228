//! Association runtime.
//!
//! An [`Association`] multiplexes DIMSE operations over one
//! established upper layer connection.
//! A dedicated reader worker owns the read half of the transport
//! and is the only place where inbound PDUs are interpreted;
//! outbound traffic goes through a writer lock,
//! so that a full message (command set plus data set)
//! is never interleaved with another.
//! The [state machine](machine) validates every event on both paths,
//! and the [operation registry](registry) correlates responses
//! to the requests which this node invoked.
//!
//! Lock order is writer, then machine, then registry.
//! Handler registration happens before the writer lock is taken,
//! so a thread parked on the asynchronous operations bound
//! never starves the sender of the response which would free it.
//!
//! Establishing an association is the job of
//! [`ClientAssociationOptions`] on the requestor side and
//! [`ServerAssociationOptions`] on the acceptor side.

pub mod client;
pub mod machine;
pub mod negotiate;
pub mod pdata;
pub mod registry;
pub mod server;
pub(crate) mod uid;

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dicom_object::InMemDicomObject;
use snafu::{ensure, Backtrace, IntoError, OptionExt, ResultExt, Snafu};
use tracing::{debug, warn};

use crate::dimse::{self, CommandField, StatusClass};
use crate::pdu::{
    read_pdu, write_pdu, AbortSource, AssociateRj, PDataValue, Pdu, PdvKind, ProviderAbortReason,
    MAXIMUM_PDU_SIZE, MINIMUM_MAX_PDU,
};
use crate::runtime::{Executor, ScheduledTask, Scheduler};
use crate::transport::Transport;

use machine::{Action, Event, Machine, State, Transition};

pub use client::ClientAssociationOptions;
pub use machine::Role;
pub use negotiate::{
    choose_supported, choose_supported_with_repo, is_supported, is_supported_with_repo, Capability,
    NegotiatedContext,
};
pub use pdata::{PDataReader, PDataWriter};
pub use registry::{CancelCallback, OperationRegistry, ResponseHandler};
pub use server::{AcceptAny, AcceptCalledAeTitle, AccessPolicy, ServerAssociationOptions};

/// The scope of an expired association timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutScope {
    /// the peer did not answer an A-RELEASE-RQ in time
    Release,
    /// the association stayed established with nothing in flight
    Idle,
    /// an invoked operation received no response in time
    Response,
}

impl fmt::Display for TimeoutScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TimeoutScope::Release => "release",
            TimeoutScope::Idle => "idle",
            TimeoutScope::Response => "response",
        })
    }
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// at least one presentation context or capability is required
    MissingAbstractSyntax { backtrace: Backtrace },

    /// could not connect to the peer
    Connect {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not configure the connection
    ConfigureSocket {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// could not start the association worker
    SpawnWorker {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to send the association negotiation message
    SendRequest {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to receive the association negotiation message
    ReceiveResponse {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to encode an outbound message
    Send {
        #[snafu(backtrace)]
        source: crate::pdu::writer::Error,
    },

    /// failed to put an outbound message on the wire
    WireSend {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    /// failed to receive a message
    Receive {
        #[snafu(backtrace)]
        source: crate::pdu::reader::Error,
    },

    /// failed to read a message data set
    ReadDataSet {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("unexpected {}", pdu.short_description()))]
    UnexpectedPdu { pdu: Box<Pdu> },

    #[snafu(display("unknown PDU type {:#04X}", pdu_type))]
    UnknownPdu { pdu_type: u8 },

    #[snafu(display(
        "protocol version mismatch: expected {}, got {}",
        expected,
        got
    ))]
    ProtocolVersionMismatch {
        expected: u16,
        got: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("association rejected by the peer: {}", rejection.source))]
    Rejected {
        rejection: AssociateRj,
        backtrace: Backtrace,
    },

    /// the peer accepted no presentation context
    NoAcceptedPresentationContexts { backtrace: Backtrace },

    #[snafu(display("association aborted by the peer ({:?})", origin))]
    Aborted { origin: AbortSource },

    /// association aborted locally
    LocallyAborted,

    /// association released
    Released,

    /// connection closed by the peer
    ConnectionClosed,

    #[snafu(display("association {} timeout expired", scope))]
    TimedOut { scope: TimeoutScope },

    #[snafu(display("association terminated: {}", cause))]
    Closed { cause: Arc<Error> },

    #[snafu(display("protocol violation by the peer: {}", message))]
    ProtocolViolation {
        message: &'static str,
        backtrace: Backtrace,
    },

    #[snafu(display("message ID {} is already in flight", message_id))]
    DuplicateMessageId {
        message_id: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("response for unknown message ID {}", message_id))]
    UnmatchedResponse {
        message_id: u16,
        backtrace: Backtrace,
    },

    #[snafu(display("no presentation context with ID {}", context_id))]
    NoSuchContext {
        context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display("presentation context {} was not accepted", context_id))]
    ContextNotAccepted {
        context_id: u8,
        backtrace: Backtrace,
    },

    #[snafu(display(
        "negotiated roles for {} do not admit this operation",
        abstract_syntax
    ))]
    RoleViolation {
        abstract_syntax: String,
        backtrace: Backtrace,
    },

    #[snafu(display("`{}` is not admitted in the current association state", operation))]
    IllegalState {
        operation: &'static str,
        backtrace: Backtrace,
    },

    /// invalid command set
    Command {
        #[snafu(backtrace)]
        source: crate::dimse::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The timeouts which one association observes.
///
/// Every scope is optional; an unset scope never expires.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TimeoutOptions {
    /// bounds the wait for the association acknowledgement (requestor)
    pub request: Option<Duration>,
    /// bounds the wait for the association request (acceptor)
    pub accept: Option<Duration>,
    /// bounds the wait for the release reply
    pub release: Option<Duration>,
    /// bounds the time the association may stay quiet
    pub idle: Option<Duration>,
    /// bounds the wait for the next response to an invoked operation
    pub response: Option<Duration>,
    /// grace period for an abort PDU to leave before the socket closes
    pub abort_delay: Option<Duration>,
}

impl TimeoutOptions {
    /// Whether any scope needs the timer thread after establishment.
    fn needs_scheduler(&self) -> bool {
        self.release.is_some() || self.idle.is_some() || self.response.is_some()
    }
}

/// The dataset of a message being received,
/// streamed to a service handler fragment by fragment.
pub type DatasetReader<'a> = PDataReader<&'a mut (dyn Read + Send)>;

/// Continuation for inbound operation requests.
///
/// Runs on the association worker:
/// while a handler executes, no further PDU is interpreted,
/// so long-running work should be moved elsewhere
/// and answer later through [`Association::send_response`].
/// A handler must not block on [`Association::send_request`]
/// from this context,
/// as the response freeing the operations bound
/// could never be read.
pub trait DimseHandler: Send + Sync {
    /// React to one operation request from the peer.
    ///
    /// `dataset` streams the accompanying data set, when one was
    /// announced; fragments left unread are skipped afterwards.
    /// Returning `false` makes the association answer with
    /// an "unrecognized operation" failure response on the
    /// handler's behalf.
    fn on_request(
        &self,
        association: &Association,
        context: &NegotiatedContext,
        command: InMemDicomObject,
        dataset: Option<&mut DatasetReader<'_>>,
    ) -> bool;
}

#[derive(Default)]
struct Lifecycle {
    /// terminal teardown has begun
    closing: bool,
    /// terminal teardown has finished, the cause is recorded
    done: bool,
}

#[derive(Default)]
struct Timers {
    idle: Option<ScheduledTask>,
    release: Option<ScheduledTask>,
    response: BTreeMap<u16, ScheduledTask>,
}

struct Inner {
    role: Role,
    peer_ae_title: String,
    contexts: Vec<NegotiatedContext>,
    peer_max_pdu_length: u32,
    local_max_pdu_length: u32,
    strict: bool,
    machine: Mutex<Machine>,
    writer: Mutex<Box<dyn Write + Send>>,
    shutdown: Box<dyn Fn() + Send + Sync>,
    registry: OperationRegistry,
    handler: Option<Arc<dyn DimseHandler>>,
    scheduler: Option<Scheduler>,
    timeouts: TimeoutOptions,
    timers: Mutex<Timers>,
    lifecycle: Mutex<Lifecycle>,
    lifecycle_cond: Condvar,
    next_message_id: AtomicU16,
}

impl Inner {
    fn lock_machine(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_writer(&self) -> MutexGuard<'_, Box<dyn Write + Send>> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_timers(&self) -> MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, event: Event) -> Transition {
        self.lock_machine().apply(event)
    }

    fn state(&self) -> State {
        self.lock_machine().state()
    }

    fn is_terminal(&self) -> bool {
        self.lock_lifecycle().closing
    }

    /// The bound passed to the PDU reader,
    /// kept within the sizes the codec accepts.
    fn read_max_pdu(&self) -> u32 {
        self.local_max_pdu_length
            .clamp(MINIMUM_MAX_PDU, MAXIMUM_PDU_SIZE)
    }

    fn accepted_context(&self, context_id: u8) -> Result<&NegotiatedContext> {
        let context = self
            .contexts
            .iter()
            .find(|context| context.id == context_id)
            .context(NoSuchContextSnafu { context_id })?;
        ensure!(context.is_accepted(), ContextNotAcceptedSnafu { context_id });
        Ok(context)
    }

    /// Serialize and send one PDU under the writer lock.
    fn send_pdu(&self, pdu: &Pdu) -> Result<()> {
        let mut buffer = Vec::with_capacity(128);
        write_pdu(&mut buffer, pdu).context(SendSnafu)?;
        let mut writer = self.lock_writer();
        writer.write_all(&buffer).context(WireSendSnafu)?;
        writer.flush().context(WireSendSnafu)?;
        Ok(())
    }

    /// Send one full DIMSE message,
    /// holding the writer lock from the first fragment to the last.
    fn write_message(
        &self,
        context_id: u8,
        mut command: InMemDicomObject,
        dataset: Option<&[u8]>,
    ) -> Result<()> {
        dimse::set_data_set_present(&mut command, dataset.is_some());
        let command_bytes = dimse::encode_command(&command).context(CommandSnafu)?;

        let mut writer = self.lock_writer();
        match self.apply(Event::PDataRequest) {
            Transition::Do { .. } => {}
            _ => {
                return match self.registry.closed_cause() {
                    Some(cause) => ClosedSnafu { cause }.fail(),
                    None => IllegalStateSnafu {
                        operation: "send message",
                    }
                    .fail(),
                }
            }
        }

        let max = self.peer_max_pdu_length;
        {
            let mut fragments =
                PDataWriter::new(&mut **writer, context_id, PdvKind::Command, max);
            fragments.write_all(&command_bytes).context(WireSendSnafu)?;
            fragments.finish().context(WireSendSnafu)?;
        }
        if let Some(data) = dataset {
            let mut fragments = PDataWriter::new(&mut **writer, context_id, PdvKind::Data, max);
            fragments.write_all(data).context(WireSendSnafu)?;
            fragments.finish().context(WireSendSnafu)?;
        }
        writer.flush().context(WireSendSnafu)?;
        Ok(())
    }

    /// Turn a wire failure into the association's terminal cause,
    /// leaving precondition errors untouched.
    fn escalate(&self, error: Error) -> Error {
        match error {
            Error::Send { .. } | Error::WireSend { .. } | Error::Receive { .. } => {
                let cause = Arc::new(error);
                self.terminal_close(Arc::clone(&cause));
                ClosedSnafu { cause }.build()
            }
            error => error,
        }
    }

    /// Answer a pending release indication with A-RELEASE-RP,
    /// if the machine is in a state which admits it.
    fn release_response(&self) -> Result<()> {
        match self.apply(Event::ReleaseResponse) {
            Transition::Do {
                action: Action::SendReleaseRp | Action::SendCollisionReleaseRp,
                ..
            } => self.send_pdu(&Pdu::ReleaseRp),
            _ => Ok(()),
        }
    }

    /// Send a provider abort on behalf of a protocol violation,
    /// best effort.
    fn provider_abort(&self, reason: ProviderAbortReason) {
        let _ = self.apply(Event::AbortRequest);
        let _ = self.send_pdu(&Pdu::AbortRq {
            source: AbortSource::ServiceProvider(reason),
        });
        if let Some(delay) = self.timeouts.abort_delay {
            std::thread::sleep(delay);
        }
    }

    /// Abort on the local user's initiative.
    /// A no-op once the association is terminal.
    fn local_abort(&self) {
        if self.is_terminal() {
            return;
        }
        if let Transition::Do {
            action: Action::SendAbort,
            ..
        } = self.apply(Event::AbortRequest)
        {
            let _ = self.send_pdu(&Pdu::AbortRq {
                source: AbortSource::ServiceUser,
            });
            if let Some(delay) = self.timeouts.abort_delay {
                std::thread::sleep(delay);
            }
        }
        self.terminal_close(Arc::new(LocallyAbortedSnafu.build()));
    }

    fn timeout_abort(&self, scope: TimeoutScope) {
        if self.is_terminal() {
            return;
        }
        warn!(peer = %self.peer_ae_title, "{} timeout expired, aborting association", scope);
        let _ = self.apply(Event::AbortRequest);
        let _ = self.send_pdu(&Pdu::AbortRq {
            source: AbortSource::ServiceProvider(ProviderAbortReason::NotSpecified),
        });
        self.terminal_close(Arc::new(TimedOutSnafu { scope }.build()));
    }

    /// Tear the association down with its terminal cause.
    ///
    /// Exactly one call proceeds; the cause of the first call sticks.
    /// Cancels every timer, fails every outstanding operation,
    /// closes the transport and wakes all waiters.
    fn terminal_close(&self, cause: Arc<Error>) {
        {
            let mut lifecycle = self.lock_lifecycle();
            if lifecycle.closing {
                return;
            }
            lifecycle.closing = true;
        }
        debug!(peer = %self.peer_ae_title, %cause, "association terminated");

        let timers = std::mem::take(&mut *self.lock_timers());
        if let Some(task) = &timers.idle {
            task.cancel();
        }
        if let Some(task) = &timers.release {
            task.cancel();
        }
        for task in timers.response.values() {
            task.cancel();
        }

        self.registry.close(cause);
        (self.shutdown)();

        let mut lifecycle = self.lock_lifecycle();
        lifecycle.done = true;
        self.lifecycle_cond.notify_all();
    }

    fn wait_done(&self) {
        let mut lifecycle = self.lock_lifecycle();
        while !lifecycle.done {
            lifecycle = self
                .lifecycle_cond
                .wait(lifecycle)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn schedule_timeout(
        self: &Arc<Self>,
        delay: Duration,
        scope: TimeoutScope,
    ) -> Option<ScheduledTask> {
        let scheduler = self.scheduler.as_ref()?;
        // a weak reference keeps the timer from pinning the association
        let weak: Weak<Inner> = Arc::downgrade(self);
        Some(scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.timeout_abort(scope);
                }
            }),
        ))
    }

    fn arm_release(self: &Arc<Self>) {
        let Some(delay) = self.timeouts.release else {
            return;
        };
        if let Some(task) = self.schedule_timeout(delay, TimeoutScope::Release) {
            if let Some(previous) = self.lock_timers().release.replace(task) {
                previous.cancel();
            }
        }
    }

    fn arm_response(self: &Arc<Self>, message_id: u16) {
        let Some(delay) = self.timeouts.response else {
            return;
        };
        if let Some(task) = self.schedule_timeout(delay, TimeoutScope::Response) {
            if let Some(previous) = self.lock_timers().response.insert(message_id, task) {
                previous.cancel();
            }
        }
    }

    fn cancel_response(&self, message_id: u16) {
        if let Some(task) = self.lock_timers().response.remove(&message_id) {
            task.cancel();
        }
    }

    fn disarm_idle(&self) {
        if let Some(task) = self.lock_timers().idle.take() {
            task.cancel();
        }
    }

    /// Arm the idle timer when the association is established
    /// and nothing is in flight in either direction.
    fn maybe_arm_idle(self: &Arc<Self>) {
        let Some(delay) = self.timeouts.idle else {
            return;
        };
        if self.state() != State::Sta6 || !self.registry.is_quiet() {
            self.disarm_idle();
            return;
        }
        if let Some(task) = self.schedule_timeout(delay, TimeoutScope::Idle) {
            if let Some(previous) = self.lock_timers().idle.replace(task) {
                previous.cancel();
            }
        }
    }
}

/// Everything the association runtime needs from a finished
/// establishment handshake.
pub(crate) struct AssociationSetup {
    pub role: Role,
    /// the machine which drove the handshake, now at `Sta6`
    pub machine: Machine,
    pub transport: Transport,
    pub contexts: Vec<NegotiatedContext>,
    pub peer_ae_title: String,
    pub peer_max_pdu_length: u32,
    pub local_max_pdu_length: u32,
    pub strict: bool,
    /// granted bound on operations invoked by this node, 0 for no bound
    pub max_ops_invoked: u16,
    pub timeouts: TimeoutOptions,
    pub handler: Option<Arc<dyn DimseHandler>>,
    pub executor: Arc<dyn Executor>,
}

impl AssociationSetup {
    /// Start the reader worker and hand out the association handle.
    pub(crate) fn spawn(self) -> Result<Association> {
        let scheduler = if self.timeouts.needs_scheduler() {
            Some(Scheduler::new().context(SpawnWorkerSnafu)?)
        } else {
            None
        };
        let Transport {
            reader,
            writer,
            shutdown,
        } = self.transport;

        let inner = Arc::new(Inner {
            role: self.role,
            peer_ae_title: self.peer_ae_title,
            contexts: self.contexts,
            peer_max_pdu_length: self.peer_max_pdu_length,
            local_max_pdu_length: self.local_max_pdu_length,
            strict: self.strict,
            machine: Mutex::new(self.machine),
            writer: Mutex::new(writer),
            shutdown,
            registry: OperationRegistry::new(self.max_ops_invoked),
            handler: self.handler,
            scheduler,
            timeouts: self.timeouts,
            timers: Mutex::new(Timers::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            lifecycle_cond: Condvar::new(),
            next_message_id: AtomicU16::new(1),
        });
        inner.maybe_arm_idle();

        let worker = Arc::clone(&inner);
        let name = format!("dicom-net/{}", inner.peer_ae_title);
        self.executor
            .spawn(&name, Box::new(move || run_worker(worker, reader)))
            .map_err(|e| {
                (inner.shutdown)();
                SpawnWorkerSnafu.into_error(e)
            })?;

        Ok(Association { inner, owned: true })
    }
}

/// An established association with a peer application entity.
///
/// All methods take a shared reference,
/// so threads may invoke operations concurrently
/// through a shared borrow or an [`Arc`].
/// Dropping the handle obtained from establishment
/// aborts the association if it is still running.
pub struct Association {
    inner: Arc<Inner>,
    /// dropping the primary handle tears the association down
    owned: bool,
}

impl fmt::Debug for Association {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Association")
            .field("role", &self.inner.role)
            .field("peer_ae_title", &self.inner.peer_ae_title)
            .field("state", &self.inner.state())
            .finish_non_exhaustive()
    }
}

impl Association {
    /// Which side of the association this node played at establishment.
    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// The application entity title of the peer.
    pub fn peer_ae_title(&self) -> &str {
        &self.inner.peer_ae_title
    }

    /// Every proposed presentation context with its negotiation result.
    pub fn presentation_contexts(&self) -> &[NegotiatedContext] {
        &self.inner.contexts
    }

    /// Look up one presentation context by its ID.
    pub fn presentation_context(&self, context_id: u8) -> Option<&NegotiatedContext> {
        self.inner
            .contexts
            .iter()
            .find(|context| context.id == context_id)
    }

    /// The maximum PDU length announced by the peer.
    pub fn peer_max_pdu_length(&self) -> u32 {
        self.inner.peer_max_pdu_length
    }

    /// The maximum PDU length announced by this node.
    pub fn local_max_pdu_length(&self) -> u32 {
        self.inner.local_max_pdu_length
    }

    /// The number of invoked operations still awaiting
    /// a terminal response.
    pub fn outstanding_operations(&self) -> usize {
        self.inner.registry.outstanding()
    }

    /// Produce a message ID which is unlikely to collide
    /// with one in flight.
    pub fn generate_message_id(&self) -> u16 {
        loop {
            let id = self.inner.next_message_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// The cause which terminated the association, once there is one.
    pub fn closed_cause(&self) -> Option<Arc<Error>> {
        self.inner.registry.closed_cause()
    }

    /// Block until the association terminates,
    /// returning the terminal cause.
    ///
    /// An orderly teardown reports [`Error::Released`].
    pub fn wait_closed(&self) -> Arc<Error> {
        self.inner.wait_done();
        self.inner
            .registry
            .closed_cause()
            .unwrap_or_else(|| Arc::new(ConnectionClosedSnafu.build()))
    }

    /// An additional handle to the same association,
    /// for answering operations from outside a service handler.
    ///
    /// Only the handle obtained from establishment
    /// aborts the association when dropped.
    pub fn handle(&self) -> Association {
        Association {
            inner: Arc::clone(&self.inner),
            owned: false,
        }
    }

    /// Invoke one operation on the given presentation context.
    ///
    /// The handler is registered under the request's message ID
    /// before anything reaches the wire and receives every response
    /// to the operation on the association worker.
    /// Blocks while the negotiated asynchronous operations bound
    /// is saturated.
    pub fn send_request(
        &self,
        context_id: u8,
        command: InMemDicomObject,
        dataset: Option<&[u8]>,
        handler: Box<dyn ResponseHandler>,
    ) -> Result<()> {
        let context = self.inner.accepted_context(context_id)?;
        ensure!(
            context.scu,
            RoleViolationSnafu {
                abstract_syntax: context.abstract_syntax.clone(),
            }
        );
        let message_id = dimse::message_id(&command).context(CommandSnafu)?;

        // registration may block on the operations bound;
        // it must happen before the writer lock is taken
        self.inner.registry.register(message_id, handler)?;
        self.inner.disarm_idle();

        match self
            .inner
            .write_message(context_id, command, dataset)
            .map_err(|e| self.inner.escalate(e))
        {
            Ok(()) => {
                self.inner.arm_response(message_id);
                Ok(())
            }
            Err(error) => {
                if !matches!(error, Error::Closed { .. }) {
                    self.inner.registry.unregister(message_id);
                }
                Err(error)
            }
        }
    }

    /// Answer one operation which the peer invoked.
    ///
    /// A terminal status completes the performed operation;
    /// when the peer's release request was waiting on it,
    /// the release reply goes out from here.
    pub fn send_response(
        &self,
        context_id: u8,
        command: InMemDicomObject,
        dataset: Option<&[u8]>,
    ) -> Result<()> {
        self.inner.accepted_context(context_id)?;
        let message_id = dimse::message_id_being_responded_to(&command).context(CommandSnafu)?;
        let status = dimse::status(&command).context(CommandSnafu)?;

        self.inner
            .write_message(context_id, command, dataset)
            .map_err(|e| self.inner.escalate(e))?;

        if StatusClass::of(status).is_terminal() {
            self.inner.registry.unregister_cancel(message_id);
            if self.inner.registry.end_performing() {
                self.inner
                    .release_response()
                    .map_err(|e| self.inner.escalate(e))?;
            }
            self.inner.maybe_arm_idle();
        }
        Ok(())
    }

    /// Ask the peer to cancel the operation
    /// invoked under `message_id`.
    ///
    /// Fire and forget: the operation still ends
    /// with a terminal response, canceled or not.
    pub fn send_cancel(&self, context_id: u8, message_id: u16) -> Result<()> {
        self.inner.accepted_context(context_id)?;
        let command = dimse::cancel_rq(message_id);
        self.inner
            .write_message(context_id, command, None)
            .map_err(|e| self.inner.escalate(e))
    }

    /// Make an operation being performed by this node cancelable,
    /// running the callback if the peer sends a matching C-CANCEL.
    pub fn register_cancel(&self, message_id: u16, on_cancel: CancelCallback) {
        self.inner.registry.register_cancel(message_id, on_cancel)
    }

    /// Release the association in an orderly manner,
    /// blocking until the release handshake completes.
    ///
    /// Responses to operations still outstanding may be lost;
    /// use [`release_gracefully`](Association::release_gracefully)
    /// to wait for them first.
    pub fn release(&self) -> Result<()> {
        match self.inner.apply(Event::ReleaseRequest) {
            Transition::Do {
                action: Action::SendReleaseRq,
                ..
            } => {}
            _ => {
                return match self.inner.registry.closed_cause() {
                    Some(cause) => ClosedSnafu { cause }.fail(),
                    None => IllegalStateSnafu {
                        operation: "release",
                    }
                    .fail(),
                }
            }
        }
        self.inner.disarm_idle();
        self.inner.arm_release();
        self.inner
            .send_pdu(&Pdu::ReleaseRq)
            .map_err(|e| self.inner.escalate(e))?;

        self.inner.wait_done();
        match self.inner.registry.closed_cause() {
            Some(cause) if matches!(*cause, Error::Released) => Ok(()),
            Some(cause) => ClosedSnafu { cause }.fail(),
            None => Ok(()),
        }
    }

    /// Wait for all invoked operations to complete,
    /// then release the association, swallowing failures.
    pub fn release_gracefully(&self) {
        if let Err(error) = self.inner.registry.wait_drained() {
            debug!("graceful release: {}", error);
            return;
        }
        if let Err(error) = self.release() {
            debug!("graceful release: {}", error);
        }
    }

    /// Abort the association immediately.
    ///
    /// Outstanding operations fail with the abort as their cause.
    /// A no-op once the association is terminal.
    pub fn abort(&self) {
        self.inner.local_abort();
    }

    /// A handle for service handlers running on the worker.
    fn internal(inner: &Arc<Inner>) -> Association {
        Association {
            inner: Arc::clone(inner),
            owned: false,
        }
    }
}

impl Drop for Association {
    fn drop(&mut self) {
        if self.owned {
            self.inner.local_abort();
        }
    }
}

/// What the worker does after interpreting one PDU.
enum Flow {
    /// keep reading
    Continue,
    /// interpret this PDU next, it interrupted a data set read
    Carry(Pdu),
    /// terminate the association with this cause
    Stop(Arc<Error>),
}

/// The reader worker loop.
///
/// Sole owner of the transport's read half;
/// every inbound PDU is interpreted here and nowhere else.
fn run_worker(inner: Arc<Inner>, mut reader: Box<dyn Read + Send>) {
    let mut carry: Option<Pdu> = None;
    // command fragments of a message still being assembled
    let mut pending_command: Option<(u8, Vec<u8>)> = None;

    let cause = loop {
        let pdu = match carry.take() {
            Some(pdu) => pdu,
            None => match read_pdu(&mut reader, inner.read_max_pdu(), inner.strict) {
                Ok(Some(pdu)) => pdu,
                Ok(None) => {
                    let transition = inner.apply(Event::TransportClosed);
                    break match transition {
                        // an announced closure after the release handshake
                        Transition::Do {
                            action: Action::StopTimerOnClose,
                            ..
                        } => Arc::new(ReleasedSnafu.build()),
                        _ => Arc::new(ConnectionClosedSnafu.build()),
                    };
                }
                Err(error) => {
                    warn!(peer = %inner.peer_ae_title, "malformed PDU: {}", error);
                    inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                    break Arc::new(ReceiveSnafu.into_error(error));
                }
            },
        };
        debug!(peer = %inner.peer_ae_title, "received {}", pdu.short_description());

        match step(&inner, pdu, &mut reader, &mut pending_command) {
            Flow::Continue => inner.maybe_arm_idle(),
            Flow::Carry(pdu) => carry = Some(pdu),
            Flow::Stop(cause) => break cause,
        }
    };

    inner.terminal_close(cause);
}

/// Feed one PDU through the state machine and perform its action.
fn step(
    inner: &Arc<Inner>,
    pdu: Pdu,
    reader: &mut Box<dyn Read + Send>,
    pending_command: &mut Option<(u8, Vec<u8>)>,
) -> Flow {
    let event = Event::of_pdu(&pdu);
    match inner.apply(event) {
        Transition::UnexpectedPdu => {
            warn!(
                peer = %inner.peer_ae_title,
                "aborting: {} not admitted in the current state",
                pdu.short_description()
            );
            inner.provider_abort(ProviderAbortReason::UnexpectedPdu);
            Flow::Stop(Arc::new(
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.build(),
            ))
        }
        // PDU events never map to an illegal local request
        Transition::IllegalRequest => Flow::Continue,
        Transition::Do { action, .. } => perform(inner, action, pdu, reader, pending_command),
    }
}

fn perform(
    inner: &Arc<Inner>,
    action: Action,
    pdu: Pdu,
    reader: &mut Box<dyn Read + Send>,
    pending_command: &mut Option<(u8, Vec<u8>)>,
) -> Flow {
    match (action, pdu) {
        (Action::IndicatePData, Pdu::PData { data }) => {
            handle_pdata(inner, data, reader, pending_command)
        }
        (Action::IndicateRelease, _) => {
            inner.arm_release();
            // the reply waits until performed operations drain
            if inner.registry.note_release_requested() {
                if let Err(error) = inner.release_response() {
                    return Flow::Stop(Arc::new(inner.escalate(error)));
                }
            }
            Flow::Continue
        }
        (Action::ConfirmReleased, _) => Flow::Stop(Arc::new(ReleasedSnafu.build())),
        (Action::IndicateReleaseCollision, _) => {
            // the requestor side replies first;
            // the acceptor side waits for that reply
            if inner.role == Role::Requestor {
                if let Err(error) = inner.release_response() {
                    return Flow::Stop(Arc::new(inner.escalate(error)));
                }
            }
            Flow::Continue
        }
        (Action::ConfirmReleaseCollision, _) => {
            if let Err(error) = inner.release_response() {
                return Flow::Stop(Arc::new(inner.escalate(error)));
            }
            Flow::Continue
        }
        (Action::IndicateAbort | Action::CloseTransport, Pdu::AbortRq { source }) => {
            Flow::Stop(Arc::new(AbortedSnafu { origin: source }.build()))
        }
        (Action::CloseTransport, _) => Flow::Stop(Arc::new(ConnectionClosedSnafu.build())),
        (Action::SendAbort, pdu) => {
            // lingering traffic while awaiting the transport close
            let reason = match &pdu {
                Pdu::Unknown { .. } => ProviderAbortReason::UnrecognizedPdu,
                _ => ProviderAbortReason::UnexpectedPdu,
            };
            inner.provider_abort(reason);
            Flow::Stop(Arc::new(
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.build(),
            ))
        }
        (Action::Ignore, pdu) => {
            debug!(
                peer = %inner.peer_ae_title,
                "ignoring {} while closing",
                pdu.short_description()
            );
            Flow::Continue
        }
        (action, pdu) => {
            debug_assert!(
                false,
                "worker does not interpret ({:?}, {})",
                action,
                pdu.short_description()
            );
            Flow::Continue
        }
    }
}

/// Assemble command sets from inbound P-DATA fragments
/// and dispatch every completed message.
fn handle_pdata(
    inner: &Arc<Inner>,
    values: Vec<PDataValue>,
    reader: &mut Box<dyn Read + Send>,
    pending_command: &mut Option<(u8, Vec<u8>)>,
) -> Flow {
    inner.disarm_idle();
    let mut values = values.into_iter();
    while let Some(pdv) = values.next() {
        match pdv.kind {
            PdvKind::Command => {
                match pending_command.as_mut() {
                    None => *pending_command = Some((pdv.context_id, pdv.data)),
                    Some((context_id, buffer)) => {
                        if *context_id != pdv.context_id {
                            warn!(
                                "command continuation moved from context {} to {}",
                                context_id, pdv.context_id
                            );
                            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                            return Flow::Stop(Arc::new(
                                ProtocolViolationSnafu {
                                    message: "command fragments on different contexts",
                                }
                                .build(),
                            ));
                        }
                        buffer.extend(pdv.data);
                    }
                }
                if pdv.is_last {
                    let Some((context_id, bytes)) = pending_command.take() else {
                        unreachable!("a command fragment was just staged");
                    };
                    let command = match dimse::decode_command(&bytes) {
                        Ok(command) => command,
                        Err(error) => {
                            warn!("undecodable command set: {}", error);
                            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                            return Flow::Stop(Arc::new(CommandSnafu.into_error(error)));
                        }
                    };
                    // data fragments arriving in the same PDU
                    // belong to this message
                    let trailing: Vec<PDataValue> = values.collect();
                    return dispatch_message(inner, context_id, command, trailing, reader);
                }
            }
            PdvKind::Data => {
                warn!("data fragment without a command in progress");
                inner.provider_abort(ProviderAbortReason::UnexpectedPduParameter);
                return Flow::Stop(Arc::new(
                    ProtocolViolationSnafu {
                        message: "data set fragment without a command set",
                    }
                    .build(),
                ));
            }
        }
    }
    Flow::Continue
}

fn dispatch_message(
    inner: &Arc<Inner>,
    context_id: u8,
    command: InMemDicomObject,
    trailing: Vec<PDataValue>,
    reader: &mut Box<dyn Read + Send>,
) -> Flow {
    let field_code = match dimse::command_field_code(&command) {
        Ok(code) => code,
        Err(error) => {
            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
            return Flow::Stop(Arc::new(CommandSnafu.into_error(error)));
        }
    };
    let has_data = dimse::has_data_set(&command).unwrap_or(false);

    match CommandField::from_code(field_code) {
        Some(field) if field.is_response() => {
            deliver_response(inner, context_id, command, has_data, trailing, reader)
        }
        Some(CommandField::CCancelRq) => {
            match dimse::message_id_being_responded_to(&command) {
                Ok(message_id) => {
                    if !inner.registry.dispatch_cancel(message_id) {
                        debug!("C-CANCEL for unknown or finished operation {}", message_id);
                    }
                    Flow::Continue
                }
                Err(error) => {
                    inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                    Flow::Stop(Arc::new(CommandSnafu.into_error(error)))
                }
            }
        }
        None if field_code & 0x8000 != 0 => {
            inner.provider_abort(ProviderAbortReason::UnexpectedPduParameter);
            Flow::Stop(Arc::new(
                ProtocolViolationSnafu {
                    message: "response with an unknown command field",
                }
                .build(),
            ))
        }
        // a recognized request, or an unknown command
        // with the request bit, which still gets a failure response
        field => perform_request(
            inner, context_id, command, field, field_code, has_data, trailing, reader,
        ),
    }
}

fn deliver_response(
    inner: &Arc<Inner>,
    context_id: u8,
    command: InMemDicomObject,
    has_data: bool,
    trailing: Vec<PDataValue>,
    reader: &mut Box<dyn Read + Send>,
) -> Flow {
    let message_id = match dimse::message_id_being_responded_to(&command) {
        Ok(id) => id,
        Err(error) => {
            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
            return Flow::Stop(Arc::new(CommandSnafu.into_error(error)));
        }
    };
    let status = match dimse::status(&command) {
        Ok(status) => status,
        Err(error) => {
            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
            return Flow::Stop(Arc::new(CommandSnafu.into_error(error)));
        }
    };
    let terminal = StatusClass::of(status).is_terminal();

    let dataset = if has_data {
        let stream: &mut (dyn Read + Send) = &mut **reader;
        let mut fragments =
            match PDataReader::preloaded(stream, context_id, inner.read_max_pdu(), trailing) {
                Ok(fragments) => fragments,
                Err(error) => {
                    inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                    return Flow::Stop(Arc::new(ReadDataSetSnafu.into_error(error)));
                }
            };
        let mut buffer = Vec::new();
        if let Err(error) = fragments.read_to_end(&mut buffer) {
            if let Some(pdu) = fragments.take_interrupting_pdu() {
                // the truncated response is dropped,
                // the interrupting PDU decides the outcome
                return Flow::Carry(pdu);
            }
            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
            return Flow::Stop(Arc::new(ReadDataSetSnafu.into_error(error)));
        }
        Some(buffer)
    } else {
        None
    };

    if terminal {
        inner.cancel_response(message_id);
    } else {
        // a pending response restarts the clock for the next one
        inner.arm_response(message_id);
    }

    match inner
        .registry
        .deliver(message_id, terminal, |handler| {
            handler.on_response(&command, dataset)
        }) {
        Ok(()) => Flow::Continue,
        Err(error @ Error::UnmatchedResponse { .. }) => {
            warn!(peer = %inner.peer_ae_title, "{}", error);
            inner.provider_abort(ProviderAbortReason::UnexpectedPduParameter);
            Flow::Stop(Arc::new(error))
        }
        Err(error) => Flow::Stop(Arc::new(error)),
    }
}

#[allow(clippy::too_many_arguments)]
fn perform_request(
    inner: &Arc<Inner>,
    context_id: u8,
    command: InMemDicomObject,
    field: Option<CommandField>,
    field_code: u16,
    has_data: bool,
    trailing: Vec<PDataValue>,
    reader: &mut Box<dyn Read + Send>,
) -> Flow {
    let message_id = match dimse::message_id(&command) {
        Ok(id) => id,
        Err(error) => {
            inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
            return Flow::Stop(Arc::new(CommandSnafu.into_error(error)));
        }
    };
    let context = inner
        .contexts
        .iter()
        .find(|context| context.id == context_id && context.is_accepted());
    let Some(context) = context else {
        warn!(
            "request {} on unaccepted presentation context {}",
            field_code, context_id
        );
        inner.provider_abort(ProviderAbortReason::UnexpectedPduParameter);
        return Flow::Stop(Arc::new(
            ProtocolViolationSnafu {
                message: "DIMSE traffic on an unaccepted presentation context",
            }
            .build(),
        ));
    };

    inner.registry.begin_performing();
    let association = Association::internal(inner);
    let dispatchable = inner.handler.as_ref().filter(|_| context.scp).cloned();

    let mut handled = false;
    let mut carry = None;
    if has_data {
        let stream: &mut (dyn Read + Send) = &mut **reader;
        let mut dataset =
            match PDataReader::preloaded(stream, context_id, inner.read_max_pdu(), trailing) {
                Ok(dataset) => dataset,
                Err(error) => {
                    inner.registry.end_performing();
                    inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                    return Flow::Stop(Arc::new(ReadDataSetSnafu.into_error(error)));
                }
            };
        if let (Some(handler), Some(_)) = (&dispatchable, field) {
            handled = handler.on_request(&association, context, command, Some(&mut dataset));
        }
        // realign the stream past whatever the handler left unread
        if let Some(pdu) = dataset.take_interrupting_pdu() {
            carry = Some(pdu);
        } else if !dataset.is_complete() {
            if let Err(error) = std::io::copy(&mut dataset, &mut std::io::sink()) {
                if let Some(pdu) = dataset.take_interrupting_pdu() {
                    carry = Some(pdu);
                } else {
                    inner.registry.end_performing();
                    inner.provider_abort(ProviderAbortReason::InvalidPduParameter);
                    return Flow::Stop(Arc::new(ReadDataSetSnafu.into_error(error)));
                }
            }
        }
    } else if let (Some(handler), Some(_)) = (&dispatchable, field) {
        handled = handler.on_request(&association, context, command, None);
    }

    if !handled {
        let response = dimse::unrecognized_operation_rsp(field_code, message_id);
        if let Err(error) = association.send_response(context_id, response, None) {
            return Flow::Stop(Arc::new(error));
        }
    }

    match carry {
        Some(pdu) => Flow::Carry(pdu),
        None => Flow::Continue,
    }
}
