//! Association acceptor module.
//!
//! [`ServerAssociationOptions`] holds the service capabilities
//! and access policy of an acceptor node,
//! and negotiates one association per incoming TCP connection.
//!
//! ```no_run
//! # use std::net::TcpListener;
//! # use dicom_net::association::server::ServerAssociationOptions;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let listener = TcpListener::bind("0.0.0.0:11112")?;
//! let options = ServerAssociationOptions::new()
//!     .ae_title("MAIN-STORAGE")
//!     .with_abstract_syntax("1.2.840.10008.1.1");
//! for stream in listener.incoming() {
//!     let association = options.establish(stream?)?;
//!     // ...
//! #   let _ = association;
//! }
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use snafu::{ensure, ResultExt};
use tracing::debug;

use crate::pdu::{
    read_pdu, write_pdu, AbortSource, AcseRejectReason, AssociateAc, AssociateRj, AssociateRq,
    Pdu, ProviderAbortReason, RejectResult, RejectSource, UserIdentity, UserRejectReason,
    UserVariable, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE,
};
use crate::runtime::{Executor, ThreadExecutor};
use crate::transport::IntoTransport;
use crate::{APPLICATION_CONTEXT_NAME, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::machine::{Event, Machine, Role};
use super::negotiate::{negotiate_association, Capability};
use super::{
    Association, AssociationSetup, ConfigureSocketSnafu, ConnectionClosedSnafu, DimseHandler,
    MissingAbstractSyntaxSnafu, ProtocolVersionMismatchSnafu, ReceiveSnafu, RejectedSnafu,
    Result, SendSnafu, TimeoutOptions, UnexpectedPduSnafu, UnknownPduSnafu, WireSendSnafu,
};

/// A verdict on whether an incoming association request
/// may proceed to presentation context negotiation.
pub trait AccessPolicy: Send + Sync {
    /// Decide on the association request identified by
    /// this node's AE title, the peer's AE titles,
    /// and the user identity proposed by the peer, if any.
    ///
    /// On acceptance, the policy may return identity acknowledgement
    /// bytes to carry back when the peer asked for them.
    /// On refusal, the returned rejection is sent verbatim.
    fn check_access(
        &self,
        this_ae_title: &str,
        calling_ae_title: &str,
        called_ae_title: &str,
        user_identity: Option<&UserIdentity>,
    ) -> Result<Option<Vec<u8>>, AssociateRj>;
}

/// An access policy which admits every association request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAny;

impl AccessPolicy for AcceptAny {
    fn check_access(
        &self,
        _this_ae_title: &str,
        _calling_ae_title: &str,
        _called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<Option<Vec<u8>>, AssociateRj> {
        Ok(None)
    }
}

/// An access policy which requires the called AE title
/// to match this node's AE title.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptCalledAeTitle;

impl AccessPolicy for AcceptCalledAeTitle {
    fn check_access(
        &self,
        this_ae_title: &str,
        _calling_ae_title: &str,
        called_ae_title: &str,
        _user_identity: Option<&UserIdentity>,
    ) -> Result<Option<Vec<u8>>, AssociateRj> {
        if called_ae_title.trim_end() == this_ae_title {
            Ok(None)
        } else {
            Err(AssociateRj {
                result: RejectResult::Permanent,
                source: RejectSource::ServiceUser(UserRejectReason::CalledAeTitleNotRecognized),
            })
        }
    }
}

/// A capability table and negotiation policy
/// for accepting associations on incoming connections.
///
/// At least one capability must be declared,
/// unless [`promiscuous`](Self::promiscuous) mode is on.
/// The options may be reused across any number of connections.
#[derive(Clone)]
pub struct ServerAssociationOptions<'a, A> {
    /// the access policy deciding which requests proceed
    access_policy: A,
    ae_title: Cow<'a, str>,
    application_context_name: Cow<'a, str>,
    /// service capabilities, one per supported abstract syntax
    capabilities: Vec<Capability>,
    /// transfer syntaxes admitted for abstract syntaxes
    /// covered by no capability entry, when promiscuous
    fallback_transfer_syntaxes: Vec<Cow<'static, str>>,
    /// whether to accept presentation contexts
    /// for unrecognized abstract syntaxes
    promiscuous: bool,
    protocol_version: u16,
    max_pdu_length: u32,
    strict: bool,
    /// bound on operations this node invokes, 0 for no bound
    max_ops_invoked: u16,
    /// bound on operations this node performs, 0 for no bound
    max_ops_performed: u16,
    timeouts: TimeoutOptions,
    handler: Option<Arc<dyn DimseHandler>>,
    executor: Arc<dyn Executor>,
}

impl Default for ServerAssociationOptions<'_, AcceptAny> {
    fn default() -> Self {
        ServerAssociationOptions {
            access_policy: AcceptAny,
            ae_title: "THIS-SCP".into(),
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            capabilities: Vec::new(),
            fallback_transfer_syntaxes: Vec::new(),
            promiscuous: false,
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            max_ops_invoked: 1,
            max_ops_performed: 1,
            timeouts: TimeoutOptions::default(),
            handler: None,
            executor: Arc::new(ThreadExecutor),
        }
    }
}

impl<A> fmt::Debug for ServerAssociationOptions<'_, A>
where
    A: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerAssociationOptions")
            .field("access_policy", &self.access_policy)
            .field("ae_title", &self.ae_title)
            .field("capabilities", &self.capabilities)
            .field("promiscuous", &self.promiscuous)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl ServerAssociationOptions<'_, AcceptAny> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<'a, A> ServerAssociationOptions<'a, A>
where
    A: AccessPolicy,
{
    /// Replace the access policy.
    pub fn access_policy<P>(self, access_policy: P) -> ServerAssociationOptions<'a, P>
    where
        P: AccessPolicy,
    {
        ServerAssociationOptions {
            access_policy,
            ae_title: self.ae_title,
            application_context_name: self.application_context_name,
            capabilities: self.capabilities,
            fallback_transfer_syntaxes: self.fallback_transfer_syntaxes,
            promiscuous: self.promiscuous,
            protocol_version: self.protocol_version,
            max_pdu_length: self.max_pdu_length,
            strict: self.strict,
            max_ops_invoked: self.max_ops_invoked,
            max_ops_performed: self.max_ops_performed,
            timeouts: self.timeouts,
            handler: self.handler,
            executor: self.executor,
        }
    }

    /// Require the called AE title to match this node's AE title.
    pub fn accept_called_ae_title(self) -> ServerAssociationOptions<'a, AcceptCalledAeTitle> {
        self.access_policy(AcceptCalledAeTitle)
    }

    /// Set this node's application entity title.
    pub fn ae_title<T>(mut self, ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.ae_title = ae_title.into();
        self
    }

    /// Declare a full service capability.
    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.push(capability);
        self
    }

    /// Declare support for the given abstract syntax
    /// with the default capability settings
    /// (SCP role, any supported transfer syntax).
    pub fn with_abstract_syntax<T>(self, abstract_syntax: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.with_capability(Capability::new(abstract_syntax))
    }

    /// Admit the given transfer syntax for abstract syntaxes
    /// covered by no capability entry.
    pub fn with_fallback_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.fallback_transfer_syntaxes.push(transfer_syntax_uid.into());
        self
    }

    /// Accept presentation contexts for abstract syntaxes
    /// which no capability entry covers.
    pub fn promiscuous(mut self, promiscuous: bool) -> Self {
        self.promiscuous = promiscuous;
        self
    }

    /// Override the maximum PDU length to announce.
    pub fn max_pdu_length(mut self, value: u32) -> Self {
        self.max_pdu_length = value;
        self
    }

    /// Override strict mode:
    /// whether to hard-fail when the peer sends PDUs
    /// larger than it announced it would.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Bound the asynchronous operations window to grant,
    /// where 0 stands for no bound.
    ///
    /// The granted window never exceeds the one the peer proposes.
    pub fn async_ops_window(mut self, max_ops_invoked: u16, max_ops_performed: u16) -> Self {
        self.max_ops_invoked = max_ops_invoked;
        self.max_ops_performed = max_ops_performed;
        self
    }

    /// Bound the wait for the association request
    /// after the connection is accepted.
    pub fn accept_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.accept = Some(timeout);
        self
    }

    /// Bound the wait for the release reply.
    pub fn release_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.release = Some(timeout);
        self
    }

    /// Bound the time the association may stay established
    /// with no operation in flight.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.idle = Some(timeout);
        self
    }

    /// Bound the wait for each response to an invoked operation.
    pub fn response_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.response = Some(timeout);
        self
    }

    /// Give outbound abort PDUs a grace period to reach the peer
    /// before the connection closes.
    pub fn abort_delay(mut self, delay: Duration) -> Self {
        self.timeouts.abort_delay = Some(delay);
        self
    }

    /// Install the handler for operations
    /// which the peer invokes on this node.
    ///
    /// Without one, every inbound request is answered
    /// with an "unrecognized operation" failure response.
    pub fn handler(mut self, handler: Arc<dyn DimseHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Run association workers on the given executor
    /// instead of one dedicated thread each.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Negotiate an association on the given connection.
    pub fn establish(&self, mut socket: TcpStream) -> Result<Association> {
        ensure!(
            !self.capabilities.is_empty() || self.promiscuous,
            MissingAbstractSyntaxSnafu
        );

        let mut machine = Machine::new(Role::Acceptor);
        machine.apply(Event::TransportAccepted);

        // the accept timeout only applies to the handshake
        socket
            .set_read_timeout(self.timeouts.accept)
            .context(ConfigureSocketSnafu)?;
        socket
            .set_write_timeout(self.timeouts.accept)
            .context(ConfigureSocketSnafu)?;

        let request = read_pdu(&mut socket, self.max_pdu_length.max(DEFAULT_MAX_PDU), self.strict)
            .context(ReceiveSnafu)?;
        let Some(request) = request else {
            return ConnectionClosedSnafu.fail();
        };

        match request {
            Pdu::AssociateRq(request) => {
                machine.apply(Event::AssociateRqReceived);
                self.negotiate(machine, socket, request)
            }
            Pdu::ReleaseRq => {
                // answer the stray release and refuse the association
                let _ = send_handshake_pdu(&mut socket, &Pdu::ReleaseRp);
                UnexpectedPduSnafu {
                    pdu: Box::new(Pdu::ReleaseRq),
                }
                .fail()
            }
            Pdu::Unknown { pdu_type, .. } => {
                abort_handshake(&mut socket, ProviderAbortReason::UnrecognizedPdu);
                UnknownPduSnafu { pdu_type }.fail()
            }
            pdu => {
                abort_handshake(&mut socket, ProviderAbortReason::UnexpectedPdu);
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }

    fn negotiate(
        &self,
        mut machine: Machine,
        mut socket: TcpStream,
        request: AssociateRq,
    ) -> Result<Association> {
        if request.protocol_version != self.protocol_version {
            let rejection = AssociateRj {
                result: RejectResult::Permanent,
                source: RejectSource::Acse(AcseRejectReason::ProtocolVersionNotSupported),
            };
            let _ = self.reject(&mut machine, &mut socket, rejection);
            return ProtocolVersionMismatchSnafu {
                expected: self.protocol_version,
                got: request.protocol_version,
            }
            .fail();
        }

        if request.application_context_name != self.application_context_name {
            let rejection = AssociateRj {
                result: RejectResult::Permanent,
                source: RejectSource::ServiceUser(
                    UserRejectReason::ApplicationContextNotSupported,
                ),
            };
            return self.reject(&mut machine, &mut socket, rejection);
        }

        let user_identity = request
            .user_variables
            .iter()
            .find_map(|variable| match variable {
                UserVariable::UserIdentity(identity) => Some(identity),
                _ => None,
            });
        let identity_response = match self.access_policy.check_access(
            &self.ae_title,
            request.calling_ae_title.trim_end(),
            request.called_ae_title.trim_end(),
            user_identity,
        ) {
            Ok(response) => response,
            Err(rejection) => return self.reject(&mut machine, &mut socket, rejection),
        };

        let mut outcome = negotiate_association(
            &request,
            &self.capabilities,
            &self.fallback_transfer_syntaxes,
            self.promiscuous,
            self.max_ops_invoked,
            self.max_ops_performed,
        );
        if let Some(response) = identity_response {
            for variable in &mut outcome.reply_variables {
                if let UserVariable::UserIdentityResponse(bytes) = variable {
                    *bytes = response;
                    break;
                }
            }
        }

        let peer_max_pdu_length = request
            .user_variables
            .iter()
            .find_map(|variable| match variable {
                UserVariable::MaxLength(value) => Some(*value),
                _ => None,
            })
            .unwrap_or(DEFAULT_MAX_PDU);
        // 0 stands for no limit
        let peer_max_pdu_length = if peer_max_pdu_length == 0 {
            MAXIMUM_PDU_SIZE
        } else {
            peer_max_pdu_length
        };

        let mut user_variables = vec![
            UserVariable::MaxLength(self.max_pdu_length),
            UserVariable::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariable::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        user_variables.append(&mut outcome.reply_variables);

        let acknowledgement = Pdu::AssociateAc(AssociateAc {
            protocol_version: self.protocol_version,
            calling_ae_title: request.calling_ae_title.clone(),
            called_ae_title: request.called_ae_title.clone(),
            application_context_name: request.application_context_name.clone(),
            presentation_contexts: outcome
                .contexts
                .iter()
                .map(|context| crate::pdu::PresentationContextResult {
                    id: context.id,
                    result: context.result,
                    transfer_syntax: context.transfer_syntax.clone(),
                })
                .collect(),
            user_variables,
        });

        machine.apply(Event::LocalAccept);
        send_handshake_pdu(&mut socket, &acknowledgement)?;
        debug!(
            peer = %request.calling_ae_title.trim_end(),
            accepted = outcome.contexts.iter().filter(|c| c.is_accepted()).count(),
            proposed = outcome.contexts.len(),
            "association established"
        );

        socket.set_read_timeout(None).context(ConfigureSocketSnafu)?;
        socket
            .set_write_timeout(None)
            .context(ConfigureSocketSnafu)?;
        let transport = socket.into_transport().context(ConfigureSocketSnafu)?;

        AssociationSetup {
            role: Role::Acceptor,
            machine,
            transport,
            contexts: outcome.contexts,
            peer_ae_title: request.calling_ae_title.trim_end().to_string(),
            peer_max_pdu_length,
            local_max_pdu_length: self.max_pdu_length,
            strict: self.strict,
            max_ops_invoked: outcome.max_ops_invoked,
            timeouts: self.timeouts,
            handler: self.handler.clone(),
            executor: self.executor.clone(),
        }
        .spawn()
    }

    fn reject(
        &self,
        machine: &mut Machine,
        socket: &mut TcpStream,
        rejection: AssociateRj,
    ) -> Result<Association> {
        machine.apply(Event::LocalReject);
        send_handshake_pdu(socket, &Pdu::AssociateRj(rejection.clone()))?;
        let _ = socket.shutdown(std::net::Shutdown::Both);
        RejectedSnafu { rejection }.fail()
    }
}

/// Encode and send one PDU during the handshake.
fn send_handshake_pdu(socket: &mut TcpStream, pdu: &Pdu) -> Result<()> {
    let mut buffer = Vec::with_capacity(512);
    write_pdu(&mut buffer, pdu).context(SendSnafu)?;
    socket.write_all(&buffer).context(WireSendSnafu)?;
    Ok(())
}

/// Abort a half-established association, best effort.
fn abort_handshake(socket: &mut TcpStream, reason: ProviderAbortReason) {
    let _ = send_handshake_pdu(
        socket,
        &Pdu::AbortRq {
            source: AbortSource::ServiceProvider(reason),
        },
    );
    let _ = socket.shutdown(std::net::Shutdown::Both);
}
