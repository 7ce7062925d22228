//! Association requestor module.
//!
//! The main entrypoint is [`ClientAssociationOptions`],
//! which accumulates the negotiation proposal
//! and establishes the association over a fresh TCP connection.
//!
//! ```no_run
//! # use dicom_net::association::client::ClientAssociationOptions;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let association = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .calling_ae_title("ECHOSCU")
//!     .establish_with("MAIN-STORAGE@10.0.0.100:104")?;
//! # Ok(())
//! # }
//! ```

use std::borrow::Cow;
use std::fmt;
use std::io::Write;
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use dicom_dictionary_std::uids;
use snafu::{ensure, ResultExt};
use tracing::{debug, warn};

use crate::address::AeAddr;
use crate::pdu::{
    read_pdu, write_pdu, AbortSource, AssociateRq, Pdu, ProposedPresentationContext,
    RoleSelection, UserIdentity, UserIdentityType, UserVariable, DEFAULT_MAX_PDU,
    MAXIMUM_PDU_SIZE,
};
use crate::runtime::{Executor, ThreadExecutor};
use crate::transport::IntoTransport;
use crate::{APPLICATION_CONTEXT_NAME, IMPLEMENTATION_CLASS_UID, IMPLEMENTATION_VERSION_NAME};

use super::machine::{Event, Machine, Role};
use super::negotiate::contexts_from_acknowledgement;
use super::{
    Association, AssociationSetup, ConfigureSocketSnafu, ConnectSnafu, ConnectionClosedSnafu,
    DimseHandler, MissingAbstractSyntaxSnafu, NoAcceptedPresentationContextsSnafu,
    ProtocolVersionMismatchSnafu, ReceiveResponseSnafu, RejectedSnafu, Result, SendRequestSnafu,
    TimeoutOptions, UnexpectedPduSnafu, UnknownPduSnafu, WireSendSnafu,
};

/// A proposal builder and requestor of new associations.
///
/// At least one presentation context must be proposed,
/// through [`with_abstract_syntax`](Self::with_abstract_syntax)
/// or [`with_presentation_context`](Self::with_presentation_context).
#[derive(Clone)]
pub struct ClientAssociationOptions<'a> {
    calling_ae_title: Cow<'a, str>,
    called_ae_title: Option<Cow<'a, str>>,
    application_context_name: Cow<'a, str>,
    /// proposed presentation contexts,
    /// one abstract syntax with its transfer syntax candidates each
    presentation_contexts: Vec<(Cow<'a, str>, Vec<Cow<'a, str>>)>,
    /// proposed SCP/SCU role selections
    role_selections: Vec<RoleSelection>,
    protocol_version: u16,
    max_pdu_length: u32,
    strict: bool,
    /// user identity proposal: kind, primary and secondary field
    identity: Option<(UserIdentityType, Vec<u8>, Vec<u8>)>,
    identity_ack_requested: bool,
    /// proposed asynchronous operations window, 0 for no bound
    max_ops_invoked: u16,
    max_ops_performed: u16,
    timeouts: TimeoutOptions,
    handler: Option<Arc<dyn DimseHandler>>,
    executor: Arc<dyn Executor>,
}

impl Default for ClientAssociationOptions<'_> {
    fn default() -> Self {
        ClientAssociationOptions {
            calling_ae_title: "THIS-SCU".into(),
            called_ae_title: None,
            application_context_name: APPLICATION_CONTEXT_NAME.into(),
            presentation_contexts: Vec::new(),
            role_selections: Vec::new(),
            protocol_version: 1,
            max_pdu_length: DEFAULT_MAX_PDU,
            strict: true,
            identity: None,
            identity_ack_requested: false,
            max_ops_invoked: 1,
            max_ops_performed: 1,
            timeouts: TimeoutOptions::default(),
            handler: None,
            executor: Arc::new(ThreadExecutor),
        }
    }
}

impl fmt::Debug for ClientAssociationOptions<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientAssociationOptions")
            .field("calling_ae_title", &self.calling_ae_title)
            .field("called_ae_title", &self.called_ae_title)
            .field("presentation_contexts", &self.presentation_contexts)
            .field("max_pdu_length", &self.max_pdu_length)
            .field("strict", &self.strict)
            .finish_non_exhaustive()
    }
}

impl<'a> ClientAssociationOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set this node's application entity title.
    pub fn calling_ae_title<T>(mut self, calling_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.calling_ae_title = calling_ae_title.into();
        self
    }

    /// Set the application entity title to address the peer by.
    ///
    /// An AE title given to
    /// [`establish_with`](Self::establish_with) takes precedence.
    pub fn called_ae_title<T>(mut self, called_ae_title: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.called_ae_title = Some(called_ae_title.into());
        self
    }

    /// Propose a presentation context for the given abstract syntax
    /// with the common transfer syntaxes
    /// (explicit and implicit VR little endian).
    pub fn with_abstract_syntax<T>(self, abstract_syntax: T) -> Self
    where
        T: Into<Cow<'a, str>>,
    {
        self.with_presentation_context(
            abstract_syntax,
            vec![
                uids::EXPLICIT_VR_LITTLE_ENDIAN,
                uids::IMPLICIT_VR_LITTLE_ENDIAN,
            ],
        )
    }

    /// Propose a presentation context for the given abstract syntax,
    /// restricted to the given transfer syntaxes in preference order.
    pub fn with_presentation_context<T, U>(
        mut self,
        abstract_syntax: T,
        transfer_syntaxes: Vec<U>,
    ) -> Self
    where
        T: Into<Cow<'a, str>>,
        U: Into<Cow<'a, str>>,
    {
        self.presentation_contexts.push((
            abstract_syntax.into(),
            transfer_syntaxes.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Propose SCP/SCU roles for one SOP class,
    /// from this (requestor) node's point of view.
    pub fn with_role_selection<T>(mut self, sop_class_uid: T, scu: bool, scp: bool) -> Self
    where
        T: Into<String>,
    {
        self.role_selections.push(RoleSelection {
            sop_class_uid: sop_class_uid.into(),
            scu,
            scp,
        });
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

    /// Propose an asynchronous operations window,
    /// where 0 stands for no bound.
    ///
    /// Without this call, one operation is in flight at a time
    /// each way.
    pub fn async_ops_window(mut self, max_ops_invoked: u16, max_ops_performed: u16) -> Self {
        self.max_ops_invoked = max_ops_invoked;
        self.max_ops_performed = max_ops_performed;
        self
    }

    /// Identify this node's user by username.
    pub fn username(mut self, username: &str) -> Self {
        self.identity = Some((
            UserIdentityType::Username,
            username.as_bytes().to_vec(),
            Vec::new(),
        ));
        self
    }

    /// Identify this node's user by username and passcode.
    pub fn username_passcode(mut self, username: &str, passcode: &str) -> Self {
        self.identity = Some((
            UserIdentityType::UsernamePasscode,
            username.as_bytes().to_vec(),
            passcode.as_bytes().to_vec(),
        ));
        self
    }

    /// Identify this node's user by a Kerberos service ticket.
    pub fn kerberos_service_ticket(mut self, ticket: &[u8]) -> Self {
        self.identity = Some((
            UserIdentityType::KerberosServiceTicket,
            ticket.to_vec(),
            Vec::new(),
        ));
        self
    }

    /// Identify this node's user by a SAML assertion.
    pub fn saml_assertion(mut self, assertion: &str) -> Self {
        self.identity = Some((
            UserIdentityType::SamlAssertion,
            assertion.as_bytes().to_vec(),
            Vec::new(),
        ));
        self
    }

    /// Identify this node's user by a JSON web token.
    pub fn jwt(mut self, token: &str) -> Self {
        self.identity = Some((UserIdentityType::Jwt, token.as_bytes().to_vec(), Vec::new()));
        self
    }

    /// Ask the peer to acknowledge the user identity
    /// in its association response.
    pub fn request_identity_acknowledgement(mut self) -> Self {
        self.identity_ack_requested = true;
        self
    }

    /// Bound the wait for the association acknowledgement.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request = Some(timeout);
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

    /// Run the association worker on the given executor
    /// instead of a dedicated thread.
    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    /// Establish the association with the node at the given address.
    pub fn establish<T>(self, address: T) -> Result<Association>
    where
        T: ToSocketAddrs,
    {
        self.establish_impl(AeAddr::new_socket_addr(address))
    }

    /// Establish the association with the node at the given
    /// AE address, such as `"PACS@10.0.0.100:104"`.
    /// An AE title in the address overrides
    /// [`called_ae_title`](Self::called_ae_title).
    pub fn establish_with(self, ae_address: &str) -> Result<Association> {
        match AeAddr::try_from(ae_address) {
            Ok(address) => self.establish_impl(address),
            Err(_) => self.establish_impl(AeAddr::new_socket_addr(ae_address)),
        }
    }

    fn establish_impl<T>(self, address: AeAddr<T>) -> Result<Association>
    where
        T: ToSocketAddrs,
    {
        ensure!(
            !self.presentation_contexts.is_empty(),
            MissingAbstractSyntaxSnafu
        );
        let called_ae_title: String = address
            .ae_title()
            .map(str::to_string)
            .or_else(|| self.called_ae_title.as_ref().map(|ae| ae.to_string()))
            .unwrap_or_else(|| "ANY-SCP".to_string());

        let presentation_contexts: Vec<ProposedPresentationContext> = self
            .presentation_contexts
            .iter()
            .enumerate()
            .map(|(i, (abstract_syntax, transfer_syntaxes))| ProposedPresentationContext {
                // odd identifiers, one per proposal
                id: (i as u8) * 2 + 1,
                abstract_syntax: abstract_syntax.to_string(),
                transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
            })
            .collect();

        let mut user_variables = vec![
            UserVariable::MaxLength(self.max_pdu_length),
            UserVariable::ImplementationClassUid(IMPLEMENTATION_CLASS_UID.to_string()),
            UserVariable::ImplementationVersionName(IMPLEMENTATION_VERSION_NAME.to_string()),
        ];
        if (self.max_ops_invoked, self.max_ops_performed) != (1, 1) {
            user_variables.push(UserVariable::AsyncOperationsWindow {
                max_ops_invoked: self.max_ops_invoked,
                max_ops_performed: self.max_ops_performed,
            });
        }
        for role in &self.role_selections {
            user_variables.push(UserVariable::RoleSelection(role.clone()));
        }
        if let Some((identity_type, primary, secondary)) = &self.identity {
            user_variables.push(UserVariable::UserIdentity(UserIdentity::new(
                self.identity_ack_requested,
                *identity_type,
                primary.clone(),
                secondary.clone(),
            )));
        }

        let message = Pdu::AssociateRq(AssociateRq {
            protocol_version: self.protocol_version,
            calling_ae_title: self.calling_ae_title.to_string(),
            called_ae_title: called_ae_title.clone(),
            application_context_name: self.application_context_name.to_string(),
            presentation_contexts: presentation_contexts.clone(),
            user_variables,
        });

        let mut machine = Machine::new(Role::Requestor);
        machine.apply(Event::AssociateRequest);
        let mut socket = TcpStream::connect(address).context(ConnectSnafu)?;
        machine.apply(Event::TransportConnected);

        // the request timeout only applies to the handshake
        socket
            .set_read_timeout(self.timeouts.request)
            .context(ConfigureSocketSnafu)?;
        socket
            .set_write_timeout(self.timeouts.request)
            .context(ConfigureSocketSnafu)?;

        let mut buffer = Vec::with_capacity(512);
        write_pdu(&mut buffer, &message).context(SendRequestSnafu)?;
        socket.write_all(&buffer).context(WireSendSnafu)?;
        buffer.clear();

        // receive the response limited by the codec bound,
        // the peer has not seen our announced length yet
        let response = read_pdu(&mut socket, MAXIMUM_PDU_SIZE, self.strict)
            .context(ReceiveResponseSnafu)?;
        let Some(response) = response else {
            return ConnectionClosedSnafu.fail();
        };

        match response {
            Pdu::AssociateAc(acknowledgement) => {
                machine.apply(Event::AssociateAcReceived);
                if acknowledgement.protocol_version != self.protocol_version {
                    abort_handshake(&mut socket);
                    return ProtocolVersionMismatchSnafu {
                        expected: self.protocol_version,
                        got: acknowledgement.protocol_version,
                    }
                    .fail();
                }

                let peer_max_pdu_length = acknowledgement
                    .user_variables
                    .iter()
                    .find_map(|variable| match variable {
                        UserVariable::MaxLength(value) => Some(*value),
                        _ => None,
                    })
                    .unwrap_or_else(|| {
                        warn!("peer did not announce a maximum PDU length");
                        DEFAULT_MAX_PDU
                    });
                // 0 stands for no limit
                let peer_max_pdu_length = if peer_max_pdu_length == 0 {
                    MAXIMUM_PDU_SIZE
                } else {
                    peer_max_pdu_length
                };

                let max_ops_invoked = acknowledgement
                    .user_variables
                    .iter()
                    .find_map(|variable| match variable {
                        UserVariable::AsyncOperationsWindow {
                            max_ops_invoked, ..
                        } => Some(*max_ops_invoked),
                        _ => None,
                    })
                    .unwrap_or(1);

                let contexts = contexts_from_acknowledgement(
                    &presentation_contexts,
                    acknowledgement.presentation_contexts,
                    &acknowledgement.user_variables,
                );
                if !contexts.iter().any(|context| context.is_accepted()) {
                    abort_handshake(&mut socket);
                    return NoAcceptedPresentationContextsSnafu.fail();
                }
                debug!(
                    peer = %called_ae_title,
                    accepted = contexts.iter().filter(|c| c.is_accepted()).count(),
                    proposed = contexts.len(),
                    "association established"
                );

                socket.set_read_timeout(None).context(ConfigureSocketSnafu)?;
                socket
                    .set_write_timeout(None)
                    .context(ConfigureSocketSnafu)?;
                let transport = socket.into_transport().context(ConfigureSocketSnafu)?;

                AssociationSetup {
                    role: Role::Requestor,
                    machine,
                    transport,
                    contexts,
                    peer_ae_title: called_ae_title,
                    peer_max_pdu_length,
                    local_max_pdu_length: self.max_pdu_length,
                    strict: self.strict,
                    max_ops_invoked,
                    timeouts: self.timeouts,
                    handler: self.handler,
                    executor: self.executor,
                }
                .spawn()
            }
            Pdu::AssociateRj(rejection) => {
                machine.apply(Event::AssociateRjReceived);
                RejectedSnafu { rejection }.fail()
            }
            Pdu::Unknown { pdu_type, .. } => {
                abort_handshake(&mut socket);
                UnknownPduSnafu { pdu_type }.fail()
            }
            pdu => {
                abort_handshake(&mut socket);
                UnexpectedPduSnafu { pdu: Box::new(pdu) }.fail()
            }
        }
    }
}

/// Abort a half-established association, best effort.
fn abort_handshake(socket: &mut TcpStream) {
    let mut buffer = Vec::with_capacity(16);
    if write_pdu(
        &mut buffer,
        &Pdu::AbortRq {
            source: AbortSource::ServiceUser,
        },
    )
    .is_ok()
    {
        let _ = socket.write_all(&buffer);
    }
    let _ = socket.shutdown(std::net::Shutdown::Both);
}
