//! Protocol data unit module.
//!
//! This module comprises the data structures for all protocol data units
//! (PDUs) defined in the upper layer protocol,
//! from association negotiation to data transfer and release,
//! as well as the readers and writers
//! which translate them from and to their binary wire form.
pub mod reader;
pub mod writer;

use std::fmt::Display;

pub use reader::{
    read_pdu, DEFAULT_MAX_PDU, MAXIMUM_PDU_SIZE, MINIMUM_MAX_PDU, MINIMUM_PDU_SIZE,
    PDU_HEADER_SIZE,
};
pub use writer::write_pdu;

/// Message component for a proposed presentation context.
///
/// One or more of these items is sent by the association requestor,
/// each pairing an abstract syntax with the transfer syntaxes
/// that the requestor is able to use for it.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct ProposedPresentationContext {
    /// the presentation context identifier (odd, unique per association)
    pub id: u8,
    /// the abstract syntax UID
    /// (commonly referring to a SOP class)
    pub abstract_syntax: String,
    /// the transfer syntax UIDs proposed for this context
    pub transfer_syntaxes: Vec<String>,
}

/// Message component for the outcome of a single presentation context
/// negotiation, as sent by the association acceptor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PresentationContextResult {
    /// the presentation context identifier
    pub id: u8,
    /// the negotiation outcome
    pub result: ContextResult,
    /// the transfer syntax selected for this context
    /// (only meaningful on acceptance)
    pub transfer_syntax: String,
}

/// The result field of a presentation context negotiation.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum ContextResult {
    Acceptance = 0,
    UserRejection = 1,
    NoReason = 2,
    AbstractSyntaxNotSupported = 3,
    TransferSyntaxesNotSupported = 4,
}

impl ContextResult {
    fn from(result: u8) -> Option<ContextResult> {
        let out = match result {
            0 => ContextResult::Acceptance,
            1 => ContextResult::UserRejection,
            2 => ContextResult::NoReason,
            3 => ContextResult::AbstractSyntaxNotSupported,
            4 => ContextResult::TransferSyntaxesNotSupported,
            _ => return None,
        };

        Some(out)
    }
}

impl Display for ContextResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ContextResult::Acceptance => "acceptance",
            ContextResult::UserRejection => "user rejection",
            ContextResult::NoReason => "no reason",
            ContextResult::AbstractSyntaxNotSupported => "abstract syntax not supported",
            ContextResult::TransferSyntaxesNotSupported => "transfer syntaxes not supported",
        };
        f.write_str(msg)
    }
}

/// Whether an association rejection is permanent
/// or the request may be retried later.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum RejectResult {
    Permanent = 1,
    Transient = 2,
}

impl RejectResult {
    fn from(value: u8) -> Option<RejectResult> {
        match value {
            1 => Some(RejectResult::Permanent),
            2 => Some(RejectResult::Transient),
            _ => None,
        }
    }
}

/// The source of an association rejection,
/// together with the reason reported by that source.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum RejectSource {
    /// rejected by the service user (the peer application)
    ServiceUser(UserRejectReason),
    /// rejected by the ACSE related function of the service provider
    Acse(AcseRejectReason),
    /// rejected by the presentation related function of the service provider
    Presentation(PresentationRejectReason),
}

impl RejectSource {
    fn from(source: u8, reason: u8) -> Option<RejectSource> {
        let out = match (source, reason) {
            (1, 1) => RejectSource::ServiceUser(UserRejectReason::NoReasonGiven),
            (1, 2) => RejectSource::ServiceUser(UserRejectReason::ApplicationContextNotSupported),
            (1, 3) => RejectSource::ServiceUser(UserRejectReason::CallingAeTitleNotRecognized),
            (1, x) if (4..=6).contains(&x) => {
                RejectSource::ServiceUser(UserRejectReason::Reserved(x))
            }
            (1, 7) => RejectSource::ServiceUser(UserRejectReason::CalledAeTitleNotRecognized),
            (1, x) if (8..=10).contains(&x) => {
                RejectSource::ServiceUser(UserRejectReason::Reserved(x))
            }
            (1, _) => return None,
            (2, 1) => RejectSource::Acse(AcseRejectReason::NoReasonGiven),
            (2, 2) => RejectSource::Acse(AcseRejectReason::ProtocolVersionNotSupported),
            (2, _) => return None,
            (3, 0) => RejectSource::Presentation(PresentationRejectReason::Reserved(0)),
            (3, 1) => RejectSource::Presentation(PresentationRejectReason::TemporaryCongestion),
            (3, 2) => RejectSource::Presentation(PresentationRejectReason::LocalLimitExceeded),
            (3, x) if (3..=7).contains(&x) => {
                RejectSource::Presentation(PresentationRejectReason::Reserved(x))
            }
            _ => return None,
        };
        Some(out)
    }

    /// The numeric (source, reason) pair for this rejection.
    pub fn codes(&self) -> (u8, u8) {
        match self {
            RejectSource::ServiceUser(reason) => {
                let r = match reason {
                    UserRejectReason::NoReasonGiven => 1,
                    UserRejectReason::ApplicationContextNotSupported => 2,
                    UserRejectReason::CallingAeTitleNotRecognized => 3,
                    UserRejectReason::CalledAeTitleNotRecognized => 7,
                    UserRejectReason::Reserved(x) => *x,
                };
                (1, r)
            }
            RejectSource::Acse(reason) => {
                let r = match reason {
                    AcseRejectReason::NoReasonGiven => 1,
                    AcseRejectReason::ProtocolVersionNotSupported => 2,
                };
                (2, r)
            }
            RejectSource::Presentation(reason) => {
                let r = match reason {
                    PresentationRejectReason::TemporaryCongestion => 1,
                    PresentationRejectReason::LocalLimitExceeded => 2,
                    PresentationRejectReason::Reserved(x) => *x,
                };
                (3, r)
            }
        }
    }
}

impl Display for RejectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectSource::ServiceUser(r) => Display::fmt(r, f),
            RejectSource::Acse(r) => Display::fmt(r, f),
            RejectSource::Presentation(r) => Display::fmt(r, f),
        }
    }
}

/// Rejection reasons reported by the service user.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserRejectReason {
    NoReasonGiven,
    ApplicationContextNotSupported,
    CallingAeTitleNotRecognized,
    CalledAeTitleNotRecognized,
    Reserved(u8),
}

impl Display for UserRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UserRejectReason::NoReasonGiven => f.write_str("no reason given"),
            UserRejectReason::ApplicationContextNotSupported => {
                f.write_str("application context name not supported")
            }
            UserRejectReason::CallingAeTitleNotRecognized => {
                f.write_str("calling AE title not recognized")
            }
            UserRejectReason::CalledAeTitleNotRecognized => {
                f.write_str("called AE title not recognized")
            }
            UserRejectReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// Rejection reasons reported by the ACSE related function.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AcseRejectReason {
    NoReasonGiven,
    ProtocolVersionNotSupported,
}

impl Display for AcseRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcseRejectReason::NoReasonGiven => f.write_str("no reason given"),
            AcseRejectReason::ProtocolVersionNotSupported => {
                f.write_str("protocol version not supported")
            }
        }
    }
}

/// Rejection reasons reported by the presentation related function.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PresentationRejectReason {
    TemporaryCongestion,
    LocalLimitExceeded,
    Reserved(u8),
}

impl Display for PresentationRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PresentationRejectReason::TemporaryCongestion => f.write_str("temporary congestion"),
            PresentationRejectReason::LocalLimitExceeded => f.write_str("local limit exceeded"),
            PresentationRejectReason::Reserved(code) => write!(f, "reserved code {}", code),
        }
    }
}

/// A presentation data value fragment,
/// one of possibly several carried by a single P-DATA-TF PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct PDataValue {
    /// the identifier of the presentation context governing this fragment
    pub context_id: u8,
    /// whether the fragment carries command set or data set bytes
    pub kind: PdvKind,
    /// whether this is the last fragment of its message
    pub is_last: bool,
    /// the fragment payload
    pub data: Vec<u8>,
}

/// The kind of content in a presentation data value fragment.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PdvKind {
    Command,
    Data,
}

/// The source of an association abort,
/// with the reason when reported by the service provider.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum AbortSource {
    /// abort initiated by the service user
    ServiceUser,
    /// abort initiated by the service provider
    ServiceProvider(ProviderAbortReason),
    /// reserved source code 1
    Reserved,
}

impl AbortSource {
    fn from(source: u8, reason: u8) -> Option<AbortSource> {
        let out = match (source, reason) {
            (0, _) => AbortSource::ServiceUser,
            (1, _) => AbortSource::Reserved,
            (2, 0) => AbortSource::ServiceProvider(ProviderAbortReason::NotSpecified),
            (2, 1) => AbortSource::ServiceProvider(ProviderAbortReason::UnrecognizedPdu),
            (2, 2) => AbortSource::ServiceProvider(ProviderAbortReason::UnexpectedPdu),
            (2, 3) => AbortSource::ServiceProvider(ProviderAbortReason::Reserved),
            (2, 4) => AbortSource::ServiceProvider(ProviderAbortReason::UnrecognizedPduParameter),
            (2, 5) => AbortSource::ServiceProvider(ProviderAbortReason::UnexpectedPduParameter),
            (2, 6) => AbortSource::ServiceProvider(ProviderAbortReason::InvalidPduParameter),
            (_, _) => return None,
        };

        Some(out)
    }

    /// The numeric (source, reason) pair for this abort.
    pub fn codes(&self) -> (u8, u8) {
        match self {
            AbortSource::ServiceUser => (0, 0),
            AbortSource::Reserved => (1, 0),
            AbortSource::ServiceProvider(reason) => {
                let r = match reason {
                    ProviderAbortReason::NotSpecified => 0,
                    ProviderAbortReason::UnrecognizedPdu => 1,
                    ProviderAbortReason::UnexpectedPdu => 2,
                    ProviderAbortReason::Reserved => 3,
                    ProviderAbortReason::UnrecognizedPduParameter => 4,
                    ProviderAbortReason::UnexpectedPduParameter => 5,
                    ProviderAbortReason::InvalidPduParameter => 6,
                };
                (2, r)
            }
        }
    }
}

/// An enumeration of the abort reasons
/// which the service provider may report.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum ProviderAbortReason {
    /// Reason not specified
    NotSpecified,
    /// Unrecognized PDU
    UnrecognizedPdu,
    /// Unexpected PDU
    UnexpectedPdu,
    /// Reserved
    Reserved,
    /// Unrecognized PDU parameter
    UnrecognizedPduParameter,
    /// Unexpected PDU parameter
    UnexpectedPduParameter,
    /// Invalid PDU parameter
    InvalidPduParameter,
}

impl Display for ProviderAbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ProviderAbortReason::NotSpecified => "reason not specified",
            ProviderAbortReason::UnrecognizedPdu => "unrecognized PDU",
            ProviderAbortReason::UnexpectedPdu => "unexpected PDU",
            ProviderAbortReason::Reserved => "reserved code",
            ProviderAbortReason::UnrecognizedPduParameter => "unrecognized PDU parameter",
            ProviderAbortReason::UnexpectedPduParameter => "unexpected PDU parameter",
            ProviderAbortReason::InvalidPduParameter => "invalid PDU parameter",
        };
        f.write_str(msg)
    }
}

/// A variable item read from the body of an association PDU.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum PduItem {
    Unknown(u8),
    ApplicationContext(String),
    ProposedPresentationContext(ProposedPresentationContext),
    PresentationContextResult(PresentationContextResult),
    UserVariables(Vec<UserVariable>),
}

/// A sub-item of the user information item.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub enum UserVariable {
    /// Maximum length of P-DATA-TF PDUs which the sender can receive,
    /// where 0 means no limit
    MaxLength(u32),
    /// Implementation class UID of the sender
    ImplementationClassUid(String),
    /// Implementation version name of the sender
    ImplementationVersionName(String),
    /// Maximum number of operations which the sender
    /// may invoke and perform asynchronously,
    /// where 0 means no limit
    AsyncOperationsWindow {
        max_ops_invoked: u16,
        max_ops_performed: u16,
    },
    /// SCP/SCU role selection for one abstract syntax
    RoleSelection(RoleSelection),
    /// Service class application information for one SOP class
    SopClassExtendedNegotiation(String, Vec<u8>),
    /// Relationship of one SOP class to a service class
    /// and to related general SOP classes
    SopClassCommonExtended(CommonExtendedNegotiation),
    /// User identity of the requestor
    UserIdentity(UserIdentity),
    /// Server response to a positive identity acknowledgement request
    UserIdentityResponse(Vec<u8>),
    /// A sub-item not recognized by this implementation,
    /// kept with its raw item type and content
    Unknown(u8, Vec<u8>),
}

/// Message component for SCP/SCU role selection of one abstract syntax.
///
/// In a request, `scu`/`scp` state the roles which the requestor proposes
/// to take; in an acknowledgement, the roles which the acceptor grants.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct RoleSelection {
    /// the SOP class (abstract syntax) UID to which the roles apply
    pub sop_class_uid: String,
    /// whether the association requestor acts as an SCU
    pub scu: bool,
    /// whether the association requestor acts as an SCP
    pub scp: bool,
}

/// Message component relating a SOP class to its service class
/// and related general SOP classes,
/// used when negotiating by conformance rather than by exact SOP class.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct CommonExtendedNegotiation {
    /// the SOP class UID
    pub sop_class_uid: String,
    /// the service class UID which the SOP class conforms to
    pub service_class_uid: String,
    /// related general SOP class UIDs
    pub related_general_sop_classes: Vec<String>,
}

/// Message component for the identity of the association requestor.
#[derive(Clone, Eq, PartialEq, PartialOrd, Hash, Debug)]
pub struct UserIdentity {
    positive_response_requested: bool,
    identity_type: UserIdentityType,
    primary_field: Vec<u8>,
    secondary_field: Vec<u8>,
}

impl UserIdentity {
    pub fn new(
        positive_response_requested: bool,
        identity_type: UserIdentityType,
        primary_field: Vec<u8>,
        secondary_field: Vec<u8>,
    ) -> Self {
        UserIdentity {
            positive_response_requested,
            identity_type,
            primary_field,
            secondary_field,
        }
    }

    pub fn positive_response_requested(&self) -> bool {
        self.positive_response_requested
    }

    pub fn identity_type(&self) -> UserIdentityType {
        self.identity_type
    }

    pub fn primary_field(&self) -> Vec<u8> {
        self.primary_field.clone()
    }

    pub fn secondary_field(&self) -> Vec<u8> {
        self.secondary_field.clone()
    }
}

/// The form of user identity being provided.
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Hash, Debug)]
#[non_exhaustive]
pub enum UserIdentityType {
    /// Username as a UTF-8 string
    Username,
    /// Username as a UTF-8 string and passcode
    UsernamePasscode,
    /// Kerberos service ticket
    KerberosServiceTicket,
    /// SAML assertion
    SamlAssertion,
    /// JSON web token
    Jwt,
}

impl UserIdentityType {
    fn from(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Username),
            2 => Some(Self::UsernamePasscode),
            3 => Some(Self::KerberosServiceTicket),
            4 => Some(Self::SamlAssertion),
            5 => Some(Self::Jwt),
            _ => None,
        }
    }

    fn code(self) -> u8 {
        match self {
            Self::Username => 1,
            Self::UsernamePasscode => 2,
            Self::KerberosServiceTicket => 3,
            Self::SamlAssertion => 4,
            Self::Jwt => 5,
        }
    }
}

/// An in-memory representation of a full protocol data unit.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Hash)]
pub enum Pdu {
    /// Association request (A-ASSOCIATE-RQ)
    AssociateRq(AssociateRq),
    /// Association acknowledgement (A-ASSOCIATE-AC)
    AssociateAc(AssociateAc),
    /// Association rejection (A-ASSOCIATE-RJ)
    AssociateRj(AssociateRj),
    /// Data transfer (P-DATA-TF)
    PData { data: Vec<PDataValue> },
    /// Association release request (A-RELEASE-RQ)
    ReleaseRq,
    /// Association release reply (A-RELEASE-RP)
    ReleaseRp,
    /// Association abort (A-ABORT)
    AbortRq { source: AbortSource },
    /// A PDU of unrecognized type
    Unknown { pdu_type: u8, data: Vec<u8> },
}

impl Pdu {
    /// Provide a short description of the PDU,
    /// which never prints data payloads in full.
    pub fn short_description(&self) -> impl std::fmt::Display + '_ {
        PduShortDescription(self)
    }
}

struct PduShortDescription<'a>(&'a Pdu);

impl std::fmt::Display for PduShortDescription<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Pdu::Unknown { pdu_type, data } => {
                write!(
                    f,
                    "Unknown {{ pdu_type: {}, data: {} bytes }}",
                    pdu_type,
                    data.len()
                )
            }
            Pdu::AssociateRq(rq) => {
                write!(
                    f,
                    "AssociateRq {{ calling: {:?}, called: {:?}, {} presentation contexts }}",
                    rq.calling_ae_title,
                    rq.called_ae_title,
                    rq.presentation_contexts.len(),
                )
            }
            Pdu::AssociateAc(ac) => {
                write!(
                    f,
                    "AssociateAc {{ calling: {:?}, called: {:?}, {} presentation contexts }}",
                    ac.calling_ae_title,
                    ac.called_ae_title,
                    ac.presentation_contexts.len(),
                )
            }
            Pdu::AssociateRj { .. } | Pdu::ReleaseRq | Pdu::ReleaseRp | Pdu::AbortRq { .. } => {
                std::fmt::Debug::fmt(self.0, f)
            }
            Pdu::PData { data } => {
                if data.len() == 1 {
                    write!(f, "PData [({:?}, {} bytes)]", data[0].kind, data[0].data.len())
                } else if data.len() == 2 {
                    write!(
                        f,
                        "PData [({:?}, {} bytes), ({:?}, {} bytes)]",
                        data[0].kind,
                        data[0].data.len(),
                        data[1].kind,
                        data[1].data.len(),
                    )
                } else {
                    write!(f, "PData [{} p-data values]", data.len())
                }
            }
        }
    }
}

/// An in-memory representation of an association request.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociateRq {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<ProposedPresentationContext>,
    pub user_variables: Vec<UserVariable>,
}

impl From<AssociateRq> for Pdu {
    fn from(value: AssociateRq) -> Self {
        Pdu::AssociateRq(value)
    }
}

/// An in-memory representation of an association acknowledgement.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociateAc {
    pub protocol_version: u16,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub application_context_name: String,
    pub presentation_contexts: Vec<PresentationContextResult>,
    pub user_variables: Vec<UserVariable>,
}

impl From<AssociateAc> for Pdu {
    fn from(value: AssociateAc) -> Self {
        Pdu::AssociateAc(value)
    }
}

/// An in-memory representation of an association rejection.
#[derive(Debug, Clone, Eq, Hash, PartialEq, PartialOrd)]
pub struct AssociateRj {
    pub result: RejectResult,
    pub source: RejectSource,
}

impl From<AssociateRj> for Pdu {
    fn from(value: AssociateRj) -> Self {
        Pdu::AssociateRj(value)
    }
}

#[cfg(test)]
mod tests {
    use super::{AbortSource, PDataValue, Pdu, PdvKind, RejectSource};

    #[test]
    fn pdu_short_description() {
        let pdu = Pdu::AbortRq {
            source: AbortSource::ServiceUser,
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "AbortRq { source: ServiceUser }",
        );

        let pdu = Pdu::PData {
            data: vec![PDataValue {
                is_last: true,
                context_id: 2,
                kind: PdvKind::Data,
                data: vec![0x55; 384],
            }],
        };
        assert_eq!(
            &pdu.short_description().to_string(),
            "PData [(Data, 384 bytes)]",
        );
    }

    #[test]
    fn reject_and_abort_codes_roundtrip() {
        for source in 1..=3_u8 {
            for reason in 0..=10_u8 {
                if let Some(parsed) = RejectSource::from(source, reason) {
                    assert_eq!(parsed.codes(), (source, reason));
                }
            }
        }

        for source in 0..=2_u8 {
            for reason in 0..=6_u8 {
                let parsed = AbortSource::from(source, reason).unwrap();
                let (s, r) = parsed.codes();
                assert_eq!(s, source);
                if source == 2 {
                    assert_eq!(r, reason);
                }
            }
        }
    }
}
