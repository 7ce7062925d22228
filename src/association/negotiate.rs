//! Presentation context and capability negotiation.
//!
//! The association acceptor matches every proposed presentation context
//! against a table of local [capabilities](Capability).
//! A capability is looked up by abstract syntax,
//! falling back from the exact SOP class
//! to the related general SOP classes and the service class UID
//! announced through common extended negotiation,
//! and finally to the wildcard `"*"`.
//! The remaining sub-negotiations (role selection,
//! extended negotiation and the asynchronous operations window)
//! always intersect what was proposed with what the capability allows,
//! never extending it.

use std::borrow::Cow;

use dicom_dictionary_std::uids;
use dicom_encoding::transfer_syntax::TransferSyntaxIndex;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use tracing::warn;

use super::uid::trim_uid;
use crate::pdu::{
    AssociateRq, CommonExtendedNegotiation, ContextResult, PresentationContextResult,
    ProposedPresentationContext, RoleSelection, UserVariable,
};

/// What this node is able to serve for one abstract syntax.
///
/// The abstract syntax may name a SOP class,
/// a service class UID matched through common extended negotiation,
/// or the wildcard `"*"` which matches any proposal.
#[derive(Debug, Clone, PartialEq)]
pub struct Capability {
    abstract_syntax: Cow<'static, str>,
    transfer_syntaxes: Vec<Cow<'static, str>>,
    scu: bool,
    scp: bool,
    extended: Vec<u8>,
}

impl Capability {
    /// Declare a capability for the given abstract syntax,
    /// acting as a service class provider,
    /// admitting any transfer syntax supported by the
    /// main transfer syntax registry.
    pub fn new<T>(abstract_syntax: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        Capability {
            abstract_syntax: trim_uid(abstract_syntax.into()),
            transfer_syntaxes: Vec::new(),
            scu: false,
            scp: true,
            extended: Vec::new(),
        }
    }

    /// Restrict the admitted transfer syntaxes to the ones given.
    ///
    /// An entry `"*"` admits any transfer syntax
    /// supported by the main transfer syntax registry,
    /// which is also the behavior when no transfer syntax is given.
    pub fn with_transfer_syntax<T>(mut self, transfer_syntax_uid: T) -> Self
    where
        T: Into<Cow<'static, str>>,
    {
        self.transfer_syntaxes
            .push(trim_uid(transfer_syntax_uid.into()));
        self
    }

    /// Declare whether this node may invoke operations (act as SCU)
    /// under this abstract syntax.
    pub fn scu(mut self, scu: bool) -> Self {
        self.scu = scu;
        self
    }

    /// Declare whether this node may perform operations (act as SCP)
    /// under this abstract syntax.
    pub fn scp(mut self, scp: bool) -> Self {
        self.scp = scp;
        self
    }

    /// Declare the service class options supported for this
    /// abstract syntax, one byte per option flag.
    ///
    /// Extended negotiation proposals are intersected with these bytes
    /// and echoed back; without them, proposals are not answered.
    pub fn with_extended_negotiation(mut self, options: Vec<u8>) -> Self {
        self.extended = options;
        self
    }

    /// The abstract syntax UID this capability applies to.
    pub fn abstract_syntax(&self) -> &str {
        &self.abstract_syntax
    }
}

/// One presentation context with its negotiation outcome
/// and the roles granted to this node.
#[derive(Debug, Clone, PartialEq)]
pub struct NegotiatedContext {
    /// the presentation context ID, as proposed
    pub id: u8,
    /// the negotiation result
    pub result: ContextResult,
    /// the abstract syntax proposed for this context
    pub abstract_syntax: String,
    /// the accepted transfer syntax
    /// (implicit VR little endian when the context was refused)
    pub transfer_syntax: String,
    /// whether this node may invoke operations on this context
    pub scu: bool,
    /// whether this node may perform operations on this context
    pub scp: bool,
}

impl NegotiatedContext {
    /// Whether this context may carry data.
    pub fn is_accepted(&self) -> bool {
        self.result == ContextResult::Acceptance
    }
}

/// The full outcome of negotiating one association request.
#[derive(Debug)]
pub(crate) struct NegotiationOutcome {
    /// every proposed context with its result, in proposal order
    pub contexts: Vec<NegotiatedContext>,
    /// sub-negotiation replies to carry in the acknowledgement
    pub reply_variables: Vec<UserVariable>,
    /// granted bound on operations invoked by this node, 0 for no bound
    pub max_ops_invoked: u16,
    /// granted bound on operations performed by this node, 0 for no bound
    pub max_ops_performed: u16,
}

/// Capability resolution over the local table
/// plus the peer's common extended negotiation items.
struct CapabilityLookup<'a> {
    capabilities: &'a [Capability],
    common_extended: Vec<&'a CommonExtendedNegotiation>,
    promiscuous: Option<Capability>,
}

impl CapabilityLookup<'_> {
    fn find(&self, abstract_syntax: &str) -> Option<&Capability> {
        let by_uid = |uid: &str| {
            self.capabilities
                .iter()
                .find(|capability| capability.abstract_syntax == uid)
        };

        if let Some(capability) = by_uid(abstract_syntax) {
            return Some(capability);
        }
        let common = self
            .common_extended
            .iter()
            .find(|item| trim_uid(Cow::from(item.sop_class_uid.as_str())) == abstract_syntax);
        if let Some(item) = common {
            for related in &item.related_general_sop_classes {
                if let Some(capability) = by_uid(trim_uid(Cow::from(related.as_str())).as_ref()) {
                    return Some(capability);
                }
            }
            let service_class = trim_uid(Cow::from(item.service_class_uid.as_str()));
            if let Some(capability) = by_uid(service_class.as_ref()) {
                return Some(capability);
            }
        }
        by_uid("*").or(self.promiscuous.as_ref())
    }
}

/// Combine two asynchronous operation bounds,
/// where 0 stands for no bound.
fn combine_window(proposed: u16, local: u16) -> u16 {
    match (proposed, local) {
        (0, n) | (n, 0) => n,
        (a, b) => a.min(b),
    }
}

/// Negotiate an association request against the local capability table.
///
/// `fallback_transfer_syntaxes` applies to capabilities
/// which do not restrict their own transfer syntaxes.
/// With `promiscuous` set, proposals for unknown abstract syntaxes
/// are accepted as if a wildcard provider capability had been declared.
pub(crate) fn negotiate_association(
    request: &AssociateRq,
    capabilities: &[Capability],
    fallback_transfer_syntaxes: &[Cow<'static, str>],
    promiscuous: bool,
    local_max_ops_invoked: u16,
    local_max_ops_performed: u16,
) -> NegotiationOutcome {
    let lookup = CapabilityLookup {
        capabilities,
        common_extended: request
            .user_variables
            .iter()
            .filter_map(|variable| match variable {
                UserVariable::SopClassCommonExtended(item) => Some(item),
                _ => None,
            })
            .collect(),
        promiscuous: promiscuous.then(|| Capability {
            abstract_syntax: "*".into(),
            transfer_syntaxes: Vec::new(),
            scu: false,
            scp: true,
            extended: Vec::new(),
        }),
    };

    let role_proposals: Vec<&RoleSelection> = request
        .user_variables
        .iter()
        .filter_map(|variable| match variable {
            UserVariable::RoleSelection(role) => Some(role),
            _ => None,
        })
        .collect();

    let contexts: Vec<_> = request
        .presentation_contexts
        .iter()
        .map(|pc| negotiate_context(pc, &lookup, fallback_transfer_syntaxes, &role_proposals))
        .collect();

    let mut reply_variables = Vec::new();

    // grant the proposed roles which the capability table allows
    for role in &role_proposals {
        let uid = trim_uid(Cow::from(role.sop_class_uid.as_str()));
        if let Some(capability) = lookup.find(&uid) {
            reply_variables.push(UserVariable::RoleSelection(RoleSelection {
                sop_class_uid: uid.into_owned(),
                scu: role.scu && capability.scp,
                scp: role.scp && capability.scu,
            }));
        }
    }

    // intersect extended negotiation proposals, echo only on a match
    for variable in &request.user_variables {
        if let UserVariable::SopClassExtendedNegotiation(sop_class_uid, proposed) = variable {
            let uid = trim_uid(Cow::from(sop_class_uid.as_str()));
            let supported = lookup
                .find(&uid)
                .map(|capability| capability.extended.as_slice())
                .unwrap_or_default();
            if supported.is_empty() {
                continue;
            }
            let granted: Vec<u8> = proposed.iter().zip(supported).map(|(a, b)| a & b).collect();
            reply_variables.push(UserVariable::SopClassExtendedNegotiation(
                uid.into_owned(),
                granted,
            ));
        }
    }

    let window = request
        .user_variables
        .iter()
        .find_map(|variable| match variable {
            UserVariable::AsyncOperationsWindow {
                max_ops_invoked,
                max_ops_performed,
            } => Some((*max_ops_invoked, *max_ops_performed)),
            _ => None,
        });
    // the peer invokes at most what this node can perform,
    // and this node invokes at most what the peer can perform
    let (max_ops_performed, max_ops_invoked) = match window {
        Some((peer_invokes, peer_performs)) => {
            let granted_invoked = combine_window(peer_invokes, local_max_ops_performed);
            let granted_performed = combine_window(peer_performs, local_max_ops_invoked);
            reply_variables.push(UserVariable::AsyncOperationsWindow {
                max_ops_invoked: granted_invoked,
                max_ops_performed: granted_performed,
            });
            (granted_invoked, granted_performed)
        }
        // without the sub-item, one operation at a time each way
        None => (1, 1),
    };

    // acknowledge the user identity when asked to
    for variable in &request.user_variables {
        if let UserVariable::UserIdentity(identity) = variable {
            if identity.positive_response_requested() {
                reply_variables.push(UserVariable::UserIdentityResponse(Vec::new()));
            }
        }
    }

    NegotiationOutcome {
        contexts,
        reply_variables,
        max_ops_invoked,
        max_ops_performed,
    }
}

fn negotiate_context(
    pc: &ProposedPresentationContext,
    lookup: &CapabilityLookup<'_>,
    fallback_transfer_syntaxes: &[Cow<'static, str>],
    role_proposals: &[&RoleSelection],
) -> NegotiatedContext {
    let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str())).into_owned();

    let capability = match lookup.find(&abstract_syntax) {
        Some(capability) => capability,
        None => {
            return NegotiatedContext {
                id: pc.id,
                result: ContextResult::AbstractSyntaxNotSupported,
                abstract_syntax,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
                scu: false,
                scp: false,
            }
        }
    };

    let chosen =
        choose_transfer_syntax(capability, fallback_transfer_syntaxes, &pc.transfer_syntaxes);
    let (transfer_syntax, result) = match chosen {
        Some(ts) => (ts, ContextResult::Acceptance),
        None => (
            uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            ContextResult::TransferSyntaxesNotSupported,
        ),
    };

    // this node performs what the peer invokes and the other way around
    let (scu, scp) = match role_proposals
        .iter()
        .find(|role| trim_uid(Cow::from(role.sop_class_uid.as_str())) == abstract_syntax)
    {
        Some(role) => (role.scp && capability.scu, role.scu && capability.scp),
        None => (false, capability.scp),
    };

    NegotiatedContext {
        id: pc.id,
        result,
        abstract_syntax,
        transfer_syntax,
        scu,
        scp,
    }
}

/// From the proposed transfer syntaxes, in proposal order,
/// choose the first which the capability admits
/// and the main transfer syntax registry supports.
fn choose_transfer_syntax(
    capability: &Capability,
    fallback: &[Cow<'static, str>],
    proposed: &[String],
) -> Option<String> {
    let admitted: &[Cow<'static, str>] = if capability.transfer_syntaxes.is_empty() {
        fallback
    } else {
        &capability.transfer_syntaxes
    };
    if admitted.is_empty() || admitted.iter().any(|ts| ts == "*") {
        return choose_supported(proposed.iter())
            .map(|ts| trim_uid(Cow::from(ts.as_str())).into_owned());
    }
    proposed
        .iter()
        .map(|ts| trim_uid(Cow::from(ts.as_str())))
        .find(|ts| admitted.iter().any(|adm| adm.as_ref() == ts.as_ref()) && is_supported(ts))
        .map(Cow::into_owned)
}

/// Derive the negotiated contexts on the requestor side
/// from the acknowledged results and sub-negotiation replies.
///
/// Results for context IDs which were never proposed are dropped
/// with a warning.
pub(crate) fn contexts_from_acknowledgement(
    proposed: &[ProposedPresentationContext],
    results: Vec<PresentationContextResult>,
    reply_variables: &[UserVariable],
) -> Vec<NegotiatedContext> {
    let role_replies: Vec<&RoleSelection> = reply_variables
        .iter()
        .filter_map(|variable| match variable {
            UserVariable::RoleSelection(role) => Some(role),
            _ => None,
        })
        .collect();

    results
        .into_iter()
        .filter_map(|result| {
            let Some(pc) = proposed.iter().find(|pc| pc.id == result.id) else {
                warn!(
                    "acknowledgement for unknown presentation context {}, ignoring",
                    result.id
                );
                return None;
            };
            let abstract_syntax = trim_uid(Cow::from(pc.abstract_syntax.as_str())).into_owned();
            // the requestor invokes by default,
            // unless an explicit role selection was granted
            let (scu, scp) = match role_replies
                .iter()
                .find(|role| trim_uid(Cow::from(role.sop_class_uid.as_str())) == abstract_syntax)
            {
                Some(role) => (role.scu, role.scp),
                None => (true, false),
            };
            Some(NegotiatedContext {
                id: result.id,
                result: result.result,
                abstract_syntax,
                transfer_syntax: trim_uid(Cow::from(result.transfer_syntax)).into_owned(),
                scu,
                scp,
            })
        })
        .collect()
}

/// Check that a transfer syntax repository supports the
/// given transfer syntax, meaning that data sets
/// encoded with it can be read and written.
pub fn is_supported_with_repo<R>(ts_repo: R, ts_uid: &str) -> bool
where
    R: TransferSyntaxIndex,
{
    ts_repo
        .get(ts_uid)
        .filter(|ts| !ts.is_unsupported())
        .is_some()
}

/// Check that the main transfer syntax registry supports the
/// given transfer syntax.
///
/// ```
/// // Implicit VR Little Endian is always supported
/// assert!(dicom_net::association::is_supported("1.2.840.10008.1.2"));
/// ```
pub fn is_supported(ts_uid: &str) -> bool {
    is_supported_with_repo(TransferSyntaxRegistry, ts_uid)
}

/// From a sequence of transfer syntaxes,
/// choose the first one supported by the given repository.
pub fn choose_supported_with_repo<R, I, T>(ts_repo: R, it: I) -> Option<T>
where
    R: TransferSyntaxIndex,
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter()
        .find(|ts| is_supported_with_repo(&ts_repo, ts.as_ref()))
}

/// From a sequence of transfer syntaxes,
/// choose the first one supported by the main registry.
pub fn choose_supported<I, T>(it: I) -> Option<T>
where
    I: IntoIterator<Item = T>,
    T: AsRef<str>,
{
    it.into_iter().find(|ts| is_supported(ts.as_ref()))
}

#[cfg(test)]
mod tests {
    use dicom_dictionary_std::uids;

    use super::*;
    use crate::pdu::UserIdentity;
    use crate::pdu::UserIdentityType;

    fn request(
        contexts: Vec<ProposedPresentationContext>,
        user_variables: Vec<UserVariable>,
    ) -> AssociateRq {
        AssociateRq {
            protocol_version: 1,
            calling_ae_title: "CALLING".to_string(),
            called_ae_title: "CALLED".to_string(),
            application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
            presentation_contexts: contexts,
            user_variables,
        }
    }

    fn proposal(
        id: u8,
        abstract_syntax: &str,
        transfer_syntaxes: &[&str],
    ) -> ProposedPresentationContext {
        ProposedPresentationContext {
            id,
            abstract_syntax: abstract_syntax.to_string(),
            transfer_syntaxes: transfer_syntaxes.iter().map(|ts| ts.to_string()).collect(),
        }
    }

    fn negotiate(request: &AssociateRq, capabilities: &[Capability]) -> NegotiationOutcome {
        negotiate_association(request, capabilities, &[], false, 1, 1)
    }

    #[test]
    fn unknown_abstract_syntax_is_refused_with_code_3() {
        let capabilities = [Capability::new(uids::VERIFICATION)];
        let rq = request(
            vec![proposal(1, "1.2.999.1", &[uids::IMPLICIT_VR_LITTLE_ENDIAN])],
            vec![],
        );
        let outcome = negotiate(&rq, &capabilities);
        assert_eq!(outcome.contexts.len(), 1);
        assert_eq!(
            outcome.contexts[0].result,
            ContextResult::AbstractSyntaxNotSupported
        );
        assert!(!outcome.contexts[0].scp);
    }

    #[test]
    fn disjoint_transfer_syntaxes_are_refused_with_code_4() {
        let capabilities = [Capability::new(uids::VERIFICATION)
            .with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)];
        let rq = request(
            vec![proposal(
                1,
                uids::VERIFICATION,
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            )],
            vec![],
        );
        let outcome = negotiate(&rq, &capabilities);
        assert_eq!(
            outcome.contexts[0].result,
            ContextResult::TransferSyntaxesNotSupported
        );
    }

    #[test]
    fn first_proposed_transfer_syntax_in_common_wins() {
        // proposing [unknown, explicit] against [explicit, implicit]
        let capabilities = [Capability::new(uids::VERIFICATION)
            .with_transfer_syntax(uids::EXPLICIT_VR_LITTLE_ENDIAN)
            .with_transfer_syntax(uids::IMPLICIT_VR_LITTLE_ENDIAN)];
        let rq = request(
            vec![proposal(
                1,
                uids::VERIFICATION,
                &["1.2.999.5", uids::EXPLICIT_VR_LITTLE_ENDIAN],
            )],
            vec![],
        );
        let outcome = negotiate(&rq, &capabilities);
        assert_eq!(outcome.contexts[0].result, ContextResult::Acceptance);
        assert_eq!(
            outcome.contexts[0].transfer_syntax,
            uids::EXPLICIT_VR_LITTLE_ENDIAN
        );
    }

    #[test]
    fn sop_class_falls_back_through_common_extended_negotiation() {
        let capabilities = [
            Capability::new("1.2.840.10008.5.1.4.1.1.7"),
            Capability::new("1.2.840.10008.4.2"),
        ];
        // first proposal matches a related general SOP class,
        // second matches the service class itself
        let rq = request(
            vec![
                proposal(1, "1.2.999.7", &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
                proposal(3, "1.2.999.8", &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
            ],
            vec![
                UserVariable::SopClassCommonExtended(CommonExtendedNegotiation {
                    sop_class_uid: "1.2.999.7".to_string(),
                    service_class_uid: "1.2.840.10008.4.2".to_string(),
                    related_general_sop_classes: vec!["1.2.840.10008.5.1.4.1.1.7".to_string()],
                }),
                UserVariable::SopClassCommonExtended(CommonExtendedNegotiation {
                    sop_class_uid: "1.2.999.8".to_string(),
                    service_class_uid: "1.2.840.10008.4.2".to_string(),
                    related_general_sop_classes: vec![],
                }),
            ],
        );
        let outcome = negotiate(&rq, &capabilities);
        assert_eq!(outcome.contexts[0].result, ContextResult::Acceptance);
        assert_eq!(outcome.contexts[1].result, ContextResult::Acceptance);
    }

    #[test]
    fn wildcard_capability_accepts_any_abstract_syntax() {
        let capabilities = [Capability::new("*")];
        let rq = request(
            vec![proposal(1, "1.2.999.9", &[uids::IMPLICIT_VR_LITTLE_ENDIAN])],
            vec![],
        );
        let outcome = negotiate(&rq, &capabilities);
        assert_eq!(outcome.contexts[0].result, ContextResult::Acceptance);
        assert_eq!(
            outcome.contexts[0].transfer_syntax,
            uids::IMPLICIT_VR_LITTLE_ENDIAN
        );
    }

    #[test]
    fn role_selection_grants_are_intersected() {
        let capabilities = [Capability::new(uids::VERIFICATION).scu(true)];
        // the peer proposes to act as SCP only
        let rq = request(
            vec![proposal(
                1,
                uids::VERIFICATION,
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            )],
            vec![UserVariable::RoleSelection(RoleSelection {
                sop_class_uid: uids::VERIFICATION.to_string(),
                scu: false,
                scp: true,
            })],
        );
        let outcome = negotiate(&rq, &capabilities);

        let granted = outcome
            .reply_variables
            .iter()
            .find_map(|variable| match variable {
                UserVariable::RoleSelection(role) => Some(role),
                _ => None,
            })
            .expect("role selection reply expected");
        assert!(!granted.scu);
        assert!(granted.scp);

        // the local side may then invoke on this context
        assert!(outcome.contexts[0].scu);
        assert!(!outcome.contexts[0].scp);
    }

    #[test]
    fn extended_negotiation_is_intersected_and_echoed_only_on_match() {
        let capabilities = [
            Capability::new(uids::VERIFICATION).with_extended_negotiation(vec![1, 1, 0]),
            Capability::new("1.2.840.10008.5.1.4.1.1.7"),
        ];
        let rq = request(
            vec![proposal(
                1,
                uids::VERIFICATION,
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            )],
            vec![
                UserVariable::SopClassExtendedNegotiation(
                    uids::VERIFICATION.to_string(),
                    vec![1, 0, 1, 1],
                ),
                UserVariable::SopClassExtendedNegotiation(
                    "1.2.840.10008.5.1.4.1.1.7".to_string(),
                    vec![1],
                ),
            ],
        );
        let outcome = negotiate(&rq, &capabilities);

        let echoed: Vec<_> = outcome
            .reply_variables
            .iter()
            .filter_map(|variable| match variable {
                UserVariable::SopClassExtendedNegotiation(uid, bytes) => Some((uid, bytes)),
                _ => None,
            })
            .collect();
        // only the capability with declared options answers
        assert_eq!(echoed.len(), 1);
        assert_eq!(echoed[0].0, uids::VERIFICATION);
        assert_eq!(echoed[0].1, &vec![1, 0, 0]);
    }

    #[test]
    fn async_operations_window_is_bounded_both_ways() {
        let capabilities = [Capability::new(uids::VERIFICATION)];
        let rq = request(
            vec![proposal(
                1,
                uids::VERIFICATION,
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            )],
            vec![UserVariable::AsyncOperationsWindow {
                max_ops_invoked: 4,
                max_ops_performed: 2,
            }],
        );
        let outcome = negotiate_association(&rq, &capabilities, &[], false, 5, 3);

        let granted = outcome
            .reply_variables
            .iter()
            .find_map(|variable| match variable {
                UserVariable::AsyncOperationsWindow {
                    max_ops_invoked,
                    max_ops_performed,
                } => Some((*max_ops_invoked, *max_ops_performed)),
                _ => None,
            })
            .expect("async operations window reply expected");
        assert_eq!(granted, (3, 2));
        assert_eq!(outcome.max_ops_invoked, 2);
        assert_eq!(outcome.max_ops_performed, 3);
    }

    #[test]
    fn positive_identity_requests_are_acknowledged() {
        let capabilities = [Capability::new(uids::VERIFICATION)];
        let rq = request(
            vec![proposal(
                1,
                uids::VERIFICATION,
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            )],
            vec![UserVariable::UserIdentity(UserIdentity::new(
                true,
                UserIdentityType::Username,
                b"badgateway".to_vec(),
                vec![],
            ))],
        );
        let outcome = negotiate(&rq, &capabilities);
        assert!(outcome
            .reply_variables
            .iter()
            .any(|variable| matches!(variable, UserVariable::UserIdentityResponse(_))));
    }

    #[test]
    fn promiscuous_mode_accepts_unknown_abstract_syntaxes() {
        let rq = request(
            vec![proposal(1, "1.2.999.11", &[uids::IMPLICIT_VR_LITTLE_ENDIAN])],
            vec![],
        );
        let refused = negotiate_association(&rq, &[], &[], false, 1, 1);
        assert_eq!(
            refused.contexts[0].result,
            ContextResult::AbstractSyntaxNotSupported
        );

        let accepted = negotiate_association(&rq, &[], &[], true, 1, 1);
        assert_eq!(accepted.contexts[0].result, ContextResult::Acceptance);
    }

    #[test]
    fn requestor_contexts_honor_role_selection_replies() {
        let proposed = [
            proposal(1, uids::VERIFICATION, &[uids::IMPLICIT_VR_LITTLE_ENDIAN]),
            proposal(
                3,
                "1.2.840.10008.5.1.4.1.1.7",
                &[uids::IMPLICIT_VR_LITTLE_ENDIAN],
            ),
        ];
        let results = vec![
            PresentationContextResult {
                id: 1,
                result: ContextResult::Acceptance,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
            PresentationContextResult {
                id: 3,
                result: ContextResult::Acceptance,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
            // never proposed, must be dropped
            PresentationContextResult {
                id: 5,
                result: ContextResult::Acceptance,
                transfer_syntax: uids::IMPLICIT_VR_LITTLE_ENDIAN.to_string(),
            },
        ];
        let replies = [UserVariable::RoleSelection(RoleSelection {
            sop_class_uid: "1.2.840.10008.5.1.4.1.1.7".to_string(),
            scu: false,
            scp: true,
        })];

        let contexts = contexts_from_acknowledgement(&proposed, results, &replies);
        assert_eq!(contexts.len(), 2);
        // default roles: the requestor invokes
        assert!(contexts[0].scu);
        assert!(!contexts[0].scp);
        // explicit grant: this node performs instead
        assert!(!contexts[1].scu);
        assert!(contexts[1].scp);
    }

    #[test]
    fn choose_supported_skips_unknown_transfer_syntaxes() {
        assert_eq!(choose_supported(vec!["1.1.1.1.1"]), None);
        assert_eq!(
            choose_supported(vec!["1.1.1.1.1", uids::IMPLICIT_VR_LITTLE_ENDIAN]),
            Some(uids::IMPLICIT_VR_LITTLE_ENDIAN),
        );
    }
}
