//! Association state machine.
//!
//! The protocol defines thirteen states for one association,
//! from `Sta1` (idle) to `Sta13` (awaiting transport close),
//! and mandates the outcome of every applicable (state, event) pair.
//! This module encodes that mandate as a single table function,
//! [`transition`], which is pure and exhaustively testable:
//! the surrounding runtime interprets the returned [`Action`]
//! and performs all I/O and signalling.
//!
//! Pairs the protocol leaves unmapped fall into two classes.
//! A PDU arriving in a state which does not admit it
//! is a peer violation,
//! answered with an abort carrying the "unexpected PDU" reason.
//! A local primitive issued in a state which does not admit it
//! is a caller error,
//! reported locally and never put on the wire.

use crate::pdu::Pdu;

/// The thirteen protocol states of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Idle, no association and no transport connection
    Sta1,
    /// Transport connection open, awaiting A-ASSOCIATE-RQ
    Sta2,
    /// Awaiting local A-ASSOCIATE response primitive
    Sta3,
    /// Awaiting transport connection opening to complete
    Sta4,
    /// Awaiting A-ASSOCIATE-AC or A-ASSOCIATE-RJ
    Sta5,
    /// Association established and ready for data transfer
    Sta6,
    /// Awaiting A-RELEASE-RP
    Sta7,
    /// Awaiting local A-RELEASE response primitive
    Sta8,
    /// Release collision requestor side, awaiting local response
    Sta9,
    /// Release collision acceptor side, awaiting A-RELEASE-RP
    Sta10,
    /// Release collision requestor side, awaiting A-RELEASE-RP
    Sta11,
    /// Release collision acceptor side, awaiting local response
    Sta12,
    /// Awaiting transport connection close
    Sta13,
}

/// Which side of the association this machine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The peer which initiated the association
    Requestor,
    /// The peer which accepted the transport connection
    Acceptor,
}

/// Every event which may drive the association state machine,
/// covering local service primitives,
/// PDU arrivals and transport signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Local request to establish an association
    AssociateRequest,
    /// Outbound transport connection completed
    TransportConnected,
    /// A-ASSOCIATE-AC PDU received
    AssociateAcReceived,
    /// A-ASSOCIATE-RJ PDU received
    AssociateRjReceived,
    /// Inbound transport connection accepted
    TransportAccepted,
    /// A-ASSOCIATE-RQ PDU received
    AssociateRqReceived,
    /// Local decision to accept the association
    LocalAccept,
    /// Local decision to reject the association
    LocalReject,
    /// Local request to send data
    PDataRequest,
    /// P-DATA-TF PDU received
    PDataReceived,
    /// Local request to release the association
    ReleaseRequest,
    /// A-RELEASE-RQ PDU received
    ReleaseRqReceived,
    /// A-RELEASE-RP PDU received
    ReleaseRpReceived,
    /// Local response to a release indication
    ReleaseResponse,
    /// Local request to abort the association
    AbortRequest,
    /// A-ABORT PDU received
    AbortReceived,
    /// Transport connection closed by the peer
    TransportClosed,
    /// The accept or close timer expired
    TimerExpired,
    /// A PDU of unrecognized type received
    InvalidPduReceived,
}

impl Event {
    /// The event raised by the arrival of the given PDU.
    pub fn of_pdu(pdu: &Pdu) -> Event {
        match pdu {
            Pdu::AssociateRq { .. } => Event::AssociateRqReceived,
            Pdu::AssociateAc { .. } => Event::AssociateAcReceived,
            Pdu::AssociateRj { .. } => Event::AssociateRjReceived,
            Pdu::PData { .. } => Event::PDataReceived,
            Pdu::ReleaseRq => Event::ReleaseRqReceived,
            Pdu::ReleaseRp => Event::ReleaseRpReceived,
            Pdu::AbortRq { .. } => Event::AbortReceived,
            Pdu::Unknown { .. } => Event::InvalidPduReceived,
        }
    }

    /// Whether this event is raised by an incoming PDU.
    pub fn is_pdu(self) -> bool {
        matches!(
            self,
            Event::AssociateRqReceived
                | Event::AssociateAcReceived
                | Event::AssociateRjReceived
                | Event::PDataReceived
                | Event::ReleaseRqReceived
                | Event::ReleaseRpReceived
                | Event::AbortReceived
                | Event::InvalidPduReceived
        )
    }
}

/// The side effect the runtime must perform for a mapped transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open the outbound transport connection
    ConnectTransport,
    /// Send the A-ASSOCIATE-RQ PDU
    SendAssociateRq,
    /// Report the association as established to the local user
    ConfirmEstablished,
    /// Report the association as rejected and close the transport
    ConfirmRejected,
    /// Start the accept timer for the incoming connection
    StartAcceptTimer,
    /// Stop the accept timer and hand the request to negotiation
    IndicateAssociate,
    /// Send the A-ASSOCIATE-AC PDU
    SendAssociateAc,
    /// Send the A-ASSOCIATE-RJ PDU and start the close timer
    SendAssociateRj,
    /// Send the pending P-DATA-TF PDU
    EmitPData,
    /// Deliver the received data to the local user
    IndicatePData,
    /// Send the A-RELEASE-RQ PDU
    SendReleaseRq,
    /// Report the peer's release request to the local user
    IndicateRelease,
    /// Report the release as completed and close the transport
    ConfirmReleased,
    /// Send the A-RELEASE-RP PDU and start the close timer
    SendReleaseRp,
    /// Report a release collision to the local user
    IndicateReleaseCollision,
    /// Send the collision reply A-RELEASE-RP PDU
    SendCollisionReleaseRp,
    /// Report the peer's collision reply to the local user
    ConfirmReleaseCollision,
    /// Send an A-ABORT PDU and start the close timer
    SendAbort,
    /// Close the transport connection
    CloseTransport,
    /// Report the peer's abort to the local user and close the transport
    IndicateAbort,
    /// Report the unannounced transport closure to the local user
    IndicatePeerClosed,
    /// Stop the close timer, the transport is gone
    StopTimerOnClose,
    /// Discard the event
    Ignore,
}

/// The outcome of feeding one event to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The pair is mapped: perform `action` and move to `next`.
    Do { action: Action, next: State },
    /// The peer sent a PDU which the current state does not admit.
    /// The association must be aborted with reason "unexpected PDU"
    /// and the machine moves to `Sta13`.
    UnexpectedPdu,
    /// A local primitive was issued in a state which does not admit it.
    /// The state is unchanged and nothing reaches the wire.
    IllegalRequest,
}

/// The transition table.
///
/// `role` only disambiguates the release collision entry,
/// which routes the requestor through `Sta9`/`Sta11`
/// and the acceptor through `Sta10`/`Sta12`.
pub fn transition(role: Role, state: State, event: Event) -> Transition {
    use Action::*;
    use Event::*;
    use State::*;

    let (action, next) = match (state, event) {
        // establishment, requestor side
        (Sta1, AssociateRequest) => (ConnectTransport, Sta4),
        (Sta4, TransportConnected) => (SendAssociateRq, Sta5),
        (Sta5, AssociateAcReceived) => (ConfirmEstablished, Sta6),
        (Sta5, AssociateRjReceived) => (ConfirmRejected, Sta1),

        // establishment, acceptor side
        (Sta1, TransportAccepted) => (StartAcceptTimer, Sta2),
        (Sta2, AssociateRqReceived) => (IndicateAssociate, Sta3),
        (Sta3, LocalAccept) => (SendAssociateAc, Sta6),
        (Sta3, LocalReject) => (SendAssociateRj, Sta13),

        // data transfer, also legal while the release handshake drains
        (Sta6, PDataRequest) => (EmitPData, Sta6),
        (Sta8, PDataRequest) => (EmitPData, Sta8),
        (Sta6, PDataReceived) => (IndicatePData, Sta6),
        (Sta7, PDataReceived) => (IndicatePData, Sta7),

        // orderly release
        (Sta6, ReleaseRequest) => (SendReleaseRq, Sta7),
        (Sta6, ReleaseRqReceived) => (IndicateRelease, Sta8),
        (Sta7, ReleaseRpReceived) => (ConfirmReleased, Sta1),
        (Sta8, ReleaseResponse) => (SendReleaseRp, Sta13),

        // release collision, both sides requested release at once
        (Sta7, ReleaseRqReceived) => match role {
            Role::Requestor => (IndicateReleaseCollision, Sta9),
            Role::Acceptor => (IndicateReleaseCollision, Sta10),
        },
        (Sta9, ReleaseResponse) => (SendCollisionReleaseRp, Sta11),
        (Sta11, ReleaseRpReceived) => (ConfirmReleased, Sta1),
        (Sta10, ReleaseRpReceived) => (ConfirmReleaseCollision, Sta12),
        (Sta12, ReleaseResponse) => (SendReleaseRp, Sta13),

        // local abort
        (Sta4, AbortRequest) => (CloseTransport, Sta1),
        (
            Sta3 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            AbortRequest,
        ) => (SendAbort, Sta13),

        // peer abort
        (Sta2 | Sta13, AbortReceived) => (CloseTransport, Sta1),
        (
            Sta3 | Sta4 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            AbortReceived,
        ) => (IndicateAbort, Sta1),

        // transport closure
        (Sta2 | Sta13, TransportClosed) => (StopTimerOnClose, Sta1),
        (
            Sta3 | Sta4 | Sta5 | Sta6 | Sta7 | Sta8 | Sta9 | Sta10 | Sta11 | Sta12,
            TransportClosed,
        ) => (IndicatePeerClosed, Sta1),

        // accept and close timers
        (Sta2 | Sta13, TimerExpired) => (CloseTransport, Sta1),

        // lingering traffic while awaiting the transport close
        (
            Sta13,
            AssociateAcReceived | AssociateRjReceived | PDataReceived | ReleaseRqReceived
            | ReleaseRpReceived,
        ) => (Ignore, Sta13),
        (Sta13, AssociateRqReceived | InvalidPduReceived) => (SendAbort, Sta13),

        (_, event) if event.is_pdu() => return Transition::UnexpectedPdu,
        _ => return Transition::IllegalRequest,
    };

    Transition::Do { action, next }
}

/// A state machine instance for one association.
#[derive(Debug)]
pub struct Machine {
    role: Role,
    state: State,
}

impl Machine {
    pub fn new(role: Role) -> Self {
        Machine {
            role,
            state: State::Sta1,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Feed one event through the transition table,
    /// advancing the state.
    ///
    /// On [`Transition::UnexpectedPdu`] the machine moves to `Sta13`,
    /// anticipating the abort which the caller must now send.
    /// On [`Transition::IllegalRequest`] the state is unchanged.
    pub fn apply(&mut self, event: Event) -> Transition {
        let outcome = transition(self.role, self.state, event);
        match outcome {
            Transition::Do { next, .. } => self.state = next,
            Transition::UnexpectedPdu => self.state = State::Sta13,
            Transition::IllegalRequest => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ALL_STATES: [State; 13] = [
        State::Sta1,
        State::Sta2,
        State::Sta3,
        State::Sta4,
        State::Sta5,
        State::Sta6,
        State::Sta7,
        State::Sta8,
        State::Sta9,
        State::Sta10,
        State::Sta11,
        State::Sta12,
        State::Sta13,
    ];

    const ALL_EVENTS: [Event; 19] = [
        Event::AssociateRequest,
        Event::TransportConnected,
        Event::AssociateAcReceived,
        Event::AssociateRjReceived,
        Event::TransportAccepted,
        Event::AssociateRqReceived,
        Event::LocalAccept,
        Event::LocalReject,
        Event::PDataRequest,
        Event::PDataReceived,
        Event::ReleaseRequest,
        Event::ReleaseRqReceived,
        Event::ReleaseRpReceived,
        Event::ReleaseResponse,
        Event::AbortRequest,
        Event::AbortReceived,
        Event::TransportClosed,
        Event::TimerExpired,
        Event::InvalidPduReceived,
    ];

    #[rstest]
    #[case(State::Sta1, Event::AssociateRequest, Action::ConnectTransport, State::Sta4)]
    #[case(State::Sta4, Event::TransportConnected, Action::SendAssociateRq, State::Sta5)]
    #[case(State::Sta5, Event::AssociateAcReceived, Action::ConfirmEstablished, State::Sta6)]
    #[case(State::Sta5, Event::AssociateRjReceived, Action::ConfirmRejected, State::Sta1)]
    #[case(State::Sta1, Event::TransportAccepted, Action::StartAcceptTimer, State::Sta2)]
    #[case(State::Sta2, Event::AssociateRqReceived, Action::IndicateAssociate, State::Sta3)]
    #[case(State::Sta3, Event::LocalAccept, Action::SendAssociateAc, State::Sta6)]
    #[case(State::Sta3, Event::LocalReject, Action::SendAssociateRj, State::Sta13)]
    #[case(State::Sta6, Event::PDataRequest, Action::EmitPData, State::Sta6)]
    #[case(State::Sta8, Event::PDataRequest, Action::EmitPData, State::Sta8)]
    #[case(State::Sta6, Event::PDataReceived, Action::IndicatePData, State::Sta6)]
    #[case(State::Sta7, Event::PDataReceived, Action::IndicatePData, State::Sta7)]
    #[case(State::Sta6, Event::ReleaseRequest, Action::SendReleaseRq, State::Sta7)]
    #[case(State::Sta6, Event::ReleaseRqReceived, Action::IndicateRelease, State::Sta8)]
    #[case(State::Sta7, Event::ReleaseRpReceived, Action::ConfirmReleased, State::Sta1)]
    #[case(State::Sta8, Event::ReleaseResponse, Action::SendReleaseRp, State::Sta13)]
    #[case(State::Sta9, Event::ReleaseResponse, Action::SendCollisionReleaseRp, State::Sta11)]
    #[case(State::Sta11, Event::ReleaseRpReceived, Action::ConfirmReleased, State::Sta1)]
    #[case(State::Sta10, Event::ReleaseRpReceived, Action::ConfirmReleaseCollision, State::Sta12)]
    #[case(State::Sta12, Event::ReleaseResponse, Action::SendReleaseRp, State::Sta13)]
    #[case(State::Sta4, Event::AbortRequest, Action::CloseTransport, State::Sta1)]
    #[case(State::Sta6, Event::AbortRequest, Action::SendAbort, State::Sta13)]
    #[case(State::Sta2, Event::AbortReceived, Action::CloseTransport, State::Sta1)]
    #[case(State::Sta6, Event::AbortReceived, Action::IndicateAbort, State::Sta1)]
    #[case(State::Sta13, Event::AbortReceived, Action::CloseTransport, State::Sta1)]
    #[case(State::Sta2, Event::TransportClosed, Action::StopTimerOnClose, State::Sta1)]
    #[case(State::Sta6, Event::TransportClosed, Action::IndicatePeerClosed, State::Sta1)]
    #[case(State::Sta13, Event::TransportClosed, Action::StopTimerOnClose, State::Sta1)]
    #[case(State::Sta2, Event::TimerExpired, Action::CloseTransport, State::Sta1)]
    #[case(State::Sta13, Event::TimerExpired, Action::CloseTransport, State::Sta1)]
    #[case(State::Sta13, Event::PDataReceived, Action::Ignore, State::Sta13)]
    #[case(State::Sta13, Event::AssociateRqReceived, Action::SendAbort, State::Sta13)]
    #[case(State::Sta13, Event::InvalidPduReceived, Action::SendAbort, State::Sta13)]
    fn mandated_transitions(
        #[case] state: State,
        #[case] event: Event,
        #[case] action: Action,
        #[case] next: State,
    ) {
        assert_eq!(
            transition(Role::Requestor, state, event),
            Transition::Do { action, next },
        );
    }

    #[test]
    fn release_collision_routes_by_role() {
        assert_eq!(
            transition(Role::Requestor, State::Sta7, Event::ReleaseRqReceived),
            Transition::Do {
                action: Action::IndicateReleaseCollision,
                next: State::Sta9,
            },
        );
        assert_eq!(
            transition(Role::Acceptor, State::Sta7, Event::ReleaseRqReceived),
            Transition::Do {
                action: Action::IndicateReleaseCollision,
                next: State::Sta10,
            },
        );
    }

    /// Every unmapped pair with an incoming PDU is a peer violation,
    /// every unmapped pair with a local primitive is a caller error.
    #[test]
    fn unmapped_pairs_fall_into_the_default_rules() {
        for role in [Role::Requestor, Role::Acceptor] {
            for state in ALL_STATES {
                for event in ALL_EVENTS {
                    match transition(role, state, event) {
                        Transition::Do { .. } => {}
                        Transition::UnexpectedPdu => {
                            assert!(
                                event.is_pdu(),
                                "non-PDU event {:?} in {:?} flagged as peer violation",
                                event,
                                state,
                            );
                        }
                        Transition::IllegalRequest => {
                            assert!(
                                !event.is_pdu(),
                                "PDU event {:?} in {:?} flagged as local error",
                                event,
                                state,
                            );
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn unexpected_pdu_moves_the_machine_to_sta13() {
        let mut machine = Machine::new(Role::Requestor);
        machine.apply(Event::AssociateRequest);
        machine.apply(Event::TransportConnected);
        assert_eq!(machine.state(), State::Sta5);

        // a P-DATA-TF before the association is established
        assert_eq!(
            machine.apply(Event::PDataReceived),
            Transition::UnexpectedPdu
        );
        assert_eq!(machine.state(), State::Sta13);
    }

    #[test]
    fn illegal_request_leaves_the_state_unchanged() {
        let mut machine = Machine::new(Role::Acceptor);
        assert_eq!(
            machine.apply(Event::PDataRequest),
            Transition::IllegalRequest
        );
        assert_eq!(machine.state(), State::Sta1);
    }
}
