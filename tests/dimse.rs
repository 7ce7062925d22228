//! DIMSE message exchange over established associations:
//! request/response correlation, pending responses with data sets,
//! the asynchronous operations bound, and failure paths
//! driven by a peer speaking raw PDUs.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, spawn, JoinHandle};
use std::time::Duration;

use matches::assert_matches;

use dicom_net::association::client::ClientAssociationOptions;
use dicom_net::association::server::ServerAssociationOptions;
use dicom_net::association::{
    Association, DatasetReader, DimseHandler, Error, NegotiatedContext, ResponseHandler,
    TimeoutScope,
};
use dicom_net::dimse::{self, status, CommandField, Priority};
use dicom_net::pdu::{
    read_pdu, write_pdu, AbortSource, AssociateAc, AssociateRq, ContextResult, PDataValue, Pdu,
    PdvKind, PresentationContextResult, ProviderAbortReason, UserVariable, DEFAULT_MAX_PDU,
};
use dicom_object::InMemDicomObject;

type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

static SCU_AE_TITLE: &str = "ECHO-SCU";
static SCP_AE_TITLE: &str = "ECHO-SCP";

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static STUDY_FIND_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.2.2.1";

/// What one invoked operation reported back.
#[derive(Debug, PartialEq)]
enum Outcome {
    Response(u16, Option<Vec<u8>>),
    Closed(String),
}

struct Collect(mpsc::Sender<Outcome>);

impl ResponseHandler for Collect {
    fn on_response(&mut self, command: &InMemDicomObject, dataset: Option<Vec<u8>>) {
        let status = dimse::status(command).expect("response carries a status");
        self.0.send(Outcome::Response(status, dataset)).unwrap();
    }

    fn on_close(&mut self, cause: Arc<Error>) {
        self.0.send(Outcome::Closed(cause.to_string())).unwrap();
    }
}

fn spawn_scp(
    options: ServerAssociationOptions<'static, impl dicom_net::association::AccessPolicy + 'static>,
) -> (JoinHandle<Result<()>>, SocketAddr) {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let h = spawn(move || -> Result<()> {
        let (stream, _addr) = listener.accept()?;
        let association = options.establish(stream)?;
        association.wait_closed();
        Ok(())
    });
    (h, addr)
}

fn scu_options() -> ClientAssociationOptions<'static> {
    ClientAssociationOptions::new()
        .calling_ae_title(SCU_AE_TITLE)
        .called_ae_title(SCP_AE_TITLE)
}

struct EchoScp;

impl DimseHandler for EchoScp {
    fn on_request(
        &self,
        association: &Association,
        context: &NegotiatedContext,
        command: InMemDicomObject,
        _dataset: Option<&mut DatasetReader<'_>>,
    ) -> bool {
        if !matches!(dimse::command_field(&command), Ok(CommandField::CEchoRq)) {
            return false;
        }
        let response = dimse::response(&command, status::SUCCESS).unwrap();
        association
            .send_response(context.id, response, None)
            .unwrap();
        true
    }
}

#[test]
fn echo_request_and_response() {
    let (scp_handle, scp_addr) = spawn_scp(
        ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .handler(Arc::new(EchoScp)),
    );

    let association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(scp_addr)
        .unwrap();

    let (events, log) = mpsc::channel();
    let message_id = association.generate_message_id();
    association
        .send_request(
            1,
            dimse::echo_rq(message_id),
            None,
            Box::new(Collect(events)),
        )
        .unwrap();

    assert_eq!(log.recv().unwrap(), Outcome::Response(status::SUCCESS, None));
    assert_eq!(association.outstanding_operations(), 0);

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}

struct FindScp;

impl DimseHandler for FindScp {
    fn on_request(
        &self,
        association: &Association,
        context: &NegotiatedContext,
        command: InMemDicomObject,
        dataset: Option<&mut DatasetReader<'_>>,
    ) -> bool {
        if !matches!(dimse::command_field(&command), Ok(CommandField::CFindRq)) {
            return false;
        }
        let mut query = Vec::new();
        dataset
            .expect("a C-FIND request carries an identifier")
            .read_to_end(&mut query)
            .unwrap();
        assert_eq!(query, b"query-identifier");

        for payload in [&b"match-1"[..], &b"match-2"[..]] {
            let pending = dimse::response(&command, status::PENDING).unwrap();
            association
                .send_response(context.id, pending, Some(payload))
                .unwrap();
        }
        let done = dimse::response(&command, status::SUCCESS).unwrap();
        association.send_response(context.id, done, None).unwrap();
        true
    }
}

/// Pending responses stream in before the terminal one,
/// each with its own data set, all under the same message ID.
#[test]
fn find_with_pending_responses() {
    let (scp_handle, scp_addr) = spawn_scp(
        ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(STUDY_FIND_SOP_CLASS)
            .handler(Arc::new(FindScp)),
    );

    let association = scu_options()
        .with_abstract_syntax(STUDY_FIND_SOP_CLASS)
        .establish(scp_addr)
        .unwrap();

    let (events, log) = mpsc::channel();
    let message_id = association.generate_message_id();
    let request = dimse::find_rq(message_id, STUDY_FIND_SOP_CLASS, Priority::Medium);
    association
        .send_request(
            1,
            request,
            Some(b"query-identifier"),
            Box::new(Collect(events)),
        )
        .unwrap();

    assert_eq!(
        log.recv().unwrap(),
        Outcome::Response(status::PENDING, Some(b"match-1".to_vec()))
    );
    assert_eq!(
        log.recv().unwrap(),
        Outcome::Response(status::PENDING, Some(b"match-2".to_vec()))
    );
    assert_eq!(log.recv().unwrap(), Outcome::Response(status::SUCCESS, None));

    association.release_gracefully();
    scp_handle.join().unwrap().unwrap();
}

/// Answers echo requests from another thread, after a delay.
struct SlowEchoScp;

impl DimseHandler for SlowEchoScp {
    fn on_request(
        &self,
        association: &Association,
        context: &NegotiatedContext,
        command: InMemDicomObject,
        _dataset: Option<&mut DatasetReader<'_>>,
    ) -> bool {
        let response = dimse::response(&command, status::SUCCESS).unwrap();
        let handle = association.handle();
        let context_id = context.id;
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            let _ = handle.send_response(context_id, response, None);
        });
        true
    }
}

struct Flag(mpsc::Sender<Outcome>, Arc<AtomicBool>);

impl ResponseHandler for Flag {
    fn on_response(&mut self, command: &InMemDicomObject, dataset: Option<Vec<u8>>) {
        self.1.store(true, Ordering::SeqCst);
        let status = dimse::status(command).unwrap();
        self.0.send(Outcome::Response(status, dataset)).unwrap();
    }

    fn on_close(&mut self, cause: Arc<Error>) {
        self.0.send(Outcome::Closed(cause.to_string())).unwrap();
    }
}

/// With an operations bound of 1, the second invocation
/// parks until the first operation completes.
#[test]
fn invoked_operations_bound_blocks_the_sender() {
    let (scp_handle, scp_addr) = spawn_scp(
        ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS)
            .handler(Arc::new(SlowEchoScp)),
    );

    let association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(scp_addr)
        .unwrap();

    let first_done = Arc::new(AtomicBool::new(false));
    let (events, log) = mpsc::channel();

    association
        .send_request(
            1,
            dimse::echo_rq(association.generate_message_id()),
            None,
            Box::new(Flag(events.clone(), Arc::clone(&first_done))),
        )
        .unwrap();

    // this call must park on the bound
    // until the first response has been delivered
    association
        .send_request(
            1,
            dimse::echo_rq(association.generate_message_id()),
            None,
            Box::new(Collect(events)),
        )
        .unwrap();
    assert!(first_done.load(Ordering::SeqCst));

    assert_eq!(log.recv().unwrap(), Outcome::Response(status::SUCCESS, None));
    assert_eq!(log.recv().unwrap(), Outcome::Response(status::SUCCESS, None));

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}

/// With no handler installed, every request is answered
/// with the unrecognized operation status.
#[test]
fn unrecognized_operation_failure_response() {
    let (scp_handle, scp_addr) = spawn_scp(
        ServerAssociationOptions::new()
            .ae_title(SCP_AE_TITLE)
            .with_abstract_syntax(VERIFICATION_SOP_CLASS),
    );

    let association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(scp_addr)
        .unwrap();

    let (events, log) = mpsc::channel();
    association
        .send_request(
            1,
            dimse::echo_rq(association.generate_message_id()),
            None,
            Box::new(Collect(events)),
        )
        .unwrap();
    assert_eq!(
        log.recv().unwrap(),
        Outcome::Response(status::UNRECOGNIZED_OPERATION, None)
    );

    association.release().unwrap();
    scp_handle.join().unwrap().unwrap();
}

/// Accept the association on a raw socket,
/// for driving the peer with hand-built PDUs.
fn raw_accept(listener: &TcpListener) -> (TcpStream, AssociateRq) {
    let (mut stream, _addr) = listener.accept().unwrap();
    let Some(Pdu::AssociateRq(rq)) = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap() else {
        panic!("expected an association request");
    };
    let ac = Pdu::AssociateAc(AssociateAc {
        protocol_version: 1,
        calling_ae_title: rq.calling_ae_title.clone(),
        called_ae_title: rq.called_ae_title.clone(),
        application_context_name: rq.application_context_name.clone(),
        presentation_contexts: vec![PresentationContextResult {
            id: 1,
            result: ContextResult::Acceptance,
            transfer_syntax: IMPLICIT_VR_LE.to_string(),
        }],
        user_variables: vec![UserVariable::MaxLength(16_384)],
    });
    raw_send(&mut stream, &ac);
    (stream, rq)
}

fn raw_send(stream: &mut TcpStream, pdu: &Pdu) {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).unwrap();
    stream.write_all(&bytes).unwrap();
}

/// A response whose message ID matches no invoked operation
/// is a protocol violation; the association aborts.
#[test]
fn unmatched_response_aborts_the_association() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = spawn(move || {
        let (mut stream, _rq) = raw_accept(&listener);

        let bogus = dimse::response(&dimse::echo_rq(42), status::SUCCESS).unwrap();
        let command = dimse::encode_command(&bogus).unwrap();
        raw_send(
            &mut stream,
            &Pdu::PData {
                data: vec![PDataValue {
                    context_id: 1,
                    kind: PdvKind::Command,
                    is_last: true,
                    data: command,
                }],
            },
        );

        // the violation comes back as a provider abort
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
        assert_eq!(
            pdu,
            Some(Pdu::AbortRq {
                source: AbortSource::ServiceProvider(
                    ProviderAbortReason::UnexpectedPduParameter
                ),
            })
        );
    });

    let association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();

    let cause = association.wait_closed();
    assert_matches!(&*cause, Error::UnmatchedResponse { message_id: 42, .. });
    peer.join().unwrap();
}

/// A peer abort fails the outstanding operation
/// with the abort as its cause.
#[test]
fn peer_abort_fails_outstanding_operations() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = spawn(move || {
        let (mut stream, _rq) = raw_accept(&listener);
        // swallow the echo request, then pull the plug
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
        assert_matches!(pdu, Some(Pdu::PData { .. }));
        raw_send(
            &mut stream,
            &Pdu::AbortRq {
                source: AbortSource::ServiceUser,
            },
        );
    });

    let association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .establish(addr)
        .unwrap();

    let (events, log) = mpsc::channel();
    association
        .send_request(
            1,
            dimse::echo_rq(association.generate_message_id()),
            None,
            Box::new(Collect(events)),
        )
        .unwrap();

    let cause = association.wait_closed();
    assert_matches!(
        &*cause,
        Error::Aborted {
            origin: AbortSource::ServiceUser,
        }
    );
    assert_matches!(log.recv().unwrap(), Outcome::Closed(_));

    peer.join().unwrap();
}

/// An operation with no response within the configured window
/// tears the association down.
#[test]
fn response_timeout_aborts_the_association() {
    let listener = TcpListener::bind("localhost:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let peer = spawn(move || {
        let (mut stream, _rq) = raw_accept(&listener);
        // accept the echo request and never answer it
        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
        assert_matches!(pdu, Some(Pdu::PData { .. }));

        let pdu = read_pdu(&mut stream, DEFAULT_MAX_PDU, true).unwrap();
        assert_matches!(pdu, Some(Pdu::AbortRq { .. }));
    });

    let association = scu_options()
        .with_abstract_syntax(VERIFICATION_SOP_CLASS)
        .response_timeout(Duration::from_millis(200))
        .establish(addr)
        .unwrap();

    let (events, log) = mpsc::channel();
    association
        .send_request(
            1,
            dimse::echo_rq(association.generate_message_id()),
            None,
            Box::new(Collect(events)),
        )
        .unwrap();

    let cause = association.wait_closed();
    assert_matches!(
        &*cause,
        Error::TimedOut {
            scope: TimeoutScope::Response,
        }
    );
    assert_matches!(log.recv().unwrap(), Outcome::Closed(_));

    peer.join().unwrap();
}
