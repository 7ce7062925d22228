//! Wire codec round trips and framing bounds.

use std::io::Cursor;

use matches::assert_matches;

use dicom_net::pdu::{
    read_pdu, reader, write_pdu, AbortSource, AssociateAc, AssociateRj, AssociateRq,
    ContextResult, PDataValue, Pdu, PdvKind, PresentationContextResult,
    ProposedPresentationContext, ProviderAbortReason, RejectResult, RejectSource, RoleSelection,
    UserIdentity, UserIdentityType, UserRejectReason, UserVariable, DEFAULT_MAX_PDU,
    MINIMUM_MAX_PDU,
};

static IMPLICIT_VR_LE: &str = "1.2.840.10008.1.2";
static EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";
static JPEG_BASELINE: &str = "1.2.840.10008.1.2.4.50";
static VERIFICATION_SOP_CLASS: &str = "1.2.840.10008.1.1";
static MG_STORAGE_SOP_CLASS: &str = "1.2.840.10008.5.1.4.1.1.1.2";

fn roundtrip(pdu: &Pdu) -> Pdu {
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, pdu).expect("writing should succeed");
    read_pdu(&mut Cursor::new(bytes), DEFAULT_MAX_PDU, true)
        .expect("reading should succeed")
        .expect("a full PDU was written")
}

#[test]
fn associate_rq_roundtrip() {
    let pdu = Pdu::AssociateRq(AssociateRq {
        protocol_version: 1,
        calling_ae_title: "ECHO-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            ProposedPresentationContext {
                id: 1,
                abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
                transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
            },
            ProposedPresentationContext {
                id: 3,
                abstract_syntax: MG_STORAGE_SOP_CLASS.to_string(),
                transfer_syntaxes: vec![
                    EXPLICIT_VR_LE.to_string(),
                    IMPLICIT_VR_LE.to_string(),
                    JPEG_BASELINE.to_string(),
                ],
            },
        ],
        user_variables: vec![
            UserVariable::MaxLength(16_384),
            UserVariable::ImplementationClassUid("1.2.345.6.7890.1.234".to_string()),
            UserVariable::ImplementationVersionName("TEST-1.0".to_string()),
            UserVariable::AsyncOperationsWindow {
                max_ops_invoked: 4,
                max_ops_performed: 1,
            },
            UserVariable::RoleSelection(RoleSelection {
                sop_class_uid: MG_STORAGE_SOP_CLASS.to_string(),
                scu: true,
                scp: false,
            }),
            UserVariable::UserIdentity(UserIdentity::new(
                true,
                UserIdentityType::UsernamePasscode,
                b"operator".to_vec(),
                b"hunter2".to_vec(),
            )),
        ],
    });

    assert_eq!(roundtrip(&pdu), pdu);
}

/// AE titles go out as 16 characters; the reader
/// strips the space padding back off.
#[test]
fn ae_title_padding_is_not_significant() {
    let pdu = Pdu::AssociateRq(AssociateRq {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "A-VERY-LONG-AE-T".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![ProposedPresentationContext {
            id: 1,
            abstract_syntax: VERIFICATION_SOP_CLASS.to_string(),
            transfer_syntaxes: vec![IMPLICIT_VR_LE.to_string()],
        }],
        user_variables: vec![],
    });

    let Pdu::AssociateRq(read_back) = roundtrip(&pdu) else {
        panic!("expected an A-ASSOCIATE-RQ");
    };
    assert_eq!(read_back.calling_ae_title, "SCU");
    assert_eq!(read_back.called_ae_title, "A-VERY-LONG-AE-T");
}

#[test]
fn associate_ac_roundtrip() {
    let pdu = Pdu::AssociateAc(AssociateAc {
        protocol_version: 1,
        calling_ae_title: "ECHO-SCU".to_string(),
        called_ae_title: "MAIN-STORAGE".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![
            PresentationContextResult {
                id: 1,
                result: ContextResult::Acceptance,
                transfer_syntax: IMPLICIT_VR_LE.to_string(),
            },
            PresentationContextResult {
                id: 3,
                result: ContextResult::AbstractSyntaxNotSupported,
                transfer_syntax: String::new(),
            },
        ],
        user_variables: vec![
            UserVariable::MaxLength(0),
            UserVariable::AsyncOperationsWindow {
                max_ops_invoked: 2,
                max_ops_performed: 1,
            },
            UserVariable::UserIdentityResponse(b"granted".to_vec()),
        ],
    });

    assert_eq!(roundtrip(&pdu), pdu);
}

/// An acknowledgement may carry no presentation context at all;
/// deciding what to do about that is the requestor's problem.
#[test]
fn associate_ac_with_zero_contexts_roundtrip() {
    let pdu = Pdu::AssociateAc(AssociateAc {
        protocol_version: 1,
        calling_ae_title: "SCU".to_string(),
        called_ae_title: "SCP".to_string(),
        application_context_name: "1.2.840.10008.3.1.1.1".to_string(),
        presentation_contexts: vec![],
        user_variables: vec![UserVariable::MaxLength(16_384)],
    });

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn short_pdu_roundtrips() {
    let pdus = [
        Pdu::AssociateRj(AssociateRj {
            result: RejectResult::Transient,
            source: RejectSource::ServiceUser(UserRejectReason::CalledAeTitleNotRecognized),
        }),
        Pdu::ReleaseRq,
        Pdu::ReleaseRp,
        Pdu::AbortRq {
            source: AbortSource::ServiceUser,
        },
        Pdu::AbortRq {
            source: AbortSource::ServiceProvider(ProviderAbortReason::UnexpectedPdu),
        },
    ];
    for pdu in pdus {
        assert_eq!(roundtrip(&pdu), pdu);
    }
}

#[test]
fn pdata_roundtrip() {
    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                context_id: 1,
                kind: PdvKind::Command,
                is_last: true,
                data: vec![0x11; 68],
            },
            PDataValue {
                context_id: 1,
                kind: PdvKind::Data,
                is_last: false,
                data: vec![0x22; 1024],
            },
            PDataValue {
                context_id: 1,
                kind: PdvKind::Data,
                is_last: true,
                data: vec![0x33; 7],
            },
        ],
    };

    assert_eq!(roundtrip(&pdu), pdu);
}

#[test]
fn strict_mode_rejects_oversized_pdus() {
    let pdu = Pdu::PData {
        data: vec![PDataValue {
            context_id: 1,
            kind: PdvKind::Data,
            is_last: true,
            data: vec![0x55; 5_000],
        }],
    };
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();

    let err = read_pdu(&mut Cursor::new(&bytes), MINIMUM_MAX_PDU, true).unwrap_err();
    assert_matches!(err, reader::Error::PduTooLarge { .. });

    // the same PDU is tolerated when strict mode is off
    let read_back = read_pdu(&mut Cursor::new(&bytes), MINIMUM_MAX_PDU, false)
        .unwrap()
        .unwrap();
    assert_eq!(read_back, pdu);
}

#[test]
fn pdu_length_below_minimum_is_an_error() {
    // a PDU announcing a zero-length body cannot be well formed
    let bytes = [0x04, 0x00, 0x00, 0x00, 0x00, 0x00];
    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap_err();
    assert_matches!(err, reader::Error::PduTooSmall { pdu_length: 0, .. });
}

#[test]
fn clean_end_of_stream_reads_as_none() {
    let out = read_pdu(&mut Cursor::new(&[]), DEFAULT_MAX_PDU, true).unwrap();
    assert_eq!(out, None);
}

/// A stream which ends inside a PDU is an error,
/// not an orderly closure.
#[test]
fn truncated_pdu_is_an_error() {
    let pdu = Pdu::ReleaseRq;
    let mut bytes = Vec::new();
    write_pdu(&mut bytes, &pdu).unwrap();
    bytes.truncate(4);

    let err = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true).unwrap_err();
    assert_matches!(err, reader::Error::ReadPduField { .. });
}

#[test]
fn unrecognized_pdu_type_is_preserved() {
    let bytes = [0x09, 0x00, 0x00, 0x00, 0x00, 0x04, 0xAA, 0xBB, 0xCC, 0xDD];
    let out = read_pdu(&mut Cursor::new(&bytes), DEFAULT_MAX_PDU, true)
        .unwrap()
        .unwrap();
    assert_eq!(
        out,
        Pdu::Unknown {
            pdu_type: 0x09,
            data: vec![0xAA, 0xBB, 0xCC, 0xDD],
        }
    );
}
