//! PDU reader module
use crate::pdu::*;
use byteordered::byteorder::{BigEndian, ReadBytesExt};
use dicom_encoding::text::{DefaultCharacterSetCodec, TextCodec};
use snafu::{ensure, Backtrace, OptionExt, ResultExt, Snafu};
use std::io::{Cursor, ErrorKind, Read, Seek, SeekFrom};
use tracing::warn;

/// The default maximum length for incoming P-DATA-TF PDUs,
/// in the absence of an explicit configuration
pub const DEFAULT_MAX_PDU: u32 = 16_378;

/// The lowest admissible value
/// for the configurable maximum PDU length
pub const MINIMUM_MAX_PDU: u32 = 4_096;

/// The smallest PDU length value
/// which can frame a well formed PDU body
pub const MINIMUM_PDU_SIZE: u32 = 4;

/// The hard upper bound for the length of any PDU,
/// regardless of what was negotiated
pub const MAXIMUM_PDU_SIZE: u32 = 16_777_216;

/// The length of the PDU header in bytes,
/// comprising the PDU type (1 byte),
/// reserved byte (1 byte),
/// and PDU length (4 bytes).
pub const PDU_HEADER_SIZE: u32 = 6;

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid max PDU length {}", max_pdu_length))]
    InvalidMaxPdu {
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU"))]
    ReadPdu {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU item"))]
    ReadPduItem {
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read PDU field `{}`", field))]
    ReadPduField {
        field: &'static str,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Could not read {} reserved bytes", bytes))]
    ReadReserved {
        bytes: u32,
        source: std::io::Error,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid item length {} (must be >=2)", length))]
    InvalidItemLength { length: u32 },

    #[snafu(display(
        "Incoming PDU was too large: length {}, maximum is {}",
        pdu_length,
        max_pdu_length
    ))]
    PduTooLarge {
        pdu_length: u32,
        max_pdu_length: u32,
        backtrace: Backtrace,
    },

    #[snafu(display("Incoming PDU was too small: length {}", pdu_length))]
    PduTooSmall { pdu_length: u32, backtrace: Backtrace },

    #[snafu(display("PDU contained an invalid item {:?}", item))]
    InvalidPduItem { item: PduItem, backtrace: Backtrace },

    #[snafu(display("Multiple transfer syntaxes were accepted"))]
    MultipleTransferSyntaxesAccepted { backtrace: Backtrace },

    #[snafu(display("Invalid reject source or reason"))]
    InvalidRejectSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid abort source or reason"))]
    InvalidAbortSourceOrReason { backtrace: Backtrace },

    #[snafu(display("Invalid presentation context result"))]
    InvalidPresentationContextResult { backtrace: Backtrace },

    #[snafu(display("Invalid transfer syntax sub-item"))]
    InvalidTransferSyntaxSubItem { backtrace: Backtrace },

    #[snafu(display("Unknown presentation context sub-item"))]
    UnknownPresentationContextSubItem { backtrace: Backtrace },

    #[snafu(display("Could not decode text field `{}`", field))]
    DecodeText {
        field: &'static str,
        #[snafu(backtrace)]
        source: dicom_encoding::text::DecodeTextError,
    },

    #[snafu(display("Missing application context name"))]
    MissingApplicationContextName { backtrace: Backtrace },

    #[snafu(display("Missing abstract syntax"))]
    MissingAbstractSyntax { backtrace: Backtrace },

    #[snafu(display("Missing transfer syntax"))]
    MissingTransferSyntax { backtrace: Backtrace },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Read a PDU from `reader`.
///
/// Returns `Ok(None)` if the stream ends cleanly
/// before the first byte of a new PDU,
/// which is how an orderly transport closure presents itself.
/// An end of stream in the middle of a PDU is an error.
///
/// `max_pdu_length` is the maximum length admitted for the incoming PDU.
/// When `strict` is `false`,
/// PDUs up to [`MAXIMUM_PDU_SIZE`] are still admitted with a warning,
/// to interoperate with peers which overrun the negotiated limit.
pub fn read_pdu<R>(reader: &mut R, max_pdu_length: u32, strict: bool) -> Result<Option<Pdu>>
where
    R: Read,
{
    ensure!(
        (MINIMUM_MAX_PDU..=MAXIMUM_PDU_SIZE).contains(&max_pdu_length),
        InvalidMaxPduSnafu { max_pdu_length }
    );

    // Probing the first 2 bytes (type + reserved) separately
    // distinguishes a stream closed between PDUs
    // from one truncated inside a PDU.
    let mut bytes = [0; 2];
    if let Err(e) = reader.read_exact(&mut bytes) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(e).context(ReadPduFieldSnafu { field: "type" });
    }

    let pdu_type = bytes[0];
    let pdu_length = reader
        .read_u32::<BigEndian>()
        .context(ReadPduFieldSnafu { field: "length" })?;

    ensure!(
        pdu_length >= MINIMUM_PDU_SIZE,
        PduTooSmallSnafu { pdu_length }
    );

    if strict {
        ensure!(
            pdu_length <= max_pdu_length,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length
            }
        );
    } else if pdu_length > max_pdu_length {
        ensure!(
            pdu_length <= MAXIMUM_PDU_SIZE,
            PduTooLargeSnafu {
                pdu_length,
                max_pdu_length: MAXIMUM_PDU_SIZE
            }
        );
        warn!(
            "Incoming PDU of {} bytes exceeds the negotiated maximum of {}",
            pdu_length, max_pdu_length
        );
    }

    let bytes = read_n(reader, pdu_length as usize).context(ReadPduSnafu)?;
    let mut cursor = Cursor::new(bytes);
    let codec = DefaultCharacterSetCodec;

    match pdu_type {
        0x01 => {
            // A-ASSOCIATE-RQ PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version - bit 0 set identifies version 1
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved - sent as 0000H, not tested when received
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 - Called-AE-title - 16 characters with non-significant
            // leading and trailing spaces
            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;

            // 27-42 - Calling-AE-title - 16 characters with non-significant
            // leading and trailing spaces
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            // 43-74 - Reserved - sent as 00H bytes, not tested when received
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // 75-xxx - Variable items - one application context item,
            // one or more presentation context items
            // and one user information item
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_item(&mut cursor, &codec)? {
                    PduItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduItem::ProposedPresentationContext(val) => {
                        presentation_contexts.push(val);
                    }
                    PduItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    item => {
                        return InvalidPduItemSnafu { item }.fail();
                    }
                }
            }

            Ok(Some(Pdu::AssociateRq(AssociateRq {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            })))
        }
        0x02 => {
            // A-ASSOCIATE-AC PDU Structure

            let mut application_context_name: Option<String> = None;
            let mut presentation_contexts = vec![];
            let mut user_variables = vec![];

            // 7-8 - Protocol-version
            let protocol_version = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                field: "Protocol-version",
            })?;

            // 9-10 - Reserved
            cursor
                .read_u16::<BigEndian>()
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 11-26 and 27-42 - Reserved - carry an echo of the AE titles
            // from the A-ASSOCIATE-RQ, not tested when received
            let called_ae_title = read_ae_title(&mut cursor, &codec, "Called-AE-title")?;
            let calling_ae_title = read_ae_title(&mut cursor, &codec, "Calling-AE-title")?;

            // 43-74 - Reserved
            cursor
                .seek(SeekFrom::Current(32))
                .context(ReadReservedSnafu { bytes: 32_u32 })?;

            // 75-xxx - Variable items - one application context item,
            // one or more presentation context result items
            // and one user information item
            while cursor.position() < cursor.get_ref().len() as u64 {
                match read_pdu_item(&mut cursor, &codec)? {
                    PduItem::ApplicationContext(val) => {
                        application_context_name = Some(val);
                    }
                    PduItem::PresentationContextResult(val) => {
                        presentation_contexts.push(val);
                    }
                    PduItem::UserVariables(val) => {
                        user_variables = val;
                    }
                    item => {
                        return InvalidPduItemSnafu { item }.fail();
                    }
                }
            }

            Ok(Some(Pdu::AssociateAc(AssociateAc {
                protocol_version,
                application_context_name: application_context_name
                    .context(MissingApplicationContextNameSnafu)?,
                called_ae_title,
                calling_ae_title,
                presentation_contexts,
                user_variables,
            })))
        }
        0x03 => {
            // A-ASSOCIATE-RJ PDU Structure

            // 7 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 8 - Result - 1 rejected-permanent, 2 rejected-transient
            let result = RejectResult::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Result" })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            // 9 - Source - 1 service-user, 2 service-provider (ACSE),
            // 3 service-provider (presentation)
            // 10 - Reason/Diag. - reason code scoped by the source field
            let source = RejectSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag.",
                })?,
            )
            .context(InvalidRejectSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AssociateRj(AssociateRj { result, source })))
        }
        0x04 => {
            // P-DATA-TF PDU Structure

            // 7-xxx - one or more presentation data value items
            let mut values = vec![];
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1-4 - Item-length - counts the context ID, the message
                // control header and the fragment bytes
                let item_length = cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-Length",
                })?;

                ensure!(
                    item_length >= 2,
                    InvalidItemLengthSnafu {
                        length: item_length
                    }
                );

                // 5 - Presentation-context-ID - odd integers between 1 and 255
                let context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Presentation-context-ID",
                })?;

                // 6 - Message Control Header - bit 0 set means command
                // fragment, bit 1 set means last fragment of its message
                let header = cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Message Control Header",
                })?;

                let kind = if header & 0x01 > 0 {
                    PdvKind::Command
                } else {
                    PdvKind::Data
                };
                let is_last = (header & 0x02) > 0;

                // 7-xxx - Presentation-data-value
                let data =
                    read_n(&mut cursor, (item_length - 2) as usize).context(ReadPduFieldSnafu {
                        field: "Presentation-data-value",
                    })?;

                values.push(PDataValue {
                    context_id,
                    kind,
                    is_last,
                    data,
                })
            }

            Ok(Some(Pdu::PData { data: values }))
        }
        0x05 => {
            // A-RELEASE-RQ PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Some(Pdu::ReleaseRq))
        }
        0x06 => {
            // A-RELEASE-RP PDU Structure

            // 7-10 - Reserved
            cursor
                .seek(SeekFrom::Current(4))
                .context(ReadReservedSnafu { bytes: 4_u32 })?;

            Ok(Some(Pdu::ReleaseRp))
        }
        0x07 => {
            // A-ABORT PDU Structure

            // 7-8 - Reserved
            let mut buf = [0u8; 2];
            cursor
                .read_exact(&mut buf)
                .context(ReadReservedSnafu { bytes: 2_u32 })?;

            // 9 - Source - 0 service-user, 1 reserved, 2 service-provider
            // 10 - Reason/Diag - significant only for source 2
            let source = AbortSource::from(
                cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Source" })?,
                cursor.read_u8().context(ReadPduFieldSnafu {
                    field: "Reason/Diag",
                })?,
            )
            .context(InvalidAbortSourceOrReasonSnafu)?;

            Ok(Some(Pdu::AbortRq { source }))
        }
        _ => Ok(Some(Pdu::Unknown {
            pdu_type,
            data: cursor.into_inner(),
        })),
    }
}

fn read_n<R>(reader: &mut R, bytes_to_read: usize) -> std::io::Result<Vec<u8>>
where
    R: Read,
{
    let mut result = Vec::new();
    reader.take(bytes_to_read as u64).read_to_end(&mut result)?;
    Ok(result)
}

fn read_ae_title<R>(reader: &mut R, codec: &dyn TextCodec, field: &'static str) -> Result<String>
where
    R: Read,
{
    let mut ae_bytes = [0; 16];
    reader
        .read_exact(&mut ae_bytes)
        .context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&ae_bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_uid<R>(
    reader: &mut R,
    length: usize,
    codec: &dyn TextCodec,
    field: &'static str,
) -> Result<String>
where
    R: Read,
{
    let bytes = read_n(reader, length).context(ReadPduFieldSnafu { field })?;
    Ok(codec
        .decode(&bytes)
        .context(DecodeTextSnafu { field })?
        .trim()
        .to_string())
}

fn read_pdu_item<R>(reader: &mut R, codec: &dyn TextCodec) -> Result<PduItem>
where
    R: Read,
{
    // 1 - Item-type - XXH
    let item_type = reader
        .read_u8()
        .context(ReadPduFieldSnafu { field: "Item-type" })?;

    // 2 - Reserved
    reader
        .read_u8()
        .context(ReadReservedSnafu { bytes: 1_u32 })?;

    // 3-4 - Item-length
    let item_length = reader.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
        field: "Item-length",
    })?;

    let bytes = read_n(reader, item_length as usize).context(ReadPduItemSnafu)?;
    let mut cursor = Cursor::new(bytes);

    match item_type {
        0x10 => {
            // Application Context Item Structure

            // 5-xxx - Application-context-name - structured as a UID
            let val = codec
                .decode(&cursor.into_inner())
                .context(DecodeTextSnafu {
                    field: "Application-context-name",
                })?
                .trim()
                .to_string();
            Ok(PduItem::ApplicationContext(val))
        }
        0x20 => {
            // Presentation Context Item Structure (proposed)

            let mut abstract_syntax: Option<String> = None;
            let mut transfer_syntaxes = vec![];

            // 5 - Presentation-context-ID - odd integers between 1 and 255
            let context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6-8 - Reserved
            cursor
                .seek(SeekFrom::Current(3))
                .context(ReadReservedSnafu { bytes: 3_u32 })?;

            // 9-xxx - one abstract syntax sub-item followed by
            // one or more transfer syntax sub-items
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1 - Item-type - XXH
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                // 2 - Reserved
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                // 3-4 - Item-length
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x30 => {
                        // Abstract Syntax Sub-Item Structure
                        abstract_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Abstract-syntax-name",
                        )?);
                    }
                    0x40 => {
                        // Transfer Syntax Sub-Item Structure
                        transfer_syntaxes.push(read_uid(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return UnknownPresentationContextSubItemSnafu.fail();
                    }
                }
            }

            Ok(PduItem::ProposedPresentationContext(
                ProposedPresentationContext {
                    id: context_id,
                    abstract_syntax: abstract_syntax.context(MissingAbstractSyntaxSnafu)?,
                    transfer_syntaxes,
                },
            ))
        }
        0x21 => {
            // Presentation Context Item Structure (result)

            let mut transfer_syntax: Option<String> = None;

            // 5 - Presentation-context-ID
            let context_id = cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Presentation-context-ID",
            })?;

            // 6 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 7 - Result/Reason - 0 acceptance, 1 user-rejection,
            // 2 no-reason, 3 abstract-syntax-not-supported,
            // 4 transfer-syntaxes-not-supported
            let result = ContextResult::from(cursor.read_u8().context(ReadPduFieldSnafu {
                field: "Result/Reason",
            })?)
            .context(InvalidPresentationContextResultSnafu)?;

            // 8 - Reserved
            cursor
                .read_u8()
                .context(ReadReservedSnafu { bytes: 1_u32 })?;

            // 9-xxx - one transfer syntax sub-item,
            // not significant when the result is not acceptance
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1 - Item-type - XXH
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                // 2 - Reserved
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                // 3-4 - Item-length
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x40 => {
                        // Transfer Syntax Sub-Item Structure
                        ensure!(
                            transfer_syntax.is_none(),
                            MultipleTransferSyntaxesAcceptedSnafu
                        );
                        transfer_syntax = Some(read_uid(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Transfer-syntax-name",
                        )?);
                    }
                    _ => {
                        return InvalidTransferSyntaxSubItemSnafu.fail();
                    }
                }
            }

            // some implementations omit the sub-item on rejected contexts
            let transfer_syntax = match (transfer_syntax, result) {
                (Some(ts), _) => ts,
                (None, ContextResult::Acceptance) => {
                    return MissingTransferSyntaxSnafu.fail();
                }
                (None, _) => String::new(),
            };

            Ok(PduItem::PresentationContextResult(
                PresentationContextResult {
                    id: context_id,
                    result,
                    transfer_syntax,
                },
            ))
        }
        0x50 => {
            // User Information Item Structure

            let mut user_variables = vec![];

            // 5-xxx - User-data sub-items
            while cursor.position() < cursor.get_ref().len() as u64 {
                // 1 - Item-type - XXH
                let item_type = cursor
                    .read_u8()
                    .context(ReadPduFieldSnafu { field: "Item-type" })?;

                // 2 - Reserved
                cursor
                    .read_u8()
                    .context(ReadReservedSnafu { bytes: 1_u32 })?;

                // 3-4 - Item-length
                let item_length = cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                    field: "Item-length",
                })?;

                match item_type {
                    0x51 => {
                        // Maximum Length Sub-Item Structure

                        // 5-8 - Maximum-length-received - 0 means unlimited
                        user_variables.push(UserVariable::MaxLength(
                            cursor.read_u32::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-length-received",
                            })?,
                        ));
                    }
                    0x52 => {
                        // Implementation Class UID Sub-Item Structure

                        // 5-xxx - Implementation-class-uid
                        user_variables.push(UserVariable::ImplementationClassUid(read_uid(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Implementation-class-uid",
                        )?));
                    }
                    0x53 => {
                        // Asynchronous Operations Window Sub-Item Structure

                        // 5-6 - Maximum-number-operations-invoked
                        let max_ops_invoked =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-invoked",
                            })?;

                        // 7-8 - Maximum-number-operations-performed
                        let max_ops_performed =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Maximum-number-operations-performed",
                            })?;

                        user_variables.push(UserVariable::AsyncOperationsWindow {
                            max_ops_invoked,
                            max_ops_performed,
                        });
                    }
                    0x54 => {
                        // SCP/SCU Role Selection Sub-Item Structure

                        // 5-6 - UID-length
                        let uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "UID-length",
                            })?;

                        // 7-xxx - SOP-class-uid
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            uid_length as usize,
                            codec,
                            "SOP-class-uid",
                        )?;

                        // xxx+1 - SCU-role, xxx+2 - SCP-role
                        let scu = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCU-role" })?;
                        let scp = cursor
                            .read_u8()
                            .context(ReadPduFieldSnafu { field: "SCP-role" })?;

                        user_variables.push(UserVariable::RoleSelection(RoleSelection {
                            sop_class_uid,
                            scu: scu != 0,
                            scp: scp != 0,
                        }));
                    }
                    0x55 => {
                        // Implementation Version Name Structure

                        // 5-xxx - Implementation-version-name -
                        // 1 to 16 basic G0 set characters
                        user_variables.push(UserVariable::ImplementationVersionName(read_uid(
                            &mut cursor,
                            item_length as usize,
                            codec,
                            "Implementation-version-name",
                        )?));
                    }
                    0x56 => {
                        // SOP Class Extended Negotiation Sub-Item

                        // 5-6 - SOP-class-uid-length
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;

                        // 7-xxx - SOP-class-uid
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            sop_class_uid_length as usize,
                            codec,
                            "SOP-class-uid",
                        )?;

                        // xxx-xxx - Service-class-application-information -
                        // semantics defined by the identified service class
                        let data_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-application-information-length",
                            })?;
                        let data = read_n(&mut cursor, data_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "Service-class-application-information",
                            },
                        )?;

                        user_variables
                            .push(UserVariable::SopClassExtendedNegotiation(sop_class_uid, data));
                    }
                    0x57 => {
                        // SOP Class Common Extended Negotiation Sub-Item

                        // 5-6 - SOP-class-uid-length
                        let sop_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "SOP-class-uid-length",
                            })?;

                        // 7-xxx - SOP-class-uid
                        let sop_class_uid = read_uid(
                            &mut cursor,
                            sop_class_uid_length as usize,
                            codec,
                            "SOP-class-uid",
                        )?;

                        // xxx-xxx - Service-class-uid
                        let service_class_uid_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Service-class-uid-length",
                            })?;
                        let service_class_uid = read_uid(
                            &mut cursor,
                            service_class_uid_length as usize,
                            codec,
                            "Service-class-uid",
                        )?;

                        // xxx-xxx - Related-general-sop-class-identification,
                        // a counted sequence of (UID-length, UID) fields
                        let related_total_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification-length",
                            })?;
                        let related_bytes = read_n(&mut cursor, related_total_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "Related-general-sop-class-identification",
                            })?;

                        let mut related_general_sop_classes = vec![];
                        let mut related_cursor = Cursor::new(related_bytes);
                        while related_cursor.position()
                            < related_cursor.get_ref().len() as u64
                        {
                            let uid_length = related_cursor.read_u16::<BigEndian>().context(
                                ReadPduFieldSnafu {
                                    field: "Related-general-sop-class-uid-length",
                                },
                            )?;
                            related_general_sop_classes.push(read_uid(
                                &mut related_cursor,
                                uid_length as usize,
                                codec,
                                "Related-general-sop-class-uid",
                            )?);
                        }

                        user_variables.push(UserVariable::SopClassCommonExtended(
                            CommonExtendedNegotiation {
                                sop_class_uid,
                                service_class_uid,
                                related_general_sop_classes,
                            },
                        ));
                    }
                    0x58 => {
                        // User Identity Negotiation Sub-Item (request)

                        // 5 - User-Identity-Type
                        let identity_type = cursor.read_u8().context(ReadPduFieldSnafu {
                            field: "User-Identity-type",
                        })?;

                        // 6 - Positive-response-requested
                        let positive_response_requested =
                            cursor.read_u8().context(ReadPduFieldSnafu {
                                field: "User-Identity-positive-response-requested",
                            })?;

                        // 7-8 - Primary-field-length, 9-n - Primary-field
                        let primary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field-length",
                            })?;
                        let primary_field = read_n(&mut cursor, primary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-primary-field",
                            })?;

                        // n+1-n+2 - Secondary-field-length, n+3-m -
                        // Secondary-field, non-empty only for type 2
                        let secondary_field_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field-length",
                            })?;
                        let secondary_field = read_n(&mut cursor, secondary_field_length as usize)
                            .context(ReadPduFieldSnafu {
                                field: "User-Identity-secondary-field",
                            })?;

                        match UserIdentityType::from(identity_type) {
                            Some(identity_type) => {
                                user_variables.push(UserVariable::UserIdentity(
                                    UserIdentity::new(
                                        positive_response_requested == 1,
                                        identity_type,
                                        primary_field,
                                        secondary_field,
                                    ),
                                ));
                            }
                            None => {
                                warn!("Unknown user identity type code {}", identity_type);
                            }
                        }
                    }
                    0x59 => {
                        // User Identity Negotiation Sub-Item (acknowledgement)

                        // 5-6 - Server-response-length, 7-n - Server-response
                        let response_length =
                            cursor.read_u16::<BigEndian>().context(ReadPduFieldSnafu {
                                field: "User-Identity-server-response-length",
                            })?;
                        let response = read_n(&mut cursor, response_length as usize).context(
                            ReadPduFieldSnafu {
                                field: "User-Identity-server-response",
                            },
                        )?;

                        user_variables.push(UserVariable::UserIdentityResponse(response));
                    }
                    _ => {
                        user_variables.push(UserVariable::Unknown(
                            item_type,
                            read_n(&mut cursor, item_length as usize)
                                .context(ReadPduFieldSnafu { field: "Unknown" })?,
                        ));
                    }
                }
            }

            Ok(PduItem::UserVariables(user_variables))
        }
        _ => Ok(PduItem::Unknown(item_type)),
    }
}
