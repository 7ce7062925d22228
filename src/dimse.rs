//! DIMSE command set construction and interpretation.
//!
//! A command set is a flat DICOM data set of group `0000` elements,
//! always encoded in implicit VR little endian
//! regardless of the presentation context's transfer syntax.
//! This module builds command sets for the composite and normalized
//! service requests, derives responses from received requests,
//! and reads the fields which drive message dispatch.

use std::fmt;

use dicom_core::value::ConvertValueError;
use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::mem::InMemElement;
use dicom_object::{AccessError, InMemDicomObject, ReadError, WriteError};
use snafu::{Backtrace, ResultExt, Snafu};

/// The command data set type value stating
/// that no data set follows the command set.
pub const NO_DATA_SET: u16 = 0x0101;

/// Standard status codes used in responses.
pub mod status {
    /// the operation completed
    pub const SUCCESS: u16 = 0x0000;
    /// the operation was terminated by a C-CANCEL request
    pub const CANCEL: u16 = 0xFE00;
    /// the operation is still in progress
    pub const PENDING: u16 = 0xFF00;
    /// the operation is in progress with warnings (C-FIND)
    pub const PENDING_WARNING: u16 = 0xFF01;
    /// the operation could not be processed
    pub const PROCESSING_FAILURE: u16 = 0x0110;
    /// no service handler recognized the requested operation
    pub const UNRECOGNIZED_OPERATION: u16 = 0x0211;
}

#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    /// could not encode command set
    EncodeCommand {
        #[snafu(backtrace)]
        source: WriteError,
    },
    /// could not decode command set
    DecodeCommand {
        #[snafu(backtrace)]
        source: ReadError,
    },
    #[snafu(display("missing {} in command set", name))]
    MissingField {
        name: &'static str,
        source: AccessError,
    },
    #[snafu(display("invalid {} in command set", name))]
    InvalidField {
        name: &'static str,
        source: ConvertValueError,
        backtrace: Backtrace,
    },
    #[snafu(display("unrecognized command field {:#06X}", code))]
    UnknownCommandField { code: u16, backtrace: Backtrace },
    #[snafu(display("command {} takes no response", field))]
    NotARequest {
        field: CommandField,
        backtrace: Backtrace,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The value of the command field element,
/// identifying the service primitive carried by a command set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandField {
    CStoreRq,
    CStoreRsp,
    CGetRq,
    CGetRsp,
    CFindRq,
    CFindRsp,
    CMoveRq,
    CMoveRsp,
    CEchoRq,
    CEchoRsp,
    NEventReportRq,
    NEventReportRsp,
    NGetRq,
    NGetRsp,
    NSetRq,
    NSetRsp,
    NActionRq,
    NActionRsp,
    NCreateRq,
    NCreateRsp,
    NDeleteRq,
    NDeleteRsp,
    CCancelRq,
}

impl CommandField {
    /// The wire value of this command field.
    pub fn code(self) -> u16 {
        match self {
            CommandField::CStoreRq => 0x0001,
            CommandField::CStoreRsp => 0x8001,
            CommandField::CGetRq => 0x0010,
            CommandField::CGetRsp => 0x8010,
            CommandField::CFindRq => 0x0020,
            CommandField::CFindRsp => 0x8020,
            CommandField::CMoveRq => 0x0021,
            CommandField::CMoveRsp => 0x8021,
            CommandField::CEchoRq => 0x0030,
            CommandField::CEchoRsp => 0x8030,
            CommandField::NEventReportRq => 0x0100,
            CommandField::NEventReportRsp => 0x8100,
            CommandField::NGetRq => 0x0110,
            CommandField::NGetRsp => 0x8110,
            CommandField::NSetRq => 0x0120,
            CommandField::NSetRsp => 0x8120,
            CommandField::NActionRq => 0x0130,
            CommandField::NActionRsp => 0x8130,
            CommandField::NCreateRq => 0x0140,
            CommandField::NCreateRsp => 0x8140,
            CommandField::NDeleteRq => 0x0150,
            CommandField::NDeleteRsp => 0x8150,
            CommandField::CCancelRq => 0x0FFF,
        }
    }

    /// Interpret a command field wire value.
    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            0x0001 => CommandField::CStoreRq,
            0x8001 => CommandField::CStoreRsp,
            0x0010 => CommandField::CGetRq,
            0x8010 => CommandField::CGetRsp,
            0x0020 => CommandField::CFindRq,
            0x8020 => CommandField::CFindRsp,
            0x0021 => CommandField::CMoveRq,
            0x8021 => CommandField::CMoveRsp,
            0x0030 => CommandField::CEchoRq,
            0x8030 => CommandField::CEchoRsp,
            0x0100 => CommandField::NEventReportRq,
            0x8100 => CommandField::NEventReportRsp,
            0x0110 => CommandField::NGetRq,
            0x8110 => CommandField::NGetRsp,
            0x0120 => CommandField::NSetRq,
            0x8120 => CommandField::NSetRsp,
            0x0130 => CommandField::NActionRq,
            0x8130 => CommandField::NActionRsp,
            0x0140 => CommandField::NCreateRq,
            0x8140 => CommandField::NCreateRsp,
            0x0150 => CommandField::NDeleteRq,
            0x8150 => CommandField::NDeleteRsp,
            0x0FFF => CommandField::CCancelRq,
            _ => return None,
        })
    }

    /// Whether this is a response to an operation.
    pub fn is_response(self) -> bool {
        self.code() & 0x8000 != 0
    }

    /// Whether this is an operation-initiating request.
    /// C-CANCEL is neither a request nor a response under this notion.
    pub fn is_request(self) -> bool {
        !self.is_response() && self != CommandField::CCancelRq
    }

    /// The response field answering this request field.
    pub fn response(self) -> Option<Self> {
        if !self.is_request() {
            return None;
        }
        Self::from_code(self.code() | 0x8000)
    }
}

impl fmt::Display for CommandField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandField::CStoreRq => "C-STORE-RQ",
            CommandField::CStoreRsp => "C-STORE-RSP",
            CommandField::CGetRq => "C-GET-RQ",
            CommandField::CGetRsp => "C-GET-RSP",
            CommandField::CFindRq => "C-FIND-RQ",
            CommandField::CFindRsp => "C-FIND-RSP",
            CommandField::CMoveRq => "C-MOVE-RQ",
            CommandField::CMoveRsp => "C-MOVE-RSP",
            CommandField::CEchoRq => "C-ECHO-RQ",
            CommandField::CEchoRsp => "C-ECHO-RSP",
            CommandField::NEventReportRq => "N-EVENT-REPORT-RQ",
            CommandField::NEventReportRsp => "N-EVENT-REPORT-RSP",
            CommandField::NGetRq => "N-GET-RQ",
            CommandField::NGetRsp => "N-GET-RSP",
            CommandField::NSetRq => "N-SET-RQ",
            CommandField::NSetRsp => "N-SET-RSP",
            CommandField::NActionRq => "N-ACTION-RQ",
            CommandField::NActionRsp => "N-ACTION-RSP",
            CommandField::NCreateRq => "N-CREATE-RQ",
            CommandField::NCreateRsp => "N-CREATE-RSP",
            CommandField::NDeleteRq => "N-DELETE-RQ",
            CommandField::NDeleteRsp => "N-DELETE-RSP",
            CommandField::CCancelRq => "C-CANCEL-RQ",
        };
        f.write_str(name)
    }
}

/// The priority of a composite service request.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// The wire value of this priority.
    pub fn code(self) -> u16 {
        match self {
            Priority::Low => 0x0002,
            Priority::Medium => 0x0000,
            Priority::High => 0x0001,
        }
    }
}

/// The broad meaning of a response status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// the operation completed (0000H)
    Success,
    /// more responses will follow (FF00H, FF01H)
    Pending,
    /// the operation was canceled on request (FE00H)
    Cancel,
    /// the operation completed with caveats
    Warning,
    /// the operation failed
    Failure,
}

impl StatusClass {
    /// Classify a status code.
    pub fn of(status: u16) -> StatusClass {
        match status {
            0x0000 => StatusClass::Success,
            status if status & 0xFF00 == 0xFF00 => StatusClass::Pending,
            0xFE00 => StatusClass::Cancel,
            0x0001 | 0x0107 | 0x0116 => StatusClass::Warning,
            status if (0xB000..=0xBFFF).contains(&status) => StatusClass::Warning,
            _ => StatusClass::Failure,
        }
    }

    /// Whether a response with this status completes its operation.
    pub fn is_terminal(self) -> bool {
        self != StatusClass::Pending
    }
}

/// Build a C-ECHO request command set.
pub fn echo_rq(message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.10008.1.1"),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CEchoRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
    ])
}

/// Build a C-STORE request command set.
pub fn store_rq(
    message_id: u16,
    affected_sop_class_uid: &str,
    affected_sop_instance_uid: &str,
    priority: Priority,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CStoreRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority.code()])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_instance_uid),
        ),
    ])
}

/// Build a C-FIND request command set.
/// The query identifier travels as the message data set.
pub fn find_rq(message_id: u16, affected_sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    composite_rq(
        CommandField::CFindRq,
        message_id,
        affected_sop_class_uid,
        priority,
    )
}

/// Build a C-GET request command set.
pub fn get_rq(message_id: u16, affected_sop_class_uid: &str, priority: Priority) -> InMemDicomObject {
    composite_rq(
        CommandField::CGetRq,
        message_id,
        affected_sop_class_uid,
        priority,
    )
}

/// Build a C-MOVE request command set,
/// directing the matched instances to the application entity
/// named by `move_destination`.
pub fn move_rq(
    message_id: u16,
    affected_sop_class_uid: &str,
    priority: Priority,
    move_destination: &str,
) -> InMemDicomObject {
    let mut elements = composite_rq_elements(
        CommandField::CMoveRq,
        message_id,
        affected_sop_class_uid,
        priority,
    );
    elements.push(DataElement::new(
        tags::MOVE_DESTINATION,
        VR::AE,
        dicom_value!(Str, move_destination),
    ));
    InMemDicomObject::command_from_element_iter(elements)
}

fn composite_rq(
    field: CommandField,
    message_id: u16,
    affected_sop_class_uid: &str,
    priority: Priority,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(composite_rq_elements(
        field,
        message_id,
        affected_sop_class_uid,
        priority,
    ))
}

fn composite_rq_elements(
    field: CommandField,
    message_id: u16,
    affected_sop_class_uid: &str,
    priority: Priority,
) -> Vec<InMemElement> {
    vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [field.code()])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [priority.code()])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
    ]
}

/// Build a C-CANCEL request command set
/// for the operation invoked under the given message ID.
pub fn cancel_rq(message_id_being_responded_to: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::CCancelRq.code()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id_being_responded_to]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
    ])
}

/// Build an N-EVENT-REPORT request command set.
pub fn n_event_report_rq(
    message_id: u16,
    affected_sop_class_uid: &str,
    affected_sop_instance_uid: &str,
    event_type_id: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::NEventReportRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_instance_uid),
        ),
        DataElement::new(
            tags::EVENT_TYPE_ID,
            VR::US,
            dicom_value!(U16, [event_type_id]),
        ),
    ])
}

/// Build an N-GET request command set.
pub fn n_get_rq(
    message_id: u16,
    requested_sop_class_uid: &str,
    requested_sop_instance_uid: &str,
) -> InMemDicomObject {
    normalized_rq(
        CommandField::NGetRq,
        message_id,
        requested_sop_class_uid,
        requested_sop_instance_uid,
        NO_DATA_SET,
    )
}

/// Build an N-SET request command set.
/// The modification list travels as the message data set.
pub fn n_set_rq(
    message_id: u16,
    requested_sop_class_uid: &str,
    requested_sop_instance_uid: &str,
) -> InMemDicomObject {
    normalized_rq(
        CommandField::NSetRq,
        message_id,
        requested_sop_class_uid,
        requested_sop_instance_uid,
        0x0000,
    )
}

/// Build an N-ACTION request command set.
pub fn n_action_rq(
    message_id: u16,
    requested_sop_class_uid: &str,
    requested_sop_instance_uid: &str,
    action_type_id: u16,
) -> InMemDicomObject {
    let mut elements = normalized_rq_elements(
        CommandField::NActionRq,
        message_id,
        requested_sop_class_uid,
        requested_sop_instance_uid,
        NO_DATA_SET,
    );
    elements.push(DataElement::new(
        tags::ACTION_TYPE_ID,
        VR::US,
        dicom_value!(U16, [action_type_id]),
    ));
    InMemDicomObject::command_from_element_iter(elements)
}

/// Build an N-CREATE request command set.
/// The SOP instance UID may be left for the performer to assign.
pub fn n_create_rq(
    message_id: u16,
    affected_sop_class_uid: &str,
    affected_sop_instance_uid: Option<&str>,
) -> InMemDicomObject {
    let mut elements = vec![
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, affected_sop_class_uid),
        ),
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [CommandField::NCreateRq.code()]),
        ),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
    ];
    if let Some(uid) = affected_sop_instance_uid {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid),
        ));
    }
    InMemDicomObject::command_from_element_iter(elements)
}

/// Build an N-DELETE request command set.
pub fn n_delete_rq(
    message_id: u16,
    requested_sop_class_uid: &str,
    requested_sop_instance_uid: &str,
) -> InMemDicomObject {
    normalized_rq(
        CommandField::NDeleteRq,
        message_id,
        requested_sop_class_uid,
        requested_sop_instance_uid,
        NO_DATA_SET,
    )
}

fn normalized_rq(
    field: CommandField,
    message_id: u16,
    requested_sop_class_uid: &str,
    requested_sop_instance_uid: &str,
    data_set_type: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter(normalized_rq_elements(
        field,
        message_id,
        requested_sop_class_uid,
        requested_sop_instance_uid,
        data_set_type,
    ))
}

fn normalized_rq_elements(
    field: CommandField,
    message_id: u16,
    requested_sop_class_uid: &str,
    requested_sop_instance_uid: &str,
    data_set_type: u16,
) -> Vec<InMemElement> {
    vec![
        DataElement::new(
            tags::REQUESTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, requested_sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [field.code()])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [data_set_type]),
        ),
        DataElement::new(
            tags::REQUESTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, requested_sop_instance_uid),
        ),
    ]
}

/// Derive a response command set answering the given request,
/// echoing its message ID and SOP class/instance references.
///
/// The returned command set declares no data set;
/// sending it with one overrides the declaration.
pub fn response(request: &InMemDicomObject, status: u16) -> Result<InMemDicomObject> {
    let field = command_field(request)?;
    let response_field = field
        .response()
        .ok_or_else(|| NotARequestSnafu { field }.build())?;

    let mut elements = vec![
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [response_field.code()]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id(request)?]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status])),
    ];
    if let Some(uid) = opt_str(request, tags::AFFECTED_SOP_CLASS_UID)
        .or_else(|| opt_str(request, tags::REQUESTED_SOP_CLASS_UID))
    {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, uid.as_str()),
        ));
    }
    if let Some(uid) = opt_str(request, tags::AFFECTED_SOP_INSTANCE_UID)
        .or_else(|| opt_str(request, tags::REQUESTED_SOP_INSTANCE_UID))
    {
        elements.push(DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, uid.as_str()),
        ));
    }

    Ok(InMemDicomObject::command_from_element_iter(elements))
}

/// Build the failure response for an operation
/// which no service handler recognizes.
pub(crate) fn unrecognized_operation_rsp(field_code: u16, message_id: u16) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::COMMAND_FIELD,
            VR::US,
            dicom_value!(U16, [field_code | 0x8000]),
        ),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [NO_DATA_SET]),
        ),
        DataElement::new(
            tags::STATUS,
            VR::US,
            dicom_value!(U16, [status::UNRECOGNIZED_OPERATION]),
        ),
    ])
}

/// Encode a command set in implicit VR little endian.
pub fn encode_command(command: &InMemDicomObject) -> Result<Vec<u8>> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    let mut data = Vec::with_capacity(128);
    command
        .write_dataset_with_ts(&mut data, &ts)
        .context(EncodeCommandSnafu)?;
    Ok(data)
}

/// Decode a command set from its implicit VR little endian form.
pub fn decode_command(data: &[u8]) -> Result<InMemDicomObject> {
    let ts = dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN.erased();
    InMemDicomObject::read_dataset_with_ts(data, &ts).context(DecodeCommandSnafu)
}

/// The service primitive carried by a command set.
pub fn command_field(command: &InMemDicomObject) -> Result<CommandField> {
    let code = u16_field(command, tags::COMMAND_FIELD, "CommandField")?;
    CommandField::from_code(code).ok_or_else(|| UnknownCommandFieldSnafu { code }.build())
}

/// The raw command field value, for reporting on unrecognized commands.
pub fn command_field_code(command: &InMemDicomObject) -> Result<u16> {
    u16_field(command, tags::COMMAND_FIELD, "CommandField")
}

/// The message ID of a request command set.
pub fn message_id(command: &InMemDicomObject) -> Result<u16> {
    u16_field(command, tags::MESSAGE_ID, "MessageID")
}

/// The message ID a response or cancel command set refers to.
pub fn message_id_being_responded_to(command: &InMemDicomObject) -> Result<u16> {
    u16_field(
        command,
        tags::MESSAGE_ID_BEING_RESPONDED_TO,
        "MessageIDBeingRespondedTo",
    )
}

/// The status code of a response command set.
pub fn status(command: &InMemDicomObject) -> Result<u16> {
    u16_field(command, tags::STATUS, "Status")
}

/// Whether the command set announces an accompanying data set.
pub fn has_data_set(command: &InMemDicomObject) -> Result<bool> {
    let value = u16_field(command, tags::COMMAND_DATA_SET_TYPE, "CommandDataSetType")?;
    Ok(value != NO_DATA_SET)
}

/// The affected SOP class UID, looking up the requested SOP class UID
/// for the normalized services which use that element instead.
pub fn affected_sop_class_uid(command: &InMemDicomObject) -> Result<String> {
    match opt_str(command, tags::AFFECTED_SOP_CLASS_UID)
        .or_else(|| opt_str(command, tags::REQUESTED_SOP_CLASS_UID))
    {
        Some(uid) => Ok(uid),
        None => str_field(command, tags::AFFECTED_SOP_CLASS_UID, "AffectedSOPClassUID"),
    }
}

/// The affected SOP instance UID, looking up the requested
/// SOP instance UID for the normalized services.
pub fn affected_sop_instance_uid(command: &InMemDicomObject) -> Result<String> {
    match opt_str(command, tags::AFFECTED_SOP_INSTANCE_UID)
        .or_else(|| opt_str(command, tags::REQUESTED_SOP_INSTANCE_UID))
    {
        Some(uid) => Ok(uid),
        None => str_field(
            command,
            tags::AFFECTED_SOP_INSTANCE_UID,
            "AffectedSOPInstanceUID",
        ),
    }
}

/// Declare whether a data set follows this command set.
pub(crate) fn set_data_set_present(command: &mut InMemDicomObject, present: bool) {
    let value = if present { 0x0000 } else { NO_DATA_SET };
    command.put(DataElement::new(
        tags::COMMAND_DATA_SET_TYPE,
        VR::US,
        dicom_value!(U16, [value]),
    ));
}

fn u16_field(command: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<u16> {
    command
        .element(tag)
        .context(MissingFieldSnafu { name })?
        .to_int::<u16>()
        .context(InvalidFieldSnafu { name })
}

fn str_field(command: &InMemDicomObject, tag: Tag, name: &'static str) -> Result<String> {
    Ok(command
        .element(tag)
        .context(MissingFieldSnafu { name })?
        .to_str()
        .context(InvalidFieldSnafu { name })?
        .trim_end_matches(['\0', ' '])
        .to_string())
}

fn opt_str(command: &InMemDicomObject, tag: Tag) -> Option<String> {
    let text = command.element(tag).ok()?.to_str().ok()?;
    let text = text.trim_end_matches(['\0', ' ']);
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use dicom_dictionary_std::uids;

    use super::*;

    #[test]
    fn echo_command_survives_the_wire() {
        let rq = echo_rq(12);
        let encoded = encode_command(&rq).unwrap();
        let decoded = decode_command(&encoded).unwrap();

        assert_eq!(command_field(&decoded).unwrap(), CommandField::CEchoRq);
        assert_eq!(message_id(&decoded).unwrap(), 12);
        assert!(!has_data_set(&decoded).unwrap());
    }

    #[test]
    fn store_request_announces_its_data_set() {
        let rq = store_rq(
            1,
            uids::CT_IMAGE_STORAGE,
            "1.2.3.4.5.6",
            Priority::Medium,
        );

        assert_eq!(command_field(&rq).unwrap(), CommandField::CStoreRq);
        assert!(has_data_set(&rq).unwrap());
        assert_eq!(affected_sop_class_uid(&rq).unwrap(), uids::CT_IMAGE_STORAGE);
        assert_eq!(affected_sop_instance_uid(&rq).unwrap(), "1.2.3.4.5.6");
    }

    #[test]
    fn normalized_requests_use_the_requested_sop_elements() {
        let rq = n_get_rq(5, "1.2.840.10008.5.1.4.39.1", "1.2.3.4");

        assert_eq!(command_field(&rq).unwrap(), CommandField::NGetRq);
        assert_eq!(
            affected_sop_class_uid(&rq).unwrap(),
            "1.2.840.10008.5.1.4.39.1"
        );
        assert_eq!(affected_sop_instance_uid(&rq).unwrap(), "1.2.3.4");
        assert!(!has_data_set(&rq).unwrap());
    }

    #[test]
    fn response_echoes_the_request() {
        let rq = find_rq(7, uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND, Priority::High);
        let rsp = response(&rq, status::PENDING).unwrap();

        assert_eq!(command_field(&rsp).unwrap(), CommandField::CFindRsp);
        assert_eq!(message_id_being_responded_to(&rsp).unwrap(), 7);
        assert_eq!(status(&rsp).unwrap(), 0xFF00);
        assert_eq!(
            affected_sop_class_uid(&rsp).unwrap(),
            uids::STUDY_ROOT_QUERY_RETRIEVE_INFORMATION_MODEL_FIND
        );
        assert!(!has_data_set(&rsp).unwrap());

        // a response answers nothing
        assert!(matches!(
            response(&rsp, status::SUCCESS),
            Err(Error::NotARequest {
                field: CommandField::CFindRsp,
                ..
            })
        ));
    }

    #[test]
    fn cancel_refers_to_the_original_operation() {
        let rq = cancel_rq(1001);
        assert_eq!(command_field(&rq).unwrap(), CommandField::CCancelRq);
        assert_eq!(message_id_being_responded_to(&rq).unwrap(), 1001);
        assert!(!has_data_set(&rq).unwrap());
    }

    #[test]
    fn data_set_declaration_can_be_overridden() {
        let mut rq = echo_rq(2);
        assert!(!has_data_set(&rq).unwrap());
        set_data_set_present(&mut rq, true);
        assert!(has_data_set(&rq).unwrap());
    }

    #[test]
    fn command_field_codes_map_both_ways() {
        assert_eq!(CommandField::from_code(0x8020), Some(CommandField::CFindRsp));
        assert_eq!(CommandField::from_code(0x4444), None);
        assert_eq!(CommandField::CGetRq.response(), Some(CommandField::CGetRsp));
        assert_eq!(CommandField::CCancelRq.response(), None);
        assert_eq!(CommandField::CStoreRsp.response(), None);
        assert!(CommandField::NActionRq.is_request());
        assert!(!CommandField::CCancelRq.is_request());
        assert!(!CommandField::CCancelRq.is_response());
    }

    #[test]
    fn status_codes_classify_by_range() {
        let cases = [
            (0x0000, StatusClass::Success),
            (0xFF00, StatusClass::Pending),
            (0xFF01, StatusClass::Pending),
            (0xFE00, StatusClass::Cancel),
            (0x0001, StatusClass::Warning),
            (0x0107, StatusClass::Warning),
            (0xB007, StatusClass::Warning),
            (0xA700, StatusClass::Failure),
            (0x0211, StatusClass::Failure),
            (0xC001, StatusClass::Failure),
        ];
        for (code, expected) in cases {
            assert_eq!(StatusClass::of(code), expected, "status {:#06X}", code);
        }
        assert!(StatusClass::of(0x0000).is_terminal());
        assert!(!StatusClass::of(0xFF00).is_terminal());
    }

    #[test]
    fn unrecognized_operations_are_answered_with_0211() {
        let rsp = unrecognized_operation_rsp(0x0042, 9);
        assert_eq!(command_field_code(&rsp).unwrap(), 0x8042);
        assert_eq!(message_id_being_responded_to(&rsp).unwrap(), 9);
        assert_eq!(status(&rsp).unwrap(), status::UNRECOGNIZED_OPERATION);
    }
}
