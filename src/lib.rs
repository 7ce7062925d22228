//! An implementation of the DICOM upper layer protocol
//! for communication between application entities over TCP.
//!
//! This crate covers:
//!
//! - the protocol data unit (PDU) structures and their binary codec,
//!   in the [`pdu`] module;
//! - association negotiation and the ACSE state machine,
//!   in the [`association`] module;
//! - DIMSE command set construction and message exchange,
//!   in the [`dimse`] module.
//!
//! An association is requested with [`ClientAssociationOptions`]
//! and accepted with [`ServerAssociationOptions`].
//! Once established, either end invokes operations with
//! [`Association::send_request`] and performs the peer's operations
//! through its [`DimseHandler`].
//!
//! # Example
//!
//! Verify a connection with a C-ECHO exchange:
//!
//! ```no_run
//! use std::sync::mpsc;
//! use dicom_net::association::{ClientAssociationOptions, ResponseHandler};
//! use dicom_net::dimse;
//! use dicom_object::InMemDicomObject;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! struct Reply(mpsc::Sender<u16>);
//!
//! impl ResponseHandler for Reply {
//!     fn on_response(&mut self, command: &InMemDicomObject, _dataset: Option<Vec<u8>>) {
//!         let _ = self.0.send(dimse::status(command).unwrap_or(0xC000));
//!     }
//!     fn on_close(&mut self, _cause: Arc<dicom_net::association::Error>) {}
//! }
//!
//! let association = ClientAssociationOptions::new()
//!     .with_abstract_syntax("1.2.840.10008.1.1")
//!     .calling_ae_title("ECHOSCU")
//!     .establish_with("MAIN-STORAGE@10.0.0.100:104")?;
//!
//! let context = association
//!     .presentation_contexts()
//!     .iter()
//!     .find(|pc| pc.is_accepted())
//!     .expect("accepted presentation context")
//!     .clone();
//!
//! let (tx, rx) = mpsc::channel();
//! let message_id = association.generate_message_id();
//! let echo = dimse::echo_rq(message_id);
//! association.send_request(context.id, echo, None, Box::new(Reply(tx)))?;
//! assert_eq!(rx.recv()?, 0x0000);
//!
//! association.release()?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod association;
pub mod dimse;
pub mod pdu;
pub mod runtime;
pub mod transport;

pub use address::{AeAddr, FullAeAddr};
pub use association::{
    Association, ClientAssociationOptions, DimseHandler, ServerAssociationOptions,
};
pub use pdu::{read_pdu, write_pdu, Pdu};

/// The name of the application context supported by this crate.
pub const APPLICATION_CONTEXT_NAME: &str = "1.2.840.10008.3.1.1.1";

/// The implementation class UID which this crate
/// announces during association negotiation.
pub const IMPLEMENTATION_CLASS_UID: &str = "2.25.305828436682527875804212944814458574148";

/// The implementation version name which this crate
/// announces during association negotiation.
pub const IMPLEMENTATION_VERSION_NAME: &str = "dicom-net-0.1.0";
