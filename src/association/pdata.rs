use std::collections::VecDeque;
use std::io::{Read, Write};

use bytes::BytesMut;

use crate::pdu::{read_pdu, PDataValue, Pdu, PdvKind};

/// Fill in the P-DATA-TF envelope of a staged fragment buffer.
///
/// Pre-condition:
/// the buffer starts with the 12 envelope bytes laid out by the writer.
fn setup_pdata_header(buffer: &mut [u8], kind: PdvKind, is_last: bool) {
    let data_len = (buffer.len() - 12) as u32;

    // full PDU length (everything past the PDU type and reserved byte)
    let pdu_len = data_len + 4 + 2;
    buffer[2..6].copy_from_slice(&pdu_len.to_be_bytes());

    // presentation data value length (control bytes plus payload)
    let pdv_len = data_len + 2;
    buffer[6..10].copy_from_slice(&pdv_len.to_be_bytes());

    // message control header:
    // bit 0 marks a command fragment, bit 1 marks the last fragment
    let mut control = 0x00;
    if kind == PdvKind::Command {
        control |= 0x01;
    }
    if is_last {
        control |= 0x02;
    }
    buffer[11] = control;
}

/// Largest fragment payload fitting in a PDU
/// whose length property may not exceed `pdu_len`.
#[inline]
fn max_fragment_len(pdu_len: u32) -> u32 {
    // PDV length: 4 bytes, control bytes: 2
    pdu_len.saturating_sub(4 + 2).max(1)
}

/// A writer of one message fragment stream.
///
/// Bytes written through the [standard writer](std::io::Write) interface
/// are staged into presentation data value fragments of a single message,
/// each emitted as its own P-DATA-TF PDU
/// once the negotiated maximum PDU length is reached.
/// Calling [`finish`](PDataWriter::finish) (or dropping the writer)
/// emits the remaining bytes in a final fragment
/// with the last-fragment control bit set.
///
/// # Example
///
/// ```
/// use std::io::Write as _;
/// use dicom_net::association::PDataWriter;
/// use dicom_net::pdu::PdvKind;
///
/// # fn main() -> std::io::Result<()> {
/// let mut out = Vec::new();
/// let mut writer = PDataWriter::new(&mut out, 1, PdvKind::Data, 16_384);
/// writer.write_all(&[0x08, 0x00, 0x18, 0x00])?;
/// writer.finish()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct PDataWriter<W: Write> {
    buffer: BytesMut,
    stream: W,
    kind: PdvKind,
    max_data_len: u32,
}

impl<W> PDataWriter<W>
where
    W: Write,
{
    /// Construct a new fragment writer
    /// for a message on the given presentation context.
    ///
    /// `max_pdu_length` is the maximum PDU length property
    /// announced by the receiving node.
    pub fn new(stream: W, context_id: u8, kind: PdvKind, max_pdu_length: u32) -> Self {
        let max_data_len = max_fragment_len(max_pdu_length);
        let mut buffer = BytesMut::with_capacity(max_data_len as usize + 12);
        buffer.extend([
            // PDU type + reserved byte
            0x04,
            0x00,
            // full PDU length, filled in on dispatch
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation data value length, filled in on dispatch
            0xFF,
            0xFF,
            0xFF,
            0xFF,
            // presentation context ID
            context_id,
            // message control header, filled in on dispatch
            0xFF,
        ]);

        PDataWriter {
            buffer,
            stream,
            kind,
            max_data_len,
        }
    }

    /// Declare the message complete,
    /// emitting the last fragment PDU.
    ///
    /// This is also done automatically once the writer is dropped.
    pub fn finish(mut self) -> std::io::Result<()> {
        self.finish_impl()
    }

    fn finish_impl(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            setup_pdata_header(&mut self.buffer, self.kind, true);
            self.stream.write_all(&self.buffer)?;
            // leave nothing behind for `Drop` to send again
            self.buffer.clear();
        }
        Ok(())
    }

    /// Emit the staged bytes as one non-final fragment PDU.
    ///
    /// Pre-condition:
    /// the buffer holds a full fragment payload.
    fn dispatch_pdu(&mut self) -> std::io::Result<()> {
        debug_assert!(self.buffer.len() >= 12);
        setup_pdata_header(&mut self.buffer, self.kind, false);
        self.stream.write_all(&self.buffer)?;

        // back to just the envelope
        self.buffer.truncate(12);

        Ok(())
    }
}

impl<W> Write for PDataWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let total_len = self.max_data_len as usize + 12;
        if self.buffer.len() + buf.len() <= total_len {
            // stage for later
            self.buffer.extend(buf);
            Ok(buf.len())
        } else {
            // fill the fragment to the brim, emit it,
            // leave the rest for subsequent writes
            let buf = &buf[..total_len - self.buffer.len()];
            self.buffer.extend(buf);
            debug_assert_eq!(self.buffer.len(), total_len);
            self.dispatch_pdu()?;
            Ok(buf.len())
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        // fragments only go out full or final
        Ok(())
    }
}

/// Emits the last fragment PDU if there is any data left to send.
impl<W> Drop for PDataWriter<W>
where
    W: Write,
{
    fn drop(&mut self) {
        let _ = self.finish_impl();
    }
}

/// A reader of one message fragment stream.
///
/// The [standard reader](std::io::Read) interface yields the payload
/// bytes of consecutive presentation data value fragments,
/// fetching further P-DATA-TF PDUs from the underlying stream
/// until the last fragment of the message is consumed.
///
/// All fragments must belong to the same presentation context:
/// a fragment on any other context aborts the read
/// with an [`InvalidData`](std::io::ErrorKind::InvalidData) error.
/// Any other PDU type interrupting the message
/// ends the read with an error as well,
/// and the offending PDU can be recovered through
/// [`take_interrupting_pdu`](PDataReader::take_interrupting_pdu).
///
/// # Example
///
/// ```
/// use std::io::Read as _;
/// use dicom_net::association::PDataReader;
/// use dicom_net::pdu::{write_pdu, PDataValue, Pdu, PdvKind, DEFAULT_MAX_PDU};
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mut stream = std::collections::VecDeque::new();
/// write_pdu(
///     &mut stream,
///     &Pdu::PData {
///         data: vec![PDataValue {
///             context_id: 1,
///             kind: PdvKind::Data,
///             is_last: true,
///             data: vec![0x08, 0x00],
///         }],
///     },
/// )?;
///
/// let mut reader = PDataReader::new(&mut stream, DEFAULT_MAX_PDU);
/// let mut dataset = Vec::new();
/// reader.read_to_end(&mut dataset)?;
/// assert_eq!(dataset, [0x08, 0x00]);
/// # Ok(())
/// # }
/// ```
#[must_use]
pub struct PDataReader<R> {
    buffer: VecDeque<u8>,
    stream: R,
    context_id: Option<u8>,
    max_pdu_length: u32,
    last_pdu: bool,
    interrupting: Option<Pdu>,
}

impl<R> PDataReader<R> {
    /// Construct a new fragment reader,
    /// bound to the presentation context of the first fragment read.
    pub fn new(stream: R, max_pdu_length: u32) -> Self {
        PDataReader {
            buffer: VecDeque::new(),
            stream,
            context_id: None,
            max_pdu_length,
            last_pdu: false,
            interrupting: None,
        }
    }

    /// Construct a fragment reader for a message already in progress,
    /// absorbing the data fragments
    /// which arrived alongside its command fragments.
    pub(crate) fn preloaded(
        stream: R,
        context_id: u8,
        max_pdu_length: u32,
        initial: Vec<PDataValue>,
    ) -> std::io::Result<Self> {
        let mut reader = PDataReader {
            buffer: VecDeque::new(),
            stream,
            context_id: Some(context_id),
            max_pdu_length,
            last_pdu: false,
            interrupting: None,
        };
        reader.absorb(initial)?;
        Ok(reader)
    }

    /// The PDU which cut the message short, if any.
    pub fn take_interrupting_pdu(&mut self) -> Option<Pdu> {
        self.interrupting.take()
    }

    /// Whether the last fragment of the message was consumed.
    pub fn is_complete(&self) -> bool {
        self.last_pdu && self.buffer.is_empty()
    }

    fn absorb(&mut self, values: Vec<PDataValue>) -> std::io::Result<()> {
        for pdv in values {
            if pdv.kind != PdvKind::Data {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "command fragment while reading a data set",
                ));
            }
            match self.context_id {
                None => self.context_id = Some(pdv.context_id),
                Some(id) if id == pdv.context_id => {}
                Some(id) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!(
                            "data set fragment on presentation context {} (expected {})",
                            pdv.context_id, id
                        ),
                    ));
                }
            }
            self.buffer.extend(pdv.data);
            self.last_pdu = pdv.is_last;
        }
        Ok(())
    }
}

impl<R> Read for PDataReader<R>
where
    R: Read,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        while self.buffer.is_empty() {
            if self.last_pdu {
                // reached the end of the message
                return Ok(0);
            }

            match read_pdu(&mut self.stream, self.max_pdu_length, false)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
            {
                Some(Pdu::PData { data }) => self.absorb(data)?,
                Some(pdu) => {
                    self.interrupting = Some(pdu);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "data set interrupted by another PDU",
                    ));
                }
                None => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "connection closed while reading a data set",
                    ))
                }
            }
        }
        Read::read(&mut self.buffer, buf)
    }
}
