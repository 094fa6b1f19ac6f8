//! Framing for the UCI serial link.
//!
//! Outbound, every command is wrapped in the bridge's envelope:
//!
//! ```text
//! [0x01, 0x00, len, ...command]
//! ```
//!
//! Inbound, the device sends bare UCI packets: a 4 byte header followed by
//! the payload. When bit 7 of the second header byte is set the payload
//! length spans header bytes 2 and 3, `(byte[3] << 8) | byte[2]`; otherwise
//! it is just `byte[3]`.

use crate::command::Command;
use crate::transport::Transport;

use log::trace;
use nom::{
    combinator::map,
    number::complete::u8 as byte,
    sequence::tuple,
    Finish, IResult,
};
use std::{
    borrow::Cow,
    fmt, io,
    time::{Duration, Instant},
};

/// Size of an inbound UCI header.
pub const HEADER_LEN: usize = 4;

/// Default time allowed for a declared payload to arrive in full.
pub const DEFAULT_PAYLOAD_DEADLINE: Duration = Duration::from_secs(1);

const ENVELOPE_MARKER: u8 = 0x01;
const ENVELOPE_RESERVED: u8 = 0x00;
const EXTENDED_LENGTH_FLAG: u8 = 0x80;
const OPCODE_MASK: u8 = 0x3F;

/// Message type bits of the first header byte.
const MT_MASK: u8 = 0xF0;
const MT_RESPONSE: u8 = 0x40;

/// A decoded inbound header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// First header byte: message type and group
    pub class: u8,
    /// Opcode, with the extended length bit masked off
    pub subtype: u8,
    /// Whether the length used the two byte form
    pub extended: bool,
    /// Number of payload bytes that follow
    pub declared_length: usize,
    /// The header exactly as received
    pub raw: [u8; HEADER_LEN],
}

impl FrameHeader {
    /// Responses to commands all share the same message type nibble.
    pub fn is_response(&self) -> bool {
        self.class & MT_MASK == MT_RESPONSE
    }

    /// Group identifier, low nibble of the class byte.
    pub fn group(&self) -> u8 {
        self.class & 0x0F
    }
}

/// A header together with a payload of exactly the declared length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    header: FrameHeader,
    payload: Vec<u8>,
}

impl Frame {
    /// Pair a header with its payload. Fails if the payload is not exactly
    /// as long as the header says.
    pub fn new(header: FrameHeader, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() != header.declared_length {
            return Err(FrameError::PayloadLengthMismatch {
                header: header.raw,
                expected: header.declared_length,
                actual: payload.len(),
            });
        }
        Ok(Self { header, payload })
    }

    /// The frame's header.
    pub fn header(&self) -> &FrameHeader {
        &self.header
    }

    /// The frame's payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Things that go wrong while pulling frames off the link.
#[derive(Debug)]
pub enum FrameError {
    /// Fewer than four header bytes arrived.
    InvalidHeader {
        /// Whatever header bytes did arrive
        bytes: Vec<u8>,
    },

    /// The payload came up short of the declared length.
    PayloadLengthMismatch {
        /// Header of the offending frame
        header: [u8; HEADER_LEN],
        /// Declared payload length
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// The link itself failed. Unlike the other variants this one is fatal.
    Transport(io::Error),
}

impl FrameError {
    /// Whether the receiver has to give up after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Transport(_))
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            FrameError::InvalidHeader { bytes } => Cow::from(format!(
                "UCI header is not valid, got {} of {} bytes [{}]",
                bytes.len(),
                HEADER_LEN,
                hex(bytes)
            )),
            FrameError::PayloadLengthMismatch {
                header,
                expected,
                actual,
            } => Cow::from(format!(
                "expected {} payload bytes, received {} (header [{}])",
                expected,
                actual,
                hex(header)
            )),
            FrameError::Transport(error) => Cow::from(format!("transport error: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for FrameError {}

impl From<io::Error> for FrameError {
    fn from(value: io::Error) -> Self {
        Self::Transport(value)
    }
}

/// Space separated hex, the way frames show up in the logs.
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wrap a command in the serial bridge envelope.
pub fn encode(command: &Command) -> Vec<u8> {
    let bytes = command.bytes();
    let mut packet = Vec::with_capacity(bytes.len() + 3);
    // `Command` guarantees the length fits in a byte
    packet.extend_from_slice(&[ENVELOPE_MARKER, ENVELOPE_RESERVED, bytes.len() as u8]);
    packet.extend_from_slice(bytes);
    packet
}

/// Build an inbound UCI packet, header and payload. Payloads longer than
/// 255 bytes use the extended length form. This is what the device side of
/// the link sends.
pub fn encode_frame(class: u8, subtype: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len();
    let mut packet = Vec::with_capacity(HEADER_LEN + len);
    if len > u8::MAX as usize {
        packet.extend_from_slice(&[
            class,
            (subtype & OPCODE_MASK) | EXTENDED_LENGTH_FLAG,
            (len & 0xFF) as u8,
            ((len >> 8) & 0xFF) as u8,
        ]);
    } else {
        packet.extend_from_slice(&[class, subtype & OPCODE_MASK, 0x00, len as u8]);
    }
    packet.extend_from_slice(payload);
    packet
}

fn parse_header(input: &[u8]) -> IResult<&[u8], FrameHeader> {
    map(tuple((byte, byte, byte, byte)), |(b0, b1, b2, b3)| {
        let extended = b1 & EXTENDED_LENGTH_FLAG != 0;
        let declared_length = if extended {
            ((b3 as usize) << 8) | b2 as usize
        } else {
            b3 as usize
        };

        FrameHeader {
            class: b0,
            subtype: b1 & OPCODE_MASK,
            extended,
            declared_length,
            raw: [b0, b1, b2, b3],
        }
    })(input)
}

/// Decode the 4 header bytes at the start of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
    match parse_header(bytes).finish() {
        Ok((_remaining, header)) => Ok(header),
        Err(_) => Err(FrameError::InvalidHeader {
            bytes: bytes.to_vec(),
        }),
    }
}

/// Keep reading until `buf` is full or `deadline` passes. Returns how many
/// bytes were filled.
fn fill(transport: &dyn Transport, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..])?;
        filled += n;
        if n == 0 && Instant::now() >= deadline {
            break;
        }
    }
    Ok(filled)
}

/// Read exactly `header.declared_length` payload bytes, or fail with
/// [FrameError::PayloadLengthMismatch] if they do not all show up before
/// `deadline`.
pub fn read_payload(
    transport: &dyn Transport,
    header: FrameHeader,
    deadline: Duration,
) -> Result<Frame, FrameError> {
    let mut payload = vec![0u8; header.declared_length];
    let got = fill(transport, &mut payload, Instant::now() + deadline)?;
    payload.truncate(got);
    Frame::new(header, payload)
}

/// Read one frame. Returns `Ok(None)` when the link was idle for a whole
/// read timeout. A header that starts arriving but does not finish within
/// `deadline` is an [FrameError::InvalidHeader].
pub fn read_frame(
    transport: &dyn Transport,
    deadline: Duration,
) -> Result<Option<Frame>, FrameError> {
    let mut header = [0u8; HEADER_LEN];
    let first = transport.read(&mut header)?;
    if first == 0 {
        return Ok(None);
    }

    let started = Instant::now();
    let got = first + fill(transport, &mut header[first..], started + deadline)?;
    let header = decode_header(&header[..got])?;
    let frame = read_payload(transport, header, deadline)?;
    trace!(
        "rx [{}] [{}]",
        hex(&frame.header.raw),
        hex(frame.payload())
    );
    Ok(Some(frame))
}
