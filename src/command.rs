//! Outbound UCI commands.
//!
//! A [Command] is an immutable byte sequence: a two byte GID/OID pair, a
//! reserved byte, a one byte payload length, then the payload. Once built it
//! is never modified; the dispatcher may send the same [Command] several
//! times when the device does not answer.

use std::{borrow::Cow, fmt};

/// Core group: reset, device info, core config.
pub const GID_CORE: u8 = 0x20;
/// Session control group: init, deinit, app config.
pub const GID_SESSION: u8 = 0x21;
/// Ranging control group: start, stop.
pub const GID_RANGING: u8 = 0x22;
/// Vendor specific group.
pub const GID_VENDOR: u8 = 0x2E;

pub(crate) const OID_SESSION_INIT: u8 = 0x00;
pub(crate) const OID_SESSION_DEINIT: u8 = 0x01;
pub(crate) const OID_SESSION_SET_APP_CONFIG: u8 = 0x03;
pub(crate) const OID_RANGE_START: u8 = 0x00;
pub(crate) const OID_RANGE_STOP: u8 = 0x01;

/// The envelope carries the command length in a single byte.
pub const MAX_COMMAND_LEN: usize = u8::MAX as usize;

const HEADER_LEN: usize = 4;

/// Which session gate, if any, must be open before a command may go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandClass {
    /// Session app configuration, needs the session to be initialized.
    Configure,
    /// Range start, needs an idle (or active) session.
    Start,
    /// Range stop, needs an active session and a raised stop condition.
    Stop,
    /// Session deinit.
    Finalize,
    /// Everything else is sent as soon as it reaches the head of the queue.
    Unrestricted,
}

/// Returned when command bytes cannot be built from the given parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// A parameter is out of the range the protocol can represent.
    InvalidParameter {
        /// Name of the offending parameter
        name: &'static str,
        /// What was wrong with it
        reason: Cow<'static, str>,
    },

    /// The raw bytes do not form a well shaped UCI command.
    MalformedCommand(Cow<'static, str>),
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            BuildError::InvalidParameter { name, reason } => {
                Cow::from(format!("invalid parameter `{}`: {}", name, reason))
            }
            BuildError::MalformedCommand(reason) => {
                Cow::from(format!("malformed command: {}", reason))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for BuildError {}

/// A single UCI command, ready to be framed and written to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    bytes: Vec<u8>,
}

impl Command {
    /// Wrap raw command bytes, checking that the declared payload length
    /// matches and that the whole thing fits in the envelope.
    pub fn new(bytes: Vec<u8>) -> Result<Self, BuildError> {
        if bytes.len() < HEADER_LEN {
            return Err(BuildError::MalformedCommand(Cow::from(format!(
                "{} bytes is shorter than a command header",
                bytes.len()
            ))));
        }
        if bytes.len() > MAX_COMMAND_LEN {
            return Err(BuildError::MalformedCommand(Cow::from(format!(
                "{} bytes does not fit in the envelope length byte",
                bytes.len()
            ))));
        }
        let declared = bytes[3] as usize;
        let actual = bytes.len() - HEADER_LEN;
        if declared != actual {
            return Err(BuildError::MalformedCommand(Cow::from(format!(
                "header declares {} payload bytes but {} follow",
                declared, actual
            ))));
        }

        Ok(Self { bytes })
    }

    /// Assemble a command from its group, opcode and payload.
    pub fn from_parts(group: u8, opcode: u8, payload: &[u8]) -> Result<Self, BuildError> {
        if payload.len() > MAX_COMMAND_LEN - HEADER_LEN {
            return Err(BuildError::MalformedCommand(Cow::from(format!(
                "payload of {} bytes is too long",
                payload.len()
            ))));
        }
        Ok(Self::from_short_parts(group, opcode, payload))
    }

    /// [from_parts](Self::from_parts) for payloads known to fit, such as the
    /// fixed ones the session builders use.
    pub(crate) fn from_short_parts(group: u8, opcode: u8, payload: &[u8]) -> Self {
        debug_assert!(payload.len() <= MAX_COMMAND_LEN - HEADER_LEN);
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&[group, opcode, 0x00, payload.len() as u8]);
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    /// The raw command bytes, header included.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Group identifier, first header byte.
    pub fn group(&self) -> u8 {
        self.bytes[0]
    }

    /// Opcode identifier, second header byte.
    pub fn opcode(&self) -> u8 {
        self.bytes[1]
    }

    /// The gate class this command falls in.
    pub fn class(&self) -> CommandClass {
        match (self.group(), self.opcode()) {
            (GID_SESSION, OID_SESSION_SET_APP_CONFIG) => CommandClass::Configure,
            (GID_SESSION, OID_SESSION_DEINIT) => CommandClass::Finalize,
            (GID_RANGING, OID_RANGE_START) => CommandClass::Start,
            (GID_RANGING, OID_RANGE_STOP) => CommandClass::Stop,
            _ => CommandClass::Unrestricted,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}/{:02X} ({} bytes)",
            self.group(),
            self.opcode(),
            self.bytes.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_parts_writes_length() {
        let cmd = Command::from_parts(GID_RANGING, OID_RANGE_START, &[0x57, 0x04, 0x00, 0x00])
            .unwrap();
        assert_eq!(cmd.bytes(), &[0x22, 0x00, 0x00, 0x04, 0x57, 0x04, 0x00, 0x00]);
        assert_eq!(cmd.class(), CommandClass::Start);
    }

    #[test]
    fn new_rejects_length_mismatch() {
        let res = Command::new(vec![0x20, 0x00, 0x00, 0x02, 0x00]);
        assert!(matches!(res, Err(BuildError::MalformedCommand(_))));
    }

    #[test]
    fn new_rejects_oversized() {
        let mut bytes = vec![0x21, 0x03, 0x00, 0xFF];
        bytes.extend(std::iter::repeat(0).take(255));
        assert!(Command::new(bytes).is_err());
        assert!(Command::from_parts(GID_SESSION, 0x03, &[0; 252]).is_err());
        assert!(Command::from_parts(GID_SESSION, 0x03, &[0; 251]).is_ok());
    }

    #[test]
    fn classes() {
        let class = |g, o| Command::from_parts(g, o, &[]).unwrap().class();
        assert_eq!(class(0x21, 0x03), CommandClass::Configure);
        assert_eq!(class(0x22, 0x01), CommandClass::Stop);
        assert_eq!(class(0x21, 0x01), CommandClass::Finalize);
        assert_eq!(class(0x21, 0x00), CommandClass::Unrestricted);
        assert_eq!(class(0x20, 0x00), CommandClass::Unrestricted);
    }
}
