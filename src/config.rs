//! Runtime configuration, read from a [ron] file.
//!
//! Every field has a default, so a file only needs to mention what differs:
//!
//! ```ron
//! (
//!     port: Some("/dev/ttyACM0"),
//!     role: Responder,
//!     node_id: 2,
//!     target_count: Some(500),
//! )
//! ```
//!
//! Durations are given in milliseconds.

use crate::command::BuildError;
use crate::engine::{EngineConfig, DEFAULT_ACK_TIMEOUT, DEFAULT_QUEUE_CAPACITY};
use crate::frame_codec::DEFAULT_PAYLOAD_DEADLINE;
use crate::session_config::{Role, SessionId, SessionParams, SUPPORTED_CHANNELS};
use crate::smoother::DEFAULT_WINDOW;
use crate::transport::{DEFAULT_BAUD_RATE, DEFAULT_POLL_INTERVAL};

use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt, fs, io, path::Path, time::Duration};

/// Everything the binary needs to bring up a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RangerConfig {
    /// Serial device; asked for interactively when absent
    pub port: Option<String>,
    /// Serial baud rate
    pub baud_rate: u32,
    /// How long one serial read may block
    pub poll_interval_ms: u64,
    /// Which side of the exchange this board plays
    pub role: Role,
    /// Session identifier shared by both boards
    pub session_id: u32,
    /// UWB channel
    pub channel: u8,
    /// Numeric id of the responder; becomes its short MAC address
    pub node_id: u32,
    /// Stop after this many valid measurements
    pub target_count: Option<u64>,
    /// Resend a command after this long without a response
    pub ack_timeout_ms: u64,
    /// Drop a gated command after this long; waits forever when absent
    pub gate_wait_timeout_ms: Option<u64>,
    /// Time allowed for a payload once its header has arrived
    pub payload_deadline_ms: u64,
    /// Samples per smoothing window
    pub window_size: usize,
    /// Bound of the command queue
    pub queue_capacity: usize,
}

impl Default for RangerConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud_rate: DEFAULT_BAUD_RATE,
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            role: Role::Initiator,
            session_id: 0x0000_0457,
            channel: 9,
            node_id: 1,
            target_count: None,
            ack_timeout_ms: DEFAULT_ACK_TIMEOUT.as_millis() as u64,
            gate_wait_timeout_ms: None,
            payload_deadline_ms: DEFAULT_PAYLOAD_DEADLINE.as_millis() as u64,
            window_size: DEFAULT_WINDOW,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Reasons a configuration cannot be used.
#[derive(Debug)]
pub enum ConfigError {
    /// The file could not be read.
    Io(io::Error),
    /// The file is not valid RON for a [RangerConfig].
    Ron(ron::de::SpannedError),
    /// The values parse but make no sense together.
    Invalid(BuildError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ConfigError::Io(error) => Cow::from(format!("io error: {}", error)),
            ConfigError::Ron(error) => Cow::from(format!("config parse error: {}", error)),
            ConfigError::Invalid(error) => Cow::from(format!("invalid config: {}", error)),
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::de::SpannedError> for ConfigError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::Ron(value)
    }
}

impl From<BuildError> for ConfigError {
    fn from(value: BuildError) -> Self {
        Self::Invalid(value)
    }
}

impl RangerConfig {
    /// Read and check a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Parse and check a config from RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: RangerConfig = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as pretty RON, the inverse of [from_ron](Self::from_ron).
    pub fn to_ron(&self) -> Result<String, ron::Error> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
    }

    /// Reject values the device or the engine cannot work with.
    pub fn validate(&self) -> Result<(), BuildError> {
        if !SUPPORTED_CHANNELS.contains(&self.channel) {
            return Err(BuildError::InvalidParameter {
                name: "channel",
                reason: Cow::from(format!(
                    "{} is not one of {:?}",
                    self.channel, SUPPORTED_CHANNELS
                )),
            });
        }
        if self.node_id > u16::MAX as u32 {
            return Err(BuildError::InvalidParameter {
                name: "node_id",
                reason: Cow::from(format!("0x{:X} does not fit a short address", self.node_id)),
            });
        }
        if self.window_size == 0 {
            return Err(BuildError::InvalidParameter {
                name: "window_size",
                reason: Cow::from("must hold at least one sample"),
            });
        }
        if self.ack_timeout_ms == 0 {
            return Err(BuildError::InvalidParameter {
                name: "ack_timeout_ms",
                reason: Cow::from("must be positive"),
            });
        }
        Ok(())
    }

    /// Session parameters for this board.
    pub fn session_params(&self) -> SessionParams {
        let mut params = SessionParams::for_node(
            SessionId(self.session_id),
            self.channel,
            self.role,
            self.node_id,
        );
        params.target_count = self.measurement_limit();
        params
    }

    /// Engine tunables.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
            gate_wait_timeout: self.gate_wait_timeout_ms.map(Duration::from_millis),
            queue_capacity: self.queue_capacity,
            window_size: self.window_size,
            target_count: self.measurement_limit(),
            payload_deadline: Duration::from_millis(self.payload_deadline_ms),
        }
    }

    /// The target count, with 0 read as no limit.
    pub fn measurement_limit(&self) -> Option<u64> {
        self.target_count.filter(|&n| n > 0)
    }

    /// Serial read timeout.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
