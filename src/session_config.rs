//! Builders for the UCI commands that bring up a ranging session.
//!
//! Everything in here is pure: parameters go in, [Command]s come out. The
//! generic app config is a fixed template (DS-TWR, deferred, unicast, AoA
//! results requested) where only the session id and channel vary.

use crate::command::{
    BuildError, Command, GID_CORE, GID_RANGING, GID_SESSION, GID_VENDOR, OID_RANGE_START,
    OID_RANGE_STOP, OID_SESSION_DEINIT, OID_SESSION_INIT, OID_SESSION_SET_APP_CONFIG,
};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::{borrow::Cow, fmt};

/// Channels the radio can be configured for.
pub const SUPPORTED_CHANNELS: [u8; 8] = [5, 6, 8, 9, 10, 12, 13, 14];

/// Session type byte for a FiRa ranging session.
const SESSION_TYPE_RANGING: u8 = 0x00;

/// A 4 byte session identifier, sent little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

impl SessionId {
    /// The identifier as it appears on the wire.
    pub fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

/// Which end of the two-way ranging exchange this board plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Role {
    /// Controller, sends the poll.
    Initiator,
    /// Controlee, answers the poll.
    Responder,
}

impl Role {
    fn device_type(self) -> u8 {
        match self {
            Role::Initiator => 0x01,
            Role::Responder => 0x00,
        }
    }

    fn device_role(self) -> u8 {
        match self {
            Role::Initiator => 0x01,
            Role::Responder => 0x00,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "Initiator"),
            Role::Responder => write!(f, "Responder"),
        }
    }
}

/// All the knobs needed to build a session's command sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionParams {
    /// Session identifier shared by both boards
    pub session_id: SessionId,
    /// UWB channel number
    pub channel: u8,
    /// Our side of the exchange
    pub role: Role,
    /// Our short MAC address
    pub local_mac: u32,
    /// The other board's short MAC address
    pub peer_mac: u32,
    /// Number of valid measurements after which the session is stopped
    pub target_count: Option<u64>,
}

impl SessionParams {
    /// Derive MAC addresses from a node id. The initiator always sits at
    /// 0x0000 and talks to the responder at `node_id`; a responder sits at
    /// `node_id` and talks back to 0x0000.
    pub fn for_node(session_id: SessionId, channel: u8, role: Role, node_id: u32) -> Self {
        let (local_mac, peer_mac) = match role {
            Role::Initiator => (0x0000, node_id),
            Role::Responder => (node_id, 0x0000),
        };

        Self {
            session_id,
            channel,
            role,
            local_mac,
            peer_mac,
            target_count: None,
        }
    }
}

/// How a template parameter gets its value.
enum ParamValue {
    Fixed(&'static [u8]),
    Channel,
}

use ParamValue::{Channel, Fixed};

/// Generic session app configuration. Tags are one byte for FiRa
/// parameters and two bytes (0xE3 prefix) for the proprietary ones.
const APP_CONFIG_TEMPLATE: &[(&[u8], ParamValue)] = &[
    (&[0x01], Fixed(&[0x02])),                   // RANGING_ROUND_USAGE: DS-TWR deferred
    (&[0x02], Fixed(&[0x00])),                   // STS_CONFIG: static
    (&[0x03], Fixed(&[0x00])),                   // MULTI_NODE_MODE: unicast
    (&[0x04], Channel),                          // CHANNEL_NUMBER
    (&[0x05], Fixed(&[0x01])),                   // NUMBER_OF_CONTROLEES
    (&[0x08], Fixed(&[0x60, 0x09])),             // SLOT_DURATION: 2400 rstu
    (&[0x09], Fixed(&[0xD8, 0x00, 0x00, 0x00])), // RANGING_INTERVAL: 216 ms
    (&[0x0B], Fixed(&[0x00])),                   // MAC_FCS_TYPE: CRC16
    (&[0x0C], Fixed(&[0x03])),                   // RANGING_ROUND_CONTROL
    (&[0x0D], Fixed(&[0x01])),                   // AOA_RESULT_REQ
    (&[0x0E], Fixed(&[0x01])),                   // RANGE_DATA_NTF_CONFIG
    (&[0x0F], Fixed(&[0x00, 0x00])),             // RANGE_DATA_NTF_PROXIMITY_NEAR
    (&[0x10], Fixed(&[0x20, 0x4E])),             // RANGE_DATA_NTF_PROXIMITY_FAR
    (&[0x12], Fixed(&[0x03])),                   // RFRAME_CONFIG: SP3
    (&[0x14], Fixed(&[0x0A])),                   // PREAMBLE_CODE_INDEX
    (&[0x15], Fixed(&[0x00])),                   // SFD_ID
    (&[0x16], Fixed(&[0x00])),                   // PSDU_DATA_RATE
    (&[0x17], Fixed(&[0x01])),                   // PREAMBLE_DURATION
    (&[0x1A], Fixed(&[0x01])),                   // RANGING_TIME_STRUCT
    (&[0x1B], Fixed(&[0x12])),                   // SLOTS_PER_RR
    (&[0x1C], Fixed(&[0x00])),                   // TX_ADAPTIVE_PAYLOAD_POWER
    (&[0x1E], Fixed(&[0x01])),                   // RESPONDER_SLOT_INDEX
    (&[0x1F], Fixed(&[0x00])),                   // PRF_MODE
    (&[0x22], Fixed(&[0x01])),                   // SCHEDULED_MODE
    (&[0x23], Fixed(&[0x00])),                   // KEY_ROTATION
    (&[0x24], Fixed(&[0x00])),                   // KEY_ROTATION_RATE
    (&[0x25], Fixed(&[0x32])),                   // SESSION_PRIORITY
    (&[0x26], Fixed(&[0x00])),                   // MAC_ADDRESS_MODE: short
    (&[0x29], Fixed(&[0x01])),                   // NUMBER_OF_STS_SEGMENTS
    (&[0x2A], Fixed(&[0x00, 0x00])),             // MAX_RR_RETRY: unlimited
    (&[0x2C], Fixed(&[0x00])),                   // HOPPING_MODE
    (&[0x2F], Fixed(&[0x00])),                   // IN_BAND_TERMINATION_ATTEMPT_COUNT
    (&[0xE3, 0x00], Fixed(&[0x02])),             // TOA_MODE
    (&[0xE3, 0x01], Fixed(&[0x76])),             // CIR_CAPTURE_MODE
    (&[0xE3, 0x05], Fixed(&[0x03])),             // SESSION_SYNC_ATTEMPTS
    (&[0xE3, 0x06], Fixed(&[0x03])),             // SESSION_SCHED_ATTEMPTS
    (&[0xE3, 0x07], Fixed(&[0x00])),             // SCHED_STATUS_NTF
    (&[0xE3, 0x08], Fixed(&[0x00])),             // TX_POWER_DELTA_FCC
    (&[0xE3, 0x09], Fixed(&[0x00])),             // TEST_KDF_FEATURE
    (&[0xE3, 0x0A], Fixed(&[0x01])),             // DUAL_AOA_PREAMBLE_STS
    (&[0xE3, 0x0B], Fixed(&[0x00])),             // TX_POWER_TEMP_COMPENSATION
    (&[0xE3, 0x0E], Fixed(&[0x00])),             // RX_MODE
    (&[0xE3, 0x0F], Fixed(&[0x04])),             // RX_ANTENNA_SELECTION
    (&[0xE3, 0x10], Fixed(&[0x01])),             // TX_ANTENNA_SELECTION
    (&[0xE3, 0x11], Fixed(&[0x32])),             // MAX_CONTENTION_PHASE_LENGTH
    (&[0xE3, 0x12], Fixed(&[0x05])),             // CONTENTION_PHASE_UPDATE_LENGTH
    (&[0xE3, 0x15], Fixed(&[0x03])),             // MAC_CFG
];

const TAG_DEVICE_TYPE: u8 = 0x00;
const TAG_DEVICE_MAC_ADDRESS: u8 = 0x06;
const TAG_DST_MAC_ADDRESS: u8 = 0x07;
const TAG_DEVICE_ROLE: u8 = 0x11;

/// Appends TLV parameters after a session id and patches in the count.
struct ParamWriter {
    payload: Vec<u8>,
    count: u8,
}

impl ParamWriter {
    fn new(session_id: SessionId) -> Self {
        let mut payload = session_id.to_bytes().to_vec();
        // parameter count, filled in by `finish`
        payload.push(0);
        Self { payload, count: 0 }
    }

    fn push(&mut self, tag: &[u8], value: &[u8]) {
        self.payload.extend_from_slice(tag);
        self.payload.push(value.len() as u8);
        self.payload.extend_from_slice(value);
        self.count += 1;
    }

    fn finish(mut self) -> Vec<u8> {
        self.payload[4] = self.count;
        self.payload
    }
}

fn short_mac(name: &'static str, mac: u32) -> Result<[u8; 2], BuildError> {
    u16::try_from(mac)
        .map(u16::to_le_bytes)
        .map_err(|_| BuildError::InvalidParameter {
            name,
            reason: Cow::from(format!("0x{:X} does not fit in a 2 byte short address", mac)),
        })
}

fn check_channel(channel: u8) -> Result<u8, BuildError> {
    if SUPPORTED_CHANNELS.contains(&channel) {
        Ok(channel)
    } else {
        Err(BuildError::InvalidParameter {
            name: "channel",
            reason: Cow::from(format!(
                "channel {} is not one of {:?}",
                channel, SUPPORTED_CHANNELS
            )),
        })
    }
}

/// Infallible constructor for the short fixed commands below.
fn fixed(group: u8, opcode: u8, payload: &[u8]) -> Command {
    Command::from_short_parts(group, opcode, payload)
}

/// CORE_DEVICE_RESET
pub fn device_reset() -> Command {
    fixed(GID_CORE, 0x00, &[0x00])
}

/// CORE_GET_DEVICE_INFO
pub fn device_info() -> Command {
    fixed(GID_CORE, 0x02, &[])
}

/// CORE_GET_CAPS_INFO
pub fn device_capabilities() -> Command {
    fixed(GID_CORE, 0x03, &[])
}

/// CORE_SET_CONFIG with only LOW_POWER_MODE.
pub fn low_power_mode(enabled: bool) -> Command {
    fixed(GID_CORE, 0x04, &[0x01, 0x01, 0x01, enabled as u8])
}

/// Vendor command telling the firmware which board it runs on.
pub fn board_variant(variant: u8, revision: u8) -> Command {
    fixed(GID_VENDOR, 0x00, &[variant, revision])
}

/// SESSION_INIT for a ranging session.
pub fn session_init(session_id: SessionId) -> Command {
    let mut payload = session_id.to_bytes().to_vec();
    payload.push(SESSION_TYPE_RANGING);
    fixed(GID_SESSION, OID_SESSION_INIT, &payload)
}

/// SESSION_DEINIT
pub fn session_deinit(session_id: SessionId) -> Command {
    fixed(GID_SESSION, OID_SESSION_DEINIT, &session_id.to_bytes())
}

/// RANGE_START
pub fn range_start(session_id: SessionId) -> Command {
    fixed(GID_RANGING, OID_RANGE_START, &session_id.to_bytes())
}

/// RANGE_STOP
pub fn range_stop(session_id: SessionId) -> Command {
    fixed(GID_RANGING, OID_RANGE_STOP, &session_id.to_bytes())
}

/// SESSION_SET_APP_CONFIG carrying the generic template for `channel`.
pub fn app_config(session_id: SessionId, channel: u8) -> Result<Command, BuildError> {
    let channel = check_channel(channel)?;
    let mut writer = ParamWriter::new(session_id);
    for (tag, value) in APP_CONFIG_TEMPLATE {
        match value {
            Fixed(bytes) => writer.push(tag, bytes),
            Channel => writer.push(tag, &[channel]),
        }
    }

    Command::from_parts(GID_SESSION, OID_SESSION_SET_APP_CONFIG, &writer.finish())
}

/// SESSION_SET_APP_CONFIG carrying the role specific parameters: device
/// type, own and destination short addresses and device role.
pub fn role_config(
    session_id: SessionId,
    role: Role,
    local_mac: u32,
    peer_mac: u32,
) -> Result<Command, BuildError> {
    let local = short_mac("local_mac", local_mac)?;
    let peer = short_mac("peer_mac", peer_mac)?;

    let mut writer = ParamWriter::new(session_id);
    writer.push(&[TAG_DEVICE_TYPE], &[role.device_type()]);
    writer.push(&[TAG_DEVICE_MAC_ADDRESS], &local);
    writer.push(&[TAG_DST_MAC_ADDRESS], &peer);
    writer.push(&[TAG_DEVICE_ROLE], &[role.device_role()]);

    Command::from_parts(GID_SESSION, OID_SESSION_SET_APP_CONFIG, &writer.finish())
}

/// The full bring-up sequence for one session. When a non-zero target count
/// is set the stop and deinit commands are queued too; the stop only goes
/// out once the stop condition is raised.
pub fn startup_sequence(params: &SessionParams) -> Result<Vec<Command>, BuildError> {
    let id = params.session_id;
    let mut commands = vec![
        device_reset(),
        device_info(),
        session_init(id),
        app_config(id, params.channel)?,
        role_config(id, params.role, params.local_mac, params.peer_mac)?,
        range_start(id),
    ];

    if params.target_count.map_or(false, |n| n > 0) {
        commands.push(range_stop(id));
        commands.push(session_deinit(id));
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandClass;

    const ID: SessionId = SessionId(0x0000_0457);

    #[test]
    fn fixed_commands() {
        assert_eq!(device_reset().bytes(), &[0x20, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            session_init(ID).bytes(),
            &[0x21, 0x00, 0x00, 0x05, 0x57, 0x04, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            range_stop(ID).bytes(),
            &[0x22, 0x01, 0x00, 0x04, 0x57, 0x04, 0x00, 0x00]
        );
        assert_eq!(
            session_deinit(ID).bytes(),
            &[0x21, 0x01, 0x00, 0x04, 0x57, 0x04, 0x00, 0x00]
        );
        assert_eq!(
            board_variant(0x2A, 0x03).bytes(),
            &[0x2E, 0x00, 0x00, 0x02, 0x2A, 0x03]
        );
    }

    #[test]
    fn core_commands() {
        assert_eq!(device_info().bytes(), &[0x20, 0x02, 0x00, 0x00]);
        assert_eq!(device_capabilities().bytes(), &[0x20, 0x03, 0x00, 0x00]);
        assert_eq!(
            low_power_mode(false).bytes(),
            &[0x20, 0x04, 0x00, 0x04, 0x01, 0x01, 0x01, 0x00]
        );
        assert_eq!(
            low_power_mode(true).bytes(),
            &[0x20, 0x04, 0x00, 0x04, 0x01, 0x01, 0x01, 0x01]
        );
        assert_eq!(device_capabilities().class(), CommandClass::Unrestricted);
        assert_eq!(low_power_mode(true).class(), CommandClass::Unrestricted);
    }

    #[test]
    fn app_config_template() {
        let cmd = app_config(ID, 9).unwrap();
        let bytes = cmd.bytes();

        assert_eq!(&bytes[..4], &[0x21, 0x03, 0x00, 0xA8]);
        assert_eq!(bytes.len(), 4 + 0xA8);
        assert_eq!(&bytes[4..8], &ID.to_bytes());
        assert_eq!(bytes[8], 0x2F);
        // RANGING_ROUND_USAGE, STS_CONFIG, MULTI_NODE_MODE, then the channel
        assert_eq!(&bytes[18..21], &[0x04, 0x01, 0x09]);
        assert_eq!(cmd.class(), CommandClass::Configure);
    }

    #[test]
    fn app_config_rejects_channel() {
        assert!(matches!(
            app_config(ID, 7),
            Err(BuildError::InvalidParameter {
                name: "channel",
                ..
            })
        ));
    }

    #[test]
    fn initiator_role_config() {
        let cmd = role_config(ID, Role::Initiator, 0x0000, 0x0001).unwrap();
        assert_eq!(
            cmd.bytes(),
            &[
                0x21, 0x03, 0x00, 0x13, 0x57, 0x04, 0x00, 0x00, 0x04, 0x00, 0x01, 0x01, 0x06,
                0x02, 0x00, 0x00, 0x07, 0x02, 0x01, 0x00, 0x11, 0x01, 0x01
            ]
        );
    }

    #[test]
    fn responder_role_config() {
        let params = SessionParams::for_node(ID, 9, Role::Responder, 0x0102);
        let cmd = role_config(ID, params.role, params.local_mac, params.peer_mac).unwrap();
        assert_eq!(&cmd.bytes()[9..12], &[0x00, 0x01, 0x00]);
        assert_eq!(&cmd.bytes()[12..16], &[0x06, 0x02, 0x02, 0x01]);
        assert_eq!(&cmd.bytes()[16..20], &[0x07, 0x02, 0x00, 0x00]);
        assert_eq!(&cmd.bytes()[20..23], &[0x11, 0x01, 0x00]);
    }

    #[test]
    fn role_config_rejects_wide_mac() {
        let res = role_config(ID, Role::Initiator, 0x1_0000, 0x0001);
        assert!(matches!(
            res,
            Err(BuildError::InvalidParameter {
                name: "local_mac",
                ..
            })
        ));
    }

    #[test]
    fn startup_sequence_with_target() {
        let mut params = SessionParams::for_node(ID, 9, Role::Initiator, 1);
        assert_eq!(startup_sequence(&params).unwrap().len(), 6);

        params.target_count = Some(0);
        assert_eq!(startup_sequence(&params).unwrap().len(), 6);

        params.target_count = Some(10);
        let classes: Vec<_> = startup_sequence(&params)
            .unwrap()
            .iter()
            .map(Command::class)
            .collect();
        assert_eq!(
            classes,
            vec![
                CommandClass::Unrestricted,
                CommandClass::Unrestricted,
                CommandClass::Unrestricted,
                CommandClass::Configure,
                CommandClass::Configure,
                CommandClass::Start,
                CommandClass::Stop,
                CommandClass::Finalize,
            ]
        );
    }
}
