//! Turns validated [Frame]s into typed [Notification]s.
//!
//! Classification looks at the first header byte and the opcode. Range data
//! notifications are picked apart with nom; all multi-byte fields are
//! little-endian and the angles are Q9.7 fixed point.
//!
//! Range data payload layout (offsets in bytes):
//!
//! ```text
//!  0..4   sequence counter
//!  27     status (0 = ok)
//!  28     NLoS flag
//!  29..31 distance, cm
//!  31..33 azimuth, Q9.7 degrees
//!  33     azimuth figure of merit
//!  34..36 elevation, Q9.7 degrees
//!  36     elevation figure of merit
//!  66..68 PDoA 1, Q9.7 degrees     (only when the payload is over 71 bytes)
//!  70..72 PDoA 2, Q9.7 degrees
//!  72..   CIR samples, 4 bytes each
//! ```

use crate::frame_codec::Frame;
use crate::session_config::SessionId;
use crate::session_state::SessionState;

use nom::{
    bytes::complete::take,
    combinator::map,
    number::complete::{le_u16, le_u32, u8 as byte},
    sequence::{preceded, tuple},
    Finish, IResult,
};
use std::{borrow::Cow, fmt, iter::FusedIterator, slice::ChunksExact};

const CLASS_CORE_NTF: u8 = 0x60;
const CLASS_SESSION_NTF: u8 = 0x61;
const CLASS_RANGE_NTF: u8 = 0x62;

const OID_DEVICE_STATUS: u8 = 0x01;
const OID_SESSION_STATUS: u8 = 0x02;
const OID_GENERIC_ERROR: u8 = 0x07;
const OID_RANGE_DATA: u8 = 0x00;

/// Generic error status asking the host to resend the last command.
const STATUS_COMMAND_RETRY: u8 = 0x0A;

const SESSION_STATUS_LEN: usize = 6;
const PDOA_THRESHOLD: usize = 71;
const CIR_OFFSET: usize = 72;
const CIR_SAMPLE_LEN: usize = 4;

/// Q9.7: 9 integer bits (sign included) and 7 fractional bits.
const Q97_FRACTION_BITS: u32 = 7;
const Q97_SCALE: f64 = (1u32 << Q97_FRACTION_BITS) as f64;

/// Sign extend the low `bits` bits of `raw`.
pub fn twos_comp(raw: u32, bits: u32) -> i64 {
    let raw = raw as i64;
    if raw & (1 << (bits - 1)) != 0 {
        raw - (1 << bits)
    } else {
        raw
    }
}

/// Decode a Q9.7 fixed point value.
pub fn decode_q97(raw: u16) -> f64 {
    twos_comp(raw as u32, 16) as f64 / Q97_SCALE
}

/// Encode a value as Q9.7, rounding to the nearest step of 1/128.
pub fn encode_q97(value: f64) -> u16 {
    ((value * Q97_SCALE).round() as i16) as u16
}

/// Round to `decimals` places, ties to even. A Q9.7 value scaled by 10 is
/// exact, so angles ending in .25 or .75 land on true ties.
fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round_ties_even() / scale
}

/// One distance and angle-of-arrival result.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeMeasurement {
    /// Sequence counter of the ranging round
    pub sequence: u32,
    /// Ranging status, always 0 for a measurement
    pub status: u8,
    /// Non-line-of-sight flag
    pub nlos: bool,
    /// Distance in centimeters
    pub distance_cm: u16,
    /// Azimuth in degrees, one decimal
    pub azimuth_deg: f64,
    /// Azimuth figure of merit
    pub azimuth_fom: u8,
    /// Elevation in degrees, one decimal
    pub elevation_deg: f64,
    /// Elevation figure of merit
    pub elevation_fom: u8,
    /// Phase difference of arrival, first antenna pair
    pub pdoa1_deg: Option<f64>,
    /// Phase difference of arrival, second antenna pair
    pub pdoa2_deg: Option<f64>,
}

/// Raw channel impulse response bytes captured with a measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CirData {
    bytes: Vec<u8>,
}

impl CirData {
    /// Number of complex samples.
    pub fn len(&self) -> usize {
        self.bytes.len() / CIR_SAMPLE_LEN
    }

    /// Whether there are no samples at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A fresh iterator over the sample magnitudes.
    pub fn samples(&self) -> CirSamples<'_> {
        cir_magnitudes(&self.bytes)
    }
}

/// Magnitudes of complex CIR samples, decoded as they are pulled.
#[derive(Debug, Clone)]
pub struct CirSamples<'a> {
    chunks: ChunksExact<'a, u8>,
}

impl<'a> Iterator for CirSamples<'a> {
    type Item = f64;

    fn next(&mut self) -> Option<Self::Item> {
        self.chunks.next().map(|chunk| {
            let real = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
            let imaginary = i16::from_le_bytes([chunk[2], chunk[3]]) as f64;
            real.hypot(imaginary)
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.chunks.size_hint()
    }
}

impl ExactSizeIterator for CirSamples<'_> {}

impl FusedIterator for CirSamples<'_> {}

/// Iterate over the magnitudes of the 4 byte (real, imaginary) groups in
/// `bytes`. A trailing partial group is ignored.
pub fn cir_magnitudes(bytes: &[u8]) -> CirSamples<'_> {
    CirSamples {
        chunks: bytes.chunks_exact(CIR_SAMPLE_LEN),
    }
}

/// A decoded range data notification with a valid measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeData {
    /// The measurement itself
    pub measurement: RangeMeasurement,
    /// CIR samples, when the device appended them
    pub cir: Option<CirData>,
}

/// A session status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStatus {
    /// Session the status refers to
    pub session_id: SessionId,
    /// Raw state code
    pub state_code: u8,
    /// Reason for the state change
    pub reason: u8,
}

impl SessionStatus {
    /// The reported state, if the code is one we know.
    pub fn state(&self) -> Option<SessionState> {
        SessionState::from_code(self.state_code)
    }
}

/// Everything the device can tell us, as far as this driver cares.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// Response to the command in flight.
    CommandResponse {
        /// Group of the answered command
        group: u8,
        /// Opcode of the answered command
        opcode: u8,
        /// First payload byte, the status code
        status: Option<u8>,
    },
    /// The device wants the last command again, right away.
    RetryRequest,
    /// Core device status.
    DeviceStatus {
        /// Device state code
        state: u8,
    },
    /// A session changed state.
    SessionStatus(SessionStatus),
    /// A valid ranging result.
    RangeData(RangeData),
    /// A ranging round that failed on the device.
    RangingError {
        /// Sequence counter of the failed round
        sequence: u32,
        /// Non-zero status byte
        status: u8,
    },
    /// Anything else; logged and dropped.
    Unrecognized {
        /// First header byte
        class: u8,
        /// Opcode
        subtype: u8,
        /// Payload length
        length: usize,
    },
}

/// A frame whose header was fine but whose payload was not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The payload ends before a field that must be there.
    Truncated {
        /// What was being decoded
        what: &'static str,
        /// Payload length
        length: usize,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            DecodeError::Truncated { what, length } => {
                Cow::from(format!("{} payload truncated at {} bytes", what, length))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for DecodeError {}

fn parse_range_head(input: &[u8]) -> IResult<&[u8], (u32, u8)> {
    tuple((le_u32, preceded(take(23usize), byte)))(input)
}

struct RangeBody {
    nlos: u8,
    distance: u16,
    azimuth: u16,
    azimuth_fom: u8,
    elevation: u16,
    elevation_fom: u8,
}

fn parse_range_body(input: &[u8]) -> IResult<&[u8], RangeBody> {
    map(
        tuple((byte, le_u16, le_u16, byte, le_u16, byte)),
        |(nlos, distance, azimuth, azimuth_fom, elevation, elevation_fom)| RangeBody {
            nlos,
            distance,
            azimuth,
            azimuth_fom,
            elevation,
            elevation_fom,
        },
    )(input)
}

/// Picks up right after the elevation figure of merit at offset 37.
fn parse_pdoa(input: &[u8]) -> IResult<&[u8], (u16, u16)> {
    tuple((
        preceded(take(29usize), le_u16),
        preceded(take(2usize), le_u16),
    ))(input)
}

fn parse_session_status(input: &[u8]) -> IResult<&[u8], SessionStatus> {
    map(
        tuple((le_u32, byte, byte)),
        |(session_id, state_code, reason)| SessionStatus {
            session_id: SessionId(session_id),
            state_code,
            reason,
        },
    )(input)
}

fn truncated(what: &'static str, payload: &[u8]) -> DecodeError {
    DecodeError::Truncated {
        what,
        length: payload.len(),
    }
}

/// Decode a range data payload. A non-zero status stops the decode early
/// and yields a [Notification::RangingError].
pub fn decode_range_data(payload: &[u8]) -> Result<Notification, DecodeError> {
    let (rest, (sequence, status)) = parse_range_head(payload)
        .finish()
        .map_err(|_: nom::error::Error<&[u8]>| truncated("range data", payload))?;

    if status != 0 {
        return Ok(Notification::RangingError { sequence, status });
    }

    let (_, body) = parse_range_body(rest)
        .finish()
        .map_err(|_: nom::error::Error<&[u8]>| truncated("range data", payload))?;

    let (pdoa1_deg, pdoa2_deg) = if payload.len() > PDOA_THRESHOLD {
        let (_, (pdoa1, pdoa2)) = parse_pdoa(&payload[37..])
            .finish()
            .map_err(|_: nom::error::Error<&[u8]>| truncated("PDoA", payload))?;
        (
            Some(round_to(decode_q97(pdoa1), 7)),
            Some(round_to(decode_q97(pdoa2), 7)),
        )
    } else {
        (None, None)
    };

    let cir = payload
        .get(CIR_OFFSET..)
        .filter(|tail| !tail.is_empty() && tail.len() % CIR_SAMPLE_LEN == 0)
        .map(|tail| CirData {
            bytes: tail.to_vec(),
        });

    Ok(Notification::RangeData(RangeData {
        measurement: RangeMeasurement {
            sequence,
            status,
            nlos: body.nlos != 0,
            distance_cm: body.distance,
            azimuth_deg: round_to(decode_q97(body.azimuth), 1),
            azimuth_fom: body.azimuth_fom,
            elevation_deg: round_to(decode_q97(body.elevation), 1),
            elevation_fom: body.elevation_fom,
            pdoa1_deg,
            pdoa2_deg,
        },
        cir,
    }))
}

/// Classify and decode a frame.
pub fn decode(frame: &Frame) -> Result<Notification, DecodeError> {
    let header = frame.header();
    let payload = frame.payload();

    if header.is_response() {
        return Ok(Notification::CommandResponse {
            group: header.group(),
            opcode: header.subtype,
            status: payload.first().copied(),
        });
    }

    match (header.class, header.subtype) {
        (CLASS_CORE_NTF, OID_GENERIC_ERROR)
            if payload.len() == 1 && payload[0] == STATUS_COMMAND_RETRY =>
        {
            Ok(Notification::RetryRequest)
        }
        (CLASS_CORE_NTF, OID_DEVICE_STATUS) if payload.len() == 1 => {
            Ok(Notification::DeviceStatus { state: payload[0] })
        }
        (CLASS_SESSION_NTF, OID_SESSION_STATUS) if payload.len() == SESSION_STATUS_LEN => {
            let (_, status) = parse_session_status(payload)
                .finish()
                .map_err(|_: nom::error::Error<&[u8]>| truncated("session status", payload))?;
            Ok(Notification::SessionStatus(status))
        }
        (CLASS_RANGE_NTF, OID_RANGE_DATA) => decode_range_data(payload),
        (class, subtype) => Ok(Notification::Unrecognized {
            class,
            subtype,
            length: payload.len(),
        }),
    }
}

/// Lay out a range data payload. The simulated device and the tests use
/// this to produce notifications the decoder understands.
pub fn encode_range_data(measurement: &RangeMeasurement, cir: &[(i16, i16)]) -> Vec<u8> {
    let with_pdoa = measurement.pdoa1_deg.is_some() || measurement.pdoa2_deg.is_some();
    let len = if with_pdoa || !cir.is_empty() {
        CIR_OFFSET
    } else {
        37
    };

    let mut payload = vec![0u8; len];
    payload[0..4].copy_from_slice(&measurement.sequence.to_le_bytes());
    payload[27] = measurement.status;
    payload[28] = measurement.nlos as u8;
    payload[29..31].copy_from_slice(&measurement.distance_cm.to_le_bytes());
    payload[31..33].copy_from_slice(&encode_q97(measurement.azimuth_deg).to_le_bytes());
    payload[33] = measurement.azimuth_fom;
    payload[34..36].copy_from_slice(&encode_q97(measurement.elevation_deg).to_le_bytes());
    payload[36] = measurement.elevation_fom;
    if len > PDOA_THRESHOLD {
        let pdoa1 = encode_q97(measurement.pdoa1_deg.unwrap_or(0.0));
        let pdoa2 = encode_q97(measurement.pdoa2_deg.unwrap_or(0.0));
        payload[66..68].copy_from_slice(&pdoa1.to_le_bytes());
        payload[70..72].copy_from_slice(&pdoa2.to_le_bytes());
    }
    for (real, imaginary) in cir {
        payload.extend_from_slice(&real.to_le_bytes());
        payload.extend_from_slice(&imaginary.to_le_bytes());
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_codec::{decode_header, encode_frame};

    fn frame(bytes: &[u8]) -> Frame {
        let header = decode_header(bytes).unwrap();
        Frame::new(header, bytes[4..].to_vec()).unwrap()
    }

    fn synthetic_payload(len: usize) -> Vec<u8> {
        let mut payload = vec![0u8; len];
        payload[0] = 0x01; // seq = 1
        payload[29] = 0xFA; // distance = 250
        payload[30] = 0x00;
        payload
    }

    #[test]
    fn twos_complement_corners() {
        assert_eq!(twos_comp(0x8000, 16), -32768);
        assert_eq!(twos_comp(0x7FFF, 16), 32767);
        assert_eq!(twos_comp(0x0000, 16), 0);
        assert_eq!(twos_comp(0xFFFF, 16), -1);
        assert_eq!(twos_comp(0x80, 8), -128);
    }

    #[test]
    fn q97_known_values() {
        assert_eq!(decode_q97(0x0000), 0.0);
        assert_eq!(decode_q97(0x0080), 1.0);
        assert_eq!(decode_q97(0xFF80), -1.0);
        assert_eq!(decode_q97(0x8000), -256.0);
        assert_eq!(decode_q97(0x7FFF), 255.9921875);
        assert_eq!(decode_q97(0x1540), 42.5);
    }

    #[test]
    fn q97_round_trip_all_values() {
        for raw in 0..=u16::MAX {
            let value = decode_q97(raw);
            assert!((-256.0..256.0).contains(&value));
            assert_eq!(encode_q97(value), raw);
        }
    }

    #[test]
    fn q97_encode_quantizes() {
        let raw = encode_q97(10.003);
        assert!((decode_q97(raw) - 10.003).abs() <= 1.0 / 128.0);
    }

    #[test]
    fn range_data_72_bytes() {
        let n = decode_range_data(&synthetic_payload(72)).unwrap();
        let Notification::RangeData(data) = n else {
            panic!("expected range data, got {:?}", n);
        };
        let m = data.measurement;
        assert_eq!(m.sequence, 1);
        assert_eq!(m.status, 0);
        assert!(!m.nlos);
        assert_eq!(m.distance_cm, 250);
        assert_eq!(m.azimuth_deg, 0.0);
        assert_eq!(m.elevation_deg, 0.0);
        assert_eq!(m.pdoa1_deg, Some(0.0));
        assert_eq!(m.pdoa2_deg, Some(0.0));
        assert!(data.cir.is_none());
    }

    #[test]
    fn range_data_without_pdoa() {
        let mut payload = synthetic_payload(40);
        payload[28] = 1;
        payload[31..33].copy_from_slice(&0xF9A0u16.to_le_bytes()); // -12.75
        payload[33] = 100;
        payload[34..36].copy_from_slice(&0x0540u16.to_le_bytes()); // 10.5
        payload[36] = 87;

        let Notification::RangeData(data) = decode_range_data(&payload).unwrap() else {
            panic!("expected range data");
        };
        let m = data.measurement;
        assert!(m.nlos);
        assert_eq!(m.azimuth_deg, -12.8);
        assert_eq!(m.azimuth_fom, 100);
        assert_eq!(m.elevation_deg, 10.5);
        assert_eq!(m.elevation_fom, 87);
        assert_eq!(m.pdoa1_deg, None);
        assert_eq!(m.pdoa2_deg, None);
    }

    #[test]
    fn pdoa_keeps_seven_decimals() {
        let mut payload = synthetic_payload(72);
        payload[66..68].copy_from_slice(&0x0001u16.to_le_bytes());
        payload[70..72].copy_from_slice(&0xFFFFu16.to_le_bytes());

        let Notification::RangeData(data) = decode_range_data(&payload).unwrap() else {
            panic!("expected range data");
        };
        assert_eq!(data.measurement.pdoa1_deg, Some(0.0078125));
        assert_eq!(data.measurement.pdoa2_deg, Some(-0.0078125));
    }

    #[test]
    fn angle_ties_round_to_even() {
        let mut payload = synthetic_payload(40);
        payload[31..33].copy_from_slice(&0x0620u16.to_le_bytes()); // 12.25
        payload[34..36].copy_from_slice(&0x0020u16.to_le_bytes()); // 0.25
        let Notification::RangeData(data) = decode_range_data(&payload).unwrap() else {
            panic!("expected range data");
        };
        assert_eq!(data.measurement.azimuth_deg, 12.2);
        assert_eq!(data.measurement.elevation_deg, 0.2);

        // here the even neighbour is the one further from zero
        payload[31..33].copy_from_slice(&0x0660u16.to_le_bytes());
        payload[34..36].copy_from_slice(&encode_q97(-0.75).to_le_bytes());
        let Notification::RangeData(data) = decode_range_data(&payload).unwrap() else {
            panic!("expected range data");
        };
        assert_eq!(data.measurement.azimuth_deg, 12.8);
        assert_eq!(data.measurement.elevation_deg, -0.8);
    }

    #[test]
    fn classify_device_status() {
        let n = decode(&frame(&[0x60, 0x01, 0x00, 0x01, 0x01])).unwrap();
        assert_eq!(n, Notification::DeviceStatus { state: 0x01 });

        // a device status with an odd length is not one
        let n = decode(&frame(&[0x60, 0x01, 0x00, 0x02, 0x01, 0x00])).unwrap();
        assert!(matches!(n, Notification::Unrecognized { length: 2, .. }));
    }

    #[test]
    fn ranging_error_suppresses_measurement() {
        let mut payload = synthetic_payload(72);
        payload[27] = 0x01;

        let n = decode_range_data(&payload).unwrap();
        assert_eq!(
            n,
            Notification::RangingError {
                sequence: 1,
                status: 0x01
            }
        );
    }

    #[test]
    fn ranging_error_needs_only_the_status() {
        let mut payload = vec![0u8; 28];
        payload[27] = 0x21;
        assert!(matches!(
            decode_range_data(&payload),
            Ok(Notification::RangingError { status: 0x21, .. })
        ));
    }

    #[test]
    fn truncated_range_data() {
        assert!(matches!(
            decode_range_data(&[0u8; 20]),
            Err(DecodeError::Truncated { length: 20, .. })
        ));
        assert!(matches!(
            decode_range_data(&[0u8; 30]),
            Err(DecodeError::Truncated { length: 30, .. })
        ));
    }

    #[test]
    fn cir_tail() {
        let measurement = RangeMeasurement {
            sequence: 9,
            status: 0,
            nlos: false,
            distance_cm: 120,
            azimuth_deg: 5.0,
            azimuth_fom: 100,
            elevation_deg: -3.0,
            elevation_fom: 100,
            pdoa1_deg: None,
            pdoa2_deg: None,
        };
        let payload = encode_range_data(&measurement, &[(3, 4), (-6, 8), (0, -1)]);
        assert_eq!(payload.len(), 72 + 12);

        let Notification::RangeData(data) = decode_range_data(&payload).unwrap() else {
            panic!("expected range data");
        };
        let cir = data.cir.unwrap();
        assert_eq!(cir.len(), 3);
        assert_eq!(cir.samples().collect::<Vec<_>>(), vec![5.0, 10.0, 1.0]);
        // every request starts over
        assert_eq!(cir.samples().count(), 3);
    }

    #[test]
    fn cir_magnitudes_ignore_partial_group() {
        let bytes = [0x00, 0x80, 0x00, 0x00, 0x01];
        let mags: Vec<f64> = cir_magnitudes(&bytes).collect();
        assert_eq!(mags, vec![32768.0]);
    }

    #[test]
    fn classify_response() {
        let n = decode(&frame(&[0x41, 0x03, 0x00, 0x01, 0x00])).unwrap();
        assert_eq!(
            n,
            Notification::CommandResponse {
                group: 0x01,
                opcode: 0x03,
                status: Some(0x00)
            }
        );
    }

    #[test]
    fn classify_retry_request() {
        let n = decode(&frame(&[0x60, 0x07, 0x00, 0x01, 0x0A])).unwrap();
        assert_eq!(n, Notification::RetryRequest);

        // any other generic error is just noise
        let n = decode(&frame(&[0x60, 0x07, 0x00, 0x01, 0x01])).unwrap();
        assert!(matches!(n, Notification::Unrecognized { .. }));
    }

    #[test]
    fn classify_session_status() {
        let n = decode(&frame(&[
            0x61, 0x02, 0x00, 0x06, 0x57, 0x04, 0x00, 0x00, 0x03, 0x01,
        ]))
        .unwrap();
        let Notification::SessionStatus(status) = n else {
            panic!("expected session status");
        };
        assert_eq!(status.session_id, SessionId(0x457));
        assert_eq!(status.state(), Some(SessionState::Idle));
        assert_eq!(status.reason, 0x01);
    }

    #[test]
    fn classify_extended_range_data() {
        let measurement = RangeMeasurement {
            sequence: 77,
            status: 0,
            nlos: false,
            distance_cm: 300,
            azimuth_deg: 0.0,
            azimuth_fom: 0,
            elevation_deg: 0.0,
            elevation_fom: 0,
            pdoa1_deg: Some(1.5),
            pdoa2_deg: Some(-1.5),
        };
        let cir = vec![(1i16, 0i16); 64];
        let packet = encode_frame(0x62, 0x00, &encode_range_data(&measurement, &cir));
        assert_eq!(packet[1], 0x80);

        let Notification::RangeData(data) = decode(&frame(&packet)).unwrap() else {
            panic!("expected range data");
        };
        assert_eq!(data.measurement.sequence, 77);
        assert_eq!(data.cir.unwrap().len(), 64);
    }

    #[test]
    fn unknown_frames_are_not_errors() {
        let n = decode(&frame(&[0x6E, 0x12, 0x00, 0x02, 0xAA, 0xBB])).unwrap();
        assert_eq!(
            n,
            Notification::Unrecognized {
                class: 0x6E,
                subtype: 0x12,
                length: 2
            }
        );
    }
}
