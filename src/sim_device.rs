//! A stand-in for the radio, so the engine can be exercised without
//! hardware.
//!
//! The simulated device runs on its own thread behind a [DeviceEnd]. It
//! answers every command, reports session state changes the way the
//! firmware does, and while a session is active it emits range data with a
//! bit of noise on top of a configurable target position.

use crate::command::{GID_CORE, GID_RANGING, GID_SESSION};
use crate::frame_codec::{encode_frame, hex};
use crate::notification_decoder::{encode_range_data, RangeMeasurement};
use crate::session_state::SessionState;
use crate::transport::DeviceEnd;

use log::{debug, error, trace};
use rand::prelude::*;
use std::{
    io,
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

const DEVICE_STATE_READY: u8 = 0x01;
const STATUS_OK: u8 = 0x00;

/// Commands the test harness can send to a running device.
enum Signal {
    Distance(f64),
    Azimuth(f64),
    Noise(f64),
    Stop,
}

/// Knobs for a [SimulatedDevice].
#[derive(Debug, Clone)]
pub struct SimulatedDeviceBuilder {
    distance_cm: f64,
    azimuth_deg: f64,
    elevation_deg: f64,
    noise: f64,
    interval: Duration,
    response_delay: Duration,
    drop_responses: u32,
    with_pdoa: bool,
    cir_samples: usize,
}

impl Default for SimulatedDeviceBuilder {
    fn default() -> Self {
        Self {
            distance_cm: 250.0,
            azimuth_deg: 0.0,
            elevation_deg: 0.0,
            noise: 0.0,
            interval: Duration::from_millis(100),
            response_delay: Duration::ZERO,
            drop_responses: 0,
            with_pdoa: false,
            cir_samples: 0,
        }
    }
}

impl SimulatedDeviceBuilder {
    /// A device with a tag 2.5 m straight ahead and no noise.
    pub fn new() -> Self {
        Self::default()
    }

    /// True distance to the tag.
    pub fn distance_cm(mut self, distance_cm: f64) -> Self {
        self.distance_cm = distance_cm;
        self
    }

    /// True azimuth of the tag.
    pub fn azimuth_deg(mut self, azimuth_deg: f64) -> Self {
        self.azimuth_deg = azimuth_deg;
        self
    }

    /// True elevation of the tag.
    pub fn elevation_deg(mut self, elevation_deg: f64) -> Self {
        self.elevation_deg = elevation_deg;
        self
    }

    /// Uniform noise amplitude, in centimeters for distance and degrees for
    /// the angles.
    pub fn noise(mut self, noise: f64) -> Self {
        self.noise = noise.abs();
        self
    }

    /// Time between ranging rounds.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// How long the device takes to answer a command.
    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = delay;
        self
    }

    /// Swallow this many commands without answering, to make the host
    /// resend.
    pub fn drop_responses(mut self, count: u32) -> Self {
        self.drop_responses = count;
        self
    }

    /// Append PDoA fields to range data.
    pub fn with_pdoa(mut self, with_pdoa: bool) -> Self {
        self.with_pdoa = with_pdoa;
        self
    }

    /// Append this many CIR samples to range data.
    pub fn cir_samples(mut self, count: usize) -> Self {
        self.cir_samples = count;
        self
    }

    /// Start the device on `link`.
    pub fn spawn(self, link: DeviceEnd) -> io::Result<SimulatedDevice> {
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("sim-device".into())
            .spawn(move || Simulation::new(self, link).run(rx))?;

        Ok(SimulatedDevice {
            handle: Some(handle),
            tx,
        })
    }
}

/// Handle to a running simulated device. Dropping it stops the device.
pub struct SimulatedDevice {
    handle: Option<thread::JoinHandle<()>>,
    tx: mpsc::Sender<Signal>,
}

impl SimulatedDevice {
    /// Move the tag to a new distance.
    pub fn set_distance(&self, distance_cm: f64) {
        let _ = self.tx.send(Signal::Distance(distance_cm));
    }

    /// Move the tag to a new azimuth.
    pub fn set_azimuth(&self, azimuth_deg: f64) {
        let _ = self.tx.send(Signal::Azimuth(azimuth_deg));
    }

    /// Change the noise amplitude.
    pub fn set_noise(&self, noise: f64) {
        let _ = self.tx.send(Signal::Noise(noise));
    }

    /// Stop the device thread and wait for it.
    pub fn stop(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(thread) = self.handle.take() {
            if thread.join().is_err() {
                error!("simulated device thread panicked");
            }
        }
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Simulation {
    config: SimulatedDeviceBuilder,
    link: DeviceEnd,
    rng: ThreadRng,
    session_id: [u8; 4],
    state: Option<SessionState>,
    sequence: u32,
    dropped: u32,
    last_round: Instant,
}

impl Simulation {
    fn new(config: SimulatedDeviceBuilder, link: DeviceEnd) -> Self {
        Self {
            config,
            link,
            rng: thread_rng(),
            session_id: [0; 4],
            state: None,
            sequence: 0,
            dropped: 0,
            last_round: Instant::now(),
        }
    }

    fn run(mut self, rx: mpsc::Receiver<Signal>) {
        let poll = Duration::from_millis(5).min(self.config.interval);
        loop {
            while let Ok(signal) = rx.try_recv() {
                match signal {
                    Signal::Distance(d) => self.config.distance_cm = d,
                    Signal::Azimuth(a) => self.config.azimuth_deg = a,
                    Signal::Noise(n) => self.config.noise = n.abs(),
                    Signal::Stop => return,
                }
            }

            let step = match self.link.next_command(poll) {
                Ok(Some(command)) => self.answer(&command),
                Ok(None) => Ok(()),
                Err(e) => Err(e),
            }
            .and_then(|_| self.range_round());

            if let Err(e) = step {
                debug!("simulated device link closed: {}", e);
                return;
            }
        }
    }

    fn answer(&mut self, command: &[u8]) -> io::Result<()> {
        if command.len() < 4 {
            return Ok(());
        }
        let (group, opcode) = (command[0], command[1]);
        let payload = &command[4..];
        trace!("sim rx [{}]", hex(command));

        if self.dropped < self.config.drop_responses {
            self.dropped += 1;
            debug!("sim dropping {:02X}/{:02X}", group, opcode);
            return Ok(());
        }

        if !self.config.response_delay.is_zero() {
            spin_sleep::sleep(self.config.response_delay);
        }
        self.link
            .inject(&encode_frame(0x40 | (group & 0x0F), opcode, &[STATUS_OK]))?;

        match (group, opcode) {
            (GID_CORE, 0x00) => {
                self.state = None;
                self.link
                    .inject(&encode_frame(0x60, 0x01, &[DEVICE_STATE_READY]))?;
            }
            (GID_SESSION, 0x00) => {
                if let Some(id) = payload.get(..4) {
                    self.session_id.copy_from_slice(id);
                }
                self.report(SessionState::Init)?;
            }
            (GID_SESSION, 0x01) => self.report(SessionState::Deinit)?,
            (GID_SESSION, 0x03) if self.state == Some(SessionState::Init) => {
                self.report(SessionState::Idle)?
            }
            (GID_RANGING, 0x00) => {
                self.last_round = Instant::now();
                self.report(SessionState::Active)?
            }
            (GID_RANGING, 0x01) => self.report(SessionState::Idle)?,
            _ => {}
        }
        Ok(())
    }

    fn report(&mut self, state: SessionState) -> io::Result<()> {
        self.state = Some(state);
        let mut payload = self.session_id.to_vec();
        payload.push(state.code().unwrap_or(0xFF));
        payload.push(0x00);
        self.link.inject(&encode_frame(0x61, 0x02, &payload))
    }

    fn jitter(&mut self, value: f64) -> f64 {
        if self.config.noise > 0.0 {
            value + self.rng.gen_range(-self.config.noise..self.config.noise)
        } else {
            value
        }
    }

    fn range_round(&mut self) -> io::Result<()> {
        if self.state != Some(SessionState::Active)
            || self.last_round.elapsed() < self.config.interval
        {
            return Ok(());
        }
        self.last_round = Instant::now();

        let distance = self.jitter(self.config.distance_cm);
        let azimuth = self.jitter(self.config.azimuth_deg);
        let elevation = self.jitter(self.config.elevation_deg);
        let pdoa = if self.config.with_pdoa {
            Some(self.jitter(0.0))
        } else {
            None
        };

        let measurement = RangeMeasurement {
            sequence: self.sequence,
            status: 0,
            nlos: false,
            distance_cm: distance.clamp(0.0, u16::MAX as f64) as u16,
            azimuth_deg: azimuth.clamp(-180.0, 180.0),
            azimuth_fom: 100,
            elevation_deg: elevation.clamp(-90.0, 90.0),
            elevation_fom: 100,
            pdoa1_deg: pdoa,
            pdoa2_deg: pdoa.map(|p| -p),
        };
        let cir: Vec<(i16, i16)> = (0..self.config.cir_samples)
            .map(|_| (self.rng.gen(), self.rng.gen()))
            .collect();

        self.sequence = self.sequence.wrapping_add(1);
        self.link
            .inject(&encode_frame(0x62, 0x00, &encode_range_data(&measurement, &cir)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, EngineEvent, ProtocolEngine};
    use crate::session_config::{device_reset, startup_sequence, Role, SessionId, SessionParams};
    use crate::transport::memory_link;
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn full_session_against_simulator() {
        let (host, link) = memory_link(Duration::from_millis(5));
        let mut device = SimulatedDeviceBuilder::new()
            .distance_cm(300.0)
            .noise(2.0)
            .interval(Duration::from_millis(10))
            .with_pdoa(true)
            .cir_samples(8)
            .spawn(link)
            .unwrap();

        let mut params = SessionParams::for_node(SessionId(0x457), 9, Role::Initiator, 1);
        params.target_count = Some(5);
        let (mut engine, events) = ProtocolEngine::start(
            Arc::new(host),
            EngineConfig {
                target_count: params.target_count,
                ..Default::default()
            },
        )
        .unwrap();

        engine
            .enqueue_all(startup_sequence(&params).unwrap())
            .unwrap();
        engine.finish().unwrap();

        assert!(engine.wait_for_state(SessionState::Deinit, Some(WAIT)));
        assert!(engine.stop_requested());
        assert!(engine.valid_count() >= 5);

        let smoothed = engine.smoothed();
        assert!((smoothed.distance_cm - 300.0).abs() <= 2.0);
        assert!(!smoothed.pdoa1_deg.is_nan());

        // joining the threads flushes every event they had left to send
        engine.shutdown().unwrap();
        device.stop();

        let mut acked = 0;
        let mut with_cir = 0;
        for event in events.try_iter() {
            match event {
                EngineEvent::CommandAcked { .. } => acked += 1,
                EngineEvent::Measurement { cir: Some(cir), .. } => {
                    assert_eq!(cir.len(), 8);
                    with_cir += 1;
                }
                _ => {}
            }
        }
        assert_eq!(acked, 8);
        assert!(with_cir >= 5);
    }

    #[test]
    fn dropped_responses_are_resent() {
        let (host, link) = memory_link(Duration::from_millis(5));
        let _device = SimulatedDeviceBuilder::new()
            .drop_responses(2)
            .spawn(link)
            .unwrap();

        let (engine, events) = ProtocolEngine::start(
            Arc::new(host),
            EngineConfig {
                ack_timeout: Duration::from_millis(30),
                ..Default::default()
            },
        )
        .unwrap();
        engine.enqueue(device_reset()).unwrap();

        loop {
            if let EngineEvent::CommandAcked { attempts, .. } = events.recv_timeout(WAIT).unwrap() {
                assert_eq!(attempts, 3);
                break;
            }
        }
    }

    #[test]
    fn slow_answers_are_resent() {
        let (host, link) = memory_link(Duration::from_millis(5));
        let _device = SimulatedDeviceBuilder::new()
            .response_delay(Duration::from_millis(100))
            .spawn(link)
            .unwrap();

        let (engine, events) = ProtocolEngine::start(
            Arc::new(host),
            EngineConfig {
                ack_timeout: Duration::from_millis(40),
                ..Default::default()
            },
        )
        .unwrap();
        let sent_at = Instant::now();
        engine.enqueue(device_reset()).unwrap();

        loop {
            if let EngineEvent::CommandAcked { attempts, .. } = events.recv_timeout(WAIT).unwrap() {
                assert!(sent_at.elapsed() >= Duration::from_millis(100));
                assert!(attempts > 1);
                break;
            }
        }
    }

    #[test]
    fn smoothed_values_follow_the_tag() {
        let (host, link) = memory_link(Duration::from_millis(5));
        let device = SimulatedDeviceBuilder::new()
            .distance_cm(100.0)
            .noise(1.0)
            .interval(Duration::from_millis(5))
            .spawn(link)
            .unwrap();

        let params = SessionParams::for_node(SessionId(0x457), 9, Role::Initiator, 1);
        let (mut engine, events) = ProtocolEngine::start(
            Arc::new(host),
            EngineConfig {
                window_size: 3,
                ..Default::default()
            },
        )
        .unwrap();
        engine
            .enqueue_all(startup_sequence(&params).unwrap())
            .unwrap();

        let mut moved = false;
        let mut followed = false;
        for _ in 0..500 {
            let EngineEvent::Measurement { smoothed, .. } = events.recv_timeout(WAIT).unwrap()
            else {
                continue;
            };
            if !moved {
                assert!((smoothed.distance_cm - 100.0).abs() <= 1.0);
                device.set_noise(0.0);
                device.set_distance(400.0);
                device.set_azimuth(30.0);
                moved = true;
            } else if smoothed.distance_cm == 400.0 && smoothed.azimuth_deg == 30.0 {
                followed = true;
                break;
            }
        }
        assert!(followed);
        engine.shutdown().unwrap();
    }
}
