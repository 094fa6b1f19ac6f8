//! Brings up a ranging session on a UWB radio, or on a simulated one, and
//! reports what it measures.

// Example:
// cargo run --bin uwb-ranger -- --config ranger.ron range
//                               --port      /dev/ttyACM0
//                               --role      responder
//                               --node-id   2
//                               --count     500

use clap::Parser;
use log::{error, info, warn};
use serial2::SerialPort;
use std::{
    error::Error,
    fmt,
    ops::ControlFlow,
    path::PathBuf,
    sync::{
        mpsc::{Receiver, RecvTimeoutError},
        Arc,
    },
    time::Duration,
};
use uwb_ranger::{
    args::{RangerArgs, RangerCommand},
    config::RangerConfig,
    engine::{EngineEvent, ProtocolEngine},
    gui::{device_selector, fold_until_stop},
    localizer::smoothed_to_cartesian,
    notification_decoder::RangeMeasurement,
    session_config::{range_stop, session_deinit, startup_sequence, SessionId},
    session_state::SessionState,
    sim_device::SimulatedDeviceBuilder,
    smoother::SmoothedMeasurement,
    transport::{memory_link, open_serial, Transport},
};

/// How long one monitor step waits for an event.
const STEP: Duration = Duration::from_millis(50);

/// How long we give the device to tear the session down on the way out.
const WIND_DOWN: Duration = Duration::from_secs(2);

fn main() {
    env_logger::init();
    let args = RangerArgs::parse();

    if let Err(e) = run(args) {
        error!("{}", e);
        eprintln!("uwb-ranger: {}", e);
        std::process::exit(1);
    }
}

fn run(args: RangerArgs) -> Result<(), Box<dyn Error>> {
    let mut config = match &args.config {
        Some(path) => RangerConfig::from_path(path)?,
        None => RangerConfig::default(),
    };

    match args.command {
        RangerCommand::Ports => {
            for port in SerialPort::available_ports()? {
                println!("{}", port.display());
            }
            Ok(())
        }

        RangerCommand::Range(range) => {
            range.apply(&mut config);
            config.validate()?;

            let port = match config.port.clone() {
                Some(port) => PathBuf::from(port),
                None => match device_selector(SerialPort::available_ports()?)? {
                    Some(port) => port,
                    None => {
                        info!("no serial port selected");
                        return Ok(());
                    }
                },
            };

            info!("opening {} at {} baud", port.display(), config.baud_rate);
            let link = open_serial(&port, config.baud_rate, config.poll_interval())?;
            session(Arc::new(link), &config, range.session.headless)
        }

        RangerCommand::Simulate(sim) => {
            sim.session.apply(&mut config);
            config.validate()?;

            let (host, device_end) = memory_link(config.poll_interval());
            let mut device = SimulatedDeviceBuilder::new()
                .distance_cm(sim.distance)
                .azimuth_deg(sim.azimuth)
                .elevation_deg(sim.elevation)
                .noise(sim.noise)
                .interval(Duration::from_millis(sim.interval_ms))
                .with_pdoa(true)
                .spawn(device_end)?;

            let res = session(Arc::new(host), &config, sim.session.headless);
            device.stop();
            res
        }
    }
}

/// Run one session from reset to teardown.
fn session(
    transport: Arc<dyn Transport>,
    config: &RangerConfig,
    headless: bool,
) -> Result<(), Box<dyn Error>> {
    let params = config.session_params();
    let commands = startup_sequence(&params)?;

    let (engine, events) = ProtocolEngine::start(transport, config.engine_config())?;
    engine.enqueue_all(commands)?;

    let monitor = Monitor {
        engine,
        events,
        session_id: params.session_id,
        target_count: params.target_count,
        state: SessionState::Uninitialized,
        last: None,
        smoothed: None,
        ranging_errors: 0,
        finished: false,
    };

    let monitor = if headless {
        run_headless(monitor)
    } else {
        fold_until_stop("UWB ranging", monitor, Monitor::step)?
    };

    monitor.wind_down()
}

fn run_headless(mut monitor: Monitor) -> Monitor {
    loop {
        match monitor.step() {
            ControlFlow::Continue(m) => monitor = m,
            ControlFlow::Break(m) => return m,
        }
    }
}

/// Follows the engine's events and keeps what is worth showing.
struct Monitor {
    engine: ProtocolEngine,
    events: Receiver<EngineEvent>,
    session_id: SessionId,
    target_count: Option<u64>,
    state: SessionState,
    last: Option<RangeMeasurement>,
    smoothed: Option<SmoothedMeasurement>,
    ranging_errors: u64,
    finished: bool,
}

impl Monitor {
    fn step(mut self) -> ControlFlow<Self, Self> {
        match self.events.recv_timeout(STEP) {
            Ok(event) => self.apply(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.finished = true,
        }

        if self.finished {
            ControlFlow::Break(self)
        } else {
            ControlFlow::Continue(self)
        }
    }

    fn apply(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::CommandAcked { .. } => {}
            EngineEvent::GateTimeout { command } => {
                warn!("gave up waiting to send {}", command);
            }
            EngineEvent::SessionState { state, .. } => {
                self.state = state;
                match state {
                    SessionState::Deinit => self.finished = true,
                    SessionState::Error => {
                        error!("session {} is in error", self.session_id);
                        self.finished = true;
                    }
                    _ => {}
                }
            }
            EngineEvent::Measurement {
                measurement,
                smoothed,
                ..
            } => {
                info!(
                    "#{} {} cm az {:.1} el {:.1} | avg {:.1} cm az {:.1} el {:.1}",
                    measurement.sequence,
                    measurement.distance_cm,
                    measurement.azimuth_deg,
                    measurement.elevation_deg,
                    smoothed.distance_cm,
                    smoothed.azimuth_deg,
                    smoothed.elevation_deg
                );
                self.last = Some(measurement);
                self.smoothed = Some(smoothed);
            }
            EngineEvent::RangingError { .. } => self.ranging_errors += 1,
            EngineEvent::StopCondition => {
                info!("stop condition raised");
                // without a target there is no stop queued to wait for
                if self.target_count.is_none() {
                    self.finished = true;
                }
            }
            EngineEvent::TransportFailed { reason } => {
                error!("link lost: {}", reason);
                self.finished = true;
            }
        }
    }

    /// Tear the session down if the device still has one, then stop the
    /// engine and print a summary.
    fn wind_down(mut self) -> Result<(), Box<dyn Error>> {
        if !self.engine.is_shut_down() && self.state != SessionState::Deinit {
            let id = self.session_id;
            let state = self.engine.session_state();
            if self.target_count.is_none() {
                if state == SessionState::Active {
                    self.engine.enqueue(range_stop(id))?;
                }
                if matches!(
                    state,
                    SessionState::Init | SessionState::Idle | SessionState::Active
                ) {
                    self.engine.enqueue(session_deinit(id))?;
                }
            }
            self.engine.request_stop();
            if !self.engine.wait_for_state(SessionState::Deinit, Some(WIND_DOWN)) {
                warn!("session {} was not torn down", id);
            }
        }

        self.engine.shutdown()?;
        println!("{}", self);
        Ok(())
    }
}

impl fmt::Display for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "session {}: {}", self.session_id, self.state)?;

        let count = self.engine.valid_count();
        match self.target_count {
            Some(target) => writeln!(f, "valid measurements: {} of {}", count, target)?,
            None => writeln!(f, "valid measurements: {}", count)?,
        }
        writeln!(f, "failed rounds: {}", self.ranging_errors)?;

        if let Some(m) = &self.last {
            writeln!(
                f,
                "last:     #{} {} cm, azimuth {:.1}, elevation {:.1}, nlos {}",
                m.sequence, m.distance_cm, m.azimuth_deg, m.elevation_deg, m.nlos
            )?;
        }
        if let Some(s) = &self.smoothed {
            writeln!(
                f,
                "smoothed: {:.1} cm, azimuth {:.1}, elevation {:.1}, pdoa {:.2} / {:.2}",
                s.distance_cm, s.azimuth_deg, s.elevation_deg, s.pdoa1_deg, s.pdoa2_deg
            )?;
            if let Some(p) = smoothed_to_cartesian(s) {
                write!(f, "position: {} m", p)?;
            }
        }
        Ok(())
    }
}
