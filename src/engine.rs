//! The protocol engine: a sender thread that drains the command queue one
//! command at a time, and a receiver thread that reads frames and keeps the
//! session state, the ack signal and the smoothing windows up to date.
//!
//! Everything the two threads share lives in one [Mutex]. Each blocking
//! wait has its own [Condvar]: the sender waits on `ack` for a response to
//! the command in flight, on `gate` for the session state to let a command
//! through, and on `stop` for the stop condition before a range stop goes
//! out. Shutdown sets a flag and wakes all three.
//!
//! Responses carry no correlation id. They are matched to the single
//! command in flight by arrival order, so there must never be more than one
//! command in flight.

use crate::command::{Command, CommandClass};
use crate::frame_codec::{self, hex, read_frame, Frame, DEFAULT_PAYLOAD_DEADLINE};
use crate::notification_decoder::{decode, CirData, Notification, RangeMeasurement};
use crate::session_state::{
    Gates, SessionState, SessionStateMachine, REASON_MAX_RR_RETRY_REACHED,
};
use crate::smoother::{MeasurementSmoother, SmoothedMeasurement, DEFAULT_WINDOW};
use crate::transport::Transport;

use log::{debug, error, info, warn};
use std::{
    borrow::Cow,
    fmt, io,
    sync::{
        mpsc::{self, Receiver, Sender, SyncSender},
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// How long the sender waits for a response before resending.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_millis(250);

/// Commands that may sit in the queue before `enqueue` blocks.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Tunables for a [ProtocolEngine].
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Resend the command in flight if no response arrives within this
    pub ack_timeout: Duration,
    /// Give up on a gated command after this long. `None` waits forever.
    pub gate_wait_timeout: Option<Duration>,
    /// Bound of the command queue
    pub queue_capacity: usize,
    /// Samples per smoothing window
    pub window_size: usize,
    /// Raise the stop condition after this many valid measurements
    pub target_count: Option<u64>,
    /// Time allowed for a frame's payload to arrive once its header has
    pub payload_deadline: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            gate_wait_timeout: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            window_size: DEFAULT_WINDOW,
            target_count: None,
            payload_deadline: DEFAULT_PAYLOAD_DEADLINE,
        }
    }
}

/// What the engine reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The device answered a command.
    CommandAcked {
        /// The command that was answered
        command: Command,
        /// How many times it was written
        attempts: u32,
        /// Status byte of the response
        status: Option<u8>,
    },
    /// A gated command waited longer than the gate wait timeout and was
    /// dropped without being sent.
    GateTimeout {
        /// The dropped command
        command: Command,
    },
    /// The device reported a new session state.
    SessionState {
        /// The new state
        state: SessionState,
        /// Reason code sent along with it
        reason: u8,
    },
    /// A valid measurement and the averages after including it.
    Measurement {
        /// The raw measurement
        measurement: RangeMeasurement,
        /// Moving averages
        smoothed: SmoothedMeasurement,
        /// CIR samples, when present
        cir: Option<CirData>,
    },
    /// A ranging round failed on the device.
    RangingError {
        /// Sequence counter of the round
        sequence: u32,
        /// Device status byte
        status: u8,
    },
    /// The stop condition was raised, either by the target count or by the
    /// device giving up on ranging round retries.
    StopCondition,
    /// The link failed and the engine is shutting down.
    TransportFailed {
        /// What went wrong
        reason: String,
    },
}

/// Errors from the engine's public operations.
#[derive(Debug)]
pub enum EngineError {
    /// A worker thread could not be spawned.
    Io(io::Error),
    /// The engine has been shut down.
    Stopped,
    /// A worker thread panicked.
    ThreadPanicked(&'static str),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            EngineError::Io(e) => Cow::from(format!("io error: {}", e)),
            EngineError::Stopped => Cow::from("the engine has been shut down"),
            EngineError::ThreadPanicked(name) => {
                Cow::from(format!("the {} thread panicked", name))
            }
        };

        write!(f, "{}", msg)
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

enum QueueEntry {
    Send(Command),
    Sentinel,
}

/// The in-flight slot. `Pending` until the receiver sees a response or a
/// retry request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckSignal {
    Pending,
    Acked(Option<u8>),
    Retry,
}

#[derive(Debug)]
struct Shared {
    session: SessionStateMachine,
    in_flight: Option<AckSignal>,
    stop_requested: bool,
    shutdown: bool,
    smoother: MeasurementSmoother,
}

impl Shared {
    fn new(config: &EngineConfig) -> Self {
        Self {
            session: SessionStateMachine::new(),
            in_flight: None,
            stop_requested: false,
            shutdown: false,
            smoother: MeasurementSmoother::new(config.window_size, config.target_count),
        }
    }

    /// Arm the in-flight slot for the next write. If a response landed
    /// since the last wait gave up, hand its status back instead.
    fn arm(&mut self) -> Option<Option<u8>> {
        if let Some(AckSignal::Acked(status)) = self.in_flight {
            self.in_flight = None;
            return Some(status);
        }
        self.in_flight = Some(AckSignal::Pending);
        None
    }

    /// Returns true if this call is what raised it.
    fn raise_stop(&mut self) -> bool {
        let fresh = !self.stop_requested;
        self.stop_requested = true;
        fresh
    }
}

#[derive(Debug)]
struct Signals {
    shared: Mutex<Shared>,
    ack: Condvar,
    gate: Condvar,
    stop: Condvar,
}

impl Signals {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_all(&self) {
        self.ack.notify_all();
        self.gate.notify_all();
        self.stop.notify_all();
    }

    fn begin_shutdown(&self) {
        self.lock().shutdown = true;
        self.wake_all();
    }
}

/// Block on `cv` until `done` holds, shutdown is flagged, or `deadline`
/// passes. Returns the guard and whether `done` held at the end.
fn wait_until<'a, F>(
    cv: &Condvar,
    guard: MutexGuard<'a, Shared>,
    deadline: Option<Instant>,
    done: F,
) -> (MutexGuard<'a, Shared>, bool)
where
    F: Fn(&Shared) -> bool,
{
    let guard = match deadline {
        None => cv
            .wait_while(guard, |s| !s.shutdown && !done(s))
            .unwrap_or_else(PoisonError::into_inner),
        Some(deadline) => {
            let timeout = deadline.saturating_duration_since(Instant::now());
            cv.wait_timeout_while(guard, timeout, |s| !s.shutdown && !done(s))
                .unwrap_or_else(PoisonError::into_inner)
                .0
        }
    };

    let held = done(&guard);
    (guard, held)
}

/// Why the sender stopped processing a command.
enum Halt {
    Shutdown,
    Transport(io::Error),
}

enum Outcome {
    Acked { attempts: u32, status: Option<u8> },
    GateTimeout,
}

/// Owns the two worker threads and the state they share.
pub struct ProtocolEngine {
    signals: Arc<Signals>,
    queue: SyncSender<QueueEntry>,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl ProtocolEngine {
    /// Spawn the sender and receiver over `transport`. Events come out of
    /// the returned channel until both threads have exited.
    pub fn start(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
    ) -> Result<(Self, Receiver<EngineEvent>), EngineError> {
        let signals = Arc::new(Signals {
            shared: Mutex::new(Shared::new(&config)),
            ack: Condvar::new(),
            gate: Condvar::new(),
            stop: Condvar::new(),
        });

        let (queue, queue_rx) = mpsc::sync_channel(config.queue_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel();

        let receiver = {
            let transport = Arc::clone(&transport);
            let signals = Arc::clone(&signals);
            let events = events_tx.clone();
            let deadline = config.payload_deadline;
            thread::Builder::new()
                .name("uci-receiver".into())
                .spawn(move || run_receiver(transport, &signals, &events, deadline))?
        };

        let sender = {
            let signals = Arc::clone(&signals);
            thread::Builder::new()
                .name("uci-sender".into())
                .spawn(move || run_sender(transport, &signals, queue_rx, &events_tx, &config))
        };

        let mut engine = ProtocolEngine {
            signals,
            queue,
            sender: None,
            receiver: Some(receiver),
        };

        match sender {
            Ok(handle) => {
                engine.sender = Some(handle);
                Ok((engine, events_rx))
            }
            Err(e) => {
                let _ = engine.shutdown();
                Err(EngineError::Io(e))
            }
        }
    }

    /// Queue a command. Blocks while the queue is full.
    pub fn enqueue(&self, command: Command) -> Result<(), EngineError> {
        if self.signals.lock().shutdown {
            return Err(EngineError::Stopped);
        }
        self.queue
            .send(QueueEntry::Send(command))
            .map_err(|_| EngineError::Stopped)
    }

    /// Queue several commands in order.
    pub fn enqueue_all<I>(&self, commands: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Command>,
    {
        commands.into_iter().try_for_each(|c| self.enqueue(c))
    }

    /// Queue the sentinel: the sender exits once everything ahead of it
    /// has been sent.
    pub fn finish(&self) -> Result<(), EngineError> {
        self.queue
            .send(QueueEntry::Sentinel)
            .map_err(|_| EngineError::Stopped)
    }

    /// Last state reported by the device.
    pub fn session_state(&self) -> SessionState {
        self.signals.lock().session.state()
    }

    /// Gates for the last reported state.
    pub fn gates(&self) -> Gates {
        self.signals.lock().session.gates()
    }

    /// Current moving averages.
    pub fn smoothed(&self) -> SmoothedMeasurement {
        self.signals.lock().smoother.smoothed()
    }

    /// Valid measurements received so far.
    pub fn valid_count(&self) -> u64 {
        self.signals.lock().smoother.valid_count()
    }

    /// Whether the stop condition has been raised.
    pub fn stop_requested(&self) -> bool {
        self.signals.lock().stop_requested
    }

    /// Whether shutdown has been flagged, by the owner or by a link failure.
    pub fn is_shut_down(&self) -> bool {
        self.signals.lock().shutdown
    }

    /// Raise the stop condition from the outside, letting a queued range
    /// stop go out.
    pub fn request_stop(&self) {
        let fresh = self.signals.lock().raise_stop();
        if fresh {
            info!("stop requested");
        }
        self.signals.stop.notify_all();
    }

    /// Wait for the stop condition. Returns false on timeout or shutdown.
    pub fn wait_for_stop(&self, timeout: Option<Duration>) -> bool {
        let guard = self.signals.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        let (_guard, raised) =
            wait_until(&self.signals.stop, guard, deadline, |s| s.stop_requested);
        raised
    }

    /// Wait for the device to report `state`. Returns false on timeout or
    /// shutdown.
    pub fn wait_for_state(&self, state: SessionState, timeout: Option<Duration>) -> bool {
        let guard = self.signals.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        let (_guard, reached) =
            wait_until(&self.signals.gate, guard, deadline, |s| s.session.state() == state);
        reached
    }

    /// Stop both threads and wait for them. Commands still queued are
    /// dropped. Calling this more than once is harmless.
    pub fn shutdown(&mut self) -> Result<(), EngineError> {
        self.signals.begin_shutdown();
        // a full queue means the sender is busy and will see the flag anyway
        let _ = self.queue.try_send(QueueEntry::Sentinel);

        let mut result = Ok(());
        if let Some(sender) = self.sender.take() {
            if sender.join().is_err() {
                result = Err(EngineError::ThreadPanicked("sender"));
            }
        }
        if let Some(receiver) = self.receiver.take() {
            if receiver.join().is_err() {
                result = Err(EngineError::ThreadPanicked("receiver"));
            }
        }
        result
    }
}

impl Drop for ProtocolEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("engine shutdown failed: {}", e);
        }
    }
}

impl fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("shared", &*self.signals.lock())
            .finish_non_exhaustive()
    }
}

fn run_sender(
    transport: Arc<dyn Transport>,
    signals: &Signals,
    queue: Receiver<QueueEntry>,
    events: &Sender<EngineEvent>,
    config: &EngineConfig,
) {
    while let Ok(entry) = queue.recv() {
        let command = match entry {
            QueueEntry::Send(command) => command,
            QueueEntry::Sentinel => {
                debug!("sentinel reached, sender done");
                break;
            }
        };

        match dispatch(transport.as_ref(), signals, &command, config) {
            Ok(Outcome::Acked { attempts, status }) => {
                match status {
                    Some(0x00) | None => debug!("{} acked after {} attempt(s)", command, attempts),
                    Some(code) => warn!("{} answered with status 0x{:02X}", command, code),
                }
                let _ = events.send(EngineEvent::CommandAcked {
                    command,
                    attempts,
                    status,
                });
            }
            Ok(Outcome::GateTimeout) => {
                error!(
                    "{} dropped: session stayed {} past the gate wait timeout",
                    command,
                    signals.lock().session.state()
                );
                let _ = events.send(EngineEvent::GateTimeout { command });
            }
            Err(Halt::Shutdown) => break,
            Err(Halt::Transport(e)) => {
                error!("write failed, shutting down: {}", e);
                signals.begin_shutdown();
                let _ = events.send(EngineEvent::TransportFailed {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
}

/// Hold `class` until its gate opens. Range stops also wait for the stop
/// condition.
fn wait_for_gate(
    signals: &Signals,
    class: CommandClass,
    timeout: Option<Duration>,
) -> Result<bool, Halt> {
    let deadline = timeout.map(|t| Instant::now() + t);

    let guard = signals.lock();
    let (guard, open) = wait_until(&signals.gate, guard, deadline, |s| {
        s.session.gates().permits(class)
    });
    if guard.shutdown {
        return Err(Halt::Shutdown);
    }
    if !open || class != CommandClass::Stop {
        return Ok(open);
    }

    let (guard, raised) = wait_until(&signals.stop, guard, deadline, |s| s.stop_requested);
    if guard.shutdown {
        return Err(Halt::Shutdown);
    }
    Ok(raised)
}

/// Send one command until the device answers it.
fn dispatch(
    transport: &dyn Transport,
    signals: &Signals,
    command: &Command,
    config: &EngineConfig,
) -> Result<Outcome, Halt> {
    if !wait_for_gate(signals, command.class(), config.gate_wait_timeout)? {
        return Ok(Outcome::GateTimeout);
    }

    let packet = frame_codec::encode(command);
    let mut attempts = 0;

    loop {
        {
            let mut shared = signals.lock();
            if shared.shutdown {
                shared.in_flight = None;
                return Err(Halt::Shutdown);
            }
            // armed before writing so a quick response cannot slip past
            if let Some(status) = shared.arm() {
                return Ok(Outcome::Acked { attempts, status });
            }
        }

        attempts += 1;
        debug!("tx {} attempt {} [{}]", command, attempts, hex(&packet));
        transport.write_all(&packet).map_err(Halt::Transport)?;

        let deadline = Some(Instant::now() + config.ack_timeout);
        let guard = signals.lock();
        let (mut shared, _) = wait_until(&signals.ack, guard, deadline, |s| {
            s.in_flight != Some(AckSignal::Pending)
        });

        let signal = shared.in_flight;
        match signal {
            Some(AckSignal::Acked(status)) => {
                shared.in_flight = None;
                return Ok(Outcome::Acked { attempts, status });
            }
            Some(AckSignal::Retry) => {
                debug!("device asked for {} again", command);
            }
            _ if shared.shutdown => {
                shared.in_flight = None;
                return Err(Halt::Shutdown);
            }
            _ => {
                debug!(
                    "no response to {} within {:?}, resending",
                    command, config.ack_timeout
                );
            }
        }
    }
}

fn run_receiver(
    transport: Arc<dyn Transport>,
    signals: &Signals,
    events: &Sender<EngineEvent>,
    payload_deadline: Duration,
) {
    loop {
        if signals.lock().shutdown {
            break;
        }

        match read_frame(transport.as_ref(), payload_deadline) {
            Ok(None) => {}
            Ok(Some(frame)) => handle_frame(&frame, signals, events),
            Err(e) if e.is_fatal() => {
                // nothing to report if we are already on the way out
                if !signals.lock().shutdown {
                    error!("read failed, shutting down: {}", e);
                    signals.begin_shutdown();
                    let _ = events.send(EngineEvent::TransportFailed {
                        reason: e.to_string(),
                    });
                }
                break;
            }
            Err(e) => warn!("dropping frame: {}", e),
        }
    }
    debug!("receiver done");
}

fn handle_frame(frame: &Frame, signals: &Signals, events: &Sender<EngineEvent>) {
    let notification = match decode(frame) {
        Ok(n) => n,
        Err(e) => {
            warn!(
                "dropping frame [{}]: {}",
                hex(&frame.header().raw),
                e
            );
            return;
        }
    };

    match notification {
        Notification::CommandResponse {
            group,
            opcode,
            status,
        } => {
            let mut shared = signals.lock();
            match shared.in_flight {
                Some(AckSignal::Pending) | Some(AckSignal::Retry) => {
                    shared.in_flight = Some(AckSignal::Acked(status));
                    signals.ack.notify_all();
                }
                _ => warn!(
                    "response 0x{:02X}/0x{:02X} with no command in flight",
                    group, opcode
                ),
            }
        }
        Notification::RetryRequest => {
            let mut shared = signals.lock();
            if shared.in_flight == Some(AckSignal::Pending) {
                shared.in_flight = Some(AckSignal::Retry);
                signals.ack.notify_all();
            } else {
                debug!("retry request with no command waiting on it");
            }
        }
        Notification::DeviceStatus { state } => {
            info!("device status 0x{:02X}", state);
        }
        Notification::SessionStatus(status) => {
            let Some(state) = status.state() else {
                warn!(
                    "session {} reported unknown state 0x{:02X}, ignoring",
                    status.session_id, status.state_code
                );
                return;
            };

            let raised = {
                let mut shared = signals.lock();
                let previous = shared.session.apply(state, status.reason);
                info!(
                    "session {}: {} -> {} (reason 0x{:02X})",
                    status.session_id, previous, state, status.reason
                );
                status.reason == REASON_MAX_RR_RETRY_REACHED && shared.raise_stop()
            };
            signals.gate.notify_all();

            let _ = events.send(EngineEvent::SessionState {
                state,
                reason: status.reason,
            });
            if raised {
                warn!("device gave up after max ranging round retries");
                signals.stop.notify_all();
                let _ = events.send(EngineEvent::StopCondition);
            }
        }
        Notification::RangeData(data) => {
            let (smoothed, raised) = {
                let mut shared = signals.lock();
                let reached = shared.smoother.push(&data.measurement);
                let raised = reached && shared.raise_stop();
                (shared.smoother.smoothed(), raised)
            };
            debug!(
                "#{} {} cm az {} el {}",
                data.measurement.sequence,
                data.measurement.distance_cm,
                data.measurement.azimuth_deg,
                data.measurement.elevation_deg
            );

            let _ = events.send(EngineEvent::Measurement {
                measurement: data.measurement,
                smoothed,
                cir: data.cir,
            });
            if raised {
                info!("target measurement count reached");
                signals.stop.notify_all();
                let _ = events.send(EngineEvent::StopCondition);
            }
        }
        Notification::RangingError { sequence, status } => {
            warn!("ranging round {} failed with status 0x{:02X}", sequence, status);
            let _ = events.send(EngineEvent::RangingError { sequence, status });
        }
        Notification::Unrecognized {
            class,
            subtype,
            length,
        } => {
            debug!(
                "ignoring frame 0x{:02X}/0x{:02X} with {} payload bytes",
                class, subtype, length
            );
        }
    }
}
