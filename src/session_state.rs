//! The ranging session lifecycle as reported by the device, and the gates
//! derived from it.
//!
//! The device is the only authority on session state. The state here only
//! changes when a session status notification is decoded; nothing on the
//! host side times out into another state.

use crate::command::CommandClass;

use std::fmt;

/// Session termination reason: the device gave up after its maximum number
/// of ranging round retries.
pub const REASON_MAX_RR_RETRY_REACHED: u8 = 0x01;

/// Lifecycle of a ranging session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing has been reported yet.
    #[default]
    Uninitialized,
    /// Session created, waiting for configuration.
    Init,
    /// Ranging in progress.
    Active,
    /// Configured but not ranging.
    Idle,
    /// Session torn down.
    Deinit,
    /// The device reported a session error.
    Error,
}

impl SessionState {
    /// Map a wire state code to a state. Unknown codes give `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x00 => Some(SessionState::Init),
            0x01 => Some(SessionState::Deinit),
            0x02 => Some(SessionState::Active),
            0x03 => Some(SessionState::Idle),
            0xFF => Some(SessionState::Error),
            _ => None,
        }
    }

    /// The wire code for this state, if it has one.
    pub fn code(self) -> Option<u8> {
        match self {
            SessionState::Uninitialized => None,
            SessionState::Init => Some(0x00),
            SessionState::Deinit => Some(0x01),
            SessionState::Active => Some(0x02),
            SessionState::Idle => Some(0x03),
            SessionState::Error => Some(0xFF),
        }
    }

    /// Which command classes this state lets through.
    pub fn gates(self) -> Gates {
        let (may_configure, may_start, may_stop, may_finalize) = match self {
            SessionState::Uninitialized => (false, false, false, false),
            SessionState::Init => (true, false, false, false),
            SessionState::Deinit => (false, false, false, true),
            SessionState::Active => (true, true, true, false),
            SessionState::Idle => (true, true, false, false),
            SessionState::Error => (false, false, false, false),
        };

        Gates {
            may_configure,
            may_start,
            may_stop,
            may_finalize,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The four gate flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Gates {
    /// App config may be sent
    pub may_configure: bool,
    /// Range start may be sent
    pub may_start: bool,
    /// Range stop may be sent
    pub may_stop: bool,
    /// The session has been torn down
    pub may_finalize: bool,
}

impl Gates {
    /// Whether a command of `class` may be sent right now. Finalize and
    /// unrestricted commands are never held back.
    pub fn permits(&self, class: CommandClass) -> bool {
        match class {
            CommandClass::Configure => self.may_configure,
            CommandClass::Start => self.may_start,
            CommandClass::Stop => self.may_stop,
            CommandClass::Finalize | CommandClass::Unrestricted => true,
        }
    }
}

/// Current session state plus the gates computed from it. Both are always
/// replaced together.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: SessionState,
    gates: Gates,
    last_reason: Option<u8>,
}

impl SessionStateMachine {
    /// A machine that has not heard from the device yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the state with a freshly reported one. Returns the state
    /// that was replaced.
    pub fn apply(&mut self, state: SessionState, reason: u8) -> SessionState {
        let previous = self.state;
        self.state = state;
        self.gates = state.gates();
        self.last_reason = Some(reason);
        previous
    }

    /// The last reported state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The gates for the last reported state.
    pub fn gates(&self) -> Gates {
        self.gates
    }

    /// The reason code that came with the last state change.
    pub fn last_reason(&self) -> Option<u8> {
        self.last_reason
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 6] = [
        SessionState::Uninitialized,
        SessionState::Init,
        SessionState::Active,
        SessionState::Idle,
        SessionState::Deinit,
        SessionState::Error,
    ];

    #[test]
    fn gate_table() {
        let g = SessionState::Init.gates();
        assert!(g.may_configure && !g.may_start && !g.may_stop && !g.may_finalize);

        let g = SessionState::Active.gates();
        assert!(g.may_configure && g.may_start && g.may_stop && !g.may_finalize);

        let g = SessionState::Idle.gates();
        assert!(g.may_configure && g.may_start && !g.may_stop && !g.may_finalize);

        let g = SessionState::Deinit.gates();
        assert!(!g.may_configure && !g.may_start && !g.may_stop && g.may_finalize);

        assert_eq!(SessionState::Error.gates(), Gates::default());
        assert_eq!(SessionState::Uninitialized.gates(), Gates::default());
    }

    #[test]
    fn start_only_when_active_or_idle() {
        for state in ALL {
            if state.gates().may_start {
                assert!(matches!(state, SessionState::Active | SessionState::Idle));
            }
            if state.gates().may_stop {
                assert_eq!(state, SessionState::Active);
            }
        }
    }

    #[test]
    fn codes_round_trip() {
        for state in ALL {
            if let Some(code) = state.code() {
                assert_eq!(SessionState::from_code(code), Some(state));
            }
        }
        assert_eq!(SessionState::from_code(0x42), None);
    }

    #[test]
    fn error_clears_everything() {
        let mut machine = SessionStateMachine::new();
        machine.apply(SessionState::Active, 0x00);
        assert!(machine.gates().permits(CommandClass::Stop));

        let previous = machine.apply(SessionState::Error, 0x00);
        assert_eq!(previous, SessionState::Active);
        for class in [
            CommandClass::Configure,
            CommandClass::Start,
            CommandClass::Stop,
        ] {
            assert!(!machine.gates().permits(class));
        }
    }
}
