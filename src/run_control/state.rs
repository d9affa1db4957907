//! Component lifecycle state and the commands that move it.
//!
//! Every run-controlled component (producer or data collector) owns a [`StateMachine`].
//! The machine is the single place that decides whether a command is legal, so a
//! component rejects an out-of-order command the same way no matter how it was reached.

use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Lifecycle state of a run-controlled component.
///
/// # State Machine
///
/// ```text
/// Unconfigured ──Configure──> Configured ──StartRun──> Running ──StopRun──> Stopped
///                               ▲    │                   │                   │
///                      Configure└────┘                 Fault                 │
///                               ▲                        ▼                   │
///                               └────Configure──────── Error                 │
///                               └────────────────────Configure───────────────┘
///
/// any ──Terminate──> Terminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum State {
    /// Waiting for a configuration
    Unconfigured = 0,
    /// Configured, ready to start a run
    Configured = 1,
    /// Taking data
    Running = 2,
    /// Run finished, end-of-run event sent
    Stopped = 3,
    /// Resources released, only Status is answered
    Terminated = 4,
    /// Local fault, needs a new Configure
    Error = 5,
}

impl State {
    /// Decode the wire representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(State::Unconfigured),
            1 => Some(State::Configured),
            2 => Some(State::Running),
            3 => Some(State::Stopped),
            4 => Some(State::Terminated),
            5 => Some(State::Error),
            _ => None,
        }
    }

    /// Check if the state accepts a (re)configuration.
    pub fn can_configure(&self) -> bool {
        matches!(
            self,
            State::Unconfigured | State::Configured | State::Stopped | State::Error
        )
    }

    /// Check if the state allows starting a run.
    pub fn can_start(&self) -> bool {
        matches!(self, State::Configured)
    }

    /// Check if the state allows stopping a run.
    pub fn can_stop(&self) -> bool {
        matches!(self, State::Running)
    }

    /// Whether `command` is legal in this state.
    pub fn allows(&self, command: CommandKind) -> bool {
        match command {
            CommandKind::Configure => self.can_configure(),
            CommandKind::StartRun => self.can_start(),
            CommandKind::StopRun => self.can_stop(),
            CommandKind::Terminate | CommandKind::Status => true,
        }
    }

    /// State a successful `command` leads to.
    pub fn target_of(command: CommandKind) -> Option<State> {
        match command {
            CommandKind::Configure => Some(State::Configured),
            CommandKind::StartRun => Some(State::Running),
            CommandKind::StopRun => Some(State::Stopped),
            CommandKind::Terminate => Some(State::Terminated),
            CommandKind::Status => None,
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Unconfigured => write!(f, "Unconfigured"),
            State::Configured => write!(f, "Configured"),
            State::Running => write!(f, "Running"),
            State::Stopped => write!(f, "Stopped"),
            State::Terminated => write!(f, "Terminated"),
            State::Error => write!(f, "Error"),
        }
    }
}

/// Run-control command without its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandKind {
    /// Apply parameters
    Configure = 0,
    /// Begin a run
    StartRun = 1,
    /// End the current run
    StopRun = 2,
    /// Release everything
    Terminate = 3,
    /// Report state only
    Status = 4,
}

impl CommandKind {
    /// Decode the wire representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommandKind::Configure),
            1 => Some(CommandKind::StartRun),
            2 => Some(CommandKind::StopRun),
            3 => Some(CommandKind::Terminate),
            4 => Some(CommandKind::Status),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandKind::Configure => write!(f, "Configure"),
            CommandKind::StartRun => write!(f, "StartRun"),
            CommandKind::StopRun => write!(f, "StopRun"),
            CommandKind::Terminate => write!(f, "Terminate"),
            CommandKind::Status => write!(f, "Status"),
        }
    }
}

/// A run-control command with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Apply the component parameters.
    Configure(toml::Table),
    /// Begin run `run_number`.
    StartRun(u32),
    /// End the current run.
    StopRun,
    /// Release all resources.
    Terminate,
    /// Report the current status.
    Status,
}

impl Command {
    /// Kind of the command.
    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Configure(_) => CommandKind::Configure,
            Command::StartRun(_) => CommandKind::StartRun,
            Command::StopRun => CommandKind::StopRun,
            Command::Terminate => CommandKind::Terminate,
            Command::Status => CommandKind::Status,
        }
    }
}

/// Status reported by a component on every command completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    /// Logical component name
    pub name: String,
    /// State after the command
    pub state: State,
    /// Current or last run number
    pub run_number: u32,
    /// Data events sent (producer) or written (collector) in the current run
    pub events: u64,
    /// Most recent error, cleared by a successful Configure
    pub last_error: Option<String>,
}

/// State holder shared by every run-controlled component.
pub struct StateMachine {
    name: String,
    state: State,
    run_number: u32,
    events: u64,
    last_error: Option<String>,
    watch: watch::Sender<State>,
}

impl StateMachine {
    /// New machine in [`State::Unconfigured`].
    pub fn new(name: impl Into<String>) -> Self {
        let (watch, _) = watch::channel(State::Unconfigured);
        Self {
            name: name.into(),
            state: State::Unconfigured,
            run_number: 0,
            events: 0,
            last_error: None,
            watch,
        }
    }

    /// Component name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// Receiver following every state change.
    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.watch.subscribe()
    }

    /// Fail with [`DaqError::InvalidTransition`] if `command` is not legal now.
    ///
    /// A terminated component only answers Terminate and Status. The rejection is kept as
    /// the last error; the state does not change.
    pub fn check(&mut self, command: CommandKind) -> AppResult<()> {
        let allowed = if self.state == State::Terminated {
            matches!(command, CommandKind::Terminate | CommandKind::Status)
        } else {
            self.state.allows(command)
        };
        if allowed {
            return Ok(());
        }
        let err = DaqError::InvalidTransition {
            command: command.to_string(),
            state: self.state.to_string(),
        };
        self.last_error = Some(err.to_string());
        Err(err)
    }

    /// Move to `state`.
    pub fn set(&mut self, state: State) {
        if state == State::Configured {
            self.last_error = None;
        }
        self.state = state;
        self.watch.send_replace(state);
    }

    /// Enter [`State::Error`], keeping `err` as the last error.
    pub fn fail(&mut self, err: &DaqError) {
        self.last_error = Some(err.to_string());
        self.set(State::Error);
    }

    /// Keep `err` as the last error without changing state.
    pub fn record_error(&mut self, err: &DaqError) {
        self.last_error = Some(err.to_string());
    }

    /// Start counting events of run `run_number`.
    pub fn begin_run(&mut self, run_number: u32) {
        self.run_number = run_number;
        self.events = 0;
    }

    /// Current run number.
    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    /// Count one event.
    pub fn count_event(&mut self) {
        self.events += 1;
    }

    /// Events counted in the current run.
    pub fn events(&self) -> u64 {
        self.events
    }

    /// Status snapshot.
    pub fn status(&self) -> ComponentStatus {
        ComponentStatus {
            name: self.name.clone(),
            state: self.state,
            run_number: self.run_number,
            events: self.events,
            last_error: self.last_error.clone(),
        }
    }
}
