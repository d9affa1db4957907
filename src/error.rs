//! Custom error types for the middleware.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of the
//! crate. Using the `thiserror` crate, it provides a centralized and consistent way to
//! report failures, from malformed bytes on the wire up to a producer refusing a
//! run-control command.
//!
//! ## Error Hierarchy
//!
//! `DaqError` groups its variants by who has to act on them:
//!
//! - **Malformed data**: `TruncatedInput` and `CorruptRecord` come out of the codec and the
//!   file readers when bytes do not describe a complete, well-formed record.
//! - **Access contract**: `NoSuchBlock` and `OutOfRange` are returned instead of panicking
//!   when a caller asks an event, plane or waveform for something it does not hold.
//! - **Configuration**: `UnregisteredComponent`, `RegistryCollision`, `Config` and
//!   `Configuration` are raised while resolving what to instantiate and with which
//!   parameters. They abort the requesting operation immediately.
//! - **Run control**: `InvalidTransition`, `HardwareFault`, `Timeout` and `RunBlocked` are
//!   surfaced to the run controller, which refuses to advance the run.
//! - **Conversion**: `DecodeFailure` describes one bad event. The conversion pipeline records
//!   it and moves on to the next event.
//!
//! By using `#[from]`, `DaqError` can be created from I/O and figment errors directly,
//! simplifying error handling throughout the crate with the `?` operator.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// One component that did not reach the state a run-control command asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentFailure {
    /// Logical name of the component.
    pub name: String,
    /// State the component reported, or `unreachable`.
    pub state: String,
    /// Error text reported by the component or produced while talking to it.
    pub message: String,
}

impl std::fmt::Display for ComponentFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.name, self.state, self.message)
    }
}

/// Primary error type for the middleware.
#[derive(Error, Debug)]
pub enum DaqError {
    /// The input ended before a value could be read completely.
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    TruncatedInput {
        /// Bytes required by the value being read.
        needed: usize,
        /// Bytes left in the input.
        available: usize,
    },

    /// A record boundary in a stream or file does not parse.
    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord {
        /// Byte offset of the record start.
        offset: u64,
        /// What went wrong while parsing it.
        reason: String,
    },

    /// The event does not carry a block with this id.
    #[error("No block with id {id}")]
    NoSuchBlock {
        /// Requested block id.
        id: u32,
    },

    /// Indexed access past the end of a sequence.
    #[error("{what} index {index} out of range (length {len})")]
    OutOfRange {
        /// Kind of element that was indexed.
        what: &'static str,
        /// Requested index.
        index: usize,
        /// Number of available elements.
        len: usize,
    },

    /// Nothing is registered under this key for the role.
    #[error("Unregistered {} component: hash {:#010x}{}", .role, .hash, .name.as_deref().map(|n| format!(" ('{n}')")).unwrap_or_default())]
    UnregisteredComponent {
        /// Role that was asked for.
        role: String,
        /// Numeric key that was looked up.
        hash: u32,
        /// Name the key was derived from, when known.
        name: Option<String>,
    },

    /// Two different names map onto the same registry key.
    #[error("Registry collision for {role}: '{rejected}' hashes to {hash:#010x}, already taken by '{existing}'")]
    RegistryCollision {
        /// Role of the registration.
        role: String,
        /// The shared hash.
        hash: u32,
        /// Name that already owns the hash.
        existing: String,
        /// Name whose registration was refused.
        rejected: String,
    },

    /// A run-control command is not allowed in the current state.
    #[error("Invalid transition: cannot {command} while {state}")]
    InvalidTransition {
        /// Command that was attempted.
        command: String,
        /// State the component was in.
        state: String,
    },

    /// Producer-local hardware or resource failure.
    #[error("Hardware fault in '{producer}': {message}")]
    HardwareFault {
        /// Producer that observed the fault.
        producer: String,
        /// Description of the fault.
        message: String,
    },

    /// A single raw event could not be converted.
    #[error("Decode failure in run {run}, event {event}: {reason}")]
    DecodeFailure {
        /// Run number of the event.
        run: u32,
        /// Event number within the run.
        event: u32,
        /// Why the decode failed.
        reason: String,
    },

    /// An operation did not finish within its bound.
    #[error("Timeout after {after:?} while {operation}")]
    Timeout {
        /// What was being waited for.
        operation: String,
        /// The bound that expired.
        after: Duration,
    },

    /// A synchronized command did not reach every component.
    #[error("{} blocked: {}", .command, .failures.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
    RunBlocked {
        /// Command that was broadcast.
        command: String,
        /// Components that did not reach the requested state.
        failures: Vec<ComponentFailure>,
    },

    /// Malformed control or data channel message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Configuration file parsing failed.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration parsed but is semantically wrong.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Standard I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DaqError {
    /// Shorthand for a `DecodeFailure`.
    pub fn decode(run: u32, event: u32, reason: impl Into<String>) -> Self {
        DaqError::DecodeFailure {
            run,
            event,
            reason: reason.into(),
        }
    }

    /// Shorthand for an `OutOfRange`.
    pub fn out_of_range(what: &'static str, index: usize, len: usize) -> Self {
        DaqError::OutOfRange { what, index, len }
    }

    /// True for errors that describe bytes which cannot be parsed.
    pub fn is_malformed_data(&self) -> bool {
        matches!(
            self,
            DaqError::TruncatedInput { .. } | DaqError::CorruptRecord { .. }
        )
    }
}
