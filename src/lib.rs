//! # Rust EUDAQ Core Library
//!
//! Control and data-transport middleware for modular data acquisition. Independent
//! hardware front-ends ("producers") run under a single synchronized run and stream raw
//! events to data collectors, which write them to disk. Converters turn the raw events
//! into one canonical representation for analysis.
//!
//! ## Crate Structure
//!
//! - **`codec`**: little-endian binary serialization shared by events and the wire protocol.
//! - **`event`**: the self-describing raw `Event` with tags, blocks and sub-events.
//! - **`standard`**: the canonical decoded event: pixel planes, waveforms and trigger data.
//! - **`registry`**: name-keyed factories for every pluggable role.
//! - **`converter`**: raw to standard conversion and the per-run conversion pipeline.
//! - **`run_control`**: the component state machine, component links and the run controller.
//! - **`producer`**: the `Producer` trait, its actor runtime and the reference front-ends.
//! - **`collector`**: the data collector writing one file per run.
//! - **`file`**: event file readers and writers.
//! - **`network`**: control and data channels over TCP.
//! - **`log_collector`**: collection of component log records.
//! - **`config`**: figment-based configuration.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `DaqError` type shared by every module.

pub mod codec;
pub mod collector;
pub mod config;
pub mod converter;
pub mod error;
pub mod event;
pub mod file;
pub mod log_collector;
pub mod logging;
pub mod network;
pub mod producer;
pub mod registry;
pub mod run_control;
pub mod standard;

pub use error::{AppResult, DaqError};
pub use event::Event;
pub use registry::Registry;
