//! Name-keyed component factories.
//!
//! Every pluggable role (producer, converter, file reader and writer, run controller, log
//! collector and raw event type) has its own factory table. Entries are keyed by the
//! 32-bit [`str2hash`] of their name, which is also the type tag written into raw events, so
//! a converter is found directly from the header of the event it has to decode.
//!
//! The hash is short and collisions between unrelated names do happen (`"costarring"` and
//! `"liquid"` share one). The tables therefore keep the full name next to every entry:
//!
//! - registering the same name again replaces the previous factory (last registration wins),
//! - registering a different name whose hash is taken fails with
//!   [`DaqError::RegistryCollision`] and leaves the existing entry in place,
//! - creating by name checks the stored name, so a collided lookup never hands out the
//!   wrong component.
//!
//! # Examples
//!
//! ```
//! use rust_eudaq::registry::{str2hash, Registry};
//!
//! let registry = Registry::builtin();
//! assert!(registry.has_converter(str2hash("CMSPixelREF")));
//! let bore = registry.make_event("DRS4RawDataEvent").unwrap();
//! assert_eq!(bore.type_id(), str2hash("DRS4RawDataEvent"));
//! ```

use crate::config::{LogCollectorConfig, RunControlConfig};
use crate::converter::Converter;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::file::{FileReader, FileWriter};
use crate::log_collector::LogCollector;
use crate::producer::Producer;
use crate::run_control::RunControl;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error};

const FNV_OFFSET: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// Stable 32-bit FNV-1a hash of a component or event type name.
pub const fn str2hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Pluggable component roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Hardware front-end.
    Producer,
    /// Raw to standard event converter.
    Converter,
    /// Event file reader.
    Reader,
    /// Event file writer.
    Writer,
    /// Run controller.
    RunController,
    /// Log collector.
    LogCollector,
    /// Known raw event type.
    EventType,
}

impl Role {
    /// Every role, in listing order.
    pub const ALL: [Role; 7] = [
        Role::Producer,
        Role::Converter,
        Role::Reader,
        Role::Writer,
        Role::RunController,
        Role::LogCollector,
        Role::EventType,
    ];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Producer => "producer",
            Role::Converter => "converter",
            Role::Reader => "reader",
            Role::Writer => "writer",
            Role::RunController => "run controller",
            Role::LogCollector => "log collector",
            Role::EventType => "event type",
        };
        f.write_str(name)
    }
}

/// Builds a producer from its instance name.
pub type ProducerFactory = dyn Fn(&str) -> Box<dyn Producer> + Send + Sync;
/// Builds a converter; one instance is shared by every event of its type.
pub type ConverterFactory = dyn Fn() -> Arc<dyn Converter> + Send + Sync;
/// Opens an event file for reading.
pub type ReaderFactory = dyn Fn(&Path) -> AppResult<Box<dyn FileReader>> + Send + Sync;
/// Creates an event file for writing.
pub type WriterFactory = dyn Fn(&Path) -> AppResult<Box<dyn FileWriter>> + Send + Sync;
/// Builds a run controller reporting to a log collector.
pub type RunControlFactory =
    dyn Fn(&RunControlConfig, Arc<dyn LogCollector>) -> Box<dyn RunControl> + Send + Sync;
/// Builds a log collector.
pub type LogCollectorFactory =
    dyn Fn(&LogCollectorConfig) -> AppResult<Arc<dyn LogCollector>> + Send + Sync;
/// Builds an empty raw event of a known type.
pub type EventTypeFactory = dyn Fn() -> Event + Send + Sync;

struct Entry<F: ?Sized> {
    name: String,
    make: Box<F>,
}

/// Hash-keyed factory table for one role.
pub struct Factory<F: ?Sized> {
    role: Role,
    entries: HashMap<u32, Entry<F>>,
}

impl<F: ?Sized> Factory<F> {
    fn new(role: Role) -> Self {
        Self {
            role,
            entries: HashMap::new(),
        }
    }

    /// Register `make` under `name`.
    pub fn register(&mut self, name: &str, make: Box<F>) -> AppResult<()> {
        let hash = str2hash(name);
        if let Some(existing) = self.entries.get(&hash) {
            if existing.name != name {
                return Err(DaqError::RegistryCollision {
                    role: self.role.to_string(),
                    hash,
                    existing: existing.name.clone(),
                    rejected: name.to_string(),
                });
            }
            debug!(role = %self.role, name, "replacing registered factory");
        }
        self.entries.insert(
            hash,
            Entry {
                name: name.to_string(),
                make,
            },
        );
        Ok(())
    }

    /// Factory registered under exactly `name`.
    pub fn get(&self, name: &str) -> AppResult<&F> {
        let hash = str2hash(name);
        self.entries
            .get(&hash)
            .filter(|entry| entry.name == name)
            .map(|entry| entry.make.as_ref())
            .ok_or_else(|| DaqError::UnregisteredComponent {
                role: self.role.to_string(),
                hash,
                name: Some(name.to_string()),
            })
    }

    /// Name and factory registered under `hash`.
    pub fn get_by_hash(&self, hash: u32) -> AppResult<(&str, &F)> {
        self.entries
            .get(&hash)
            .map(|entry| (entry.name.as_str(), entry.make.as_ref()))
            .ok_or_else(|| DaqError::UnregisteredComponent {
                role: self.role.to_string(),
                hash,
                name: None,
            })
    }

    /// True if something is registered under `hash`.
    pub fn contains_hash(&self, hash: u32) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.values().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }
}

/// Factory tables for every role.
pub struct Registry {
    producers: Factory<ProducerFactory>,
    converters: Factory<ConverterFactory>,
    readers: Factory<ReaderFactory>,
    writers: Factory<WriterFactory>,
    run_controllers: Factory<RunControlFactory>,
    log_collectors: Factory<LogCollectorFactory>,
    event_types: Factory<EventTypeFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: Lazy<Arc<Registry>> = Lazy::new(|| Arc::new(Registry::builtin()));

/// Process-wide registry holding every built-in component, built on first use.
pub fn global() -> Arc<Registry> {
    Arc::clone(&GLOBAL)
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            producers: Factory::new(Role::Producer),
            converters: Factory::new(Role::Converter),
            readers: Factory::new(Role::Reader),
            writers: Factory::new(Role::Writer),
            run_controllers: Factory::new(Role::RunController),
            log_collectors: Factory::new(Role::LogCollector),
            event_types: Factory::new(Role::EventType),
        }
    }

    /// Registry with every built-in component registered.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        if let Err(err) = registry.register_builtins() {
            error!(%err, "built-in component registration failed");
        }
        registry
    }

    fn register_builtins(&mut self) -> AppResult<()> {
        crate::producer::register(self)?;
        crate::converter::register(self)?;
        crate::file::register(self)?;
        crate::run_control::register(self)?;
        crate::log_collector::register(self)?;
        Ok(())
    }

    // --- producers --------------------------------------------------------

    /// Register a producer type.
    pub fn register_producer<F>(&mut self, name: &str, make: F) -> AppResult<()>
    where
        F: Fn(&str) -> Box<dyn Producer> + Send + Sync + 'static,
    {
        self.producers.register(name, Box::new(make))
    }

    /// Create a producer of type `name` for the instance `instance`.
    pub fn create_producer(&self, name: &str, instance: &str) -> AppResult<Box<dyn Producer>> {
        Ok((self.producers.get(name)?)(instance))
    }

    // --- converters -------------------------------------------------------

    /// Register a converter for the raw event type `event_type`.
    pub fn register_converter<F>(&mut self, event_type: &str, make: F) -> AppResult<()>
    where
        F: Fn() -> Arc<dyn Converter> + Send + Sync + 'static,
    {
        self.converters.register(event_type, Box::new(make))
    }

    /// Create the converter for the raw event type `event_type`.
    pub fn create_converter(&self, event_type: &str) -> AppResult<Arc<dyn Converter>> {
        Ok((self.converters.get(event_type)?)())
    }

    /// Create the converter for the raw event type tag `type_id`.
    pub fn create_converter_by_hash(&self, type_id: u32) -> AppResult<Arc<dyn Converter>> {
        let (_, make) = self.converters.get_by_hash(type_id)?;
        Ok(make())
    }

    /// True if a converter handles the type tag `type_id`.
    pub fn has_converter(&self, type_id: u32) -> bool {
        self.converters.contains_hash(type_id)
    }

    // --- files ------------------------------------------------------------

    /// Register a file reader under a format name.
    pub fn register_reader<F>(&mut self, format: &str, make: F) -> AppResult<()>
    where
        F: Fn(&Path) -> AppResult<Box<dyn FileReader>> + Send + Sync + 'static,
    {
        self.readers.register(format, Box::new(make))
    }

    /// Open `path` with the reader for `format`.
    pub fn create_reader(&self, format: &str, path: &Path) -> AppResult<Box<dyn FileReader>> {
        (self.readers.get(format)?)(path)
    }

    /// Register a file writer under a format name.
    pub fn register_writer<F>(&mut self, format: &str, make: F) -> AppResult<()>
    where
        F: Fn(&Path) -> AppResult<Box<dyn FileWriter>> + Send + Sync + 'static,
    {
        self.writers.register(format, Box::new(make))
    }

    /// Create `path` with the writer for `format`.
    pub fn create_writer(&self, format: &str, path: &Path) -> AppResult<Box<dyn FileWriter>> {
        (self.writers.get(format)?)(path)
    }

    // --- run control and logging -----------------------------------------

    /// Register a run controller implementation.
    pub fn register_run_controller<F>(&mut self, name: &str, make: F) -> AppResult<()>
    where
        F: Fn(&RunControlConfig, Arc<dyn LogCollector>) -> Box<dyn RunControl>
            + Send
            + Sync
            + 'static,
    {
        self.run_controllers.register(name, Box::new(make))
    }

    /// Create the run controller `name`.
    pub fn create_run_controller(
        &self,
        name: &str,
        config: &RunControlConfig,
        log: Arc<dyn LogCollector>,
    ) -> AppResult<Box<dyn RunControl>> {
        Ok((self.run_controllers.get(name)?)(config, log))
    }

    /// Register a log collector implementation.
    pub fn register_log_collector<F>(&mut self, name: &str, make: F) -> AppResult<()>
    where
        F: Fn(&LogCollectorConfig) -> AppResult<Arc<dyn LogCollector>> + Send + Sync + 'static,
    {
        self.log_collectors.register(name, Box::new(make))
    }

    /// Create the log collector named in `config`.
    pub fn create_log_collector(
        &self,
        config: &LogCollectorConfig,
    ) -> AppResult<Arc<dyn LogCollector>> {
        (self.log_collectors.get(&config.kind)?)(config)
    }

    // --- event types ------------------------------------------------------

    /// Declare a raw event type.
    pub fn register_event_type(&mut self, name: &str) -> AppResult<()> {
        let owned = name.to_string();
        self.event_types
            .register(name, Box::new(move || Event::new(&owned)))
    }

    /// Empty raw event of the registered type `name`.
    pub fn make_event(&self, name: &str) -> AppResult<Event> {
        Ok((self.event_types.get(name)?)())
    }

    /// Name of the registered event type with tag `type_id`.
    pub fn event_type_name(&self, type_id: u32) -> Option<&str> {
        self.event_types.get_by_hash(type_id).ok().map(|(name, _)| name)
    }

    /// Deserialize an event and require its type tag to be registered.
    ///
    /// The blocks of an event with an unknown tag are still intact; callers that only move
    /// bytes around can use [`Event::from_bytes`] instead.
    pub fn decode_event(&self, bytes: &[u8]) -> AppResult<Event> {
        let event = Event::from_bytes(bytes)?;
        self.event_types.get_by_hash(event.type_id())?;
        Ok(event)
    }

    // --- listing ----------------------------------------------------------

    /// Registered names for `role`, sorted.
    pub fn list(&self, role: Role) -> Vec<String> {
        match role {
            Role::Producer => self.producers.names(),
            Role::Converter => self.converters.names(),
            Role::Reader => self.readers.names(),
            Role::Writer => self.writers.names(),
            Role::RunController => self.run_controllers.names(),
            Role::LogCollector => self.log_collectors.names(),
            Role::EventType => self.event_types.names(),
        }
    }
}
