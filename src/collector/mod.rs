//! Run-controlled data collector.
//!
//! The collector receives raw events from any number of producers and writes them, in
//! arrival order, to one file per run. Producer order is preserved because every producer
//! feeds the collector over a single ordered channel.

pub mod streams;

use crate::config::CollectorConfig;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::file::{extension_for_format, FileWriter};
use crate::registry::{Registry, Role};
use crate::run_control::{
    Command, ComponentHandle, ComponentKind, ComponentStatus, ControlMessage, State,
    StateMachine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

pub use streams::{expand_file_pattern, StreamInfo, StreamTracker};

const COMMAND_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 4096;

/// Data collector actor.
pub struct DataCollector {
    base: CollectorConfig,
    config: CollectorConfig,
    registry: Arc<Registry>,
    machine: StateMachine,
    commands: mpsc::Receiver<ControlMessage>,
    events: mpsc::Receiver<Event>,
    events_open: bool,
    writer: Option<Box<dyn FileWriter>>,
    file: Option<PathBuf>,
    streams: StreamTracker,
    dropped: u64,
}

impl DataCollector {
    /// Start a collector.
    ///
    /// Returns the command handle, the sender producers feed events into, and the actor
    /// task. The sender can be cloned freely; a [`DataReceiver`](crate::network::DataReceiver)
    /// uses it to forward network producers.
    pub fn spawn(
        config: CollectorConfig,
        registry: Arc<Registry>,
    ) -> (ComponentHandle, mpsc::Sender<Event>, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let machine = StateMachine::new(&config.name);
        let handle = ComponentHandle::new(
            &config.name,
            ComponentKind::Collector,
            command_tx,
            machine.subscribe(),
        );
        let collector = Self {
            base: config.clone(),
            config,
            registry,
            machine,
            commands: command_rx,
            events: event_rx,
            events_open: true,
            writer: None,
            file: None,
            streams: StreamTracker::new(),
            dropped: 0,
        };
        let task = tokio::spawn(collector.run());
        (handle, event_tx, task)
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                message = self.commands.recv() => match message {
                    Some(ControlMessage { command, reply }) => {
                        let status = self.handle(command).await;
                        let _ = reply.send(status);
                    }
                    None => break,
                },
                event = self.events.recv(), if self.events_open => match event {
                    Some(event) => self.record(event),
                    None => self.events_open = false,
                }
            }
        }

        if self.machine.state() != State::Terminated {
            self.terminate();
        }
    }

    async fn handle(&mut self, command: Command) -> ComponentStatus {
        let kind = command.kind();
        if let Err(err) = self.machine.check(kind) {
            warn!(collector = self.machine.name(), state = %self.machine.state(), error = %err, "command rejected");
            return self.machine.status();
        }
        let result = match command {
            Command::Configure(params) => self.configure(params),
            Command::StartRun(run) => self.start_run(run),
            Command::StopRun => self.stop_run().await,
            Command::Terminate => {
                self.terminate();
                Ok(())
            }
            Command::Status => Ok(()),
        };
        if let Err(err) = result {
            error!(collector = self.machine.name(), error = %err, "collector failed");
            self.close_file();
            self.machine.fail(&err);
        }
        self.machine.status()
    }

    fn configure(&mut self, params: toml::Table) -> AppResult<()> {
        let config = merge_params(&self.base, params)?;
        if !self.registry.list(Role::Writer).contains(&config.writer) {
            return Err(DaqError::Configuration(format!(
                "no file writer named '{}'",
                config.writer
            )));
        }
        info!(
            collector = self.machine.name(),
            data_dir = %config.data_dir.display(),
            pattern = %config.file_pattern,
            writer = %config.writer,
            "configured"
        );
        self.config = config;
        self.machine.set(State::Configured);
        Ok(())
    }

    fn start_run(&mut self, run: u32) -> AppResult<()> {
        self.machine.begin_run(run);
        self.streams.clear();
        self.dropped = 0;
        let name = expand_file_pattern(
            &self.config.file_pattern,
            run,
            &extension_for_format(&self.config.writer),
        );
        let path = self.config.data_dir.join(name);
        self.writer = Some(self.registry.create_writer(&self.config.writer, &path)?);
        info!(collector = self.machine.name(), run, file = %path.display(), "run started");
        self.file = Some(path);
        self.machine.set(State::Running);
        Ok(())
    }

    async fn stop_run(&mut self) -> AppResult<()> {
        while let Ok(event) = self.events.try_recv() {
            self.record(event);
        }
        let deadline = Instant::now() + self.config.eore_timeout;
        while !self.streams.all_closed() && self.events_open {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.record(event),
                    None => self.events_open = false,
                },
                _ = sleep_until(deadline) => break,
            }
        }
        for open in self.streams.open_streams() {
            warn!(
                collector = self.machine.name(),
                stream = open.stream,
                description = %open.description,
                events = open.events,
                "stream closed without EORE"
            );
        }
        if let Some(mut writer) = self.writer.take() {
            writer.close()?;
        }
        info!(
            collector = self.machine.name(),
            run = self.machine.run_number(),
            streams = self.streams.len(),
            events = self.machine.events(),
            dropped = self.dropped,
            file = ?self.file,
            "run stopped"
        );
        self.machine.set(State::Stopped);
        Ok(())
    }

    fn terminate(&mut self) {
        self.close_file();
        self.machine.set(State::Terminated);
        info!(collector = self.machine.name(), "terminated");
    }

    fn close_file(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(err) = writer.close() {
                error!(collector = self.machine.name(), error = %err, "closing run file failed");
            }
        }
    }

    fn record(&mut self, event: Event) {
        let Some(writer) = self.writer.as_mut() else {
            self.dropped += 1;
            debug!(
                collector = self.machine.name(),
                stream = event.stream_number(),
                event = event.event_number(),
                "event outside a run dropped"
            );
            return;
        };
        self.streams.observe(&event);
        match writer.write(&event) {
            Ok(()) => self.machine.count_event(),
            Err(err) => {
                error!(collector = self.machine.name(), error = %err, "write failed");
                self.machine.record_error(&err);
            }
        }
    }
}

/// `base` with the keys of `params` replaced.
fn merge_params(base: &CollectorConfig, params: toml::Table) -> AppResult<CollectorConfig> {
    let mut table = match toml::Value::try_from(base) {
        Ok(toml::Value::Table(table)) => table,
        Ok(_) => toml::Table::new(),
        Err(e) => return Err(DaqError::Configuration(e.to_string())),
    };
    table.extend(params);
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| DaqError::Configuration(format!("collector parameters: {e}")))
}
