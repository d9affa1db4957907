//! Actor driving a [`Producer`] through the run-control lifecycle.
//!
//! Commands and the hardware run loop share one `select!` loop: while running, the loop
//! polls the device on every tick and otherwise waits for the next command. Every call
//! into the producer and every hand-off to the event sink is bounded by a timeout, so a
//! hung device or a stalled downstream turns into an Error state instead of a hung
//! component.

use super::{EventSink, PollResult, Producer};
use crate::config::{ProducerConfig, RunControlConfig};
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::run_control::{
    Command, ComponentHandle, ComponentKind, ComponentStatus, ControlMessage, State,
    StateMachine,
};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const COMMAND_QUEUE: usize = 16;
// Events taken from the device per tick before commands are looked at again
const MAX_BURST: usize = 256;

/// Timing of the runtime.
#[derive(Debug, Clone, Copy)]
pub struct RuntimeConfig {
    /// Interval between hardware polls while running
    pub poll_interval: Duration,
    /// Bound on every producer call
    pub hardware_timeout: Duration,
    /// Bound on releasing the hardware
    pub terminate_timeout: Duration,
}

impl From<&RunControlConfig> for RuntimeConfig {
    fn from(config: &RunControlConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            hardware_timeout: config.hardware_timeout,
            terminate_timeout: config.terminate_timeout,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from(&RunControlConfig::default())
    }
}

async fn bounded<T>(
    after: Duration,
    operation: &str,
    call: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    timeout(after, call).await.map_err(|_| DaqError::Timeout {
        operation: operation.to_string(),
        after,
    })?
}

/// Producer actor.
pub struct ProducerRuntime {
    producer: Box<dyn Producer>,
    producer_type: String,
    stream: u32,
    sink: Box<dyn EventSink>,
    config: RuntimeConfig,
    machine: StateMachine,
    commands: mpsc::Receiver<ControlMessage>,
    next_event: u32,
    run_open: bool,
}

impl ProducerRuntime {
    /// Start the actor for `producer` and return its command handle.
    ///
    /// `stream` is stamped into every event header and identifies this producer instance
    /// downstream.
    pub fn spawn(
        name: &str,
        producer_type: &str,
        producer: Box<dyn Producer>,
        stream: u32,
        sink: Box<dyn EventSink>,
        config: RuntimeConfig,
    ) -> (ComponentHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let machine = StateMachine::new(name);
        let handle = ComponentHandle::new(name, ComponentKind::Producer, tx, machine.subscribe());
        let runtime = Self {
            producer,
            producer_type: producer_type.to_string(),
            stream,
            sink,
            config,
            machine,
            commands: rx,
            next_event: 0,
            run_open: false,
        };
        let task = tokio::spawn(runtime.run());
        (handle, task)
    }

    async fn run(mut self) {
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.commands.recv() => match message {
                    Some(ControlMessage { command, reply }) => {
                        let status = self.handle(command).await;
                        let _ = reply.send(status);
                    }
                    None => break,
                },
                _ = ticker.tick(), if self.machine.state() == State::Running => {
                    if let Err(err) = self.poll_burst().await {
                        self.abort(err).await;
                    }
                }
            }
        }

        if self.machine.state() != State::Terminated {
            debug!(producer = self.machine.name(), "command channel closed, terminating");
            self.terminate().await;
        }
    }

    async fn handle(&mut self, command: Command) -> ComponentStatus {
        let kind = command.kind();
        if let Err(err) = self.machine.check(kind) {
            warn!(producer = self.machine.name(), state = %self.machine.state(), error = %err, "command rejected");
            return self.machine.status();
        }
        let result = match command {
            Command::Configure(params) => self.configure(params).await,
            Command::StartRun(run) => self.start_run(run).await,
            Command::StopRun => self.stop_run().await,
            Command::Terminate => {
                self.terminate().await;
                Ok(())
            }
            Command::Status => Ok(()),
        };
        if let Err(err) = result {
            self.abort(err).await;
        }
        self.machine.status()
    }

    async fn configure(&mut self, params: toml::Table) -> AppResult<()> {
        let config = ProducerConfig {
            params,
            ..ProducerConfig::new(self.machine.name(), self.producer_type.as_str())
        };
        bounded(
            self.config.hardware_timeout,
            "configuring the producer",
            self.producer.configure(&config),
        )
        .await?;
        self.machine.set(State::Configured);
        info!(
            producer = self.machine.name(),
            event_type = self.producer.event_type(),
            "configured"
        );
        Ok(())
    }

    async fn start_run(&mut self, run: u32) -> AppResult<()> {
        self.machine.begin_run(run);
        self.next_event = 0;
        let mut bore = bounded(
            self.config.hardware_timeout,
            "starting the run",
            self.producer.begin_run(run),
        )
        .await?;
        bore.set_bore();
        self.forward(bore).await?;
        self.run_open = true;
        self.machine.set(State::Running);
        info!(producer = self.machine.name(), run, "run started");
        Ok(())
    }

    async fn stop_run(&mut self) -> AppResult<()> {
        let grace = self.producer.grace_period();
        debug!(producer = self.machine.name(), ?grace, "waiting for in-flight triggers");
        let deadline = Instant::now() + grace;
        loop {
            self.poll_burst().await?;
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.config.poll_interval.min(deadline - now)).await;
        }

        bounded(
            self.config.hardware_timeout,
            "stopping the hardware",
            self.producer.end_run(),
        )
        .await?;
        let buffered = bounded(
            self.config.hardware_timeout,
            "reading the hardware buffer",
            self.producer.drain(),
        )
        .await?;
        debug!(producer = self.machine.name(), events = buffered.len(), "post run read-out");
        for event in buffered {
            self.forward(event).await?;
            self.machine.count_event();
        }
        self.send_eore().await?;
        self.machine.set(State::Stopped);
        info!(
            producer = self.machine.name(),
            run = self.machine.run_number(),
            events = self.machine.events(),
            "run stopped"
        );
        Ok(())
    }

    async fn terminate(&mut self) {
        if self.run_open {
            if let Err(err) = bounded(
                self.config.hardware_timeout,
                "stopping the hardware",
                self.producer.end_run(),
            )
            .await
            {
                warn!(producer = self.machine.name(), error = %err, "hardware did not stop cleanly");
            }
            if let Err(err) = self.send_eore().await {
                warn!(producer = self.machine.name(), error = %err, "end-of-run event lost");
            }
        }
        if let Err(err) = bounded(
            self.config.terminate_timeout,
            "releasing the hardware",
            self.producer.terminate(),
        )
        .await
        {
            warn!(producer = self.machine.name(), error = %err, "hardware release failed");
            self.machine.record_error(&err);
        }
        self.machine.set(State::Terminated);
        info!(producer = self.machine.name(), "terminated");
    }

    /// Take events from the device until it has none ready.
    async fn poll_burst(&mut self) -> AppResult<()> {
        for _ in 0..MAX_BURST {
            let polled = timeout(self.config.hardware_timeout, self.producer.poll())
                .await
                .map_err(|_| DaqError::Timeout {
                    operation: "polling the hardware".to_string(),
                    after: self.config.hardware_timeout,
                })?;
            match polled {
                PollResult::NoEventYet => return Ok(()),
                PollResult::Event(event) => {
                    self.forward(event).await?;
                    self.machine.count_event();
                }
                PollResult::Fault(message) => {
                    return Err(DaqError::HardwareFault {
                        producer: self.machine.name().to_string(),
                        message,
                    })
                }
            }
        }
        Ok(())
    }

    /// Enter Error, closing an open event stream first so the collector sees its end.
    async fn abort(&mut self, err: DaqError) {
        error!(
            producer = self.machine.name(),
            run = self.machine.run_number(),
            state = %self.machine.state(),
            error = %err,
            "producer fault"
        );
        if self.run_open {
            if let Err(send_err) = self.send_eore().await {
                warn!(producer = self.machine.name(), error = %send_err, "end-of-run event lost");
            }
        }
        self.machine.fail(&err);
    }

    async fn send_eore(&mut self) -> AppResult<()> {
        let mut eore = Event::new(self.producer.event_type());
        eore.set_eore();
        self.run_open = false;
        self.forward(eore).await
    }

    async fn forward(&mut self, mut event: Event) -> AppResult<()> {
        event.set_stream_number(self.stream);
        event.set_run_number(self.machine.run_number());
        event.set_event_number(self.next_event);
        self.next_event += 1;
        bounded(
            self.config.hardware_timeout,
            "forwarding an event",
            self.sink.send(event),
        )
        .await
    }
}
