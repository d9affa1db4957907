//! Hardware front-ends.
//!
//! A [`Producer`] only talks to its device: it applies parameters, describes a run in its
//! begin-of-run event and hands out raw events when asked. Everything protocol related
//! (state machine, event numbering, BORE/EORE flags, forwarding to the collector) is done
//! by the [`ProducerRuntime`] that drives it.

pub mod cmspixel;
pub mod drs4;
pub mod runtime;

use crate::config::ProducerConfig;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::registry::Registry;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

pub use cmspixel::CmsPixelProducer;
pub use drs4::Drs4Producer;
pub use runtime::{ProducerRuntime, RuntimeConfig};

/// Outcome of asking the hardware for the next event.
#[derive(Debug)]
pub enum PollResult {
    /// Nothing is ready; ask again later.
    NoEventYet,
    /// One raw event. Header numbering is filled in by the runtime.
    Event(Event),
    /// The device failed; the producer enters the Error state.
    Fault(String),
}

/// Driver for one piece of hardware.
#[async_trait]
pub trait Producer: Send {
    /// Raw event type emitted with the current configuration.
    fn event_type(&self) -> &str;

    /// How long to keep reading after a stop request before the hardware is halted.
    fn grace_period(&self) -> Duration {
        Duration::ZERO
    }

    /// Apply the parameters in `config`.
    async fn configure(&mut self, config: &ProducerConfig) -> AppResult<()>;

    /// Arm the hardware for `run_number` and return the begin-of-run event content.
    async fn begin_run(&mut self, run_number: u32) -> AppResult<Event>;

    /// Fetch the next event without blocking on the device.
    async fn poll(&mut self) -> PollResult;

    /// Halt acquisition; no new triggers are accepted afterwards.
    async fn end_run(&mut self) -> AppResult<()>;

    /// Events still buffered on the device after [`end_run`](Self::end_run).
    async fn drain(&mut self) -> AppResult<Vec<Event>> {
        Ok(Vec::new())
    }

    /// Release the hardware.
    async fn terminate(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Destination of a producer's event stream. Events arrive in send order.
#[async_trait]
pub trait EventSink: Send {
    /// Forward one event.
    async fn send(&mut self, event: Event) -> AppResult<()>;
}

#[async_trait]
impl EventSink for mpsc::Sender<Event> {
    async fn send(&mut self, event: Event) -> AppResult<()> {
        mpsc::Sender::send(self, event)
            .await
            .map_err(|_| DaqError::Protocol("event receiver has shut down".to_string()))
    }
}

/// Register the built-in producers.
pub fn register(registry: &mut Registry) -> AppResult<()> {
    registry.register_producer("CMSPixelProducer", |name| {
        Box::new(CmsPixelProducer::new(name)) as Box<dyn Producer>
    })?;
    registry.register_producer("DRS4Producer", |name| {
        Box::new(Drs4Producer::new(name)) as Box<dyn Producer>
    })?;
    Ok(())
}
