//! Raw to standard event conversion.
//!
//! A [`Converter`] is registered for one raw event type. It never decodes data on its own:
//! the begin-of-run event of each producer stream is handed to
//! [`Converter::begin_run`], which learns the run parameters from the tags and blocks and
//! returns a [`RunDecoder`] holding them. The [`ConversionPipeline`] owns one decoder per
//! producer stream and routes every later event of that stream to it. A stream whose BORE
//! was never seen, or could not be understood, has no decoder and its events fail.

pub mod cmspixel;
pub mod drs4;
pub mod pipeline;

use crate::config::ConversionConfig;
use crate::error::AppResult;
use crate::event::Event;
use crate::registry::Registry;
use crate::standard::StandardEvent;
use std::sync::Arc;

pub use cmspixel::CmsPixelConverter;
pub use drs4::Drs4Converter;
pub use pipeline::{Conversion, ConversionFailure, ConversionPipeline, ConversionStats};

/// Converter for one raw event type.
pub trait Converter: Send + Sync {
    /// Build the decoding state for one producer stream from its begin-of-run event.
    fn begin_run(&self, bore: &Event, config: &ConversionConfig) -> AppResult<Box<dyn RunDecoder>>;
}

/// Per-run, per-stream decoding state.
pub trait RunDecoder: Send {
    /// Decode `raw` into `out`, appending planes and waveforms.
    fn decode(&mut self, raw: &Event, out: &mut StandardEvent) -> AppResult<()>;

    /// Called once when the stream's end-of-run event arrives.
    fn end_run(&mut self) {}
}

/// Register the built-in converters.
pub fn register(registry: &mut Registry) -> AppResult<()> {
    for event_type in cmspixel::EVENT_TYPES {
        registry.register_converter(event_type, move || {
            Arc::new(CmsPixelConverter::new(event_type)) as Arc<dyn Converter>
        })?;
        registry.register_event_type(event_type)?;
    }
    registry.register_converter(drs4::EVENT_TYPE, || {
        Arc::new(Drs4Converter) as Arc<dyn Converter>
    })?;
    registry.register_event_type(drs4::EVENT_TYPE)?;
    Ok(())
}
