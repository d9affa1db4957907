//! Registry-driven conversion of raw event streams.

use super::{Converter, RunDecoder};
use crate::config::ConversionConfig;
use crate::error::{AppResult, DaqError};
use crate::event::Event;
use crate::registry::Registry;
use crate::standard::StandardEvent;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What [`ConversionPipeline::convert_into`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conversion {
    /// At least one converter decoded data into the standard event.
    Converted,
    /// Begin-of-run event: decoding contexts were (re)built, no data was decoded.
    BeginOfRun,
    /// End-of-run event: passed through, contexts were released.
    EndOfRun,
    /// No converter is registered for the event or any of its sub-events.
    Unconverted,
}

/// One event that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionFailure {
    /// Run number of the event.
    pub run: u32,
    /// Event number of the event.
    pub event: u32,
    /// Stream that emitted the event.
    pub stream: u32,
    /// Type tag of the event.
    pub type_id: u32,
    /// Error text.
    pub reason: String,
}

/// Counters kept by a pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConversionStats {
    /// Events with decoded content.
    pub converted: u64,
    /// Events no converter was registered for.
    pub unconverted: u64,
    /// Events whose conversion failed.
    pub failed: u64,
}

/// Most recent failures kept in memory; the error file holds the full list.
pub const MAX_RECORDED_FAILURES: usize = 1000;

type ContextKey = (u32, u32);
type SharedDecoder = Arc<Mutex<Box<dyn RunDecoder>>>;

/// Turns raw events into [`StandardEvent`]s using the converters of a [`Registry`].
///
/// Decoding contexts are owned per producer stream, keyed by `(type tag, stream number)`,
/// so two producers of the same type never share run parameters. Each context sits behind
/// its own lock; a pipeline can be shared between threads.
pub struct ConversionPipeline {
    registry: Arc<Registry>,
    config: ConversionConfig,
    converters: Mutex<HashMap<u32, Arc<dyn Converter>>>,
    contexts: Mutex<HashMap<ContextKey, SharedDecoder>>,
    failures: Mutex<VecDeque<ConversionFailure>>,
    converted: AtomicU64,
    unconverted: AtomicU64,
    failed: AtomicU64,
}

impl ConversionPipeline {
    /// Pipeline using the converters of `registry`.
    pub fn new(registry: Arc<Registry>, config: ConversionConfig) -> Self {
        Self {
            registry,
            config,
            converters: Mutex::new(HashMap::new()),
            contexts: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            converted: AtomicU64::new(0),
            unconverted: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Convert `raw`, isolating failures.
    ///
    /// A failure is logged with run and event number, recorded in [`failures`](Self::failures)
    /// and appended to the run's error file before being returned; the pipeline stays usable
    /// for the next event.
    pub fn convert(&self, raw: &Event) -> AppResult<(Conversion, StandardEvent)> {
        let mut out = StandardEvent::from_raw(raw);
        match self.convert_into(raw, &mut out) {
            Ok(outcome) => {
                match outcome {
                    Conversion::Converted => {
                        self.converted.fetch_add(1, Ordering::Relaxed);
                    }
                    Conversion::Unconverted => {
                        self.unconverted.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            run = raw.run_number(),
                            event = raw.event_number(),
                            type_id = raw.type_id(),
                            description = raw.description(),
                            "no converter registered, event passed through unconverted"
                        );
                    }
                    Conversion::BeginOfRun | Conversion::EndOfRun => {}
                }
                Ok((outcome, out))
            }
            Err(err) => {
                self.record_failure(raw, &err);
                Err(err)
            }
        }
    }

    /// Convert `raw` into `out` without recording failures.
    pub fn convert_into(&self, raw: &Event, out: &mut StandardEvent) -> AppResult<Conversion> {
        if raw.is_eore() {
            self.end_run(raw);
            return Ok(Conversion::EndOfRun);
        }
        if raw.is_bore() {
            self.begin_run(raw)?;
            return Ok(Conversion::BeginOfRun);
        }
        if self.dispatch(raw, out)? {
            Ok(Conversion::Converted)
        } else {
            Ok(Conversion::Unconverted)
        }
    }

    fn converter(&self, type_id: u32) -> Option<Arc<dyn Converter>> {
        let mut converters = self.converters.lock();
        if let Some(converter) = converters.get(&type_id) {
            return Some(Arc::clone(converter));
        }
        let converter = self.registry.create_converter_by_hash(type_id).ok()?;
        converters.insert(type_id, Arc::clone(&converter));
        Some(converter)
    }

    fn begin_run(&self, bore: &Event) -> AppResult<()> {
        let key = (bore.type_id(), bore.stream_number());
        if let Some(converter) = self.converter(bore.type_id()) {
            match converter.begin_run(bore, &self.config) {
                Ok(decoder) => {
                    let replaced = self
                        .contexts
                        .lock()
                        .insert(key, Arc::new(Mutex::new(decoder)))
                        .is_some();
                    debug!(
                        run = bore.run_number(),
                        stream = bore.stream_number(),
                        replaced,
                        "decoding context created"
                    );
                }
                Err(err) => {
                    self.contexts.lock().remove(&key);
                    return Err(as_decode_failure(bore, err));
                }
            }
        }
        for sub in bore.sub_events() {
            self.begin_run(sub)?;
        }
        Ok(())
    }

    fn end_run(&self, eore: &Event) {
        let key = (eore.type_id(), eore.stream_number());
        let context = self.contexts.lock().remove(&key);
        if let Some(context) = context {
            context.lock().end_run();
        }
        for sub in eore.sub_events() {
            self.end_run(sub);
        }
    }

    fn dispatch(&self, raw: &Event, out: &mut StandardEvent) -> AppResult<bool> {
        let mut handled = false;
        if self.registry.has_converter(raw.type_id()) {
            let key = (raw.type_id(), raw.stream_number());
            let context = self.contexts.lock().get(&key).cloned().ok_or_else(|| {
                DaqError::decode(
                    raw.run_number(),
                    raw.event_number(),
                    format!(
                        "no begin-of-run event seen for type {:#010x} on stream {}",
                        raw.type_id(),
                        raw.stream_number()
                    ),
                )
            })?;
            context
                .lock()
                .decode(raw, out)
                .map_err(|err| as_decode_failure(raw, err))?;
            handled = true;
        }
        for sub in raw.sub_events() {
            handled |= self.dispatch(sub, out)?;
        }
        Ok(handled)
    }

    fn record_failure(&self, raw: &Event, err: &DaqError) {
        error!(
            run = raw.run_number(),
            event = raw.event_number(),
            stream = raw.stream_number(),
            error = %err,
            "event conversion failed"
        );
        self.failed.fetch_add(1, Ordering::Relaxed);
        {
            let mut failures = self.failures.lock();
            if failures.len() == MAX_RECORDED_FAILURES {
                failures.pop_front();
            }
            failures.push_back(ConversionFailure {
                run: raw.run_number(),
                event: raw.event_number(),
                stream: raw.stream_number(),
                type_id: raw.type_id(),
                reason: err.to_string(),
            });
        }
        if let Some(path) = self.error_file(raw.run_number()) {
            let written = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .and_then(|mut file| writeln!(file, "{}", raw.event_number()));
            if let Err(io_err) = written {
                warn!(path = %path.display(), error = %io_err, "cannot append to error file");
            }
        }
    }

    /// Error file of `run`, if an error directory is configured.
    pub fn error_file(&self, run: u32) -> Option<PathBuf> {
        self.config
            .error_dir
            .as_ref()
            .map(|dir| dir.join(format!("Errors{run:03}.txt")))
    }

    /// The most recent failures, oldest first.
    pub fn failures(&self) -> Vec<ConversionFailure> {
        self.failures.lock().iter().cloned().collect()
    }

    /// Current counters.
    pub fn stats(&self) -> ConversionStats {
        ConversionStats {
            converted: self.converted.load(Ordering::Relaxed),
            unconverted: self.unconverted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }

    /// True if a decoding context exists for the stream.
    pub fn has_context(&self, type_id: u32, stream: u32) -> bool {
        self.contexts.lock().contains_key(&(type_id, stream))
    }

    /// Log the counters.
    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            converted = stats.converted,
            unconverted = stats.unconverted,
            failed = stats.failed,
            "conversion summary"
        );
    }
}

fn as_decode_failure(raw: &Event, err: DaqError) -> DaqError {
    match err {
        DaqError::DecodeFailure { .. } => err,
        other => DaqError::decode(raw.run_number(), raw.event_number(), other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::cmspixel::{PixelHit, Readout};
    use crate::registry::str2hash;
    use tracing_test::traced_test;

    fn pipeline(config: ConversionConfig) -> ConversionPipeline {
        ConversionPipeline::new(Arc::new(Registry::builtin()), config)
    }

    fn bore(stream: u32, planes: u32) -> Event {
        let mut bore = Event::new("CMSPixelREF");
        bore.set_bore();
        bore.set_stream_number(stream);
        bore.set_run_number(12);
        bore.set_tag_value("PLANES", planes);
        bore.set_tag("ROCTYPE", "psi46digv21respin");
        bore
    }

    fn data(stream: u32, event_n: u32, roc: u16) -> Event {
        let readout = Readout {
            trigger_count: 1,
            phase: 0,
            hits: vec![PixelHit { roc, col: 1, row: 2, adc: 3 }],
        };
        let mut event = Event::new("CMSPixelREF");
        event.set_stream_number(stream);
        event.set_run_number(12);
        event.set_event_number(event_n);
        event.add_block_u16(0, &readout.to_words(2));
        event
    }

    #[test]
    fn test_events_before_bore_fail_closed() {
        let pipeline = pipeline(ConversionConfig::default());
        let err = pipeline.convert(&data(1, 1, 0)).unwrap_err();
        assert!(matches!(err, DaqError::DecodeFailure { run: 12, event: 1, .. }));
        assert_eq!(pipeline.stats().failed, 1);
    }

    #[test]
    fn test_contexts_are_per_stream() {
        let pipeline = pipeline(ConversionConfig::default());
        pipeline.convert(&bore(1, 2)).unwrap();
        pipeline.convert(&bore(2, 1)).unwrap();
        // ROC 1 exists on stream 1 (two planes) but not on stream 2 (one plane)
        let (outcome, sev) = pipeline.convert(&data(1, 1, 1)).unwrap();
        assert_eq!(outcome, Conversion::Converted);
        assert_eq!(sev.num_planes(), 2);
        assert!(pipeline.convert(&data(2, 1, 1)).is_err());
        assert!(pipeline.has_context(str2hash("CMSPixelREF"), 2));
    }

    #[test]
    fn test_unknown_bore_metadata_leaves_no_context() {
        let pipeline = pipeline(ConversionConfig::default());
        pipeline.convert(&bore(1, 2)).unwrap();
        let mut broken = bore(1, 2);
        broken.set_tag("ROCTYPE", "unknown");
        assert!(pipeline.convert(&broken).is_err());
        assert!(!pipeline.has_context(str2hash("CMSPixelREF"), 1));
        assert!(pipeline.convert(&data(1, 1, 0)).is_err());
    }

    #[test]
    fn test_eore_is_a_noop_and_releases_context() {
        let pipeline = pipeline(ConversionConfig::default());
        pipeline.convert(&bore(1, 2)).unwrap();
        let mut eore = Event::new("CMSPixelREF");
        eore.set_eore();
        eore.set_stream_number(1);
        let (outcome, sev) = pipeline.convert(&eore).unwrap();
        assert_eq!(outcome, Conversion::EndOfRun);
        assert!(sev.is_eore());
        assert!(sev.is_empty());
        assert!(!pipeline.has_context(str2hash("CMSPixelREF"), 1));
    }

    #[test]
    #[traced_test]
    fn test_unregistered_types_pass_through_and_are_reported() {
        let pipeline = pipeline(ConversionConfig::default());
        let (outcome, sev) = pipeline.convert(&Event::new("SomethingElse")).unwrap();
        assert_eq!(outcome, Conversion::Unconverted);
        assert!(sev.is_empty());
        assert_eq!(pipeline.stats().unconverted, 1);
        assert!(logs_contain("no converter registered"));
    }

    #[test]
    fn test_sub_events_convert_into_one_standard_event() {
        let pipeline = pipeline(ConversionConfig::default());
        let mut container_bore = Event::new("Container");
        container_bore.set_bore();
        container_bore.add_sub_event(bore(1, 2));
        container_bore.add_sub_event(bore(2, 2));
        pipeline.convert(&container_bore).unwrap();

        let mut container = Event::new("Container");
        container.set_event_number(4);
        container.add_sub_event(data(1, 4, 0));
        container.add_sub_event(data(2, 4, 1));
        let (outcome, sev) = pipeline.convert(&container).unwrap();
        assert_eq!(outcome, Conversion::Converted);
        assert_eq!(sev.num_planes(), 4);
        assert_eq!(sev.get_plane(0).unwrap().total_hits(), 1);
        assert_eq!(sev.get_plane(3).unwrap().total_hits(), 1);
    }

    #[test]
    #[traced_test]
    fn test_failures_are_recorded_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(ConversionConfig {
            error_dir: Some(dir.path().to_path_buf()),
            ..ConversionConfig::default()
        });
        pipeline.convert(&bore(1, 2)).unwrap();
        let mut corrupt = data(1, 3, 0);
        corrupt.add_block(0, vec![1, 2, 3]);
        assert!(pipeline.convert(&corrupt).is_err());
        assert!(pipeline.convert(&data(1, 4, 0)).is_ok());

        let failures = pipeline.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!((failures[0].run, failures[0].event), (12, 3));
        let text = std::fs::read_to_string(dir.path().join("Errors012.txt")).unwrap();
        assert_eq!(text, "3\n");
        assert!(logs_contain("event conversion failed"));
    }

    #[test]
    fn test_recorded_failures_are_capped() {
        let pipeline = pipeline(ConversionConfig::default());
        let total = MAX_RECORDED_FAILURES as u32 + 5;
        for n in 1..=total {
            assert!(pipeline.convert(&data(1, n, 0)).is_err());
        }
        let failures = pipeline.failures();
        assert_eq!(failures.len(), MAX_RECORDED_FAILURES);
        assert_eq!(failures[0].event, 6);
        assert_eq!(failures.last().unwrap().event, total);
        assert_eq!(pipeline.stats().failed, u64::from(total));
    }
}
