//! Bookkeeping of the producer streams feeding a collector.

use crate::event::Event;
use std::collections::BTreeMap;
use tracing::warn;

/// What the collector has seen of one producer stream during the current run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    /// Stream number from the event header.
    pub stream: u32,
    /// Description of the first event of the stream.
    pub description: String,
    /// The BORE arrived.
    pub bore: bool,
    /// The EORE arrived.
    pub eore: bool,
    /// Event number of the first data event.
    pub first_event: Option<u32>,
    /// Event number of the last data event.
    pub last_event: Option<u32>,
    /// Events received, BORE and EORE included.
    pub events: u64,
}

impl StreamInfo {
    fn new(event: &Event) -> Self {
        Self {
            stream: event.stream_number(),
            description: event.description().to_string(),
            bore: false,
            eore: false,
            first_event: None,
            last_event: None,
            events: 0,
        }
    }
}

/// Per-stream state of one run.
#[derive(Debug, Default)]
pub struct StreamTracker {
    streams: BTreeMap<u32, StreamInfo>,
}

impl StreamTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Account for `event`, warning about out-of-order delivery.
    pub fn observe(&mut self, event: &Event) {
        let info = self
            .streams
            .entry(event.stream_number())
            .or_insert_with(|| StreamInfo::new(event));
        info.events += 1;

        if event.is_bore() {
            if info.bore {
                warn!(stream = info.stream, description = %info.description, "second BORE on stream");
            }
            info.bore = true;
            return;
        }
        if !info.bore {
            warn!(stream = info.stream, event = event.event_number(), "event before BORE");
        }
        if info.eore {
            warn!(stream = info.stream, event = event.event_number(), "event after EORE");
        }
        if event.is_eore() {
            info.eore = true;
            return;
        }

        let number = event.event_number();
        if let Some(last) = info.last_event {
            if number <= last {
                warn!(stream = info.stream, last, event = number, "event numbers not increasing");
            }
        }
        info.first_event.get_or_insert(number);
        info.last_event = Some(number);
    }

    /// True when every known stream delivered its EORE.
    pub fn all_closed(&self) -> bool {
        self.streams.values().all(|info| info.eore)
    }

    /// Streams still waiting for their EORE.
    pub fn open_streams(&self) -> Vec<&StreamInfo> {
        self.streams.values().filter(|info| !info.eore).collect()
    }

    /// Every stream, ordered by stream number.
    pub fn streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.values()
    }

    /// One stream.
    pub fn get(&self, stream: u32) -> Option<&StreamInfo> {
        self.streams.get(&stream)
    }

    /// Number of known streams.
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// True before the first event of a run.
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Forget every stream.
    pub fn clear(&mut self) {
        self.streams.clear();
    }
}

/// Expand a run file name pattern.
///
/// `$<width>R` is the run number zero padded to `width` digits, `$R` the plain run number
/// and `$X` the extension.
///
/// ```
/// use rust_eudaq::collector::expand_file_pattern;
///
/// assert_eq!(expand_file_pattern("run$6R$X", 123, ".raw"), "run000123.raw");
/// ```
pub fn expand_file_pattern(pattern: &str, run: u32, extension: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut width = String::new();
        while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
            width.push(d);
            chars.next();
        }
        match chars.peek().copied() {
            Some('R') => {
                chars.next();
                let width: usize = width.parse().unwrap_or(0);
                out.push_str(&format!("{run:0width$}"));
            }
            Some('X') if width.is_empty() => {
                chars.next();
                out.push_str(extension);
            }
            _ => {
                out.push('$');
                out.push_str(&width);
            }
        }
    }
    out
}
