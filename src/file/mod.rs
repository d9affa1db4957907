//! Event file readers and writers.
//!
//! Formats are registry roles selected by name. The name usually comes from a file
//! extension through [`format_for_path`], with `raw` standing for the `native` format.

pub mod jsonl;
pub mod native;

use crate::error::AppResult;
use crate::event::Event;
use crate::registry::Registry;
use std::path::Path;

pub use jsonl::JsonLinesWriter;
pub use native::{NativeReader, NativeWriter};

/// Sequential source of raw events.
pub trait FileReader: Send {
    /// Next event, or `None` at a clean end of file.
    fn next_event(&mut self) -> AppResult<Option<Event>>;

    /// Byte offset of the next record.
    fn position(&self) -> u64;
}

/// Sink for events.
pub trait FileWriter: Send {
    /// Append one event.
    fn write(&mut self, event: &Event) -> AppResult<()>;

    /// Push buffered output to the file.
    fn flush(&mut self) -> AppResult<()>;

    /// Events written so far.
    fn events_written(&self) -> u64;

    /// Flush and release the file. Called once at end of run.
    fn close(&mut self) -> AppResult<()> {
        self.flush()
    }
}

/// Registry format name for `path`, from its extension.
///
/// ```
/// use rust_eudaq::file::format_for_path;
/// use std::path::Path;
///
/// assert_eq!(format_for_path(Path::new("run000042.raw")), "native");
/// assert_eq!(format_for_path(Path::new("out.jsonl")), "jsonl");
/// ```
pub fn format_for_path(path: &Path) -> String {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("raw") | None => "native".to_string(),
        Some(ext) => ext.to_ascii_lowercase(),
    }
}

/// File extension (with the dot) used for files of `format`.
pub fn extension_for_format(format: &str) -> String {
    match format {
        "native" => ".raw".to_string(),
        other => format!(".{other}"),
    }
}

/// Register the built-in formats.
pub fn register(registry: &mut Registry) -> AppResult<()> {
    registry.register_reader("native", |path| {
        Ok(Box::new(NativeReader::open(path)?) as Box<dyn FileReader>)
    })?;
    registry.register_writer("native", |path| {
        Ok(Box::new(NativeWriter::create(path)?) as Box<dyn FileWriter>)
    })?;
    registry.register_writer("jsonl", |path| {
        Ok(Box::new(JsonLinesWriter::create(path)?) as Box<dyn FileWriter>)
    })
}
