//! Converting writer: one standard event per line, as JSON.

use super::FileWriter;
use crate::config::ConversionConfig;
use crate::converter::{Conversion, ConversionPipeline};
use crate::error::AppResult;
use crate::event::Event;
use crate::registry;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Writes the standard event of every converted raw event as a JSON line.
///
/// BORE and EORE events only drive the decoding contexts. Events that fail to convert are
/// skipped; the pipeline has already logged and recorded them.
pub struct JsonLinesWriter {
    path: PathBuf,
    out: BufWriter<File>,
    pipeline: ConversionPipeline,
    events: u64,
}

impl JsonLinesWriter {
    /// Create `path` using the converters of the process-wide registry.
    pub fn create(path: &Path) -> AppResult<Self> {
        Self::with_pipeline(
            path,
            ConversionPipeline::new(registry::global(), ConversionConfig::default()),
        )
    }

    /// Create `path` converting through `pipeline`.
    pub fn with_pipeline(path: &Path, pipeline: ConversionPipeline) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            out: BufWriter::new(File::create(path)?),
            pipeline,
            events: 0,
        })
    }

    /// Conversion pipeline used by this writer.
    pub fn pipeline(&self) -> &ConversionPipeline {
        &self.pipeline
    }
}

impl FileWriter for JsonLinesWriter {
    fn write(&mut self, event: &Event) -> AppResult<()> {
        if let Ok((Conversion::Converted, standard)) = self.pipeline.convert(event) {
            serde_json::to_writer(&mut self.out, &standard).map_err(std::io::Error::from)?;
            self.out.write_all(b"\n")?;
            self.events += 1;
        }
        Ok(())
    }

    fn flush(&mut self) -> AppResult<()> {
        self.out.flush()?;
        Ok(())
    }

    fn events_written(&self) -> u64 {
        self.events
    }

    fn close(&mut self) -> AppResult<()> {
        self.out.flush()?;
        self.pipeline.log_summary();
        info!(path = %self.path.display(), events = self.events, "JSON lines writer closed");
        Ok(())
    }
}
