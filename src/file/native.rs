//! Native raw format: serialized events, back to back, no file header.

use super::{FileReader, FileWriter};
use crate::codec::Deserializer;
use crate::error::{AppResult, DaqError};
use crate::event::{Event, EVENT_VERSION};
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CHUNK: usize = 64 * 1024;

/// Reader for native files.
///
/// Records are decoded from a growing buffer, so a record is only complete once all of its
/// bytes were read. Bytes left over at end of file are reported as a [`DaqError::CorruptRecord`].
pub struct NativeReader {
    path: PathBuf,
    file: File,
    buffer: Vec<u8>,
    offset: u64,
    eof: bool,
}

impl NativeReader {
    /// Open `path` at its first record.
    pub fn open(path: &Path) -> AppResult<Self> {
        Self::open_at(path, 0)
    }

    /// Open `path` at byte `offset`, which must be a record boundary.
    pub fn open_at(path: &Path, offset: u64) -> AppResult<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        debug!(path = %path.display(), offset, "native file opened");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            buffer: Vec::new(),
            offset,
            eof: false,
        })
    }

    fn fill(&mut self) -> AppResult<()> {
        let want = CHUNK.max(self.buffer.len());
        let start = self.buffer.len();
        self.buffer.resize(start + want, 0);
        let read = self.file.read(&mut self.buffer[start..])?;
        self.buffer.truncate(start + read);
        if read == 0 {
            self.eof = true;
        }
        Ok(())
    }

    fn corrupt(&self, reason: impl Into<String>) -> DaqError {
        DaqError::CorruptRecord {
            offset: self.offset,
            reason: reason.into(),
        }
    }
}

impl FileReader for NativeReader {
    fn next_event(&mut self) -> AppResult<Option<Event>> {
        loop {
            if self.buffer.len() >= 8 {
                let version = u32::from_le_bytes([
                    self.buffer[4],
                    self.buffer[5],
                    self.buffer[6],
                    self.buffer[7],
                ]);
                if version != EVENT_VERSION {
                    return Err(self.corrupt(format!("unknown event version {version}")));
                }
            }
            if !self.buffer.is_empty() {
                let mut de = Deserializer::new(&self.buffer);
                match de.read::<Event>() {
                    Ok(event) => {
                        let used = de.position();
                        self.buffer.drain(..used);
                        self.offset += used as u64;
                        return Ok(Some(event));
                    }
                    Err(DaqError::TruncatedInput { .. }) if !self.eof => {}
                    Err(e) => {
                        return Err(self.corrupt(format!("{} in {}", e, self.path.display())))
                    }
                }
            } else if self.eof {
                return Ok(None);
            }
            self.fill()?;
        }
    }

    fn position(&self) -> u64 {
        self.offset
    }
}

/// Writer for native files.
pub struct NativeWriter {
    path: PathBuf,
    out: BufWriter<File>,
    events: u64,
    bytes: u64,
}

impl NativeWriter {
    /// Create or truncate `path`, creating missing parent directories.
    pub fn create(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let out = BufWriter::new(File::create(path)?);
        info!(path = %path.display(), "native writer opened");
        Ok(Self {
            path: path.to_path_buf(),
            out,
            events: 0,
            bytes: 0,
        })
    }
}

impl FileWriter for NativeWriter {
    fn write(&mut self, event: &Event) -> AppResult<()> {
        let bytes = event.to_bytes();
        self.out.write_all(&bytes)?;
        self.events += 1;
        self.bytes += bytes.len() as u64;
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
        info!(path = %self.path.display(), events = self.events, bytes = self.bytes, "native writer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(n: u32) -> Event {
        let mut event = Event::new("CMSPixelDUT");
        event.set_event_number(n);
        event.add_block_u16(0, &[n as u16; 40]);
        event
    }

    #[test]
    fn test_reads_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run000001.raw");
        let mut writer = NativeWriter::create(&path).unwrap();
        for n in 0..10 {
            writer.write(&event(n)).unwrap();
        }
        writer.close().unwrap();
        assert_eq!(writer.events_written(), 10);

        let mut reader = NativeReader::open(&path).unwrap();
        let mut numbers = Vec::new();
        while let Some(event) = reader.next_event().unwrap() {
            numbers.push(event.event_number());
        }
        assert_eq!(numbers, (0..10).collect::<Vec<_>>());
        assert_eq!(reader.position(), std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_records_larger_than_one_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.raw");
        let mut big = Event::new("DRS4RawDataEvent");
        big.add_block(0, vec![0xAB; CHUNK * 3 + 17]);
        let mut writer = NativeWriter::create(&path).unwrap();
        writer.write(&big).unwrap();
        writer.write(&event(1)).unwrap();
        writer.close().unwrap();

        let mut reader = NativeReader::open(&path).unwrap();
        assert_eq!(reader.next_event().unwrap().unwrap(), big);
        assert_eq!(reader.next_event().unwrap().unwrap().event_number(), 1);
        assert!(reader.next_event().unwrap().is_none());
    }

    #[test]
    fn test_truncated_tail_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.raw");
        let first = event(0).to_bytes();
        let second = event(1).to_bytes();
        let mut bytes = first.clone();
        bytes.extend_from_slice(&second[..second.len() - 5]);
        std::fs::write(&path, bytes).unwrap();

        let mut reader = NativeReader::open(&path).unwrap();
        assert!(reader.next_event().unwrap().is_some());
        match reader.next_event() {
            Err(DaqError::CorruptRecord { offset, .. }) => assert_eq!(offset, first.len() as u64),
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }
}
