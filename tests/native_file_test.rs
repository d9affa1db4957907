//! Integration tests for the native raw file format.

use rust_eudaq::event::Event;
use rust_eudaq::file::{FileReader, FileWriter, NativeReader, NativeWriter};
use rust_eudaq::registry::Registry;
use rust_eudaq::DaqError;
use std::path::Path;

fn write_run(path: &Path, count: u32) {
    let mut writer = NativeWriter::create(path).unwrap();
    let mut bore = Event::new("DRS4RawDataEvent");
    bore.set_bore();
    bore.set_tag("WaveDepth", "8");
    writer.write(&bore).unwrap();
    for n in 1..=count {
        let mut event = Event::new("DRS4RawDataEvent");
        event.set_event_number(n);
        event.add_block_u16(3, &[n as u16; 8]);
        writer.write(&event).unwrap();
    }
    writer.close().unwrap();
}

#[test]
fn test_resume_from_reported_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run000001.raw");
    write_run(&path, 6);

    let mut reader = NativeReader::open(&path).unwrap();
    for _ in 0..3 {
        reader.next_event().unwrap().unwrap();
    }
    let offset = reader.position();

    let mut resumed = NativeReader::open_at(&path, offset).unwrap();
    let numbers: Vec<u32> = std::iter::from_fn(|| resumed.next_event().unwrap())
        .map(|event| event.event_number())
        .collect();
    assert_eq!(numbers, vec![3, 4, 5, 6]);
}

#[test]
fn test_resume_off_boundary_is_corrupt() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run000002.raw");
    write_run(&path, 2);

    let mut reader = NativeReader::open_at(&path, 5).unwrap();
    match reader.next_event() {
        Err(DaqError::CorruptRecord { offset, .. }) => assert_eq!(offset, 5),
        other => panic!("expected CorruptRecord, got {other:?}"),
    }
}

#[test]
fn test_damaged_record_is_reported_with_its_offset() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run000003.raw");
    write_run(&path, 3);

    let mut reader = NativeReader::open(&path).unwrap();
    reader.next_event().unwrap().unwrap();
    let second = reader.position();

    let mut bytes = std::fs::read(&path).unwrap();
    // Version field of the second record
    bytes[second as usize + 4] = 0x7F;
    std::fs::write(&path, bytes).unwrap();

    let mut reader = NativeReader::open(&path).unwrap();
    assert!(reader.next_event().unwrap().is_some());
    let err = reader.next_event().unwrap_err();
    assert!(matches!(err, DaqError::CorruptRecord { offset, .. } if offset == second));
}

#[test]
fn test_registry_selects_native_for_raw_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run000004.raw");
    let registry = Registry::builtin();
    let format = rust_eudaq::file::format_for_path(&path);
    let mut writer = registry.create_writer(&format, &path).unwrap();
    writer.write(&Event::new("CMSPixelREF")).unwrap();
    writer.close().unwrap();

    let mut reader = registry.create_reader(&format, &path).unwrap();
    assert!(reader.next_event().unwrap().is_some());
    assert!(reader.next_event().unwrap().is_none());
}
