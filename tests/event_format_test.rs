//! Integration tests for the raw event format.

use proptest::prelude::*;
use rust_eudaq::event::{Event, EventFlags};
use rust_eudaq::registry::str2hash;
use rust_eudaq::DaqError;

fn leaf_event() -> impl Strategy<Value = Event> {
    (
        "[A-Za-z0-9]{1,16}",
        any::<u32>(),
        any::<u32>(),
        any::<u32>(),
        any::<u64>(),
        prop::collection::btree_map("[a-z_]{1,8}", ".{0,12}", 0..4),
        prop::collection::vec((0u32..8, prop::collection::vec(any::<u8>(), 0..64)), 0..4),
    )
        .prop_map(|(kind, stream, run, number, ts, tags, blocks)| {
            let mut event = Event::new(&kind);
            event.set_stream_number(stream);
            event.set_run_number(run);
            event.set_event_number(number);
            event.set_timestamp(ts, ts.saturating_add(25));
            for (key, value) in tags {
                event.set_tag(key, value);
            }
            for (id, data) in blocks {
                event.add_block(id, data);
            }
            event
        })
}

fn nested_event() -> impl Strategy<Value = Event> {
    leaf_event().prop_recursive(3, 16, 3, |inner| {
        (leaf_event(), prop::collection::vec(inner, 0..3)).prop_map(|(mut parent, subs)| {
            for sub in subs {
                parent.add_sub_event(sub);
            }
            parent
        })
    })
}

proptest! {
    #[test]
    fn test_roundtrip_preserves_every_field(event in nested_event()) {
        let bytes = event.to_bytes();
        let decoded = Event::from_bytes(&bytes).unwrap();
        prop_assert_eq!(decoded, event);
    }

    #[test]
    fn test_every_strict_prefix_is_rejected(event in leaf_event(), cut in 1usize..64) {
        let bytes = event.to_bytes();
        let keep = bytes.len().saturating_sub(cut);
        let err = Event::from_bytes(&bytes[..keep]).unwrap_err();
        prop_assert!(err.is_malformed_data());
    }
}

#[test]
fn test_tag_semantics() {
    let mut event = Event::new("DRS4RawDataEvent");
    event.set_tag("k", "v1");
    event.set_tag("k", "v2");
    assert_eq!(event.get_tag("k", "d"), "v2");
    assert_eq!(event.get_tag("missing", "d"), "d");
    assert_eq!(event.tags().len(), 1);
}

#[test]
fn test_block_overwrite_keeps_count() {
    let mut event = Event::new("CMSPixelDUT");
    event.add_block(3, vec![1, 2, 3]);
    event.add_block(7, vec![9]);
    event.add_block(3, vec![4, 5]);
    assert_eq!(event.get_block(3).unwrap(), &[4, 5]);
    assert_eq!(event.num_blocks(), 2);
    assert!(matches!(event.get_block(1), Err(DaqError::NoSuchBlock { id: 1 })));
}

#[test]
fn test_header_layout() {
    let mut event = Event::new("CMSPixelREF");
    event.set_bore();
    event.set_flag(EventFlags::TRIGGER);
    event.set_run_number(17);
    let bytes = event.to_bytes();
    assert_eq!(&bytes[0..4], &str2hash("CMSPixelREF").to_le_bytes());
    assert_eq!(&bytes[8..12], &(0x1u32 | 0x20).to_le_bytes());
    assert_eq!(&bytes[16..20], &17u32.to_le_bytes());
}

#[test]
fn test_trailing_bytes_are_corrupt() {
    let mut bytes = Event::new("CMSPixelTRP").to_bytes();
    bytes.push(0);
    assert!(matches!(
        Event::from_bytes(&bytes),
        Err(DaqError::CorruptRecord { .. })
    ));
}
