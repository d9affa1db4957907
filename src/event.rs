//! Raw event model.
//!
//! An [`Event`] is the unit of data interchange between producers, collectors and
//! converters: a typed header, a tag map, a list of opaque numbered blocks and an ordered
//! list of owned sub-events.
//!
//! # Wire layout
//!
//! ```text
//! type · version · flags · stream · run · event · trigger · extend   (u32 each)
//! time begin · time end                                              (u64, picoseconds)
//! description                                                        (string)
//! tags                                                               (map string → string)
//! blocks                                                             (count, then id + bytes)
//! sub-events                                                         (count, then events)
//! ```

use crate::codec::{le_f32_values, le_u16_words, Decode, Deserializer, Encode, Serializer};
use crate::error::{AppResult, DaqError};
use crate::registry::str2hash;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Layout version written into every event header.
pub const EVENT_VERSION: u32 = 2;

/// Event flag word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventFlags(u32);

impl EventFlags {
    /// Begin-of-run event.
    pub const BORE: EventFlags = EventFlags(0x1);
    /// End-of-run event.
    pub const EORE: EventFlags = EventFlags(0x2);
    /// Marker event without physics payload.
    pub const MARKER: EventFlags = EventFlags(0x4);
    /// The begin/end timestamps are valid.
    pub const TIMESTAMP: EventFlags = EventFlags(0x10);
    /// The trigger number is valid.
    pub const TRIGGER: EventFlags = EventFlags(0x20);

    /// Raw flag bits.
    pub fn bits(self) -> u32 {
        self.0
    }

    /// Build from raw bits, keeping unknown bits.
    pub fn from_bits(bits: u32) -> Self {
        EventFlags(bits)
    }

    /// True if every bit of `other` is set.
    pub fn contains(self, other: EventFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Set the bits of `other`.
    pub fn insert(&mut self, other: EventFlags) {
        self.0 |= other.0;
    }

    /// Clear the bits of `other`.
    pub fn remove(&mut self, other: EventFlags) {
        self.0 &= !other.0;
    }
}

/// A numbered opaque payload buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block id, unique within one event.
    pub id: u32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

/// A raw event as emitted by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    type_id: u32,
    version: u32,
    flags: EventFlags,
    stream_n: u32,
    run_n: u32,
    event_n: u32,
    trigger_n: u32,
    extend: u32,
    ts_begin: u64,
    ts_end: u64,
    description: String,
    tags: BTreeMap<String, String>,
    blocks: Vec<Block>,
    sub_events: Vec<Event>,
}

impl Event {
    /// Create an empty event whose type tag is the hash of `type_name`.
    ///
    /// The type name is kept as the description, which consumers use to recognise
    /// sub-events.
    pub fn new(type_name: &str) -> Self {
        let mut event = Self::with_type_id(str2hash(type_name));
        event.description = type_name.to_string();
        event
    }

    /// Create an empty event with an explicit type tag.
    pub fn with_type_id(type_id: u32) -> Self {
        Self {
            type_id,
            version: EVENT_VERSION,
            flags: EventFlags::default(),
            stream_n: 0,
            run_n: 0,
            event_n: 0,
            trigger_n: 0,
            extend: 0,
            ts_begin: 0,
            ts_end: 0,
            description: String::new(),
            tags: BTreeMap::new(),
            blocks: Vec::new(),
            sub_events: Vec::new(),
        }
    }

    /// Type tag (hash of the type name).
    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    /// Header layout version.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Flag word.
    pub fn flags(&self) -> EventFlags {
        self.flags
    }

    /// Set the given flag bits.
    pub fn set_flag(&mut self, flag: EventFlags) {
        self.flags.insert(flag);
    }

    /// Clear the given flag bits.
    pub fn clear_flag(&mut self, flag: EventFlags) {
        self.flags.remove(flag);
    }

    /// True for the begin-of-run event.
    pub fn is_bore(&self) -> bool {
        self.flags.contains(EventFlags::BORE)
    }

    /// True for the end-of-run event.
    pub fn is_eore(&self) -> bool {
        self.flags.contains(EventFlags::EORE)
    }

    /// True for marker events.
    pub fn is_marker(&self) -> bool {
        self.flags.contains(EventFlags::MARKER)
    }

    /// Mark as begin-of-run event.
    pub fn set_bore(&mut self) {
        self.flags.insert(EventFlags::BORE);
    }

    /// Mark as end-of-run event.
    pub fn set_eore(&mut self) {
        self.flags.insert(EventFlags::EORE);
    }

    /// Stream number of the producer instance that emitted the event.
    pub fn stream_number(&self) -> u32 {
        self.stream_n
    }

    /// Set the stream number.
    pub fn set_stream_number(&mut self, stream: u32) {
        self.stream_n = stream;
    }

    /// Run number.
    pub fn run_number(&self) -> u32 {
        self.run_n
    }

    /// Set the run number.
    pub fn set_run_number(&mut self, run: u32) {
        self.run_n = run;
    }

    /// Per-run event number.
    pub fn event_number(&self) -> u32 {
        self.event_n
    }

    /// Set the event number.
    pub fn set_event_number(&mut self, event: u32) {
        self.event_n = event;
    }

    /// Hardware trigger number, valid if the `TRIGGER` flag is set.
    pub fn trigger_number(&self) -> u32 {
        self.trigger_n
    }

    /// Set the trigger number and its flag.
    pub fn set_trigger_number(&mut self, trigger: u32) {
        self.trigger_n = trigger;
        self.flags.insert(EventFlags::TRIGGER);
    }

    /// Free extension word.
    pub fn extend_word(&self) -> u32 {
        self.extend
    }

    /// Set the extension word.
    pub fn set_extend_word(&mut self, extend: u32) {
        self.extend = extend;
    }

    /// Begin timestamp in picoseconds, 0 when unset.
    pub fn timestamp_begin(&self) -> u64 {
        self.ts_begin
    }

    /// End timestamp in picoseconds, 0 when unset.
    pub fn timestamp_end(&self) -> u64 {
        self.ts_end
    }

    /// Set both timestamps (picoseconds) and the timestamp flag.
    pub fn set_timestamp(&mut self, begin: u64, end: u64) {
        self.ts_begin = begin;
        self.ts_end = end;
        self.flags.insert(EventFlags::TIMESTAMP);
    }

    /// Human-readable description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Set the description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
    }

    // --- tags -----------------------------------------------------------

    /// Set a tag; a later call with the same key replaces the value.
    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(key.into(), value.into());
    }

    /// Set a tag from any displayable value.
    pub fn set_tag_value<T: fmt::Display>(&mut self, key: impl Into<String>, value: T) {
        self.tags.insert(key.into(), value.to_string());
    }

    /// Tag value, or `default` when the key is missing.
    pub fn get_tag<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.tags.get(key).map(String::as_str).unwrap_or(default)
    }

    /// Tag parsed as `T`, or `default` when missing or unparsable.
    pub fn get_tag_as<T: FromStr>(&self, key: &str, default: T) -> T {
        self.tags
            .get(key)
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(default)
    }

    /// True if the tag is present.
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// All tags.
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    // --- blocks ---------------------------------------------------------

    /// Add a block, replacing the payload in place if the id already exists.
    pub fn add_block(&mut self, id: u32, data: impl Into<Vec<u8>>) {
        let data = data.into();
        match self.blocks.iter_mut().find(|block| block.id == id) {
            Some(existing) => existing.data = data,
            None => self.blocks.push(Block { id, data }),
        }
    }

    /// Add a block of `u16` words in little-endian order.
    pub fn add_block_u16(&mut self, id: u32, words: &[u16]) {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        self.add_block(id, bytes);
    }

    /// Add a block of `f32` values in little-endian order.
    pub fn add_block_f32(&mut self, id: u32, values: &[f32]) {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.add_block(id, bytes);
    }

    /// Payload of the block with this id.
    pub fn get_block(&self, id: u32) -> AppResult<&[u8]> {
        self.blocks
            .iter()
            .find(|block| block.id == id)
            .map(|block| block.data.as_slice())
            .ok_or(DaqError::NoSuchBlock { id })
    }

    /// Block payload reinterpreted as little-endian `u16` words.
    pub fn get_block_u16(&self, id: u32) -> AppResult<Vec<u16>> {
        Ok(le_u16_words(self.get_block(id)?))
    }

    /// Block payload reinterpreted as little-endian `f32` values.
    pub fn get_block_f32(&self, id: u32) -> AppResult<Vec<f32>> {
        Ok(le_f32_values(self.get_block(id)?))
    }

    /// Number of blocks.
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Block ids in insertion order.
    pub fn block_ids(&self) -> Vec<u32> {
        self.blocks.iter().map(|block| block.id).collect()
    }

    /// Blocks in insertion order.
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    // --- sub-events -----------------------------------------------------

    /// Move `event` into this event as the last sub-event.
    pub fn add_sub_event(&mut self, event: Event) {
        self.sub_events.push(event);
    }

    /// Sub-events in insertion order.
    pub fn sub_events(&self) -> &[Event] {
        &self.sub_events
    }

    /// Number of direct sub-events.
    pub fn num_sub_events(&self) -> usize {
        self.sub_events.len()
    }

    // --- serialization --------------------------------------------------

    /// Serialize into a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut ser = Serializer::with_capacity(self.encoded_size_hint());
        ser.write(self);
        ser.into_vec()
    }

    /// Deserialize one event that must span all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> AppResult<Self> {
        let mut de = Deserializer::new(bytes);
        let event = de.read::<Event>()?;
        if !de.is_empty() {
            return Err(DaqError::CorruptRecord {
                offset: de.position() as u64,
                reason: format!("{} trailing bytes after event", de.remaining()),
            });
        }
        Ok(event)
    }

    fn encoded_size_hint(&self) -> usize {
        let blocks: usize = self.blocks.iter().map(|b| b.data.len() + 8).sum();
        let tags: usize = self.tags.iter().map(|(k, v)| k.len() + v.len() + 8).sum();
        let subs: usize = self.sub_events.iter().map(Event::encoded_size_hint).sum();
        64 + self.description.len() + blocks + tags + subs
    }
}

impl Encode for Event {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.type_id);
        ser.write(&self.version);
        ser.write(&self.flags.bits());
        ser.write(&self.stream_n);
        ser.write(&self.run_n);
        ser.write(&self.event_n);
        ser.write(&self.trigger_n);
        ser.write(&self.extend);
        ser.write(&self.ts_begin);
        ser.write(&self.ts_end);
        ser.write(&self.description);
        ser.write(&self.tags);
        ser.write(&(self.blocks.len() as u32));
        for block in &self.blocks {
            ser.write(&block.id);
            ser.write_bytes(&block.data);
        }
        ser.write(&(self.sub_events.len() as u32));
        for sub in &self.sub_events {
            ser.write(sub);
        }
    }
}

/// Deepest sub-event nesting accepted when decoding.
pub const MAX_NESTING: usize = 64;

impl Decode for Event {
    const MIN_SIZE: usize = 64;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Event::decode_nested(de, 0)
    }
}

impl Event {
    fn decode_nested(de: &mut Deserializer<'_>, depth: usize) -> AppResult<Self> {
        if depth > MAX_NESTING {
            return Err(DaqError::CorruptRecord {
                offset: de.position() as u64,
                reason: format!("sub-events nested deeper than {MAX_NESTING}"),
            });
        }
        let mut event = Event::with_type_id(de.read()?);
        event.version = de.read()?;
        event.flags = EventFlags::from_bits(de.read()?);
        event.stream_n = de.read()?;
        event.run_n = de.read()?;
        event.event_n = de.read()?;
        event.trigger_n = de.read()?;
        event.extend = de.read()?;
        event.ts_begin = de.read()?;
        event.ts_end = de.read()?;
        event.description = de.read()?;
        event.tags = de.read()?;

        let n_blocks: u32 = de.read()?;
        for _ in 0..n_blocks {
            let id: u32 = de.read()?;
            let data = de.read_bytes()?;
            event.add_block(id, data);
        }

        let n_sub: u32 = de.read()?;
        for _ in 0..n_sub {
            event.sub_events.push(Event::decode_nested(de, depth + 1)?);
        }
        Ok(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.print(f, 0)
    }
}

impl Event {
    fn print(&self, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
        let pad = " ".repeat(indent);
        let mut kind = Vec::new();
        if self.is_bore() {
            kind.push("BORE");
        }
        if self.is_eore() {
            kind.push("EORE");
        }
        writeln!(
            f,
            "{pad}<Event type=\"{}\" id={:#010x} run={} event={} stream={} flags=[{}]>",
            self.description,
            self.type_id,
            self.run_n,
            self.event_n,
            self.stream_n,
            kind.join(",")
        )?;
        for (key, value) in &self.tags {
            writeln!(f, "{pad}  tag {key} = {value}")?;
        }
        for block in &self.blocks {
            writeln!(f, "{pad}  block {} ({} bytes)", block.id, block.data.len())?;
        }
        for sub in &self.sub_events {
            sub.print(f, indent + 2)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        let mut event = Event::new("CMSPixelREF");
        event.set_run_number(42);
        event.set_event_number(7);
        event.set_stream_number(3);
        event.set_timestamp(1_000, 2_000);
        event.set_tag("DETECTOR", "II6-B2");
        event.add_block(0, vec![1, 2, 3]);
        event.add_block(5, vec![]);
        let mut sub = Event::new("TluRawDataEvent");
        sub.set_trigger_number(99);
        event.add_sub_event(sub);
        event
    }

    #[test]
    fn test_tag_last_write_wins_and_default() {
        let mut event = Event::new("Test");
        event.set_tag("k", "v1");
        event.set_tag("k", "v2");
        assert_eq!(event.get_tag("k", "d"), "v2");
        assert_eq!(event.get_tag("missing", "d"), "d");
    }

    #[test]
    fn test_typed_tags_fall_back_to_default() {
        let mut event = Event::new("Test");
        event.set_tag_value("PLANES", 4);
        event.set_tag("BROKEN", "four");
        assert_eq!(event.get_tag_as("PLANES", 1usize), 4);
        assert_eq!(event.get_tag_as("BROKEN", 1usize), 1);
        assert_eq!(event.get_tag_as("ABSENT", 0.5f32), 0.5);
    }

    #[test]
    fn test_block_overwrite_keeps_count_and_position() {
        let mut event = Event::new("Test");
        event.add_block(3, vec![0xA]);
        event.add_block(1, vec![0xC]);
        event.add_block(3, vec![0xB]);
        assert_eq!(event.get_block(3).unwrap(), &[0xB]);
        assert_eq!(event.num_blocks(), 2);
        assert_eq!(event.block_ids(), vec![3, 1]);
    }

    #[test]
    fn test_missing_block_is_an_error() {
        let event = Event::new("Test");
        assert!(matches!(
            event.get_block(9),
            Err(DaqError::NoSuchBlock { id: 9 })
        ));
    }

    #[test]
    fn test_typed_blocks() {
        let mut event = Event::new("Test");
        event.add_block_u16(0, &[0xA001, 0x7000]);
        event.add_block_f32(1, &[0.25, -1.0]);
        assert_eq!(event.get_block(0).unwrap(), &[0x01, 0xA0, 0x00, 0x70]);
        assert_eq!(event.get_block_u16(0).unwrap(), vec![0xA001, 0x7000]);
        assert_eq!(event.get_block_f32(1).unwrap(), vec![0.25, -1.0]);
    }

    #[test]
    fn test_round_trip_with_sub_events() {
        let event = sample();
        let decoded = Event::from_bytes(&event.to_bytes()).unwrap();
        assert_eq!(decoded, event);
        assert_eq!(decoded.sub_events()[0].description(), "TluRawDataEvent");
        assert_eq!(decoded.sub_events()[0].trigger_number(), 99);
    }

    #[test]
    fn test_header_fields_are_written_first_in_order() {
        let event = sample();
        let bytes = event.to_bytes();
        assert_eq!(&bytes[0..4], &str2hash("CMSPixelREF").to_le_bytes());
        assert_eq!(&bytes[4..8], &EVENT_VERSION.to_le_bytes());
        assert_eq!(&bytes[16..20], &42u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &7u32.to_le_bytes());
    }

    #[test]
    fn test_truncated_event_reports_truncation() {
        let bytes = sample().to_bytes();
        let err = Event::from_bytes(&bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, DaqError::TruncatedInput { .. }));
    }

    fn nested_bytes(levels: usize) -> Vec<u8> {
        let leaf = Event::new("Test").to_bytes();
        // Everything up to the sub-event count
        let header = &leaf[..leaf.len() - 4];
        let mut bytes = Vec::with_capacity(levels * leaf.len() + leaf.len());
        for _ in 0..levels {
            bytes.extend_from_slice(header);
            bytes.extend_from_slice(&1u32.to_le_bytes());
        }
        bytes.extend_from_slice(&leaf);
        bytes
    }

    #[test]
    fn test_deep_nesting_is_rejected_as_corrupt() {
        let err = Event::from_bytes(&nested_bytes(5_000)).unwrap_err();
        assert!(matches!(err, DaqError::CorruptRecord { .. }));
    }

    #[test]
    fn test_nesting_up_to_limit_decodes() {
        let event = Event::from_bytes(&nested_bytes(MAX_NESTING)).unwrap();
        let mut depth = 0;
        let mut current = &event;
        while let Some(sub) = current.sub_events().first() {
            current = sub;
            depth += 1;
        }
        assert_eq!(depth, MAX_NESTING);
        assert!(Event::from_bytes(&nested_bytes(MAX_NESTING + 1)).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_corrupt() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(matches!(
            Event::from_bytes(&bytes),
            Err(DaqError::CorruptRecord { .. })
        ));
    }

    #[test]
    fn test_flags() {
        let mut event = Event::new("Test");
        assert!(!event.is_bore());
        event.set_bore();
        assert!(event.is_bore());
        assert!(!event.is_eore());
        event.clear_flag(EventFlags::BORE);
        event.set_eore();
        assert!(event.is_eore());
        assert!(!event.is_bore());
    }

    #[test]
    fn test_display_lists_blocks_and_sub_events() {
        let text = sample().to_string();
        assert!(text.contains("CMSPixelREF"));
        assert!(text.contains("block 0 (3 bytes)"));
        assert!(text.contains("TluRawDataEvent"));
    }
}
