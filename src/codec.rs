//! Binary serialization codec.
//!
//! A single-pass, order-dependent cursor pair. Whatever a [`Serializer`] writes must be
//! read back by a [`Deserializer`] in exactly the same field order; there is no schema on
//! the wire beyond what the encoded types themselves carry.
//!
//! Encoding rules (all little-endian):
//!
//! | Type | Wire form |
//! |------|-----------|
//! | fixed-width integers | `to_le_bytes` |
//! | `bool` | one byte, `0` or `1` |
//! | `f32` / `f64` | IEEE-754 bit pattern as `u32` / `u64` |
//! | `String` | `u32` byte length, then UTF-8 bytes |
//! | `Vec<T>` | `u32` element count, then each element |
//! | `BTreeMap<K, V>` | `u32` entry count, then key/value pairs in key order |
//!
//! Reading past the end of the input yields [`DaqError::TruncatedInput`] and leaves the
//! caller free to retry once more bytes arrived.

use crate::error::{AppResult, DaqError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;

/// Appends binary representations to an output buffer.
#[derive(Debug, Default)]
pub struct Serializer {
    buf: BytesMut,
}

impl Serializer {
    /// Create an empty serializer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a serializer with preallocated space.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append `value`.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Append a length-prefixed byte buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_len(bytes.len());
        self.buf.put_slice(bytes);
    }

    /// Append bytes verbatim, without a length prefix.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    fn write_len(&mut self, len: usize) {
        // Lengths beyond u32 cannot be represented on the wire.
        self.buf.put_u32_le(u32::try_from(len).unwrap_or(u32::MAX));
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish and return the encoded bytes.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }

    /// Finish and return the encoded bytes as a vector.
    pub fn into_vec(self) -> Vec<u8> {
        self.buf.to_vec()
    }
}

/// Consumes binary representations from an input slice.
#[derive(Debug, Clone)]
pub struct Deserializer<'a> {
    input: &'a [u8],
    consumed: usize,
}

impl<'a> Deserializer<'a> {
    /// Create a cursor at the start of `input`.
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, consumed: 0 }
    }

    /// Read the next value of type `T`.
    pub fn read<T: Decode>(&mut self) -> AppResult<T> {
        T::decode(self)
    }

    /// Read a length-prefixed byte buffer.
    pub fn read_bytes(&mut self) -> AppResult<Vec<u8>> {
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }

    /// Consume exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> AppResult<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.input.split_at(len);
        self.input = tail;
        self.consumed += len;
        Ok(head)
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    /// True once the whole input was consumed.
    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Offset of the cursor from the start of the input.
    pub fn position(&self) -> usize {
        self.consumed
    }

    fn ensure(&self, needed: usize) -> AppResult<()> {
        if self.input.len() < needed {
            return Err(DaqError::TruncatedInput {
                needed,
                available: self.input.len(),
            });
        }
        Ok(())
    }

    fn read_len(&mut self) -> AppResult<usize> {
        Ok(self.read::<u32>()? as usize)
    }

    /// Read a sequence count and reject counts that cannot fit in the rest of the input.
    fn read_count(&mut self, min_element_size: usize) -> AppResult<usize> {
        let count = self.read_len()?;
        let needed = count.saturating_mul(min_element_size.max(1));
        self.ensure(needed)?;
        Ok(count)
    }

    fn advance(&mut self, len: usize) {
        Buf::advance(&mut self.input, len);
        self.consumed += len;
    }
}

/// Types with a binary wire representation.
pub trait Encode {
    /// Append the representation of `self`.
    fn encode(&self, ser: &mut Serializer);
}

/// Types that can be read back from their wire representation.
pub trait Decode: Sized {
    /// Consume one value from the cursor.
    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self>;

    /// Smallest number of bytes one encoded value occupies.
    const MIN_SIZE: usize = 1;
}

macro_rules! impl_int {
    ($($ty:ty => $put:ident, $get:ident);* $(;)?) => {
        $(
            impl Encode for $ty {
                fn encode(&self, ser: &mut Serializer) {
                    ser.buf.$put(*self);
                }
            }

            impl Decode for $ty {
                const MIN_SIZE: usize = std::mem::size_of::<$ty>();

                fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
                    let size = std::mem::size_of::<$ty>();
                    de.ensure(size)?;
                    let mut head = &de.input[..size];
                    let value = head.$get();
                    de.advance(size);
                    Ok(value)
                }
            }
        )*
    };
}

impl_int! {
    u8 => put_u8, get_u8;
    i8 => put_i8, get_i8;
    u16 => put_u16_le, get_u16_le;
    i16 => put_i16_le, get_i16_le;
    u32 => put_u32_le, get_u32_le;
    i32 => put_i32_le, get_i32_le;
    u64 => put_u64_le, get_u64_le;
    i64 => put_i64_le, get_i64_le;
}

impl Encode for bool {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&u8::from(*self));
    }
}

impl Decode for bool {
    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        let offset = de.position();
        match de.read::<u8>()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DaqError::CorruptRecord {
                offset: offset as u64,
                reason: format!("invalid boolean byte {other}"),
            }),
        }
    }
}

impl Encode for f32 {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.to_bits());
    }
}

impl Decode for f32 {
    const MIN_SIZE: usize = 4;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Ok(f32::from_bits(de.read()?))
    }
}

impl Encode for f64 {
    fn encode(&self, ser: &mut Serializer) {
        ser.write(&self.to_bits());
    }
}

impl Decode for f64 {
    const MIN_SIZE: usize = 8;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        Ok(f64::from_bits(de.read()?))
    }
}

impl Encode for str {
    fn encode(&self, ser: &mut Serializer) {
        ser.write_bytes(self.as_bytes());
    }
}

impl Encode for String {
    fn encode(&self, ser: &mut Serializer) {
        self.as_str().encode(ser);
    }
}

impl Decode for String {
    const MIN_SIZE: usize = 4;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        let offset = de.position();
        let bytes = de.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| DaqError::CorruptRecord {
            offset: offset as u64,
            reason: format!("string is not UTF-8: {e}"),
        })
    }
}

impl<T: Encode> Encode for [T] {
    fn encode(&self, ser: &mut Serializer) {
        ser.write_len(self.len());
        for item in self {
            item.encode(ser);
        }
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(&self, ser: &mut Serializer) {
        self.as_slice().encode(ser);
    }
}

impl<T: Decode> Decode for Vec<T> {
    const MIN_SIZE: usize = 4;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        let count = de.read_count(T::MIN_SIZE)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(de.read()?);
        }
        Ok(items)
    }
}

impl<K: Encode, V: Encode> Encode for BTreeMap<K, V> {
    fn encode(&self, ser: &mut Serializer) {
        ser.write_len(self.len());
        for (key, value) in self {
            key.encode(ser);
            value.encode(ser);
        }
    }
}

impl<K: Decode + Ord, V: Decode> Decode for BTreeMap<K, V> {
    const MIN_SIZE: usize = 4;

    fn decode(de: &mut Deserializer<'_>) -> AppResult<Self> {
        let count = de.read_count(K::MIN_SIZE + V::MIN_SIZE)?;
        let mut map = BTreeMap::new();
        for _ in 0..count {
            let key = de.read()?;
            let value = de.read()?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Reinterpret little-endian bytes as `u16` words; a trailing odd byte is ignored.
pub fn le_u16_words(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Reinterpret little-endian bytes as `f32` values; trailing bytes are ignored.
pub fn le_f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|quad| f32::from_le_bytes([quad[0], quad[1], quad[2], quad[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integers_are_little_endian() {
        let mut ser = Serializer::new();
        ser.write(&0x0102_0304u32);
        ser.write(&0xABCDu16);
        assert_eq!(ser.into_vec(), vec![0x04, 0x03, 0x02, 0x01, 0xCD, 0xAB]);
    }

    #[test]
    fn test_mixed_fields_read_back_in_order() {
        let mut ser = Serializer::new();
        ser.write(&-7i32);
        ser.write("plane");
        ser.write(&vec![1u16, 2, 3]);
        ser.write(&1.5f32);
        ser.write(&true);
        let bytes = ser.into_vec();

        let mut de = Deserializer::new(&bytes);
        assert_eq!(de.read::<i32>().unwrap(), -7);
        assert_eq!(de.read::<String>().unwrap(), "plane");
        assert_eq!(de.read::<Vec<u16>>().unwrap(), vec![1, 2, 3]);
        assert_eq!(de.read::<f32>().unwrap(), 1.5);
        assert!(de.read::<bool>().unwrap());
        assert!(de.is_empty());
    }

    #[test]
    fn test_float_bit_patterns_survive() {
        let mut ser = Serializer::new();
        ser.write(&f64::NEG_INFINITY);
        ser.write(&f32::from_bits(0x7fc0_0001));
        let bytes = ser.into_vec();

        let mut de = Deserializer::new(&bytes);
        assert_eq!(de.read::<f64>().unwrap(), f64::NEG_INFINITY);
        assert_eq!(de.read::<f32>().unwrap().to_bits(), 0x7fc0_0001);
    }

    #[test]
    fn test_short_input_is_truncated_not_panic() {
        let mut de = Deserializer::new(&[1, 2]);
        match de.read::<u32>() {
            Err(DaqError::TruncatedInput { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 2);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        // A failed read does not consume anything.
        assert_eq!(de.remaining(), 2);
    }

    #[test]
    fn test_oversized_sequence_count_is_rejected_early() {
        let mut ser = Serializer::new();
        ser.write(&u32::MAX);
        let bytes = ser.into_vec();
        let mut de = Deserializer::new(&bytes);
        assert!(matches!(
            de.read::<Vec<u64>>(),
            Err(DaqError::TruncatedInput { .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let mut ser = Serializer::new();
        ser.write_bytes(&[0xff, 0xfe]);
        let bytes = ser.into_vec();
        let mut de = Deserializer::new(&bytes);
        assert!(matches!(
            de.read::<String>(),
            Err(DaqError::CorruptRecord { offset: 0, .. })
        ));
    }

    #[test]
    fn test_map_is_written_in_key_order() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), "2".to_string());
        map.insert("a".to_string(), "1".to_string());
        let mut ser = Serializer::new();
        ser.write(&map);
        let bytes = ser.into_vec();

        let mut de = Deserializer::new(&bytes);
        assert_eq!(de.read::<u32>().unwrap(), 2);
        assert_eq!(de.read::<String>().unwrap(), "a");
    }

    #[test]
    fn test_word_helpers() {
        assert_eq!(le_u16_words(&[0x01, 0xA0, 0x02]), vec![0xA001]);
        assert_eq!(le_f32_values(&2.0f32.to_le_bytes()), vec![2.0]);
    }
}
