//! Block codec: per-type value encodings plus the sealed block layout.
//!
//! A block holds one sorted run of `(timestamp, value)` pairs of a single
//! value type:
//!
//! ```text
//! [type: u8][count: uvarint][ts_len: uvarint][timestamps][values]
//! ```
//!
//! Timestamps and floats use the Gorilla encoders from [`super::gorilla`].
//! Integers are zigzag deltas in LEB128 varints, booleans are run-length
//! encoded, and strings are dictionary encoded.

use super::gorilla::{decode_floats, decode_timestamps, encode_floats, encode_timestamps};
use super::{Timestamp, Value, ValueType};
use crate::error::{BurrowError, Result};
use std::collections::HashMap;

// ============================================================================
// Primitive helpers
// ============================================================================

#[inline]
pub(crate) fn zigzag(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

#[inline]
pub(crate) fn unzigzag(v: u64) -> i64 {
    ((v >> 1) as i64) ^ -((v & 1) as i64)
}

pub(crate) fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

pub(crate) fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_uvarint(buf, s.len() as u64);
    buf.extend_from_slice(s.as_bytes());
}

/// Bounds-checked little-endian cursor over a byte slice.
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(BurrowError::Decode(format!(
                "need {n} bytes at offset {}, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(arr))
    }

    pub(crate) fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub(crate) fn read_uvarint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.read_u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(BurrowError::Decode("varint overflows u64".into()))
    }

    pub(crate) fn read_len(&mut self) -> Result<usize> {
        let len = self.read_uvarint()? as usize;
        if len > self.remaining() {
            return Err(BurrowError::Decode(format!(
                "length {len} exceeds remaining {}",
                self.remaining()
            )));
        }
        Ok(len)
    }

    pub(crate) fn read_str(&mut self) -> Result<String> {
        let len = self.read_len()?;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| BurrowError::Decode(format!("invalid utf-8: {e}")))
    }
}

// ============================================================================
// Single value encoding (used by WAL payloads)
// ============================================================================

/// Appends one tagged value.
pub(crate) fn put_value(buf: &mut Vec<u8>, value: &Value) {
    buf.push(value.value_type() as u8);
    match value {
        Value::Integer(v) => put_uvarint(buf, zigzag(*v)),
        Value::Float(v) => buf.extend_from_slice(&v.to_bits().to_le_bytes()),
        Value::Boolean(v) => buf.push(u8::from(*v)),
        Value::String(v) => put_str(buf, v),
    }
}

/// Reads one tagged value written by [`put_value`].
pub(crate) fn get_value(reader: &mut ByteReader<'_>) -> Result<Value> {
    let tag = reader.read_u8()?;
    let ty = ValueType::from_u8(tag)
        .ok_or_else(|| BurrowError::Decode(format!("unknown value tag {tag}")))?;
    Ok(match ty {
        ValueType::Integer => Value::Integer(unzigzag(reader.read_uvarint()?)),
        ValueType::Float => Value::Float(f64::from_bits(reader.read_u64()?)),
        ValueType::Boolean => Value::Boolean(reader.read_u8()? != 0),
        ValueType::String => Value::String(reader.read_str()?),
    })
}

// ============================================================================
// Column codecs
// ============================================================================

fn encode_integers(values: &[i64], buf: &mut Vec<u8>) {
    let mut prev = 0i64;
    for &v in values {
        put_uvarint(buf, zigzag(v.wrapping_sub(prev)));
        prev = v;
    }
}

fn decode_integers(reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<i64>> {
    let mut out = Vec::with_capacity(count);
    let mut prev = 0i64;
    for _ in 0..count {
        prev = prev.wrapping_add(unzigzag(reader.read_uvarint()?));
        out.push(prev);
    }
    Ok(out)
}

fn encode_booleans(values: &[bool], buf: &mut Vec<u8>) {
    let mut iter = values.iter().copied().peekable();
    while let Some(v) = iter.next() {
        let mut run = 1u64;
        while iter.next_if_eq(&v).is_some() {
            run += 1;
        }
        buf.push(u8::from(v));
        put_uvarint(buf, run);
    }
}

fn decode_booleans(reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<bool>> {
    let mut out = Vec::with_capacity(count);
    while out.len() < count {
        let v = reader.read_u8()? != 0;
        let run = reader.read_uvarint()? as usize;
        if run == 0 || out.len() + run > count {
            return Err(BurrowError::Decode(format!(
                "boolean run of {run} overflows count {count}"
            )));
        }
        out.extend(std::iter::repeat(v).take(run));
    }
    Ok(out)
}

fn encode_strings(values: &[&str], buf: &mut Vec<u8>) {
    let mut dict: Vec<&str> = Vec::new();
    let mut lookup: HashMap<&str, u64> = HashMap::new();
    let mut indices = Vec::with_capacity(values.len());
    for &s in values {
        let idx = *lookup.entry(s).or_insert_with(|| {
            dict.push(s);
            (dict.len() - 1) as u64
        });
        indices.push(idx);
    }
    put_uvarint(buf, dict.len() as u64);
    for s in &dict {
        put_str(buf, s);
    }
    for idx in indices {
        put_uvarint(buf, idx);
    }
}

fn decode_strings(reader: &mut ByteReader<'_>, count: usize) -> Result<Vec<String>> {
    let dict_len = reader.read_len()?;
    let mut dict = Vec::with_capacity(dict_len);
    for _ in 0..dict_len {
        dict.push(reader.read_str()?);
    }
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let idx = reader.read_uvarint()? as usize;
        let s = dict.get(idx).ok_or_else(|| {
            BurrowError::Decode(format!("dictionary index {idx} out of {dict_len}"))
        })?;
        out.push(s.clone());
    }
    Ok(out)
}

// ============================================================================
// Blocks
// ============================================================================

/// Encodes a sorted run of points of one type into a sealed block.
///
/// # Errors
///
/// Returns a validation error if any value does not have `value_type`.
pub fn encode_block(points: &[(Timestamp, Value)], value_type: ValueType) -> Result<Vec<u8>> {
    if let Some((ts, v)) = points.iter().find(|(_, v)| v.value_type() != value_type) {
        return Err(BurrowError::Validation(format!(
            "point at {ts} is {} in a {value_type} block",
            v.value_type()
        )));
    }

    let timestamps: Vec<i64> = points.iter().map(|(ts, _)| *ts).collect();
    let ts_bytes = encode_timestamps(&timestamps);

    let mut buf = Vec::with_capacity(ts_bytes.len() + points.len() * 2 + 16);
    buf.push(value_type as u8);
    put_uvarint(&mut buf, points.len() as u64);
    put_uvarint(&mut buf, ts_bytes.len() as u64);
    buf.extend_from_slice(&ts_bytes);

    match value_type {
        ValueType::Float => {
            let values: Vec<f64> = points
                .iter()
                .filter_map(|(_, v)| match v {
                    Value::Float(f) => Some(*f),
                    _ => None,
                })
                .collect();
            buf.extend_from_slice(&encode_floats(&values));
        }
        ValueType::Integer => {
            let values: Vec<i64> = points
                .iter()
                .filter_map(|(_, v)| match v {
                    Value::Integer(i) => Some(*i),
                    _ => None,
                })
                .collect();
            encode_integers(&values, &mut buf);
        }
        ValueType::Boolean => {
            let values: Vec<bool> = points
                .iter()
                .filter_map(|(_, v)| match v {
                    Value::Boolean(b) => Some(*b),
                    _ => None,
                })
                .collect();
            encode_booleans(&values, &mut buf);
        }
        ValueType::String => {
            let values: Vec<&str> = points
                .iter()
                .filter_map(|(_, v)| match v {
                    Value::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .collect();
            encode_strings(&values, &mut buf);
        }
    }
    Ok(buf)
}

/// Reads the type tag stored in a block header.
pub fn block_type(bytes: &[u8]) -> Result<ValueType> {
    let tag = *bytes
        .first()
        .ok_or_else(|| BurrowError::Decode("empty block".into()))?;
    ValueType::from_u8(tag).ok_or_else(|| BurrowError::Decode(format!("unknown block tag {tag}")))
}

/// Decodes a sealed block, requiring its stored type to be `expected`.
///
/// # Errors
///
/// Returns [`BurrowError::TypeMismatch`] if the block holds another type, and
/// [`BurrowError::Decode`] if the block is truncated or has trailing bytes.
pub fn decode_block(bytes: &[u8], expected: ValueType) -> Result<Vec<(Timestamp, Value)>> {
    let mut reader = ByteReader::new(bytes);
    let tag = reader.read_u8()?;
    if tag != expected as u8 {
        return Err(BurrowError::TypeMismatch {
            expected,
            actual: tag,
        });
    }
    let count = reader.read_uvarint()? as usize;
    let ts_len = reader.read_len()?;
    let timestamps = decode_timestamps(reader.read_bytes(ts_len)?, count)?;

    let values: Vec<Value> = match expected {
        ValueType::Float => {
            let rest = reader.read_bytes(reader.remaining())?;
            decode_floats(rest, count)?
                .into_iter()
                .map(Value::Float)
                .collect()
        }
        ValueType::Integer => decode_integers(&mut reader, count)?
            .into_iter()
            .map(Value::Integer)
            .collect(),
        ValueType::Boolean => decode_booleans(&mut reader, count)?
            .into_iter()
            .map(Value::Boolean)
            .collect(),
        ValueType::String => decode_strings(&mut reader, count)?
            .into_iter()
            .map(Value::String)
            .collect(),
    };

    if reader.remaining() != 0 {
        return Err(BurrowError::Decode(format!(
            "{} trailing bytes after block values",
            reader.remaining()
        )));
    }

    Ok(timestamps.into_iter().zip(values).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points_of(values: Vec<Value>) -> Vec<(Timestamp, Value)> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (1_000 + i as i64 * 10, v))
            .collect()
    }

    #[test]
    fn test_zigzag() {
        for v in [0i64, 1, -1, 63, -64, i64::MAX, i64::MIN] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
    }

    #[test]
    fn test_block_per_type() {
        let cases = vec![
            (
                ValueType::Integer,
                points_of(vec![Value::Integer(5), Value::Integer(-7), Value::Integer(i64::MAX)]),
            ),
            (
                ValueType::Float,
                points_of(vec![Value::Float(42.0), Value::Float(42.5), Value::Float(-0.0)]),
            ),
            (
                ValueType::Boolean,
                points_of(vec![
                    Value::Boolean(true),
                    Value::Boolean(true),
                    Value::Boolean(false),
                    Value::Boolean(true),
                ]),
            ),
            (
                ValueType::String,
                points_of(vec!["up".into(), "down".into(), "up".into(), "".into()]),
            ),
        ];
        for (ty, points) in cases {
            let bytes = encode_block(&points, ty).unwrap();
            assert_eq!(block_type(&bytes).unwrap(), ty);
            assert_eq!(decode_block(&bytes, ty).unwrap(), points, "type {ty}");
        }
    }

    #[test]
    fn test_type_mismatch_is_corruption() {
        let points = points_of(vec![Value::Float(1.0)]);
        let bytes = encode_block(&points, ValueType::Float).unwrap();
        let err = decode_block(&bytes, ValueType::Integer).unwrap_err();
        assert!(matches!(
            err,
            BurrowError::TypeMismatch {
                expected: ValueType::Integer,
                actual: 2
            }
        ));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_mixed_types_rejected() {
        let points = points_of(vec![Value::Float(1.0), Value::Integer(1)]);
        assert!(encode_block(&points, ValueType::Float).is_err());
    }

    #[test]
    fn test_truncated_block() {
        let points = points_of(vec![Value::Integer(1), Value::Integer(2), Value::Integer(300)]);
        let bytes = encode_block(&points, ValueType::Integer).unwrap();
        let err = decode_block(&bytes[..bytes.len() - 1], ValueType::Integer).unwrap_err();
        assert!(err.is_corruption());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(decode_block(&padded, ValueType::Integer).is_err());
    }

    #[test]
    fn test_string_dictionary_is_compact() {
        let points = points_of(vec![Value::from("a-long-repeated-status"); 200]);
        let bytes = encode_block(&points, ValueType::String).unwrap();
        assert!(bytes.len() < 400, "got {}", bytes.len());
    }

    #[test]
    fn test_boolean_run_overflow_rejected() {
        let mut reader = ByteReader::new(&[1, 5]);
        assert!(decode_booleans(&mut reader, 3).is_err());
    }

    #[test]
    fn test_single_value_roundtrip() {
        let values = [
            Value::Integer(-3),
            Value::Float(2.5),
            Value::Boolean(true),
            Value::String("idle".into()),
        ];
        let mut buf = Vec::new();
        for v in &values {
            put_value(&mut buf, v);
        }
        let mut reader = ByteReader::new(&buf);
        for v in &values {
            assert_eq!(&get_value(&mut reader).unwrap(), v);
        }
        assert_eq!(reader.remaining(), 0);
    }
}
