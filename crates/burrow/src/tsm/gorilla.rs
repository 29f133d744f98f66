//! Gorilla compression for timestamps and float values.
//!
//! # Algorithm Overview
//!
//! ## Timestamp Encoding (Delta-of-Delta)
//!
//! Timestamps are encoded using delta-of-delta encoding:
//! - First value: 64 bits raw
//! - Subsequent values use variable-length encoding based on delta-of-delta:
//!   - `0`: `'0'` (1 bit)
//!   - `[-63, 64]`: `'10'` + 7 bits
//!   - `[-255, 256]`: `'110'` + 9 bits
//!   - `[-2047, 2048]`: `'1110'` + 12 bits
//!   - else: `'1111'` + 64 bits
//!
//! Deltas use wrapping arithmetic so any `i64` sequence round-trips.
//!
//! ## Value Encoding (XOR-based)
//!
//! Float values are encoded using XOR with the previous value:
//! - First value: 64 bits raw (IEEE 754)
//! - Subsequent values:
//!   - XOR = 0: `'0'` (1 bit)
//!   - Same window: `'10'` + meaningful bits
//!   - New window: `'11'` + 5 bits leading + 6 bits length + meaningful bits

use crate::error::{BurrowError, Result};
use bitvec::prelude::*;

/// Bit stream type shared by the encoders.
pub type Bits = BitVec<u8, Msb0>;

#[inline]
fn push_bits(output: &mut Bits, value: u64, width: u32) {
    for i in (0..width).rev() {
        output.push((value >> i) & 1 == 1);
    }
}

/// Cursor over a bit stream that never reads past its end.
struct BitReader<'a> {
    data: &'a BitSlice<u8, Msb0>,
    pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self { data, pos: 0 }
    }

    #[inline]
    fn read_bit(&mut self) -> Option<bool> {
        let bit = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(bit)
    }

    #[inline]
    fn read_bits(&mut self, width: u32) -> Option<u64> {
        if self.pos + width as usize > self.data.len() {
            return None;
        }
        let mut value = 0u64;
        for _ in 0..width {
            value = (value << 1) | u64::from(self.data[self.pos]);
            self.pos += 1;
        }
        Some(value)
    }
}

/// Encoder for timestamps using delta-of-delta encoding.
#[derive(Debug, Default)]
pub struct TimestampEncoder {
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl TimestampEncoder {
    /// Creates a new timestamp encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a timestamp into the output bit vector.
    pub fn encode(&mut self, timestamp: i64, output: &mut Bits) {
        if !self.started {
            self.started = true;
            self.prev_ts = timestamp;
            self.prev_delta = 0;
            push_bits(output, timestamp as u64, 64);
            return;
        }

        let delta = timestamp.wrapping_sub(self.prev_ts);
        let delta_of_delta = delta.wrapping_sub(self.prev_delta);

        if delta_of_delta == 0 {
            output.push(false);
        } else if (-63..=64).contains(&delta_of_delta) {
            push_bits(output, 0b10, 2);
            push_bits(output, (delta_of_delta + 63) as u64, 7);
        } else if (-255..=256).contains(&delta_of_delta) {
            push_bits(output, 0b110, 3);
            push_bits(output, (delta_of_delta + 255) as u64, 9);
        } else if (-2047..=2048).contains(&delta_of_delta) {
            push_bits(output, 0b1110, 4);
            push_bits(output, (delta_of_delta + 2047) as u64, 12);
        } else {
            push_bits(output, 0b1111, 4);
            push_bits(output, delta_of_delta as u64, 64);
        }

        self.prev_delta = delta;
        self.prev_ts = timestamp;
    }
}

/// Decoder for delta-of-delta encoded timestamps.
pub struct TimestampDecoder<'a> {
    reader: BitReader<'a>,
    started: bool,
    prev_ts: i64,
    prev_delta: i64,
}

impl<'a> TimestampDecoder<'a> {
    /// Creates a new timestamp decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            started: false,
            prev_ts: 0,
            prev_delta: 0,
        }
    }

    /// Decodes the next timestamp, or `None` if the stream is exhausted or truncated.
    pub fn decode_next(&mut self) -> Option<i64> {
        if !self.started {
            let ts = self.reader.read_bits(64)? as i64;
            self.started = true;
            self.prev_ts = ts;
            self.prev_delta = 0;
            return Some(ts);
        }

        let delta_of_delta = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(7)? as i64 - 63
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(9)? as i64 - 255
        } else if !self.reader.read_bit()? {
            self.reader.read_bits(12)? as i64 - 2047
        } else {
            self.reader.read_bits(64)? as i64
        };

        let delta = self.prev_delta.wrapping_add(delta_of_delta);
        let ts = self.prev_ts.wrapping_add(delta);
        self.prev_delta = delta;
        self.prev_ts = ts;
        Some(ts)
    }
}

/// Encoder for float values using XOR compression.
#[derive(Debug, Default)]
pub struct ValueEncoder {
    started: bool,
    prev_value: u64,
    window: Option<(u32, u32)>,
}

impl ValueEncoder {
    /// Creates a new value encoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encodes a float value into the output bit vector.
    pub fn encode(&mut self, value: f64, output: &mut Bits) {
        let bits = value.to_bits();

        if !self.started {
            self.started = true;
            self.prev_value = bits;
            push_bits(output, bits, 64);
            return;
        }

        let xor = bits ^ self.prev_value;
        if xor == 0 {
            output.push(false);
        } else {
            // The leading-zero count must fit in 5 bits.
            let leading = xor.leading_zeros().min(31);
            let trailing = xor.trailing_zeros();

            match self.window {
                Some((prev_leading, prev_trailing))
                    if leading >= prev_leading && trailing >= prev_trailing =>
                {
                    output.push(true);
                    output.push(false);
                    let meaningful = 64 - prev_leading - prev_trailing;
                    push_bits(output, xor >> prev_trailing, meaningful);
                }
                _ => {
                    output.push(true);
                    output.push(true);
                    let meaningful = 64 - leading - trailing;
                    push_bits(output, u64::from(leading), 5);
                    push_bits(output, u64::from(meaningful - 1), 6);
                    push_bits(output, xor >> trailing, meaningful);
                    self.window = Some((leading, trailing));
                }
            }
        }

        self.prev_value = bits;
    }
}

/// Decoder for XOR-encoded float values.
pub struct ValueDecoder<'a> {
    reader: BitReader<'a>,
    started: bool,
    prev_value: u64,
    window: (u32, u32),
}

impl<'a> ValueDecoder<'a> {
    /// Creates a new value decoder.
    pub fn new(data: &'a BitSlice<u8, Msb0>) -> Self {
        Self {
            reader: BitReader::new(data),
            started: false,
            prev_value: 0,
            window: (0, 0),
        }
    }

    /// Decodes the next float, or `None` if the stream is exhausted or truncated.
    pub fn decode_next(&mut self) -> Option<f64> {
        if !self.started {
            let bits = self.reader.read_bits(64)?;
            self.started = true;
            self.prev_value = bits;
            return Some(f64::from_bits(bits));
        }

        let xor = if !self.reader.read_bit()? {
            0
        } else if !self.reader.read_bit()? {
            let (leading, trailing) = self.window;
            let meaningful = 64 - leading - trailing;
            self.reader.read_bits(meaningful)? << trailing
        } else {
            let leading = self.reader.read_bits(5)? as u32;
            let meaningful = self.reader.read_bits(6)? as u32 + 1;
            let trailing = 64u32.checked_sub(leading + meaningful)?;
            self.window = (leading, trailing);
            self.reader.read_bits(meaningful)? << trailing
        };

        let bits = self.prev_value ^ xor;
        self.prev_value = bits;
        Some(f64::from_bits(bits))
    }
}

/// Encodes a timestamp column into bytes.
pub fn encode_timestamps(timestamps: &[i64]) -> Vec<u8> {
    let mut output = Bits::new();
    let mut encoder = TimestampEncoder::new();
    for &ts in timestamps {
        encoder.encode(ts, &mut output);
    }
    output.into_vec()
}

/// Decodes exactly `count` timestamps.
pub fn decode_timestamps(data: &[u8], count: usize) -> Result<Vec<i64>> {
    let mut decoder = TimestampDecoder::new(data.view_bits::<Msb0>());
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let ts = decoder
            .decode_next()
            .ok_or_else(|| BurrowError::Decode(format!("timestamp stream ended at {i}/{count}")))?;
        out.push(ts);
    }
    Ok(out)
}

/// Encodes a float column into bytes.
pub fn encode_floats(values: &[f64]) -> Vec<u8> {
    let mut output = Bits::new();
    let mut encoder = ValueEncoder::new();
    for &value in values {
        encoder.encode(value, &mut output);
    }
    output.into_vec()
}

/// Decodes exactly `count` floats.
pub fn decode_floats(data: &[u8], count: usize) -> Result<Vec<f64>> {
    let mut decoder = ValueDecoder::new(data.view_bits::<Msb0>());
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let value = decoder
            .decode_next()
            .ok_or_else(|| BurrowError::Decode(format!("float stream ended at {i}/{count}")))?;
        out.push(value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_roundtrip() {
        let timestamps = vec![1000_i64, 1010, 1020, 1030, 1100, 2000, 2001];
        let encoded = encode_timestamps(&timestamps);
        assert_eq!(decode_timestamps(&encoded, timestamps.len()).unwrap(), timestamps);
    }

    #[test]
    fn test_timestamp_large_deltas() {
        let timestamps = vec![i64::MIN, 0, i64::MAX, -5, 1 << 40, (1 << 40) + 3];
        let encoded = encode_timestamps(&timestamps);
        assert_eq!(decode_timestamps(&encoded, timestamps.len()).unwrap(), timestamps);
    }

    #[test]
    fn test_regular_timestamps_compress() {
        let timestamps: Vec<i64> = (0..1000).map(|i| 1_000_000_000 + i * 10).collect();
        let encoded = encode_timestamps(&timestamps);
        // 64 bits first, one 7-bit bucket, then one bit per point.
        assert!(encoded.len() < 140, "got {} bytes", encoded.len());
        assert_eq!(decode_timestamps(&encoded, 1000).unwrap(), timestamps);
    }

    #[test]
    fn test_value_roundtrip() {
        let values = vec![1.0_f64, 1.0, 1.1, 1.2, 1.1, 2.0, 0.0, -1.0, f64::MAX, f64::MIN_POSITIVE];
        let encoded = encode_floats(&values);
        let decoded = decode_floats(&encoded, values.len()).unwrap();
        for (a, b) in values.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_value_many_leading_zeros() {
        // XOR of these has more than 31 leading zeros.
        let values = vec![1.0_f64, f64::from_bits(1.0_f64.to_bits() ^ 1), 1.0];
        let encoded = encode_floats(&values);
        let decoded = decode_floats(&encoded, 3).unwrap();
        for (a, b) in values.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_nan_preserved() {
        let values = vec![f64::NAN, 1.0, f64::NAN, f64::INFINITY];
        let encoded = encode_floats(&values);
        let decoded = decode_floats(&encoded, 4).unwrap();
        for (a, b) in values.iter().zip(&decoded) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_truncated_stream_errors() {
        let encoded = encode_timestamps(&[1, 2, 3]);
        assert!(decode_timestamps(&encoded[..4], 3).is_err());
        assert!(decode_floats(&[], 1).is_err());
    }

    #[test]
    fn test_empty() {
        assert!(encode_timestamps(&[]).is_empty());
        assert!(decode_timestamps(&[], 0).unwrap().is_empty());
    }
}
