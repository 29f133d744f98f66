//! TSM File Format implementation.
//!
//! A TSM file is a sealed, immutable set of sorted streams. Each stream is one
//! field of one series, addressed by its stream key (`series#!~#field`), and
//! is stored as one or more blocks produced by the block codec.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (32 bytes)                                      │
//! │  - Magic: "BTSM" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Level: u16 (2 bytes)                                      │
//! │  - Min Timestamp: i64 (8 bytes)                              │
//! │  - Max Timestamp: i64 (8 bytes)                              │
//! │  - Max WAL Sequence: u64 (8 bytes)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data Blocks                                                 │
//! │  - [len: u32][crc32: u32][codec block]                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Key Index                                                   │
//! │  - sorted keys, value type, per-block time range + location  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Bloom Filter (xxh64, k=3)                                   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (48 bytes)                                           │
//! │  - Offsets, sizes, counts, file CRC, reverse magic "MSTB"    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use crate::error::{BurrowError, Result};
use crate::tsm::encoding::{decode_block, encode_block};
use crate::tsm::{TimeRange, Timestamp, Value, ValueType};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for TSM file header: "BTSM"
pub const TSM_MAGIC: [u8; 4] = *b"BTSM";

/// Reverse magic bytes for TSM file footer: "MSTB"
pub const TSM_MAGIC_REVERSE: [u8; 4] = *b"MSTB";

/// Current TSM file format version.
pub const TSM_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 48;

/// Size of the `[len][crc]` prefix in front of every block.
pub const BLOCK_FRAME_SIZE: usize = 8;

/// Longest stream key the index can store.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// TSM file header (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmHeader {
    /// File format version.
    pub version: u16,
    /// Compaction level (0 = freshly flushed cache snapshot).
    pub level: u16,
    /// Minimum timestamp in the file.
    pub min_timestamp: i64,
    /// Maximum timestamp in the file.
    pub max_timestamp: i64,
    /// Highest WAL sequence number whose data may be in this file.
    pub max_sequence: u64,
}

impl Default for TsmHeader {
    fn default() -> Self {
        Self {
            version: TSM_VERSION,
            level: 0,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            max_sequence: 0,
        }
    }
}

impl TsmHeader {
    /// Writes the header using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&TSM_MAGIC)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&self.level.to_le_bytes())?;
        writer.write_all(&self.min_timestamp.to_le_bytes())?;
        writer.write_all(&self.max_timestamp.to_le_bytes())?;
        writer.write_all(&self.max_sequence.to_le_bytes())?;
        Ok(())
    }

    /// Reads a header.
    ///
    /// # Errors
    ///
    /// Returns `BurrowError::InvalidMagic` if the magic bytes don't match.
    /// Returns `BurrowError::UnsupportedVersion` if the version is newer than
    /// this build understands.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = [buf[0], buf[1], buf[2], buf[3]];
        if magic != TSM_MAGIC {
            return Err(BurrowError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > TSM_VERSION {
            return Err(BurrowError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            level: u16::from_le_bytes([buf[6], buf[7]]),
            min_timestamp: le_i64(&buf[8..16]),
            max_timestamp: le_i64(&buf[16..24]),
            max_sequence: le_i64(&buf[24..32]) as u64,
        })
    }
}

/// TSM file footer (48 bytes).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TsmFooter {
    /// Offset to the key index from file start.
    pub index_offset: u64,
    /// Size of the key index in bytes.
    pub index_size: u32,
    /// Offset to the bloom filter.
    pub bloom_offset: u64,
    /// Size of the bloom filter in bytes.
    pub bloom_size: u32,
    /// Number of stream keys in the file.
    pub key_count: u32,
    /// Total number of points in the file.
    pub total_point_count: u64,
    /// CRC32 of every byte before the footer.
    pub file_crc32: u32,
}

impl TsmFooter {
    /// Writes the footer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.index_size.to_le_bytes())?;
        writer.write_all(&self.bloom_offset.to_le_bytes())?;
        writer.write_all(&self.bloom_size.to_le_bytes())?;
        writer.write_all(&self.key_count.to_le_bytes())?;
        writer.write_all(&self.total_point_count.to_le_bytes())?;
        writer.write_all(&self.file_crc32.to_le_bytes())?;
        writer.write_all(&TSM_MAGIC_REVERSE)?;
        // Reserved
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads a footer.
    ///
    /// # Errors
    ///
    /// Returns `BurrowError::InvalidMagic` if the reverse magic bytes don't match.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic_reverse = [buf[40], buf[41], buf[42], buf[43]];
        if magic_reverse != TSM_MAGIC_REVERSE {
            return Err(BurrowError::InvalidMagic(magic_reverse));
        }

        Ok(Self {
            index_offset: le_i64(&buf[0..8]) as u64,
            index_size: le_u32(&buf[8..12]),
            bloom_offset: le_i64(&buf[12..20]) as u64,
            bloom_size: le_u32(&buf[20..24]),
            key_count: le_u32(&buf[24..28]),
            total_point_count: le_i64(&buf[28..36]) as u64,
            file_crc32: le_u32(&buf[36..40]),
        })
    }
}

fn le_i64(bytes: &[u8]) -> i64 {
    let mut arr = [0u8; 8];
    arr.copy_from_slice(&bytes[..8]);
    i64::from_le_bytes(arr)
}

fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Location and time range of one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    /// Smallest timestamp in the block.
    pub min_ts: Timestamp,
    /// Largest timestamp in the block.
    pub max_ts: Timestamp,
    /// Offset of the block frame from file start.
    pub offset: u64,
    /// Size of the codec block (excluding the frame prefix).
    pub size: u32,
    /// Number of points in the block.
    pub count: u32,
}

/// Index entry for one stream: its type and its blocks in time order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEntry {
    /// Value type of every block of the stream.
    pub value_type: ValueType,
    /// Blocks sorted by `min_ts`, non-overlapping.
    pub blocks: Vec<BlockEntry>,
}

impl KeyEntry {
    /// Smallest timestamp of the stream.
    pub fn min_ts(&self) -> Timestamp {
        self.blocks.first().map(|b| b.min_ts).unwrap_or(Timestamp::MAX)
    }

    /// Largest timestamp of the stream.
    pub fn max_ts(&self) -> Timestamp {
        self.blocks.last().map(|b| b.max_ts).unwrap_or(Timestamp::MIN)
    }

    /// Total points in the stream.
    pub fn point_count(&self) -> u64 {
        self.blocks.iter().map(|b| u64::from(b.count)).sum()
    }

    /// Blocks overlapping the given range, found by binary search.
    pub fn blocks_in(&self, range: TimeRange) -> &[BlockEntry] {
        let start = self.blocks.partition_point(|b| b.max_ts < range.min);
        let end = self.blocks.partition_point(|b| b.min_ts <= range.max);
        if start >= end {
            return &[];
        }
        &self.blocks[start..end]
    }
}

const BLOOM_FILTER_DEFAULT_HASH_COUNT: u8 = 3;

/// Bloom filter for fast key existence checks.
///
/// `h_i(x) = xxhash64(x, seed=i) % size_bits` with k=3.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits: Vec<u64>,
    hash_count: u8,
}

impl BloomFilter {
    /// Creates a filter sized for roughly 1% false positives.
    pub fn new(expected_items: usize) -> Self {
        let num_bits = (expected_items * 10).max(64);
        Self {
            bits: vec![0u64; num_bits.div_ceil(64)],
            hash_count: BLOOM_FILTER_DEFAULT_HASH_COUNT,
        }
    }

    fn bit_positions<'a>(&'a self, key: &'a [u8]) -> impl Iterator<Item = (usize, u64)> + 'a {
        let num_bits = (self.bits.len() * 64) as u64;
        (0..self.hash_count).map(move |seed| {
            let bit_idx = xxhash_rust::xxh64::xxh64(key, u64::from(seed)) % num_bits;
            ((bit_idx / 64) as usize, bit_idx % 64)
        })
    }

    /// Adds a key.
    pub fn insert(&mut self, key: &[u8]) {
        let positions: Vec<_> = self.bit_positions(key).collect();
        for (word, bit) in positions {
            self.bits[word] |= 1u64 << bit;
        }
    }

    /// Returns `false` if the key is definitely absent.
    pub fn maybe_contains(&self, key: &[u8]) -> bool {
        if self.bits.is_empty() {
            return false;
        }
        self.bit_positions(key)
            .all(|(word, bit)| self.bits[word] & (1u64 << bit) != 0)
    }

    /// Writes the filter.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.bits.len() as u32).to_le_bytes())?;
        writer.write_all(&[self.hash_count, 0, 0, 0])?;
        for word in &self.bits {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Reads a filter.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let num_words = u32::from_le_bytes(buf4) as usize;
        reader.read_exact(&mut buf4)?;
        let hash_count = buf4[0];

        let mut bits = Vec::with_capacity(num_words);
        let mut buf8 = [0u8; 8];
        for _ in 0..num_words {
            reader.read_exact(&mut buf8)?;
            bits.push(u64::from_le_bytes(buf8));
        }
        Ok(Self { bits, hash_count })
    }
}

fn write_index<W: Write>(writer: &mut W, index: &BTreeMap<String, KeyEntry>) -> Result<()> {
    writer.write_all(&(index.len() as u32).to_le_bytes())?;
    for (key, entry) in index {
        writer.write_all(&(key.len() as u16).to_le_bytes())?;
        writer.write_all(key.as_bytes())?;
        writer.write_all(&[entry.value_type as u8])?;
        writer.write_all(&(entry.blocks.len() as u32).to_le_bytes())?;
        for block in &entry.blocks {
            writer.write_all(&block.min_ts.to_le_bytes())?;
            writer.write_all(&block.max_ts.to_le_bytes())?;
            writer.write_all(&block.offset.to_le_bytes())?;
            writer.write_all(&block.size.to_le_bytes())?;
            writer.write_all(&block.count.to_le_bytes())?;
        }
    }
    Ok(())
}

fn read_index<R: Read>(reader: &mut R) -> Result<BTreeMap<String, KeyEntry>> {
    let mut buf4 = [0u8; 4];
    let mut buf2 = [0u8; 2];
    let mut buf1 = [0u8; 1];
    let mut block_buf = [0u8; 32];

    reader.read_exact(&mut buf4)?;
    let key_count = u32::from_le_bytes(buf4);
    let mut index = BTreeMap::new();

    for _ in 0..key_count {
        reader.read_exact(&mut buf2)?;
        let mut key_bytes = vec![0u8; u16::from_le_bytes(buf2) as usize];
        reader.read_exact(&mut key_bytes)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|e| BurrowError::Decode(format!("invalid key: {e}")))?;

        reader.read_exact(&mut buf1)?;
        let value_type = ValueType::from_u8(buf1[0])
            .ok_or_else(|| BurrowError::Decode(format!("unknown value type {}", buf1[0])))?;

        reader.read_exact(&mut buf4)?;
        let block_count = u32::from_le_bytes(buf4) as usize;
        let mut blocks = Vec::with_capacity(block_count.min(1 << 16));
        for _ in 0..block_count {
            reader.read_exact(&mut block_buf)?;
            blocks.push(BlockEntry {
                min_ts: le_i64(&block_buf[0..8]),
                max_ts: le_i64(&block_buf[8..16]),
                offset: le_i64(&block_buf[16..24]) as u64,
                size: le_u32(&block_buf[24..28]),
                count: le_u32(&block_buf[28..32]),
            });
        }
        index.insert(key, KeyEntry { value_type, blocks });
    }
    Ok(index)
}

/// Summary of a finished file.
#[derive(Debug, Clone)]
pub struct TsmFileHandle {
    /// Path the file was written to.
    pub path: PathBuf,
    /// Final header.
    pub header: TsmHeader,
    /// Final footer.
    pub footer: TsmFooter,
}

/// TSM file writer.
///
/// Streams must be written in ascending key order. Writing sequence:
/// 1. Placeholder header (32 bytes)
/// 2. Data blocks, each framed with its length and CRC
/// 3. Key index and bloom filter
/// 4. Final header (rewritten in place) and footer with the file CRC
pub struct TsmWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    position: u64,
    index: BTreeMap<String, KeyEntry>,
    last_key: Option<String>,
    header: TsmHeader,
    total_point_count: u64,
}

impl TsmWriter {
    /// Creates a new writer at `path`, truncating any existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path, level: u16, max_sequence: u64) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        let header = TsmHeader {
            level,
            max_sequence,
            ..TsmHeader::default()
        };
        header.write_to(&mut writer)?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            position: HEADER_SIZE as u64,
            index: BTreeMap::new(),
            last_key: None,
            header,
            total_point_count: 0,
        })
    }

    /// Bytes written so far.
    pub fn size(&self) -> u64 {
        self.position
    }

    /// Number of streams written so far.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Writes one stream as blocks of at most `max_points_per_block` points.
    ///
    /// `points` must be sorted by timestamp without duplicates and all of
    /// `value_type`. Empty streams are skipped.
    ///
    /// # Errors
    ///
    /// Returns a validation error if keys arrive out of order, and an I/O
    /// error if writing fails.
    pub fn write_stream(
        &mut self,
        key: &str,
        value_type: ValueType,
        points: &[(Timestamp, Value)],
        max_points_per_block: usize,
    ) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        if key.len() > MAX_KEY_LEN {
            return Err(BurrowError::Validation(format!(
                "stream key of {} bytes exceeds {MAX_KEY_LEN}",
                key.len()
            )));
        }
        if let Some(last) = &self.last_key {
            if key <= last.as_str() {
                return Err(BurrowError::Validation(format!(
                    "stream key {key:?} written after {last:?}"
                )));
            }
        }

        let mut blocks = Vec::new();
        for chunk in points.chunks(max_points_per_block.max(1)) {
            let encoded = encode_block(chunk, value_type)?;
            let crc = crc32fast::hash(&encoded);

            self.writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
            self.writer.write_all(&crc.to_le_bytes())?;
            self.writer.write_all(&encoded)?;

            let min_ts = chunk[0].0;
            let max_ts = chunk[chunk.len() - 1].0;
            blocks.push(BlockEntry {
                min_ts,
                max_ts,
                offset: self.position,
                size: encoded.len() as u32,
                count: chunk.len() as u32,
            });
            self.position += (BLOCK_FRAME_SIZE + encoded.len()) as u64;
            self.header.min_timestamp = self.header.min_timestamp.min(min_ts);
            self.header.max_timestamp = self.header.max_timestamp.max(max_ts);
            self.total_point_count += chunk.len() as u64;
        }

        self.index
            .insert(key.to_string(), KeyEntry { value_type, blocks });
        self.last_key = Some(key.to_string());
        Ok(())
    }

    /// Finishes the file: writes index, bloom filter, header and footer, then
    /// syncs it to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if any I/O operation fails; a sync failure is a
    /// durability error.
    pub fn finish(mut self) -> Result<TsmFileHandle> {
        let index_offset = self.position;
        let mut index_buf = Vec::new();
        write_index(&mut index_buf, &self.index)?;
        self.writer.write_all(&index_buf)?;
        self.position += index_buf.len() as u64;

        let bloom_offset = self.position;
        let mut bloom = BloomFilter::new(self.index.len());
        for key in self.index.keys() {
            bloom.insert(key.as_bytes());
        }
        let mut bloom_buf = Vec::new();
        bloom.write_to(&mut bloom_buf)?;
        self.writer.write_all(&bloom_buf)?;
        self.position += bloom_buf.len() as u64;

        // Overwrite the placeholder header with final values.
        self.writer.seek(SeekFrom::Start(0))?;
        self.header.write_to(&mut self.writer)?;
        self.writer.flush()?;
        self.writer.seek(SeekFrom::End(0))?;

        let file_crc32 = file_crc(&self.path, self.position)?;
        let footer = TsmFooter {
            index_offset,
            index_size: index_buf.len() as u32,
            bloom_offset,
            bloom_size: bloom_buf.len() as u32,
            key_count: self.index.len() as u32,
            total_point_count: self.total_point_count,
            file_crc32,
        };
        footer.write_to(&mut self.writer)?;

        self.writer.flush()?;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()
            .map_err(|e| BurrowError::durability(format!("sync {}", self.path.display()), e))?;

        Ok(TsmFileHandle {
            path: self.path,
            header: self.header,
            footer,
        })
    }
}

fn file_crc(path: &Path, size: u64) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = [0u8; 8192];
    let mut remaining = size;

    while remaining > 0 {
        let to_read = remaining.min(buffer.len() as u64) as usize;
        let n = file.read(&mut buffer[..to_read])?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    Ok(hasher.finalize())
}

/// TSM file reader.
///
/// Opening verifies the header, footer and whole-file CRC and loads the key
/// index and bloom filter into memory. Blocks are read and decoded on demand.
#[derive(Debug)]
pub struct TsmReader {
    path: PathBuf,
    header: TsmHeader,
    footer: TsmFooter,
    index: BTreeMap<String, KeyEntry>,
    bloom: BloomFilter,
}

impl TsmReader {
    /// Opens and validates a TSM file.
    ///
    /// # Errors
    ///
    /// Returns a corruption-class error if the magic, version, footer or file
    /// checksum is wrong, and an I/O error if the file cannot be read.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(BurrowError::corruption(
                path,
                format!("file of {file_size} bytes is shorter than header and footer"),
            ));
        }
        let mut reader = BufReader::new(file);

        let header = TsmHeader::read_from(&mut reader)?;

        reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = TsmFooter::read_from(&mut reader)?;

        let calculated = file_crc(path, file_size - FOOTER_SIZE as u64)?;
        if calculated != footer.file_crc32 {
            return Err(BurrowError::ChecksumMismatch {
                expected: footer.file_crc32,
                actual: calculated,
            });
        }

        reader.seek(SeekFrom::Start(footer.index_offset))?;
        let index = read_index(&mut reader)?;
        reader.seek(SeekFrom::Start(footer.bloom_offset))?;
        let bloom = BloomFilter::read_from(&mut reader)?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            footer,
            index,
            bloom,
        })
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file header.
    pub fn header(&self) -> &TsmHeader {
        &self.header
    }

    /// Returns the file footer.
    pub fn footer(&self) -> &TsmFooter {
        &self.footer
    }

    /// Iterates stream keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.index.keys().map(String::as_str)
    }

    /// Iterates `(key, entry)` pairs in sorted order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &KeyEntry)> {
        self.index.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterates entries whose key starts with `prefix`.
    pub fn entries_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a KeyEntry)> + 'a {
        self.index
            .range::<str, _>((std::ops::Bound::Included(prefix), std::ops::Bound::Unbounded))
            .take_while(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Looks up a stream, consulting the bloom filter first.
    pub fn entry(&self, key: &str) -> Option<&KeyEntry> {
        if !self.bloom.maybe_contains(key.as_bytes()) {
            return None;
        }
        self.index.get(key)
    }

    /// Returns true if the file holds the stream.
    pub fn contains(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Reads and checksums the raw codec bytes of one block.
    ///
    /// # Errors
    ///
    /// Returns `ChecksumMismatch` if the stored CRC does not match.
    pub fn read_block(&self, block: &BlockEntry) -> Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(block.offset))?;

        let mut frame = [0u8; BLOCK_FRAME_SIZE];
        file.read_exact(&mut frame)?;
        let len = le_u32(&frame[0..4]);
        let expected = le_u32(&frame[4..8]);
        if len != block.size {
            return Err(BurrowError::corruption(
                &self.path,
                format!(
                    "block at {} has length {len}, index says {}",
                    block.offset, block.size
                ),
            ));
        }

        let mut data = vec![0u8; len as usize];
        file.read_exact(&mut data)?;
        let actual = crc32fast::hash(&data);
        if actual != expected {
            return Err(BurrowError::ChecksumMismatch { expected, actual });
        }
        Ok(data)
    }

    /// Reads every point of `key` within `range`, decoding only the blocks
    /// whose time range overlaps it.
    pub fn read_range(&self, key: &str, range: TimeRange) -> Result<Vec<(Timestamp, Value)>> {
        let Some(entry) = self.entry(key) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for block in entry.blocks_in(range) {
            let data = self.read_block(block)?;
            let points = decode_block(&data, entry.value_type)?;
            if range.covers(block.min_ts, block.max_ts) {
                out.extend(points);
            } else {
                out.extend(points.into_iter().filter(|(ts, _)| range.contains(*ts)));
            }
        }
        Ok(out)
    }

    /// Reads every point of `key`.
    pub fn read_all(&self, key: &str) -> Result<Vec<(Timestamp, Value)>> {
        self.read_range(key, TimeRange::all())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn floats(range: std::ops::Range<i64>) -> Vec<(Timestamp, Value)> {
        range.map(|i| (i * 10, Value::Float(i as f64 * 0.5))).collect()
    }

    #[test]
    fn test_header_roundtrip() {
        let header = TsmHeader {
            version: TSM_VERSION,
            level: 2,
            min_timestamp: -5,
            max_timestamp: 99,
            max_sequence: 42,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(TsmHeader::read_from(&mut buf.as_slice()).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..4].copy_from_slice(b"NOPE");
        assert!(matches!(
            TsmHeader::read_from(&mut buf.as_slice()),
            Err(BurrowError::InvalidMagic(_))
        ));
    }

    #[test]
    fn test_footer_size() {
        let mut buf = Vec::new();
        TsmFooter::default().write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FOOTER_SIZE);
    }

    #[test]
    fn test_bloom_filter() {
        let mut bloom = BloomFilter::new(100);
        for i in 0..100 {
            bloom.insert(format!("key-{i}").as_bytes());
        }
        for i in 0..100 {
            assert!(bloom.maybe_contains(format!("key-{i}").as_bytes()));
        }
        let false_positives = (100..1100)
            .filter(|i| bloom.maybe_contains(format!("key-{i}").as_bytes()))
            .count();
        assert!(false_positives < 50, "{false_positives} false positives");
    }

    #[test]
    fn test_write_and_read_streams() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.tsm");

        let mut writer = TsmWriter::create(&path, 1, 77).unwrap();
        writer
            .write_stream("cpu,host=a#!~#usage", ValueType::Float, &floats(0..25), 10)
            .unwrap();
        writer
            .write_stream(
                "cpu,host=b#!~#state",
                ValueType::String,
                &[(5, Value::from("up")), (6, Value::from("down"))],
                10,
            )
            .unwrap();
        let handle = writer.finish().unwrap();
        assert_eq!(handle.footer.key_count, 2);
        assert_eq!(handle.footer.total_point_count, 27);

        let reader = TsmReader::open(&path).unwrap();
        assert_eq!(reader.header().level, 1);
        assert_eq!(reader.header().max_sequence, 77);
        assert_eq!(reader.header().min_timestamp, 0);
        assert_eq!(reader.header().max_timestamp, 240);

        let entry = reader.entry("cpu,host=a#!~#usage").unwrap();
        assert_eq!(entry.blocks.len(), 3);
        assert_eq!(entry.point_count(), 25);
        assert_eq!(reader.read_all("cpu,host=a#!~#usage").unwrap(), floats(0..25));

        // Only the middle block overlaps [100, 150].
        let range = TimeRange::new(100, 150);
        assert_eq!(entry.blocks_in(range).len(), 1);
        assert_eq!(
            reader.read_range("cpu,host=a#!~#usage", range).unwrap(),
            floats(10..16)
        );

        assert!(reader.entry("mem#!~#free").is_none());
        let prefixed: Vec<_> = reader
            .entries_with_prefix("cpu,host=b#!~#")
            .map(|(k, _)| k.to_string())
            .collect();
        assert_eq!(prefixed, vec!["cpu,host=b#!~#state".to_string()]);
    }

    #[test]
    fn test_out_of_order_keys_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = TsmWriter::create(&dir.path().join("b.tsm"), 0, 0).unwrap();
        writer
            .write_stream("b", ValueType::Float, &floats(0..1), 10)
            .unwrap();
        let err = writer
            .write_stream("a", ValueType::Float, &floats(0..1), 10)
            .unwrap_err();
        assert!(matches!(err, BurrowError::Validation(_)));
    }

    #[test]
    fn test_corrupted_file_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.tsm");
        let mut writer = TsmWriter::create(&path, 0, 0).unwrap();
        writer
            .write_stream("k", ValueType::Float, &floats(0..50), 100)
            .unwrap();
        writer.finish().unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + BLOCK_FRAME_SIZE + 3] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let err = TsmReader::open(&path).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_truncated_file_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("d.tsm");
        std::fs::write(&path, b"BTSM").unwrap();
        assert!(TsmReader::open(&path).unwrap_err().is_corruption());
    }
}
