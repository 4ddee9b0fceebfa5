//! Flip and entropy measurement.
//!
//! The analyzer compares memory against the fill pattern and reduces it to
//! [`FlipEvent`]s, mismatch counts and Shannon entropy over the byte histogram.
//! [`RegionStateTable`] applies the same measurements per fixed-size chunk.

use std::ops::AddAssign;

use chrono::{DateTime, Local};
use log::{debug, trace};
use serde::Serialize;
use thiserror::Error;

use crate::memory::MemoryRegion;

/// Errors that can occur during analysis.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalyzerError {
    /// Entropy is undefined for an empty buffer.
    #[error("entropy of an empty buffer is undefined")]
    EmptyBuffer,
    /// Chunk size is zero or does not divide the region.
    #[error("chunk size {chunk_size} does not divide region of {len} bytes")]
    InvalidChunkSize {
        /// Requested chunk size
        chunk_size: usize,
        /// Region length
        len: usize,
    },
}

/// Number of differing bits between `expected` and `actual`.
pub fn hamming_delta(expected: u8, actual: u8) -> u32 {
    (expected ^ actual).count_ones()
}

/// Counts bytes in `buf` that differ from `expected`.
pub fn count_mismatches(buf: &[u8], expected: u8) -> usize {
    buf.iter().filter(|&&b| b != expected).count()
}

/// Shannon entropy in bits of the byte-value distribution of `buf`.
///
/// A uniform buffer yields exactly 0.0; a buffer holding every byte value
/// equally often yields 8.0.
///
/// # Errors
///
/// Returns [`AnalyzerError::EmptyBuffer`] for a zero-length buffer.
pub fn entropy(buf: &[u8]) -> Result<f64, AnalyzerError> {
    if buf.is_empty() {
        return Err(AnalyzerError::EmptyBuffer);
    }
    let mut freq = [0usize; 256];
    for &b in buf {
        freq[b as usize] += 1;
    }
    let len = buf.len() as f64;
    let entropy = freq
        .iter()
        .filter(|&&count| count > 0)
        .map(|&count| {
            let p = count as f64 / len;
            -p * p.log2()
        })
        .sum::<f64>();
    // a single symbol gives -1.0 * log2(1.0) == -0.0
    Ok(entropy.abs())
}

/// Bits that changed in each direction.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq, Eq)]
pub struct BitTransitions {
    /// Bits read back as 1 where the pattern holds 0
    pub zero_to_one: u32,
    /// Bits read back as 0 where the pattern holds 1
    pub one_to_zero: u32,
}

impl AddAssign for BitTransitions {
    fn add_assign(&mut self, rhs: Self) {
        self.zero_to_one += rhs.zero_to_one;
        self.one_to_zero += rhs.one_to_zero;
    }
}

/// One observed byte that differs from the fill pattern.
///
/// Created once by the analyzer and never mutated.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct FlipEvent {
    /// When the mismatch was observed
    pub timestamp: DateTime<Local>,
    /// Offset of the byte within the region
    pub offset: usize,
    /// Fill pattern value
    pub expected: u8,
    /// Value read back
    pub actual: u8,
    /// Number of flipped bits
    pub delta_bits: u32,
}

impl FlipEvent {
    /// Records a mismatch observed now.
    pub fn new(offset: usize, expected: u8, actual: u8) -> Self {
        FlipEvent {
            timestamp: Local::now(),
            offset,
            expected,
            actual,
            delta_bits: hamming_delta(expected, actual),
        }
    }

    /// Splits the flipped bits by direction.
    pub fn transitions(&self) -> BitTransitions {
        let mask = self.expected ^ self.actual;
        BitTransitions {
            zero_to_one: (mask & !self.expected).count_ones(),
            one_to_zero: (mask & self.expected).count_ones(),
        }
    }
}

/// Emits one [`FlipEvent`] per byte of `buf` differing from `expected`.
///
/// `base_offset` is added to each event's offset so events refer to region offsets.
pub fn scan_flips(buf: &[u8], expected: u8, base_offset: usize) -> Vec<FlipEvent> {
    buf.iter()
        .enumerate()
        .filter(|&(_, &actual)| actual != expected)
        .map(|(i, &actual)| {
            trace!(
                "flip at 0x{:x}: 0x{:02x} -> 0x{:02x}",
                base_offset + i,
                expected,
                actual
            );
            FlipEvent::new(base_offset + i, expected, actual)
        })
        .collect()
}

/// Measured state of one chunk of the region.
#[derive(Clone, Copy, Debug, Default, Serialize, PartialEq)]
pub struct ChunkState {
    /// Byte-histogram entropy of the chunk
    pub entropy: f64,
    /// Bytes differing from the fill pattern
    pub flip_count: usize,
}

/// Per-chunk [`ChunkState`] for a whole region.
///
/// Only the analyzer writes it (through [`RegionStateTable::sample`]); the controller reads it.
#[derive(Clone, Debug, Serialize)]
pub struct RegionStateTable {
    chunk_size: usize,
    chunks: Vec<ChunkState>,
}

impl RegionStateTable {
    /// Creates a table of `region_len / chunk_size` zeroed chunks.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::InvalidChunkSize`] unless `chunk_size` evenly divides `region_len`.
    pub fn new(region_len: usize, chunk_size: usize) -> Result<Self, AnalyzerError> {
        if chunk_size == 0 || region_len == 0 || !region_len.is_multiple_of(chunk_size) {
            return Err(AnalyzerError::InvalidChunkSize {
                chunk_size,
                len: region_len,
            });
        }
        Ok(RegionStateTable {
            chunk_size,
            chunks: vec![ChunkState::default(); region_len / chunk_size],
        })
    }

    /// Granularity in bytes.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the table has no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// State of chunk `index`.
    pub fn get(&self, index: usize) -> Option<&ChunkState> {
        self.chunks.get(index)
    }

    /// All chunk states in chunk order.
    pub fn chunks(&self) -> &[ChunkState] {
        &self.chunks
    }

    /// Chunk index containing region offset `offset`.
    pub fn chunk_of(&self, offset: usize) -> usize {
        offset / self.chunk_size
    }

    /// Recomputes chunk `index` from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::EmptyBuffer`] if `buf` is empty.
    pub fn update(&mut self, index: usize, buf: &[u8], pattern: u8) -> Result<(), AnalyzerError> {
        let state = ChunkState {
            entropy: entropy(buf)?,
            flip_count: count_mismatches(buf, pattern),
        };
        self.chunks[index] = state;
        Ok(())
    }

    /// Flushes the region from the cache and recomputes every chunk.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyzerError::InvalidChunkSize`] if the table does not match the region.
    pub fn sample(&mut self, region: &MemoryRegion, pattern: u8) -> Result<(), AnalyzerError> {
        if region.len() != self.chunk_size * self.chunks.len() {
            return Err(AnalyzerError::InvalidChunkSize {
                chunk_size: self.chunk_size,
                len: region.len(),
            });
        }
        region.flush_range(0, region.len());
        for index in 0..self.chunks.len() {
            let buf = region.slice(index * self.chunk_size, self.chunk_size);
            self.update(index, buf, pattern)?;
        }
        debug!(
            "sampled {} chunks, {} mismatching bytes",
            self.chunks.len(),
            self.total_flips()
        );
        Ok(())
    }

    /// Sum of all chunk flip counts.
    pub fn total_flips(&self) -> usize {
        self.chunks.iter().map(|c| c.flip_count).sum()
    }
}
