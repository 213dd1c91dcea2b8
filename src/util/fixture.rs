//! Deterministic fixture data
//!
//! Fixture files hold pseudo-random 32-bit little-endian words from
//! `Xoshiro256PlusPlus`. The file is split into 4 KiB chunks, each with its
//! own stream seeded from the file seed and the chunk index, so the content
//! of any byte range can be regenerated in time proportional to its length.

use anyhow::{Context, Result};
use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const WORD: u64 = std::mem::size_of::<u32>() as u64;

/// Bytes covered by one independently seeded stream
pub const CHUNK_SIZE: u64 = 4096;

fn chunk_stream(seed: u64, chunk: u64) -> Xoshiro256PlusPlus {
    Xoshiro256PlusPlus::seed_from_u64(seed ^ chunk.wrapping_mul(0x9E37_79B9_7F4A_7C15))
}

/// Append the first `len` bytes of chunk `chunk` to `out`
fn push_chunk(seed: u64, chunk: u64, len: usize, out: &mut Vec<u8>) {
    let mut rng = chunk_stream(seed, chunk);
    let end = out.len() + len;
    while out.len() < end {
        let word = rng.next_u32().to_le_bytes();
        let take = (end - out.len()).min(word.len());
        out.extend_from_slice(&word[..take]);
    }
}

/// Write `size` bytes of fixture content for `seed` to `path`
///
/// `size` must be a multiple of 4.
pub fn write_fixture(path: &Path, size: u64, seed: u64) -> Result<()> {
    if size % WORD != 0 {
        anyhow::bail!("fixture size {} is not a multiple of {}", size, WORD);
    }

    let file = File::create(path)
        .with_context(|| format!("Failed to create fixture: {}", path.display()))?;
    let mut out = BufWriter::new(file);
    let mut chunk = Vec::with_capacity(CHUNK_SIZE as usize);

    for index in 0..size.div_ceil(CHUNK_SIZE) {
        let len = (size - index * CHUNK_SIZE).min(CHUNK_SIZE) as usize;
        chunk.clear();
        push_chunk(seed, index, len, &mut chunk);
        out.write_all(&chunk)
            .with_context(|| format!("Failed to write fixture: {}", path.display()))?;
    }

    out.flush()
        .with_context(|| format!("Failed to flush fixture: {}", path.display()))?;
    Ok(())
}

/// Bytes a fixture for `seed` holds at `[offset, offset + len)`
pub fn expected_bytes(seed: u64, offset: u64, len: usize) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(len);
    let end = offset + len as u64;
    let mut pos = offset;
    while pos < end {
        let chunk = pos / CHUNK_SIZE;
        let skip = (pos % CHUNK_SIZE) as usize;
        let upto = (end - chunk * CHUNK_SIZE).min(CHUNK_SIZE) as usize;

        let start = bytes.len();
        push_chunk(seed, chunk, upto, &mut bytes);
        bytes.drain(start..start + skip);
        pos += (upto - skip) as u64;
    }
    bytes
}

/// Offset of the first byte in `data` that differs from the fixture
pub fn first_mismatch(seed: u64, offset: u64, data: &[u8]) -> Option<usize> {
    let expected = expected_bytes(seed, offset, data.len());
    data.iter().zip(&expected).position(|(a, b)| a != b)
}
