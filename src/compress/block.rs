//! Block compressor.
//!
//! Stateless raw DEFLATE adapter. Every call owns its buffers, so blocks can be
//! compressed and decompressed from any number of threads at once. Blocks carry no
//! framing of their own; integrity comes from the CRC-32 and SHA-256 recorded per
//! entry in the index.

use std::io::Write;

use crc32fast::Hasher as Crc32Hasher;
use flate2::write::DeflateEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status};
use sha2::{Digest, Sha256};

use crate::common::Codec;
use crate::ArchiverError;

/// Highest accepted compression level. Level 0 stores.
pub const MAX_LEVEL: u32 = 9;

/// Default ceiling on the decompressed size of a single entry (4 GiB).
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 4 * 1024 * 1024 * 1024;

const INITIAL_OUTPUT: usize = 1024 * 1024; // 1 MiB

/// A compressed (or stored) payload and the codec that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub codec: Codec,
    pub data: Vec<u8>,
}

/// Checksums of an uncompressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentDigest {
    pub crc32: u32,
    pub sha256: [u8; 32],
}

impl ContentDigest {
    pub fn of(bytes: &[u8]) -> Self {
        let mut crc = Crc32Hasher::new();
        crc.update(bytes);
        Self { crc32: crc.finalize(), sha256: Sha256::digest(bytes).into() }
    }
}

pub fn check_level(level: u32) -> Result<(), ArchiverError> {
    if level > MAX_LEVEL {
        return Err(ArchiverError::InvalidOptions(format!(
            "compression level {level} is outside 0-{MAX_LEVEL}"
        )));
    }
    Ok(())
}

/// Compresses `bytes` at `level`.
///
/// Level 0, empty input and any result that is not strictly smaller than the input
/// come back as a `Store` block holding the original bytes.
pub fn compress(bytes: Vec<u8>, level: u32) -> Result<Block, ArchiverError> {
    check_level(level)?;
    if level == 0 || bytes.is_empty() {
        return Ok(Block { codec: Codec::Store, data: bytes });
    }

    let mut encoder = DeflateEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::new(level));
    encoder.write_all(&bytes)?;
    let packed = encoder.finish()?;

    if packed.len() < bytes.len() {
        Ok(Block { codec: Codec::Deflate, data: packed })
    } else {
        Ok(Block { codec: Codec::Store, data: bytes })
    }
}

/// Restores the payload of a block.
///
/// `expected_size` is the recorded original size; `max_size` is the safety bound.
/// Malformed or truncated streams, trailing garbage, size disagreements and output
/// beyond either bound are all `CorruptBlock`. Content checksums are the caller's job.
pub fn decompress(codec: Codec, data: &[u8], expected_size: u64, max_size: u64) -> Result<Vec<u8>, ArchiverError> {
    if expected_size > max_size {
        return Err(ArchiverError::CorruptBlock(format!(
            "declared size {expected_size} exceeds the {max_size} byte limit"
        )));
    }
    match codec {
        Codec::Store => {
            if data.len() as u64 != expected_size {
                return Err(ArchiverError::CorruptBlock(format!(
                    "stored block holds {} bytes, expected {expected_size}",
                    data.len()
                )));
            }
            Ok(data.to_vec())
        }
        Codec::Deflate => inflate(data, expected_size),
    }
}

fn inflate(data: &[u8], cap: u64) -> Result<Vec<u8>, ArchiverError> {
    // One byte of headroom so that overshooting the cap is observable.
    let limit = usize::try_from(cap)
        .ok()
        .and_then(|c| c.checked_add(1))
        .ok_or_else(|| ArchiverError::CorruptBlock("block too large for this platform".into()))?;

    let mut inflater = Decompress::new(false);
    let mut out = Vec::with_capacity(limit.min(INITIAL_OUTPUT));

    loop {
        let consumed = inflater.total_in() as usize;
        let produced = out.len();
        let status = inflater
            .decompress_vec(&data[consumed..], &mut out, FlushDecompress::None)
            .map_err(|e| ArchiverError::CorruptBlock(format!("deflate stream: {e}")))?;

        if out.len() as u64 > cap {
            return Err(ArchiverError::CorruptBlock(format!("block inflates beyond {cap} bytes")));
        }
        if status == Status::StreamEnd {
            break;
        }

        if out.len() == out.capacity() {
            let target = (out.capacity() * 2).max(INITIAL_OUTPUT).min(limit);
            out.reserve_exact(target - out.len());
            continue;
        }

        let progressed = inflater.total_in() as usize != consumed || out.len() != produced;
        if !progressed || inflater.total_in() as usize >= data.len() {
            return Err(ArchiverError::CorruptBlock("truncated deflate stream".into()));
        }
    }

    if (inflater.total_in() as usize) != data.len() {
        return Err(ArchiverError::CorruptBlock("trailing bytes after deflate stream".into()));
    }
    if out.len() as u64 != cap {
        return Err(ArchiverError::CorruptBlock(format!(
            "block inflated to {} bytes, expected {cap}",
            out.len()
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn text(n: usize) -> Vec<u8> {
        b"minecraft:stone minecraft:dirt ".iter().copied().cycle().take(n).collect()
    }

    #[test]
    fn compressible_data_uses_deflate() {
        let raw = text(64 * 1024);
        let block = compress(raw.clone(), 6).unwrap();
        assert_eq!(block.codec, Codec::Deflate);
        assert!(block.data.len() < raw.len());
        let back = decompress(block.codec, &block.data, raw.len() as u64, DEFAULT_MAX_ENTRY_SIZE).unwrap();
        assert_eq!(back, raw);
    }

    #[test]
    fn incompressible_data_falls_back_to_store() {
        let mut raw = vec![0u8; 256 * 1024];
        rand::thread_rng().fill_bytes(&mut raw);
        let block = compress(raw.clone(), 9).unwrap();
        assert_eq!(block.codec, Codec::Store);
        assert_eq!(block.data, raw);
    }

    #[test]
    fn level_zero_stores() {
        let raw = text(4096);
        let block = compress(raw.clone(), 0).unwrap();
        assert_eq!(block, Block { codec: Codec::Store, data: raw });
    }

    #[test]
    fn out_of_range_level_is_rejected() {
        assert!(matches!(compress(text(10), 12), Err(ArchiverError::InvalidOptions(_))));
    }

    #[test]
    fn truncated_stream_is_corrupt() {
        let raw = text(100_000);
        let block = compress(raw.clone(), 6).unwrap();
        let cut = &block.data[..block.data.len() / 2];
        assert!(matches!(
            decompress(Codec::Deflate, cut, raw.len() as u64, DEFAULT_MAX_ENTRY_SIZE),
            Err(ArchiverError::CorruptBlock(_))
        ));
    }

    #[test]
    fn malformed_stream_is_corrupt() {
        // BFINAL set with the reserved block type 11.
        assert!(matches!(
            decompress(Codec::Deflate, &[0xFF; 16], 16, DEFAULT_MAX_ENTRY_SIZE),
            Err(ArchiverError::CorruptBlock(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_corrupt() {
        let raw = text(10_000);
        let mut block = compress(raw.clone(), 6).unwrap();
        block.data.extend_from_slice(b"junk");
        assert!(matches!(
            decompress(Codec::Deflate, &block.data, raw.len() as u64, DEFAULT_MAX_ENTRY_SIZE),
            Err(ArchiverError::CorruptBlock(_))
        ));
    }

    #[test]
    fn tiny_compressible_input_shrinks() {
        let block = compress(b"aaaaaaaaaa".to_vec(), 6).unwrap();
        assert_eq!(block.codec, Codec::Deflate);
        assert!(block.data.len() < 10);
    }

    #[test]
    fn inflation_beyond_bound_is_rejected() {
        let raw = vec![0u8; 8 * 1024 * 1024];
        let block = compress(raw, 9).unwrap();
        // Index lies about the size: the stream would blow far past it.
        assert!(matches!(
            decompress(Codec::Deflate, &block.data, 1000, DEFAULT_MAX_ENTRY_SIZE),
            Err(ArchiverError::CorruptBlock(_))
        ));
        // Honest size but a tight safety bound.
        assert!(matches!(
            decompress(Codec::Deflate, &block.data, 8 * 1024 * 1024, 1024),
            Err(ArchiverError::CorruptBlock(_))
        ));
    }

    #[test]
    fn stored_size_mismatch_is_corrupt() {
        assert!(decompress(Codec::Store, b"abc", 4, DEFAULT_MAX_ENTRY_SIZE).is_err());
        assert_eq!(decompress(Codec::Store, b"abc", 3, DEFAULT_MAX_ENTRY_SIZE).unwrap(), b"abc");
    }

    #[test]
    fn digest_matches_known_values() {
        let d = ContentDigest::of(b"hello world");
        assert_eq!(d.crc32, 0x0d4a_1185);
        assert_eq!(
            hex::encode(d.sha256),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
