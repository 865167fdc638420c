//! Compression of the command block.
//!
//! The host hands a compressor the encoded commands of a datagram. If the compressor
//! returns something smaller, the datagram carries the compressed block and sets the
//! compressed header flag; otherwise the datagram goes out as is.

use std::io::{Read, Write};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use tether_core::config::CompressionAlgorithm;
use tracing::trace;

/// Transforms command blocks before transmission and after reception.
pub trait Compressor: Send {
    /// Compresses `input`. Returns `None` when the result would not be smaller.
    fn compress(&mut self, input: &[u8]) -> Option<Vec<u8>>;

    /// Expands `input`. Returns `None` on corrupt data or when the output would exceed `limit`.
    fn decompress(&mut self, input: &[u8], limit: usize) -> Option<Vec<u8>>;
}

/// Zlib compressor (balanced speed/ratio).
#[derive(Debug, Clone, Copy)]
pub struct ZlibCompressor {
    level: Compression,
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self { level: Compression::default() }
    }
}

impl ZlibCompressor {
    /// Compressor using the given zlib level (0-9).
    pub fn with_level(level: u32) -> Self {
        Self { level: Compression::new(level) }
    }
}

impl Compressor for ZlibCompressor {
    fn compress(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(input.len()), self.level);
        encoder.write_all(input).ok()?;
        let compressed = encoder.finish().ok()?;
        (compressed.len() < input.len()).then_some(compressed)
    }

    fn decompress(&mut self, input: &[u8], limit: usize) -> Option<Vec<u8>> {
        let mut output = Vec::new();
        ZlibDecoder::new(input).take(limit as u64 + 1).read_to_end(&mut output).ok()?;
        if output.len() > limit {
            trace!(limit, "zlib block exceeds decompression limit");
            return None;
        }
        Some(output)
    }
}

/// LZ4 block compressor (fast, lower ratio). The block carries its original size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn compress(&mut self, input: &[u8]) -> Option<Vec<u8>> {
        let compressed = lz4::block::compress(input, None, true).ok()?;
        (compressed.len() < input.len()).then_some(compressed)
    }

    fn decompress(&mut self, input: &[u8], limit: usize) -> Option<Vec<u8>> {
        if input.len() < 4 {
            return None;
        }
        let original = u32::from_le_bytes([input[0], input[1], input[2], input[3]]) as usize;
        if original > limit {
            trace!(original, limit, "lz4 block exceeds decompression limit");
            return None;
        }
        lz4::block::decompress(input, None).ok()
    }
}

/// Builds the compressor selected by configuration.
pub fn compressor_for(algorithm: CompressionAlgorithm) -> Option<Box<dyn Compressor>> {
    match algorithm {
        CompressionAlgorithm::None => None,
        CompressionAlgorithm::Zlib => Some(Box::new(ZlibCompressor::default())),
        CompressionAlgorithm::Lz4 => Some(Box::new(Lz4Compressor)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPETITIVE: &[u8] =
        b"command command command command command command command command command command";

    #[test]
    fn test_zlib_shrinks_repetitive_block() {
        let mut compressor = ZlibCompressor::default();
        let compressed = compressor.compress(REPETITIVE).unwrap();
        assert!(compressed.len() < REPETITIVE.len());
        assert_eq!(compressor.decompress(&compressed, 4096).unwrap(), REPETITIVE);
    }

    #[test]
    fn test_lz4_shrinks_repetitive_block() {
        let mut compressor = Lz4Compressor;
        let compressed = compressor.compress(REPETITIVE).unwrap();
        assert!(compressed.len() < REPETITIVE.len());
        assert_eq!(compressor.decompress(&compressed, 4096).unwrap(), REPETITIVE);
    }

    #[test]
    fn test_incompressible_block_is_declined() {
        let mut compressor = ZlibCompressor::default();
        assert!(compressor.compress(b"a1").is_none());
    }

    #[test]
    fn test_decompress_respects_limit() {
        let mut zlib = ZlibCompressor::default();
        let compressed = zlib.compress(REPETITIVE).unwrap();
        assert!(zlib.decompress(&compressed, 10).is_none());

        let mut lz4 = Lz4Compressor;
        let compressed = lz4.compress(REPETITIVE).unwrap();
        assert!(lz4.decompress(&compressed, 10).is_none());
    }

    #[test]
    fn test_garbage_is_rejected() {
        let mut zlib = ZlibCompressor::default();
        assert!(zlib.decompress(&[0xFF, 0x00, 0x13], 4096).is_none());
    }

    #[test]
    fn test_compressor_for_config() {
        assert!(compressor_for(CompressionAlgorithm::None).is_none());
        assert!(compressor_for(CompressionAlgorithm::Zlib).is_some());
        assert!(compressor_for(CompressionAlgorithm::Lz4).is_some());
    }
}
