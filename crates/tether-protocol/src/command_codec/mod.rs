//! Command serialization and deserialization.
//!
//! Provides exact-size binary encoding/decoding of protocol commands and of the
//! datagram header that precedes them.
//!
//! # Module Organization
//!
//! - [`header`] - Datagram header (peer ID, session, flags, sent time)
//! - [`encoder`] - Command encoding to binary format
//! - [`decoder`] - Datagram and command decoding from binary format
//! - [`checksum`] - Checksum slot computation and verification
//! - [`compression`] - Pluggable compressors for the command block (Zlib, LZ4)

pub mod checksum;
pub mod compression;
pub mod decoder;
pub mod encoder;
pub mod header;

#[cfg(test)]
mod tests;

pub use checksum::{crc32, ChecksumFn, CHECKSUM_SIZE};
pub use compression::{compressor_for, Compressor, Lz4Compressor, ZlibCompressor};
pub use decoder::{CommandDecoder, DecodedCommand};
pub use encoder::CommandEncoder;
pub use header::ProtocolHeader;
