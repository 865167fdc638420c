//! Checksum slot of the datagram header.
//!
//! When checksums are enabled a 4-byte slot follows the header. The sender fills the
//! slot with a seed (the peer's connect ID, or zero before one is known), checksums the
//! whole uncompressed datagram, and overwrites the slot with the result. The receiver
//! reverses the process.

use crc32fast::Hasher;

/// Size of the checksum slot.
pub const CHECKSUM_SIZE: usize = 4;

/// Checksum over a set of buffers, taken in order.
pub type ChecksumFn = fn(&[&[u8]]) -> u32;

/// CRC32 over the concatenation of `buffers`.
pub fn crc32(buffers: &[&[u8]]) -> u32 {
    let mut hasher = Hasher::new();
    for buffer in buffers {
        hasher.update(buffer);
    }
    hasher.finalize()
}

/// Seeds the slot at `offset`, checksums `datagram`, and stores the result in the slot.
pub fn seal(datagram: &mut [u8], offset: usize, seed: u32, checksum: ChecksumFn) {
    let slot = offset..offset + CHECKSUM_SIZE;
    datagram[slot.clone()].copy_from_slice(&seed.to_be_bytes());
    let value = checksum(&[datagram]);
    datagram[slot].copy_from_slice(&value.to_be_bytes());
}

/// Verifies a sealed datagram. The slot is left holding the seed.
pub fn verify(datagram: &mut [u8], offset: usize, seed: u32, checksum: ChecksumFn) -> bool {
    let slot = offset..offset + CHECKSUM_SIZE;
    if datagram.len() < slot.end {
        return false;
    }
    let mut received = [0u8; CHECKSUM_SIZE];
    received.copy_from_slice(&datagram[slot.clone()]);
    datagram[slot].copy_from_slice(&seed.to_be_bytes());
    checksum(&[datagram]) == u32::from_be_bytes(received)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed(seed: u32) -> Vec<u8> {
        let mut datagram = vec![0x80, 0x01, 0x12, 0x34, 0, 0, 0, 0, 5, 0xFF, 0, 1];
        seal(&mut datagram, 4, seed, crc32);
        datagram
    }

    #[test]
    fn test_seal_and_verify() {
        let mut datagram = sealed(0xDEAD_BEEF);
        assert!(verify(&mut datagram, 4, 0xDEAD_BEEF, crc32));
    }

    #[test]
    fn test_wrong_seed_fails() {
        let mut datagram = sealed(7);
        assert!(!verify(&mut datagram, 4, 8, crc32));
    }

    #[test]
    fn test_corruption_detected() {
        let mut datagram = sealed(7);
        let last = datagram.len() - 1;
        datagram[last] ^= 0x01;
        assert!(!verify(&mut datagram, 4, 7, crc32));
    }

    #[test]
    fn test_short_datagram_rejected() {
        let mut datagram = vec![0x80, 0x01, 0x00];
        assert!(!verify(&mut datagram, 2, 0, crc32));
    }

    #[test]
    fn test_crc32_spans_buffers() {
        let whole = crc32(&[b"hello world"]);
        let split = crc32(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, split);
    }
}
