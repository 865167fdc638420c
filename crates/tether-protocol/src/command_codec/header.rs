//! Datagram header.
//!
//! Every datagram starts with a 16-bit field holding the receiver's peer ID in the low
//! 12 bits, a 2-bit session ID, and two flag bits. When the sent-time flag is set a
//! 16-bit timestamp follows; the receiver echoes it in acknowledgements.

use std::io::{self, Cursor};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use tether_core::{constants::MAX_PEER_ID, error::DecodingErrorKind};

/// The command block is compressed.
pub const HEADER_FLAG_COMPRESSED: u16 = 1 << 14;
/// A 16-bit sent time follows the peer ID field.
pub const HEADER_FLAG_SENT_TIME: u16 = 1 << 15;
/// All header flag bits.
pub const HEADER_FLAG_MASK: u16 = HEADER_FLAG_COMPRESSED | HEADER_FLAG_SENT_TIME;
/// Session ID bits.
pub const HEADER_SESSION_MASK: u16 = 3 << 12;
/// Shift of the session ID bits.
pub const HEADER_SESSION_SHIFT: u16 = 12;
/// Header size without the sent time.
pub const MIN_HEADER_SIZE: usize = 2;
/// Header size with the sent time.
pub const MAX_HEADER_SIZE: usize = 4;

/// Decoded datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProtocolHeader {
    /// Receiver's peer ID, or `MAX_PEER_ID` when none is assigned yet
    pub peer_id: u16,
    /// Session ID the datagram belongs to
    pub session_id: u8,
    /// Whether the command block is compressed
    pub compressed: bool,
    /// Low 16 bits of the sender's service time
    pub sent_time: Option<u16>,
}

impl ProtocolHeader {
    /// Encoded size of this header.
    pub fn encoded_size(&self) -> usize {
        if self.sent_time.is_some() {
            MAX_HEADER_SIZE
        } else {
            MIN_HEADER_SIZE
        }
    }

    /// Appends the encoded header to `buffer`.
    pub fn encode_into(&self, buffer: &mut Vec<u8>) -> io::Result<()> {
        let mut field = self.peer_id & MAX_PEER_ID;
        field |= ((self.session_id as u16) << HEADER_SESSION_SHIFT) & HEADER_SESSION_MASK;
        if self.compressed {
            field |= HEADER_FLAG_COMPRESSED;
        }
        if self.sent_time.is_some() {
            field |= HEADER_FLAG_SENT_TIME;
        }
        buffer.write_u16::<BigEndian>(field)?;
        if let Some(sent_time) = self.sent_time {
            buffer.write_u16::<BigEndian>(sent_time)?;
        }
        Ok(())
    }

    /// Decodes a header, returning it with its encoded size.
    pub fn decode(data: &[u8]) -> Result<(ProtocolHeader, usize), DecodingErrorKind> {
        let mut cursor = Cursor::new(data);
        let field = cursor.read_u16::<BigEndian>().map_err(|_| DecodingErrorKind::HeaderTooShort)?;
        let sent_time = if field & HEADER_FLAG_SENT_TIME != 0 {
            Some(cursor.read_u16::<BigEndian>().map_err(|_| DecodingErrorKind::HeaderTooShort)?)
        } else {
            None
        };

        let header = ProtocolHeader {
            peer_id: field & !(HEADER_FLAG_MASK | HEADER_SESSION_MASK),
            session_id: ((field & HEADER_SESSION_MASK) >> HEADER_SESSION_SHIFT) as u8,
            compressed: field & HEADER_FLAG_COMPRESSED != 0,
            sent_time,
        };
        Ok((header, cursor.position() as usize))
    }
}
