#![warn(missing_docs)]

//! tether-protocol: wire commands, datagram codec, and application packets.

/// Protocol command types.
pub mod command;
/// Command serialization and deserialization.
pub mod command_codec;
/// Application packets and reference-counted claims on them.
pub mod packet;

pub use command::{
    Command, CommandHeader, CommandKind, ConnectParams, FragmentParams, ProtocolCommand,
};
pub use command_codec::{CommandDecoder, CommandEncoder, DecodedCommand, ProtocolHeader};
pub use packet::{Packet, PacketFlags, PacketRef};
