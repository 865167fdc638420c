//! Protocol command types.
//!
//! Everything on the wire is a command: connecting, acknowledging, sending data,
//! pinging, adjusting bandwidth. Each command is a 4-byte [`CommandHeader`] followed by
//! the fixed fields of its kind. Commands that carry application data are followed on the
//! wire by `data_length` payload bytes, which are not part of the command size.

/// Low four bits of the command byte select the kind.
pub const COMMAND_MASK: u8 = 0x0F;
/// The receiver must acknowledge this command.
pub const FLAG_ACKNOWLEDGE: u8 = 1 << 7;
/// The command is delivered outside channel sequencing.
pub const FLAG_UNSEQUENCED: u8 = 1 << 6;
/// Size of the common command header.
pub const COMMAND_HEADER_SIZE: usize = 4;

/// Command kinds, as encoded in the low bits of the command byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    /// Placeholder; never valid on the wire
    None = 0,
    /// Acknowledges a reliable command
    Acknowledge = 1,
    /// Opens a connection
    Connect = 2,
    /// Accepts a connection
    VerifyConnect = 3,
    /// Closes a connection
    Disconnect = 4,
    /// Keep-alive
    Ping = 5,
    /// Reliable, ordered data
    SendReliable = 6,
    /// Unreliable, sequenced data
    SendUnreliable = 7,
    /// One fragment of a reliable packet
    SendFragment = 8,
    /// Unreliable data outside sequencing
    SendUnsequenced = 9,
    /// Announces bandwidth limits
    BandwidthLimit = 10,
    /// Announces throttle parameters
    ThrottleConfigure = 11,
    /// One fragment of an unreliable packet
    SendUnreliableFragment = 12,
}

/// Number of command kinds, `None` included.
pub const COMMAND_COUNT: usize = 13;

/// Encoded size of each kind, header included, indexed by kind.
pub const COMMAND_SIZES: [usize; COMMAND_COUNT] = [0, 8, 48, 44, 8, 4, 6, 8, 24, 8, 12, 16, 24];

impl CommandKind {
    /// Decodes the kind from a command byte, ignoring flag bits.
    pub fn from_command(command: u8) -> Option<CommandKind> {
        use CommandKind::*;
        Some(match command & COMMAND_MASK {
            0 => None,
            1 => Acknowledge,
            2 => Connect,
            3 => VerifyConnect,
            4 => Disconnect,
            5 => Ping,
            6 => SendReliable,
            7 => SendUnreliable,
            8 => SendFragment,
            9 => SendUnsequenced,
            10 => BandwidthLimit,
            11 => ThrottleConfigure,
            12 => SendUnreliableFragment,
            _ => return Option::None,
        })
    }

    /// Exact encoded size of a command of this kind.
    #[inline]
    pub const fn size(self) -> usize {
        COMMAND_SIZES[self as usize]
    }
}

/// Header shared by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandHeader {
    /// Kind in the low bits, `FLAG_*` bits on top
    pub command: u8,
    /// Channel the command belongs to; 0xFF for peer-scoped commands
    pub channel_id: u8,
    /// Reliable sequence number assigned when the command was queued
    pub reliable_sequence_number: u16,
}

impl CommandHeader {
    /// Kind encoded in the command byte.
    pub fn kind(&self) -> Option<CommandKind> {
        CommandKind::from_command(self.command)
    }

    /// True when the command must be acknowledged.
    pub fn is_acknowledged(&self) -> bool {
        self.command & FLAG_ACKNOWLEDGE != 0
    }

    /// True when the command bypasses channel sequencing.
    pub fn is_unsequenced(&self) -> bool {
        self.command & FLAG_UNSEQUENCED != 0
    }
}

/// Parameters exchanged by `Connect` and `VerifyConnect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectParams {
    /// The sender's peer ID, which the receiver must put in its headers
    pub outgoing_peer_id: u16,
    /// Session ID the sender expects on incoming traffic
    pub incoming_session_id: u8,
    /// Session ID the sender will stamp on outgoing traffic
    pub outgoing_session_id: u8,
    /// Proposed MTU
    pub mtu: u32,
    /// Proposed reliable window size
    pub window_size: u32,
    /// Requested channel count
    pub channel_count: u32,
    /// Sender's incoming bandwidth
    pub incoming_bandwidth: u32,
    /// Sender's outgoing bandwidth
    pub outgoing_bandwidth: u32,
    /// Throttle measurement interval
    pub packet_throttle_interval: u32,
    /// Throttle acceleration
    pub packet_throttle_acceleration: u32,
    /// Throttle deceleration
    pub packet_throttle_deceleration: u32,
    /// Random ID distinguishing this connection attempt
    pub connect_id: u32,
}

/// Fields of `SendFragment` and `SendUnreliableFragment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FragmentParams {
    /// Sequence number shared by every fragment of the packet
    pub start_sequence_number: u16,
    /// Bytes of payload following this command
    pub data_length: u16,
    /// Number of fragments the packet was split into
    pub fragment_count: u32,
    /// Index of this fragment
    pub fragment_number: u32,
    /// Length of the whole packet
    pub total_length: u32,
    /// Byte offset of this fragment in the packet
    pub fragment_offset: u32,
}

/// Kind-specific fields of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolCommand {
    /// Acknowledges a reliable command
    Acknowledge {
        /// Sequence number being acknowledged
        received_reliable_sequence_number: u16,
        /// Low 16 bits of the sent time of the acknowledged datagram
        received_sent_time: u16,
    },
    /// Opens a connection
    Connect {
        /// Negotiated parameters
        params: ConnectParams,
        /// Application data delivered with the connect event
        data: u32,
    },
    /// Accepts a connection
    VerifyConnect(ConnectParams),
    /// Closes a connection
    Disconnect {
        /// Application data delivered with the disconnect event
        data: u32,
    },
    /// Keep-alive
    Ping,
    /// Reliable, ordered data
    SendReliable {
        /// Payload length
        data_length: u16,
    },
    /// Unreliable, sequenced data
    SendUnreliable {
        /// Position in the channel's unreliable sequence
        unreliable_sequence_number: u16,
        /// Payload length
        data_length: u16,
    },
    /// One fragment of a reliable packet
    SendFragment(FragmentParams),
    /// Unreliable data outside sequencing
    SendUnsequenced {
        /// Group used for duplicate suppression
        unsequenced_group: u16,
        /// Payload length
        data_length: u16,
    },
    /// Announces bandwidth limits
    BandwidthLimit {
        /// Sender's incoming bandwidth
        incoming_bandwidth: u32,
        /// Sender's outgoing bandwidth
        outgoing_bandwidth: u32,
    },
    /// Announces throttle parameters
    ThrottleConfigure {
        /// Throttle measurement interval
        packet_throttle_interval: u32,
        /// Throttle acceleration
        packet_throttle_acceleration: u32,
        /// Throttle deceleration
        packet_throttle_deceleration: u32,
    },
    /// One fragment of an unreliable packet
    SendUnreliableFragment(FragmentParams),
}

impl ProtocolCommand {
    /// Kind of this command.
    pub fn kind(&self) -> CommandKind {
        match self {
            ProtocolCommand::Acknowledge { .. } => CommandKind::Acknowledge,
            ProtocolCommand::Connect { .. } => CommandKind::Connect,
            ProtocolCommand::VerifyConnect(_) => CommandKind::VerifyConnect,
            ProtocolCommand::Disconnect { .. } => CommandKind::Disconnect,
            ProtocolCommand::Ping => CommandKind::Ping,
            ProtocolCommand::SendReliable { .. } => CommandKind::SendReliable,
            ProtocolCommand::SendUnreliable { .. } => CommandKind::SendUnreliable,
            ProtocolCommand::SendFragment(_) => CommandKind::SendFragment,
            ProtocolCommand::SendUnsequenced { .. } => CommandKind::SendUnsequenced,
            ProtocolCommand::BandwidthLimit { .. } => CommandKind::BandwidthLimit,
            ProtocolCommand::ThrottleConfigure { .. } => CommandKind::ThrottleConfigure,
            ProtocolCommand::SendUnreliableFragment(_) => CommandKind::SendUnreliableFragment,
        }
    }

    /// Length of the payload that follows this command on the wire.
    pub fn data_length(&self) -> usize {
        match self {
            ProtocolCommand::SendReliable { data_length }
            | ProtocolCommand::SendUnreliable { data_length, .. }
            | ProtocolCommand::SendUnsequenced { data_length, .. } => *data_length as usize,
            ProtocolCommand::SendFragment(fragment)
            | ProtocolCommand::SendUnreliableFragment(fragment) => fragment.data_length as usize,
            _ => 0,
        }
    }

    /// Fragment fields, for the two fragment kinds.
    pub fn fragment(&self) -> Option<&FragmentParams> {
        match self {
            ProtocolCommand::SendFragment(fragment)
            | ProtocolCommand::SendUnreliableFragment(fragment) => Some(fragment),
            _ => None,
        }
    }
}

/// A complete command: header plus kind-specific fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    /// Common header
    pub header: CommandHeader,
    /// Kind-specific fields
    pub body: ProtocolCommand,
}

impl Command {
    /// Builds a command whose command byte is the body's kind plus `flags`.
    ///
    /// The reliable sequence number is assigned later, when the command is queued.
    pub fn new(flags: u8, channel_id: u8, body: ProtocolCommand) -> Self {
        Command {
            header: CommandHeader {
                command: body.kind() as u8 | flags,
                channel_id,
                reliable_sequence_number: 0,
            },
            body,
        }
    }

    /// Kind of this command.
    #[inline]
    pub fn kind(&self) -> CommandKind {
        self.body.kind()
    }

    /// Exact encoded size, payload excluded.
    #[inline]
    pub fn size(&self) -> usize {
        self.kind().size()
    }
}
