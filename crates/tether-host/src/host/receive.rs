//! Incoming side of the service tick: routing datagrams to peers and accepting new ones.

use std::{
    io,
    mem,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use tether_core::{
    constants::{MAX_CHANNEL_COUNT, MAX_MTU, MAX_PEER_ID, MIN_CHANNEL_COUNT},
    interceptor::InterceptAction,
    transport::Socket as TransportSocket,
};
use tether_peer::PeerState;
use tether_protocol::{
    command_codec::{checksum, CHECKSUM_SIZE},
    CommandDecoder, ConnectParams, ProtocolCommand, ProtocolHeader,
};
use tracing::{error, trace, warn};

use super::Host;

/// Upper bound on datagrams read in one receive phase.
const MAX_DATAGRAMS_PER_RECEIVE: usize = 256;

impl<S: TransportSocket> Host<S> {
    pub(super) fn receive_incoming_commands(&mut self) {
        let mut buffer = mem::take(&mut self.receive_buffer);
        for _ in 0..MAX_DATAGRAMS_PER_RECEIVE {
            let (length, address) = match self.socket.receive_packet(&mut buffer) {
                Ok((payload, address)) => (payload.len(), address),
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("Encountered an error receiving data: {:?}", e);
                    }
                    break;
                }
            };
            self.statistics.total_received_data += length as u64;
            self.statistics.total_received_packets += 1;

            let datagram = &mut buffer[..length];
            if self.interceptor.on_receive(&address, datagram) == InterceptAction::Process {
                self.handle_datagram(address, datagram);
            }
            if self.socket.is_blocking_mode() {
                break;
            }
        }
        self.receive_buffer = buffer;
    }

    /// Finds the peer a datagram is addressed to. `Ok(None)` means no peer is assigned yet,
    /// `Err(())` that the datagram must be dropped.
    fn route(&self, address: SocketAddr, header: &ProtocolHeader) -> Result<Option<usize>, ()> {
        if header.peer_id == MAX_PEER_ID {
            return Ok(None);
        }
        let index = header.peer_id as usize;
        let Some(peer) = self.peers.get(index) else {
            return Err(());
        };
        if peer.state().is_idle() {
            return Err(());
        }
        let address_matches = peer.address().is_some_and(|known| {
            known == address || known.ip() == IpAddr::V4(Ipv4Addr::BROADCAST)
        });
        if !address_matches {
            return Err(());
        }
        if peer.outgoing_peer_id() < MAX_PEER_ID && header.session_id != peer.incoming_session_id() {
            return Err(());
        }
        Ok(Some(index))
    }

    fn handle_datagram(&mut self, address: SocketAddr, data: &mut [u8]) {
        let (header, header_size) = match ProtocolHeader::decode(data) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%address, %err, "dropping datagram");
                return;
            }
        };
        let body_offset = header_size + if self.checksum.is_some() { CHECKSUM_SIZE } else { 0 };
        if data.len() < body_offset {
            warn!(%address, length = data.len(), "dropping datagram shorter than its header");
            return;
        }

        let Ok(mut peer_index) = self.route(address, &header) else {
            trace!(%address, peer_id = header.peer_id, "dropping datagram for unknown or stale peer");
            return;
        };

        let mut decompressed;
        let datagram: &mut [u8] = if header.compressed {
            let Some(compressor) = self.compressor.as_mut() else {
                warn!(%address, "dropping compressed datagram, no compressor configured");
                return;
            };
            let limit = MAX_MTU as usize - body_offset;
            let Some(body) = compressor.decompress(&data[body_offset..], limit) else {
                warn!(%address, "dropping datagram that failed to decompress");
                return;
            };
            decompressed = Vec::with_capacity(body_offset + body.len());
            decompressed.extend_from_slice(&data[..body_offset]);
            decompressed.extend_from_slice(&body);
            &mut decompressed
        } else {
            data
        };

        if let Some(checksum_fn) = self.checksum {
            let seed = peer_index.map_or(0, |index| self.peers[index].connect_id());
            if !checksum::verify(datagram, header_size, seed, checksum_fn) {
                warn!(%address, "dropping datagram with checksum mismatch");
                return;
            }
        }

        if let Some(index) = peer_index {
            self.peers[index].record_datagram_received(address, datagram.len());
        }

        let commands = match CommandDecoder::decode_commands(&datagram[body_offset..]) {
            Ok(commands) => commands,
            Err(err) => {
                warn!(%address, %err, "dropping malformed datagram");
                return;
            }
        };

        for decoded in commands {
            let command = decoded.command;
            let index = match peer_index {
                Some(index) => {
                    let result =
                        self.peers[index].handle_command(&mut self.context, &command, decoded.payload);
                    if let Err(err) = result {
                        warn!(peer = index, %err, "discarding rest of datagram");
                        return;
                    }
                    index
                }
                None => {
                    let ProtocolCommand::Connect { params, data } = command.body else {
                        trace!(%address, kind = ?command.kind(), "command without a peer");
                        return;
                    };
                    let Some(index) = self.handle_connect(address, &params, data) else {
                        return;
                    };
                    peer_index = Some(index);
                    index
                }
            };

            if !self.peers[index].acknowledge_received(&command, header.sent_time) {
                return;
            }
        }
    }

    /// Accepts a CONNECT into a free slot, returning the slot index.
    ///
    /// Rejects channel counts outside the protocol range, repeated CONNECTs of a peer that
    /// is already being served, and connections beyond the per-IP duplicate limit.
    fn handle_connect(&mut self, address: SocketAddr, params: &ConnectParams, data: u32) -> Option<usize> {
        let channel_count = params.channel_count as usize;
        if !(MIN_CHANNEL_COUNT..=MAX_CHANNEL_COUNT).contains(&channel_count) {
            warn!(%address, channel_count, "rejecting connect with invalid channel count");
            return None;
        }

        let mut slot = None;
        let mut duplicates = 0;
        for peer in &self.peers {
            match peer.state() {
                PeerState::Disconnected => {
                    slot = slot.or(Some(peer.index()));
                }
                PeerState::Connecting => {}
                _ => {
                    let Some(known) = peer.address() else { continue };
                    if known.ip() != address.ip() {
                        continue;
                    }
                    if known.port() == address.port() && peer.connect_id() == params.connect_id {
                        trace!(%address, "ignoring repeated connect");
                        return None;
                    }
                    duplicates += 1;
                }
            }
        }

        let Some(index) = slot else {
            warn!(%address, "rejecting connect, no free peer slot");
            return None;
        };
        if duplicates >= self.context.duplicate_peers {
            warn!(%address, duplicates, "rejecting connect, too many peers from this address");
            return None;
        }

        let channel_count = channel_count.min(self.context.channel_limit);
        self.peers[index].accept_connect(&mut self.context, address, params, channel_count, data);
        self.acquire_slot(index);
        Some(index)
    }
}
