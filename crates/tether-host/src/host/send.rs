//! Outgoing side of the service tick.

use tether_core::{
    constants::MAX_PEER_ID, error::Result, interceptor::InterceptAction,
    transport::Socket as TransportSocket,
};
use tether_peer::OutgoingDatagram;
use tether_protocol::{
    command_codec::{checksum, CHECKSUM_SIZE},
    ProtocolHeader,
};
use tracing::{error, trace};

use super::Host;

impl<S: TransportSocket> Host<S> {
    /// Sends one datagram per peer with pending commands, then further datagrams to the
    /// peers whose commands did not all fit, until every peer is drained.
    pub(super) fn send_outgoing_commands(&mut self, check_for_timeouts: bool) -> Result<()> {
        let mut send_pass = 0;
        loop {
            let mut continue_sending = false;
            for index in 0..self.peers.len() {
                let peer = &self.peers[index];
                if peer.state().is_idle() || (send_pass > 0 && !peer.continue_sending()) {
                    continue;
                }

                let Some(datagram) =
                    self.peers[index].prepare_datagram(&mut self.context, check_for_timeouts)?
                else {
                    continue;
                };
                let bytes = self.frame_datagram(index, &datagram)?;
                let sent = self.transmit(index, bytes);
                self.peers[index].complete_datagram(&mut self.context, sent);
                continue_sending |= self.peers[index].continue_sending();
            }

            if !continue_sending {
                return Ok(());
            }
            send_pass += 1;
        }
    }

    /// Puts the header, optional checksum slot and (possibly compressed) commands together.
    ///
    /// The checksum covers the uncompressed datagram, with the compressed flag already set.
    fn frame_datagram(&mut self, index: usize, datagram: &OutgoingDatagram) -> Result<Vec<u8>> {
        let peer = &self.peers[index];
        let assigned = peer.outgoing_peer_id() < MAX_PEER_ID;
        let compressed = self
            .compressor
            .as_mut()
            .and_then(|compressor| compressor.compress(&datagram.commands));

        let header = ProtocolHeader {
            peer_id: peer.outgoing_peer_id(),
            session_id: if assigned { peer.outgoing_session_id() } else { 0 },
            compressed: compressed.is_some(),
            sent_time: datagram.needs_sent_time.then_some(self.context.service_time as u16),
        };

        let mut bytes = Vec::with_capacity(datagram.size());
        header.encode_into(&mut bytes)?;
        let checksum_offset = bytes.len();
        let body_offset =
            checksum_offset + if self.checksum.is_some() { CHECKSUM_SIZE } else { 0 };
        bytes.resize(body_offset, 0);
        bytes.extend_from_slice(&datagram.commands);

        if let Some(checksum_fn) = self.checksum {
            let seed = if assigned { peer.connect_id() } else { 0 };
            checksum::seal(&mut bytes, checksum_offset, seed, checksum_fn);
        }
        if let Some(compressed) = compressed {
            bytes.truncate(body_offset);
            bytes.extend_from_slice(&compressed);
        }

        trace!(
            peer = index,
            commands = datagram.command_count,
            length = bytes.len(),
            compressed = header.compressed,
            "sending datagram"
        );
        Ok(bytes)
    }

    /// Hands a framed datagram to the interceptor and the socket. Returns the bytes sent.
    fn transmit(&mut self, index: usize, mut bytes: Vec<u8>) -> usize {
        let Some(address) = self.peers[index].address() else {
            return 0;
        };
        if self.interceptor.on_send(&address, &mut bytes) == InterceptAction::Consume {
            return bytes.len();
        }

        match self.socket.send_packet(&address, &bytes) {
            Ok(sent) => {
                self.statistics.total_sent_data += sent as u64;
                self.statistics.total_sent_packets += 1;
                sent
            }
            Err(err) => {
                error!(%address, %err, "error sending datagram");
                0
            }
        }
    }
}
