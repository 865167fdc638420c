use tether_core::transport::Socket as TransportSocket;
use tether_peer::PeerState;

use super::Host;
use crate::event_types::Event;

impl<S: TransportSocket> Host<S> {
    /// Returns the next pending event without touching the socket.
    ///
    /// Handshake completions become [`Event::Connect`], zombie peers become
    /// [`Event::Disconnect`] (and are reset), and connected peers with assembled packets
    /// yield one [`Event::Receive`] per call.
    pub fn check_events(&mut self) -> Option<Event> {
        while let Some(index) = self.context.pop_dispatch() {
            self.peers[index].mark_dispatched();
            let handle = self.handle_for(index);
            let peer = &mut self.peers[index];

            match peer.state() {
                PeerState::ConnectionPending | PeerState::ConnectionSucceeded => {
                    peer.change_state(&mut self.context, PeerState::Connected);
                    return Some(Event::Connect { peer: handle, data: peer.event_data() });
                }
                PeerState::Zombie => {
                    self.context.recalculate_bandwidth_limits = true;
                    let data = peer.event_data();
                    peer.reset(&mut self.context);
                    return Some(Event::Disconnect { peer: handle, data });
                }
                PeerState::Connected => {
                    let Some((channel_id, packet)) = peer.receive() else {
                        continue;
                    };
                    if peer.dispatched_count() > 0 {
                        peer.schedule_dispatch(&mut self.context);
                    }
                    return Some(Event::Receive { peer: handle, channel_id, data: 0, packet });
                }
                _ => {}
            }
        }
        None
    }
}
