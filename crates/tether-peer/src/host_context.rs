//! Host-wide state that peer operations read and update.
//!
//! Peers never reach back into the host that owns them. Anything host-scoped a peer
//! operation needs (configured limits, the current service time, the connected peer
//! counters, the dispatch queue) is passed in as a `&mut HostContext`.

use tether_core::{
    config::Config,
    ordered_queue::{NodeId, QueueArena, QueueId},
};

/// Host-scoped state shared with peer operations.
#[derive(Debug)]
pub struct HostContext {
    /// MTU new peers start from
    pub mtu: u32,
    /// Channels a peer may open
    pub channel_limit: usize,
    /// Host incoming bandwidth in bytes/sec (0 = unlimited)
    pub incoming_bandwidth: u32,
    /// Host outgoing bandwidth in bytes/sec (0 = unlimited)
    pub outgoing_bandwidth: u32,
    /// Largest application packet accepted
    pub maximum_packet_size: usize,
    /// Largest amount of undelivered data a peer may hold
    pub maximum_waiting_data: usize,
    /// Connections allowed from one IP address
    pub duplicate_peers: usize,
    /// Whether datagrams carry a checksum slot
    pub checksum_enabled: bool,
    /// Current wrapping service time in milliseconds
    pub service_time: u32,
    /// Peers in the connected or disconnect-later state
    pub connected_peers: usize,
    /// Connected peers that advertised a nonzero incoming bandwidth
    pub bandwidth_limited_peers: usize,
    /// Set when bandwidth limits must be recomputed and announced
    pub recalculate_bandwidth_limits: bool,
    dispatch: QueueArena<usize>,
    dispatch_queue: QueueId,
}

impl HostContext {
    /// Creates the context for a host built from a validated `config`.
    pub fn new(config: &Config) -> Self {
        let mut dispatch = QueueArena::new();
        let dispatch_queue = dispatch.create_queue();
        HostContext {
            mtu: config.mtu,
            channel_limit: config.channel_limit,
            incoming_bandwidth: config.incoming_bandwidth,
            outgoing_bandwidth: config.outgoing_bandwidth,
            maximum_packet_size: config.maximum_packet_size,
            maximum_waiting_data: config.maximum_waiting_data,
            duplicate_peers: config.duplicate_peers,
            checksum_enabled: config.use_checksums,
            service_time: 0,
            connected_peers: 0,
            bandwidth_limited_peers: 0,
            recalculate_bandwidth_limits: false,
            dispatch,
            dispatch_queue,
        }
    }

    pub(crate) fn enqueue_dispatch(&mut self, peer_index: usize) -> NodeId {
        self.dispatch.push_back(self.dispatch_queue, peer_index)
    }

    pub(crate) fn cancel_dispatch(&mut self, node: NodeId) {
        self.dispatch.remove(node);
    }

    /// Takes the next peer index waiting for event dispatch.
    ///
    /// The caller must follow up with [`Peer::mark_dispatched`](crate::Peer::mark_dispatched).
    pub fn pop_dispatch(&mut self) -> Option<usize> {
        self.dispatch.pop_front(self.dispatch_queue)
    }

    /// True when some peer waits for event dispatch.
    pub fn has_pending_dispatch(&self) -> bool {
        !self.dispatch.is_empty(self.dispatch_queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_queue_is_fifo() {
        let mut context = HostContext::new(&Config::default());
        assert!(!context.has_pending_dispatch());
        context.enqueue_dispatch(3);
        let cancelled = context.enqueue_dispatch(1);
        context.enqueue_dispatch(2);
        context.cancel_dispatch(cancelled);

        assert_eq!(context.pop_dispatch(), Some(3));
        assert_eq!(context.pop_dispatch(), Some(2));
        assert_eq!(context.pop_dispatch(), None);
    }
}
