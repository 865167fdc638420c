//! Host-wide bandwidth throttle.
//!
//! Once per throttle interval the host shares its outgoing bandwidth among the connected
//! peers. Peers whose advertised incoming bandwidth cannot absorb their share of the traffic
//! get a lower packet throttle limit first; the rest split what remains. When the host's
//! limits or peer set changed, every connected peer is also told which incoming bandwidth
//! to assume for this host through a `BANDWIDTH_LIMIT` command.

use tether_core::constants::PEER_PACKET_THROTTLE_SCALE;
use tether_peer::{HostContext, Peer};

const SCALE: u64 = PEER_PACKET_THROTTLE_SCALE as u64;

fn throttle_for(data_total: u64, bandwidth: u64) -> u64 {
    if data_total <= bandwidth {
        SCALE
    } else {
        bandwidth.saturating_mul(SCALE) / data_total
    }
}

/// Recomputes packet throttle limits for the `elapsed_time` milliseconds since the last pass.
///
/// Runs at `context.service_time`; per-peer epochs equal to it mark peers already handled.
pub(crate) fn throttle_bandwidth(peers: &mut [Peer], context: &mut HostContext, elapsed_time: u32) {
    let now = context.service_time;
    let elapsed = elapsed_time as u64;
    let mut peers_remaining = context.connected_peers;
    if peers_remaining == 0 {
        return;
    }

    let (mut data_total, mut bandwidth) = if context.outgoing_bandwidth != 0 {
        let data_total = peers
            .iter()
            .filter(|peer| peer.state().is_connected())
            .map(|peer| peer.bandwidth.outgoing_data_total as u64)
            .sum();
        (data_total, context.outgoing_bandwidth as u64 * elapsed / 1000)
    } else {
        (u64::MAX, u64::MAX)
    };

    let mut needs_adjustment = context.bandwidth_limited_peers > 0;
    while peers_remaining > 0 && needs_adjustment {
        needs_adjustment = false;
        let throttle = throttle_for(data_total, bandwidth);

        for peer in peers.iter_mut() {
            if !peer.state().is_connected()
                || peer.bandwidth.incoming_bandwidth == 0
                || peer.bandwidth.outgoing_bandwidth_throttle_epoch == now
            {
                continue;
            }

            let peer_bandwidth = peer.bandwidth.incoming_bandwidth as u64 * elapsed / 1000;
            let outgoing = peer.bandwidth.outgoing_data_total as u64;
            if throttle * outgoing / SCALE <= peer_bandwidth {
                continue;
            }

            let limit = (peer_bandwidth * SCALE / outgoing).max(1);
            peer.congestion.set_limit(limit as u32);
            peer.bandwidth.outgoing_bandwidth_throttle_epoch = now;
            peer.bandwidth.incoming_data_total = 0;
            peer.bandwidth.outgoing_data_total = 0;
            tracing::trace!(peer = peer.index(), limit, "peer bandwidth throttled");

            needs_adjustment = true;
            peers_remaining = peers_remaining.saturating_sub(1);
            bandwidth = bandwidth.saturating_sub(peer_bandwidth);
            data_total = data_total.saturating_sub(peer_bandwidth);
        }
    }

    if peers_remaining > 0 {
        let throttle = throttle_for(data_total, bandwidth) as u32;
        for peer in peers.iter_mut() {
            if !peer.state().is_connected() || peer.bandwidth.outgoing_bandwidth_throttle_epoch == now {
                continue;
            }
            peer.congestion.set_limit(throttle);
            peer.bandwidth.incoming_data_total = 0;
            peer.bandwidth.outgoing_data_total = 0;
        }
    }

    if context.recalculate_bandwidth_limits {
        context.recalculate_bandwidth_limits = false;
        announce_bandwidth_limits(peers, context);
    }
}

/// Splits the host's incoming bandwidth among connected peers and queues the announcements.
fn announce_bandwidth_limits(peers: &mut [Peer], context: &HostContext) {
    let now = context.service_time;
    let mut peers_remaining = context.connected_peers as u32;
    let mut bandwidth = context.incoming_bandwidth;
    let mut bandwidth_limit = 0;

    if bandwidth != 0 {
        let mut needs_adjustment = true;
        while peers_remaining > 0 && needs_adjustment {
            needs_adjustment = false;
            bandwidth_limit = bandwidth / peers_remaining;

            for peer in peers.iter_mut() {
                if !peer.state().is_connected() || peer.bandwidth.incoming_bandwidth_throttle_epoch == now {
                    continue;
                }
                let peer_outgoing = peer.bandwidth.outgoing_bandwidth;
                if peer_outgoing > 0 && peer_outgoing >= bandwidth_limit {
                    continue;
                }

                peer.bandwidth.incoming_bandwidth_throttle_epoch = now;
                needs_adjustment = true;
                peers_remaining = peers_remaining.saturating_sub(1);
                bandwidth = bandwidth.saturating_sub(peer_outgoing);
            }
        }
    }

    for peer in peers.iter_mut().filter(|peer| peer.state().is_connected()) {
        let incoming = if peer.bandwidth.incoming_bandwidth_throttle_epoch == now {
            peer.bandwidth.outgoing_bandwidth
        } else {
            bandwidth_limit
        };
        peer.queue_bandwidth_limit(incoming, context.outgoing_bandwidth);
    }
    tracing::debug!(bandwidth_limit, "bandwidth limits announced");
}
