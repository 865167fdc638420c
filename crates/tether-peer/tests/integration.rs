//! Integration tests for the tether-peer crate.
//!
//! Two peers, each with its own host context, exchange the datagrams they prepare. The
//! test plays the host: it decodes datagrams, routes CONNECT, and promotes peers that
//! finished the handshake.

use std::net::SocketAddr;

use tether_core::config::Config;
use tether_peer::{DisconnectOutcome, HostContext, Peer, PeerState};
use tether_protocol::{CommandDecoder, CommandKind, Packet, PacketFlags, ProtocolCommand};

struct Side {
    context: HostContext,
    peer: Peer,
}

impl Side {
    fn new(index: usize) -> Self {
        let mut context = HostContext::new(&Config::default());
        let peer = Peer::new(index, &mut context);
        Side { context, peer }
    }
}

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Sends one datagram from `from` to `to` at `time`. `lose` drops it on the way.
fn transmit(from: &mut Side, to: &mut Side, time: u32, lose: bool) -> Vec<CommandKind> {
    from.context.service_time = time;
    to.context.service_time = time;
    let Some(datagram) = from.peer.prepare_datagram(&mut from.context, true).unwrap() else {
        return Vec::new();
    };
    from.peer.complete_datagram(&mut from.context, datagram.size());
    if lose {
        return Vec::new();
    }

    let sent_time = datagram.needs_sent_time.then_some(time as u16);
    let mut kinds = Vec::new();
    for decoded in CommandDecoder::decode_commands(&datagram.commands).unwrap() {
        let command = decoded.command;
        kinds.push(command.kind());
        if let ProtocolCommand::Connect { params, data } = command.body {
            to.peer.accept_connect(
                &mut to.context,
                addr(1000 + from.peer.index() as u16),
                &params,
                params.channel_count as usize,
                data,
            );
        } else if to.peer.handle_command(&mut to.context, &command, decoded.payload).is_err() {
            break;
        }
        if !to.peer.acknowledge_received(&command, sent_time) {
            break;
        }
    }
    kinds
}

/// Promotes peers whose handshake completed, as the host's event dispatch does.
fn settle(side: &mut Side) -> Option<PeerState> {
    let mut reported = None;
    while side.context.pop_dispatch().is_some() {
        side.peer.mark_dispatched();
        let state = side.peer.state();
        if matches!(state, PeerState::ConnectionPending | PeerState::ConnectionSucceeded) {
            side.peer.change_state(&mut side.context, PeerState::Connected);
        }
        reported = Some(state);
    }
    reported
}

fn connected_pair() -> (Side, Side) {
    let mut client = Side::new(0);
    let mut server = Side::new(5);
    client.peer.begin_connect(&mut client.context, addr(1005), 2, 0xC0FFEE, 7);

    assert_eq!(transmit(&mut client, &mut server, 1, false), vec![CommandKind::Connect]);
    assert_eq!(transmit(&mut server, &mut client, 2, false), vec![CommandKind::VerifyConnect]);
    assert_eq!(transmit(&mut client, &mut server, 3, false), vec![CommandKind::Acknowledge]);

    assert_eq!(settle(&mut client), Some(PeerState::ConnectionSucceeded));
    assert_eq!(settle(&mut server), Some(PeerState::ConnectionPending));
    (client, server)
}

fn drain(side: &mut Side) -> Vec<(u8, Vec<u8>)> {
    std::iter::from_fn(|| side.peer.receive())
        .map(|(channel_id, packet)| (channel_id, packet.data().to_vec()))
        .collect()
}

#[test]
fn test_handshake_connects_both_sides() {
    let (client, server) = connected_pair();

    assert_eq!(client.peer.state(), PeerState::Connected);
    assert_eq!(server.peer.state(), PeerState::Connected);
    assert_eq!(client.peer.outgoing_peer_id(), 5);
    assert_eq!(server.peer.outgoing_peer_id(), 0);
    assert_eq!(client.peer.outgoing_session_id(), server.peer.incoming_session_id());
    assert_eq!(server.peer.outgoing_session_id(), client.peer.incoming_session_id());
    assert_eq!(client.peer.connect_id(), server.peer.connect_id());
    assert_eq!(client.peer.channel_count(), 2);
    assert_eq!(server.peer.channel_count(), 2);
    assert_eq!(server.peer.event_data(), 7);
    assert_eq!(client.context.connected_peers, 1);
    assert_eq!(server.context.connected_peers, 1);
    assert_eq!(client.peer.sent_reliable_commands().count(), 0);
}

#[test]
fn test_lost_reliable_data_is_retransmitted_in_order() {
    let (mut client, mut server) = connected_pair();
    let packets: Vec<Packet> = (0..5u8).map(|i| Packet::reliable(vec![i; 20])).collect();
    for packet in &packets {
        client.peer.send(&client.context, 1, packet).unwrap();
    }

    assert!(transmit(&mut client, &mut server, 10, true).is_empty());
    assert_eq!(client.peer.sent_reliable_commands().count(), 5);
    assert!(drain(&mut server).is_empty());

    let kinds = transmit(&mut client, &mut server, 510, false);
    assert_eq!(kinds, vec![CommandKind::SendReliable; 5]);
    let received = drain(&mut server);
    let expected: Vec<(u8, Vec<u8>)> = (0..5u8).map(|i| (1, vec![i; 20])).collect();
    assert_eq!(received, expected);

    transmit(&mut server, &mut client, 520, false);
    assert_eq!(client.peer.sent_reliable_commands().count(), 0);
    for packet in &packets {
        assert_eq!(packet.reference_count(), 0);
        assert!(packet.flags().contains(PacketFlags::SENT));
    }
}

#[test]
fn test_duplicate_datagram_delivers_once() {
    let (mut client, mut server) = connected_pair();
    client.peer.send(&client.context, 0, &Packet::reliable(b"once".to_vec())).unwrap();

    client.context.service_time = 10;
    let datagram = client.peer.prepare_datagram(&mut client.context, true).unwrap().unwrap();
    client.peer.complete_datagram(&mut client.context, datagram.size());

    server.context.service_time = 10;
    for _ in 0..2 {
        for decoded in CommandDecoder::decode_commands(&datagram.commands).unwrap() {
            server.peer.handle_command(&mut server.context, &decoded.command, decoded.payload).unwrap();
            server.peer.acknowledge_received(&decoded.command, Some(10));
        }
    }

    assert_eq!(drain(&mut server), vec![(0, b"once".to_vec())]);
    assert_eq!(server.peer.pending_acknowledgements(), 2);
}

#[test]
fn test_large_packet_is_fragmented_and_reassembled() {
    let (mut client, mut server) = connected_pair();
    let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    client.peer.send(&client.context, 0, &Packet::reliable(payload.clone())).unwrap();

    let mut fragments = 0;
    loop {
        let kinds = transmit(&mut client, &mut server, 20, false);
        if kinds.is_empty() {
            break;
        }
        assert_eq!(kinds, vec![CommandKind::SendFragment]);
        fragments += 1;
    }

    assert_eq!(fragments, 4);
    assert_eq!(drain(&mut server), vec![(0, payload)]);
}

#[test]
fn test_graceful_disconnect_reaches_both_sides() {
    let (mut client, mut server) = connected_pair();
    assert_eq!(client.peer.disconnect(&mut client.context, 42), DisconnectOutcome::Disconnecting);

    assert_eq!(transmit(&mut client, &mut server, 30, false), vec![CommandKind::Disconnect]);
    assert_eq!(server.peer.state(), PeerState::AcknowledgingDisconnect);

    assert_eq!(transmit(&mut server, &mut client, 31, false), vec![CommandKind::Acknowledge]);
    assert_eq!(server.peer.state(), PeerState::Zombie);
    assert_eq!(client.peer.state(), PeerState::Zombie);
    assert_eq!(server.peer.event_data(), 42);
    assert_eq!(server.context.connected_peers, 0);
    assert_eq!(client.context.connected_peers, 0);
}
