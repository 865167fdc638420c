//! The host: a fixed table of peer slots served over one socket.
//!
//! # Module Organization
//!
//! - [`receive`] - datagram intake, routing and the accepting side of the handshake
//! - [`send`] - datagram framing (header, checksum, compression) and the flush loop
//! - [`dispatch`] - turning ready peers into application events

mod dispatch;
mod receive;
mod send;

use std::{
    fmt,
    net::SocketAddr,
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use crossbeam_channel::{unbounded, Receiver, Sender};
use tether_core::{
    config::{clamp_channel_limit, Config},
    constants::{
        HOST_BANDWIDTH_THROTTLE_INTERVAL, MAX_CHANNEL_COUNT, MAX_MTU, MIN_CHANNEL_COUNT,
    },
    error::{ErrorKind, Result},
    interceptor::{Interceptor, NoOpInterceptor},
    time::time_difference,
    transport::Socket as TransportSocket,
};
use tether_peer::{DisconnectOutcome, HostContext, Peer, PeerState};
use tether_protocol::{
    command_codec::{compressor_for, crc32, ChecksumFn, Compressor},
    Packet,
};
use tracing::{debug, warn};

use crate::{
    bandwidth_throttle::throttle_bandwidth,
    event_types::{Event, HostCommand, PeerHandle},
    socket::UdpTransport,
    time::{service_time, Clock, SystemClock},
};

/// Traffic totals since the host was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostStatistics {
    /// Bytes handed to the socket
    pub total_sent_data: u64,
    /// Datagrams handed to the socket
    pub total_sent_packets: u64,
    /// Bytes read from the socket
    pub total_received_data: u64,
    /// Datagrams read from the socket
    pub total_received_packets: u64,
}

/// A host managing up to `peer_count` peers over a single socket.
///
/// All work happens inside [`Host::service`], [`Host::flush`] and [`Host::check_events`];
/// operations on peers only queue commands.
pub struct Host<S: TransportSocket = UdpTransport> {
    socket: S,
    clock: Arc<dyn Clock>,
    start: Instant,
    context: HostContext,
    peers: Vec<Peer>,
    generations: Vec<u32>,
    random_seed: u32,
    bandwidth_throttle_epoch: u32,
    checksum: Option<ChecksumFn>,
    compressor: Option<Box<dyn Compressor>>,
    interceptor: Box<dyn Interceptor>,
    receive_buffer: Vec<u8>,
    statistics: HostStatistics,
    event_sender: Sender<Event>,
    event_receiver: Receiver<Event>,
    command_sender: Sender<HostCommand>,
    command_receiver: Receiver<HostCommand>,
}

impl<S: TransportSocket> fmt::Debug for Host<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("context", &self.context)
            .field("peer_count", &self.peers.len())
            .field("checksum", &self.checksum.is_some())
            .field("compressor", &self.compressor.is_some())
            .field("statistics", &self.statistics)
            .finish()
    }
}

fn initial_seed() -> u32 {
    let time = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as u32);
    rand::random::<u32>().wrapping_add(time).rotate_left(16)
}

impl<S: TransportSocket> Host<S> {
    /// Creates a host serving `config.peer_count` slots over `socket`.
    pub fn with_socket(socket: S, config: Config) -> Result<Self> {
        Self::with_socket_and_clock(socket, config, Arc::new(SystemClock))
    }

    /// Creates a host with a custom clock.
    pub fn with_socket_and_clock(socket: S, config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let config = config.validate()?;
        let mut context = HostContext::new(&config);
        let peers: Vec<Peer> =
            (0..config.peer_count).map(|index| Peer::new(index, &mut context)).collect();
        let start = clock.now();
        context.service_time = service_time(start, start);

        let (event_sender, event_receiver) = unbounded();
        let (command_sender, command_receiver) = unbounded();
        debug!(
            peer_count = config.peer_count,
            channel_limit = config.channel_limit,
            checksums = config.use_checksums,
            compression = ?config.compression,
            "host created"
        );

        Ok(Host {
            socket,
            clock,
            start,
            context,
            generations: vec![0; peers.len()],
            peers,
            random_seed: initial_seed(),
            bandwidth_throttle_epoch: 0,
            checksum: config.use_checksums.then_some(crc32 as ChecksumFn),
            compressor: compressor_for(config.compression),
            interceptor: Box::new(NoOpInterceptor),
            receive_buffer: vec![0; MAX_MTU as usize],
            statistics: HostStatistics::default(),
            event_sender,
            event_receiver,
            command_sender,
            command_receiver,
        })
    }

    fn resolve(&self, handle: PeerHandle) -> Result<usize> {
        match self.generations.get(handle.index) {
            Some(&generation) if generation == handle.generation => Ok(handle.index),
            _ => Err(ErrorKind::InvalidPeer),
        }
    }

    fn handle_for(&self, index: usize) -> PeerHandle {
        PeerHandle { index, generation: self.generations[index] }
    }

    /// Hands slot `index` to a new connection, invalidating older handles to it.
    fn acquire_slot(&mut self, index: usize) -> PeerHandle {
        self.generations[index] = self.generations[index].wrapping_add(1);
        self.handle_for(index)
    }

    fn update_service_time(&mut self) {
        self.context.service_time = service_time(self.start, self.clock.now());
    }

    /// Starts a connection to `address` with `channel_count` channels (clamped to 1..=255).
    ///
    /// The connection completes with an [`Event::Connect`] for the returned handle.
    pub fn connect(&mut self, address: SocketAddr, channel_count: usize, data: u32) -> Result<PeerHandle> {
        let channel_count = channel_count.clamp(MIN_CHANNEL_COUNT, MAX_CHANNEL_COUNT);
        let Some(index) = self.peers.iter().position(|peer| peer.state() == PeerState::Disconnected)
        else {
            warn!(%address, "no free peer slot for outgoing connection");
            return Err(ErrorKind::NoAvailablePeers);
        };

        self.random_seed = self.random_seed.wrapping_add(1);
        let connect_id = self.random_seed;
        self.peers[index].begin_connect(&mut self.context, address, channel_count, connect_id, data);
        Ok(self.acquire_slot(index))
    }

    /// Queues `packet` for `peer` on `channel_id`.
    pub fn send(&mut self, peer: PeerHandle, channel_id: u8, packet: &Packet) -> Result<()> {
        let index = self.resolve(peer)?;
        self.peers[index].send(&self.context, channel_id, packet)
    }

    /// Queues `packet` for every connected peer, returning how many accepted it.
    pub fn broadcast(&mut self, channel_id: u8, packet: &Packet) -> usize {
        let context = &self.context;
        self.peers
            .iter_mut()
            .filter(|peer| peer.state() == PeerState::Connected)
            .map(|peer| peer.send(context, channel_id, packet))
            .filter(|result| result.is_ok())
            .count()
    }

    fn finish_disconnect(&mut self, index: usize, outcome: DisconnectOutcome) -> Result<()> {
        if outcome == DisconnectOutcome::FlushAndReset {
            self.flush()?;
            self.peers[index].reset(&mut self.context);
        }
        Ok(())
    }

    /// Gracefully disconnects `peer`. An [`Event::Disconnect`] follows once the remote
    /// side acknowledged, unless the handshake had not completed yet.
    pub fn disconnect(&mut self, peer: PeerHandle, data: u32) -> Result<()> {
        let index = self.resolve(peer)?;
        let outcome = self.peers[index].disconnect(&mut self.context, data);
        self.finish_disconnect(index, outcome)
    }

    /// Disconnects `peer` once its queued outgoing data has been delivered.
    pub fn disconnect_later(&mut self, peer: PeerHandle, data: u32) -> Result<()> {
        let index = self.resolve(peer)?;
        let outcome = self.peers[index].disconnect_later(&mut self.context, data);
        self.finish_disconnect(index, outcome)
    }

    /// Sends an unreliable disconnect notice and resets `peer` right away.
    ///
    /// No event is generated for the local side.
    pub fn disconnect_now(&mut self, peer: PeerHandle, data: u32) -> Result<()> {
        let index = self.resolve(peer)?;
        if self.peers[index].state() == PeerState::Disconnected {
            return Ok(());
        }
        if self.peers[index].queue_disconnect_notice(&mut self.context, data) {
            self.flush()?;
        }
        self.peers[index].reset(&mut self.context);
        Ok(())
    }

    /// Queues a ping to `peer`.
    pub fn ping(&mut self, peer: PeerHandle) -> Result<()> {
        let index = self.resolve(peer)?;
        self.peers[index].ping();
        Ok(())
    }

    /// The peer behind `handle`, unless the slot has been reused.
    pub fn peer(&self, handle: PeerHandle) -> Option<&Peer> {
        self.resolve(handle).ok().map(|index| &self.peers[index])
    }

    /// Mutable access to the peer behind `handle`, for per-peer tuning such as
    /// [`Peer::set_ping_interval`], [`Peer::set_timeout`] and [`Peer::throttle_configure`].
    pub fn peer_mut(&mut self, handle: PeerHandle) -> Option<&mut Peer> {
        self.resolve(handle).ok().map(|index| &mut self.peers[index])
    }

    /// Peers with a live or pending connection.
    pub fn peers(&self) -> impl Iterator<Item = (PeerHandle, &Peer)> + '_ {
        self.peers
            .iter()
            .filter(|peer| peer.state() != PeerState::Disconnected)
            .map(|peer| (self.handle_for(peer.index()), peer))
    }

    /// Number of peer slots.
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers in the connected or disconnect-later state.
    pub fn connected_peers(&self) -> usize {
        self.context.connected_peers
    }

    /// Limits the channels incoming connections may open. Zero selects the maximum.
    pub fn set_channel_limit(&mut self, channel_limit: usize) {
        self.context.channel_limit = clamp_channel_limit(channel_limit);
    }

    /// Channels incoming connections may open.
    pub fn channel_limit(&self) -> usize {
        self.context.channel_limit
    }

    /// Sets the host's bandwidths in bytes/sec (0 = unlimited) and announces them to
    /// every connected peer at the next throttle pass.
    pub fn set_bandwidth_limit(&mut self, incoming_bandwidth: u32, outgoing_bandwidth: u32) {
        self.context.incoming_bandwidth = incoming_bandwidth;
        self.context.outgoing_bandwidth = outgoing_bandwidth;
        self.context.recalculate_bandwidth_limits = true;
    }

    /// Replaces the command block compressor; `None` disables compression.
    pub fn set_compressor(&mut self, compressor: Option<Box<dyn Compressor>>) {
        self.compressor = compressor;
    }

    /// Replaces the datagram checksum; `None` disables checksums.
    ///
    /// Both sides must agree, since the checksum occupies a slot in every datagram.
    pub fn set_checksum(&mut self, checksum: Option<ChecksumFn>) {
        self.checksum = checksum;
        self.context.checksum_enabled = checksum.is_some();
    }

    /// Installs a hook that sees every raw datagram before decoding and after framing.
    pub fn set_interceptor(&mut self, interceptor: Option<Box<dyn Interceptor>>) {
        self.interceptor = interceptor.unwrap_or_else(|| Box::new(NoOpInterceptor));
    }

    /// Traffic totals since the host was created.
    pub fn statistics(&self) -> &HostStatistics {
        &self.statistics
    }

    /// Current wrapping service time in milliseconds.
    pub fn service_time(&self) -> u32 {
        self.context.service_time
    }

    /// Returns the local socket address this host is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends every queued command now, without receiving or checking timeouts.
    pub fn flush(&mut self) -> Result<()> {
        self.update_service_time();
        self.send_outgoing_commands(false)
    }

    fn bandwidth_throttle(&mut self) {
        let elapsed = time_difference(self.context.service_time, self.bandwidth_throttle_epoch);
        self.bandwidth_throttle_epoch = self.context.service_time;
        throttle_bandwidth(&mut self.peers, &mut self.context, elapsed);
    }

    /// Runs the service tick until an event is available or `timeout` has passed.
    ///
    /// Each round throttles bandwidth (once per second), flushes, receives, flushes again
    /// and dispatches. Between rounds the host sleeps for at most a millisecond.
    pub fn service(&mut self, timeout: Duration) -> Result<Option<Event>> {
        if let Some(event) = self.check_events() {
            return Ok(Some(event));
        }

        let deadline = self.clock.now() + timeout;
        self.update_service_time();
        loop {
            if time_difference(self.context.service_time, self.bandwidth_throttle_epoch)
                >= HOST_BANDWIDTH_THROTTLE_INTERVAL
            {
                self.bandwidth_throttle();
            }

            self.send_outgoing_commands(true)?;
            self.receive_incoming_commands();
            self.send_outgoing_commands(true)?;

            if let Some(event) = self.check_events() {
                return Ok(Some(event));
            }

            let now = self.clock.now();
            if now >= deadline {
                return Ok(None);
            }
            sleep((deadline - now).min(Duration::from_millis(1)));
            self.update_service_time();
        }
    }

    /// Returns a clone of the command sender for queueing work from other code.
    pub fn command_sender(&self) -> Sender<HostCommand> {
        self.command_sender.clone()
    }

    /// Returns a clone of the event receiver fed by [`Host::pump`].
    pub fn event_receiver(&self) -> Receiver<Event> {
        self.event_receiver.clone()
    }

    /// Applies queued [`HostCommand`]s, then services the host and forwards every event
    /// to the event channel. Returns the number of events forwarded.
    pub fn pump(&mut self, timeout: Duration) -> Result<usize> {
        while let Ok(command) = self.command_receiver.try_recv() {
            self.apply_command(command);
        }

        let mut forwarded = 0;
        let mut wait = timeout;
        while let Some(event) = self.service(wait)? {
            // The host holds a receiver, so the channel never disconnects.
            let _ = self.event_sender.send(event);
            forwarded += 1;
            wait = Duration::ZERO;
        }
        Ok(forwarded)
    }

    fn apply_command(&mut self, command: HostCommand) {
        let result = match command {
            HostCommand::Send { peer, channel_id, packet } => self.send(peer, channel_id, &packet),
            HostCommand::Broadcast { channel_id, packet } => {
                self.broadcast(channel_id, &packet);
                Ok(())
            }
            HostCommand::Disconnect { peer, data } => self.disconnect(peer, data),
        };
        if let Err(err) = result {
            warn!(%err, "queued host command rejected");
        }
    }
}
