//! Simple echo server using Tether.
//!
//! Run:
//! - cargo run -p tether --example server
//! - cargo run -p tether --example server -- 127.0.0.1:7777

use std::{env, net::SocketAddr, time::Duration};

use tether::{Config, Event, Host, Packet, PacketFlags};

fn parse_bind_addr() -> Option<SocketAddr> {
    let mut args = env::args().skip(1);
    args.next().and_then(|s| s.parse().ok())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Basic config; tweak here if you want to demo features quickly
    let config = Config { peer_count: 32, ..Config::default() };
    // Try features:
    // config.compression = CompressionAlgorithm::Lz4;
    // config.use_checksums = true;
    // config.channel_limit = 4;

    let bind_addr = parse_bind_addr().unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 9000)));
    let mut host = Host::bind_with_config(bind_addr, config)?;
    let local = host.local_addr()?;
    println!("Tether echo server listening on {}", local);
    println!("Connect with the client example to see echoes.");

    loop {
        let Some(event) = host.service(Duration::from_millis(100))? else {
            continue;
        };
        match event {
            Event::Connect { peer, data } => {
                let addr = host.peer(peer).and_then(|p| p.address());
                println!("[connect] {:?} peer={} data={}", addr, peer.index(), data);
            }
            Event::Receive { peer, channel_id, packet, .. } => {
                let text = String::from_utf8_lossy(packet.data());
                println!("[packet] peer={} channel={} payload=\"{}\"", peer.index(), channel_id, text);

                // Echo back on the same channel with the same reliability
                let flags = PacketFlags::from_bits(packet.flags().bits() & !PacketFlags::SENT.bits());
                let echo = Packet::new(packet.data().to_vec(), flags);
                if let Err(e) = host.send(peer, channel_id, &echo) {
                    eprintln!("failed to queue echo: {}", e);
                }
            }
            Event::Disconnect { peer, data } => {
                println!("[disconnect] peer={} data={}", peer.index(), data);
            }
        }
    }
}
