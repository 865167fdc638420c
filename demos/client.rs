//! Simple client that sends messages to a Tether server and prints replies.
//!
//! Run the server first:
//! - cargo run -p tether --example server -- 127.0.0.1:7777
//!
//! Then run the client:
//! - cargo run -p tether --example client -- 127.0.0.1:7777
//! - cargo run -p tether --example client -- 127.0.0.1:7777 10 200
//!   (sends 10 messages, 200ms apart)

use std::{
    env,
    net::SocketAddr,
    time::{Duration, Instant},
};

use tether::{Event, Host, Packet};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Args: <server_addr> [count] [interval_ms]
    let mut args = env::args().skip(1);
    let server_addr: SocketAddr = args
        .next()
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()?;
    let count: usize = args.next().unwrap_or_else(|| "5".into()).parse().unwrap_or(5);
    let interval_ms: u64 = args
        .next()
        .unwrap_or_else(|| "300".into())
        .parse()
        .unwrap_or(300);

    let mut host = Host::bind_any()?;
    let local = host.local_addr()?;
    println!(
        "Tether client bound to {} -> sending {} messages to {} (every {}ms)",
        local, count, server_addr, interval_ms
    );

    let server = host.connect(server_addr, 2, 0)?;
    let mut connected = false;
    let mut sent = 0;
    let mut next_send = Instant::now();

    while sent < count || host.connected_peers() > 0 {
        if connected && sent < count && Instant::now() >= next_send {
            let msg = format!("hello {} from {}", sent, local);
            host.send(server, 0, &Packet::reliable(msg.into_bytes()))?;
            sent += 1;
            next_send = Instant::now() + Duration::from_millis(interval_ms);
            if sent == count {
                host.disconnect_later(server, 0)?;
            }
        }

        match host.service(Duration::from_millis(10))? {
            Some(Event::Connect { .. }) => {
                println!("[connect] {}", server_addr);
                connected = true;
            }
            Some(Event::Receive { channel_id, packet, .. }) => {
                let text = String::from_utf8_lossy(packet.data());
                println!("[reply] channel={} payload=\"{}\"", channel_id, text);
            }
            Some(Event::Disconnect { .. }) => {
                println!("[disconnect] {}", server_addr);
                break;
            }
            None => {}
        }
    }

    println!("done");
    Ok(())
}
