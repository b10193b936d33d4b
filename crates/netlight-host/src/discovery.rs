//! UDP broadcast discovery.
//!
//! The host broadcasts one DISCOVER carrying its own address and the control
//! URL devices should dial.  Each device answers with an ANNOUNCE sent back
//! to the datagram's source, then connects to the URL.  Replies are collected
//! for a fixed window; duplicates from the same device are folded.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;

use netlight_core::protocol::commands::{ANNOUNCE, DISCOVER};
use netlight_core::protocol::frame::ADDR_BROADCAST;
use netlight_core::{decode_payload, encode_frame, Args, CommandSchema, FrameParser};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::HostError;

/// A device that answered a DISCOVER.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub device_id: String,
    pub firmware: String,
    pub stream_port: u16,
    pub addr: SocketAddr,
}

/// Best guess at the address other LAN hosts reach us on.
///
/// Connecting a UDP socket sends nothing but makes the OS pick the outbound
/// interface.  Falls back to loopback when no route exists.
pub fn local_ip() -> IpAddr {
    StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

/// Control URL a device with `device_id` should dial.
pub fn control_url(server_ip: IpAddr, ws_port: u16, device_id: &str) -> String {
    format!("ws://{server_ip}:{ws_port}/ws/{device_id}")
}

/// Broadcasts DISCOVER to `target` and gathers ANNOUNCE replies for `window`.
///
/// `ws_url` is sent as-is; an empty value lets each device derive
/// `ws://<server_ip>:8000/ws/<device_id>` itself.
///
/// # Errors
///
/// I/O errors from binding or sending; receive errors end the window early.
pub async fn discover(
    schema: &CommandSchema,
    target: SocketAddr,
    server_ip: IpAddr,
    ws_url: &str,
    window: Duration,
) -> Result<Vec<Announcement>, HostError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let args = Args::new()
        .with("server_ip", server_ip.to_string())
        .with("ws_url", ws_url);
    let frame = encode_frame(schema, DISCOVER, &args, ADDR_BROADCAST)?;
    socket.send_to(&frame, target).await?;
    info!("DISCOVER sent to {target} (server_ip={server_ip})");

    let deadline = Instant::now() + window;
    let mut found: Vec<Announcement> = Vec::new();
    let mut buf = vec![0u8; 2048];

    while let Ok(received) = timeout_at(deadline, socket.recv_from(&mut buf)).await {
        let (n, from) = received?;
        for announcement in parse_announcements(schema, &buf[..n], from) {
            if found.iter().any(|a| a.device_id == announcement.device_id) {
                debug!("duplicate ANNOUNCE from {}", announcement.device_id);
                continue;
            }
            info!(
                "found {} ({}) at {from}, stream port {}",
                announcement.device_id, announcement.firmware, announcement.stream_port
            );
            found.push(announcement);
        }
    }
    Ok(found)
}

/// ANNOUNCE frames contained in one datagram.
pub fn parse_announcements(
    schema: &CommandSchema,
    datagram: &[u8],
    from: SocketAddr,
) -> Vec<Announcement> {
    let Some(def) = schema.get(ANNOUNCE) else {
        return Vec::new();
    };
    let mut parser = FrameParser::new();
    parser.feed(datagram);
    parser
        .pop()
        .filter(|frame| frame.cmd == ANNOUNCE)
        .map(|frame| {
            let args = decode_payload(def, &frame.payload);
            Announcement {
                device_id: args.get_str("device_id").unwrap_or_default().to_string(),
                firmware: args.get_str("firmware").unwrap_or_default().to_string(),
                stream_port: args.get_u16("stream_port").unwrap_or_default(),
                addr: from,
            }
        })
        .collect()
}
