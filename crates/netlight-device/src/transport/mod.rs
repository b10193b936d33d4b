//! Transport multiplexer: one [`NetBus`] type over TCP, the WebSocket
//! envelope, and UDP.

pub mod netbus;

use std::io;

use thiserror::Error;

pub use netbus::NetBus;

/// Which socket a [`NetBus`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    Tcp,
    Ws,
    Udp,
}

/// Connection setup failures.  I/O failures after setup only flip the bus to
/// disconnected; they are never returned from `poll` or `write`.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not resolve {0}")]
    Resolve(String),

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    #[error("invalid websocket url {0:?}")]
    InvalidUrl(String),

    #[error("operation not supported on a {0:?} bus")]
    Unsupported(BusKind),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Splits `ws://host[:port][/path]` into its parts.  Port defaults to 80 and
/// path to `/`.
pub fn parse_ws_url(url: &str) -> Result<(String, u16, String), TransportError> {
    let invalid = || TransportError::InvalidUrl(url.to_string());
    let rest = url.strip_prefix("ws://").ok_or_else(invalid)?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| invalid())?),
        None => (authority, 80),
    };
    if host.is_empty() {
        return Err(invalid());
    }
    Ok((host.to_string(), port, path.to_string()))
}
