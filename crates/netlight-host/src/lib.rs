//! # netlight-host
//!
//! Host counterpart to the Net-Light firmware.  Devices find the host through
//! a UDP DISCOVER broadcast and dial back over WebSocket; each connection
//! becomes an [`endpoint::Endpoint`] that the stop-and-wait
//! [`upload::Uploader`] drives one acknowledged chunk at a time.
//!
//! ```text
//! discovery ──DISCOVER──▶ device ──ws connect──▶ server ──▶ Endpoint
//!                                                            │
//!                               Uploader ◀──FILE_ACK queue───┘
//! ```

pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod server;
pub mod stream;
pub mod upload;

use std::net::SocketAddr;

use netlight_core::{CodecError, SchemaError};
use thiserror::Error;

/// Failures of the host's network services.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}
