//! WebSocket control listener.
//!
//! Devices connect to `ws://<host>:<ws_port>/ws/<device_id>` after a
//! DISCOVER.  Each accepted connection gets a writer task draining the
//! endpoint's outbound channel and a reader loop feeding the endpoint inbox.
//!
//! # Unmasked frames
//!
//! Device firmware sends its binary frames without the client mask RFC 6455
//! requires.  The listener is configured with `accept_unmasked_frames` so
//! those frames are accepted as-is.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use netlight_core::CommandSchema;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async_with_config;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::upload::TransferPeer;
use crate::HostError;

/// Connected devices by endpoint id.
pub type Registry = Arc<RwLock<HashMap<Uuid, Arc<Endpoint>>>>;

const OUTBOUND_QUEUE: usize = 64;

pub struct ControlServer {
    listener: TcpListener,
    schema: Arc<CommandSchema>,
    registry: Registry,
    ack_capacity: usize,
}

impl ControlServer {
    /// Binds the listener.
    ///
    /// # Errors
    ///
    /// Returns [`HostError::Bind`] if the port is unavailable.
    pub async fn bind(
        addr: SocketAddr,
        schema: Arc<CommandSchema>,
        ack_capacity: usize,
    ) -> Result<Self, HostError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| HostError::Bind { addr, source })?;
        info!("control listener on ws://{}", listener.local_addr()?);
        Ok(Self {
            listener,
            schema,
            registry: Registry::default(),
            ack_capacity,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, HostError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Registry {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until `running` is cleared.
    pub async fn run(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::Relaxed) {
            match timeout(Duration::from_millis(200), self.listener.accept()).await {
                Ok(Ok((stream, peer))) => {
                    let schema = Arc::clone(&self.schema);
                    let registry = Arc::clone(&self.registry);
                    let ack_capacity = self.ack_capacity;
                    tokio::spawn(async move {
                        match serve_device(stream, peer, schema, registry, ack_capacity).await {
                            Ok(()) => info!("device at {peer} disconnected"),
                            Err(e) => warn!("device at {peer} dropped: {e}"),
                        }
                    });
                }
                Ok(Err(e)) => error!("accept error: {e}"),
                Err(_) => {}
            }
        }
        info!("control listener stopped");
    }
}

/// Snapshot of connected endpoints, sorted by label.
pub async fn endpoints(registry: &Registry) -> Vec<Arc<Endpoint>> {
    let mut list: Vec<Arc<Endpoint>> = registry.read().await.values().cloned().collect();
    list.sort_by(|a, b| a.label().cmp(b.label()));
    list
}

/// Device id from a control path such as `/ws/NL-0001`.
pub fn label_from_path(path: &str, peer: SocketAddr) -> String {
    path.rsplit('/')
        .find(|segment| !segment.is_empty() && *segment != "ws")
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

fn websocket_config() -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.accept_unmasked_frames = true;
    config
}

async fn serve_device(
    stream: TcpStream,
    peer: SocketAddr,
    schema: Arc<CommandSchema>,
    registry: Registry,
    ack_capacity: usize,
) -> Result<(), HostError> {
    stream.set_nodelay(true)?;
    let mut path = String::new();
    let record_path = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let ws = accept_hdr_async_with_config(stream, record_path, Some(websocket_config())).await?;

    let label = label_from_path(&path, peer);
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(OUTBOUND_QUEUE);
    let (endpoint, mut inbox) =
        Endpoint::open(label.clone(), peer, schema, out_tx.clone(), ack_capacity);
    registry.write().await.insert(endpoint.id(), Arc::clone(&endpoint));
    info!("device {label} connected from {peer}");

    let (mut sink, mut source) = ws.split();
    let writer_label = label.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frame)).await {
                warn!("[{writer_label}] send failed: {e}");
                break;
            }
        }
    });

    let result = loop {
        let message = match source.next().await {
            Some(Ok(message)) => message,
            Some(Err(e)) => break Err(HostError::from(e)),
            None => break Ok(()),
        };
        let data = match message {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Close(_) => break Ok(()),
            other => {
                debug!("[{label}] control frame {other:?}");
                continue;
            }
        };
        for reply in inbox.handle_bytes(&data) {
            if out_tx.send(reply).await.is_err() {
                break;
            }
        }
    };

    endpoint.mark_disconnected();
    registry.write().await.remove(&endpoint.id());
    writer.abort();
    result
}
