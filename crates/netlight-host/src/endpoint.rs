//! One connected device as seen by the host.
//!
//! An endpoint is created when a device completes the WebSocket upgrade and
//! dropped from the registry when the connection ends.  It is split in two:
//!
//! - [`Endpoint`]: the shared handle.  Outbound frames go through a channel to
//!   the connection's writer task; FILE_ACKs come back through a bounded
//!   queue the uploader drains.
//! - [`EndpointInbox`]: owned by the connection's reader task.  It holds the
//!   endpoint's private [`FrameParser`] and turns inbound bytes into queued
//!   acks, logged replies, and HEARTBEAT_ACKs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use netlight_core::protocol::commands::{FILE_ACK, HEARTBEAT, HEARTBEAT_ACK};
use netlight_core::protocol::frame::ADDR_BROADCAST;
use netlight_core::{
    decode_payload, encode_frame, AckStage, AckStatus, Args, CommandSchema, FrameParser,
};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::upload::{TransferError, TransferPeer};

/// A decoded FILE_ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAck {
    pub file_id: u16,
    pub offset: u32,
    pub stage: AckStage,
    /// Raw status code; zero is success.
    pub status: u8,
    pub detail: String,
}

impl FileAck {
    /// Builds an ack from decoded FILE_ACK arguments.  `None` if the stage
    /// code is unknown.
    pub fn from_args(args: &Args) -> Option<Self> {
        let stage = AckStage::try_from(args.get_u8("stage")?).ok()?;
        Some(Self {
            file_id: args.get_u16("file_id").unwrap_or_default(),
            offset: args.get_u32("offset").unwrap_or_default(),
            stage,
            status: args.get_u8("status").unwrap_or_default(),
            detail: args.get_str("detail").unwrap_or_default().to_string(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok as u8
    }
}

pub struct Endpoint {
    id: Uuid,
    label: String,
    peer: SocketAddr,
    outbound: mpsc::Sender<Vec<u8>>,
    acks: Mutex<mpsc::Receiver<FileAck>>,
    last_acked_offset: AtomicU32,
    connected: AtomicBool,
}

impl Endpoint {
    /// Creates the endpoint and the inbox its reader task owns.
    ///
    /// `label` is usually the device id taken from the connection path.
    pub fn open(
        label: impl Into<String>,
        peer: SocketAddr,
        schema: Arc<CommandSchema>,
        outbound: mpsc::Sender<Vec<u8>>,
        ack_capacity: usize,
    ) -> (Arc<Self>, EndpointInbox) {
        let (ack_tx, ack_rx) = mpsc::channel(ack_capacity.max(1));
        let endpoint = Arc::new(Self {
            id: Uuid::new_v4(),
            label: label.into(),
            peer,
            outbound,
            acks: Mutex::new(ack_rx),
            last_acked_offset: AtomicU32::new(0),
            connected: AtomicBool::new(true),
        });
        let inbox = EndpointInbox {
            endpoint: Arc::clone(&endpoint),
            schema,
            parser: FrameParser::new(),
            ack_tx,
        };
        (endpoint, inbox)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Offset named by the most recent successful FILE_ACK.
    pub fn last_acked_offset(&self) -> u32 {
        self.last_acked_offset.load(Ordering::Relaxed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    /// Queues an encoded frame for `cmd` on this connection.
    ///
    /// # Errors
    ///
    /// [`TransferError::Encode`] for an unknown command or oversize payload,
    /// [`TransferError::Disconnected`] if the connection is gone.
    pub async fn send_command(
        &self,
        schema: &CommandSchema,
        cmd: u16,
        args: &Args,
    ) -> Result<(), TransferError> {
        let frame = encode_frame(schema, cmd, args, ADDR_BROADCAST)?;
        self.send(frame).await
    }
}

#[async_trait]
impl TransferPeer for Endpoint {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransferError> {
        if !self.is_connected() {
            return Err(TransferError::Disconnected(self.label.clone()));
        }
        self.outbound.send(frame).await.map_err(|_| {
            self.mark_disconnected();
            TransferError::Disconnected(self.label.clone())
        })
    }

    async fn wait_ack(&self, timeout: Duration) -> Option<FileAck> {
        let mut acks = self.acks.lock().await;
        tokio::time::timeout(timeout, acks.recv()).await.ok().flatten()
    }

    async fn clear_acks(&self) {
        let mut acks = self.acks.lock().await;
        let mut dropped = 0usize;
        while acks.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("[{}] cleared {dropped} stale ack(s)", self.label);
        }
    }
}

/// Reader-side half of an endpoint.
pub struct EndpointInbox {
    endpoint: Arc<Endpoint>,
    schema: Arc<CommandSchema>,
    parser: FrameParser,
    ack_tx: mpsc::Sender<FileAck>,
}

impl EndpointInbox {
    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Parses inbound bytes and returns frames to send back immediately.
    pub fn handle_bytes(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.parser.feed(data);
        let mut replies = Vec::new();
        let label = self.endpoint.label.as_str();

        for frame in self.parser.pop() {
            let Some(def) = self.schema.get(frame.cmd) else {
                debug!("[{label}] unknown cmd 0x{:04X} dropped", frame.cmd);
                continue;
            };
            let args = decode_payload(def, &frame.payload);

            match frame.cmd {
                FILE_ACK => match FileAck::from_args(&args) {
                    Some(ack) => {
                        if ack.is_ok() {
                            self.endpoint.last_acked_offset.store(ack.offset, Ordering::Relaxed);
                        }
                        if let Err(e) = self.ack_tx.try_send(ack) {
                            warn!("[{label}] ack dropped: {e}");
                        }
                    }
                    None => warn!("[{label}] FILE_ACK with unknown stage: {args}"),
                },
                HEARTBEAT => {
                    debug!("[{label}] heartbeat {args}");
                    let server_time = SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .map(|d| d.as_secs() as u32)
                        .unwrap_or_default();
                    let ack = Args::new()
                        .with("server_time", server_time)
                        .with("success", 1u8);
                    match encode_frame(&self.schema, HEARTBEAT_ACK, &ack, ADDR_BROADCAST) {
                        Ok(reply) => replies.push(reply),
                        Err(e) => warn!("[{label}] cannot encode HEARTBEAT_ACK: {e}"),
                    }
                }
                _ => info!("[{label}] {} {args}", def.name),
            }
        }
        replies
    }
}
