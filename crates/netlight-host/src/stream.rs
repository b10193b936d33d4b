//! Stream control helpers.
//!
//! STREAM_START and STREAM_STOP travel over the control connection; pixel
//! frames go as STREAM_FRAME datagrams to the device's stream port.

use std::net::{Ipv4Addr, SocketAddr};

use netlight_core::protocol::commands::{STREAM_FRAME, STREAM_START, STREAM_STOP};
use netlight_core::protocol::frame::ADDR_BROADCAST;
use netlight_core::{encode_frame, Args, CommandSchema, StreamMode};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::endpoint::Endpoint;
use crate::upload::TransferError;
use crate::HostError;

/// Bytes per pixel in the raw buffers devices expect.
pub const BYTES_PER_PIXEL: usize = 4;

/// Dim blue on every pixel.
pub fn test_pattern(pixels: usize) -> Vec<u8> {
    [0x1F, 0x00, 0x00, 0x00].repeat(pixels)
}

pub async fn start(
    endpoint: &Endpoint,
    schema: &CommandSchema,
    fps: u16,
    mode: StreamMode,
) -> Result<(), TransferError> {
    let args = Args::new().with("fps", fps).with("mode", mode as u8);
    endpoint.send_command(schema, STREAM_START, &args).await
}

pub async fn stop(endpoint: &Endpoint, schema: &CommandSchema) -> Result<(), TransferError> {
    endpoint.send_command(schema, STREAM_STOP, &Args::new()).await
}

/// Encodes one STREAM_FRAME.
pub fn stream_frame(
    schema: &CommandSchema,
    frame_id: u32,
    pixels: &[u8],
) -> Result<Vec<u8>, HostError> {
    let args = Args::new().with("frame_id", frame_id).with("pixel_data", pixels);
    Ok(encode_frame(schema, STREAM_FRAME, &args, ADDR_BROADCAST)?)
}

/// Sends one STREAM_FRAME datagram to `target`.
pub async fn send_stream_frame(
    schema: &CommandSchema,
    target: SocketAddr,
    frame_id: u32,
    pixels: &[u8],
) -> Result<(), HostError> {
    let frame = stream_frame(schema, frame_id, pixels)?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    let sent = socket.send_to(&frame, target).await?;
    debug!("STREAM_FRAME {frame_id} ({sent} bytes) to {target}");
    Ok(())
}
