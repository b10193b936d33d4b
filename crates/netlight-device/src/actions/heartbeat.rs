//! Device-initiated HEARTBEAT and the host's HEARTBEAT_ACK.

use std::time::{Duration, Instant};

use netlight_core::protocol::commands::{HEARTBEAT, HEARTBEAT_ACK};
use netlight_core::protocol::frame::ADDR_BROADCAST;
use netlight_core::{encode_frame, Args, CodecError};
use tracing::{info, warn};

use crate::app::App;
use crate::dispatch::{DispatchContext, Dispatcher, HandlerError};

/// Builds a HEARTBEAT frame if `interval` has passed since the last one.
///
/// Records the send time when a frame is returned.
///
/// # Errors
///
/// Returns [`CodecError`] if HEARTBEAT is missing from the schema.
pub fn next_heartbeat(
    app: &mut App,
    now: Instant,
    interval: Duration,
) -> Result<Option<Vec<u8>>, CodecError> {
    if let Some(last) = app.heartbeat.last_sent {
        if now.saturating_duration_since(last) < interval {
            return Ok(None);
        }
    }
    let args = Args::new()
        .with("device_id", app.device_id())
        .with("uptime_ms", app.uptime_ms());
    let frame = encode_frame(&app.schema, HEARTBEAT, &args, ADDR_BROADCAST)?;
    app.heartbeat.last_sent = Some(now);
    Ok(Some(frame))
}

pub fn on_heartbeat_ack(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let server_time = args.get_u32("server_time").unwrap_or_default();
    if args.get_u8("success").unwrap_or_default() != 0 {
        ctx.app.heartbeat.acks += 1;
        ctx.app.heartbeat.last_server_time = Some(server_time);
        info!("heartbeat: acknowledged (server_time={server_time})");
    } else {
        warn!("heartbeat: host reported failure");
    }
    Ok(())
}

pub fn register(dispatcher: &mut Dispatcher) {
    dispatcher.on(HEARTBEAT_ACK, on_heartbeat_ack);
}
