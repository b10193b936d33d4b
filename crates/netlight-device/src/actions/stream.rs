//! STREAM_START / STREAM_STOP / STREAM_FRAME.

use std::time::Instant;

use netlight_core::protocol::commands::{STREAM_FRAME, STREAM_START, STREAM_STOP};
use netlight_core::{Args, StreamMode};
use tracing::{trace, warn};

use crate::dispatch::{DispatchContext, Dispatcher, HandlerError};

pub fn on_stream_start(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let fps = args.get_u16("fps").unwrap_or(40);
    let code = args.get_u8("mode").unwrap_or_default();
    let mode = StreamMode::try_from(code).unwrap_or_else(|()| {
        warn!("stream: unknown mode {code}, using local");
        StreamMode::Local
    });
    ctx.app.stream.start(fps, mode);
    Ok(())
}

pub fn on_stream_stop(ctx: &mut DispatchContext<'_, '_>, _args: &Args) -> Result<(), HandlerError> {
    ctx.app.stream.stop();
    ctx.app.display.clear();
    Ok(())
}

/// Hands host pixels to the display.  Ignored while streaming is inactive.
pub fn on_stream_frame(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let frame_id = args.get_u32("frame_id").unwrap_or_default();
    if !ctx.app.stream.accept_frame(frame_id, Instant::now()) {
        trace!("stream: frame {frame_id} ignored, streaming inactive");
        return Ok(());
    }
    if let Some(pixels) = args.get_bytes("pixel_data").filter(|p| !p.is_empty()) {
        ctx.app.display.display(pixels);
    }
    Ok(())
}

pub fn register(dispatcher: &mut Dispatcher) {
    dispatcher.on(STREAM_START, on_stream_start);
    dispatcher.on(STREAM_STOP, on_stream_stop);
    dispatcher.on(STREAM_FRAME, on_stream_frame);
}
