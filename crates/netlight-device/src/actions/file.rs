//! FILE_BEGIN / FILE_CHUNK / FILE_END, each answered with a FILE_ACK.

use netlight_core::protocol::commands::{FILE_ACK, FILE_BEGIN, FILE_CHUNK, FILE_END};
use netlight_core::{AckStage, AckStatus, Args};

use crate::dispatch::{DispatchContext, Dispatcher, HandlerError};
use crate::file_rx::SessionError;

fn send_ack(
    ctx: &mut DispatchContext<'_, '_>,
    file_id: u16,
    offset: u64,
    stage: AckStage,
    outcome: Result<String, &SessionError>,
) -> Result<(), HandlerError> {
    let (status, detail) = match outcome {
        Ok(detail) => (AckStatus::Ok, detail),
        Err(SessionError::DigestMismatch { actual, .. }) => {
            (AckStatus::DigestMismatch, actual.clone())
        }
        Err(e) => (e.ack_status(), e.to_string()),
    };
    let args = Args::new()
        .with("file_id", file_id)
        .with("offset", offset as u32)
        .with("stage", stage as u8)
        .with("status", status as u8)
        .with("detail", detail);
    ctx.send(FILE_ACK, &args)?;
    Ok(())
}

pub fn on_file_begin(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let file_id = args.get_u16("file_id").unwrap_or_default();
    let total_size = args.get_u32("total_size").unwrap_or_default();
    let result = ctx
        .app
        .file_rx
        .begin(file_id, total_size, args.get_str("path"), args.get_bytes("sha256"));

    send_ack(ctx, file_id, 0, AckStage::Begin, result.as_ref().map(|_| String::new()))?;
    Ok(result?)
}

pub fn on_file_chunk(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let file_id = args.get_u16("file_id").unwrap_or_default();
    let offset = args.get_u32("offset").unwrap_or_default();
    let data = args.get_bytes("data").unwrap_or_default();
    let result = ctx.app.file_rx.chunk(file_id, offset, data);

    send_ack(
        ctx,
        file_id,
        u64::from(offset),
        AckStage::Chunk,
        result.as_ref().map(|_| String::new()),
    )?;
    result?;
    Ok(())
}

pub fn on_file_end(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let file_id = args.get_u16("file_id").unwrap_or_default();
    let offset = ctx.app.file_rx.cursor().unwrap_or_default();
    let result = ctx.app.file_rx.end(file_id);

    send_ack(ctx, file_id, offset, AckStage::End, result.as_ref().map(hex::encode))?;
    result?;
    Ok(())
}

pub fn register(dispatcher: &mut Dispatcher) {
    dispatcher.on(FILE_BEGIN, on_file_begin);
    dispatcher.on(FILE_CHUNK, on_file_chunk);
    dispatcher.on(FILE_END, on_file_end);
}
