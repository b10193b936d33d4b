//! STATUS_GET / STATUS_UPDATE against the persisted status document.

use netlight_core::protocol::commands::{STATUS_GET, STATUS_RSP, STATUS_UPDATE, STATUS_UPDATE_ACK};
use netlight_core::{Args, StatusQuery};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::dispatch::{DispatchContext, Dispatcher, HandlerError};

pub fn on_status_get(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let code = args.get_u8("query_type").unwrap_or_default();
    let config = Value::Object(ctx.app.status.document().clone());
    let body = match StatusQuery::try_from(code) {
        Ok(StatusQuery::Config) => config,
        Ok(StatusQuery::Runtime) => ctx.app.runtime_status(),
        Ok(StatusQuery::Both) => json!({ "config": config, "runtime": ctx.app.runtime_status() }),
        Err(()) => {
            warn!("status: unknown query_type {code}");
            json!({})
        }
    };
    let text = body.to_string();
    ctx.send(STATUS_RSP, &Args::new().with("status_json", text.as_str()))?;
    info!("status: STATUS_RSP sent ({} bytes)", text.len());
    Ok(())
}

pub fn on_status_update(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let update = args.get_str("config_json").unwrap_or("{}");
    let result = ctx.app.status.merge(update);
    let (success, message) = match &result {
        Ok(()) => (1u8, "Status updated successfully".to_string()),
        Err(e) => (0u8, e.to_string()),
    };
    ctx.send(
        STATUS_UPDATE_ACK,
        &Args::new().with("success", success).with("message", message),
    )?;
    Ok(result?)
}

pub fn register(dispatcher: &mut Dispatcher) {
    dispatcher.on(STATUS_GET, on_status_get);
    dispatcher.on(STATUS_UPDATE, on_status_update);
}
