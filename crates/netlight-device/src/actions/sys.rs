//! DISCOVER and SYS_INFO_GET.

use netlight_core::protocol::commands::{ANNOUNCE, DISCOVER, SYS_INFO_GET, SYS_INFO_RSP};
use netlight_core::Args;
use tracing::info;

use crate::dispatch::{DispatchContext, Dispatcher, HandlerError};

/// Control URL the host should accept this device on.
pub fn control_url(ws_base: &str, device_id: &str) -> String {
    format!("{}/{}", ws_base.trim_end_matches('/'), device_id)
}

/// Answers a host broadcast and, if the control bus is down, asks the main
/// loop to connect to the advertised WebSocket endpoint.
pub fn on_discover(ctx: &mut DispatchContext<'_, '_>, args: &Args) -> Result<(), HandlerError> {
    let ws_base = args.get_str("ws_url").unwrap_or_default();
    let server_ip = args.get_str("server_ip").unwrap_or_default();
    info!("sys: DISCOVER from {server_ip} via {}", ctx.transport);

    if !ws_base.is_empty() {
        let url = control_url(ws_base, ctx.app.device_id());
        if ctx.request_connect(&url) {
            info!("sys: control connection requested at {url}");
        }
    }

    let reply = Args::new()
        .with("device_id", ctx.app.device_id())
        .with("firmware", env!("CARGO_PKG_VERSION"))
        .with("stream_port", ctx.app.config.network.stream_port);
    ctx.send(ANNOUNCE, &reply)?;
    Ok(())
}

pub fn on_sys_info_get(ctx: &mut DispatchContext<'_, '_>, _args: &Args) -> Result<(), HandlerError> {
    let mut info = ctx.app.runtime_status();
    info["name"] = ctx.app.config.device.name.clone().into();
    ctx.send(SYS_INFO_RSP, &Args::new().with("info_json", info.to_string()))?;
    Ok(())
}

pub fn register(dispatcher: &mut Dispatcher) {
    dispatcher.on(DISCOVER, on_discover);
    dispatcher.on(SYS_INFO_GET, on_sys_info_get);
}
