//! Net-Light device entry point.
//!
//! Opens the three buses and runs the cooperative main loop:
//!
//! ```text
//! loop
//!  ├─ ctrl.poll()        WebSocket control connection (file transfer, status)
//!  ├─ discovery.poll()   UDP DISCOVER → ANNOUNCE, may request a ctrl connect
//!  ├─ stream.poll()      UDP STREAM_FRAME traffic
//!  ├─ heartbeat          HEARTBEAT on ctrl every interval
//!  └─ render             local playback while streaming in local mode
//! ```

use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use netlight_core::StreamMode;
use netlight_device::actions::heartbeat::next_heartbeat;
use netlight_device::config::load_config;
use netlight_device::stream::{FpsMeter, LocalPlayer, LogDisplay};
use netlight_device::transport::{BusKind, NetBus};
use netlight_device::{App, Device, Extras};

#[derive(Debug, Parser)]
#[command(name = "netlight-device", version, about = "Net-Light device firmware")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "NETLIGHT_CONFIG", default_value = "netlight-device.toml")]
    config: PathBuf,

    #[arg(long, env = "NETLIGHT_DISCOVERY_PORT")]
    discovery_port: Option<u16>,

    #[arg(long, env = "NETLIGHT_STREAM_PORT")]
    stream_port: Option<u16>,

    /// Storage root override.
    #[arg(long, env = "NETLIGHT_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,

    /// Connect the control bus at startup instead of waiting for DISCOVER.
    #[arg(long)]
    ctrl_url: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(port) = cli.discovery_port {
        config.network.discovery_port = port;
    }
    if let Some(port) = cli.stream_port {
        config.network.stream_port = port;
    }
    if let Some(root) = cli.storage_root {
        config.storage.root = root;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.device.log_level)),
        )
        .init();

    info!("Net-Light device {} starting", env!("CARGO_PKG_VERSION"));

    let network = config.network.clone();
    let mut device = Device::new(config, Box::new(LogDisplay::default()))?;

    let mut ctrl = NetBus::new(BusKind::Ws, "ctrl", device.create_parser());
    let mut discovery = NetBus::new(BusKind::Udp, "discovery", device.create_parser());
    let mut stream = NetBus::new(BusKind::Udp, "stream", device.create_parser());
    discovery
        .bind(network.discovery_port)
        .context("binding discovery port")?;
    stream.bind(network.stream_port).context("binding stream port")?;

    let heartbeat_every = Duration::from_millis(network.heartbeat_interval_ms);
    let mut ctrl_url = cli.ctrl_url;
    let mut last_connect_attempt: Option<Instant> = None;
    let mut fps = FpsMeter::new(heartbeat_every, Instant::now());
    let mut player: Option<LocalPlayer> = None;

    info!("device ready; waiting for DISCOVER on udp/{}", network.discovery_port);

    loop {
        let ctrl_connected = ctrl.is_connected();
        let mut pending_url: Option<String> = None;

        ctrl.poll(Some(&mut device), Extras::default());
        {
            let mut on_connect = |url: &str| pending_url = Some(url.to_string());
            discovery.poll(
                Some(&mut device),
                Extras::with_connect(ctrl_connected, &mut on_connect),
            );
        }
        stream.poll(Some(&mut device), Extras::default());

        let now = Instant::now();

        // ── Control connection ────────────────────────────────────────────────
        if let Some(url) = pending_url {
            ctrl_url = Some(url);
            last_connect_attempt = None;
        }
        if !ctrl.is_connected() {
            if let Some(url) = ctrl_url.as_deref() {
                let due = last_connect_attempt
                    .map_or(true, |at| now.saturating_duration_since(at) >= heartbeat_every);
                if due {
                    last_connect_attempt = Some(now);
                    match ctrl.connect_url(url) {
                        Ok(()) => device.app.heartbeat.last_sent = None,
                        Err(e) => warn!("ctrl connect to {url} failed: {e}"),
                    }
                }
            }
        }

        // ── Heartbeat ─────────────────────────────────────────────────────────
        if ctrl.is_connected() {
            match next_heartbeat(&mut device.app, now, heartbeat_every) {
                Ok(Some(frame)) => {
                    ctrl.write(&frame);
                }
                Ok(None) => {}
                Err(e) => error!("heartbeat encode failed: {e}"),
            }
        }

        // ── Render ────────────────────────────────────────────────────────────
        render_local(&mut device.app, &mut player, now);
        if let Some(rate) = fps.report(device.app.stream.frames, now) {
            device.app.stream.take_frame_count();
            if device.app.stream.active {
                info!("render: {rate:.1} fps ({:?})", device.app.stream.mode);
            }
        }

        thread::sleep(Duration::from_millis(1));
    }
}

/// Replays the local frame file while streaming in local mode.
fn render_local(app: &mut App, player: &mut Option<LocalPlayer>, now: Instant) {
    if !app.stream.active || app.stream.mode != StreamMode::Local {
        *player = None;
        return;
    }

    if player.is_none() {
        let path = app.config.local_file_path();
        let period = Duration::from_millis(app.config.render.local_frame_ms);
        match LocalPlayer::open(&path, app.config.render.frame_bytes, period) {
            Ok(opened) => *player = Some(opened),
            Err(e) => {
                warn!("render: cannot open {}: {e}; stopping stream", path.display());
                app.stream.stop();
                return;
            }
        }
    }

    if let Some(active) = player.as_mut() {
        match active.tick(&mut *app.display, now) {
            Ok(true) => app.stream.frames += 1,
            Ok(false) => {}
            Err(e) => {
                warn!("render: playback failed: {e}; stopping stream");
                *player = None;
                app.stream.stop();
            }
        }
    }
}
