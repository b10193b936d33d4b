//! Device application state and the byte-stream entry point.
//!
//! [`App`] owns everything handlers are allowed to touch.  [`Device`] pairs
//! it with the [`Dispatcher`] so a transport can hand over raw bytes and get
//! back the frames the handlers want to send in reply.

use std::sync::Arc;
use std::time::Instant;

use netlight_core::{CommandSchema, FrameParser, SchemaError};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::info;

use crate::actions;
use crate::config::DeviceConfig;
use crate::dispatch::{DispatchContext, DispatchOutcome, Dispatcher, Extras};
use crate::file_rx::FileReceiver;
use crate::status::{StatusError, StatusStore};
use crate::stream::{Display, StreamState};

/// Startup failures of the device application.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

/// Heartbeat bookkeeping.
#[derive(Debug, Clone, Default)]
pub struct HeartbeatState {
    pub last_sent: Option<Instant>,
    pub last_server_time: Option<u32>,
    pub acks: u64,
}

/// Everything a command handler may read or mutate.
pub struct App {
    pub config: DeviceConfig,
    pub schema: Arc<CommandSchema>,
    pub file_rx: FileReceiver,
    pub stream: StreamState,
    pub status: StatusStore,
    pub display: Box<dyn Display>,
    pub heartbeat: HeartbeatState,
    started: Instant,
}

impl App {
    /// Builds the application state from `config`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError`] if a schema override is malformed or the status
    /// document cannot be created.
    pub fn new(config: DeviceConfig, display: Box<dyn Display>) -> Result<Self, AppError> {
        let schema = Arc::new(CommandSchema::load(config.storage.schema_dir.as_deref())?);
        let status = StatusStore::load_or_create(config.status_path())?;
        let file_rx = FileReceiver::new(config.storage.root.clone());
        info!(
            "app: {} ({}) ready with {} commands",
            config.device.name,
            config.device.device_id,
            schema.len()
        );
        Ok(Self {
            config,
            schema,
            file_rx,
            stream: StreamState::default(),
            status,
            display,
            heartbeat: HeartbeatState::default(),
            started: Instant::now(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.config.device.device_id
    }

    /// Milliseconds since boot, wrapping like a firmware tick counter.
    pub fn uptime_ms(&self) -> u32 {
        self.started.elapsed().as_millis() as u32
    }

    /// Live values reported by SYS_INFO_GET and STATUS_GET.
    pub fn runtime_status(&self) -> Value {
        let transfer = self.file_rx.progress().map(|(file_id, total, cursor)| {
            json!({ "file_id": file_id, "total_size": total, "received": cursor })
        });
        json!({
            "uptime_ms": self.uptime_ms(),
            "device_id": self.device_id(),
            "firmware": env!("CARGO_PKG_VERSION"),
            "streaming": self.stream.active,
            "stream_mode": self.stream.mode,
            "fps": self.stream.fps,
            "frames": self.stream.frames,
            "transfer": transfer,
            "last_file_error": self.file_rx.last_error(),
        })
    }
}

/// The application plus its dispatcher.
pub struct Device {
    pub app: App,
    pub dispatcher: Dispatcher,
}

impl Device {
    /// Builds the application and registers every built-in action.
    ///
    /// # Errors
    ///
    /// See [`App::new`].
    pub fn new(config: DeviceConfig, display: Box<dyn Display>) -> Result<Self, AppError> {
        let verbosity = config.device.dispatch_verbosity;
        let app = App::new(config, display)?;
        let mut dispatcher = Dispatcher::new(Arc::clone(&app.schema));
        dispatcher.set_verbosity(verbosity);
        actions::register_all(&mut dispatcher);
        Ok(Self { app, dispatcher })
    }

    /// A parser sized to this device's payload limit.
    pub fn create_parser(&self) -> FrameParser {
        FrameParser::with_max_payload(self.app.config.network.max_payload)
    }

    /// Feeds `data` into `parser` and dispatches every complete frame.
    ///
    /// Returns the frames handlers queued for sending, in order.
    pub fn handle_bytes(
        &mut self,
        transport: &str,
        parser: &mut FrameParser,
        data: &[u8],
        extras: Extras<'_>,
    ) -> Vec<Vec<u8>> {
        parser.feed(data);
        let mut ctx = DispatchContext::new(&mut self.app, transport, extras);
        for frame in parser.pop() {
            let outcome = self.dispatcher.dispatch(&frame, &mut ctx);
            if outcome != DispatchOutcome::Handled {
                tracing::trace!("[{transport}] frame 0x{:04X}: {outcome:?}", frame.cmd);
            }
        }
        ctx.into_outbox()
    }
}

#[cfg(test)]
pub(crate) fn test_app() -> (App, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = DeviceConfig::default();
    config.storage.root = dir.path().to_path_buf();
    let app = App::new(config, Box::new(crate::stream::LogDisplay::default())).expect("app");
    (app, dir)
}
