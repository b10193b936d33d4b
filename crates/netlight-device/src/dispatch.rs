//! Command dispatcher: routes decoded frames to registered handlers.
//!
//! Every handler runs inside a failure boundary.  An `Err` result or a panic
//! is logged against the command name and the dispatcher moves on to the next
//! frame; nothing a handler does can stop the receive loop.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use netlight_core::protocol::frame::ADDR_BROADCAST;
use netlight_core::{decode_payload, encode_frame, Args, CodecError, CommandSchema, Frame};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::app::App;
use crate::file_rx::SessionError;
use crate::status::StatusError;

/// How much the dispatcher logs per handled command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Off,
    /// Command name only.
    #[default]
    Commands,
    /// Command name, decoded arguments, and execution time.
    Full,
}

/// Errors a handler may return.  They are logged, never propagated.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Status(#[from] StatusError),

    #[error("failed to encode reply: {0}")]
    Reply(#[from] CodecError),

    #[error("missing argument {0}")]
    MissingArg(&'static str),

    #[error("{0}")]
    Other(String),
}

/// Result of dispatching one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    UnknownCommand,
    NoHandler,
    Failed,
    Panicked,
}

// ── Context ───────────────────────────────────────────────────────────────────

/// Transport-specific additions to a [`DispatchContext`].
#[derive(Default)]
pub struct Extras<'a> {
    /// Whether the control bus is currently connected.
    pub ctrl_connected: bool,
    /// Asks the main loop to open the control connection at the given URL.
    pub on_connect: Option<&'a mut dyn FnMut(&str)>,
}

impl<'a> Extras<'a> {
    pub fn with_connect(ctrl_connected: bool, on_connect: &'a mut dyn FnMut(&str)) -> Self {
        Self {
            ctrl_connected,
            on_connect: Some(on_connect),
        }
    }
}

/// Per-invocation bag handed to every handler.
///
/// Frames sent through [`send`](Self::send) are queued and written by the
/// transport once dispatch returns.
pub struct DispatchContext<'a, 'e> {
    pub app: &'a mut App,
    pub transport: &'a str,
    pub extras: Extras<'e>,
    outbox: Vec<Vec<u8>>,
}

impl<'a, 'e> DispatchContext<'a, 'e> {
    pub fn new(app: &'a mut App, transport: &'a str, extras: Extras<'e>) -> Self {
        Self {
            app,
            transport,
            extras,
            outbox: Vec::new(),
        }
    }

    /// Encodes `args` for `cmd` and queues the frame on the originating transport.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] if `cmd` is unknown or the payload is too large.
    pub fn send(&mut self, cmd: u16, args: &Args) -> Result<(), CodecError> {
        let frame = encode_frame(&self.app.schema, cmd, args, ADDR_BROADCAST)?;
        self.outbox.push(frame);
        Ok(())
    }

    /// Requests a control connection if the control bus is down.
    ///
    /// Returns `true` if a callback was available and invoked.
    pub fn request_connect(&mut self, url: &str) -> bool {
        if self.extras.ctrl_connected {
            return false;
        }
        match self.extras.on_connect.as_mut() {
            Some(callback) => {
                callback(url);
                true
            }
            None => false,
        }
    }

    /// Frames queued by handlers, in send order.
    pub fn into_outbox(self) -> Vec<Vec<u8>> {
        self.outbox
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

/// Boxed command handler.
pub type Handler = Box<dyn Fn(&mut DispatchContext<'_, '_>, &Args) -> Result<(), HandlerError> + Send + Sync>;

pub struct Dispatcher {
    schema: Arc<CommandSchema>,
    handlers: HashMap<u16, Handler>,
    verbosity: Verbosity,
}

impl Dispatcher {
    pub fn new(schema: Arc<CommandSchema>) -> Self {
        Self {
            schema,
            handlers: HashMap::new(),
            verbosity: Verbosity::default(),
        }
    }

    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.verbosity = verbosity;
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Registers `handler` for `cmd`, replacing any previous one.
    pub fn on<F>(&mut self, cmd: u16, handler: F)
    where
        F: Fn(&mut DispatchContext<'_, '_>, &Args) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        if self.schema.get(cmd).is_none() {
            warn!("dispatch: registering handler for 0x{cmd:04X} which is not in the schema");
        }
        self.handlers.insert(cmd, Box::new(handler));
    }

    pub fn has_handler(&self, cmd: u16) -> bool {
        self.handlers.contains_key(&cmd)
    }

    /// Decodes `frame` and runs its handler inside the failure boundary.
    pub fn dispatch(&self, frame: &Frame, ctx: &mut DispatchContext<'_, '_>) -> DispatchOutcome {
        let Some(def) = self.schema.get(frame.cmd) else {
            debug!("dispatch: unknown cmd 0x{:04X} on {}, dropped", frame.cmd, ctx.transport);
            return DispatchOutcome::UnknownCommand;
        };
        let Some(handler) = self.handlers.get(&frame.cmd) else {
            debug!("dispatch: no handler for {} on {}, dropped", def.name, ctx.transport);
            return DispatchOutcome::NoHandler;
        };

        let args = decode_payload(def, &frame.payload);
        match self.verbosity {
            Verbosity::Off => {}
            Verbosity::Commands => info!("[{}] {}", ctx.transport, def.name),
            Verbosity::Full => info!("[{}] {} {args}", ctx.transport, def.name),
        }

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, &args)));
        if self.verbosity == Verbosity::Full {
            info!("[{}] {} took {:?}", ctx.transport, def.name, started.elapsed());
        }

        match result {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                error!("dispatch: {} handler failed: {e}", def.name);
                DispatchOutcome::Failed
            }
            Err(payload) => {
                let msg = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("dispatch: {} handler panicked: {msg}", def.name);
                DispatchOutcome::Panicked
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
