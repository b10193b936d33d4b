//! # netlight-device
//!
//! Firmware side of Net-Light: the command dispatcher, the resumable file
//! receiver, streaming state, the persisted status document, and the
//! transport multiplexer that ties them to real sockets.
//!
//! # Module layout
//!
//! ```text
//! netlight_device
//!  ├── app        – App (all handler-visible state) and Device (App + Dispatcher)
//!  ├── dispatch   – frame → handler routing inside a failure boundary
//!  ├── actions    – built-in handlers, one module per command family
//!  ├── file_rx    – FILE_BEGIN/CHUNK/END session with SHA-256 verification
//!  ├── stream     – StreamState, the Display seam, local playback
//!  ├── status     – JSON status document on disk
//!  ├── transport  – NetBus over TCP, WebSocket, and UDP
//!  └── config     – TOML configuration
//! ```

pub mod actions;
pub mod app;
pub mod config;
pub mod dispatch;
pub mod file_rx;
pub mod status;
pub mod stream;
pub mod transport;

pub use app::{App, AppError, Device};
pub use dispatch::{DispatchContext, DispatchOutcome, Dispatcher, Extras, HandlerError, Verbosity};
