//! # netlight-core
//!
//! Shared library for Net-Light containing the wire framer, the declarative
//! command schema, and the schema-driven field codec.
//!
//! This crate is used by both the device firmware and the host tool.
//! It has zero dependencies on network sockets or the filesystem layout of
//! either side.
//!
//! # Architecture overview (for beginners)
//!
//! A Net-Light device is an LED controller that talks to a companion host over
//! TCP, a WebSocket-style framed socket, or UDP.  Every message on every
//! transport uses the same binary frame:
//!
//! ```text
//! "NL" | version | address | command id | payload length | payload | crc16
//! ```
//!
//! - **`protocol::frame`** – Builds frames and recovers them from a noisy byte
//!   stream.  A corrupted byte costs at most one frame; the parser rescans and
//!   picks up the next good one.
//!
//! - **`protocol::schema`** – A table, built once at startup from JSON, that
//!   maps each command id to a name and an ordered list of typed fields.
//!
//! - **`protocol::codec`** – One interpreter that walks a schema entry to turn
//!   payload bytes into named values ([`Args`]) and back.
//!
//! - **`protocol::envelope`** – The thin WebSocket frame wrapper the device
//!   puts around protocol frames on its control connection.

pub mod protocol;

pub use protocol::codec::{decode_payload, encode_frame, encode_payload, Args, CodecError, FieldValue};
pub use protocol::commands::{AckStage, AckStatus, StatusQuery, StreamMode};
pub use protocol::envelope::{wrap, wrap_binary, EnvelopeError, Opcode, WsDeframer, WsMessage};
pub use protocol::frame::{crc16, pack, Frame, FrameError, FrameParser, ParserStats};
pub use protocol::schema::{
    CommandDefinition, CommandSchema, FieldDescriptor, FieldType, SchemaBuilder, SchemaError,
};
