//! Protocol module containing the frame layer, the command schema, the field
//! codec, and the WebSocket envelope used by the control bus.

pub mod codec;
pub mod commands;
pub mod envelope;
pub mod frame;
pub mod schema;

pub use codec::{decode_payload, encode_frame, encode_payload, Args, CodecError, FieldValue};
pub use envelope::{wrap_binary, Opcode, WsDeframer, WsMessage};
pub use frame::{crc16, pack, Frame, FrameError, FrameParser};
pub use schema::{CommandDefinition, CommandSchema, SchemaBuilder, SchemaError};
