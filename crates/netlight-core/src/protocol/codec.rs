//! Schema-driven payload codec.
//!
//! One interpreter walks a [`CommandDefinition`]'s field list to turn payload
//! bytes into an ordered [`Args`] map and back.  Integers are little-endian;
//! strings carry a little-endian `u16` byte count.
//!
//! Decoding is lenient: it stops at the first truncated or invalid field and
//! returns whatever was decoded up to that point.  Encoding never fails:
//! missing values become zero defaults and oversized values are narrowed.

use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::protocol::frame::{pack, FrameError};
use crate::protocol::schema::{CommandDefinition, CommandSchema, FieldDescriptor, FieldType};

/// Errors raised when building a frame from named arguments.
#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("command 0x{0:04X} is not in the schema")]
    UnknownCommand(u16),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

// ── Values ────────────────────────────────────────────────────────────────────

/// A decoded field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    U8(u8),
    U16(u16),
    U32(u32),
    I16(i16),
    I32(i32),
    Str(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Integer view of any numeric variant.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::U8(v) => Some(i64::from(v)),
            FieldValue::U16(v) => Some(i64::from(v)),
            FieldValue::U32(v) => Some(i64::from(v)),
            FieldValue::I16(v) => Some(i64::from(v)),
            FieldValue::I32(v) => Some(i64::from(v)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of a blob or a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

impl From<u8> for FieldValue {
    fn from(v: u8) -> Self {
        FieldValue::U8(v)
    }
}

impl From<u16> for FieldValue {
    fn from(v: u16) -> Self {
        FieldValue::U16(v)
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::U32(v)
    }
}

impl From<i16> for FieldValue {
    fn from(v: i16) -> Self {
        FieldValue::I16(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::I32(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::U8(u8::from(v))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(v: Vec<u8>) -> Self {
        FieldValue::Bytes(v)
    }
}

impl From<&[u8]> for FieldValue {
    fn from(v: &[u8]) -> Self {
        FieldValue::Bytes(v.to_vec())
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Str(s) if s.len() > 64 => {
                let head: String = s.chars().take(48).collect();
                write!(f, "{head:?}..({} bytes)", s.len())
            }
            FieldValue::Str(s) => write!(f, "{s:?}"),
            FieldValue::Bytes(b) if b.len() > 16 => write!(f, "<{} bytes>", b.len()),
            FieldValue::Bytes(b) => {
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
            other => write!(f, "{}", other.as_i64().unwrap_or_default()),
        }
    }
}

// ── Args ──────────────────────────────────────────────────────────────────────

/// Ordered name → value map produced by decode and consumed by encode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    entries: Vec<(String, FieldValue)>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Sets `name`, replacing an existing value in place.
    pub fn insert(&mut self, name: &str, value: impl Into<FieldValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn get_u8(&self, name: &str) -> Option<u8> {
        self.int(name).and_then(|v| u8::try_from(v).ok())
    }

    pub fn get_u16(&self, name: &str) -> Option<u16> {
        self.int(name).and_then(|v| u16::try_from(v).ok())
    }

    pub fn get_u32(&self, name: &str) -> Option<u32> {
        self.int(name).and_then(|v| u32::try_from(v).ok())
    }

    pub fn get_i16(&self, name: &str) -> Option<i16> {
        self.int(name).and_then(|v| i16::try_from(v).ok())
    }

    pub fn get_i32(&self, name: &str) -> Option<i32> {
        self.int(name).and_then(|v| i32::try_from(v).ok())
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_str)
    }

    pub fn get_bytes(&self, name: &str) -> Option<&[u8]> {
        self.get(name).and_then(FieldValue::as_bytes)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    fn int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(FieldValue::as_i64)
    }
}

impl fmt::Display for Args {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (idx, (name, value)) in self.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str("}")
    }
}

// ── Decode ────────────────────────────────────────────────────────────────────

/// Decodes `payload` against `def`, stopping early on truncation.
///
/// Total bytes consumed never exceed `payload.len()`.
pub fn decode_payload(def: &CommandDefinition, payload: &[u8]) -> Args {
    let mut args = Args::new();
    let mut pos = 0;
    for field in &def.fields {
        if pos >= payload.len() && field.field_type != FieldType::BytesRest {
            break;
        }
        match read_field(field, &payload[pos..]) {
            Some((value, used)) => {
                args.entries.push((field.name.clone(), value));
                pos += used;
            }
            None => {
                debug!(
                    "{}: field {} truncated or invalid at offset {pos}, stopping",
                    def.name, field.name
                );
                break;
            }
        }
    }
    args
}

fn read_field(field: &FieldDescriptor, data: &[u8]) -> Option<(FieldValue, usize)> {
    fn take<const N: usize>(data: &[u8]) -> Option<[u8; N]> {
        data.get(..N).and_then(|s| s.try_into().ok())
    }

    let decoded = match field.field_type {
        FieldType::U8 => (FieldValue::U8(take::<1>(data)?[0]), 1),
        FieldType::U16 => (FieldValue::U16(u16::from_le_bytes(take(data)?)), 2),
        FieldType::U32 => (FieldValue::U32(u32::from_le_bytes(take(data)?)), 4),
        FieldType::I16 => (FieldValue::I16(i16::from_le_bytes(take(data)?)), 2),
        FieldType::I32 => (FieldValue::I32(i32::from_le_bytes(take(data)?)), 4),
        FieldType::StrU16Len => {
            let len = usize::from(u16::from_le_bytes(take(data)?));
            let bytes = data.get(2..2 + len)?;
            let text = std::str::from_utf8(bytes).ok()?;
            (FieldValue::Str(text.to_string()), 2 + len)
        }
        FieldType::BytesFixed => {
            let len = field.len.unwrap_or(0);
            (FieldValue::Bytes(data.get(..len)?.to_vec()), len)
        }
        FieldType::BytesRest => (FieldValue::Bytes(data.to_vec()), data.len()),
    };
    Some(decoded)
}

// ── Encode ────────────────────────────────────────────────────────────────────

/// Encodes `args` against `def`.
///
/// Missing values are written as zero defaults, integers are narrowed to the
/// field width, fixed blobs are truncated or zero-padded to `len`, and strings
/// longer than 65535 bytes are truncated.
pub fn encode_payload(def: &CommandDefinition, args: &Args) -> Vec<u8> {
    let mut out = Vec::new();
    for field in &def.fields {
        write_field(field, args.get(&field.name), &mut out);
    }
    out
}

fn write_field(field: &FieldDescriptor, value: Option<&FieldValue>, out: &mut Vec<u8>) {
    let int = value.and_then(FieldValue::as_i64).unwrap_or(0);
    match field.field_type {
        FieldType::U8 => out.push(int as u8),
        FieldType::U16 => out.extend_from_slice(&(int as u16).to_le_bytes()),
        FieldType::U32 => out.extend_from_slice(&(int as u32).to_le_bytes()),
        FieldType::I16 => out.extend_from_slice(&(int as i16).to_le_bytes()),
        FieldType::I32 => out.extend_from_slice(&(int as i32).to_le_bytes()),
        FieldType::StrU16Len => {
            let text = match value {
                Some(FieldValue::Str(s)) => s.clone(),
                Some(FieldValue::Bytes(b)) => String::from_utf8_lossy(b).into_owned(),
                Some(other) => other.to_string(),
                None => String::new(),
            };
            let bytes = text.as_bytes();
            let len = bytes.len().min(usize::from(u16::MAX));
            out.extend_from_slice(&(len as u16).to_le_bytes());
            out.extend_from_slice(&bytes[..len]);
        }
        FieldType::BytesFixed => {
            let len = field.len.unwrap_or(0);
            let src = value.and_then(FieldValue::as_bytes).unwrap_or_default();
            let copy = src.len().min(len);
            out.extend_from_slice(&src[..copy]);
            out.resize(out.len() + (len - copy), 0);
        }
        FieldType::BytesRest => {
            out.extend_from_slice(value.and_then(FieldValue::as_bytes).unwrap_or_default());
        }
    }
}

/// Looks up `cmd`, encodes `args`, and packs the result into a frame.
///
/// # Errors
///
/// Returns [`CodecError::UnknownCommand`] if `cmd` is not in the schema, or
/// [`CodecError::Frame`] if the encoded payload is too large.
pub fn encode_frame(
    schema: &CommandSchema,
    cmd: u16,
    args: &Args,
    addr: u16,
) -> Result<Vec<u8>, CodecError> {
    let def = schema.get(cmd).ok_or(CodecError::UnknownCommand(cmd))?;
    let payload = encode_payload(def, args);
    Ok(pack(cmd, &payload, addr)?)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn def(fields: Vec<FieldDescriptor>) -> CommandDefinition {
        CommandDefinition {
            id: 0x7000,
            name: "TEST".to_string(),
            fields,
        }
    }

    #[test]
    fn test_decode_stops_at_truncated_field() {
        // Arrange: u16 present, u32 only half there
        let d = def(vec![
            FieldDescriptor::new(FieldType::U16, "a"),
            FieldDescriptor::new(FieldType::U32, "b"),
            FieldDescriptor::new(FieldType::U8, "c"),
        ]);

        // Act
        let args = decode_payload(&d, &[0x34, 0x12, 0xFF, 0xFF]);

        // Assert
        assert_eq!(args.len(), 1);
        assert_eq!(args.get_u16("a"), Some(0x1234));
        assert!(!args.contains("b"));
    }

    #[test]
    fn test_decode_bytes_rest_on_exhausted_payload_is_empty() {
        let d = def(vec![
            FieldDescriptor::new(FieldType::U8, "id"),
            FieldDescriptor::new(FieldType::BytesRest, "data"),
        ]);
        let args = decode_payload(&d, &[9]);
        assert_eq!(args.get_u8("id"), Some(9));
        assert_eq!(args.get_bytes("data"), Some(&[][..]));
    }

    #[test]
    fn test_decode_stops_on_invalid_utf8() {
        let d = def(vec![
            FieldDescriptor::new(FieldType::StrU16Len, "s"),
            FieldDescriptor::new(FieldType::U8, "after"),
        ]);
        let args = decode_payload(&d, &[2, 0, 0xC3, 0x28, 7]);
        assert!(args.is_empty());
    }

    #[test]
    fn test_decode_string_longer_than_payload_stops() {
        let d = def(vec![FieldDescriptor::new(FieldType::StrU16Len, "s")]);
        let args = decode_payload(&d, &[10, 0, b'a', b'b']);
        assert!(args.is_empty());
    }

    #[test]
    fn test_encode_fills_zero_defaults() {
        // Arrange
        let d = def(vec![
            FieldDescriptor::new(FieldType::U16, "n"),
            FieldDescriptor::new(FieldType::StrU16Len, "s"),
            FieldDescriptor::fixed("h", 4),
            FieldDescriptor::new(FieldType::BytesRest, "rest"),
        ]);

        // Act
        let bytes = encode_payload(&d, &Args::new());

        // Assert
        assert_eq!(bytes, vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_narrows_integers_to_field_width() {
        let d = def(vec![
            FieldDescriptor::new(FieldType::U8, "a"),
            FieldDescriptor::new(FieldType::I16, "b"),
        ]);
        let args = Args::new().with("a", 0x1FFu32).with("b", -1i32);
        assert_eq!(encode_payload(&d, &args), vec![0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_encode_pads_and_truncates_fixed_blob() {
        let d = def(vec![FieldDescriptor::fixed("h", 3)]);
        let short = Args::new().with("h", vec![1u8]);
        let long = Args::new().with("h", vec![1u8, 2, 3, 4, 5]);
        assert_eq!(encode_payload(&d, &short), vec![1, 0, 0]);
        assert_eq!(encode_payload(&d, &long), vec![1, 2, 3]);
    }

    #[test]
    fn test_encode_truncates_oversized_string() {
        // Arrange
        let d = def(vec![FieldDescriptor::new(FieldType::StrU16Len, "s")]);
        let text = "x".repeat(70_000);

        // Act
        let bytes = encode_payload(&d, &Args::new().with("s", text));

        // Assert
        assert_eq!(&bytes[..2], &u16::MAX.to_le_bytes());
        assert_eq!(bytes.len(), 2 + usize::from(u16::MAX));
    }

    #[test]
    fn test_args_insert_replaces_in_place() {
        let mut args = Args::new().with("a", 1u8).with("b", 2u8);
        args.insert("a", 9u8);
        let names: Vec<&str> = args.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(args.get_u8("a"), Some(9));
    }

    #[test]
    fn test_typed_getter_rejects_out_of_range() {
        let args = Args::new().with("v", 300u16);
        assert_eq!(args.get_u8("v"), None);
        assert_eq!(args.get_u32("v"), Some(300));
    }

    #[test]
    fn test_encode_frame_unknown_command() {
        let schema = CommandSchema::builtin().unwrap();
        let err = encode_frame(&schema, 0xDEAD, &Args::new(), 0).unwrap_err();
        assert_eq!(err, CodecError::UnknownCommand(0xDEAD));
    }

    #[test]
    fn test_args_display_summarises_blobs() {
        let args = Args::new().with("id", 1u16).with("data", vec![0u8; 100]);
        assert_eq!(args.to_string(), "{id=1, data=<100 bytes>}");
    }
}
