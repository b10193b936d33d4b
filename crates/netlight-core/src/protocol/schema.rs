//! Declarative command schema.
//!
//! A schema document looks like this:
//!
//! ```json
//! {"cmds": [
//!   {"cmd": "0x2002", "name": "FILE_CHUNK", "payload": [
//!     {"type": "u16", "name": "file_id"},
//!     {"type": "u32", "name": "offset"},
//!     {"type": "bytes_rest", "name": "data"}
//!   ]}
//! ]}
//! ```
//!
//! [`SchemaBuilder`] validates documents and produces a [`CommandSchema`],
//! which is immutable afterwards and meant to be shared behind an `Arc`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// The command set every device and host ships with.
pub const BUILTIN_SCHEMA: &str = include_str!("../../schema/netlight.json");

/// Errors raised while loading or validating schema documents.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("failed to parse schema document {origin}: {source}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to read schema path {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid command id {0:?}")]
    InvalidId(String),

    #[error("command id {0} exceeds 0xFFFF")]
    IdOutOfRange(u64),

    #[error("duplicate command id 0x{id:04X} ({first} and {second})")]
    DuplicateId {
        id: u16,
        first: String,
        second: String,
    },

    #[error("command {command}: field {field} is bytes_fixed without len")]
    MissingFixedLength { command: String, field: String },

    #[error("command {command}: bytes_rest field {field} must be the last field")]
    RestNotLast { command: String, field: String },

    #[error("command {command}: field name {field} appears twice")]
    DuplicateField { command: String, field: String },
}

// ── Field descriptors ─────────────────────────────────────────────────────────

/// Wire type of one payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    #[serde(rename = "u8")]
    U8,
    #[serde(rename = "u16")]
    U16,
    #[serde(rename = "u32")]
    U32,
    #[serde(rename = "i16")]
    I16,
    #[serde(rename = "i32")]
    I32,
    /// UTF-8 string behind a little-endian `u16` byte count.
    #[serde(rename = "str_u16len")]
    StrU16Len,
    /// Blob of exactly `len` bytes.
    #[serde(rename = "bytes_fixed")]
    BytesFixed,
    /// Everything left in the payload.  Only valid as the last field.
    #[serde(rename = "bytes_rest")]
    BytesRest,
}

impl FieldType {
    /// Encoded width of fixed-size integer types.
    pub fn int_width(self) -> Option<usize> {
        match self {
            FieldType::U8 => Some(1),
            FieldType::U16 | FieldType::I16 => Some(2),
            FieldType::U32 | FieldType::I32 => Some(4),
            _ => None,
        }
    }
}

/// One `{type, name, len?}` entry of a command's payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<usize>,
}

impl FieldDescriptor {
    pub fn new(field_type: FieldType, name: impl Into<String>) -> Self {
        Self {
            field_type,
            name: name.into(),
            len: None,
        }
    }

    pub fn fixed(name: impl Into<String>, len: usize) -> Self {
        Self {
            field_type: FieldType::BytesFixed,
            name: name.into(),
            len: Some(len),
        }
    }
}

/// A validated command: numeric id, name, ordered fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDefinition {
    pub id: u16,
    pub name: String,
    pub fields: Vec<FieldDescriptor>,
}

impl CommandDefinition {
    /// Checks the structural rules every definition must satisfy.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] for a `bytes_fixed` without `len`, a
    /// `bytes_rest` that is not last, or a repeated field name.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let mut seen = HashSet::new();
        let last = self.fields.len().saturating_sub(1);
        for (idx, field) in self.fields.iter().enumerate() {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    command: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            match field.field_type {
                FieldType::BytesFixed if field.len.is_none() => {
                    return Err(SchemaError::MissingFixedLength {
                        command: self.name.clone(),
                        field: field.name.clone(),
                    });
                }
                FieldType::BytesRest if idx != last => {
                    return Err(SchemaError::RestNotLast {
                        command: self.name.clone(),
                        field: field.name.clone(),
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ── Raw document form ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SchemaDocument {
    #[serde(default)]
    cmds: Vec<RawCommand>,
}

#[derive(Debug, Deserialize)]
struct RawCommand {
    cmd: RawCommandId,
    name: String,
    #[serde(default)]
    payload: Vec<FieldDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawCommandId {
    Number(u64),
    Text(String),
}

/// Parses `8193`, `"8193"`, or `"0x2001"` into a command id.
fn parse_command_id(raw: &RawCommandId) -> Result<u16, SchemaError> {
    let value = match raw {
        RawCommandId::Number(n) => *n,
        RawCommandId::Text(text) => {
            let trimmed = text.trim();
            let parsed = match trimmed
                .strip_prefix("0x")
                .or_else(|| trimmed.strip_prefix("0X"))
            {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => trimmed.parse::<u64>(),
            };
            parsed.map_err(|_| SchemaError::InvalidId(text.clone()))?
        }
    };
    u16::try_from(value).map_err(|_| SchemaError::IdOutOfRange(value))
}

// ── Builder ───────────────────────────────────────────────────────────────────

/// Accumulates validated definitions from one or more documents.
///
/// Inside a single document an id may appear once.  A later document may
/// redefine an id from an earlier one; the later definition wins.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    commands: BTreeMap<u16, CommandDefinition>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from the embedded built-in command set.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] only if the embedded document is malformed.
    pub fn with_builtin() -> Result<Self, SchemaError> {
        let mut builder = Self::new();
        builder.add_document(BUILTIN_SCHEMA, "builtin")?;
        Ok(builder)
    }

    /// Parses and validates one JSON document, merging it into the builder.
    ///
    /// Returns the number of definitions the document contributed.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] on malformed JSON, a bad id, a duplicate id
    /// inside the document, or an invalid field list.  On error the builder
    /// is left unchanged.
    pub fn add_document(&mut self, json: &str, origin: &str) -> Result<usize, SchemaError> {
        let doc: SchemaDocument = serde_json::from_str(json).map_err(|source| SchemaError::Json {
            origin: origin.to_string(),
            source,
        })?;

        let mut staged: BTreeMap<u16, CommandDefinition> = BTreeMap::new();
        for raw in doc.cmds {
            let id = parse_command_id(&raw.cmd)?;
            let def = CommandDefinition {
                id,
                name: raw.name,
                fields: raw.payload,
            };
            def.validate()?;
            if let Some(existing) = staged.get(&id) {
                return Err(SchemaError::DuplicateId {
                    id,
                    first: existing.name.clone(),
                    second: def.name,
                });
            }
            staged.insert(id, def);
        }

        let count = staged.len();
        for (id, def) in staged {
            if let Some(previous) = self.commands.insert(id, def) {
                info!("schema {origin}: 0x{id:04X} overrides {}", previous.name);
            }
        }
        debug!("schema {origin}: {count} command(s) loaded");
        Ok(count)
    }

    /// Merges every `*.json` file in `dir`, in file-name order.
    ///
    /// A missing directory is not an error and contributes nothing.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the directory cannot be listed, a file cannot
    /// be read, or a document fails validation.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize, SchemaError> {
        if !dir.is_dir() {
            debug!("schema dir {} not present, skipping", dir.display());
            return Ok(0);
        }

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source: std::io::Error| SchemaError::Io { path, source }
        };

        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map_err(io_err(dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        files.sort();

        let mut total = 0;
        for path in files {
            let json = fs::read_to_string(&path).map_err(io_err(&path))?;
            total += self.add_document(&json, &path.display().to_string())?;
        }
        Ok(total)
    }

    /// Adds a single programmatic definition, replacing any earlier one.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] if the definition fails validation.
    pub fn add_definition(&mut self, def: CommandDefinition) -> Result<&mut Self, SchemaError> {
        def.validate()?;
        self.commands.insert(def.id, def);
        Ok(self)
    }

    pub fn build(self) -> CommandSchema {
        let by_name = self
            .commands
            .values()
            .map(|def| (def.name.clone(), def.id))
            .collect();
        CommandSchema {
            commands: self.commands.into_iter().collect(),
            by_name,
        }
    }
}

// ── Built schema ──────────────────────────────────────────────────────────────

/// Immutable lookup table from command id to definition.
#[derive(Debug, Clone)]
pub struct CommandSchema {
    commands: HashMap<u16, CommandDefinition>,
    by_name: HashMap<String, u16>,
}

impl CommandSchema {
    /// The built-in command set alone.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError`] only if the embedded document is malformed.
    pub fn builtin() -> Result<Self, SchemaError> {
        Ok(SchemaBuilder::with_builtin()?.build())
    }

    /// The built-in command set with every document in `dir` merged on top.
    ///
    /// # Errors
    ///
    /// See [`SchemaBuilder::load_dir`].
    pub fn load(dir: Option<&Path>) -> Result<Self, SchemaError> {
        let mut builder = SchemaBuilder::with_builtin()?;
        if let Some(dir) = dir {
            let added = builder.load_dir(dir)?;
            if added > 0 {
                info!("schema: merged {added} definition(s) from {}", dir.display());
            }
        }
        Ok(builder.build())
    }

    pub fn get(&self, id: u16) -> Option<&CommandDefinition> {
        self.commands.get(&id)
    }

    pub fn by_name(&self, name: &str) -> Option<&CommandDefinition> {
        self.by_name.get(name).and_then(|id| self.commands.get(id))
    }

    /// Human name for `id`, or a hex placeholder if unknown.
    pub fn name_of(&self, id: u16) -> String {
        self.get(id)
            .map(|def| def.name.clone())
            .unwrap_or_else(|| format!("0x{id:04X}"))
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CommandDefinition> {
        self.commands.values()
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(cmds: &str) -> String {
        format!(r#"{{"cmds": [{cmds}]}}"#)
    }

    #[test]
    fn test_builtin_schema_contains_full_command_set() {
        let schema = CommandSchema::builtin().unwrap();
        assert_eq!(schema.len(), 17);
        let begin = schema.get(0x2001).unwrap();
        assert_eq!(begin.name, "FILE_BEGIN");
        assert_eq!(begin.fields[3].len, Some(32));
        assert_eq!(schema.by_name("STREAM_FRAME").map(|d| d.id), Some(0x3003));
    }

    #[test]
    fn test_ids_accept_number_decimal_string_and_hex() {
        // Arrange
        let json = doc(
            r#"{"cmd": 8193, "name": "A"},
               {"cmd": "8194", "name": "B"},
               {"cmd": "0x2003", "name": "C"}"#,
        );
        let mut builder = SchemaBuilder::new();

        // Act
        let count = builder.add_document(&json, "test").unwrap();
        let schema = builder.build();

        // Assert
        assert_eq!(count, 3);
        assert_eq!(schema.name_of(0x2001), "A");
        assert_eq!(schema.name_of(0x2002), "B");
        assert_eq!(schema.name_of(0x2003), "C");
    }

    #[test]
    fn test_rejects_id_above_u16() {
        let json = doc(r#"{"cmd": "0x10000", "name": "BIG"}"#);
        let err = SchemaBuilder::new().add_document(&json, "test").unwrap_err();
        assert!(matches!(err, SchemaError::IdOutOfRange(0x10000)));
    }

    #[test]
    fn test_rejects_unparseable_id() {
        let json = doc(r#"{"cmd": "0xZZ", "name": "BAD"}"#);
        let err = SchemaBuilder::new().add_document(&json, "test").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidId(_)));
    }

    #[test]
    fn test_rejects_duplicate_id_within_document() {
        let json = doc(r#"{"cmd": 1, "name": "ONE"}, {"cmd": "0x1", "name": "UNO"}"#);
        let err = SchemaBuilder::new().add_document(&json, "test").unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateId { id: 1, .. }));
    }

    #[test]
    fn test_rejects_bytes_fixed_without_len() {
        let json = doc(r#"{"cmd": 1, "name": "X", "payload": [{"type": "bytes_fixed", "name": "h"}]}"#);
        let err = SchemaBuilder::new().add_document(&json, "test").unwrap_err();
        assert!(matches!(err, SchemaError::MissingFixedLength { .. }));
    }

    #[test]
    fn test_rejects_bytes_rest_not_last() {
        let json = doc(
            r#"{"cmd": 1, "name": "X", "payload": [
                {"type": "bytes_rest", "name": "data"},
                {"type": "u8", "name": "tail"}]}"#,
        );
        let err = SchemaBuilder::new().add_document(&json, "test").unwrap_err();
        assert!(matches!(err, SchemaError::RestNotLast { .. }));
    }

    #[test]
    fn test_rejected_document_leaves_builder_unchanged() {
        // Arrange
        let mut builder = SchemaBuilder::new();
        builder
            .add_document(&doc(r#"{"cmd": 1, "name": "KEEP"}"#), "first")
            .unwrap();

        // Act
        let bad = doc(r#"{"cmd": 1, "name": "NEW"}, {"cmd": 1, "name": "DUP"}"#);
        let result = builder.add_document(&bad, "second");

        // Assert
        assert!(result.is_err());
        assert_eq!(builder.build().name_of(1), "KEEP");
    }

    #[test]
    fn test_later_document_overrides_earlier_definition() {
        // Arrange
        let mut builder = SchemaBuilder::with_builtin().unwrap();
        let custom = doc(r#"{"cmd": "0x3001", "name": "STREAM_START", "payload": [{"type": "u8", "name": "fps"}]}"#);

        // Act
        builder.add_document(&custom, "custom").unwrap();
        let schema = builder.build();

        // Assert
        let def = schema.get(0x3001).unwrap();
        assert_eq!(def.fields.len(), 1);
        assert_eq!(def.fields[0].field_type, FieldType::U8);
    }

    #[test]
    fn test_load_dir_merges_json_files_only() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("extra.json"), doc(r#"{"cmd": "0x4001", "name": "PING"}"#)).unwrap();
        fs::write(dir.path().join("notes.txt"), "not a schema").unwrap();

        // Act
        let schema = CommandSchema::load(Some(dir.path())).unwrap();

        // Assert
        assert_eq!(schema.name_of(0x4001), "PING");
        assert_eq!(schema.len(), 18);
    }

    #[test]
    fn test_load_missing_dir_yields_builtin() {
        let schema = CommandSchema::load(Some(Path::new("/definitely/not/here"))).unwrap();
        assert_eq!(schema.len(), 17);
    }

    #[test]
    fn test_name_of_unknown_id_is_hex() {
        let schema = SchemaBuilder::new().build();
        assert_eq!(schema.name_of(0xBEEF), "0xBEEF");
    }
}
