//! Persisted device status document.
//!
//! A flat JSON object kept on the device filesystem.  It is created with
//! defaults on first boot, read by STATUS_GET, and merged by STATUS_UPDATE.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("I/O error accessing status file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid status JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("status update must be a JSON object")]
    NotAnObject,
}

/// Document written on first boot.
pub fn default_status() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("server_ip".into(), json!("0.0.0.0"));
    map.insert("server_port".into(), json!(8000));
    map.insert("auto_connect".into(), json!(false));
    map.insert("pixel_count".into(), json!(400));
    map.insert("last_update".into(), json!(0));
    map
}

#[derive(Debug)]
pub struct StatusStore {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl StatusStore {
    /// Loads the document at `path`, creating it with defaults if absent.
    ///
    /// A file that exists but cannot be parsed is left on disk untouched and
    /// the store starts from defaults.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Io`] if the file exists but cannot be read, or
    /// if the default document cannot be written.
    pub fn load_or_create(path: impl Into<PathBuf>) -> Result<Self, StatusError> {
        let path = path.into();
        match fs::read_to_string(&path) {
            Ok(text) => {
                let doc = match serde_json::from_str::<Value>(&text) {
                    Ok(Value::Object(map)) => map,
                    Ok(_) | Err(_) => {
                        warn!("status: {} is not a JSON object, using defaults", path.display());
                        default_status()
                    }
                };
                info!("status: loaded {}", path.display());
                Ok(Self { path, doc })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let store = Self {
                    path,
                    doc: default_status(),
                };
                store.save()?;
                info!("status: created default {}", store.path.display());
                Ok(store)
            }
            Err(source) => Err(StatusError::Io { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> &Map<String, Value> {
        &self.doc
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.doc.get(key)
    }

    /// Merges the top-level keys of `json` in, stamps `last_update`, and saves.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Json`] or [`StatusError::NotAnObject`] without
    /// touching the document, or [`StatusError::Io`] if saving fails (the
    /// in-memory document keeps the update).
    pub fn merge(&mut self, json: &str) -> Result<(), StatusError> {
        let Value::Object(update) = serde_json::from_str::<Value>(json)? else {
            return Err(StatusError::NotAnObject);
        };
        self.doc.extend(update);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.doc.insert("last_update".to_string(), Value::from(now));
        self.save()
    }

    /// Writes the document to disk.
    ///
    /// # Errors
    ///
    /// Returns [`StatusError::Io`] on file-system failure.
    pub fn save(&self) -> Result<(), StatusError> {
        let io_err = |source: io::Error| StatusError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }
        let text = serde_json::to_string_pretty(&self.doc)?;
        fs::write(&self.path, text).map_err(io_err)
    }
}
