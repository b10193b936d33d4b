//! Chunked file receiver with streaming SHA-256 verification.
//!
//! # Session lifecycle (for beginners)
//!
//! ```text
//! Idle ──BEGIN──▶ Active ──CHUNK──▶ Active ──END──▶ Idle
//!                   │                 │
//!                   └──write error────┴──▶ inactive (chunks rejected)
//! ```
//!
//! BEGIN opens the destination (truncating it) and pre-extends it to the
//! declared size.  Each CHUNK is written at its offset; the file position is
//! only moved when a chunk does not continue where the previous one ended.
//! END flushes, syncs, closes, and compares the finished digest with the one
//! BEGIN promised.
//!
//! The hash accumulator covers the contiguous prefix received so far
//! (`hashed_until`).  Only bytes past that point are hashed, so a resent
//! chunk is rewritten without entering the digest twice.  A chunk that leaves
//! a gap is written but not hashed, and END then reports a mismatch.
//!
//! Only one session exists at a time.  A new BEGIN silently replaces an
//! unfinished one.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use netlight_core::AckStatus;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Length in bytes of a SHA-256 digest.
pub const DIGEST_LEN: usize = 32;

/// Failures of a file transfer step.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("BEGIN requires a path and a 32-byte sha256")]
    MissingPathOrDigest,

    #[error("path {0:?} escapes the storage root")]
    InvalidPath(String),

    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no active transfer session")]
    NoActiveSession,

    #[error("file id {got} does not match active session {expected}")]
    FileIdMismatch { expected: u16, got: u16 },

    #[error("write at offset {offset} failed: {source}")]
    Write {
        offset: u64,
        #[source]
        source: io::Error,
    },

    #[error("failed to finalize file: {0}")]
    Finalize(#[source] io::Error),

    #[error("sha256 mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },
}

impl SessionError {
    /// Code reported to the host in FILE_ACK.
    pub fn ack_status(&self) -> AckStatus {
        match self {
            SessionError::MissingPathOrDigest => AckStatus::MissingPathOrDigest,
            SessionError::InvalidPath(_) | SessionError::Open { .. } => AckStatus::OpenFailed,
            SessionError::NoActiveSession => AckStatus::NoActiveSession,
            SessionError::FileIdMismatch { .. } => AckStatus::FileIdMismatch,
            SessionError::Write { .. } => AckStatus::WriteFailed,
            SessionError::Finalize(_) => AckStatus::FinalizeFailed,
            SessionError::DigestMismatch { .. } => AckStatus::DigestMismatch,
        }
    }
}

/// State of one in-progress transfer.
struct FileTransferSession {
    file_id: u16,
    total_size: u32,
    path: PathBuf,
    expected: [u8; DIGEST_LEN],
    cursor: u64,
    hashed_until: u64,
    hasher: Sha256,
    writer: BufWriter<File>,
    active: bool,
}

/// Receives files delivered by FILE_BEGIN / FILE_CHUNK / FILE_END.
pub struct FileReceiver {
    root: PathBuf,
    session: Option<FileTransferSession>,
    last_error: Option<String>,
    last_digest: Option<[u8; DIGEST_LEN]>,
    expected: Option<[u8; DIGEST_LEN]>,
}

impl FileReceiver {
    /// Creates a receiver that resolves every BEGIN path below `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            session: None,
            last_error: None,
            last_digest: None,
            expected: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.active)
    }

    /// File id of the current session, active or not.
    pub fn file_id(&self) -> Option<u16> {
        self.session.as_ref().map(|s| s.file_id)
    }

    /// Current write cursor of the session.
    pub fn cursor(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.cursor)
    }

    /// `(file_id, total_size, cursor)` of the active session.
    pub fn progress(&self) -> Option<(u16, u32, u64)> {
        self.session
            .as_ref()
            .filter(|s| s.active)
            .map(|s| (s.file_id, s.total_size, s.cursor))
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Digest computed by the most recent END.
    pub fn last_digest(&self) -> Option<&[u8; DIGEST_LEN]> {
        self.last_digest.as_ref()
    }

    /// Digest the most recent BEGIN promised.
    pub fn expected(&self) -> Option<&[u8; DIGEST_LEN]> {
        self.expected.as_ref()
    }

    /// Starts a session, replacing any unfinished one.
    ///
    /// # Errors
    ///
    /// [`SessionError::MissingPathOrDigest`] if `path` is empty or `sha256` is
    /// not 32 bytes, [`SessionError::InvalidPath`] for a path with `..`, and
    /// [`SessionError::Open`] if the destination cannot be created.  In every
    /// case no session is active afterwards.
    pub fn begin(
        &mut self,
        file_id: u16,
        total_size: u32,
        path: Option<&str>,
        sha256: Option<&[u8]>,
    ) -> Result<(), SessionError> {
        if let Some(old) = self.session.take() {
            if old.active {
                warn!(
                    "file_rx: discarding unfinished transfer {} ({}/{} bytes)",
                    old.file_id, old.cursor, old.total_size
                );
            }
        }

        let result = self.open_session(file_id, total_size, path, sha256);
        match result {
            Ok(session) => {
                info!(
                    "file_rx: BEGIN id={file_id} size={total_size} path={}",
                    session.path.display()
                );
                self.expected = Some(session.expected);
                self.last_error = None;
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                warn!("file_rx: BEGIN id={file_id} rejected: {e}");
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    fn open_session(
        &self,
        file_id: u16,
        total_size: u32,
        path: Option<&str>,
        sha256: Option<&[u8]>,
    ) -> Result<FileTransferSession, SessionError> {
        let path = path
            .filter(|p| !p.is_empty())
            .ok_or(SessionError::MissingPathOrDigest)?;
        let expected: [u8; DIGEST_LEN] = sha256
            .and_then(|d| d.try_into().ok())
            .ok_or(SessionError::MissingPathOrDigest)?;

        let dest = self.resolve(path)?;
        let open_err = |source: io::Error| SessionError::Open {
            path: dest.clone(),
            source,
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(open_err)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&dest)
            .map_err(open_err)?;
        file.set_len(u64::from(total_size)).map_err(open_err)?;

        Ok(FileTransferSession {
            file_id,
            total_size,
            path: dest,
            expected,
            cursor: 0,
            hashed_until: 0,
            hasher: Sha256::new(),
            writer: BufWriter::new(file),
            active: true,
        })
    }

    /// Maps a device path like `/show/a.bin` below the storage root.
    fn resolve(&self, path: &str) -> Result<PathBuf, SessionError> {
        let mut dest = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(part) => dest.push(part),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(SessionError::InvalidPath(path.to_string()));
                }
            }
        }
        if dest == self.root {
            return Err(SessionError::MissingPathOrDigest);
        }
        Ok(dest)
    }

    /// Writes one chunk and returns the new cursor.
    ///
    /// # Errors
    ///
    /// [`SessionError::NoActiveSession`] or [`SessionError::FileIdMismatch`]
    /// leave everything untouched.  [`SessionError::Write`] deactivates the
    /// session so every later chunk is rejected.
    pub fn chunk(&mut self, file_id: u16, offset: u32, data: &[u8]) -> Result<u64, SessionError> {
        let session = self.active_session(file_id)?;

        let offset = u64::from(offset);
        let written = (|| {
            if offset != session.cursor {
                debug!("file_rx: seek {} -> {offset}", session.cursor);
                session.writer.seek(SeekFrom::Start(offset))?;
                session.cursor = offset;
            }
            session.writer.write_all(data)
        })();

        match written {
            Ok(()) => {
                let end = offset + data.len() as u64;
                session.cursor = end;
                if offset <= session.hashed_until && end > session.hashed_until {
                    let fresh = (session.hashed_until - offset) as usize;
                    session.hasher.update(&data[fresh..]);
                    session.hashed_until = end;
                } else if end <= session.hashed_until {
                    debug!("file_rx: {offset}..{end} already received, rewritten only");
                } else {
                    warn!(
                        "file_rx: chunk at {offset} leaves a gap after {}, not hashed",
                        session.hashed_until
                    );
                }
                Ok(session.cursor)
            }
            Err(source) => {
                session.active = false;
                let err = SessionError::Write { offset, source };
                warn!("file_rx: {err}; session {file_id} deactivated");
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Finishes the session and verifies the digest.
    ///
    /// Returns the computed digest on success.
    ///
    /// # Errors
    ///
    /// [`SessionError::DigestMismatch`] when the content does not hash to the
    /// promised value; both digests stay available through
    /// [`last_digest`](Self::last_digest) and [`expected`](Self::expected).
    pub fn end(&mut self, file_id: u16) -> Result<[u8; DIGEST_LEN], SessionError> {
        self.active_session(file_id)?;
        let Some(session) = self.session.take() else {
            return Err(SessionError::NoActiveSession);
        };

        let FileTransferSession {
            path,
            expected,
            hasher,
            writer,
            cursor,
            ..
        } = session;

        let finished = writer
            .into_inner()
            .map_err(|e| e.into_error())
            .and_then(|file| file.sync_all());
        if let Err(source) = finished {
            let err = SessionError::Finalize(source);
            self.last_error = Some(err.to_string());
            return Err(err);
        }

        let digest: [u8; DIGEST_LEN] = hasher.finalize().into();
        self.last_digest = Some(digest);
        self.expected = Some(expected);

        if digest == expected {
            info!(
                "file_rx: END id={file_id} ok ({cursor} bytes) -> {}",
                path.display()
            );
            self.last_error = None;
            Ok(digest)
        } else {
            let err = SessionError::DigestMismatch {
                expected: hex::encode(expected),
                actual: hex::encode(digest),
            };
            warn!("file_rx: END id={file_id}: {err}");
            self.last_error = Some(err.to_string());
            Err(err)
        }
    }

    fn active_session(&mut self, file_id: u16) -> Result<&mut FileTransferSession, SessionError> {
        let session = self
            .session
            .as_mut()
            .filter(|s| s.active)
            .ok_or(SessionError::NoActiveSession)?;
        if session.file_id != file_id {
            return Err(SessionError::FileIdMismatch {
                expected: session.file_id,
                got: file_id,
            });
        }
        Ok(session)
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
