//! Command identifiers of the built-in schema and the small enumerations
//! carried inside their payloads.

use serde::{Deserialize, Serialize};

// ── Command ids ───────────────────────────────────────────────────────────────

// Discovery and system (0x10xx)
pub const DISCOVER: u16 = 0x1001;
pub const ANNOUNCE: u16 = 0x1002;
pub const SYS_INFO_GET: u16 = 0x1003;
pub const SYS_INFO_RSP: u16 = 0x1004;

// Status store (0x11xx)
pub const STATUS_GET: u16 = 0x1101;
pub const STATUS_RSP: u16 = 0x1102;
pub const STATUS_UPDATE: u16 = 0x1103;
pub const STATUS_UPDATE_ACK: u16 = 0x1104;

// Liveness (0x12xx)
pub const HEARTBEAT: u16 = 0x1201;
pub const HEARTBEAT_ACK: u16 = 0x1202;

// File transfer (0x20xx)
pub const FILE_BEGIN: u16 = 0x2001;
pub const FILE_CHUNK: u16 = 0x2002;
pub const FILE_END: u16 = 0x2003;
pub const FILE_ACK: u16 = 0x2004;

// Streaming (0x30xx)
pub const STREAM_START: u16 = 0x3001;
pub const STREAM_STOP: u16 = 0x3002;
pub const STREAM_FRAME: u16 = 0x3003;

// ── FILE_ACK fields ───────────────────────────────────────────────────────────

/// Which transfer step a FILE_ACK answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckStage {
    Begin = 0,
    Chunk = 1,
    End = 2,
}

impl TryFrom<u8> for AckStage {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AckStage::Begin),
            1 => Ok(AckStage::Chunk),
            2 => Ok(AckStage::End),
            _ => Err(()),
        }
    }
}

/// Outcome code carried in a FILE_ACK.  Zero is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckStatus {
    Ok = 0,
    MissingPathOrDigest = 1,
    OpenFailed = 2,
    NoActiveSession = 3,
    FileIdMismatch = 4,
    WriteFailed = 5,
    FinalizeFailed = 6,
    DigestMismatch = 7,
}

impl AckStatus {
    pub fn is_ok(self) -> bool {
        self == AckStatus::Ok
    }
}

impl TryFrom<u8> for AckStatus {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(AckStatus::Ok),
            1 => Ok(AckStatus::MissingPathOrDigest),
            2 => Ok(AckStatus::OpenFailed),
            3 => Ok(AckStatus::NoActiveSession),
            4 => Ok(AckStatus::FileIdMismatch),
            5 => Ok(AckStatus::WriteFailed),
            6 => Ok(AckStatus::FinalizeFailed),
            7 => Ok(AckStatus::DigestMismatch),
            _ => Err(()),
        }
    }
}

// ── STREAM_START / STATUS_GET fields ──────────────────────────────────────────

/// Where the render loop takes its pixels from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum StreamMode {
    /// Locally generated effects or pre-recorded playback.
    #[default]
    Local = 0,
    /// Frames pushed by the host via STREAM_FRAME.
    Direct = 1,
}

impl TryFrom<u8> for StreamMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StreamMode::Local),
            1 => Ok(StreamMode::Direct),
            _ => Err(()),
        }
    }
}

/// Which part of the status document STATUS_GET asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StatusQuery {
    Config = 0,
    Runtime = 1,
    Both = 2,
}

impl TryFrom<u8> for StatusQuery {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(StatusQuery::Config),
            1 => Ok(StatusQuery::Runtime),
            2 => Ok(StatusQuery::Both),
            _ => Err(()),
        }
    }
}
