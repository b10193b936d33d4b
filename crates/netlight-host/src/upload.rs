//! Stop-and-wait file upload with per-chunk acknowledgement.
//!
//! # Flow (for beginners)
//!
//! ```text
//! BEGIN ──▶ ack(begin)
//! CHUNK @0 ──▶ ack(chunk, 0)      every target acks before the next chunk
//! CHUNK @n ──▶ ack(chunk, n)      no ack within the timeout: resend, same bytes
//! END ──▶ ack(end, digest)        device compares SHA-256 and reports
//! ```
//!
//! Each step clears stale acknowledgements, sends, and waits for an ack that
//! names the same file, stage, and offset.  A failure status aborts that
//! target immediately; silence aborts it after `max_attempts` sends.  With
//! several targets the chunk loop is a barrier: chunk `n + 1` goes out only
//! after every remaining target acknowledged chunk `n`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use netlight_core::protocol::commands::{FILE_BEGIN, FILE_CHUNK, FILE_END};
use netlight_core::protocol::frame::{ADDR_BROADCAST, DEFAULT_MAX_PAYLOAD};
use netlight_core::{encode_frame, AckStage, AckStatus, Args, CodecError, CommandSchema};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransferConfig;
use crate::endpoint::FileAck;

/// FILE_CHUNK bytes ahead of the data: file_id (2) + offset (4).
const CHUNK_OVERHEAD: usize = 6;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("no {stage:?} acknowledgement for offset {offset} after {attempts} attempt(s)")]
    RetriesExhausted {
        stage: AckStage,
        offset: u32,
        attempts: u32,
    },

    #[error("device rejected {stage:?} at offset {offset} with status {status}: {detail}")]
    Rejected {
        stage: AckStage,
        offset: u32,
        status: u8,
        detail: String,
    },

    #[error("digest mismatch: expected {expected}, device computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("no END result within {0:?}")]
    EndTimeout(Duration),

    #[error("peer {0} disconnected")]
    Disconnected(String),

    #[error("file of {0} bytes exceeds the 32-bit size field")]
    TooLarge(usize),

    #[error("failed to encode frame: {0}")]
    Encode(String),
}

impl From<CodecError> for TransferError {
    fn from(e: CodecError) -> Self {
        TransferError::Encode(e.to_string())
    }
}

/// A device the uploader can drive.
///
/// Implemented by [`Endpoint`](crate::endpoint::Endpoint) for real
/// connections and by in-memory fakes in tests.
#[async_trait]
pub trait TransferPeer: Send + Sync {
    fn label(&self) -> &str;

    /// Sends one encoded protocol frame.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransferError>;

    /// Next queued acknowledgement, or `None` after `timeout`.
    async fn wait_ack(&self, timeout: Duration) -> Option<FileAck>;

    /// Discards every queued acknowledgement.
    async fn clear_acks(&self);
}

/// What to upload and where.
#[derive(Debug, Clone)]
pub struct UploadPlan {
    pub file_id: u16,
    pub remote_path: String,
    pub data: Vec<u8>,
    pub chunk_size: usize,
    pub digest: [u8; 32],
}

impl UploadPlan {
    /// Builds a plan and computes the SHA-256 of `data`.
    ///
    /// `chunk_size` is clamped so every FILE_CHUNK fits the default payload
    /// limit; use [`for_transfer`](Self::for_transfer) when devices run with
    /// a different `max_payload`.
    pub fn new(file_id: u16, remote_path: impl Into<String>, data: Vec<u8>, chunk_size: usize) -> Self {
        Self::with_limit(file_id, remote_path, data, chunk_size, DEFAULT_MAX_PAYLOAD)
    }

    /// Builds a plan sized by `config.chunk_size` and `config.max_payload`.
    pub fn for_transfer(
        file_id: u16,
        remote_path: impl Into<String>,
        data: Vec<u8>,
        config: &TransferConfig,
    ) -> Self {
        Self::with_limit(file_id, remote_path, data, config.chunk_size, config.max_payload)
    }

    fn with_limit(
        file_id: u16,
        remote_path: impl Into<String>,
        data: Vec<u8>,
        chunk_size: usize,
        max_payload: usize,
    ) -> Self {
        let digest = Sha256::digest(&data).into();
        let limit = max_payload.saturating_sub(CHUNK_OVERHEAD).max(1);
        Self {
            file_id,
            remote_path: remote_path.into(),
            data,
            chunk_size: chunk_size.clamp(1, limit),
            digest,
        }
    }

    /// Reads `local` into a plan sized by `config`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be read.
    pub fn from_file(
        local: &Path,
        file_id: u16,
        remote_path: impl Into<String>,
        config: &TransferConfig,
    ) -> std::io::Result<Self> {
        Ok(Self::for_transfer(file_id, remote_path, std::fs::read(local)?, config))
    }

    pub fn digest_hex(&self) -> String {
        hex::encode(self.digest)
    }

    /// `(offset, bytes)` for every chunk in increasing offset order.
    pub fn chunks(&self) -> impl Iterator<Item = (u32, &[u8])> + '_ {
        self.data
            .chunks(self.chunk_size)
            .enumerate()
            .map(move |(i, chunk)| ((i * self.chunk_size) as u32, chunk))
    }
}

/// Result of an upload for one target.
#[derive(Debug)]
pub struct TargetReport {
    pub label: String,
    /// Device-computed digest (hex) on success.
    pub result: Result<String, TransferError>,
}

#[derive(Debug)]
pub struct UploadReport {
    pub targets: Vec<TargetReport>,
    pub bytes: usize,
    pub elapsed: Duration,
}

impl UploadReport {
    pub fn all_ok(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| t.result.is_ok())
    }
}

pub struct Uploader {
    schema: Arc<CommandSchema>,
    chunk_timeout: Duration,
    end_timeout: Duration,
    max_attempts: u32,
}

impl Uploader {
    pub fn new(schema: Arc<CommandSchema>, config: &TransferConfig) -> Self {
        Self {
            schema,
            chunk_timeout: config.chunk_timeout(),
            end_timeout: config.end_timeout(),
            max_attempts: config.max_attempts.max(1),
        }
    }

    /// Uploads `plan` to every target, chunk by chunk, in lockstep.
    pub async fn upload(&self, targets: &[Arc<dyn TransferPeer>], plan: &UploadPlan) -> UploadReport {
        let started = Instant::now();
        let mut reports: Vec<TargetReport> = Vec::with_capacity(targets.len());
        let mut active: Vec<&Arc<dyn TransferPeer>> = targets.iter().collect();

        let total = match u32::try_from(plan.data.len()) {
            Ok(total) => total,
            Err(_) => {
                for target in targets {
                    reports.push(TargetReport {
                        label: target.label().to_string(),
                        result: Err(TransferError::TooLarge(plan.data.len())),
                    });
                }
                return UploadReport {
                    targets: reports,
                    bytes: plan.data.len(),
                    elapsed: started.elapsed(),
                };
            }
        };
        info!(
            "upload: {} ({total} bytes, sha256 {}) to {} target(s)",
            plan.remote_path,
            plan.digest_hex(),
            targets.len()
        );

        // ── BEGIN ─────────────────────────────────────────────────────────────
        let begin = Args::new()
            .with("file_id", plan.file_id)
            .with("total_size", total)
            .with("chunk_size", plan.chunk_size as u16)
            .with("sha256", &plan.digest[..])
            .with("path", plan.remote_path.as_str());
        match encode_frame(&self.schema, FILE_BEGIN, &begin, ADDR_BROADCAST) {
            Ok(frame) => {
                let results = join_all(
                    active
                        .iter()
                        .map(|t| self.exchange(t.as_ref(), plan.file_id, &frame, AckStage::Begin, 0)),
                )
                .await;
                active = retain_ok(active, results, &mut reports);
            }
            Err(e) => return self.fail_all(active, reports, e.into(), plan, started),
        }

        // ── CHUNKs ────────────────────────────────────────────────────────────
        let mut sent = 0usize;
        for (offset, data) in plan.chunks() {
            if active.is_empty() {
                break;
            }
            let args = Args::new()
                .with("file_id", plan.file_id)
                .with("offset", offset)
                .with("data", data);
            let frame = match encode_frame(&self.schema, FILE_CHUNK, &args, ADDR_BROADCAST) {
                Ok(frame) => frame,
                Err(e) => return self.fail_all(active, reports, e.into(), plan, started),
            };
            let results = join_all(
                active
                    .iter()
                    .map(|t| self.exchange(t.as_ref(), plan.file_id, &frame, AckStage::Chunk, offset)),
            )
            .await;
            active = retain_ok(active, results, &mut reports);
            sent += data.len();
            debug!("upload: {sent}/{total} bytes acknowledged");
        }

        // ── END ───────────────────────────────────────────────────────────────
        if !active.is_empty() {
            let end = Args::new().with("file_id", plan.file_id);
            match encode_frame(&self.schema, FILE_END, &end, ADDR_BROADCAST) {
                Ok(frame) => {
                    let results =
                        join_all(active.iter().map(|t| self.finish(t.as_ref(), plan, &frame))).await;
                    for (target, result) in active.iter().zip(results) {
                        reports.push(TargetReport {
                            label: target.label().to_string(),
                            result,
                        });
                    }
                }
                Err(e) => return self.fail_all(active, reports, e.into(), plan, started),
            }
        }

        let report = UploadReport {
            targets: reports,
            bytes: plan.data.len(),
            elapsed: started.elapsed(),
        };
        info!(
            "upload: finished in {:.2?}, {}/{} target(s) verified",
            report.elapsed,
            report.targets.iter().filter(|t| t.result.is_ok()).count(),
            report.targets.len()
        );
        report
    }

    /// Sends `frame` until an ok ack for `(stage, offset)` arrives.
    async fn exchange(
        &self,
        peer: &dyn TransferPeer,
        file_id: u16,
        frame: &[u8],
        stage: AckStage,
        offset: u32,
    ) -> Result<(), TransferError> {
        for attempt in 1..=self.max_attempts {
            peer.clear_acks().await;
            peer.send(frame.to_vec()).await?;
            let deadline = Instant::now() + self.chunk_timeout;
            match await_ack(peer, file_id, stage, Some(offset), deadline).await {
                Some(ack) if ack.is_ok() => return Ok(()),
                Some(ack) => {
                    return Err(TransferError::Rejected {
                        stage,
                        offset,
                        status: ack.status,
                        detail: ack.detail,
                    })
                }
                None => warn!(
                    "[{}] no {stage:?} ack for offset {offset} (attempt {attempt}/{})",
                    peer.label(),
                    self.max_attempts
                ),
            }
        }
        Err(TransferError::RetriesExhausted {
            stage,
            offset,
            attempts: self.max_attempts,
        })
    }

    /// Sends END once and interprets the device's verdict.
    async fn finish(
        &self,
        peer: &dyn TransferPeer,
        plan: &UploadPlan,
        frame: &[u8],
    ) -> Result<String, TransferError> {
        peer.clear_acks().await;
        peer.send(frame.to_vec()).await?;
        let deadline = Instant::now() + self.end_timeout;
        let ack = await_ack(peer, plan.file_id, AckStage::End, None, deadline)
            .await
            .ok_or(TransferError::EndTimeout(self.end_timeout))?;

        match AckStatus::try_from(ack.status) {
            Ok(AckStatus::Ok) => {
                info!("[{}] END verified, sha256 {}", peer.label(), ack.detail);
                Ok(ack.detail)
            }
            Ok(AckStatus::DigestMismatch) => Err(TransferError::DigestMismatch {
                expected: plan.digest_hex(),
                actual: ack.detail,
            }),
            _ => Err(TransferError::Rejected {
                stage: AckStage::End,
                offset: ack.offset,
                status: ack.status,
                detail: ack.detail,
            }),
        }
    }

    fn fail_all(
        &self,
        active: Vec<&Arc<dyn TransferPeer>>,
        mut reports: Vec<TargetReport>,
        error: TransferError,
        plan: &UploadPlan,
        started: Instant,
    ) -> UploadReport {
        for target in active {
            reports.push(TargetReport {
                label: target.label().to_string(),
                result: Err(error.clone()),
            });
        }
        UploadReport {
            targets: reports,
            bytes: plan.data.len(),
            elapsed: started.elapsed(),
        }
    }
}

/// Waits for an ack matching `file_id`, `stage`, and (if given) `offset`.
/// Acks for anything else are stale and dropped.
async fn await_ack(
    peer: &dyn TransferPeer,
    file_id: u16,
    stage: AckStage,
    offset: Option<u32>,
    deadline: Instant,
) -> Option<FileAck> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let ack = peer.wait_ack(remaining).await?;
        if ack.file_id == file_id && ack.stage == stage && offset.map_or(true, |o| o == ack.offset) {
            return Some(ack);
        }
        debug!("[{}] stale ack dropped: {ack:?}", peer.label());
    }
}

/// Keeps the targets whose step succeeded; failures go into `reports`.
fn retain_ok<'a>(
    active: Vec<&'a Arc<dyn TransferPeer>>,
    results: Vec<Result<(), TransferError>>,
    reports: &mut Vec<TargetReport>,
) -> Vec<&'a Arc<dyn TransferPeer>> {
    active
        .into_iter()
        .zip(results)
        .filter_map(|(target, result)| match result {
            Ok(()) => Some(target),
            Err(e) => {
                warn!("[{}] transfer aborted: {e}", target.label());
                reports.push(TargetReport {
                    label: target.label().to_string(),
                    result: Err(e),
                });
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlight_core::protocol::frame::{CHECKSUM_SIZE, HEADER_SIZE};

    #[test]
    fn test_plan_chunks_cover_file_in_order() {
        // Arrange
        let plan = UploadPlan::new(1, "/f", (0..=9).collect(), 4);

        // Act
        let chunks: Vec<(u32, Vec<u8>)> = plan.chunks().map(|(o, d)| (o, d.to_vec())).collect();

        // Assert
        assert_eq!(
            chunks,
            vec![(0, vec![0, 1, 2, 3]), (4, vec![4, 5, 6, 7]), (8, vec![8, 9])]
        );
    }

    #[test]
    fn test_plan_clamps_chunk_size_to_payload_limit() {
        let plan = UploadPlan::new(1, "/f", vec![0; 10], 1 << 20);
        assert_eq!(plan.chunk_size, DEFAULT_MAX_PAYLOAD - CHUNK_OVERHEAD);
        assert_eq!(UploadPlan::new(1, "/f", vec![0; 10], 0).chunk_size, 1);
    }

    #[test]
    fn test_plan_chunks_fit_configured_device_payload() {
        // Arrange: devices configured with a 1 KiB payload limit
        let config = TransferConfig {
            chunk_size: 4096,
            max_payload: 1024,
            ..TransferConfig::default()
        };
        let schema = CommandSchema::builtin().unwrap();

        // Act
        let plan = UploadPlan::for_transfer(1, "/f", vec![7; 3000], &config);
        let (offset, data) = plan.chunks().next().unwrap();
        let args = Args::new().with("file_id", 1u16).with("offset", offset).with("data", data);
        let frame = encode_frame(&schema, FILE_CHUNK, &args, ADDR_BROADCAST).unwrap();

        // Assert
        assert_eq!(plan.chunk_size, 1024 - CHUNK_OVERHEAD);
        assert_eq!(frame.len(), HEADER_SIZE + 1024 + CHECKSUM_SIZE);
    }

    #[test]
    fn test_plan_from_file_uses_transfer_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, &[1u8; 600]).unwrap();
        let config = TransferConfig {
            chunk_size: 256,
            ..TransferConfig::default()
        };

        let plan = UploadPlan::from_file(file.path(), 3, "/f", &config).unwrap();

        assert_eq!(plan.chunk_size, 256);
        assert_eq!(plan.chunks().count(), 3);
    }

    #[test]
    fn test_plan_digest_is_sha256_of_data() {
        let plan = UploadPlan::new(1, "/f", b"abc".to_vec(), 512);
        assert_eq!(
            plan.digest_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_empty_plan_has_no_chunks() {
        let plan = UploadPlan::new(1, "/empty", Vec::new(), 512);
        assert_eq!(plan.chunks().count(), 0);
    }
}
