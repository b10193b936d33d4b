//! Uploader behaviour against scripted in-memory peers.
//!
//! `FakePeer` decodes every frame the uploader sends and hands it to a real
//! device [`FileReceiver`] on a temporary directory, except where the script
//! says to lose the frame, delay its ack, fail, or corrupt the data.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use netlight_core::protocol::commands::{FILE_BEGIN, FILE_CHUNK, FILE_END};
use netlight_core::{decode_payload, AckStage, AckStatus, CommandSchema, FrameParser};
use netlight_device::file_rx::FileReceiver;
use netlight_host::config::TransferConfig;
use netlight_host::endpoint::FileAck;
use netlight_host::upload::{TransferError, TransferPeer, UploadPlan, Uploader};
use tempfile::TempDir;
use tokio::time::Instant;

#[derive(Default)]
struct Script {
    /// Frames lost in transit, keyed by (stage, offset).
    drops: HashMap<(AckStage, u32), u32>,
    /// Frames delivered whose ack arrives late, keyed by (stage, offset).
    delays: HashMap<(AckStage, u32), (u32, Duration)>,
    /// Answer this step with a failure status.
    fail: Option<(AckStage, u32, AckStatus)>,
    /// Never answer anything.
    silent: bool,
    /// Flip the first byte of chunk 0 on its way to storage.
    corrupt: bool,
}

struct State {
    script: Script,
    /// Acks with the instant they reach the host.
    acks: VecDeque<(Instant, FileAck)>,
    rx: FileReceiver,
    sends: Vec<(u16, u32)>,
}

struct FakePeer {
    label: String,
    schema: CommandSchema,
    dir: TempDir,
    state: Mutex<State>,
}

impl FakePeer {
    fn new(label: &str, script: Script) -> Arc<Self> {
        let dir = tempfile::tempdir().unwrap();
        let rx = FileReceiver::new(dir.path());
        Arc::new(Self {
            label: label.to_string(),
            schema: CommandSchema::builtin().unwrap(),
            dir,
            state: Mutex::new(State {
                script,
                acks: VecDeque::new(),
                rx,
                sends: Vec::new(),
            }),
        })
    }

    fn sends(&self) -> Vec<(u16, u32)> {
        self.state.lock().unwrap().sends.clone()
    }

    fn stored(&self) -> Vec<u8> {
        std::fs::read(self.dir.path().join("data.bin")).unwrap_or_default()
    }
}

#[async_trait]
impl TransferPeer for FakePeer {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, frame: Vec<u8>) -> Result<(), TransferError> {
        let mut parser = FrameParser::new();
        parser.feed(&frame);
        let frame = parser.try_parse_one().expect("uploader sent a valid frame");
        let args = decode_payload(self.schema.get(frame.cmd).unwrap(), &frame.payload);
        let file_id = args.get_u16("file_id").unwrap_or_default();

        let mut state = self.state.lock().unwrap();
        let (stage, offset) = match frame.cmd {
            FILE_BEGIN => (AckStage::Begin, 0),
            FILE_CHUNK => (AckStage::Chunk, args.get_u32("offset").unwrap()),
            FILE_END => (AckStage::End, state.rx.cursor().unwrap_or_default() as u32),
            other => panic!("unexpected command 0x{other:04X}"),
        };
        state.sends.push((frame.cmd, offset));

        if state.script.silent {
            return Ok(());
        }
        if let Some(left) = state.script.drops.get_mut(&(stage, offset)) {
            if *left > 0 {
                *left -= 1;
                return Ok(());
            }
        }
        if let Some((fail_stage, fail_offset, status)) = state.script.fail {
            if fail_stage == stage && fail_offset == offset {
                state.acks.push_back((
                    Instant::now(),
                    FileAck {
                        file_id,
                        offset,
                        stage,
                        status: status as u8,
                        detail: "scripted failure".into(),
                    },
                ));
                return Ok(());
            }
        }

        let result = match stage {
            AckStage::Begin => state
                .rx
                .begin(
                    file_id,
                    args.get_u32("total_size").unwrap_or_default(),
                    args.get_str("path"),
                    args.get_bytes("sha256"),
                )
                .map(|()| String::new()),
            AckStage::Chunk => {
                let mut data = args.get_bytes("data").unwrap_or_default().to_vec();
                if state.script.corrupt && offset == 0 {
                    if let Some(first) = data.first_mut() {
                        *first ^= 0xFF;
                    }
                }
                state.rx.chunk(file_id, offset, &data).map(|_| String::new())
            }
            AckStage::End => state.rx.end(file_id).map(hex::encode),
        };
        let (status, detail) = match result {
            Ok(detail) => (AckStatus::Ok, detail),
            Err(e) => {
                let detail = match state.rx.last_digest() {
                    Some(digest) if stage == AckStage::End => hex::encode(digest),
                    _ => e.to_string(),
                };
                (e.ack_status(), detail)
            }
        };

        let mut ready = Instant::now();
        if let Some((left, delay)) = state.script.delays.get_mut(&(stage, offset)) {
            if *left > 0 {
                *left -= 1;
                ready += *delay;
            }
        }
        state.acks.push_back((
            ready,
            FileAck {
                file_id,
                offset,
                stage,
                status: status as u8,
                detail,
            },
        ));
        Ok(())
    }

    async fn wait_ack(&self, timeout: Duration) -> Option<FileAck> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock().unwrap();
                if matches!(state.acks.front(), Some((ready, _)) if *ready <= Instant::now()) {
                    return state.acks.pop_front().map(|(_, ack)| ack);
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(2))).await;
        }
    }

    /// Only acks that already arrived can be discarded.
    async fn clear_acks(&self) {
        let now = Instant::now();
        self.state.lock().unwrap().acks.retain(|(ready, _)| *ready > now);
    }
}

fn uploader(max_attempts: u32) -> Uploader {
    let config = TransferConfig {
        chunk_size: 4,
        chunk_timeout_ms: 20,
        max_attempts,
        end_timeout_ms: 50,
        ..TransferConfig::default()
    };
    Uploader::new(Arc::new(CommandSchema::builtin().unwrap()), &config)
}

fn plan() -> UploadPlan {
    UploadPlan::new(7, "/data.bin", b"0123456789".to_vec(), 4)
}

fn chunk_sends(peer: &FakePeer) -> Vec<u32> {
    peer.sends()
        .into_iter()
        .filter(|(cmd, _)| *cmd == FILE_CHUNK)
        .map(|(_, offset)| offset)
        .collect()
}

#[tokio::test]
async fn test_clean_upload_reports_device_digest() {
    // Arrange
    let peer = FakePeer::new("NL-A", Script::default());
    let plan = plan();

    // Act
    let report = uploader(3).upload(&[peer.clone() as Arc<dyn TransferPeer>], &plan).await;

    // Assert
    assert!(report.all_ok());
    assert_eq!(report.targets[0].result, Ok(plan.digest_hex()));
    assert_eq!(peer.stored(), b"0123456789");
    assert_eq!(chunk_sends(&peer), vec![0, 4, 8]);
}

#[tokio::test]
async fn test_missing_ack_resends_same_chunk() {
    // Arrange
    let mut script = Script::default();
    script.drops.insert((AckStage::Chunk, 4), 2);
    let peer = FakePeer::new("NL-A", script);

    // Act
    let report = uploader(5).upload(&[peer.clone() as Arc<dyn TransferPeer>], &plan()).await;

    // Assert
    assert!(report.all_ok());
    assert_eq!(chunk_sends(&peer), vec![0, 4, 4, 4, 8]);
    assert_eq!(peer.stored(), b"0123456789");
}

#[tokio::test]
async fn test_silent_peer_aborts_after_retry_ceiling() {
    // Arrange
    let peer = FakePeer::new(
        "NL-A",
        Script {
            silent: true,
            ..Script::default()
        },
    );

    // Act
    let report = uploader(3).upload(&[peer.clone() as Arc<dyn TransferPeer>], &plan()).await;

    // Assert
    assert_eq!(
        report.targets[0].result,
        Err(TransferError::RetriesExhausted {
            stage: AckStage::Begin,
            offset: 0,
            attempts: 3,
        })
    );
    assert_eq!(peer.sends().len(), 3);
}

#[tokio::test]
async fn test_failure_status_aborts_without_retry() {
    // Arrange
    let peer = FakePeer::new(
        "NL-A",
        Script {
            fail: Some((AckStage::Chunk, 4, AckStatus::WriteFailed)),
            ..Script::default()
        },
    );

    // Act
    let report = uploader(5).upload(&[peer.clone() as Arc<dyn TransferPeer>], &plan()).await;

    // Assert
    match &report.targets[0].result {
        Err(TransferError::Rejected { stage, offset, status, .. }) => {
            assert_eq!((*stage, *offset, *status), (AckStage::Chunk, 4, AckStatus::WriteFailed as u8));
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(chunk_sends(&peer), vec![0, 4]);
    assert!(!peer.sends().iter().any(|(cmd, _)| *cmd == FILE_END));
}

#[tokio::test]
async fn test_barrier_waits_for_slow_target_and_drops_failed_one() {
    // Arrange: B needs a resend of chunk 0, C fails at chunk 4
    let a = FakePeer::new("NL-A", Script::default());
    let mut slow = Script::default();
    slow.drops.insert((AckStage::Chunk, 0), 1);
    let b = FakePeer::new("NL-B", slow);
    let c = FakePeer::new(
        "NL-C",
        Script {
            fail: Some((AckStage::Chunk, 4, AckStatus::WriteFailed)),
            ..Script::default()
        },
    );
    let targets: Vec<Arc<dyn TransferPeer>> = vec![a.clone(), b.clone(), c.clone()];

    // Act
    let report = uploader(5).upload(&targets, &plan()).await;

    // Assert
    assert!(!report.all_ok());
    assert_eq!(chunk_sends(&a), vec![0, 4, 8]);
    assert_eq!(chunk_sends(&b), vec![0, 0, 4, 8]);
    assert_eq!(chunk_sends(&c), vec![0, 4]);
    let ok: Vec<&str> = report
        .targets
        .iter()
        .filter(|t| t.result.is_ok())
        .map(|t| t.label.as_str())
        .collect();
    assert_eq!(ok, vec!["NL-A", "NL-B"]);
}

#[tokio::test]
async fn test_digest_mismatch_reports_both_digests() {
    // Arrange
    let peer = FakePeer::new(
        "NL-A",
        Script {
            corrupt: true,
            ..Script::default()
        },
    );
    let plan = plan();

    // Act
    let report = uploader(3).upload(&[peer as Arc<dyn TransferPeer>], &plan).await;

    // Assert
    match &report.targets[0].result {
        Err(TransferError::DigestMismatch { expected, actual }) => {
            assert_eq!(expected, &plan.digest_hex());
            assert_ne!(actual, expected);
            assert_eq!(actual.len(), 64);
        }
        other => panic!("expected digest mismatch, got {other:?}"),
    }
}

#[tokio::test]
async fn test_empty_file_sends_begin_and_end_only() {
    let peer = FakePeer::new("NL-A", Script::default());
    let plan = UploadPlan::new(1, "/empty", Vec::new(), 512);

    let report = uploader(3).upload(&[peer.clone() as Arc<dyn TransferPeer>], &plan).await;

    assert!(report.all_ok());
    assert_eq!(peer.sends(), vec![(FILE_BEGIN, 0), (FILE_END, 0)]);
}

#[tokio::test]
async fn test_late_ack_resend_still_verifies() {
    // Arrange: chunk 0 is stored but its ack lands after the chunk timeout
    let mut script = Script::default();
    script
        .delays
        .insert((AckStage::Chunk, 0), (1, Duration::from_millis(30)));
    let peer = FakePeer::new("NL-A", script);
    let plan = plan();

    // Act
    let report = uploader(3).upload(&[peer.clone() as Arc<dyn TransferPeer>], &plan).await;

    // Assert
    assert!(report.all_ok(), "{report:?}");
    assert_eq!(report.targets[0].result, Ok(plan.digest_hex()));
    assert_eq!(chunk_sends(&peer), vec![0, 0, 4, 8]);
    assert_eq!(peer.stored(), b"0123456789");
}
