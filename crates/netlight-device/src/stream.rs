//! Streaming-mode state, the render seam, and local playback.
//!
//! [`StreamState`] is owned by the device [`App`](crate::app::App).  Only the
//! stream-control handlers mutate it; the render loop in `main` reads it to
//! decide whether to replay the local frame file or leave the strip to the
//! host's STREAM_FRAME traffic.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Duration, Instant};

use netlight_core::StreamMode;
use tracing::{debug, info};

/// Output seam towards the actuator driver.
///
/// The driver owns pixel encoding and timing; the core only hands it a
/// finished buffer.
#[cfg_attr(test, mockall::automock)]
pub trait Display: Send {
    /// Shows one frame of raw pixel data.
    fn display(&mut self, buffer: &[u8]);

    /// Blanks the output.
    fn clear(&mut self) {}
}

/// Display used when no LED driver is attached: counts and logs frames.
#[derive(Debug, Default)]
pub struct LogDisplay {
    pub frames: u64,
    pub last_len: usize,
}

impl Display for LogDisplay {
    fn display(&mut self, buffer: &[u8]) {
        self.frames += 1;
        self.last_len = buffer.len();
        debug!("display: frame {} ({} bytes)", self.frames, buffer.len());
    }

    fn clear(&mut self) {
        debug!("display: clear");
    }
}

// ── Stream state ──────────────────────────────────────────────────────────────

/// Streaming-mode state.  Inactive at boot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamState {
    pub active: bool,
    pub mode: StreamMode,
    pub fps: u16,
    /// Id of the last STREAM_FRAME shown.
    pub frame_id: u32,
    /// Frames shown since the counter was last reset.
    pub frames: u64,
    pub last_recv: Option<Instant>,
}

impl StreamState {
    pub fn start(&mut self, fps: u16, mode: StreamMode) {
        info!("stream: START fps={fps} mode={mode:?}");
        self.active = true;
        self.fps = fps;
        self.mode = mode;
        self.frames = 0;
    }

    pub fn stop(&mut self) {
        info!("stream: STOP after {} frame(s)", self.frames);
        self.active = false;
    }

    /// Records an incoming host frame.
    ///
    /// Returns `false` (and changes nothing) while streaming is inactive.  An
    /// accepted frame switches the source to [`StreamMode::Direct`].
    pub fn accept_frame(&mut self, frame_id: u32, now: Instant) -> bool {
        if !self.active {
            return false;
        }
        self.mode = StreamMode::Direct;
        self.frame_id = frame_id;
        self.frames += 1;
        self.last_recv = Some(now);
        true
    }

    /// Returns the frame counter and resets it.
    pub fn take_frame_count(&mut self) -> u64 {
        std::mem::take(&mut self.frames)
    }
}

// ── FPS reporting ─────────────────────────────────────────────────────────────

/// Measures achieved frame rate over fixed reporting windows.
#[derive(Debug)]
pub struct FpsMeter {
    interval: Duration,
    window_start: Instant,
}

impl FpsMeter {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            window_start: now,
        }
    }

    /// Returns the rate for the finished window once `interval` has elapsed.
    pub fn report(&mut self, frames: u64, now: Instant) -> Option<f64> {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.interval {
            return None;
        }
        self.window_start = now;
        let secs = elapsed.as_secs_f64();
        Some(if secs > 0.0 { frames as f64 / secs } else { 0.0 })
    }
}

// ── Local playback ────────────────────────────────────────────────────────────

/// Replays a raw file of fixed-size frames in a loop.
pub struct LocalPlayer {
    file: File,
    frame: Vec<u8>,
    period: Duration,
    last_shown: Option<Instant>,
}

impl LocalPlayer {
    /// Opens `path` for playback of `frame_bytes`-sized frames.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if the file cannot be opened.
    pub fn open(path: &Path, frame_bytes: usize, period: Duration) -> io::Result<Self> {
        let file = File::open(path)?;
        info!("stream: local playback from {}", path.display());
        Ok(Self {
            file,
            frame: vec![0u8; frame_bytes],
            period,
            last_shown: None,
        })
    }

    /// Shows the next frame if the frame period has elapsed.
    ///
    /// Returns `Ok(true)` when a frame was shown.  At end of file playback
    /// wraps to the start.
    ///
    /// # Errors
    ///
    /// Returns the I/O error if reading the file fails.
    pub fn tick(&mut self, display: &mut dyn Display, now: Instant) -> io::Result<bool> {
        if let Some(last) = self.last_shown {
            if now.saturating_duration_since(last) < self.period {
                return Ok(false);
            }
        }
        if !self.read_frame()? {
            self.file.seek(SeekFrom::Start(0))?;
            if !self.read_frame()? {
                return Ok(false);
            }
        }
        display.display(&self.frame);
        self.last_shown = Some(now);
        Ok(true)
    }

    /// Reads one whole frame; `false` at end of file.
    fn read_frame(&mut self) -> io::Result<bool> {
        match self.file.read_exact(&mut self.frame) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
            Err(e) => Err(e),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_state_inactive_at_boot() {
        let state = StreamState::default();
        assert!(!state.active);
        assert_eq!(state.mode, StreamMode::Local);
    }

    #[test]
    fn test_accept_frame_ignored_when_inactive() {
        let mut state = StreamState::default();
        assert!(!state.accept_frame(5, Instant::now()));
        assert_eq!(state.frames, 0);
        assert_eq!(state.mode, StreamMode::Local);
    }

    #[test]
    fn test_accept_frame_forces_direct_mode() {
        // Arrange
        let mut state = StreamState::default();
        state.start(30, StreamMode::Local);

        // Act
        let accepted = state.accept_frame(42, Instant::now());

        // Assert
        assert!(accepted);
        assert_eq!(state.mode, StreamMode::Direct);
        assert_eq!(state.frame_id, 42);
        assert_eq!(state.take_frame_count(), 1);
        assert_eq!(state.frames, 0);
    }

    #[test]
    fn test_fps_meter_reports_after_interval() {
        let start = Instant::now();
        let mut meter = FpsMeter::new(Duration::from_secs(10), start);
        assert!(meter.report(100, start + Duration::from_secs(5)).is_none());
        let fps = meter.report(400, start + Duration::from_secs(10)).unwrap();
        assert!((fps - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_local_player_wraps_at_end_of_file() {
        // Arrange: two 3-byte frames
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"aaabbb").unwrap();
        let mut player = LocalPlayer::open(&path, 3, Duration::ZERO).unwrap();
        let mut display = MockDisplay::new();
        let mut seq = mockall::Sequence::new();
        for expected in [b"aaa", b"bbb", b"aaa"] {
            display
                .expect_display()
                .withf(move |buf: &[u8]| buf == &expected[..])
                .times(1)
                .in_sequence(&mut seq)
                .return_const(());
        }

        // Act / Assert
        let now = Instant::now();
        for _ in 0..3 {
            assert!(player.tick(&mut display, now).unwrap());
        }
    }

    #[test]
    fn test_local_player_respects_frame_period() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"xy").unwrap();
        let mut player = LocalPlayer::open(&path, 2, Duration::from_millis(25)).unwrap();
        let mut display = LogDisplay::default();
        let now = Instant::now();

        assert!(player.tick(&mut display, now).unwrap());
        assert!(!player.tick(&mut display, now + Duration::from_millis(10)).unwrap());
        assert!(player.tick(&mut display, now + Duration::from_millis(30)).unwrap());
        assert_eq!(display.frames, 2);
    }
}
