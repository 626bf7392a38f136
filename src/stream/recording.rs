//! Detection-triggered recording.
//!
//! `Recorder` is the per-camera recording state machine. The stream loop feeds it frames
//! and source statistics; recognition consumers start and extend recordings from their
//! own threads through cloned handles. When a writer reports its container is full, the
//! recording continues in a new file.

use anyhow::{anyhow, Context, Result};
use chrono::Local;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::RecordingError;
use crate::frame::{stamp_overlay, Frame};

/// Recording file names: `<records>/<camera_id>/<start>.<ext>`.
pub const RECORD_NAME_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Lowest frame rate a recording is opened with.
pub const MIN_RECORD_FPS: f64 = 30.0;

/// An open recording file.
pub trait RecordingWriter: Send {
    fn write(&mut self, image: &RgbImage) -> Result<()>;

    fn path(&self) -> &Path;

    /// Flush and close the file, returning its path.
    fn finish(self: Box<Self>) -> Result<PathBuf>;
}

/// Container/codec used for recordings.
pub trait RecorderBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// File extension, without the dot.
    fn extension(&self) -> &'static str;

    fn open(&self, path: &Path, width: u32, height: u32, fps: u32) -> Result<Box<dyn RecordingWriter>>;
}

/// The best recorder available in this build: H.264/MP4 with `record-ffmpeg`, MJPEG/AVI otherwise.
pub fn default_backend() -> Arc<dyn RecorderBackend> {
    #[cfg(feature = "record-ffmpeg")]
    {
        Arc::new(super::mp4::H264Mp4Backend::default())
    }
    #[cfg(not(feature = "record-ffmpeg"))]
    {
        Arc::new(super::avi::MjpegAviBackend::default())
    }
}

/// Frame rate recordings are opened with for a source measured at `avg_fps`.
pub fn record_fps(avg_fps: f64) -> u32 {
    (avg_fps * 2.0).max(MIN_RECORD_FPS).round() as u32
}

struct ActiveRecording {
    writer: Box<dyn RecordingWriter>,
    expires_at: Instant,
    frames: u64,
}

struct RecorderState {
    dimensions: Option<(u32, u32)>,
    avg_fps: f64,
    active: Option<ActiveRecording>,
}

/// Shared recording handle for one camera.
#[derive(Clone)]
pub struct Recorder {
    camera_id: String,
    label: String,
    dir: PathBuf,
    backend: Arc<dyn RecorderBackend>,
    state: Arc<Mutex<RecorderState>>,
}

impl Recorder {
    /// `dir` is the camera's own recordings directory; it is created on the first recording.
    pub fn new(
        camera_id: impl Into<String>,
        label: impl Into<String>,
        dir: PathBuf,
        backend: Arc<dyn RecorderBackend>,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            label: label.into(),
            dir,
            backend,
            state: Arc::new(Mutex::new(RecorderState {
                dimensions: None,
                avg_fps: 0.0,
                active: None,
            })),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_recording(&self) -> bool {
        self.lock().map(|state| state.active.is_some()).unwrap_or(false)
    }

    /// Time left before the active recording expires.
    pub fn expires_in(&self) -> Option<Duration> {
        let state = self.lock().ok()?;
        state
            .active
            .as_ref()
            .map(|active| active.expires_at.saturating_duration_since(Instant::now()))
    }

    /// Open a new recording that expires after `timeout`.
    ///
    /// While a recording is already running this only extends it.
    pub fn start_record(&self, timeout: Duration) -> Result<PathBuf> {
        let mut state = self.lock()?;
        if let Some(active) = state.active.as_mut() {
            extend(active, timeout);
            return Ok(active.writer.path().to_path_buf());
        }

        let writer = self.open_writer(&state)?;
        let path = writer.path().to_path_buf();
        state.active = Some(ActiveRecording {
            writer,
            expires_at: Instant::now() + timeout,
            frames: 0,
        });
        Ok(path)
    }

    /// Push the expiry to `max(current, now + timeout)`. No-op when not recording.
    pub fn increase_record(&self, timeout: Duration) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(active) = state.active.as_mut() {
            extend(active, timeout);
        }
        Ok(())
    }

    /// Close the active recording, if any.
    pub fn stop_record(&self) -> Result<Option<PathBuf>> {
        let active = self.lock()?.active.take();
        let Some(active) = active else {
            return Ok(None);
        };
        let frames = active.frames;
        let path = active.writer.finish()?;
        log::info!(
            "VideoStream[{}]: recording stopped, {} frames in {}",
            self.camera_id,
            frames,
            path.display()
        );
        Ok(Some(path))
    }

    /// Latest source geometry and measured frame rate.
    pub(crate) fn update_source(&self, dimensions: Option<(u32, u32)>, avg_fps: f64) -> Result<()> {
        let mut state = self.lock()?;
        if dimensions.is_some() {
            state.dimensions = dimensions;
        }
        state.avg_fps = avg_fps;
        Ok(())
    }

    /// Stop the active recording if its expiry has passed.
    pub(crate) fn expire_if_due(&self) -> Result<Option<PathBuf>> {
        let due = {
            let state = self.lock()?;
            state
                .active
                .as_ref()
                .is_some_and(|active| Instant::now() >= active.expires_at)
        };
        if due {
            self.stop_record()
        } else {
            Ok(None)
        }
    }

    /// Append `frame`, with the label and capture time burned in, to the active recording.
    ///
    /// Returns false when nothing is recording.
    pub(crate) fn write_frame(&self, frame: &Frame) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(active) = state.active.as_mut() else {
            return Ok(false);
        };
        let mut image = frame.image().clone();
        stamp_overlay(&mut image, &self.label, frame.captured_at);
        match active.writer.write(&image) {
            Ok(()) => {}
            Err(err) if matches!(err.downcast_ref::<RecordingError>(), Some(RecordingError::Full(_))) => {
                self.roll_over(&mut state)?;
                if let Some(active) = state.active.as_mut() {
                    active.writer.write(&image)?;
                }
            }
            Err(err) => return Err(err),
        }
        if let Some(active) = state.active.as_mut() {
            active.frames += 1;
        }
        Ok(true)
    }

    /// Close the full file of the active recording and continue in a fresh one.
    fn roll_over(&self, state: &mut RecorderState) -> Result<()> {
        let writer = self.open_writer(state)?;
        let Some(active) = state.active.as_mut() else {
            return Ok(());
        };
        let full = std::mem::replace(&mut active.writer, writer);
        let frames = std::mem::replace(&mut active.frames, 0);
        match full.finish() {
            Ok(path) => log::info!(
                "VideoStream[{}]: {} full after {} frames, continuing in {}",
                self.camera_id,
                path.display(),
                frames,
                active.writer.path().display()
            ),
            Err(err) => log::warn!("VideoStream[{}]: closing full recording: {:#}", self.camera_id, err),
        }
        Ok(())
    }

    fn open_writer(&self, state: &RecorderState) -> Result<Box<dyn RecordingWriter>> {
        let (width, height) = state
            .dimensions
            .ok_or_else(|| anyhow!("camera {}: source dimensions unknown", self.camera_id))?;
        let fps = record_fps(state.avg_fps);

        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;
        let path = self.unused_path();
        let writer = self.backend.open(&path, width, height, fps)?;
        log::info!(
            "VideoStream[{}]: recording to {} ({}x{} @ {} fps, {})",
            self.camera_id,
            path.display(),
            width,
            height,
            fps,
            self.backend.name()
        );
        Ok(writer)
    }

    /// `<start>.<ext>`, or `<start>_<n>.<ext>` when a file of that second already exists.
    fn unused_path(&self) -> PathBuf {
        let stem = Local::now().format(RECORD_NAME_FORMAT).to_string();
        let extension = self.backend.extension();
        let mut path = self.dir.join(format!("{}.{}", stem, extension));
        let mut n = 1;
        while path.exists() {
            path = self.dir.join(format!("{}_{}.{}", stem, n, extension));
            n += 1;
        }
        path
    }

    fn lock(&self) -> Result<MutexGuard<'_, RecorderState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("recorder lock poisoned"))
    }
}

fn extend(active: &mut ActiveRecording, timeout: Duration) {
    let candidate = Instant::now() + timeout;
    if candidate > active.expires_at {
        active.expires_at = candidate;
    }
}

/// Recordings of one camera, oldest first.
pub fn list_recordings(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    // Timestamped names sort chronologically.
    paths.sort();
    Ok(paths)
}
