//! Per-camera stream orchestration.
//!
//! A `VideoStream` owns one `FrameSource`, a `Recorder` and any number of attached
//! `HandlerThread`s. Its loop thread reads frames, feeds the recorder, and pushes a copy
//! of each frame to every consumer whose max-FPS throttle allows it. Consumers never
//! block the loop: pushes are non-blocking and frames that do not fit are dropped.
//!
//! Source failures are never fatal. The source is released and reconnected after a fixed
//! delay until the stream is stopped.

use anyhow::{anyhow, Result};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::camera::Camera;
use crate::frame::Frame;
use crate::ingest::FrameSource;

pub mod avi;
pub mod handler;
#[cfg(feature = "record-ffmpeg")]
pub mod mp4;
pub mod recording;

pub use handler::{FrameHandler, HandlerStats, HandlerThread};
pub use recording::{Recorder, RecorderBackend, RecordingWriter};

/// Default delay between reconnect attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of a stream loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Connecting,
    Streaming,
    Reconnecting,
    Stopped,
}

/// Counters of one attached consumer.
#[derive(Clone, Debug)]
pub struct HandlerStatus {
    pub name: String,
    pub processed: u64,
    pub dropped: u64,
    pub failed: u64,
}

/// Point-in-time view of a running stream.
#[derive(Clone, Debug)]
pub struct StreamStatus {
    pub camera_id: String,
    pub state: StreamState,
    pub avg_fps: f64,
    pub frames: u64,
    pub reconnects: u64,
    pub recording: bool,
    pub handlers: Vec<HandlerStatus>,
}

// ----------------------------------------------------------------------------
// Rate helpers
// ----------------------------------------------------------------------------

/// Average frame rate over rolling one-second windows.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Option<Instant>,
    frames: u32,
    average: f64,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self {
            window_start: None,
            frames: 0,
            average: 0.0,
        }
    }

    /// Count a frame seen at `now` and return the current average.
    pub fn tick(&mut self, now: Instant) -> f64 {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.duration_since(start);
        if elapsed >= Duration::from_secs(1) {
            self.average = self.frames as f64 / elapsed.as_secs_f64();
            self.window_start = Some(now);
            self.frames = 0;
        }
        self.average
    }

    pub fn average(&self) -> f64 {
        self.average
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimum spacing between pushes to one consumer. A max FPS of 0 disables it.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Option<Duration>,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(max_fps: u32) -> Self {
        Self {
            min_interval: (max_fps > 0).then(|| Duration::from_nanos(1_000_000_000 / max_fps as u64)),
            last: None,
        }
    }

    /// True if a push at `now` is allowed; records the push.
    pub fn ready(&mut self, now: Instant) -> bool {
        if let (Some(interval), Some(last)) = (self.min_interval, self.last) {
            if now.duration_since(last) < interval {
                return false;
            }
        }
        self.last = Some(now);
        true
    }
}

// ----------------------------------------------------------------------------
// Stop signal
// ----------------------------------------------------------------------------

/// Cooperative stop flag whose waits can be cut short.
#[derive(Clone, Default)]
struct StopSignal {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl StopSignal {
    fn flag(&self) -> MutexGuard<'_, bool> {
        self.state
            .0
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn stop(&self) {
        *self.flag() = true;
        self.state.1.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.flag()
    }

    /// Sleep up to `timeout`; returns true if the stop was raised meanwhile.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.flag();
        let (guard, _) = self
            .state
            .1
            .wait_timeout_while(guard, timeout, |stopped| !*stopped)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard
    }
}

// ----------------------------------------------------------------------------
// VideoStream
// ----------------------------------------------------------------------------

struct Attached {
    thread: HandlerThread,
    throttle: Throttle,
}

/// One camera's pipeline, not yet running.
pub struct VideoStream {
    camera: Camera,
    source: Box<dyn FrameSource>,
    recorder: Recorder,
    handlers: Vec<Attached>,
    retry_delay: Duration,
}

impl VideoStream {
    pub fn new(camera: Camera, source: Box<dyn FrameSource>, recorder: Recorder) -> Self {
        Self {
            camera,
            source,
            recorder,
            handlers: Vec::new(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Handle on this stream's recorder, for consumers that trigger recordings.
    pub fn recorder(&self) -> Recorder {
        self.recorder.clone()
    }

    /// Attach a consumer that receives at most `max_fps` frames per second (0 = every frame).
    pub fn attach(&mut self, thread: HandlerThread, max_fps: u32) {
        log::debug!(
            "VideoStream[{}]: attaching {} (max {} fps)",
            self.camera.id,
            thread.name(),
            max_fps
        );
        self.handlers.push(Attached {
            thread,
            throttle: Throttle::new(max_fps),
        });
    }

    /// Start every consumer, then the loop thread.
    pub fn start(mut self) -> Result<StreamHandle> {
        for index in 0..self.handlers.len() {
            if let Err(err) = self.handlers[index].thread.start() {
                for started in &mut self.handlers[..index] {
                    let _ = started.thread.stop();
                }
                return Err(err.context(format!(
                    "camera {}: start {}",
                    self.camera.id,
                    self.handlers[index].thread.name()
                )));
            }
        }

        let signal = StopSignal::default();
        let handler_stats = self
            .handlers
            .iter()
            .map(|attached| (attached.thread.name().to_string(), attached.thread.stats()))
            .collect();
        let shared = Arc::new(Mutex::new(LoopStatus::default()));
        let recorder = self.recorder.clone();
        let camera_id = self.camera.id.clone();

        let loop_signal = signal.clone();
        let loop_shared = shared.clone();
        let join = std::thread::Builder::new()
            .name(format!("stream-{}", self.camera.id))
            .spawn(move || self.run(&loop_signal, &loop_shared))?;

        Ok(StreamHandle {
            camera_id,
            signal,
            shared,
            recorder,
            handler_stats,
            join: Some(join),
        })
    }

    fn run(mut self, signal: &StopSignal, shared: &Mutex<LoopStatus>) {
        log::info!(
            "VideoStream[{}]: starting on {}",
            self.camera.id,
            self.source.describe()
        );
        let mut meter = FpsMeter::new();

        while !signal.is_stopped() {
            if !self.source.is_connected() {
                set_state(shared, |status| {
                    if status.state == StreamState::Idle {
                        status.state = StreamState::Connecting;
                    }
                });
                if let Err(err) = self.source.connect() {
                    log::warn!(
                        "VideoStream[{}]: cannot connect to {}: {:#}",
                        self.camera.id,
                        self.source.describe(),
                        err
                    );
                    if self.back_off(signal, shared) {
                        break;
                    }
                    continue;
                }
                log::info!(
                    "VideoStream[{}]: connected to {}",
                    self.camera.id,
                    self.source.describe()
                );
                set_state(shared, |status| status.state = StreamState::Streaming);
            }

            match self.source.next_frame() {
                Ok(frame) => {
                    let avg_fps = meter.tick(Instant::now());
                    self.on_frame(frame, avg_fps);
                    set_state(shared, |status| {
                        status.frames += 1;
                        status.avg_fps = avg_fps;
                    });
                }
                Err(err) => {
                    log::warn!("VideoStream[{}]: read failed: {:#}", self.camera.id, err);
                    if self.back_off(signal, shared) {
                        break;
                    }
                }
            }
        }

        self.shutdown();
        set_state(shared, |status| status.state = StreamState::Stopped);
    }

    /// Release the source and wait before the next attempt. Returns true if stopped meanwhile.
    fn back_off(&mut self, signal: &StopSignal, shared: &Mutex<LoopStatus>) -> bool {
        self.source.release();
        set_state(shared, |status| {
            status.state = StreamState::Reconnecting;
            status.reconnects += 1;
        });
        if signal.is_stopped() {
            return true;
        }
        signal.wait(self.retry_delay)
    }

    fn on_frame(&mut self, frame: Frame, avg_fps: f64) {
        let dimensions = self.source.dimensions().or(Some(frame.dimensions()));
        if let Err(err) = self.recorder.update_source(dimensions, avg_fps) {
            log::error!("VideoStream[{}]: {:#}", self.camera.id, err);
        }
        if let Err(err) = self.recorder.expire_if_due() {
            log::error!("VideoStream[{}]: closing recording: {:#}", self.camera.id, err);
        }
        if let Err(err) = self.recorder.write_frame(&frame) {
            log::error!("VideoStream[{}]: recording frame: {:#}", self.camera.id, err);
        }

        let now = Instant::now();
        for attached in &mut self.handlers {
            if attached.throttle.ready(now) {
                attached.thread.push(frame.clone());
            }
        }
    }

    fn shutdown(&mut self) {
        log::info!("VideoStream[{}]: stopping", self.camera.id);
        for attached in &mut self.handlers {
            if let Err(err) = attached.thread.stop() {
                log::error!("VideoStream[{}]: {:#}", self.camera.id, err);
            }
        }
        if let Err(err) = self.recorder.stop_record() {
            log::error!("VideoStream[{}]: closing recording: {:#}", self.camera.id, err);
        }
        self.source.release();
        log::info!("VideoStream[{}]: stopped", self.camera.id);
    }
}

#[derive(Debug)]
struct LoopStatus {
    state: StreamState,
    avg_fps: f64,
    frames: u64,
    reconnects: u64,
}

impl Default for LoopStatus {
    fn default() -> Self {
        Self {
            state: StreamState::Idle,
            avg_fps: 0.0,
            frames: 0,
            reconnects: 0,
        }
    }
}

fn set_state(shared: &Mutex<LoopStatus>, update: impl FnOnce(&mut LoopStatus)) {
    let mut status = shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    update(&mut status);
}

/// Control handle for a running `VideoStream`.
pub struct StreamHandle {
    camera_id: String,
    signal: StopSignal,
    shared: Arc<Mutex<LoopStatus>>,
    recorder: Recorder,
    handler_stats: Vec<(String, Arc<HandlerStats>)>,
    join: Option<JoinHandle<()>>,
}

impl StreamHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn is_running(&self) -> bool {
        self.join
            .as_ref()
            .is_some_and(|join| !join.is_finished())
    }

    pub fn status(&self) -> StreamStatus {
        let status = self
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        StreamStatus {
            camera_id: self.camera_id.clone(),
            state: status.state,
            avg_fps: status.avg_fps,
            frames: status.frames,
            reconnects: status.reconnects,
            recording: self.recorder.is_recording(),
            handlers: self
                .handler_stats
                .iter()
                .map(|(name, stats)| HandlerStatus {
                    name: name.clone(),
                    processed: stats.processed.load(Ordering::Relaxed),
                    dropped: stats.dropped.load(Ordering::Relaxed),
                    failed: stats.failed.load(Ordering::Relaxed),
                })
                .collect(),
        }
    }

    /// Ask the loop to stop without waiting for it.
    pub fn request_stop(&self) {
        self.signal.stop();
    }

    /// Stop the loop, drain and join every consumer, close the recording.
    pub fn stop(&mut self) -> Result<()> {
        self.request_stop();
        self.join()
    }

    /// Wait for the loop thread to finish.
    pub fn join(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("camera {}: stream thread panicked", self.camera_id))?;
        }
        Ok(())
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.stop();
        }
    }
}
