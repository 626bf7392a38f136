//! RTSP frame source.
//!
//! `RtspSource` ingests frames from IP cameras. Real streams are decoded through
//! GStreamer (`rtspsrc ! decodebin ! videoconvert ! appsink`); `stub://` URLs produce a
//! synthetic moving pattern paced at the configured frame rate.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, Result};
#[cfg(feature = "rtsp-gstreamer")]
use gstreamer::prelude::*;
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::camera::Camera;
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// Capture URL, credentials included (e.g. "rtsp://user:pw@192.168.1.100:554/stream").
    pub url: String,
    /// Loggable URL without credentials.
    pub display_url: String,
    /// Target frame rate. Synthetic sources pace themselves to it; real cameras set their own.
    pub target_fps: u32,
    /// Frame width for synthetic frames.
    pub width: u32,
    /// Frame height for synthetic frames.
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            display_url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 25,
            width: 640,
            height: 480,
        }
    }
}

impl RtspConfig {
    pub fn for_camera(camera: &Camera) -> Result<Self> {
        Ok(Self {
            url: camera.full_url()?,
            display_url: camera.display_url(),
            ..Self::default()
        })
    }
}

/// RTSP frame source.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("RTSP requires the rtsp-gstreamer feature")
            }
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> RtspStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

impl FrameSource for RtspSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.connect(),
        }
    }

    fn is_connected(&self) -> bool {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.connected,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.pipeline.is_some(),
        }
    }

    fn next_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.next_frame(),
        }
    }

    fn dimensions(&self) -> Option<(u32, u32)> {
        match &self.backend {
            RtspBackend::Synthetic(source) => source
                .connected
                .then_some((source.config.width, source.config.height)),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.dimensions,
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.connected = false,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.config.display_url.clone(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.config.display_url.clone(),
        }
    }
}

/// Statistics for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspStats {
    pub frames_captured: u64,
    pub url: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    connected: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            connected: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.display_url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        if !self.connected {
            return Err(anyhow!("synthetic source not connected"));
        }
        self.pace();
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    /// Sleep until one frame interval has passed since the previous frame.
    fn pace(&mut self) {
        if self.config.target_fps > 0 {
            let interval = Duration::from_secs_f64(1.0 / self.config.target_fps as f64);
            if let Some(last) = self.last_frame_at {
                let elapsed = last.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    /// A diagonal gradient that drifts one step per frame.
    fn generate_synthetic_pixels(&self) -> Vec<u8> {
        let (width, height) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![0u8; width * height * 3];
        for y in 0..height {
            for x in 0..width {
                let offset = (y * width + x) * 3;
                let base = (x + y) as u64 + self.frame_count;
                pixels[offset] = (base % 256) as u8;
                pixels[offset + 1] = ((base / 2) % 256) as u8;
                pixels[offset + 2] = ((base / 4) % 256) as u8;
            }
        }
        pixels
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.display_url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
    dimensions: Option<(u32, u32)>,
    frame_count: u64,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;
        Ok(Self {
            config,
            pipeline: None,
            dimensions: None,
            frame_count: 0,
        })
    }

    fn connect(&mut self) -> Result<()> {
        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            self.config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        self.pipeline = Some((pipeline, appsink));
        log::info!("RtspSource: connected to {}", self.config.display_url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Frame> {
        let (pipeline, appsink) = self
            .pipeline
            .as_ref()
            .ok_or_else(|| anyhow!("RTSP source not connected"))?;

        if let Some(error) = poll_bus(pipeline) {
            return Err(anyhow!(error));
        }

        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_seconds(5))
            .ok_or_else(|| anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        self.dimensions = Some((width, height));
        Frame::from_rgb(pixels, width, height, self.frame_count)
    }

    fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            let _ = pipeline.set_state(gstreamer::State::Null);
        }
        self.dimensions = None;
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            url: self.config.display_url.clone(),
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn poll_bus(pipeline: &gstreamer::Pipeline) -> Option<String> {
    let bus = pipeline.bus()?;
    while let Some(message) = bus.pop() {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                return Some(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                ));
            }
            MessageView::Eos(..) => return Some("gstreamer reached EOS".to_string()),
            _ => {}
        }
    }
    None
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config(target_fps: u32) -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            display_url: "stub://test".to_string(),
            target_fps,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config(0))?;
        source.connect()?;

        let frame = source.next_frame()?;
        assert_eq!(frame.dimensions(), (64, 48));
        assert_eq!(frame.sequence, 1);
        assert_eq!(source.dimensions(), Some((64, 48)));

        Ok(())
    }

    #[test]
    fn released_source_fails_until_reconnected() -> Result<()> {
        let mut source = RtspSource::new(stub_config(0))?;
        source.connect()?;
        source.release();
        assert!(!source.is_connected());
        assert!(source.next_frame().is_err());

        source.connect()?;
        assert_eq!(source.next_frame()?.sequence, 1);
        Ok(())
    }

    #[test]
    fn synthetic_frames_are_paced() -> Result<()> {
        let mut source = RtspSource::new(stub_config(50))?;
        source.connect()?;
        let start = Instant::now();
        for _ in 0..5 {
            source.next_frame()?;
        }
        // 4 intervals of 20 ms after the first frame.
        assert!(start.elapsed() >= Duration::from_millis(75));
        assert_eq!(source.stats().frames_captured, 5);
        Ok(())
    }

    #[test]
    fn real_urls_need_gstreamer() {
        let config = RtspConfig {
            url: "rtsp://10.0.0.1/stream".to_string(),
            ..RtspConfig::default()
        };
        #[cfg(not(feature = "rtsp-gstreamer"))]
        assert!(RtspSource::new(config).is_err());
        #[cfg(feature = "rtsp-gstreamer")]
        let _ = config;
    }
}
