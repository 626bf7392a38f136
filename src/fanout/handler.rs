//! Frame consumer that republishes annotated JPEGs on a camera's live socket.

use anyhow::Result;
use chrono::Local;
use std::path::Path;
use std::sync::Arc;

use super::server::StreamServer;
use super::socket_path;
use crate::camera::Camera;
use crate::config::LiveConfig;
use crate::frame::{downscale, encode_jpeg, stamp_overlay, Frame, StageTimer};
use crate::stream::{FrameHandler, HandlerThread};

/// Live frames are only useful fresh: one slot, newer frames are dropped while it is full.
pub const SOCKET_QUEUE_CAPACITY: usize = 1;

/// Republishes a camera's frames, annotated and JPEG-encoded, to local subscribers.
pub struct SocketHandler {
    name: String,
    camera_id: String,
    label: String,
    server: Arc<StreamServer>,
    max_width: u32,
    jpeg_quality: u8,
}

impl SocketHandler {
    /// Bind `<socket_dir>/<camera_id>.sock`. Subscribers are accepted once the handler starts.
    pub fn new(camera: &Camera, socket_dir: &Path, live: &LiveConfig) -> Result<Self> {
        let server = StreamServer::bind(socket_path(socket_dir, &camera.id))?;
        Ok(Self {
            name: format!("socket:{}", camera.id),
            camera_id: camera.id.clone(),
            label: camera.label.clone(),
            server: Arc::new(server),
            max_width: live.max_width,
            jpeg_quality: live.jpeg_quality,
        })
    }

    pub fn server(&self) -> Arc<StreamServer> {
        self.server.clone()
    }

    /// Wrap in a consumer thread with the single-slot queue.
    pub fn into_thread(self) -> HandlerThread {
        HandlerThread::new(self, SOCKET_QUEUE_CAPACITY)
    }
}

impl FrameHandler for SocketHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self) -> Result<()> {
        self.server.start()
    }

    fn on_stop(&mut self) {
        if let Err(err) = self.server.stop() {
            log::warn!("SocketHandler[{}]: {:#}", self.camera_id, err);
        }
    }

    fn process(&mut self, frame: Frame, timer: &mut StageTimer) -> Result<()> {
        if self.server.client_count() == 0 {
            return Ok(());
        }

        let (resized, _) = downscale(frame.image(), self.max_width);
        let mut image = resized.into_owned();
        timer.mark("resize");

        stamp_overlay(&mut image, &self.label, Local::now());
        let jpeg = encode_jpeg(&image, self.jpeg_quality)?;
        timer.mark("encode");

        let sent = self.server.send_to_clients(&jpeg)?;
        timer.mark("send");
        log::debug!(
            "SocketHandler[{}]: {} bytes to {} client(s) - {}",
            self.camera_id,
            jpeg.len(),
            sent,
            timer.summary()
        );
        Ok(())
    }
}
