//! Frame consumer that runs recognition on a camera's stream.

use anyhow::Result;
use std::time::Duration;

use super::engine::Recognizer;
use crate::config::RecognitionConfig;
use crate::frame::{downscale, Frame, StageTimer};
use crate::stream::{FrameHandler, HandlerThread, Recorder};

/// Recognition keeps every frame it is handed; the stream throttle bounds the rate.
pub const RECOGNITION_QUEUE_CAPACITY: usize = 0;

/// Detects faces on a downscaled copy of each frame and feeds the full-resolution
/// rectangles to the `Recognizer`. Optionally records while faces are in view.
pub struct RecognitionHandler {
    name: String,
    camera_id: String,
    recognizer: Recognizer,
    recorder: Recorder,
    max_width: u32,
    record: bool,
    record_timeout: Duration,
    record_increase: Duration,
}

impl RecognitionHandler {
    pub fn new(camera_id: &str, recognizer: Recognizer, recorder: Recorder, config: &RecognitionConfig) -> Self {
        Self {
            name: format!("recognition:{}", camera_id),
            camera_id: camera_id.to_string(),
            recognizer,
            recorder,
            max_width: config.max_width,
            record: config.record,
            record_timeout: config.record_timeout,
            record_increase: config.record_increase,
        }
    }

    pub fn into_thread(self) -> HandlerThread {
        HandlerThread::new(self, RECOGNITION_QUEUE_CAPACITY)
    }

    fn extend_recording(&self) {
        let result = if self.recorder.is_recording() {
            self.recorder.increase_record(self.record_increase)
        } else {
            self.recorder.start_record(self.record_timeout).map(|_| ())
        };
        if let Err(err) = result {
            log::warn!("RecognitionHandler[{}]: recording: {:#}", self.camera_id, err);
        }
    }
}

impl FrameHandler for RecognitionHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_start(&mut self) -> Result<()> {
        log::info!(
            "RecognitionHandler[{}]: using backend {}",
            self.camera_id,
            self.recognizer.backend_name()
        );
        Ok(())
    }

    fn process(&mut self, frame: Frame, timer: &mut StageTimer) -> Result<()> {
        let (small, ratio) = downscale(frame.image(), self.max_width);
        timer.mark("resize");

        let faces = self.recognizer.locate(&small)?;
        timer.mark("locate");
        if faces.is_empty() {
            return Ok(());
        }

        if self.record {
            self.extend_recording();
        }

        let (width, height) = frame.dimensions();
        let faces: Vec<_> = faces
            .iter()
            .map(|rect| rect.scale(1.0 / ratio, width, height))
            .collect();

        let result = self
            .recognizer
            .query(frame.image(), &faces, Some(&self.camera_id))?;
        timer.mark("identify");

        for recognition in &result.recognitions {
            match (&recognition.identity, recognition.score) {
                (Some(identity), Some(score)) => log::info!(
                    "RecognitionHandler[{}]: {} ({:.2})",
                    self.camera_id,
                    identity.display_name(),
                    score
                ),
                _ => log::info!("RecognitionHandler[{}]: unknown face", self.camera_id),
            }
        }
        if let Some(query_id) = &result.query_id {
            log::info!(
                "RecognitionHandler[{}]: query {} awaits review ({} suggestion(s))",
                self.camera_id,
                query_id,
                result.suggestion_ids.len()
            );
        }
        log::debug!(
            "RecognitionHandler[{}]: {} face(s) - {}",
            self.camera_id,
            faces.len(),
            timer.summary()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{StubBackend, ENCODING_LEN};
    use crate::frame::FaceRect;
    use crate::recognition::engine::MatchSettings;
    use crate::recognition::files::FileStore;
    use crate::stream::avi::MjpegAviBackend;
    use image::{Rgb, RgbImage};
    use rusqlite::Connection;
    use std::sync::Arc;

    fn handler(dir: &std::path::Path, backend: StubBackend, record: bool) -> (RecognitionHandler, Recorder) {
        let files = FileStore::new(dir);
        let recorder = Recorder::new(
            "front",
            "Front door",
            files.records_dir("front"),
            Arc::new(MjpegAviBackend::default()),
        );
        let recognizer = Recognizer::with_connection(
            Connection::open_in_memory().unwrap(),
            files,
            Box::new(backend),
            MatchSettings::default(),
        )
        .unwrap();
        let config = RecognitionConfig {
            max_width: 32,
            record,
            ..RecognitionConfig::default()
        };
        (
            RecognitionHandler::new("front", recognizer, recorder.clone(), &config),
            recorder,
        )
    }

    fn frame() -> Frame {
        Frame::new(RgbImage::from_pixel(64, 48, Rgb([40, 80, 120])), 1)
    }

    #[test]
    fn faces_are_queried_at_full_resolution() {
        let dir = tempfile::tempdir().unwrap();
        // Detected on the half-size image; the query sees it doubled.
        let small = FaceRect::new(4, 12, 12, 4);
        let (mut handler, _) = handler(
            dir.path(),
            StubBackend::new().with_face(small, vec![0.1; ENCODING_LEN]),
            false,
        );

        handler.process(frame(), &mut StageTimer::start()).unwrap();

        let suggestions = handler.recognizer.suggestions().unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].rect, FaceRect::new(8, 24, 24, 8));
        let queries = handler.recognizer.queries().unwrap();
        assert_eq!(queries[0].camera_id.as_deref(), Some("front"));
    }

    #[test]
    fn no_faces_means_no_query_and_no_recording() {
        let dir = tempfile::tempdir().unwrap();
        let (mut handler, recorder) = handler(dir.path(), StubBackend::new(), true);
        recorder.update_source(Some((64, 48)), 10.0).unwrap();

        handler.process(frame(), &mut StageTimer::start()).unwrap();

        assert!(handler.recognizer.queries().unwrap().is_empty());
        assert!(!recorder.is_recording());
    }

    #[test]
    fn detection_starts_recording_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let small = FaceRect::new(4, 12, 12, 4);
        let (mut handler, recorder) = handler(
            dir.path(),
            StubBackend::new().with_face(small, vec![0.1; ENCODING_LEN]),
            true,
        );
        recorder.update_source(Some((64, 48)), 10.0).unwrap();

        handler.process(frame(), &mut StageTimer::start()).unwrap();
        assert!(recorder.is_recording());
        let first = recorder.expires_in().unwrap();

        handler.process(frame(), &mut StageTimer::start()).unwrap();
        assert!(recorder.is_recording());
        assert!(recorder.expires_in().unwrap() <= first);

        let path = recorder.stop_record().unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("records").join("front")));
    }
}
