//! facewatchd - multi-camera recognition daemon
//!
//! For every configured camera this daemon:
//! 1. Pulls frames from the camera source, reconnecting forever on failure
//! 2. Runs face recognition on a throttled copy of the stream
//! 3. Records while faces are in view
//! 4. Republishes annotated JPEG frames on `<socket_dir>/<camera_id>.sock`
//!
//! Runs until Ctrl-C, then stops every stream cooperatively.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use facewatch::{
    stream::recording::default_backend, BackendRegistry, CameraConfig, FacewatchConfig, FileStore,
    MatchSettings, RecognitionHandler, Recognizer, Recorder, RtspSource, SocketHandler,
    StreamHandle, VideoStream,
};

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = FacewatchConfig::load()?;
    if config.cameras.is_empty() {
        return Err(anyhow!("no cameras configured (set FACEWATCH_CONFIG)"));
    }

    let registry = BackendRegistry::for_config(&config.recognition)?;
    if config.recognition.backend == "stub" {
        log::warn!(
            "face backend \"stub\" only reports scripted faces; build with backend-tract and select \"tract\""
        );
    }
    let files = FileStore::new(config.file_store_root());
    std::fs::create_dir_all(&config.socket_dir)?;

    log::info!(
        "facewatchd {} starting: {} camera(s), db={}, data={}",
        env!("CARGO_PKG_VERSION"),
        config.cameras.len(),
        config.db_path,
        files.root().display()
    );

    let mut handles = Vec::with_capacity(config.cameras.len());
    for camera in &config.cameras {
        match start_camera(&config, camera, &registry, &files) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                log::error!("camera {}: {:#}", camera.camera.id, e);
                stop_all(&mut handles);
                return Err(e);
            }
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("facewatchd running, waiting for shutdown signal (Ctrl-C)...");
    loop {
        match rx.recv_timeout(STATUS_INTERVAL) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => log_status(&handles),
        }
    }

    log::info!("shutdown signal received, stopping streams...");
    stop_all(&mut handles);
    log::info!("facewatchd stopped");
    Ok(())
}

fn start_camera(
    config: &FacewatchConfig,
    camera: &CameraConfig,
    registry: &BackendRegistry,
    files: &FileStore,
) -> Result<StreamHandle> {
    let id = &camera.camera.id;
    let source = RtspSource::new(camera.rtsp_config()?)?;
    let recorder = Recorder::new(
        id.clone(),
        camera.camera.label.clone(),
        files.records_dir(id),
        default_backend(),
    );

    let recognizer = Recognizer::open(
        &config.db_path,
        files.clone(),
        registry.create_default()?,
        MatchSettings::from(&config.recognition),
    )?;
    let recognition = RecognitionHandler::new(id, recognizer, recorder.clone(), &config.recognition);
    let live = SocketHandler::new(&camera.camera, &config.socket_dir, &config.live)?;
    let socket = live.server().path().to_path_buf();

    let mut stream = VideoStream::new(camera.camera.clone(), Box::new(source), recorder)
        .with_retry_delay(config.retry_delay);
    stream.attach(recognition.into_thread(), config.recognition.max_fps);
    stream.attach(live.into_thread(), config.live.max_fps);

    let handle = stream.start()?;
    log::info!(
        "camera {} ({}) started, live frames on {}",
        id,
        camera.camera.display_url(),
        socket.display()
    );
    Ok(handle)
}

fn log_status(handles: &[StreamHandle]) {
    for handle in handles {
        let status = handle.status();
        let handlers = status
            .handlers
            .iter()
            .map(|h| format!("{} {}/{}/{}", h.name, h.processed, h.dropped, h.failed))
            .collect::<Vec<_>>()
            .join(", ");
        log::info!(
            "camera {}: {:?} fps={:.1} frames={} reconnects={} recording={} [{}]",
            status.camera_id,
            status.state,
            status.avg_fps,
            status.frames,
            status.reconnects,
            status.recording,
            handlers
        );
    }
}

fn stop_all(handles: &mut Vec<StreamHandle>) {
    for handle in handles.iter() {
        handle.request_stop();
    }
    for mut handle in handles.drain(..) {
        if let Err(e) = handle.stop() {
            log::warn!("camera {}: {:#}", handle.camera_id(), e);
        }
    }
}
