use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::camera::Camera;
use crate::ingest::RtspConfig;

const DEFAULT_DB_PATH: &str = "facewatch.db";
const DEFAULT_DATA_DIR: &str = "data";
const STREAMS_DIR: &str = "streams";
const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

const DEFAULT_BACKEND: &str = "stub";
const MODEL_BACKEND: &str = "tract";
const DEFAULT_DETECTION_THRESHOLD: f32 = 0.7;
const DEFAULT_RECOGNITION_MAX_WIDTH: u32 = 320;
const DEFAULT_RECOGNITION_MAX_FPS: u32 = 1;
const DEFAULT_MATCH_THRESHOLD: f64 = 0.6;
const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.6;
const DEFAULT_RECORD_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECORD_INCREASE_SECS: u64 = 15;

const DEFAULT_LIVE_MAX_WIDTH: u32 = 800;
const DEFAULT_LIVE_MAX_FPS: u32 = 5;
const DEFAULT_JPEG_QUALITY: u8 = 80;

#[derive(Debug, Deserialize, Default)]
struct FacewatchConfigFile {
    db_path: Option<String>,
    data_dir: Option<PathBuf>,
    socket_dir: Option<PathBuf>,
    retry_delay_ms: Option<u64>,
    recognition: Option<RecognitionConfigFile>,
    live: Option<LiveConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct RecognitionConfigFile {
    backend: Option<String>,
    detector_model: Option<PathBuf>,
    embedder_model: Option<PathBuf>,
    detection_threshold: Option<f32>,
    max_width: Option<u32>,
    max_fps: Option<u32>,
    match_threshold: Option<f64>,
    confidence_threshold: Option<f64>,
    record: Option<bool>,
    record_timeout_secs: Option<u64>,
    record_increase_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct LiveConfigFile {
    max_width: Option<u32>,
    max_fps: Option<u32>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    label: Option<String>,
    url: String,
    username: Option<String>,
    password: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct FacewatchConfig {
    pub db_path: String,
    pub data_dir: PathBuf,
    pub socket_dir: PathBuf,
    pub retry_delay: Duration,
    pub recognition: RecognitionConfig,
    pub live: LiveConfig,
    pub cameras: Vec<CameraConfig>,
}

/// Settings of the recognition consumer and matching engine.
#[derive(Debug, Clone)]
pub struct RecognitionConfig {
    /// Face backend name, looked up in the `BackendRegistry`.
    pub backend: String,
    /// ONNX face detector for the `tract` backend.
    pub detector_model: Option<PathBuf>,
    /// ONNX 128-value face embedder for the `tract` backend.
    pub embedder_model: Option<PathBuf>,
    pub detection_threshold: f32,
    pub max_width: u32,
    pub max_fps: u32,
    /// Largest face distance still counted as a match.
    pub match_threshold: f64,
    /// Scores below this become suggestions for review.
    pub confidence_threshold: f64,
    pub record: bool,
    pub record_timeout: Duration,
    pub record_increase: Duration,
}

impl Default for RecognitionConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            detector_model: None,
            embedder_model: None,
            detection_threshold: DEFAULT_DETECTION_THRESHOLD,
            max_width: DEFAULT_RECOGNITION_MAX_WIDTH,
            max_fps: DEFAULT_RECOGNITION_MAX_FPS,
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            record: true,
            record_timeout: Duration::from_secs(DEFAULT_RECORD_TIMEOUT_SECS),
            record_increase: Duration::from_secs(DEFAULT_RECORD_INCREASE_SECS),
        }
    }
}

/// Settings of the live fan-out consumer.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub max_width: u32,
    pub max_fps: u32,
    pub jpeg_quality: u8,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            max_width: DEFAULT_LIVE_MAX_WIDTH,
            max_fps: DEFAULT_LIVE_MAX_FPS,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub camera: Camera,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
}

impl CameraConfig {
    /// Source settings for this camera, credentials included.
    pub fn rtsp_config(&self) -> Result<RtspConfig> {
        let mut config = RtspConfig::for_camera(&self.camera)?;
        if let Some(width) = self.width {
            config.width = width;
        }
        if let Some(height) = self.height {
            config.height = height;
        }
        if let Some(fps) = self.fps {
            config.target_fps = fps;
        }
        Ok(config)
    }
}

impl FacewatchConfig {
    /// Load from the file named by `FACEWATCH_CONFIG` (if set), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACEWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// `<data_dir>/records`, `faces` and `queries` live here.
    pub fn file_store_root(&self) -> &Path {
        &self.data_dir
    }

    fn from_file(file: FacewatchConfigFile) -> Self {
        let data_dir = file
            .data_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        let socket_dir = file
            .socket_dir
            .unwrap_or_else(|| data_dir.join(STREAMS_DIR));

        let recognition_file = file.recognition.unwrap_or_default();
        let defaults = RecognitionConfig::default();
        let recognition = RecognitionConfig {
            backend: recognition_file.backend.unwrap_or(defaults.backend),
            detector_model: recognition_file.detector_model,
            embedder_model: recognition_file.embedder_model,
            detection_threshold: recognition_file
                .detection_threshold
                .unwrap_or(defaults.detection_threshold),
            max_width: recognition_file.max_width.unwrap_or(defaults.max_width),
            max_fps: recognition_file.max_fps.unwrap_or(defaults.max_fps),
            match_threshold: recognition_file
                .match_threshold
                .unwrap_or(defaults.match_threshold),
            confidence_threshold: recognition_file
                .confidence_threshold
                .unwrap_or(defaults.confidence_threshold),
            record: recognition_file.record.unwrap_or(defaults.record),
            record_timeout: recognition_file
                .record_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.record_timeout),
            record_increase: recognition_file
                .record_increase_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.record_increase),
        };

        let live_file = file.live.unwrap_or_default();
        let live_defaults = LiveConfig::default();
        let live = LiveConfig {
            max_width: live_file.max_width.unwrap_or(live_defaults.max_width),
            max_fps: live_file.max_fps.unwrap_or(live_defaults.max_fps),
            jpeg_quality: live_file.jpeg_quality.unwrap_or(live_defaults.jpeg_quality),
        };

        let cameras = file
            .cameras
            .unwrap_or_default()
            .into_iter()
            .map(|entry| {
                let label = entry.label.unwrap_or_else(|| entry.id.clone());
                let mut camera = Camera::new(entry.id, label, entry.url);
                camera.username = entry.username;
                camera.password = entry.password;
                CameraConfig {
                    camera,
                    width: entry.width,
                    height: entry.height,
                    fps: entry.fps,
                }
            })
            .collect();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            data_dir,
            socket_dir,
            retry_delay: Duration::from_millis(
                file.retry_delay_ms.unwrap_or(DEFAULT_RETRY_DELAY_MS),
            ),
            recognition,
            live,
            cameras,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FACEWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("FACEWATCH_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("FACEWATCH_SOCKET_DIR") {
            if !dir.trim().is_empty() {
                self.socket_dir = PathBuf::from(dir);
            }
        }
        if let Ok(backend) = std::env::var("FACEWATCH_BACKEND") {
            if !backend.trim().is_empty() {
                self.recognition.backend = backend.trim().to_string();
            }
        }
        if let Ok(path) = std::env::var("FACEWATCH_DETECTOR_MODEL") {
            if !path.trim().is_empty() {
                self.recognition.detector_model = Some(PathBuf::from(path));
            }
        }
        if let Ok(path) = std::env::var("FACEWATCH_EMBEDDER_MODEL") {
            if !path.trim().is_empty() {
                self.recognition.embedder_model = Some(PathBuf::from(path));
            }
        }
        if let Ok(value) = std::env::var("FACEWATCH_MATCH_THRESHOLD") {
            self.recognition.match_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_MATCH_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("FACEWATCH_CONFIDENCE_THRESHOLD") {
            self.recognition.confidence_threshold = value
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_CONFIDENCE_THRESHOLD must be a number"))?;
        }
        if let Ok(value) = std::env::var("FACEWATCH_RECORD") {
            self.recognition.record = parse_bool(&value)
                .ok_or_else(|| anyhow!("FACEWATCH_RECORD must be true or false"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for entry in &self.cameras {
            let id = entry.camera.id.as_str();
            if id.trim().is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if id == "." || id == ".." || id.contains(['/', '\\']) {
                return Err(anyhow!("camera id {:?} cannot be used as a file name", id));
            }
            if !seen.insert(id) {
                return Err(anyhow!("duplicate camera id {:?}", id));
            }
            if entry.width == Some(0) || entry.height == Some(0) {
                return Err(anyhow!("camera {}: width and height must be non-zero", id));
            }
        }

        for (name, value) in [
            ("match_threshold", self.recognition.match_threshold),
            ("confidence_threshold", self.recognition.confidence_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(anyhow!("recognition.{} must be a positive number", name));
            }
        }
        let detection = self.recognition.detection_threshold;
        if !(detection > 0.0 && detection <= 1.0) {
            return Err(anyhow!("recognition.detection_threshold must be in (0, 1]"));
        }
        if self.recognition.backend == MODEL_BACKEND
            && (self.recognition.detector_model.is_none() || self.recognition.embedder_model.is_none())
        {
            return Err(anyhow!(
                "recognition.backend {} needs detector_model and embedder_model",
                MODEL_BACKEND
            ));
        }
        if self.recognition.max_width == 0 || self.live.max_width == 0 {
            return Err(anyhow!("max_width must be greater than zero"));
        }
        if !(1..=100).contains(&self.live.jpeg_quality) {
            return Err(anyhow!("live.jpeg_quality must be between 1 and 100"));
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<FacewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = if path.extension().is_some_and(|ext| ext == "toml") {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
