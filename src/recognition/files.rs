//! On-disk layout for face crops, query snapshots and recordings.

use anyhow::{Context, Result};
use image::{ImageFormat, RgbImage};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::stream::recording::list_recordings;

const RECORDS_DIR: &str = "records";
const FACES_DIR: &str = "faces";
const QUERIES_DIR: &str = "queries";
const FULL_IMAGE: &str = "full.png";

/// On-disk layout under the data directory:
///
/// - `records/<camera_id>/<start>.<ext>`
/// - `faces/<identity_id>/<encoding_id>.png`
/// - `queries/<query_id>/full.png` and `queries/<query_id>/<suggestion_id>.png`
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn records_dir(&self, camera_id: &str) -> PathBuf {
        self.root.join(RECORDS_DIR).join(camera_id)
    }

    pub fn face_path(&self, identity_id: &str, encoding_id: &str) -> PathBuf {
        self.root
            .join(FACES_DIR)
            .join(identity_id)
            .join(format!("{}.png", encoding_id))
    }

    pub fn query_dir(&self, query_id: &str) -> PathBuf {
        self.root.join(QUERIES_DIR).join(query_id)
    }

    pub fn query_image_path(&self, query_id: &str) -> PathBuf {
        self.query_dir(query_id).join(FULL_IMAGE)
    }

    pub fn suggestion_path(&self, query_id: &str, suggestion_id: &str) -> PathBuf {
        self.query_dir(query_id)
            .join(format!("{}.png", suggestion_id))
    }

    pub fn recordings(&self, camera_id: &str) -> Result<Vec<PathBuf>> {
        list_recordings(&self.records_dir(camera_id))
    }

    /// Write `image` as PNG, creating parent directories.
    pub fn write_png(&self, path: &Path, image: &RgbImage) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        image
            .save_with_format(path, ImageFormat::Png)
            .with_context(|| format!("write {}", path.display()))
    }

    pub fn read_image(&self, path: &Path) -> Result<RgbImage> {
        Ok(image::open(path)
            .with_context(|| format!("read {}", path.display()))?
            .to_rgb8())
    }

    pub fn remove_file(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                Err(err).with_context(|| format!("remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }

    pub fn remove_dir(&self, path: &Path) -> Result<()> {
        match std::fs::remove_dir_all(path) {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                Err(err).with_context(|| format!("remove {}", path.display()))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn layout_matches_conventions() {
        let files = FileStore::new("/data");
        assert_eq!(
            files.face_path("id1", "enc1"),
            PathBuf::from("/data/faces/id1/enc1.png")
        );
        assert_eq!(
            files.query_image_path("q1"),
            PathBuf::from("/data/queries/q1/full.png")
        );
        assert_eq!(
            files.suggestion_path("q1", "s1"),
            PathBuf::from("/data/queries/q1/s1.png")
        );
        assert_eq!(files.records_dir("front"), PathBuf::from("/data/records/front"));
    }

    #[test]
    fn png_roundtrip_and_idempotent_removal() {
        let dir = tempfile::tempdir().unwrap();
        let files = FileStore::new(dir.path());
        let path = files.suggestion_path("q1", "s1");
        let image = RgbImage::from_pixel(4, 3, Rgb([10, 20, 30]));

        files.write_png(&path, &image).unwrap();
        assert_eq!(files.read_image(&path).unwrap(), image);

        files.remove_file(&path).unwrap();
        files.remove_file(&path).unwrap();
        files.remove_dir(&files.query_dir("q1")).unwrap();
        files.remove_dir(&files.query_dir("q1")).unwrap();
        assert!(!files.query_dir("q1").exists());
        assert!(files.recordings("front").unwrap().is_empty());
    }
}
