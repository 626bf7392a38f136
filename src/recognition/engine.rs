//! Matching engine and the suggestion review workflow.
//!
//! Every database change that is paired with a file write runs in one transaction: the
//! file is written before commit and removed again if the commit fails. Files that
//! belong to deleted rows are only removed after the commit succeeded.

use anyhow::Result;
use chrono::Utc;
use image::RgbImage;
use rusqlite::{Connection, Transaction};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::files::FileStore;
use super::store::{self, FaceEncoding, Identity, QueryRow, SuggestionRow};
use crate::config::RecognitionConfig;
use crate::detect::FaceBackend;
use crate::error::RecognitionError;
use crate::frame::FaceRect;

/// Outcome of matching one face.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recognition {
    pub identity: Option<Identity>,
    /// `1 - distance` of the best match. Not clamped.
    pub score: Option<f64>,
    pub rect: FaceRect,
}

/// Result of one `query` call.
#[derive(Clone, Debug, Serialize)]
pub struct QueryResult {
    /// Set when at least one face needed review and the query was kept.
    pub query_id: Option<String>,
    pub recognitions: Vec<Recognition>,
    pub suggestion_ids: Vec<String>,
}

/// Counts from a `compute_suggestions` pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ComputeReport {
    pub confirmed: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct MatchSettings {
    /// Largest distance still counted as a match.
    pub match_threshold: f64,
    /// Scores below this are kept as suggestions; at or above, suggestions are confirmed.
    pub confidence_threshold: f64,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self::from(&RecognitionConfig::default())
    }
}

impl From<&RecognitionConfig> for MatchSettings {
    fn from(config: &RecognitionConfig) -> Self {
        Self {
            match_threshold: config.match_threshold,
            confidence_threshold: config.confidence_threshold,
        }
    }
}

/// Face matching against the store, plus the Query/Suggestion lifecycle.
///
/// Owns its connection and backend; create one per thread.
pub struct Recognizer {
    conn: Connection,
    files: FileStore,
    backend: Box<dyn FaceBackend>,
    settings: MatchSettings,
}

impl Recognizer {
    pub fn open(
        db_path: &str,
        files: FileStore,
        backend: Box<dyn FaceBackend>,
        settings: MatchSettings,
    ) -> Result<Self> {
        let conn = store::open_store(db_path)?;
        Ok(Self {
            conn,
            files,
            backend,
            settings,
        })
    }

    /// Use an existing connection (e.g. in-memory) as the store.
    pub fn with_connection(
        conn: Connection,
        files: FileStore,
        backend: Box<dyn FaceBackend>,
        settings: MatchSettings,
    ) -> Result<Self> {
        store::prepare(&conn)?;
        Ok(Self {
            conn,
            files,
            backend,
            settings,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn files(&self) -> &FileStore {
        &self.files
    }

    pub fn settings(&self) -> MatchSettings {
        self.settings
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn create_identity(&self, first_name: &str, last_name: &str) -> Result<Identity> {
        store::insert_identity(&self.conn, &crate::new_id(), first_name, last_name)
    }

    pub fn identities(&self) -> Result<Vec<Identity>> {
        store::list_identities(&self.conn)
    }

    pub fn queries(&self) -> Result<Vec<QueryRow>> {
        store::list_queries(&self.conn)
    }

    pub fn suggestions(&self) -> Result<Vec<SuggestionRow>> {
        store::list_suggestions(&self.conn)
    }

    /// Face rectangles in `image`.
    pub fn locate(&mut self, image: &RgbImage) -> Result<Vec<FaceRect>> {
        self.backend.locate(image)
    }

    /// Match the face at `rect` and return the recognition with the raw encoding.
    pub fn identify(&mut self, image: &RgbImage, rect: FaceRect) -> Result<(Recognition, Vec<f64>)> {
        identify_with(
            self.backend.as_mut(),
            &self.conn,
            image,
            rect,
            self.settings.match_threshold,
        )
    }

    /// Match every face in `faces` and keep a Query for those that need review.
    ///
    /// The Query and its files only persist when at least one Suggestion was created.
    pub fn query(&mut self, image: &RgbImage, faces: &[FaceRect], camera_id: Option<&str>) -> Result<QueryResult> {
        let Self {
            conn,
            files,
            backend,
            settings,
        } = self;

        let query_id = crate::new_id();
        let query_dir = files.query_dir(&query_id);
        let tx = conn.transaction()?;

        let outcome = record_query(
            &tx,
            files,
            backend.as_mut(),
            *settings,
            &query_id,
            image,
            faces,
            camera_id,
        );

        match outcome {
            Ok((recognitions, suggestion_ids)) if !suggestion_ids.is_empty() => {
                if let Err(err) = tx.commit() {
                    let _ = files.remove_dir(&query_dir);
                    return Err(err.into());
                }
                log::debug!(
                    "Recognizer: query {} kept with {} suggestion(s)",
                    query_id,
                    suggestion_ids.len()
                );
                Ok(QueryResult {
                    query_id: Some(query_id),
                    recognitions,
                    suggestion_ids,
                })
            }
            Ok((recognitions, _)) => {
                tx.rollback()?;
                files.remove_dir(&query_dir)?;
                Ok(QueryResult {
                    query_id: None,
                    recognitions,
                    suggestion_ids: Vec::new(),
                })
            }
            Err(err) => {
                drop(tx);
                let _ = files.remove_dir(&query_dir);
                Err(err)
            }
        }
    }

    /// Store a known face for `identity_id`.
    ///
    /// The embedding is extracted from `rect` unless `encoding` is supplied.
    pub fn create_face_encoding(
        &mut self,
        identity_id: &str,
        image: &RgbImage,
        rect: FaceRect,
        encoding: Option<Vec<f64>>,
    ) -> Result<FaceEncoding> {
        let encoding = match encoding {
            Some(encoding) => encoding,
            None => extract_single(self.backend.as_mut(), image, rect)?,
        };
        let (vec_low, vec_high) = store::split_encoding(&encoding)?;
        let crop = rect.crop(image);

        let tx = self.conn.transaction()?;
        let (face_encoding, face_path) =
            insert_encoding_with_crop(&tx, &self.files, identity_id, &vec_low, &vec_high, &crop)?;
        commit_or_remove(tx, &self.files, &face_path)?;
        Ok(face_encoding)
    }

    /// Turn a suggestion into a known face of `identity_id` (or its tentative identity).
    pub fn confirm_suggestion(
        &mut self,
        query_id: &str,
        suggestion_id: &str,
        identity_id: Option<&str>,
    ) -> Result<FaceEncoding> {
        let suggestion = store::get_suggestion(&self.conn, query_id, suggestion_id)?
            .ok_or_else(|| RecognitionError::SuggestionNotFound {
                query_id: query_id.to_string(),
                suggestion_id: suggestion_id.to_string(),
            })?;

        let crop_path = self.files.suggestion_path(query_id, suggestion_id);
        if !crop_path.exists() {
            return Err(RecognitionError::FaceFileNotFound(crop_path).into());
        }
        let crop = self.files.read_image(&crop_path)?;

        let identity_id = identity_id
            .map(str::to_string)
            .or_else(|| suggestion.identity_id.clone())
            .ok_or(RecognitionError::NoIdentityProvided)?;

        let tx = self.conn.transaction()?;
        let (face_encoding, face_path) = insert_encoding_with_crop(
            &tx,
            &self.files,
            &identity_id,
            &suggestion.vec_low,
            &suggestion.vec_high,
            &crop,
        )?;
        let query_removed = match store::remove_suggestion(&tx, query_id, suggestion_id) {
            Ok(removed) => removed,
            Err(err) => {
                let _ = self.files.remove_file(&face_path);
                return Err(err);
            }
        };
        commit_or_remove(tx, &self.files, &face_path)?;

        self.cleanup_suggestion_files(query_id, suggestion_id, query_removed);
        log::info!(
            "Recognizer: suggestion {} confirmed as identity {} (encoding {})",
            suggestion_id,
            identity_id,
            face_encoding.id
        );
        Ok(face_encoding)
    }

    /// Drop a suggestion, and its query when it was the last one.
    pub fn delete_suggestion(&mut self, query_id: &str, suggestion_id: &str) -> Result<()> {
        let tx = self.conn.transaction()?;
        let query_removed = store::remove_suggestion(&tx, query_id, suggestion_id)?;
        tx.commit()?;
        self.cleanup_suggestion_files(query_id, suggestion_id, query_removed);
        Ok(())
    }

    /// Delete every pending suggestion. Returns how many were removed.
    pub fn clear_suggestions(&mut self) -> Result<usize> {
        let suggestions = store::list_suggestions(&self.conn)?;
        for suggestion in &suggestions {
            self.delete_suggestion(&suggestion.query_id, &suggestion.id)?;
        }
        Ok(suggestions.len())
    }

    /// Re-run matching for every pending suggestion against the current known faces.
    ///
    /// Suggestions that now clear the confidence threshold are confirmed; the others get
    /// their tentative identity and score refreshed. A suggestion whose image or crop is
    /// gone is left untouched and counted as skipped.
    pub fn compute_suggestions(&mut self) -> Result<ComputeReport> {
        let mut report = ComputeReport::default();

        for suggestion in store::list_suggestions(&self.conn)? {
            let image_path = self.files.query_image_path(&suggestion.query_id);
            if !image_path.exists() {
                log::warn!(
                    "No file found for suggestion {}: {}",
                    suggestion.id,
                    image_path.display()
                );
                report.skipped += 1;
                continue;
            }
            let image = match self.files.read_image(&image_path) {
                Ok(image) => image,
                Err(err) => {
                    log::warn!("Skipping suggestion {}: {:#}", suggestion.id, err);
                    report.skipped += 1;
                    continue;
                }
            };

            let recognition = match self.identify(&image, suggestion.rect) {
                Ok((recognition, _)) => recognition,
                Err(err) if err.downcast_ref::<RecognitionError>().is_some() => {
                    log::warn!("Skipping suggestion {}: {}", suggestion.id, err);
                    report.skipped += 1;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let new_identity = recognition.identity.as_ref().map(|identity| identity.id.as_str());
            match recognition.score {
                Some(score) if score >= self.settings.confidence_threshold => {
                    log::info!(
                        "Validating suggestion {} with a score of {:.2}",
                        suggestion.id,
                        score
                    );
                    match self.confirm_suggestion(&suggestion.query_id, &suggestion.id, new_identity) {
                        Ok(_) => report.confirmed += 1,
                        Err(err) if err.downcast_ref::<RecognitionError>().is_some() => {
                            log::warn!("Skipping suggestion {}: {}", suggestion.id, err);
                            report.skipped += 1;
                        }
                        Err(err) => return Err(err),
                    }
                }
                _ => {
                    store::update_suggestion_match(&self.conn, &suggestion.id, new_identity, recognition.score)?;
                    log::info!(
                        "Updating suggestion {}: Identity[{}] -> Identity[{}] - Score[{:.2}] -> Score[{:.2}]",
                        suggestion.id,
                        suggestion.identity_id.as_deref().unwrap_or("None"),
                        new_identity.unwrap_or("None"),
                        suggestion.score.unwrap_or(0.0),
                        recognition.score.unwrap_or(0.0)
                    );
                    report.updated += 1;
                }
            }
        }

        Ok(report)
    }

    fn cleanup_suggestion_files(&self, query_id: &str, suggestion_id: &str, query_removed: bool) {
        let result = if query_removed {
            self.files.remove_dir(&self.files.query_dir(query_id))
        } else {
            self.files
                .remove_file(&self.files.suggestion_path(query_id, suggestion_id))
        };
        if let Err(err) = result {
            log::warn!("Recognizer: {:#}", err);
        }
    }
}

fn extract_single(backend: &mut dyn FaceBackend, image: &RgbImage, rect: FaceRect) -> Result<Vec<f64>> {
    let mut encodings = backend.encode(image, &[rect])?;
    match encodings.len() {
        0 => Err(RecognitionError::NoEncodingFound.into()),
        1 => Ok(encodings.remove(0)),
        _ => Err(RecognitionError::MultipleEncodingFound.into()),
    }
}

fn identify_with(
    backend: &mut dyn FaceBackend,
    conn: &Connection,
    image: &RgbImage,
    rect: FaceRect,
    match_threshold: f64,
) -> Result<(Recognition, Vec<f64>)> {
    let encoding = extract_single(backend, image, rect)?;
    let (vec_low, vec_high) = store::split_encoding(&encoding)?;

    let (identity, score) = match store::nearest_identity(conn, &vec_low, &vec_high, match_threshold)? {
        Some((identity_id, distance)) => (store::get_identity(conn, &identity_id)?, Some(1.0 - distance)),
        None => (None, None),
    };
    Ok((
        Recognition {
            identity,
            score,
            rect,
        },
        encoding,
    ))
}

#[allow(clippy::too_many_arguments)]
fn record_query(
    tx: &Transaction<'_>,
    files: &FileStore,
    backend: &mut dyn FaceBackend,
    settings: MatchSettings,
    query_id: &str,
    image: &RgbImage,
    faces: &[FaceRect],
    camera_id: Option<&str>,
) -> Result<(Vec<Recognition>, Vec<String>)> {
    store::insert_query(tx, query_id, camera_id)?;
    files.write_png(&files.query_image_path(query_id), image)?;

    let mut recognitions = Vec::with_capacity(faces.len());
    let mut suggestion_ids = Vec::new();
    for rect in faces {
        let (recognition, encoding) =
            identify_with(backend, tx, image, *rect, settings.match_threshold)?;

        let confident = recognition
            .score
            .is_some_and(|score| score >= settings.confidence_threshold);
        if !confident {
            let (vec_low, vec_high) = store::split_encoding(&encoding)?;
            let suggestion = SuggestionRow {
                id: crate::new_id(),
                query_id: query_id.to_string(),
                rect: *rect,
                vec_low,
                vec_high,
                identity_id: recognition.identity.as_ref().map(|identity| identity.id.clone()),
                score: recognition.score,
                created_at: Utc::now().timestamp_millis(),
            };
            store::insert_suggestion(tx, &suggestion)?;
            files.write_png(
                &files.suggestion_path(query_id, &suggestion.id),
                &rect.crop(image),
            )?;
            suggestion_ids.push(suggestion.id);
        }
        recognitions.push(recognition);
    }
    Ok((recognitions, suggestion_ids))
}

/// Insert an encoding row and write its crop. The crop is removed again on failure.
fn insert_encoding_with_crop(
    tx: &Transaction<'_>,
    files: &FileStore,
    identity_id: &str,
    vec_low: &[f64],
    vec_high: &[f64],
    crop: &RgbImage,
) -> Result<(FaceEncoding, PathBuf)> {
    if store::get_identity(tx, identity_id)?.is_none() {
        return Err(RecognitionError::IdentityNotFound(identity_id.to_string()).into());
    }
    let encoding_id = crate::new_id();
    let face_encoding = store::insert_face_encoding(tx, &encoding_id, identity_id, vec_low, vec_high)?;
    let face_path = files.face_path(identity_id, &encoding_id);
    if let Err(err) = files.write_png(&face_path, crop) {
        let _ = files.remove_file(&face_path);
        return Err(err);
    }
    Ok((face_encoding, face_path))
}

fn commit_or_remove(tx: Transaction<'_>, files: &FileStore, written: &Path) -> Result<()> {
    if let Err(err) = tx.commit() {
        let _ = files.remove_file(written);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{StubBackend, ENCODING_LEN};
    use image::Rgb;

    const FACE: FaceRect = FaceRect {
        top: 10,
        right: 30,
        bottom: 30,
        left: 10,
    };

    fn recognizer(dir: &std::path::Path, backend: StubBackend) -> Recognizer {
        Recognizer::with_connection(
            Connection::open_in_memory().unwrap(),
            FileStore::new(dir),
            Box::new(backend),
            MatchSettings::default(),
        )
        .unwrap()
    }

    fn image() -> RgbImage {
        RgbImage::from_pixel(64, 48, Rgb([90, 60, 30]))
    }

    #[test]
    fn identical_vector_scores_exactly_one() {
        let dir = tempfile::tempdir().unwrap();
        let encoding = vec![0.25; ENCODING_LEN];
        let mut recognizer = recognizer(
            dir.path(),
            StubBackend::new().with_face(FACE, encoding.clone()),
        );
        let alice = recognizer.create_identity("Alice", "Liddell").unwrap();
        recognizer
            .create_face_encoding(&alice.id, &image(), FACE, Some(encoding))
            .unwrap();

        let (recognition, _) = recognizer.identify(&image(), FACE).unwrap();
        assert_eq!(recognition.identity, Some(alice));
        assert_eq!(recognition.score, Some(1.0));
    }

    #[test]
    fn identify_requires_exactly_one_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let none = FaceRect::new(0, 0, 0, 0);
        let many = FaceRect::new(0, 8, 8, 0);
        let mut recognizer = recognizer(
            dir.path(),
            StubBackend::new()
                .with_encodings(none, Vec::new())
                .with_encodings(many, vec![vec![0.0; ENCODING_LEN]; 2]),
        );

        let err = recognizer.identify(&image(), none).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::NoEncodingFound)
        ));
        let err = recognizer.identify(&image(), many).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::MultipleEncodingFound)
        ));
    }

    #[test]
    fn create_face_encoding_requires_existing_identity() {
        let dir = tempfile::tempdir().unwrap();
        let mut recognizer = recognizer(dir.path(), StubBackend::new());
        let err = recognizer
            .create_face_encoding("ghost", &image(), FACE, Some(vec![0.0; ENCODING_LEN]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::IdentityNotFound(_))
        ));
        assert!(!dir.path().join("faces").join("ghost").exists());
    }

    #[test]
    fn wrong_encoding_length_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut recognizer = recognizer(dir.path(), StubBackend::new());
        let alice = recognizer.create_identity("Alice", "Liddell").unwrap();
        let err = recognizer
            .create_face_encoding(&alice.id, &image(), FACE, Some(vec![0.0; 10]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecognitionError>(),
            Some(RecognitionError::InvalidEncoding {
                expected: 128,
                actual: 10
            })
        ));
    }

    #[test]
    fn failed_query_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let broken = FaceRect::new(0, 8, 8, 0);
        let mut recognizer = recognizer(
            dir.path(),
            StubBackend::new().with_encodings(broken, Vec::new()),
        );
        assert!(recognizer
            .query(&image(), &[FACE, broken], Some("front"))
            .is_err());
        assert!(recognizer.queries().unwrap().is_empty());
        let queries_dir = dir.path().join("queries");
        assert!(!queries_dir.exists() || std::fs::read_dir(&queries_dir).unwrap().next().is_none());
    }
}
