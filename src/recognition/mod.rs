//! Face recognition and the suggestion review workflow.
//!
//! - `store`: SQLite schema and row helpers
//! - `files`: on-disk layout of recordings, known faces and query images
//! - `Recognizer`: matching plus the Query/Suggestion lifecycle
//! - `RecognitionHandler`: per-camera frame consumer driving the `Recognizer`
//! - `cli`: the `suggestions` review tool

pub mod cli;
mod engine;
mod files;
mod handler;
pub mod store;

pub use engine::{ComputeReport, MatchSettings, QueryResult, Recognition, Recognizer};
pub use files::FileStore;
pub use handler::{RecognitionHandler, RECOGNITION_QUEUE_CAPACITY};
pub use store::{FaceEncoding, Identity, QueryRow, SuggestionRow};
