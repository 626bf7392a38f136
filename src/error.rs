//! Domain errors callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error`; these enums are carried inside it and
//! recovered with `err.downcast_ref::<RecognitionError>()`.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RecognitionError {
    #[error("no encoding found")]
    NoEncodingFound,
    #[error("more than one encoding found")]
    MultipleEncodingFound,
    #[error("no identity provided")]
    NoIdentityProvided,
    #[error("face file not found: {}", .0.display())]
    FaceFileNotFound(PathBuf),
    #[error("suggestion {suggestion_id} not found in query {query_id}")]
    SuggestionNotFound {
        query_id: String,
        suggestion_id: String,
    },
    #[error("identity {0} not found")]
    IdentityNotFound(String),
    #[error("encoding must have {expected} values, got {actual}")]
    InvalidEncoding { expected: usize, actual: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    /// The container cannot take another frame; the frame was not written.
    #[error("recording {} reached its size limit", .0.display())]
    Full(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("frame of {0} bytes exceeds the subscriber limit")]
    FrameTooLarge(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
