//! facewatch
//!
//! Multi-camera face recognition with a human review loop.
//!
//! # Architecture
//!
//! Every camera runs one `VideoStream`: a loop thread that pulls frames from a
//! `FrameSource`, feeds the detection-triggered `Recorder`, and pushes copies of each
//! frame to its consumers without ever blocking on them.
//!
//! Two consumers ship with the crate:
//!
//! 1. **Recognition**: locates faces, matches them against known encodings in SQLite and
//!    keeps unconfident matches as suggestions for review.
//! 2. **Live fan-out**: republishes annotated JPEG frames over a per-camera Unix socket.
//!
//! # Module Structure
//!
//! - `frame`: decoded frames, face rectangles and image helpers
//! - `ingest`: frame sources (RTSP, synthetic)
//! - `stream`: orchestrator, bounded consumers, recording
//! - `detect`: face backends and their registry
//! - `recognition`: store, matching engine, review workflow
//! - `fanout`: socket publisher, consumer and subscriber

use anyhow::Result;
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};

pub mod camera;
pub mod config;
pub mod detect;
pub mod error;
pub mod fanout;
pub mod frame;
pub mod ingest;
pub mod recognition;
pub mod stream;

pub use camera::Camera;
pub use config::{CameraConfig, FacewatchConfig, LiveConfig, RecognitionConfig};
pub use detect::{BackendRegistry, FaceBackend, StubBackend, ENCODING_LEN};
#[cfg(feature = "backend-tract")]
pub use detect::TractFaceBackend;
pub use error::{FanoutError, RecognitionError, RecordingError};
pub use fanout::{SocketClient, SocketHandler, StreamServer};
pub use frame::{FaceRect, Frame, StageTimer};
pub use ingest::{FrameSource, RtspConfig, RtspSource};
pub use recognition::{
    FileStore, Identity, MatchSettings, QueryResult, Recognition, RecognitionHandler,
    Recognizer, SuggestionRow,
};
pub use stream::{
    FrameHandler, HandlerThread, Recorder, StreamHandle, StreamState, StreamStatus, VideoStream,
};

/// Random in-memory database shared by every connection opened on the same URI.
pub fn shared_memory_uri() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!(
        "file:facewatch_{:x}?mode=memory&cache=shared",
        u64::from_le_bytes(bytes)
    )
}

/// Open `db_path`, honouring `file:` URIs.
pub fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Fresh 128-bit identifier, hex encoded. Used for every row id.
pub fn new_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_hex() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn shared_memory_connections_see_each_other() {
        let uri = shared_memory_uri();
        let first = open_db_connection(&uri).unwrap();
        first
            .execute_batch("CREATE TABLE marker (id INTEGER PRIMARY KEY);")
            .unwrap();
        let second = open_db_connection(&uri).unwrap();
        let count: i64 = second
            .query_row("SELECT COUNT(*) FROM marker", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
