//! Live fan-out of camera frames over local Unix sockets.
//!
//! - `wire`: length-prefixed JPEG framing
//! - `StreamServer`: per-camera publisher
//! - `SocketHandler`: frame consumer feeding a publisher
//! - `SocketClient`: subscriber

use std::path::{Path, PathBuf};

mod client;
mod handler;
mod server;
pub mod wire;

pub use client::SocketClient;
pub use handler::{SocketHandler, SOCKET_QUEUE_CAPACITY};
pub use server::StreamServer;

/// Socket a camera publishes on: `<socket_dir>/<camera_id>.sock`.
pub fn socket_path(socket_dir: &Path, camera_id: &str) -> PathBuf {
    socket_dir.join(format!("{}.sock", camera_id))
}
