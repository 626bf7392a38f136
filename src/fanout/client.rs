//! Subscriber side of the live fan-out socket.

use anyhow::{Context, Result};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use super::socket_path;
use super::wire::{self, DEFAULT_MAX_FRAME};
use crate::error::FanoutError;

/// Subscriber side of a camera's live socket.
///
/// Iterating yields one JPEG per item and ends when the publisher closes the connection.
/// Any other read error is yielded once and ends the sequence too: after a failed read
/// the stream position inside the framing is unknown.
pub struct SocketClient {
    stream: Option<UnixStream>,
    max_frame: u32,
}

impl SocketClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .with_context(|| format!("connect to {}", path.display()))?;
        Ok(Self {
            stream: Some(stream),
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    /// Connect to the socket a camera publishes on.
    pub fn for_camera(socket_dir: &Path, camera_id: &str) -> Result<Self> {
        Self::connect(socket_path(socket_dir, camera_id))
    }

    /// Refuse frames larger than `max_frame` bytes.
    pub fn with_max_frame(mut self, max_frame: u32) -> Self {
        self.max_frame = max_frame;
        self
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        if let Some(stream) = &self.stream {
            stream.set_read_timeout(timeout)?;
        }
        Ok(())
    }

    /// Block until the next frame arrives. Any error closes the client.
    pub fn read_frame(&mut self) -> Result<Vec<u8>, FanoutError> {
        let stream = self.stream.as_mut().ok_or(FanoutError::ConnectionClosed)?;
        let result = wire::read_message(stream, self.max_frame);
        if result.is_err() {
            self.close();
        }
        result
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}

impl Iterator for SocketClient {
    type Item = Result<Vec<u8>, FanoutError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_frame() {
            Ok(frame) => Some(Ok(frame)),
            Err(FanoutError::ConnectionClosed) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl Drop for SocketClient {
    fn drop(&mut self) {
        self.close();
    }
}
