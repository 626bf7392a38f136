//! Local publisher for one camera's live frames.
//!
//! A single loop thread waits in `poll(2)` on the listener, a wake socket and every
//! connected client. It alone adds and removes clients. Client sockets are non-blocking:
//! `send_to_clients` writes what each socket takes right away and parks the rest of the
//! message in that client's backlog, which the loop flushes on `POLLOUT`. A client with
//! a backlog skips new frames. One whose backlog makes no progress for the write timeout
//! is dropped.

use anyhow::{anyhow, Context, Result};
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::wire;

const POLL_TIMEOUT_MS: libc::c_int = 200;
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

struct Client {
    id: u64,
    stream: UnixStream,
    backlog: Vec<u8>,
    backlog_since: Option<Instant>,
    failed: bool,
}

impl Client {
    fn new(id: u64, stream: UnixStream) -> Self {
        Self {
            id,
            stream,
            backlog: Vec::new(),
            backlog_since: None,
            failed: false,
        }
    }

    fn is_backlogged(&self) -> bool {
        !self.backlog.is_empty()
    }

    /// Hand one message to the socket. Returns false when the client is still busy with
    /// the previous one and this frame is skipped.
    fn offer(&mut self, message: &[u8]) -> io::Result<bool> {
        if self.is_backlogged() {
            return Ok(false);
        }
        let written = write_available(&self.stream, message)?;
        if written < message.len() {
            self.backlog.extend_from_slice(&message[written..]);
            self.backlog_since = Some(Instant::now());
        }
        Ok(true)
    }

    fn flush(&mut self) -> io::Result<()> {
        let written = write_available(&self.stream, &self.backlog)?;
        self.backlog.drain(..written);
        if self.backlog.is_empty() {
            self.backlog_since = None;
        } else if written > 0 {
            self.backlog_since = Some(Instant::now());
        }
        Ok(())
    }

    /// No byte of the backlog went out for `timeout`.
    fn stalled(&self, timeout: Duration) -> bool {
        self.backlog_since
            .is_some_and(|since| since.elapsed() >= timeout)
    }

    fn fail(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
        self.backlog = Vec::new();
        self.backlog_since = None;
        self.failed = true;
    }
}

/// Write as much of `buf` as the non-blocking socket accepts without waiting.
fn write_available(mut stream: &UnixStream, buf: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    while written < buf.len() {
        match stream.write(&buf[written..]) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(err) if err.kind() == ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(written)
}

struct Pending {
    listener: UnixListener,
    wake_rx: UnixStream,
}

/// Unix-socket publisher with length-prefixed JPEG framing.
pub struct StreamServer {
    path: PathBuf,
    clients: Arc<Mutex<Vec<Client>>>,
    running: Arc<AtomicBool>,
    stopped: AtomicBool,
    wake_tx: UnixStream,
    pending: Mutex<Option<Pending>>,
    join: Mutex<Option<JoinHandle<()>>>,
    write_timeout: Duration,
}

impl StreamServer {
    /// Bind the socket at `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        remove_stale_socket(&path)?;

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("bind {}", path.display()))?;
        listener.set_nonblocking(true)?;
        let (wake_tx, wake_rx) = UnixStream::pair().context("create wake channel")?;
        wake_rx.set_nonblocking(true)?;
        wake_tx.set_nonblocking(true)?;

        Ok(Self {
            path,
            clients: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            stopped: AtomicBool::new(false),
            wake_tx,
            pending: Mutex::new(Some(Pending { listener, wake_rx })),
            join: Mutex::new(None),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        })
    }

    /// How long a client may sit on an unsent frame before it is dropped.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start the accept/readiness loop.
    pub fn start(&self) -> Result<()> {
        let pending = self
            .pending
            .lock()
            .map_err(|_| anyhow!("server lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("server {} already started", self.path.display()))?;

        self.running.store(true, Ordering::SeqCst);
        let event_loop = EventLoop {
            listener: pending.listener,
            wake_rx: pending.wake_rx,
            clients: self.clients.clone(),
            running: self.running.clone(),
            next_id: AtomicU64::new(1),
            write_timeout: self.write_timeout,
            label: self.path.display().to_string(),
        };
        let join = std::thread::Builder::new()
            .name("stream-server".to_string())
            .spawn(move || event_loop.run())?;
        *self
            .join
            .lock()
            .map_err(|_| anyhow!("server lock poisoned"))? = Some(join);
        log::info!("StreamServer: listening on {}", self.path.display());
        Ok(())
    }

    /// Number of connected, healthy clients.
    pub fn client_count(&self) -> usize {
        self.lock_clients()
            .map(|clients| clients.iter().filter(|client| !client.failed).count())
            .unwrap_or(0)
    }

    /// Send one frame to every client without blocking. Returns how many clients took it;
    /// clients still busy with an earlier frame skip this one.
    pub fn send_to_clients(&self, payload: &[u8]) -> Result<usize> {
        let message = wire::encode_message(payload)?;
        let mut clients = self.lock_clients()?;
        let mut sent = 0;
        let mut wake = false;
        for client in clients.iter_mut().filter(|client| !client.failed) {
            match client.offer(&message) {
                Ok(true) => {
                    sent += 1;
                    wake |= client.is_backlogged();
                }
                Ok(false) => log::trace!(
                    "StreamServer: client {} on {} busy, frame skipped",
                    client.id,
                    self.path.display()
                ),
                Err(err) => {
                    log::warn!(
                        "StreamServer: dropping client {} on {}: {}",
                        client.id,
                        self.path.display(),
                        err
                    );
                    client.fail();
                    wake = true;
                }
            }
        }
        drop(clients);
        if wake {
            self.wake();
        }
        Ok(sent)
    }

    /// Stop the loop, disconnect every client and remove the socket file.
    pub fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);
        self.wake();
        if let Ok(mut pending) = self.pending.lock() {
            pending.take();
        }
        let join = self
            .join
            .lock()
            .map_err(|_| anyhow!("server lock poisoned"))?
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| anyhow!("stream server thread panicked"))?;
        }
        if let Ok(mut clients) = self.lock_clients() {
            for client in clients.drain(..) {
                let _ = client.stream.shutdown(Shutdown::Both);
            }
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
        log::info!("StreamServer: stopped {}", self.path.display());
        Ok(())
    }

    fn wake(&self) {
        // A full wake buffer already guarantees a pending wakeup.
        let _ = (&self.wake_tx).write(&[1]);
    }

    fn lock_clients(&self) -> Result<MutexGuard<'_, Vec<Client>>> {
        self.clients
            .lock()
            .map_err(|_| anyhow!("client list lock poisoned"))
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::warn!("StreamServer: {:#}", err);
        }
    }
}

fn remove_stale_socket(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            log::debug!("StreamServer: removing stale socket {}", path.display());
            std::fs::remove_file(path).with_context(|| format!("remove {}", path.display()))
        }
        Ok(_) => Err(anyhow!("{} exists and is not a socket", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("stat {}", path.display())),
    }
}

struct EventLoop {
    listener: UnixListener,
    wake_rx: UnixStream,
    clients: Arc<Mutex<Vec<Client>>>,
    running: Arc<AtomicBool>,
    next_id: AtomicU64,
    write_timeout: Duration,
    label: String,
}

impl EventLoop {
    fn run(self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(err) = self.iterate() {
                log::error!("StreamServer: loop on {} failed: {:#}", self.label, err);
                break;
            }
        }
        log::debug!("StreamServer: loop on {} exited", self.label);
    }

    fn iterate(&self) -> Result<()> {
        let watched: Vec<(u64, libc::pollfd)> = self
            .lock_clients()?
            .iter()
            .filter(|client| !client.failed)
            .map(|client| {
                let mut fd = pollfd(client.stream.as_raw_fd());
                if client.is_backlogged() {
                    fd.events |= libc::POLLOUT;
                }
                (client.id, fd)
            })
            .collect();

        let mut fds = Vec::with_capacity(watched.len() + 2);
        fds.push(pollfd(self.listener.as_raw_fd()));
        fds.push(pollfd(self.wake_rx.as_raw_fd()));
        fds.extend(watched.iter().map(|(_, fd)| *fd));

        // SAFETY: `fds` is a live, correctly sized array of pollfd for the whole call.
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TIMEOUT_MS) };
        if ready < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err).context("poll");
        }

        if fds[1].revents != 0 {
            self.drain_wake();
        }
        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_all()?;
        }

        let mut clients = self.lock_clients()?;
        for ((id, _), fd) in watched.iter().zip(&fds[2..]) {
            if fd.revents == 0 {
                continue;
            }
            let Some(client) = clients.iter_mut().find(|client| client.id == *id) else {
                continue;
            };
            if fd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0
                || (fd.revents & libc::POLLIN != 0 && peer_closed(&client.stream))
            {
                client.fail();
                continue;
            }
            if fd.revents & libc::POLLOUT != 0 {
                if let Err(err) = client.flush() {
                    log::warn!("StreamServer: dropping client {} on {}: {}", id, self.label, err);
                    client.fail();
                }
            }
        }
        for client in clients.iter_mut().filter(|client| !client.failed) {
            if client.stalled(self.write_timeout) {
                log::warn!(
                    "StreamServer: dropping client {} on {}: no progress for {:?}",
                    client.id,
                    self.label,
                    self.write_timeout
                );
                client.fail();
            }
        }

        let before = clients.len();
        clients.retain(|client| !client.failed);
        if clients.len() != before {
            log::info!(
                "StreamServer: {} client(s) left {}, {} remaining",
                before - clients.len(),
                self.label,
                clients.len()
            );
        }
        Ok(())
    }

    fn accept_all(&self) -> Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(true)?;
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let mut clients = self.lock_clients()?;
                    clients.push(Client::new(id, stream));
                    log::info!(
                        "StreamServer: client {} connected to {} ({} total)",
                        id,
                        self.label,
                        clients.len()
                    );
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err).context("accept"),
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.wake_rx).read(&mut buf), Ok(n) if n > 0) {}
    }

    fn lock_clients(&self) -> Result<MutexGuard<'_, Vec<Client>>> {
        self.clients
            .lock()
            .map_err(|_| anyhow!("client list lock poisoned"))
    }
}

fn pollfd(fd: libc::c_int) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Subscribers never send; a readable client either hung up or sent junk we discard.
fn peer_closed(stream: &UnixStream) -> bool {
    let mut buf = [0u8; 256];
    // SAFETY: `buf` is valid for `buf.len()` bytes and the fd is owned by `stream`.
    let n = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            buf.as_mut_ptr().cast(),
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if n == 0 {
        return true;
    }
    if n < 0 {
        let err = std::io::Error::last_os_error();
        return !matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FanoutError;
    use std::time::Instant;

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn bind_replaces_stale_socket_and_stop_removes_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.sock");
        drop(UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let server = StreamServer::bind(&path).unwrap();
        server.start().unwrap();
        assert!(server.start().is_err());
        server.stop().unwrap();
        assert!(!path.exists());
        server.stop().unwrap();
    }

    #[test]
    fn refuses_to_replace_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.sock");
        std::fs::write(&path, b"not a socket").unwrap();
        assert!(StreamServer::bind(&path).is_err());
    }

    #[test]
    fn clients_receive_frames_and_are_removed_on_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cam.sock");
        let server = StreamServer::bind(&path).unwrap();
        server.start().unwrap();

        let mut first = UnixStream::connect(&path).unwrap();
        let second = UnixStream::connect(&path).unwrap();
        assert!(wait_for(|| server.client_count() == 2));

        assert_eq!(server.send_to_clients(b"\xFF\xD8frame\xFF\xD9").unwrap(), 2);
        let payload = wire::read_message(&mut first, wire::DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(payload, b"\xFF\xD8frame\xFF\xD9");

        drop(second);
        assert!(wait_for(|| server.client_count() == 1));
        assert_eq!(server.send_to_clients(b"next").unwrap(), 1);

        server.stop().unwrap();
        assert!(matches!(
            wire::read_message(&mut first, wire::DEFAULT_MAX_FRAME),
            Ok(ref bytes) if bytes == b"next"
        ));
        assert!(matches!(
            wire::read_message(&mut first, wire::DEFAULT_MAX_FRAME),
            Err(FanoutError::ConnectionClosed)
        ));
    }
}
