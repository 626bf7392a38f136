//! Bounded, queue-backed frame consumers.
//!
//! A `HandlerThread` owns one `FrameHandler` and the queue feeding it. The producer side
//! (`push`) never blocks: when the queue is full the new frame is dropped and counted.
//! The worker pops with a short timeout, runs the handler, and logs anything the handler
//! returns or panics with without leaving the loop.

use anyhow::{anyhow, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::frame::{Frame, StageTimer};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Processing hook run on a consumer's own thread.
pub trait FrameHandler: Send + 'static {
    /// Short name for logs and thread names.
    fn name(&self) -> &str;

    /// Process one frame. Errors are logged by the worker, never propagated.
    fn process(&mut self, frame: Frame, timer: &mut StageTimer) -> Result<()>;

    /// Runs on the caller's thread before the worker starts.
    fn on_start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Runs on the worker thread after the queue is drained (or abandoned).
    fn on_stop(&mut self) {}
}

enum QueueSender {
    Bounded(SyncSender<Frame>),
    Unbounded(Sender<Frame>),
}

/// Shared counters for one consumer.
#[derive(Debug, Default)]
pub struct HandlerStats {
    pub processed: AtomicU64,
    pub dropped: AtomicU64,
    pub failed: AtomicU64,
}

/// A frame consumer running on its own thread behind a bounded queue.
pub struct HandlerThread {
    name: String,
    sender: Option<QueueSender>,
    pending: Option<(Box<dyn FrameHandler>, Receiver<Frame>)>,
    running: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    stats: Arc<HandlerStats>,
    join: Option<JoinHandle<()>>,
}

impl HandlerThread {
    /// Wrap `handler` behind a queue of `capacity` frames; 0 means unbounded.
    pub fn new<H: FrameHandler>(handler: H, capacity: usize) -> Self {
        let name = handler.name().to_string();
        let (sender, receiver) = if capacity == 0 {
            let (tx, rx) = mpsc::channel();
            (QueueSender::Unbounded(tx), rx)
        } else {
            let (tx, rx) = mpsc::sync_channel(capacity);
            (QueueSender::Bounded(tx), rx)
        };
        Self {
            name,
            sender: Some(sender),
            pending: Some((Box::new(handler), receiver)),
            running: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(HandlerStats::default()),
            join: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> Arc<HandlerStats> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run the handler's `on_start` hook and spawn the worker.
    pub fn start(&mut self) -> Result<()> {
        let (mut handler, receiver) = self
            .pending
            .take()
            .ok_or_else(|| anyhow!("handler {} already started", self.name))?;
        handler.on_start()?;

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let abort = self.abort.clone();
        let stats = self.stats.clone();
        let name = self.name.clone();
        let join = std::thread::Builder::new()
            .name(format!("handler-{}", self.name))
            .spawn(move || {
                log::debug!("FrameHandler[{}]: starting the thread", name);
                run_worker(handler.as_mut(), &receiver, &running, &abort, &stats, &name);
                handler.on_stop();
                log::debug!("FrameHandler[{}]: thread stopped", name);
            })?;
        self.join = Some(join);
        Ok(())
    }

    /// Queue a frame without blocking. Returns false when the frame was dropped.
    pub fn push(&self, frame: Frame) -> bool {
        let result = match &self.sender {
            Some(QueueSender::Bounded(tx)) => tx.try_send(frame).map_err(|err| match err {
                TrySendError::Full(_) => false,
                TrySendError::Disconnected(_) => true,
            }),
            Some(QueueSender::Unbounded(tx)) => tx.send(frame).map_err(|_| true),
            None => Err(true),
        };
        match result {
            Ok(()) => true,
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Stop accepting frames, process the backlog, and join the worker.
    pub fn stop(&mut self) -> Result<()> {
        log::debug!("FrameHandler[{}]: stopping the thread", self.name);
        self.running.store(false, Ordering::SeqCst);
        // Closing the queue lets the worker drain what is left and then see it disconnected.
        self.sender = None;
        self.join_worker()
    }

    /// Stop without processing the backlog. Queued frames are discarded and counted as dropped.
    pub fn abort(&mut self) -> Result<()> {
        self.abort.store(true, Ordering::SeqCst);
        self.stop()
    }

    fn join_worker(&mut self) -> Result<()> {
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("handler {} thread panicked", self.name))?;
        }
        Ok(())
    }
}

impl Drop for HandlerThread {
    fn drop(&mut self) {
        if self.join.is_some() {
            let _ = self.stop();
        }
    }
}

fn run_worker(
    handler: &mut dyn FrameHandler,
    receiver: &Receiver<Frame>,
    running: &AtomicBool,
    abort: &AtomicBool,
    stats: &HandlerStats,
    name: &str,
) {
    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(frame) => {
                if abort.load(Ordering::SeqCst) {
                    stats.dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let mut timer = StageTimer::start();
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.process(frame, &mut timer)));
                match outcome {
                    Ok(Ok(())) => {
                        stats.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(Err(err)) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!("FrameHandler[{}]: uncaught error: {:#}", name, err);
                    }
                    Err(_) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        log::error!("FrameHandler[{}]: handler panicked", name);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::sync::{Condvar, Mutex};

    /// Blocks in `process` until the gate opens, recording every sequence it sees.
    struct GatedHandler {
        gate: Arc<(Mutex<bool>, Condvar)>,
        seen: Arc<Mutex<Vec<u64>>>,
        fail_on: Option<u64>,
    }

    impl FrameHandler for GatedHandler {
        fn name(&self) -> &str {
            "gated"
        }

        fn process(&mut self, frame: Frame, _timer: &mut StageTimer) -> Result<()> {
            {
                let (lock, cvar) = &*self.gate;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cvar.wait(open).unwrap();
                }
            }
            self.seen.lock().unwrap().push(frame.sequence);
            if Some(frame.sequence) == self.fail_on {
                anyhow::bail!("frame {} is cursed", frame.sequence);
            }
            if frame.sequence == 99 {
                panic!("boom");
            }
            Ok(())
        }
    }

    fn frame(sequence: u64) -> Frame {
        Frame::new(RgbImage::new(2, 2), sequence)
    }

    fn gated(fail_on: Option<u64>) -> (GatedHandler, Arc<(Mutex<bool>, Condvar)>, Arc<Mutex<Vec<u64>>>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = GatedHandler {
            gate: gate.clone(),
            seen: seen.clone(),
            fail_on,
        };
        (handler, gate, seen)
    }

    fn open_gate(gate: &(Mutex<bool>, Condvar)) {
        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
    }

    #[test]
    fn full_queue_drops_new_frames_without_blocking() {
        let (handler, gate, seen) = gated(None);
        let mut thread = HandlerThread::new(handler, 2);
        thread.start().unwrap();

        // Frame 1 is taken by the worker and blocks on the gate.
        assert!(thread.push(frame(1)));
        std::thread::sleep(Duration::from_millis(200));

        assert!(thread.push(frame(2)));
        assert!(thread.push(frame(3)));
        assert!(!thread.push(frame(4)));
        assert!(!thread.push(frame(5)));
        assert_eq!(thread.stats().dropped.load(Ordering::Relaxed), 2);

        open_gate(&gate);
        thread.stop().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn stop_drains_backlog() {
        let (handler, gate, seen) = gated(None);
        let mut thread = HandlerThread::new(handler, 0);
        thread.start().unwrap();
        for sequence in 1..=20 {
            assert!(thread.push(frame(sequence)));
        }
        open_gate(&gate);
        thread.stop().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 20);
        assert_eq!(thread.stats().processed.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn errors_and_panics_do_not_stop_the_worker() {
        let (handler, gate, seen) = gated(Some(2));
        open_gate(&gate);
        let mut thread = HandlerThread::new(handler, 0);
        thread.start().unwrap();
        for sequence in [1, 2, 99, 3] {
            thread.push(frame(sequence));
        }
        thread.stop().unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 99, 3]);
        assert_eq!(thread.stats().failed.load(Ordering::Relaxed), 2);
        assert_eq!(thread.stats().processed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn abort_discards_backlog() {
        let (handler, gate, seen) = gated(None);
        let mut thread = HandlerThread::new(handler, 0);
        thread.start().unwrap();
        for sequence in 1..=5 {
            thread.push(frame(sequence));
        }
        std::thread::sleep(Duration::from_millis(100));
        thread.abort.store(true, Ordering::SeqCst);
        open_gate(&gate);
        thread.abort().unwrap();
        // Only the frame already in `process` when abort was raised completes.
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(thread.stats().dropped.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn push_after_stop_is_dropped() {
        let (handler, gate, _seen) = gated(None);
        open_gate(&gate);
        let mut thread = HandlerThread::new(handler, 1);
        thread.start().unwrap();
        thread.stop().unwrap();
        assert!(!thread.push(frame(1)));
        assert!(thread.start().is_err());
    }
}
