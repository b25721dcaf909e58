//! Asynchronous writer side of a connection.
//!
//! Messages are queued and written by a small pool of worker tasks so that a
//! slow peer never stalls the caller. With exactly one worker, frames reach
//! the stream in `send` order; with more, concurrently queued frames may be
//! written in either order.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::rpc::codec;
use crate::rpc::Message;

/// Type-erased outgoing byte stream.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Default number of write workers.
pub const DEFAULT_WORKERS: usize = 4;

/// A queued message and the channel its write outcome is reported on.
struct Outgoing {
    message: Message,
    done: oneshot::Sender<Result<(), Error>>,
}

enum State {
    Detached,
    Attached {
        queue: mpsc::UnboundedSender<Outgoing>,
        workers: Vec<JoinHandle<()>>,
    },
    Stopped,
}

/// Completion of a single `send`. Resolves once the frame has been written
/// and flushed, or with the write failure.
///
/// Dropping the handle does not cancel the write.
#[derive(Debug)]
pub struct WriteHandle {
    rx: oneshot::Receiver<Result<(), Error>>,
}

impl Future for WriteHandle {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // The worker dropped the message without writing it: the sender was stopped.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|outcome| outcome.unwrap_or_else(|_| Err(Error::Stopped)))
    }
}

/// Serializes and writes messages to the outgoing stream on a worker pool.
pub struct Sender {
    workers: usize,
    state: Mutex<State>,
}

impl std::fmt::Debug for Sender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.lock() {
            State::Detached => "detached",
            State::Attached { .. } => "attached",
            State::Stopped => "stopped",
        };
        f.debug_struct("Sender")
            .field("workers", &self.workers)
            .field("state", &state)
            .finish()
    }
}

impl Default for Sender {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

impl Sender {
    /// Creates a sender that will write with `workers` concurrent tasks
    /// (at least one).
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            state: Mutex::new(State::Detached),
        }
    }

    /// A sender that preserves `send` order on the wire.
    pub fn ordered() -> Self {
        Self::new(1)
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Binds the outgoing stream and starts the worker pool on the current
    /// tokio runtime.
    pub fn attach(&self, writer: BoxWriter) -> Result<(), Error> {
        let mut state = self.state.lock();
        match *state {
            State::Detached => {}
            State::Attached { .. } => return Err(Error::AlreadyAttached),
            State::Stopped => return Err(Error::Stopped),
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (queue, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let writer = Arc::new(tokio::sync::Mutex::new(writer));

        let workers = (0..self.workers)
            .map(|index| {
                runtime.spawn(write_worker(index, Arc::clone(&rx), Arc::clone(&writer)))
            })
            .collect();

        tracing::debug!(workers = self.workers, "Sender attached");
        *state = State::Attached { queue, workers };
        Ok(())
    }

    /// Queues `message` for writing and returns immediately.
    ///
    /// Fails with [`Error::NotAttached`] before `attach` or after `stop`.
    /// I/O failures are reported through the returned [`WriteHandle`].
    pub fn send(&self, message: Message) -> Result<WriteHandle, Error> {
        let state = self.state.lock();
        let State::Attached { queue, .. } = &*state else {
            return Err(Error::NotAttached);
        };

        let (done, rx) = oneshot::channel();
        queue
            .send(Outgoing { message, done })
            .map_err(|_| Error::Stopped)?;
        Ok(WriteHandle { rx })
    }

    /// Stops the worker pool. Queued, unwritten messages are dropped and
    /// their handles resolve to [`Error::Stopped`]. Not reusable.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        if let State::Attached { workers, .. } = previous {
            for worker in workers {
                worker.abort();
            }
            tracing::debug!("Sender stopped");
        }
    }
}

async fn write_worker(
    index: usize,
    queue: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Outgoing>>>,
    writer: Arc<tokio::sync::Mutex<BoxWriter>>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(Outgoing { message, done }) = next else {
            break;
        };

        let kind = message.kind();
        let result = {
            let mut writer = writer.lock().await;
            codec::write_message(&mut *writer, message).await
        };
        match &result {
            Ok(()) => tracing::trace!(worker = index, kind, "Frame written"),
            Err(e) => tracing::warn!(worker = index, kind, error = %e, "Failed to write frame"),
        }
        // The caller may have dropped its handle.
        let _ = done.send(result);
    }
    tracing::trace!(worker = index, "Write worker exiting");
}

#[cfg(test)]
mod tests {
    use rmpv::Value;
    use tokio::io::AsyncReadExt;

    use super::*;
    use crate::rpc::codec::FrameReader;
    use crate::rpc::Notification;

    fn note(n: i64) -> Message {
        Message::Notification(Notification::new("tick", vec![Value::from(n)]))
    }

    #[test]
    fn test_send_before_attach_fails() {
        let sender = Sender::default();
        assert!(matches!(sender.send(note(1)), Err(Error::NotAttached)));
    }

    #[test]
    fn test_attach_outside_runtime_fails() {
        let sender = Sender::default();
        let (w, _r) = tokio::io::duplex(64);
        assert!(matches!(sender.attach(Box::new(w)), Err(Error::NoRuntime)));
    }

    #[tokio::test]
    async fn test_single_worker_preserves_order() {
        let sender = Sender::ordered();
        let (w, r) = tokio::io::duplex(1024);
        sender.attach(Box::new(w)).unwrap();

        let handles: Vec<_> = (0..20).map(|n| sender.send(note(n)).unwrap()).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut reader = FrameReader::new(r);
        for n in 0..20 {
            let value = reader.next_value().await.unwrap().unwrap();
            assert_eq!(Message::from_value(value).unwrap(), note(n));
        }
    }

    #[tokio::test]
    async fn test_multi_worker_delivers_every_frame() {
        let sender = Sender::new(4);
        let (w, r) = tokio::io::duplex(64 * 1024);
        sender.attach(Box::new(w)).unwrap();

        let handles: Vec<_> = (0..50).map(|n| sender.send(note(n)).unwrap()).collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let mut reader = FrameReader::new(r);
        let mut seen = Vec::new();
        for _ in 0..50 {
            let value = reader.next_value().await.unwrap().unwrap();
            let Message::Notification(n) = Message::from_value(value).unwrap() else {
                panic!("expected notification");
            };
            seen.push(n.args[0].as_i64().unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_attach_twice_fails() {
        let sender = Sender::default();
        let (w1, _r1) = tokio::io::duplex(64);
        let (w2, _r2) = tokio::io::duplex(64);
        sender.attach(Box::new(w1)).unwrap();
        assert!(matches!(
            sender.attach(Box::new(w2)),
            Err(Error::AlreadyAttached)
        ));
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_through_handle() {
        let sender = Sender::ordered();
        let (w, r) = tokio::io::duplex(64);
        drop(r);
        sender.attach(Box::new(w)).unwrap();

        // Synchronous part succeeds; the broken pipe shows up asynchronously.
        let handle = sender.send(note(1)).unwrap();
        assert!(matches!(handle.await, Err(Error::Io(_))));
    }

    #[tokio::test]
    async fn test_send_after_stop_fails() {
        let sender = Sender::default();
        let (w, mut r) = tokio::io::duplex(64);
        sender.attach(Box::new(w)).unwrap();
        sender.stop();

        assert!(matches!(sender.send(note(1)), Err(Error::NotAttached)));
        assert!(matches!(
            sender.attach(Box::new(tokio::io::duplex(64).0)),
            Err(Error::Stopped)
        ));

        // Workers released the writer, so the reader sees end of stream.
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }
}
