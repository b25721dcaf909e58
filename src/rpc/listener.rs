//! Reader side of a connection: the background read loop and dispatch.
//!
//! Exactly one task reads frames, classifies them by type tag and hands
//! them out:
//!
//! - requests and notifications are broadcast to every standing callback
//! - responses go to the one-shot callback registered for their id, which is
//!   removed on delivery; responses for unknown ids are dropped
//!
//! Malformed envelopes are logged and skipped. A payload that fails to
//! decode, or a read error, ends the loop; the error is the task's output.
//!
//! Callbacks run inline on the read task and must not block.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::Error;
use crate::rpc::callbacks::{Callback, CallbackRegistry};
use crate::rpc::codec::FrameReader;
use crate::rpc::{Message, Notification, Request, Response};

/// Type-erased incoming byte stream.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;

/// One-shot callback for the response to a single request.
///
/// Receives `Err(Error::ConnectionClosed)` if the read loop ends (end of
/// stream or fatal error) before the response arrives. Dropped without being
/// called if the listener is stopped.
pub type ResponseCallback = Box<dyn FnOnce(Result<Response, Error>) + Send>;

/// Handle to the background read loop. Resolves to `Ok(())` on end of
/// stream or `stop()`, or to the fatal error that ended the loop.
pub type ListenerTask = JoinHandle<Result<(), Error>>;

/// Why the pending table no longer accepts registrations.
#[derive(Debug, Clone)]
enum Closed {
    Stopped,
    Ended(String),
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<u64, ResponseCallback>,
    closed: Option<Closed>,
}

/// State shared between the `Listener` handle and its read task.
#[derive(Default)]
struct Shared {
    pending: Mutex<PendingTable>,
    requests: CallbackRegistry<Request>,
    notifications: CallbackRegistry<Notification>,
    stopped: AtomicBool,
}

enum State {
    Idle,
    Running { shutdown: watch::Sender<bool> },
    Stopped,
}

/// Owns the read loop and the callback tables it dispatches to.
pub struct Listener {
    shared: Arc<Shared>,
    state: Mutex<State>,
}

impl Default for Listener {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("pending", &self.pending_count())
            .field("requests", &self.shared.requests.len())
            .field("notifications", &self.shared.notifications.len())
            .finish()
    }
}

impl Listener {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            state: Mutex::new(State::Idle),
        }
    }

    /// Spawns the read loop over `reader` on the current tokio runtime.
    pub fn start(&self, reader: BoxReader) -> Result<ListenerTask, Error> {
        let mut state = self.state.lock();
        match *state {
            State::Idle => {}
            State::Running { .. } => return Err(Error::AlreadyAttached),
            State::Stopped => return Err(Error::Stopped),
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = runtime.spawn(read_loop(
            Arc::clone(&self.shared),
            FrameReader::new(reader),
            shutdown_rx,
        ));

        *state = State::Running { shutdown };
        Ok(task)
    }

    /// Cancels the read loop. No callback is invoked afterwards, pending
    /// response callbacks are dropped, and the listener cannot be restarted.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *self.state.lock(), State::Stopped);
        if let State::Running { shutdown } = previous {
            let _ = shutdown.send(true);
            tracing::debug!("Listener stopped");
        }
        self.shared.close(Closed::Stopped);
    }

    /// Registers a one-shot callback for the response with `id`.
    ///
    /// If the read loop has already ended, the callback is failed
    /// immediately (or dropped, after `stop()`).
    pub fn listen_for_response(&self, id: u64, callback: ResponseCallback) {
        let mut pending = self.shared.pending.lock();
        match pending.closed.clone() {
            None => {
                if pending.entries.insert(id, callback).is_some() {
                    tracing::warn!(msgid = id, "Replaced an existing response callback");
                }
            }
            Some(Closed::Stopped) => {}
            Some(Closed::Ended(reason)) => {
                drop(pending);
                callback(Err(Error::closed(reason)));
            }
        }
    }

    /// Removes the response callback for `id` without invoking it.
    pub fn forget_response(&self, id: u64) -> bool {
        self.shared.pending.lock().entries.remove(&id).is_some()
    }

    /// Registers a standing callback for every inbound notification.
    pub fn listen_for_notifications(&self, callback: &Callback<Notification>) -> bool {
        self.shared.notifications.add(callback)
    }

    /// Registers a standing callback for every inbound request.
    pub fn listen_for_requests(&self, callback: &Callback<Request>) -> bool {
        self.shared.requests.add(callback)
    }

    pub fn remove_notification_listener(&self, callback: &Callback<Notification>) -> bool {
        self.shared.notifications.remove(callback)
    }

    pub fn remove_request_listener(&self, callback: &Callback<Request>) -> bool {
        self.shared.requests.remove(callback)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().entries.len()
    }
}

impl Shared {
    /// Routes one decoded value. Only codec failures are returned; malformed
    /// envelopes are skipped.
    fn dispatch(&self, value: Value) -> Result<(), Error> {
        let message = match Message::from_value(value) {
            Ok(message) => message,
            Err(Error::MalformedFrame(reason)) => {
                tracing::warn!(%reason, "Skipping malformed frame");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        match message {
            Message::Request(req) => {
                tracing::debug!(msgid = req.id, method = %req.method, "Received request");
                self.requests.broadcast(&req);
            }
            Message::Notification(note) => {
                tracing::debug!(name = %note.name, "Received notification");
                self.notifications.broadcast(&note);
            }
            Message::Response(resp) => {
                let callback = self.pending.lock().entries.remove(&resp.id);
                match callback {
                    Some(callback) => {
                        tracing::debug!(msgid = resp.id, error = resp.error.is_some(), "Received response");
                        callback(Ok(resp));
                    }
                    None => {
                        tracing::warn!(msgid = resp.id, "Dropping response for unknown id");
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops accepting registrations and settles every pending callback:
    /// failed with the reason if the loop ended, dropped if stopped.
    fn close(&self, why: Closed) {
        let drained: Vec<ResponseCallback> = {
            let mut pending = self.pending.lock();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(why.clone());
            pending.entries.drain().map(|(_, cb)| cb).collect()
        };

        if let Closed::Ended(reason) = why {
            if !drained.is_empty() {
                tracing::debug!(count = drained.len(), %reason, "Failing pending requests");
            }
            for callback in drained {
                callback(Err(Error::closed(reason.clone())));
            }
        }
    }
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut frames: FrameReader<R>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error>
where
    R: AsyncRead + Unpin,
{
    tracing::debug!("Listener read loop started");

    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = shutdown.changed() => break Ok(None),
            next = frames.next_value() => next,
        };

        match next {
            Ok(Some(value)) => {
                if let Err(e) = shared.dispatch(value) {
                    break Err(e);
                }
            }
            Ok(None) => break Ok(Some("end of stream".to_string())),
            Err(e) => break Err(e),
        }
    };

    match outcome {
        Ok(None) => {
            shared.close(Closed::Stopped);
            Ok(())
        }
        Ok(Some(reason)) => {
            tracing::info!("Connection reached end of stream");
            shared.close(Closed::Ended(reason));
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Listener read loop failed");
            shared.close(Closed::Ended(e.to_string()));
            Err(e)
        }
    }
}
