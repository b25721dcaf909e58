//! Request/response/notification orchestration over one connection.

use std::sync::Arc;

use parking_lot::Mutex;
use rmpv::Value;

use crate::connection::Connection;
use crate::error::Error;
use crate::rpc::callbacks::{Callback, CallbackRegistry};
use crate::rpc::id::MessageIdGenerator;
use crate::rpc::listener::{Listener, ListenerTask};
use crate::rpc::sender::{Sender, WriteHandle};
use crate::rpc::{Message, Notification, Request, RequestBuilder, Response};

/// Lifecycle of a [`Streamer`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamerState {
    Unattached,
    Attached,
    Stopped,
}

/// Combines a [`Sender`], a [`Listener`] and a [`MessageIdGenerator`]
/// behind one API.
///
/// Inbound requests and notifications are rebroadcast from the listener to
/// the streamer's own subscriber lists, so any number of independent
/// consumers can attach with [`add_request_callback`](Self::add_request_callback)
/// and [`add_notification_callback`](Self::add_notification_callback).
pub struct Streamer {
    ids: MessageIdGenerator,
    sender: Sender,
    listener: Listener,
    state: Mutex<StreamerState>,
    requests: Arc<CallbackRegistry<Request>>,
    notifications: Arc<CallbackRegistry<Notification>>,
    /// Rebroadcast hooks installed on the listener. Built once so a retried
    /// attach registers the same instances again, which is a no-op.
    request_fan_out: Callback<Request>,
    notification_fan_out: Callback<Notification>,
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new(Sender::default(), Listener::new(), MessageIdGenerator::new())
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("state", &self.state())
            .field("sender", &self.sender)
            .field("listener", &self.listener)
            .finish()
    }
}

impl Streamer {
    pub fn new(sender: Sender, listener: Listener, ids: MessageIdGenerator) -> Self {
        let requests = Arc::new(CallbackRegistry::<Request>::new());
        let notifications = Arc::new(CallbackRegistry::<Notification>::new());

        let request_fan_out = {
            let requests = Arc::clone(&requests);
            Callback::new(move |req: &Request| {
                requests.broadcast(req);
            })
        };
        let notification_fan_out = {
            let notifications = Arc::clone(&notifications);
            Callback::new(move |note: &Notification| {
                notifications.broadcast(note);
            })
        };

        Self {
            ids,
            sender,
            listener,
            state: Mutex::new(StreamerState::Unattached),
            requests,
            notifications,
            request_fan_out,
            notification_fan_out,
        }
    }

    pub fn state(&self) -> StreamerState {
        *self.state.lock()
    }

    /// Starts reading from and binds writing to `connection`.
    ///
    /// The returned task resolves when the read loop ends; a fatal codec or
    /// I/O error is its output.
    pub fn attach(&self, connection: &mut dyn Connection) -> Result<ListenerTask, Error> {
        let mut state = self.state.lock();
        match *state {
            StreamerState::Unattached => {}
            StreamerState::Attached => return Err(Error::AlreadyAttached),
            StreamerState::Stopped => return Err(Error::Stopped),
        }

        // Checked before the streams are taken so a failed attach leaves the
        // connection usable.
        tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let reader = connection.incoming_stream()?;
        let writer = connection.outgoing_stream()?;

        self.listener.listen_for_requests(&self.request_fan_out);
        self.listener
            .listen_for_notifications(&self.notification_fan_out);

        self.sender.attach(writer)?;
        let task = self.listener.start(reader)?;

        *state = StreamerState::Attached;
        tracing::info!(workers = self.sender.workers(), "Streamer attached");
        Ok(task)
    }

    /// Sends a fully formed message (typically a [`Response`] to an inbound
    /// request, or a [`Notification`]).
    pub fn send(&self, message: Message) -> Result<WriteHandle, Error> {
        self.ensure_attached()?;
        tracing::debug!(kind = message.kind(), "Sending message");
        self.sender.send(message)
    }

    /// Sends a request whose response nobody waits for. Returns the assigned id.
    pub fn send_request(&self, request: RequestBuilder) -> Result<(u64, WriteHandle), Error> {
        self.ensure_attached()?;
        let id = self.ids.next_id();
        self.write_request(request.build(id))
            .map(|written| (id, written))
    }

    /// Sends a request and registers `callback` for its response.
    ///
    /// The callback is registered before the frame is queued, so even an
    /// immediate reply finds it. Returns the assigned id.
    pub fn send_request_with<F>(
        &self,
        request: RequestBuilder,
        callback: F,
    ) -> Result<(u64, WriteHandle), Error>
    where
        F: FnOnce(Result<Response, Error>) + Send + 'static,
    {
        self.ensure_attached()?;
        let id = self.ids.next_id();
        self.listener.listen_for_response(id, Box::new(callback));

        match self.write_request(request.build(id)) {
            Ok(written) => Ok((id, written)),
            Err(e) => {
                self.listener.forget_response(id);
                Err(e)
            }
        }
    }

    /// Sends a notification.
    pub fn notify(&self, name: impl Into<String>, args: Vec<Value>) -> Result<WriteHandle, Error> {
        self.send(Message::Notification(Notification::new(name, args)))
    }

    pub fn add_request_callback(&self, callback: &Callback<Request>) -> bool {
        self.requests.add(callback)
    }

    pub fn remove_request_callback(&self, callback: &Callback<Request>) -> bool {
        self.requests.remove(callback)
    }

    pub fn add_notification_callback(&self, callback: &Callback<Notification>) -> bool {
        self.notifications.add(callback)
    }

    pub fn remove_notification_callback(&self, callback: &Callback<Notification>) -> bool {
        self.notifications.remove(callback)
    }

    /// Discards the response callback for `id`. A response that arrives later
    /// is logged and dropped. Returns `false` if nothing was waiting.
    pub fn cancel_response(&self, id: u64) -> bool {
        self.listener.forget_response(id)
    }

    /// Number of sent requests still waiting for a response.
    pub fn pending_responses(&self) -> usize {
        self.listener.pending_count()
    }

    /// Stops the listener and the sender. Terminal.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), StreamerState::Stopped);
        self.listener.stop();
        self.sender.stop();
        if previous == StreamerState::Attached {
            tracing::info!("Streamer stopped");
        }
    }

    fn ensure_attached(&self) -> Result<(), Error> {
        match self.state() {
            StreamerState::Attached => Ok(()),
            StreamerState::Unattached | StreamerState::Stopped => Err(Error::NotAttached),
        }
    }

    fn write_request(&self, request: Request) -> Result<WriteHandle, Error> {
        tracing::debug!(msgid = request.id, method = %request.method, "Sending request");
        self.sender.send(Message::Request(request))
    }
}
