//! Routing of inbound requests and notifications to named handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use rmpv::Value;
use tokio::sync::mpsc;

use crate::rpc::callbacks::Callback;
use crate::rpc::streamer::Streamer;
use crate::rpc::{Message, Notification, Request, Response, RpcError};

type RequestHandler =
    Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;
type NotificationHandler = Arc<dyn Fn(Vec<Value>) + Send + Sync>;
type NotificationQueue = mpsc::UnboundedSender<(NotificationHandler, Vec<Value>)>;

/// Method-name → handler table for traffic the peer initiates.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use nvim_rpc::rpc::{HandlerTable, RpcError, Streamer};
/// # use rmpv::Value;
/// # fn demo(streamer: &Arc<Streamer>) {
/// let installed = HandlerTable::new()
///     .on_request("ping", |_args| async { Ok::<_, RpcError>(Value::from("pong")) })
///     .on_notification("BufEnter", |args| println!("entered {args:?}"))
///     .install(streamer);
/// # }
/// ```
#[derive(Default, Clone)]
pub struct HandlerTable {
    requests: HashMap<String, RequestHandler>,
    notifications: HashMap<String, NotificationHandler>,
}

impl std::fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerTable")
            .field("requests", &self.requests.keys().collect::<Vec<_>>())
            .field("notifications", &self.notifications.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers requests for `method` with the value `handler` resolves to.
    /// Replaces any earlier handler for the same method.
    pub fn on_request<F, Fut>(mut self, method: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        self.requests
            .insert(method.into(), Arc::new(move |args| handler(args).boxed()));
        self
    }

    /// Calls `handler` for every notification named `name`.
    pub fn on_notification<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) + Send + Sync + 'static,
    {
        self.notifications.insert(name.into(), Arc::new(handler));
        self
    }

    /// Subscribes the table to `streamer`'s inbound traffic.
    ///
    /// Each request is handled on its own task. Notifications are handled
    /// one at a time, in arrival order, on a single task owned by this
    /// installation. Requests for a method with no handler are answered
    /// with an `Exception` error.
    pub fn install(self, streamer: &Arc<Streamer>) -> InstalledHandlers {
        let table = Arc::new(self);
        let (queue, rx) = mpsc::unbounded_channel();
        spawn(run_notifications(rx));

        let requests = {
            let table = Arc::clone(&table);
            let streamer = Arc::downgrade(streamer);
            Callback::new(move |request: &Request| {
                table.handle_request(&streamer, request.clone());
            })
        };
        let notifications = {
            let table = Arc::clone(&table);
            Callback::new(move |notification: &Notification| {
                table.handle_notification(&queue, notification.clone());
            })
        };

        streamer.add_request_callback(&requests);
        streamer.add_notification_callback(&notifications);
        tracing::debug!(
            requests = table.requests.len(),
            notifications = table.notifications.len(),
            "Installed handlers"
        );

        InstalledHandlers {
            streamer: Arc::downgrade(streamer),
            requests,
            notifications,
        }
    }

    fn handle_request(&self, streamer: &Weak<Streamer>, request: Request) {
        let Request { id, method, args } = request;
        let handler = self.requests.get(&method).cloned();
        let streamer = streamer.clone();

        spawn(async move {
            let response = match handler {
                Some(handler) => match handler(args).await {
                    Ok(result) => Response::ok(id, result),
                    Err(error) => Response::err(id, error),
                },
                None => {
                    tracing::debug!(msgid = id, %method, "No handler for request");
                    Response::err(id, RpcError::exception(format!("unknown method: {method}")))
                }
            };

            let Some(streamer) = streamer.upgrade() else {
                return;
            };
            match streamer.send(Message::Response(response)) {
                Ok(written) => {
                    if let Err(e) = written.await {
                        tracing::warn!(msgid = id, %method, error = %e, "Failed to send reply");
                    }
                }
                Err(e) => tracing::warn!(msgid = id, %method, error = %e, "Failed to send reply"),
            }
        });
    }

    fn handle_notification(&self, queue: &NotificationQueue, notification: Notification) {
        let Some(handler) = self.notifications.get(&notification.name).cloned() else {
            tracing::debug!(name = %notification.name, "Ignoring unhandled notification");
            return;
        };
        if queue.send((handler, notification.args)).is_err() {
            tracing::warn!(name = %notification.name, "Notification handler task is gone");
        }
    }
}

/// Runs queued notification handlers in order until the queue closes.
async fn run_notifications(mut rx: mpsc::UnboundedReceiver<(NotificationHandler, Vec<Value>)>) {
    while let Some((handler, args)) = rx.recv().await {
        handler(args);
    }
}

fn spawn(task: impl Future<Output = ()> + Send + 'static) {
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(task);
        }
        Err(_) => tracing::error!("No tokio runtime to run a handler on"),
    }
}

/// Keeps track of the callbacks a [`HandlerTable`] registered.
#[derive(Debug)]
pub struct InstalledHandlers {
    streamer: Weak<Streamer>,
    requests: Callback<Request>,
    notifications: Callback<Notification>,
}

impl InstalledHandlers {
    /// Stops routing traffic to the table. Handlers already running finish.
    pub fn uninstall(self) {
        if let Some(streamer) = self.streamer.upgrade() {
            streamer.remove_request_callback(&self.requests);
            streamer.remove_notification_callback(&self.notifications);
        }
    }
}
