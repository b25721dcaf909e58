//! Neovim client built on the msgpack-rpc core.
//!
//! Wires a [`MessageIdGenerator`], [`Sender`] and [`Listener`] into a
//! [`Streamer`], wraps it in a [`ReactiveStreamer`], and adds a few Neovim
//! conveniences on top.

use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use rmpv::Value;

use crate::connection::{Address, Connection};
use crate::error::{Error, Result};
use crate::rpc::handler::{HandlerTable, InstalledHandlers};
use crate::rpc::sender::DEFAULT_WORKERS;
use crate::rpc::{
    Listener, ListenerTask, MessageIdGenerator, Notification, ReactiveStreamer, Request,
    RequestBuilder, Sender, Streamer, WriteHandle,
};

/// Construction options for [`Client`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Write workers. `1` keeps requests in call order on the wire.
    pub sender_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            sender_workers: DEFAULT_WORKERS,
        }
    }
}

/// Neovim client for RPC communication.
pub struct Client {
    reactive: ReactiveStreamer,
    connection: Mutex<Option<Box<dyn Connection>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("streamer", self.reactive.streamer())
            .field("owns_connection", &self.connection.lock().is_some())
            .finish()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new(ClientConfig::default())
    }
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let streamer = Streamer::new(
            Sender::new(config.sender_workers),
            Listener::new(),
            MessageIdGenerator::new(),
        );
        Self {
            reactive: ReactiveStreamer::new(Arc::new(streamer)),
            connection: Mutex::new(None),
        }
    }

    /// Attaches to a connection the caller keeps ownership of.
    pub fn attach(&self, connection: &mut dyn Connection) -> Result<ListenerTask> {
        self.reactive.attach(connection)
    }

    /// Attaches to `connection` and keeps it alive until [`close`](Self::close).
    pub fn attach_owned(&self, mut connection: Box<dyn Connection>) -> Result<ListenerTask> {
        let task = self.reactive.attach(connection.as_mut())?;
        *self.connection.lock() = Some(connection);
        Ok(task)
    }

    /// Connects to `address` and attaches to it.
    pub async fn connect(&self, address: &Address) -> Result<ListenerTask> {
        tracing::debug!(%address, "Connecting to Neovim");
        let connection = address.connect().await?;
        let task = self.attach_owned(connection)?;
        tracing::info!(%address, "Connected to Neovim");
        Ok(task)
    }

    /// Try to find and connect to a running Neovim: `$NVIM`, then
    /// `.nvim/nvim.sock` in the current directory.
    pub async fn try_connect(&self) -> Option<ListenerTask> {
        let Some(address) = Address::discover() else {
            tracing::debug!("No Neovim address found");
            return None;
        };
        match self.connect(&address).await {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::warn!(%address, error = %e, "Failed to connect to Neovim");
                None
            }
        }
    }

    /// Make an RPC call and wait for its result.
    ///
    /// An error reported by Neovim is returned as [`Error::Rpc`].
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let request = RequestBuilder::new(method).args(args);
        let response = self.reactive.response(request).await?;
        Ok(response.result)
    }

    /// Send a notification without waiting for anything but the write.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> Result<WriteHandle> {
        self.reactive.streamer().notify(method, args)
    }

    /// Execute Lua code in Neovim and return the result.
    pub async fn exec_lua(&self, code: &str, args: Vec<Value>) -> Result<Value> {
        self.call(
            "nvim_exec_lua",
            vec![Value::from(code), Value::Array(args)],
        )
        .await
    }

    /// Execute a Vim command.
    pub async fn command(&self, cmd: &str) -> Result<()> {
        self.call("nvim_command", vec![Value::from(cmd)]).await?;
        Ok(())
    }

    /// Ask Neovim to broadcast `event` notifications to this client.
    pub async fn subscribe(&self, event: &str) -> Result<()> {
        self.call("nvim_subscribe", vec![Value::from(event)]).await?;
        Ok(())
    }

    pub async fn unsubscribe(&self, event: &str) -> Result<()> {
        self.call("nvim_unsubscribe", vec![Value::from(event)]).await?;
        Ok(())
    }

    /// Requests Neovim sends to this client, from now on.
    pub fn requests(&self) -> impl Stream<Item = Request> + Send + 'static {
        self.reactive.requests_flow()
    }

    /// Notifications Neovim sends to this client, from now on.
    pub fn notifications(&self) -> impl Stream<Item = Notification> + Send + 'static {
        self.reactive.notifications_flow()
    }

    /// Routes inbound requests and notifications to `handlers`.
    pub fn install(&self, handlers: HandlerTable) -> InstalledHandlers {
        handlers.install(self.reactive.streamer())
    }

    pub fn streamer(&self) -> &Arc<Streamer> {
        self.reactive.streamer()
    }

    pub fn reactive(&self) -> &ReactiveStreamer {
        &self.reactive
    }

    /// Stops reading and writing. Pending calls fail.
    pub fn stop(&self) {
        self.reactive.streamer().stop();
    }

    /// Stops the client and closes the connection it owns, if any.
    pub async fn close(&self) -> Result<()> {
        self.stop();
        let connection = self.connection.lock().take();
        if let Some(mut connection) = connection {
            connection.close().await.map_err(Error::from)?;
            tracing::debug!("Connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::connection::StreamConnection;
    use crate::rpc::codec::{self, FrameReader};
    use crate::rpc::{ErrorKind, Message, Response, RpcError};

    /// Client attached to an in-memory peer.
    fn attached() -> (Client, DuplexStream) {
        let client = Client::new(ClientConfig { sender_workers: 1 });
        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        client
            .attach_owned(Box::new(StreamConnection::new(r, w)))
            .unwrap();
        (client, peer)
    }

    /// Answers exactly one request with `reply(request)` and returns it.
    async fn answer_one(
        peer: DuplexStream,
        reply: impl FnOnce(&Request) -> Response,
    ) -> Request {
        let (r, mut w) = tokio::io::split(peer);
        let mut frames = FrameReader::new(r);
        let value = frames.next_value().await.unwrap().unwrap();
        let Message::Request(request) = Message::from_value(value).unwrap() else {
            panic!("expected request");
        };
        let frame = codec::encode(reply(&request).into()).unwrap();
        w.write_all(&frame).await.unwrap();
        request
    }

    #[test]
    fn test_default_config() {
        assert_eq!(ClientConfig::default().sender_workers, DEFAULT_WORKERS);
    }

    #[tokio::test]
    async fn test_call_returns_result() {
        let (client, peer) = attached();
        let peer = tokio::spawn(answer_one(peer, |req| {
            Response::ok(req.id, Value::from(42))
        }));

        let result = client.call("nvim_eval", vec![Value::from("6*7")]).await.unwrap();
        assert_eq!(result, Value::from(42));

        let request = peer.await.unwrap();
        assert_eq!(request.method, "nvim_eval");
        assert_eq!(request.args, vec![Value::from("6*7")]);
    }

    #[tokio::test]
    async fn test_exec_lua_wraps_arguments() {
        let (client, peer) = attached();
        let peer = tokio::spawn(answer_one(peer, |req| Response::ok(req.id, Value::Nil)));

        client
            .exec_lua("return ...", vec![Value::from(1)])
            .await
            .unwrap();

        let request = peer.await.unwrap();
        assert_eq!(request.method, "nvim_exec_lua");
        assert_eq!(
            request.args,
            vec![Value::from("return ..."), Value::Array(vec![Value::from(1)])]
        );
    }

    #[tokio::test]
    async fn test_command_error_surfaces() {
        let (client, peer) = attached();
        let peer = tokio::spawn(answer_one(peer, |req| {
            Response::err(req.id, RpcError::exception("E492: Not an editor command"))
        }));

        let err = client.command("Nonsense").await.unwrap_err();
        let rpc = err.as_rpc().expect("peer error");
        assert_eq!(rpc.kind, ErrorKind::Exception);
        assert!(rpc.message.starts_with("E492"));
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifications_flow() {
        let (client, mut peer) = attached();
        let mut notes = Box::pin(client.notifications());

        let frame =
            codec::encode(Notification::new("redraw", vec![Value::from(1)]).into()).unwrap();
        peer.write_all(&frame).await.unwrap();

        let note = notes.next().await.unwrap();
        assert_eq!(note.name, "redraw");
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (client, _peer) = attached();
        let call = client.reactive().response(RequestBuilder::new("nvim_eval"));
        client.close().await.unwrap();

        assert!(call.await.is_err());
        assert!(matches!(
            client.call("nvim_eval", vec![]).await,
            Err(Error::NotAttached)
        ));
    }
}
