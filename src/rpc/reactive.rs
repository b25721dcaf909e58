//! Future and stream adapters over [`Streamer`].
//!
//! Uses only the streamer's public surface. Response futures are resolved
//! straight from the listener's dispatch; nothing blocks a worker while a
//! request is in flight.

use std::future::Future;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::connection::Connection;
use crate::error::Error;
use crate::rpc::callbacks::Callback;
use crate::rpc::listener::ListenerTask;
use crate::rpc::streamer::Streamer;
use crate::rpc::{Notification, Request, RequestBuilder, Response};

/// Reason reported when a response callback is dropped without being called.
const LISTENER_STOPPED: &str = "listener stopped";

type Register<T> = fn(&Streamer, &Callback<T>) -> bool;

/// Wraps a [`Streamer`] with a future per request and publish streams for
/// inbound traffic.
#[derive(Debug, Clone)]
pub struct ReactiveStreamer {
    streamer: Arc<Streamer>,
}

impl ReactiveStreamer {
    pub fn new(streamer: Arc<Streamer>) -> Self {
        Self { streamer }
    }

    pub fn streamer(&self) -> &Arc<Streamer> {
        &self.streamer
    }

    pub fn attach(&self, connection: &mut dyn Connection) -> Result<ListenerTask, Error> {
        self.streamer.attach(connection)
    }

    /// Sends `request` now and returns a future for its response.
    ///
    /// The request is written whether or not the future is polled. A response
    /// carrying an error resolves as [`Error::Rpc`]. Dropping the future
    /// unregisters the pending callback.
    pub fn response(
        &self,
        request: RequestBuilder,
    ) -> impl Future<Output = Result<Response, Error>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .streamer
            .send_request_with(request, move |outcome| {
                // The caller may have stopped waiting.
                let _ = tx.send(outcome);
            })
            .map(|(id, written)| {
                let pending = Pending {
                    streamer: Arc::clone(&self.streamer),
                    id,
                    armed: true,
                };
                (pending, written)
            });

        async move {
            let (mut pending, written) = sent?;

            if let Err(e) = written.await {
                tracing::debug!(msgid = pending.id, error = %e, "Request was not written");
                return Err(e);
            }

            let outcome = rx.await;
            pending.armed = false;
            let response = outcome.unwrap_or_else(|_| Err(Error::closed(LISTENER_STOPPED)))?;
            match response.error {
                Some(error) => Err(Error::Rpc(error)),
                None => Ok(response),
            }
        }
    }

    /// Every inbound request received after the stream is created.
    ///
    /// Each subscriber buffers independently, so a slow consumer never holds
    /// up the read loop or other subscribers. The stream only ends when
    /// dropped.
    pub fn requests_flow(&self) -> impl Stream<Item = Request> + Send + 'static {
        publish(
            Arc::clone(&self.streamer),
            Streamer::add_request_callback,
            Streamer::remove_request_callback,
        )
    }

    /// Every inbound notification received after the stream is created.
    pub fn notifications_flow(&self) -> impl Stream<Item = Notification> + Send + 'static {
        publish(
            Arc::clone(&self.streamer),
            Streamer::add_notification_callback,
            Streamer::remove_notification_callback,
        )
    }
}

/// Unregisters an in-flight response callback when its future is dropped
/// early.
struct Pending {
    streamer: Arc<Streamer>,
    id: u64,
    armed: bool,
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.armed && self.streamer.cancel_response(self.id) {
            tracing::debug!(msgid = self.id, "Response future dropped before completion");
        }
    }
}

/// Removes a publisher's callback when its stream is dropped.
struct Subscription<T> {
    streamer: Arc<Streamer>,
    callback: Callback<T>,
    remove: Register<T>,
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        (self.remove)(&self.streamer, &self.callback);
    }
}

fn publish<T>(
    streamer: Arc<Streamer>,
    add: Register<T>,
    remove: Register<T>,
) -> impl Stream<Item = T> + Send + 'static
where
    T: Clone + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let callback = Callback::new(move |message: &T| {
        let _ = tx.send(message.clone());
    });
    add(&streamer, &callback);
    let subscription = Subscription {
        streamer,
        callback,
        remove,
    };

    async_stream::stream! {
        let _subscription = subscription;
        while let Some(message) = rx.recv().await {
            yield message;
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;
    use rmpv::Value;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    use super::*;
    use crate::connection::StreamConnection;
    use crate::rpc::codec::{self, FrameReader};
    use crate::rpc::{ErrorKind, Listener, Message, MessageIdGenerator, RpcError, Sender};

    fn attached() -> (ReactiveStreamer, DuplexStream) {
        let streamer = Arc::new(Streamer::new(
            Sender::ordered(),
            Listener::new(),
            MessageIdGenerator::new(),
        ));
        let reactive = ReactiveStreamer::new(streamer);
        let (ours, peer) = tokio::io::duplex(64 * 1024);
        let (r, w) = tokio::io::split(ours);
        reactive
            .attach(&mut StreamConnection::new(r, w))
            .unwrap();
        (reactive, peer)
    }

    async fn reply(peer: &mut DuplexStream, response: Response) {
        let frame = codec::encode(response.into()).unwrap();
        peer.write_all(&frame).await.unwrap();
    }

    #[tokio::test]
    async fn test_response_resolves_with_result() {
        let (reactive, mut peer) = attached();
        let future = reactive.response(RequestBuilder::new("nvim_eval").arg("1+1"));

        reply(&mut peer, Response::ok(1, Value::from(2))).await;
        let response = future.await.unwrap();
        assert_eq!(response.id, 1);
        assert_eq!(response.result, Value::from(2));
    }

    #[tokio::test]
    async fn test_error_response_resolves_as_failure() {
        let (reactive, mut peer) = attached();
        // Burn ids 1..=6 so the next request is id 7.
        for _ in 0..6 {
            reactive
                .streamer()
                .send_request(RequestBuilder::new("noop"))
                .unwrap();
        }
        let future = reactive.response(RequestBuilder::new("nvim_buf_get_lines"));

        // [1, 7, [1, "bad arg"], nil]
        let frame = Value::Array(vec![
            Value::from(1),
            Value::from(7),
            Value::Array(vec![Value::from(1), Value::from("bad arg")]),
            Value::Nil,
        ]);
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &frame).unwrap();
        peer.write_all(&bytes).await.unwrap();

        let err = future.await.unwrap_err();
        let rpc = err.as_rpc().expect("peer error");
        assert_eq!(rpc.kind, ErrorKind::Validation);
        assert_eq!(rpc.message, "bad arg");
    }

    #[tokio::test]
    async fn test_responses_route_by_id_not_arrival_order() {
        let (reactive, mut peer) = attached();
        let first = reactive.response(RequestBuilder::new("a"));
        let second = reactive.response(RequestBuilder::new("b"));

        reply(&mut peer, Response::ok(2, Value::from("two"))).await;
        reply(&mut peer, Response::ok(1, Value::from("one"))).await;

        assert_eq!(first.await.unwrap().result, Value::from("one"));
        assert_eq!(second.await.unwrap().result, Value::from("two"));
    }

    #[tokio::test]
    async fn test_response_fails_when_peer_hangs_up() {
        let (reactive, peer) = attached();
        let future = reactive.response(RequestBuilder::new("nvim_eval"));
        drop(peer);

        let err = future.await.unwrap_err();
        assert!(matches!(
            err,
            Error::ConnectionClosed { .. } | Error::Io(_)
        ));
    }

    #[tokio::test]
    async fn test_response_fails_after_stop() {
        let (reactive, _peer) = attached();
        let future = reactive.response(RequestBuilder::new("nvim_eval"));
        // Let the request reach the wire before stopping.
        tokio::task::yield_now().await;
        reactive.streamer().stop();

        assert!(future.await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_future_unregisters_callback() {
        let (reactive, peer) = attached();
        let future = reactive.response(RequestBuilder::new("nvim_eval"));
        let mut frames = FrameReader::new(peer);
        let handle = tokio::spawn(future);

        // Wait until the request is on the wire, then abandon the future.
        frames.next_value().await.unwrap().unwrap();
        assert_eq!(reactive.streamer().pending_responses(), 1);
        handle.abort();
        let _ = handle.await;
        assert_eq!(reactive.streamer().pending_responses(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_notification() {
        let (reactive, mut peer) = attached();
        let mut first = Box::pin(reactive.notifications_flow());
        let mut second = Box::pin(reactive.notifications_flow());

        for name in ["one", "two"] {
            let frame = codec::encode(Notification::new(name, vec![]).into()).unwrap();
            peer.write_all(&frame).await.unwrap();
        }

        for stream in [&mut first, &mut second] {
            assert_eq!(stream.next().await.unwrap().name, "one");
            assert_eq!(stream.next().await.unwrap().name, "two");
        }
    }

    #[tokio::test]
    async fn test_dropping_a_flow_unsubscribes() {
        let (reactive, mut peer) = attached();
        let mut requests = Box::pin(reactive.requests_flow());
        let abandoned = reactive.requests_flow();
        drop(abandoned);

        let frame = codec::encode(Message::Request(
            RequestBuilder::new("ping").build(99),
        ))
        .unwrap();
        peer.write_all(&frame).await.unwrap();

        let request = requests.next().await.unwrap();
        assert_eq!((request.id, request.method.as_str()), (99, "ping"));
    }

    #[test]
    fn test_rpc_error_is_carried_in_error() {
        let err = Error::from(RpcError::exception("boom"));
        assert_eq!(err.to_string(), "Exception error: boom");
        assert_eq!(err.as_rpc().map(|e| e.kind), Some(ErrorKind::Exception));
    }
}
