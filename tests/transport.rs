//! End-to-end transport tests against an in-memory peer.
//!
//! The peer side of a `tokio::io::duplex` pipe plays Neovim: it reads the
//! frames the client writes and writes raw msgpack frames back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use nvim_rpc::connection::StreamConnection;
use nvim_rpc::rpc::codec::FrameReader;
use nvim_rpc::rpc::{
    Callback, ErrorKind, Listener, Message, MessageIdGenerator, Notification, ReactiveStreamer,
    RequestBuilder, Response, Sender, Streamer,
};
use nvim_rpc::Error;
use rmpv::Value;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

struct FakePeer {
    frames: FrameReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakePeer {
    async fn send_raw(&mut self, frame: Value) {
        let mut bytes = Vec::new();
        rmpv::encode::write_value(&mut bytes, &frame).unwrap();
        self.writer.write_all(&bytes).await.unwrap();
    }

    async fn notify(&mut self, name: &str) {
        self.send_raw(Message::from(Notification::new(name, vec![])).into_value())
            .await;
    }

    async fn next_message(&mut self) -> Message {
        let value = self.frames.next_value().await.unwrap().unwrap();
        Message::from_value(value).unwrap()
    }
}

fn connect() -> (Arc<Streamer>, FakePeer) {
    let streamer = Arc::new(Streamer::new(
        Sender::ordered(),
        Listener::new(),
        MessageIdGenerator::new(),
    ));
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let (r, w) = tokio::io::split(ours);
    streamer
        .attach(&mut StreamConnection::new(r, w))
        .expect("attach");

    let (peer_r, peer_w) = tokio::io::split(theirs);
    let peer = FakePeer {
        frames: FrameReader::new(peer_r),
        writer: peer_w,
    };
    (streamer, peer)
}

/// Sends a notification and waits for it to arrive, proving that everything
/// the peer wrote earlier has been dispatched.
async fn barrier(streamer: &Streamer, peer: &mut FakePeer) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let probe = Callback::new(move |n: &Notification| {
        if n.name == "__barrier" {
            let _ = tx.send(());
        }
    });
    streamer.add_notification_callback(&probe);
    peer.notify("__barrier").await;
    rx.recv().await.unwrap();
    streamer.remove_notification_callback(&probe);
}

#[tokio::test]
async fn test_response_delivered_exactly_once() {
    let (streamer, mut peer) = connect();
    for _ in 0..24 {
        streamer.send_request(RequestBuilder::new("noop")).unwrap();
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (id, _written) = {
        let calls = Arc::clone(&calls);
        streamer
            .send_request_with(RequestBuilder::new("greet"), move |outcome| {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(outcome);
            })
            .unwrap()
    };
    assert_eq!(id, 25);

    let frame = Value::Array(vec![
        Value::from(1),
        Value::from(25),
        Value::Nil,
        Value::from("hello"),
    ]);
    peer.send_raw(frame.clone()).await;
    peer.send_raw(frame).await;
    barrier(&streamer, &mut peer).await;

    let response = rx.recv().await.unwrap().unwrap();
    assert_eq!(response.result, Value::from("hello"));
    assert!(response.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(streamer.pending_responses(), 0);
}

#[tokio::test]
async fn test_notification_fan_out_in_registration_order() {
    let (streamer, mut peer) = connect();
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let recorder = |tag: &'static str| {
        let log = Arc::clone(&log);
        Callback::new(move |n: &Notification| {
            if n.name == "event" {
                log.lock().push(tag);
            }
        })
    };
    let first = recorder("first");
    let second = recorder("second");
    streamer.add_notification_callback(&first);
    streamer.add_notification_callback(&second);

    peer.notify("event").await;
    barrier(&streamer, &mut peer).await;
    assert_eq!(*log.lock(), vec!["first", "second"]);

    streamer.remove_notification_callback(&first);
    peer.notify("event").await;
    barrier(&streamer, &mut peer).await;
    assert_eq!(*log.lock(), vec!["first", "second", "second"]);
}

#[tokio::test]
async fn test_malformed_frame_does_not_stop_the_loop() {
    let (streamer, mut peer) = connect();
    let reactive = ReactiveStreamer::new(Arc::clone(&streamer));
    let mut notifications = Box::pin(reactive.notifications_flow());

    peer.send_raw(Value::Array(vec![Value::from(2), Value::from("short")]))
        .await;
    peer.send_raw(Value::from("not an envelope")).await;
    peer.notify("after").await;

    let next = notifications.next().await.unwrap();
    assert_eq!(next.name, "after");
}

#[tokio::test]
async fn test_error_response_fails_the_future() {
    let (streamer, mut peer) = connect();
    let reactive = ReactiveStreamer::new(Arc::clone(&streamer));
    for _ in 0..6 {
        streamer.send_request(RequestBuilder::new("noop")).unwrap();
    }
    let future = reactive.response(RequestBuilder::new("nvim_buf_set_lines"));

    peer.send_raw(Value::Array(vec![
        Value::from(1),
        Value::from(7),
        Value::Array(vec![Value::from(1), Value::from("bad arg")]),
        Value::Nil,
    ]))
    .await;

    match future.await {
        Err(Error::Rpc(e)) => {
            assert_eq!(e.kind, ErrorKind::Validation);
            assert_eq!(e.message, "bad arg");
        }
        other => panic!("expected a validation failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_stop_terminates_delivery() {
    let (streamer, mut peer) = connect();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = {
        let calls = Arc::clone(&calls);
        Callback::new(move |_: &Notification| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    streamer.add_notification_callback(&counter);
    let (id, written) = {
        let calls = Arc::clone(&calls);
        streamer
            .send_request_with(RequestBuilder::new("never"), move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap()
    };
    written.await.unwrap();
    assert!(matches!(peer.next_message().await, Message::Request(r) if r.id == id));

    streamer.stop();

    // The loop may already have dropped its end; write errors are fine here.
    let mut bytes = Vec::new();
    for message in [
        Message::from(Notification::new("late", vec![])),
        Message::from(Response::ok(id, Value::Nil)),
    ] {
        rmpv::encode::write_value(&mut bytes, &message.into_value()).unwrap();
    }
    let _ = peer.writer.write_all(&bytes).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_peer_hangup_fails_pending_requests() {
    let (streamer, peer) = connect();
    let reactive = ReactiveStreamer::new(Arc::clone(&streamer));
    let future = reactive.response(RequestBuilder::new("nvim_eval"));
    drop(peer);

    assert!(matches!(
        future.await,
        Err(Error::ConnectionClosed { .. }) | Err(Error::Io(_))
    ));
}

#[tokio::test]
async fn test_concurrent_ids_are_distinct() {
    let generator = Arc::new(MessageIdGenerator::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let generator = Arc::clone(&generator);
            tokio::spawn(async move { (0..250).map(|_| generator.next_id()).collect::<Vec<_>>() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.extend(handle.await.unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 2000);
    assert_eq!(ids.first(), Some(&1));
    assert_eq!(ids.last(), Some(&2000));
}
