//! msgpack-rpc transport and correlation engine.
//!
//! Layers, bottom up:
//! - [`message`] and [`codec`]: the three frame kinds and their wire form
//! - [`Sender`] / [`Listener`]: the write pool and the read loop
//! - [`Streamer`]: ids, response correlation and callback fan-out
//! - [`ReactiveStreamer`]: response futures and publish streams
//! - [`HandlerTable`]: named handlers for peer-initiated traffic

pub mod callbacks;
pub mod codec;
pub mod handler;
pub mod id;
pub mod listener;
pub mod message;
pub mod reactive;
pub mod sender;
pub mod streamer;

pub use callbacks::{Callback, CallbackRegistry};
pub use handler::{HandlerTable, InstalledHandlers};
pub use id::MessageIdGenerator;
pub use listener::{BoxReader, Listener, ListenerTask, ResponseCallback};
pub use message::{ErrorKind, Message, Notification, Request, RequestBuilder, Response, RpcError};
pub use reactive::ReactiveStreamer;
pub use sender::{BoxWriter, Sender, WriteHandle};
pub use streamer::{Streamer, StreamerState};
