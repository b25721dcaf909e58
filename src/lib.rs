//! nvim-rpc - msgpack-rpc client for Neovim
//!
//! A duplex request/response/notification transport over any byte stream,
//! with futures for responses and multi-subscriber streams for inbound traffic.

pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod rpc;

pub use client::{Client, ClientConfig};
pub use connection::{Address, Connection};
pub use error::{Error, Result};
