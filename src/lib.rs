#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![deny(unused_must_use)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod framing;
pub mod handshake;
pub mod id;
pub mod message;
pub mod peer;
pub mod protocol;
pub mod rendezvous;
pub mod server;
pub mod session;

#[cfg(test)]
mod test_support;

pub use client::ClientStart;
pub use config::{Config, TransportMode};
pub use context::ConnectionContext;
pub use dispatch::{handler_fn, DispatchRegistry, ReceiveHandler, ReceivePipeline};
pub use id::{ClientId, ConnectionKey};
#[cfg(feature = "macros")]
pub use comlink_macros::Message;
pub use message::{Envelope, Message};
pub use peer::Peer;
pub use server::ServerStart;
pub use session::Session;
