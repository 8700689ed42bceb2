//! Callback-driven QUIC engine.
//!
//! The engine is driven through synchronous commands on [`Api`] and reports
//! progress through an [`EventHandler`]. Every listener, connection and
//! stream is named by a handle; callers attach an opaque [`Context`] token to
//! a handle and receive it back with every event for that handle.
//!
//! Flow control on the receive side is explicit: bytes delivered in
//! [`StreamEvent::Receive`] count against the stream's receive window until
//! they are acknowledged with [`Api::stream_receive_complete`].

mod api;
mod connection;
pub mod error;
pub mod event;
mod listener;
pub mod settings;
mod stream;

pub use api::Api;
pub use error::{NativeError, NativeResult};
pub use event::{
    ConnectionEvent, ConnectionHandle, Context, EventHandler, ListenerEvent, ListenerHandle,
    ShutdownReason, StreamEvent, StreamHandle,
};
pub use settings::{ClientSettings, ListenerSettings, Settings};
pub use stream::StreamStats;

pub use quinn::{ClientConfig, ServerConfig};
