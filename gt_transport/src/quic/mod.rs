//! Pure software QUIC engines.
//!
//! Blocking adapters over `quinn` running on a runtime owned by the engine.
//! [`QuicEngine`] uses quinn's default congestion control and [`BbrEngine`]
//! swaps in BBR; both hand out the same connection, stream and listener
//! types. Close signals are `CancellationToken`s: a stream's token is a child
//! of its connection's, which the connection's watcher task cancels when
//! quinn reports the connection closed.

mod connection;
mod engine;
mod listener;
mod runtime;
mod stream;

pub use connection::QuicConnection;
pub use engine::{BbrEngine, QuicEngine};
pub use listener::QuicListener;
pub use stream::QuicStream;
