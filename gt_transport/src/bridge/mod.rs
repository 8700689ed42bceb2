//! Bridge from the callback-driven native engine to blocking objects.
//!
//! Engine callbacks arrive on engine worker threads and are routed through
//! the process-wide context tables to the owning stream, connection or
//! listener, which hands data to blocked consumer calls through bounded
//! hand-offs. Every blocking wait also watches the owner's close signal.

mod connection;
mod engine;
mod listener;
mod native;
pub mod registry;
pub mod signal;
mod stream;

pub use self::connection::NativeConnection;
pub use self::engine::NativeEngine;
pub use self::native::{Dispatcher, NativeCore};
pub use self::listener::NativeListener;
pub use self::stream::NativeStream;

#[cfg(test)]
mod tests;
