//! Blocking QUIC transport over interchangeable engines.
//!
//! Consumers dial and listen through an [`Engine`] and then work with plain
//! blocking [`Stream`], [`Connection`] and [`Listener`] objects. The
//! [`bridge`] module adapts the callback-driven native engine to those
//! objects; [`quic`] provides the software engines over `quinn`.
//!
//! All blocking calls must be made from ordinary threads, not from inside an
//! async runtime.

pub mod bridge;
pub mod config;
pub mod engine;
pub mod logging;
pub mod quic;
pub mod tls;
pub mod transport;

pub use bridge::{NativeConnection, NativeEngine, NativeListener, NativeStream};
pub use config::{ConfigError, TransportConfig};
pub use engine::{Engine, EngineKind, EngineOptions, Tunnel, open_engine};
pub use quic::{BbrEngine, QuicEngine};
pub use tls::{ClientTls, TlsIdentity};
pub use transport::{Connection, Entity, Listener, Phase, Stream, TransportError, TransportResult};
