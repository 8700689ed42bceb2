//! Process-wide context tables.
//!
//! Engine events carry an opaque [`Context`] instead of a reference to the
//! object they belong to. Each bridge object takes a fresh token when it is
//! built, registers itself under it, and removes the entry exactly once at
//! the start of its close sequence. A lookup clones the entry out, so no
//! table lock is held while the object handles the event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use gt_native::Context;

use super::connection::ConnectionShared;
use super::listener::ListenerShared;
use super::stream::StreamShared;

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

pub(crate) static STREAMS: LazyLock<ContextTable<StreamShared>> = LazyLock::new(ContextTable::new);
pub(crate) static CONNECTIONS: LazyLock<ContextTable<ConnectionShared>> =
    LazyLock::new(ContextTable::new);
pub(crate) static LISTENERS: LazyLock<ContextTable<ListenerShared>> =
    LazyLock::new(ContextTable::new);

/// Allocates a token unique across all tables. Never returns `Context::NONE`.
pub fn next_context() -> Context {
    Context(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
}

/// Map from context token to a live bridge object.
#[derive(Debug)]
pub struct ContextTable<T> {
    entries: DashMap<u64, Arc<T>>,
}

impl<T> ContextTable<T> {
    pub fn new() -> Self {
        ContextTable {
            entries: DashMap::new(),
        }
    }

    pub fn insert(&self, context: Context, value: Arc<T>) {
        self.entries.insert(context.0, value);
    }

    pub fn lookup(&self, context: Context) -> Option<Arc<T>> {
        self.entries
            .get(&context.0)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns `true` if the token was registered.
    pub fn remove(&self, context: Context) -> bool {
        self.entries.remove(&context.0).is_some()
    }

    pub fn contains(&self, context: Context) -> bool {
        self.entries.contains_key(&context.0)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for ContextTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
