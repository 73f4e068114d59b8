//! # Handle Registry
//!
//! Purpose: Resolve a transport handle back to the connection context that
//! owns it. Transports report connect/disconnect by handle, not by object, so
//! this is the only structure shared across every client in the process.
//!
//! ## Design Principles
//! 1. **Init on First Use**: A `OnceLock` singleton; no teardown ordering.
//! 2. **Minimal Locking**: The mutex is held only for insert/remove/lookup,
//!    never while an event is being handled.
//! 3. **Miss Is Normal**: A lookup after removal returns `None` and the
//!    caller drops the callback ("no such session").

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;

use crate::connection::Event;

/// Opaque identifier for one transport session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        HandleId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw identifier.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

pub(crate) struct Registry {
    sessions: Mutex<HashMap<HandleId, UnboundedSender<Event>>>,
}

/// Returns the process-wide registry, creating it on first use.
pub(crate) fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        sessions: Mutex::new(HashMap::new()),
    })
}

impl Registry {
    pub(crate) fn insert(&self, handle: HandleId, queue: UnboundedSender<Event>) {
        self.sessions.lock().insert(handle, queue);
    }

    pub(crate) fn remove(&self, handle: HandleId) -> bool {
        self.sessions.lock().remove(&handle).is_some()
    }

    /// Clones the owning context's queue out from under the lock.
    pub(crate) fn lookup(&self, handle: HandleId) -> Option<UnboundedSender<Event>> {
        self.sessions.lock().get(&handle).cloned()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, handle: HandleId) -> bool {
        self.sessions.lock().contains_key(&handle)
    }
}
