//! Opaque handle issue and resolution
//!
//! Every shim-visible resource kind (streams, events, hardware contexts)
//! gets its own [`HandleTable`]. A handle is valid from the moment `insert`
//! returns it until `remove`; lookups of stale or foreign handles return
//! `None` and the caller translates that to an invalid-handle error.
//! Object destruction is deferred until the last shared reference drops,
//! so a removed object stays alive while in-flight work still points at it.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Opaque resource handle
///
/// Never zero; never reused within one table's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Raw handle value (for error reporting and FFI shims)
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Thread-safe registry mapping opaque handles to shared objects
#[derive(Debug)]
pub struct HandleTable<T: ?Sized> {
    entries: Mutex<HashMap<u64, Arc<T>>>,
    next: AtomicU64,
}

impl<T: ?Sized> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> HandleTable<T> {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            // Handle values start at 1; zero is reserved as "no handle"
            next: AtomicU64::new(1),
        }
    }

    /// Register an object and hand out a fresh handle for it
    ///
    /// Always succeeds; O(1) amortized; safe from any thread.
    pub fn insert(&self, object: Arc<T>) -> Handle {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(id, object);
        Handle(id)
    }

    /// Resolve a handle to its object
    ///
    /// Returns `None` for unknown or removed handles — callers surface
    /// that as an invalid-handle error.
    pub fn get(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.lock().get(&handle.0).cloned()
    }

    /// Drop the table's claim on an object
    ///
    /// Returns the removed object, or `None` if the handle was unknown.
    /// The object itself is destroyed only when all other shared
    /// references (streams, dependency lists) have dropped.
    pub fn remove(&self, handle: Handle) -> Option<Arc<T>> {
        self.entries.lock().remove(&handle.0)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
