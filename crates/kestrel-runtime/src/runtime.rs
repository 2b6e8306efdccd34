//! Runtime instance — handle tables and default streams
//!
//! All process-wide state lives in an explicit [`Runtime`] value rather
//! than static singletons: API shims construct one per runtime instance,
//! which keeps multiple independent runtimes possible in-process and makes
//! shutdown ordering trivial (drop the runtime, everything under it
//! drains).
//!
//! The runtime owns one handle table per shim-visible resource kind —
//! contexts, streams, events — plus the two implicit stream singletons:
//! the legacy default stream (one per context) and the per-thread default
//! stream (one per host thread per context, protected from destruction).

use crate::context::{ContextConfig, Device, HwContext};
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use crate::handle::{Handle, HandleTable};
use crate::queue::QueueBackend;
use crate::stream::{Stream, StreamKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::ThreadId;
use tracing::info;

/// A self-contained runtime instance
pub struct Runtime {
    devices: Mutex<Vec<Arc<Device>>>,
    contexts: HandleTable<HwContext>,
    streams: HandleTable<Stream>,
    events: HandleTable<Event>,
    /// Legacy default stream per context id
    legacy: Mutex<HashMap<u32, Handle>>,
    /// Per-thread default stream per (thread, context id)
    per_thread: Mutex<HashMap<(ThreadId, u32), Handle>>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("devices", &self.devices.lock().len())
            .field("contexts", &self.contexts.len())
            .field("streams", &self.streams.len())
            .field("events", &self.events.len())
            .finish()
    }
}

impl Runtime {
    /// Create a runtime with one device (card 0)
    #[must_use]
    pub fn new() -> Self {
        info!("Kestrel runtime starting");
        Self {
            devices: Mutex::new(vec![Arc::new(Device::new(0))]),
            contexts: HandleTable::new(),
            streams: HandleTable::new(),
            events: HandleTable::new(),
            legacy: Mutex::new(HashMap::new()),
            per_thread: Mutex::new(HashMap::new()),
        }
    }

    /// Register an additional card; returns its index
    pub fn add_device(&self) -> usize {
        let mut devices = self.devices.lock();
        let index = devices.len();
        devices.push(Arc::new(Device::new(index)));
        index
    }

    /// Device by card index
    ///
    /// # Errors
    ///
    /// `ResourceError` for an unknown index.
    pub fn device(&self, index: usize) -> Result<Arc<Device>> {
        self.devices
            .lock()
            .get(index)
            .cloned()
            .ok_or_else(|| RuntimeError::resource(format!("no device at index {index}")))
    }

    // ── Contexts ────────────────────────────────────────────────────────

    /// Bind a configuration on a device and hand out a context handle
    ///
    /// # Errors
    ///
    /// Propagates device lookup and queue-open failures.
    pub fn register_context(&self, device: usize, config: &ContextConfig) -> Result<Handle> {
        let device = self.device(device)?;
        let ctx = device.register_context(config)?;
        Ok(self.contexts.insert(ctx))
    }

    /// Register a context over a caller-provided backend (emulation/tests)
    ///
    /// # Errors
    ///
    /// `ResourceError` for an unknown device index.
    pub fn register_context_with_backend(
        &self,
        device: usize,
        backend: Box<dyn QueueBackend>,
    ) -> Result<Handle> {
        let device = self.device(device)?;
        Ok(self.contexts.insert(device.register_context_with_backend(backend)))
    }

    /// Resolve a context handle
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for stale or foreign handles.
    pub fn context(&self, handle: Handle) -> Result<Arc<HwContext>> {
        self.contexts
            .get(handle)
            .ok_or_else(|| RuntimeError::invalid_handle(handle.raw()))
    }

    /// Destroy a context
    ///
    /// Precondition: every stream bound to the context has synchronized.
    /// The context object itself lives until its last stream reference
    /// drops, but its handle — and the default streams created under it —
    /// are gone immediately.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for stale handles.
    pub fn destroy_context(&self, handle: Handle) -> Result<()> {
        let ctx = self
            .contexts
            .remove(handle)
            .ok_or_else(|| RuntimeError::invalid_handle(handle.raw()))?;

        // Retire the default streams that were created under this context
        if let Some(h) = self.legacy.lock().remove(&ctx.id()) {
            self.streams.remove(h);
        }
        {
            let mut per_thread = self.per_thread.lock();
            let dead: Vec<(ThreadId, u32)> = per_thread
                .keys()
                .filter(|(_, ctx_id)| *ctx_id == ctx.id())
                .copied()
                .collect();
            for key in dead {
                if let Some(h) = per_thread.remove(&key) {
                    self.streams.remove(h);
                }
            }
        }

        info!("context {} unregistered", ctx.id());
        Ok(())
    }

    // ── Streams ─────────────────────────────────────────────────────────

    /// Create a user stream on a context
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for a stale context handle; `DeviceFatal` if the
    /// context is unusable.
    pub fn create_stream(&self, ctx: Handle) -> Result<Handle> {
        let ctx = self.context(ctx)?;
        if ctx.is_fatal() {
            return Err(RuntimeError::fatal(ctx.id()));
        }
        Ok(self.streams.insert(Stream::new(StreamKind::User, ctx)))
    }

    /// Resolve a stream handle
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for stale or foreign handles.
    pub fn stream(&self, handle: Handle) -> Result<Arc<Stream>> {
        self.streams
            .get(handle)
            .ok_or_else(|| RuntimeError::invalid_handle(handle.raw()))
    }

    /// Destroy a user stream
    ///
    /// # Errors
    ///
    /// `ResourceError` for the protected default streams (legacy and
    /// per-thread); `StateError` when commands are still outstanding —
    /// synchronize first.
    pub fn destroy_stream(&self, handle: Handle) -> Result<()> {
        let stream = self.stream(handle)?;
        if stream.kind() != StreamKind::User {
            return Err(RuntimeError::resource(format!(
                "stream {} is a protected {:?} default stream",
                stream.uid(),
                stream.kind()
            )));
        }
        if !stream.is_idle() {
            return Err(RuntimeError::state(format!(
                "stream {} has outstanding commands; synchronize before destroying",
                stream.uid()
            )));
        }
        self.streams.remove(handle);
        Ok(())
    }

    /// The context's legacy default stream (created on first use)
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for a stale context handle.
    pub fn legacy_stream(&self, ctx: Handle) -> Result<Arc<Stream>> {
        let ctx = self.context(ctx)?;
        let mut legacy = self.legacy.lock();
        if let Some(h) = legacy.get(&ctx.id()) {
            if let Some(stream) = self.streams.get(*h) {
                return Ok(stream);
            }
        }
        let stream = Stream::new(StreamKind::Legacy, ctx.clone());
        legacy.insert(ctx.id(), self.streams.insert(stream.clone()));
        Ok(stream)
    }

    /// The calling thread's default stream on a context (created on first
    /// use; protected from destruction)
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for a stale context handle.
    pub fn per_thread_stream(&self, ctx: Handle) -> Result<Arc<Stream>> {
        let ctx = self.context(ctx)?;
        let key = (std::thread::current().id(), ctx.id());
        let mut per_thread = self.per_thread.lock();
        if let Some(h) = per_thread.get(&key) {
            if let Some(stream) = self.streams.get(*h) {
                return Ok(stream);
            }
        }
        let stream = Stream::new(StreamKind::PerThread, ctx.clone());
        per_thread.insert(key, self.streams.insert(stream.clone()));
        Ok(stream)
    }

    /// Handle of the calling thread's default stream, for destroy attempts
    /// and shim bookkeeping
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for a stale context handle.
    pub fn per_thread_stream_handle(&self, ctx: Handle) -> Result<Handle> {
        let ctx_obj = self.context(ctx)?;
        let key = (std::thread::current().id(), ctx_obj.id());
        if let Some(h) = self.per_thread.lock().get(&key) {
            return Ok(*h);
        }
        let _ = self.per_thread_stream(ctx)?;
        self.per_thread
            .lock()
            .get(&key)
            .copied()
            .ok_or_else(|| RuntimeError::resource("per-thread stream vanished"))
    }

    // ── Events ──────────────────────────────────────────────────────────

    /// Create an unrecorded event and hand out its handle
    pub fn create_event(&self) -> Handle {
        self.events.insert(Event::new())
    }

    /// Resolve an event handle
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for stale or foreign handles.
    pub fn event(&self, handle: Handle) -> Result<Arc<Event>> {
        self.events
            .get(handle)
            .ok_or_else(|| RuntimeError::invalid_handle(handle.raw()))
    }

    /// Destroy an event
    ///
    /// The event object survives while dependency lists still reference
    /// its recorded command; only the handle dies here.
    ///
    /// # Errors
    ///
    /// `InvalidHandle` for stale handles.
    pub fn destroy_event(&self, handle: Handle) -> Result<()> {
        self.events
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::invalid_handle(handle.raw()))
    }
}
