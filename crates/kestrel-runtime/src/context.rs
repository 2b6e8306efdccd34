//! Devices and hardware contexts
//!
//! A [`Device`] represents one Kestrel card. Registering a context binds a
//! configuration on it and yields a [`HwContext`] that owns the context's
//! hardware queue (dispatcher) and tracks the streams created against it.
//!
//! Teardown discipline: destroying a context while streams still reference
//! it is only safe after those streams have synchronized — this is a
//! documented call-site precondition, not a deferred grace period, so that
//! leaked work surfaces at the caller instead of being hidden. A *fatal*
//! context error is the one asynchronous teardown path: it aborts every
//! in-flight and pending command and marks the context unusable.

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::profile::{ListenerRef, ProfileListener};
use crate::queue::{select_queue, QueueBackend, QueueConfig, QueueSelection};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tracing::{error, info};

/// Context registration parameters
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Queue backend selection strategy
    pub selection: QueueSelection,
    /// Device target: node path (`/dev/kestrel0`) or bare index (`0`)
    pub target: String,
    /// Queue geometry and simulation parameters
    pub queue: QueueConfig,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            selection: QueueSelection::Auto,
            target: "0".to_string(),
            queue: QueueConfig::default(),
        }
    }
}

impl ContextConfig {
    /// Software-queue configuration (no hardware required)
    #[must_use]
    pub fn software(slot_count: usize, latency: std::time::Duration) -> Self {
        Self {
            selection: QueueSelection::Software,
            target: "software".to_string(),
            queue: QueueConfig {
                slot_count,
                latency,
            },
        }
    }
}

/// A bound hardware execution context
///
/// Owns the context's dispatcher and the weak registry of streams bound to
/// it (needed to error pending work when the context dies).
pub struct HwContext {
    id: u32,
    dispatcher: Dispatcher,
    fatal: AtomicBool,
    streams: Mutex<Vec<Weak<Stream>>>,
    listener: ListenerRef,
}

impl std::fmt::Debug for HwContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HwContext")
            .field("id", &self.id)
            .field("fatal", &self.is_fatal())
            .finish()
    }
}

impl HwContext {
    pub(crate) fn open(id: u32, config: &ContextConfig, listener: ListenerRef) -> Result<Arc<Self>> {
        let backend = select_queue(config.selection, &config.target, &config.queue)?;
        info!(
            "context {id}: opened on {} ({} slots)",
            config.target,
            backend.slot_count()
        );
        Ok(Self::from_backend(id, backend, listener))
    }

    /// Build a context directly over a queue backend
    ///
    /// Entry point for emulation and tests that construct their own
    /// backend (e.g. a software queue with fault injection).
    pub fn with_backend(id: u32, backend: Box<dyn QueueBackend>) -> Arc<Self> {
        Self::from_backend(id, backend, None)
    }

    fn from_backend(id: u32, backend: Box<dyn QueueBackend>, listener: ListenerRef) -> Arc<Self> {
        Arc::new(Self {
            id,
            dispatcher: Dispatcher::new(id, backend),
            fatal: AtomicBool::new(false),
            streams: Mutex::new(Vec::new()),
            listener,
        })
    }

    /// Context id
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether the context has entered an unusable state
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    pub(crate) const fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub(crate) const fn listener(&self) -> &ListenerRef {
        &self.listener
    }

    pub(crate) fn register_stream(&self, stream: Weak<Stream>) {
        let mut streams = self.streams.lock();
        streams.retain(|w| w.strong_count() > 0);
        streams.push(stream);
    }

    /// Mark the context unusable and abort everything on it
    ///
    /// Every in-flight slot and every pending command on every stream
    /// bound to this context transitions to `Error`; blocked
    /// `synchronize()` callers wake with `DeviceFatal`. Subsequent
    /// enqueues fail fast.
    pub fn raise_fatal(&self) {
        if self.fatal.swap(true, Ordering::SeqCst) {
            return; // already dead
        }
        error!("context {}: fatal error, aborting all commands", self.id);

        self.dispatcher.abort_all();

        let streams: Vec<Arc<Stream>> = {
            let streams = self.streams.lock();
            streams.iter().filter_map(Weak::upgrade).collect()
        };
        for stream in streams {
            stream.abort_pending(true);
        }
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        info!("context {}: destroyed", self.id);
    }
}

/// One Kestrel card
///
/// Hands out hardware contexts; a profile listener installed here is
/// inherited by contexts registered afterwards.
pub struct Device {
    index: usize,
    next_ctx: AtomicU32,
    listener: Mutex<ListenerRef>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("index", &self.index).finish()
    }
}

impl Device {
    /// Create a device wrapper for card `index`
    #[must_use]
    pub fn new(index: usize) -> Self {
        Self {
            index,
            next_ctx: AtomicU32::new(0),
            listener: Mutex::new(None),
        }
    }

    /// Card index
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Install a profile listener for contexts registered after this call
    pub fn set_profile_listener(&self, listener: Arc<dyn ProfileListener>) {
        *self.listener.lock() = Some(listener);
    }

    fn next_context_id(&self) -> u32 {
        // Upper bits carry the card index so context ids stay unique
        // across devices
        #[allow(clippy::cast_possible_truncation)]
        let base = (self.index as u32) << 16;
        base | self.next_ctx.fetch_add(1, Ordering::Relaxed)
    }

    /// Bind a configuration and open a hardware context
    ///
    /// # Errors
    ///
    /// Fails when no queue backend can be opened for the configured
    /// target.
    pub fn register_context(&self, config: &ContextConfig) -> Result<Arc<HwContext>> {
        HwContext::open(self.next_context_id(), config, self.listener.lock().clone())
    }

    /// Bind a caller-provided queue backend (emulation/tests)
    pub fn register_context_with_backend(&self, backend: Box<dyn QueueBackend>) -> Arc<HwContext> {
        HwContext::from_backend(self.next_context_id(), backend, self.listener.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::software::SoftwareQueue;
    use crate::command::Command;
    use crate::stream::StreamKind;
    use std::time::Duration;

    #[test]
    fn software_context_registers() {
        let device = Device::new(0);
        let ctx = device
            .register_context(&ContextConfig::software(8, Duration::ZERO))
            .unwrap();
        assert!(!ctx.is_fatal());
    }

    #[test]
    fn context_ids_are_unique_per_device() {
        let device = Device::new(2);
        let a = device.register_context_with_backend(Box::new(SoftwareQueue::new(1)));
        let b = device.register_context_with_backend(Box::new(SoftwareQueue::new(1)));
        assert_ne!(a.id(), b.id());
        assert_eq!(a.id() >> 16, 2);
    }

    #[test]
    fn raise_fatal_is_idempotent() {
        let ctx = HwContext::with_backend(0, Box::new(SoftwareQueue::new(2)));
        ctx.raise_fatal();
        ctx.raise_fatal();
        assert!(ctx.is_fatal());
    }

    #[test]
    fn fatal_context_aborts_pending_streams() {
        let ctx = HwContext::with_backend(
            0,
            Box::new(SoftwareQueue::new(1).with_latency(Duration::from_secs(60))),
        );
        let stream = Stream::new(StreamKind::User, Arc::clone(&ctx));

        let running = Command::marker();
        let pending = Command::marker();
        stream.enqueue(&running).unwrap();
        stream.enqueue(&pending).unwrap();

        ctx.raise_fatal();

        assert!(running.synchronize().unwrap_err().is_fatal());
        assert!(pending.synchronize().unwrap_err().is_fatal());
    }
}
