//! Events — recordable synchronization points
//!
//! An event is a thin wrapper over a marker command. Recording it enqueues
//! the marker on a stream, capturing "everything submitted so far"; other
//! streams (or the host) can then wait on the event. Once the marker
//! retires, the event carries a completion timestamp usable for elapsed
//! time measurement.
//!
//! Timestamps come from the host monotonic clock; profiling layers that
//! obtain better numbers from hardware counters can override the recorded
//! time explicitly.

use crate::command::{Command, CommandState};
use crate::error::{Result, RuntimeError};
use crate::stream::Stream;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Recording lifecycle of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordPhase {
    /// Fresh event; no stream association yet
    Unrecorded,
    /// `record` in progress on some thread
    Recording,
    /// Marker enqueued; the event is live
    Recorded,
}

struct EventInner {
    phase: RecordPhase,
    /// The marker command, once recorded
    command: Option<Arc<Command>>,
    /// Stream the event was recorded on
    stream: Weak<Stream>,
    /// Explicit timestamp override (profiling hook)
    time_override: Option<u64>,
}

/// A synchronization point recordable against a stream
pub struct Event {
    uid: u64,
    self_weak: Weak<Event>,
    inner: Mutex<EventInner>,
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Event")
            .field("uid", &self.uid)
            .field("phase", &inner.phase)
            .finish()
    }
}

fn next_event_uid() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Event {
    /// Create an unrecorded event
    ///
    /// Before the first `record` the event has no stream and cannot be
    /// queried or waited on.
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            uid: next_event_uid(),
            self_weak: weak.clone(),
            inner: Mutex::new(EventInner {
                phase: RecordPhase::Unrecorded,
                command: None,
                stream: Weak::new(),
                time_override: None,
            }),
        })
    }

    /// Event id
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.uid
    }

    /// Whether the event has been recorded
    pub fn is_recorded(&self) -> bool {
        self.inner.lock().phase == RecordPhase::Recorded
    }

    /// Record the event at the stream's current position
    ///
    /// Enqueues a marker command behind everything already submitted to
    /// the stream and installs this event as the stream's top event for
    /// the same-stream wait fast path.
    ///
    /// # Errors
    ///
    /// `StateError` on double record; `DeviceFatal` if the stream's
    /// context is unusable.
    pub fn record(&self, stream: &Arc<Stream>) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.phase != RecordPhase::Unrecorded {
                return Err(RuntimeError::state(format!(
                    "event {} is already recorded",
                    self.uid
                )));
            }
            inner.phase = RecordPhase::Recording;
        }

        let marker = Command::marker();
        if let Err(e) = stream.enqueue(&marker) {
            self.inner.lock().phase = RecordPhase::Unrecorded;
            return Err(e);
        }

        {
            let mut inner = self.inner.lock();
            inner.command = Some(Arc::clone(&marker));
            inner.stream = Arc::downgrade(stream);
            inner.phase = RecordPhase::Recorded;
        }

        if let Some(this) = self.self_weak.upgrade() {
            stream.record_top_event(&this);
        }

        tracing::debug!(
            "event {} recorded on stream {} (command {})",
            self.uid,
            stream.uid(),
            marker.uid()
        );
        Ok(())
    }

    /// Non-blocking completion check
    ///
    /// # Errors
    ///
    /// `StateError` if the event has not been recorded.
    pub fn query(&self) -> Result<bool> {
        let inner = self.inner.lock();
        match (&inner.phase, &inner.command) {
            (RecordPhase::Recorded, Some(cmd)) => Ok(cmd.is_complete()),
            _ => Err(RuntimeError::state(format!(
                "event {} has not been recorded",
                self.uid
            ))),
        }
    }

    /// Block until the recorded marker retires
    ///
    /// # Errors
    ///
    /// `StateError` if the event has not been recorded; `DeviceFatal` if
    /// the context died while the marker was pending.
    pub fn synchronize(&self) -> Result<()> {
        let cmd = {
            let inner = self.inner.lock();
            match (&inner.phase, &inner.command) {
                (RecordPhase::Recorded, Some(cmd)) => Arc::clone(cmd),
                _ => {
                    return Err(RuntimeError::state(format!(
                        "event {} has not been recorded",
                        self.uid
                    )))
                }
            }
        };
        cmd.synchronize()?;
        Ok(())
    }

    /// Completion timestamp in monotonic nanoseconds
    ///
    /// # Errors
    ///
    /// `StateError` unless the event is recorded and its marker retired.
    pub fn timestamp_ns(&self) -> Result<u64> {
        let inner = self.inner.lock();
        if let Some(ns) = inner.time_override {
            return Ok(ns);
        }
        match (&inner.phase, &inner.command) {
            (RecordPhase::Recorded, Some(cmd)) => cmd.end_ns().ok_or_else(|| {
                RuntimeError::state(format!("event {} has not completed", self.uid))
            }),
            _ => Err(RuntimeError::state(format!(
                "event {} has not been recorded",
                self.uid
            ))),
        }
    }

    /// Override the recorded timestamp
    ///
    /// Profiling layers with access to hardware counters use this to
    /// replace the host-clock fallback.
    pub fn set_recorded_time(&self, ns: u64) {
        self.inner.lock().time_override = Some(ns);
    }

    /// Elapsed time between two events in milliseconds
    ///
    /// Defined as `stop.timestamp - start.timestamp`; negative when `stop`
    /// retired first.
    ///
    /// # Errors
    ///
    /// `StateError` unless both events are recorded and both markers have
    /// retired.
    pub fn elapsed_time(start: &Event, stop: &Event) -> Result<f64> {
        for ev in [start, stop] {
            match ev.query() {
                Ok(true) => {}
                Ok(false) => {
                    return Err(RuntimeError::state(format!(
                        "event {} has not completed",
                        ev.uid
                    )))
                }
                Err(e) => {
                    // Overridden timestamps stand in for completion only if
                    // the event was recorded; unrecorded stays an error
                    return Err(e);
                }
            }
        }
        let start_ns = start.timestamp_ns()?;
        let stop_ns = stop.timestamp_ns()?;
        #[allow(clippy::cast_precision_loss)]
        let delta_ns = (i128::from(stop_ns) - i128::from(start_ns)) as f64;
        Ok(delta_ns / 1e6)
    }

    /// The marker command, once recorded (used by `Stream::wait_on`)
    pub(crate) fn recorded_command(&self) -> Option<Arc<Command>> {
        let inner = self.inner.lock();
        match inner.phase {
            RecordPhase::Recorded => inner.command.clone(),
            _ => None,
        }
    }

    /// Whether this event was recorded on the given stream
    pub(crate) fn recorded_on(&self, stream: &Weak<Stream>) -> bool {
        Weak::ptr_eq(&self.inner.lock().stream, stream)
    }

    /// Terminal state of the recorded marker, if any
    pub fn command_state(&self) -> Option<CommandState> {
        self.inner
            .lock()
            .command
            .as_ref()
            .map(|cmd| cmd.state())
    }
}
