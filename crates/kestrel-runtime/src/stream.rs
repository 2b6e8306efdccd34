//! Ordered command streams
//!
//! A stream serializes commands against one hardware context: commands
//! dispatch strictly in enqueue order, one in flight at a time, so a
//! command never starts before its predecessor retired. Cross-stream
//! ordering exists only where an event ties two streams together — either
//! through the recorded-top-event fast path (a no-op wait) or through an
//! injected wait pseudo-command carrying the foreign command as a
//! dependency.
//!
//! Lock discipline: a stream lock is never held while taking another
//! stream's lock; command retirement happens outside the stream lock and
//! re-enters pumping through `Command::finish`.

use crate::command::{Command, CommandKind, Readiness};
use crate::context::HwContext;
use crate::error::{Result, RuntimeError};
use crate::event::Event;
use kestrel_ring::SlotStatus;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Stream flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Explicitly created stream; destroyable once idle
    User,
    /// The context's legacy default stream; runtime-owned, not destroyable
    Legacy,
    /// Per-thread default stream; protected singleton, not destroyable
    PerThread,
}

struct StreamInner {
    /// Every non-terminal command, oldest first; the front is the only
    /// dispatch candidate
    queue: VecDeque<Arc<Command>>,
    /// Most recently recorded synchronization point on this stream
    top_event: Option<Arc<Event>>,
}

/// An ordered per-context command queue
pub struct Stream {
    uid: u64,
    kind: StreamKind,
    ctx: Arc<HwContext>,
    self_weak: Weak<Stream>,
    inner: Mutex<StreamInner>,
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("uid", &self.uid)
            .field("kind", &self.kind)
            .field("ctx", &self.ctx.id())
            .field("pending", &self.inner.lock().queue.len())
            .finish()
    }
}

fn next_stream_uid() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

enum PumpAction {
    /// Queue front is running, blocked, or empty
    Idle,
    /// Retire outside the lock with the given status
    Retire(Arc<Command>, SlotStatus),
}

impl Stream {
    /// Create a stream bound to a hardware context
    pub fn new(kind: StreamKind, ctx: Arc<HwContext>) -> Arc<Self> {
        let stream = Arc::new_cyclic(|weak| Self {
            uid: next_stream_uid(),
            kind,
            ctx,
            self_weak: weak.clone(),
            inner: Mutex::new(StreamInner {
                queue: VecDeque::new(),
                top_event: None,
            }),
        });
        stream.ctx.register_stream(stream.self_weak.clone());
        tracing::debug!(
            "stream {} ({:?}) created on context {}",
            stream.uid,
            kind,
            stream.ctx.id()
        );
        stream
    }

    /// Stream id
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.uid
    }

    /// Stream flavor
    #[must_use]
    pub const fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Hardware context this stream dispatches to
    #[must_use]
    pub const fn context(&self) -> &Arc<HwContext> {
        &self.ctx
    }

    /// Whether the stream has no pending or in-flight commands
    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.queue.iter().all(|cmd| cmd.is_complete())
    }

    /// Append a command and dispatch it if nothing gates it
    ///
    /// A command with no unmet dependencies at the queue front goes to the
    /// hardware queue immediately; otherwise it is held and dispatched
    /// automatically once its dependencies retire and its turn comes.
    ///
    /// # Errors
    ///
    /// `DeviceFatal` if the context is unusable; `StateError` if the
    /// command was already enqueued somewhere.
    pub fn enqueue(&self, cmd: &Arc<Command>) -> Result<()> {
        if self.ctx.is_fatal() {
            return Err(RuntimeError::fatal(self.ctx.id()));
        }

        cmd.bind(
            self.self_weak.clone(),
            self.ctx.id(),
            self.ctx.listener().clone(),
        )?;

        {
            let mut inner = self.inner.lock();
            inner.queue.push_back(Arc::clone(cmd));
        }
        tracing::debug!("stream {}: enqueued command {}", self.uid, cmd.uid());

        self.pump();
        Ok(())
    }

    /// Associate an event with the stream's current position
    ///
    /// Enables the O(1) same-stream wait short-circuit: a later
    /// `wait_on` against this exact stream and this exact event needs no
    /// injected wait command.
    pub(crate) fn record_top_event(&self, event: &Arc<Event>) {
        self.inner.lock().top_event = Some(Arc::clone(event));
    }

    /// Order this stream behind an event recorded elsewhere
    ///
    /// Same stream + current top event is a no-op; anything else injects a
    /// wait pseudo-command depending on the event's recorded command, which
    /// preserves this stream's FIFO order while blocking on the foreign
    /// work.
    ///
    /// # Errors
    ///
    /// `StateError` if the event has not been recorded.
    pub fn wait_on(&self, event: &Arc<Event>) -> Result<()> {
        let target = event.recorded_command().ok_or_else(|| {
            RuntimeError::state("cannot wait on an event that has not been recorded")
        })?;

        {
            let inner = self.inner.lock();
            if let Some(top) = &inner.top_event {
                if Arc::ptr_eq(top, event) && event.recorded_on(&self.self_weak) {
                    tracing::trace!(
                        "stream {}: wait on own top event {} elided",
                        self.uid,
                        event.uid()
                    );
                    return Ok(());
                }
            }
        }

        let wait = Command::wait_marker();
        wait.add_dependency(&target)?;
        self.enqueue(&wait)
    }

    /// Block until every command queued at call time reaches a terminal
    /// state
    ///
    /// Commands enqueued after the call starts are not covered.
    ///
    /// # Errors
    ///
    /// `DeviceFatal` if any awaited command was killed by a fatal context
    /// error. Individual (non-fatal) command failures do not fail the
    /// stream synchronization; they are visible per command.
    pub fn synchronize(&self) -> Result<()> {
        self.await_completion();

        let snapshot: Vec<Arc<Command>> = {
            let inner = self.inner.lock();
            inner.queue.iter().cloned().collect()
        };

        let mut fatal = None;
        for cmd in snapshot {
            match cmd.synchronize() {
                Ok(_) => {}
                Err(e) if e.is_fatal() => fatal = Some(e),
                Err(e) => return Err(e),
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drain the context's completion queue once
    ///
    /// Lower-level primitive used by [`Stream::synchronize`]; the
    /// background poller performs the same sweep continuously.
    pub fn await_completion(&self) {
        self.ctx.dispatcher().drain();
    }

    /// Dispatch as much of the queue front as possible
    ///
    /// Called on enqueue and on every completion that could unblock this
    /// stream (freed slot, satisfied dependency).
    pub(crate) fn pump(&self) {
        if self.ctx.is_fatal() {
            self.abort_pending(true);
            return;
        }

        loop {
            let action = {
                let mut inner = self.inner.lock();

                // Retired commands fall off the front
                while inner.queue.front().is_some_and(|cmd| cmd.is_complete()) {
                    inner.queue.pop_front();
                }

                let Some(front) = inner.queue.front() else {
                    return;
                };

                match front.readiness() {
                    Readiness::NotReady => PumpAction::Idle,
                    Readiness::Poisoned => {
                        PumpAction::Retire(Arc::clone(front), SlotStatus::Error)
                    }
                    Readiness::Ready => {
                        if matches!(front.kind(), CommandKind::Wait) {
                            // Host-resolved: the dependency is satisfied,
                            // so the wait retires immediately
                            PumpAction::Retire(Arc::clone(front), SlotStatus::Completed)
                        } else {
                            let front = Arc::clone(front);
                            match self.submit_with_retry(&front) {
                                Ok(true) => continue,
                                Ok(false) => PumpAction::Idle,
                                Err(e) => {
                                    tracing::warn!(
                                        "stream {}: submit of command {} failed: {e}",
                                        self.uid,
                                        front.uid()
                                    );
                                    PumpAction::Retire(front, SlotStatus::Error)
                                }
                            }
                        }
                    }
                }
            };

            match action {
                PumpAction::Idle => return,
                PumpAction::Retire(cmd, status) => {
                    // Outside the stream lock: finish re-enters pumping and
                    // walks successor chains
                    cmd.finish(status, false);
                }
            }
        }
    }

    /// Submit to the context's hardware queue, absorbing slot exhaustion
    ///
    /// `Ok(true)` means dispatched; `Ok(false)` means the ring is full and
    /// the stream is parked for a re-pump once a completion frees a slot.
    /// The park-then-retry order closes the race against a completion
    /// landing between the first rejection and the registration.
    fn submit_with_retry(&self, cmd: &Arc<Command>) -> Result<bool> {
        match self.ctx.dispatcher().submit(cmd) {
            Ok(_) => return Ok(true),
            Err(RuntimeError::ResourceExhausted { .. }) => {}
            Err(e) => return Err(e),
        }

        self.ctx.dispatcher().register_starved(self.self_weak.clone());
        match self.ctx.dispatcher().submit(cmd) {
            Ok(_) => Ok(true),
            Err(RuntimeError::ResourceExhausted { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Error out every queued command (context teardown / stream drop)
    pub(crate) fn abort_pending(&self, fatal: bool) {
        let victims: Vec<Arc<Command>> = {
            let mut inner = self.inner.lock();
            inner.queue.drain(..).collect()
        };
        if victims.is_empty() {
            return;
        }
        tracing::warn!(
            "stream {}: aborting {} pending command(s)",
            self.uid,
            victims.len()
        );
        for cmd in victims {
            cmd.finish(SlotStatus::Aborted, fatal);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Last reference gone with work still queued: retire everything as
        // errored so no synchronize() caller hangs on an orphaned command.
        self.abort_pending(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::software::SoftwareQueue;
    use crate::command::CommandState;
    use crate::context::HwContext;
    use std::time::Duration;

    fn software_ctx(slots: usize, latency: Duration) -> Arc<HwContext> {
        HwContext::with_backend(
            0,
            Box::new(SoftwareQueue::new(slots).with_latency(latency)),
        )
    }

    #[test]
    fn enqueue_dispatches_ready_command() {
        let ctx = software_ctx(4, Duration::ZERO);
        let stream = Stream::new(StreamKind::User, ctx);

        let cmd = Command::marker();
        stream.enqueue(&cmd).unwrap();
        assert_eq!(cmd.synchronize().unwrap(), CommandState::Completed);
        assert!(stream.is_idle());
    }

    #[test]
    fn commands_complete_in_enqueue_order() {
        let ctx = software_ctx(4, Duration::from_millis(5));
        let stream = Stream::new(StreamKind::User, ctx);

        let cmds: Vec<_> = (0..3).map(|_| Command::marker()).collect();
        for cmd in &cmds {
            stream.enqueue(cmd).unwrap();
        }
        stream.synchronize().unwrap();

        let stamps: Vec<u64> = cmds.iter().map(|c| c.end_ns().unwrap()).collect();
        assert!(stamps[0] <= stamps[1] && stamps[1] <= stamps[2]);
    }

    #[test]
    fn predecessor_retires_before_successor_dispatches() {
        let ctx = software_ctx(4, Duration::from_millis(150));
        let stream = Stream::new(StreamKind::User, ctx);

        let first = Command::marker();
        let second = Command::marker();
        stream.enqueue(&first).unwrap();
        stream.enqueue(&second).unwrap();

        // While the first command runs, the second must still be queued
        assert_eq!(first.state(), CommandState::Running);
        assert_eq!(second.state(), CommandState::Queued);

        stream.synchronize().unwrap();
        assert!(first.is_complete() && second.is_complete());
    }

    #[test]
    fn enqueue_on_fatal_context_fails_fast() {
        let ctx = software_ctx(4, Duration::ZERO);
        let stream = Stream::new(StreamKind::User, Arc::clone(&ctx));

        ctx.raise_fatal();
        let err = stream.enqueue(&Command::marker()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn double_enqueue_of_same_command_fails() {
        let ctx = software_ctx(4, Duration::ZERO);
        let s1 = Stream::new(StreamKind::User, Arc::clone(&ctx));
        let s2 = Stream::new(StreamKind::User, ctx);

        let cmd = Command::marker();
        s1.enqueue(&cmd).unwrap();
        let err = s2.enqueue(&cmd).unwrap_err();
        assert!(matches!(err, RuntimeError::StateError { .. }));
    }

    #[test]
    fn dropped_stream_errors_pending_commands() {
        let ctx = software_ctx(1, Duration::from_secs(60));
        let stream = Stream::new(StreamKind::User, ctx);

        let blocker = Command::marker();
        let pending = Command::marker();
        stream.enqueue(&blocker).unwrap();
        stream.enqueue(&pending).unwrap();

        drop(stream);
        // The queued (never dispatched) command must not hang a waiter
        assert_eq!(pending.synchronize().unwrap(), CommandState::Error);
    }
}
