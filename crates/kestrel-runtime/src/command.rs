//! Command objects and their lifecycle state machine
//!
//! A command is one unit of asynchronous work bound for a hardware context:
//! a kernel launch, a buffer copy, a synchronization marker, or a
//! host-injected wait. Commands move monotonically through
//!
//! ```text
//! Init → Queued → Running → {Completed | Error}
//! ```
//!
//! `Init` is the state right after construction, before the command is bound
//! to a stream. `Queued` means accepted into a stream's pending list (it may
//! still be waiting on dependencies). `Running` means dispatched to the
//! hardware queue. `Completed`/`Error` are terminal.
//!
//! Dependency bookkeeping mirrors the submission-chain design of classic
//! accelerator runtimes: each command keeps a wait count of unresolved
//! predecessors and a chain of successors to notify when it retires. All
//! blocking waits go through a condition variable — never a spin loop.

use crate::error::{Result, RuntimeError};
use crate::profile::{self, ListenerRef};
use crate::stream::Stream;
use bytes::Bytes;
use kestrel_ring::SlotStatus;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Instant;

/// Lifecycle state of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CommandState {
    /// Constructed, not yet bound to a stream
    Init,
    /// Accepted by a stream, not yet dispatched to hardware
    Queued,
    /// Dispatched to the hardware queue
    Running,
    /// Finished successfully (terminal)
    Completed,
    /// Finished with an error (terminal)
    Error,
}

impl CommandState {
    /// Whether this state is terminal
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

/// Kernel launch payload: a named kernel plus its register map image
#[derive(Debug, Clone)]
pub struct KernelLaunch {
    /// Kernel name (for logs and profiling)
    pub kernel: String,
    /// Register map written to the execution unit's control block
    pub regmap: Bytes,
}

/// Buffer copy payload
///
/// The command holds a reference (not a copy) to the source buffer for its
/// whole queued→terminal lifetime; the buffer object's own lifetime is
/// managed by the caller.
#[derive(Debug, Clone)]
pub struct CopyDescriptor {
    /// Source bytes to transfer
    pub src: Bytes,
    /// Destination device address
    pub dst_addr: u64,
}

/// Kind-specific command payload
///
/// The kind set is closed and known at design time, so a tagged variant is
/// used rather than open-ended dynamic dispatch.
#[derive(Debug, Clone)]
pub enum CommandKind {
    /// Launch a compute kernel
    Kernel(KernelLaunch),
    /// Copy a host buffer to device memory
    Copy(CopyDescriptor),
    /// Pure synchronization marker (event recording)
    Marker,
    /// Host-injected cross-stream wait; never submitted to hardware
    Wait,
}

impl CommandKind {
    /// Short kind name for logs and profile hooks
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Kernel(_) => "kernel",
            Self::Copy(_) => "copy",
            Self::Marker => "marker",
            Self::Wait => "wait",
        }
    }
}

/// Dispatch disposition of a queued command, as seen by its stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    /// Not dispatchable yet (unmet dependencies, or not in `Queued`)
    NotReady,
    /// All dependencies completed; eligible for hardware submission
    Ready,
    /// A dependency failed; the command must retire with an error
    Poisoned,
}

struct CommandInner {
    state: CommandState,
    /// Unresolved predecessor count (explicit dependencies only)
    wait_count: usize,
    /// Set when a dependency retired with an error
    poisoned: bool,
    /// Set when the failure came from a fatal context error
    fatal: bool,
    /// Context id captured at bind time (for fatal error reporting)
    ctx: u32,
    /// Successors to notify on terminal transition
    chain: Vec<Weak<Command>>,
    /// Owning stream once enqueued
    stream: Weak<Stream>,
    listener: ListenerRef,
    /// Monotonic completion timestamp
    end_ns: Option<u64>,
}

/// A unit of asynchronous work with shared ownership
///
/// Commands are handed around as `Arc<Command>`: the owning stream, the
/// handle tables, and dependency lists all share the same object. No cycles
/// can form because dependencies may only point at commands created earlier.
pub struct Command {
    uid: u64,
    kind: CommandKind,
    self_weak: Weak<Command>,
    inner: Mutex<CommandInner>,
    done: Condvar,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("uid", &self.uid)
            .field("kind", &self.kind.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Monotonic nanoseconds since the first runtime use in this process
///
/// Host wall-clock fallback timestamp source; profiling layers can override
/// recorded times explicitly (see [`crate::event::Event::set_recorded_time`]).
pub(crate) fn monotonic_ns() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    // 2^64 ns is ~585 years of uptime; truncation is theoretical
    #[allow(clippy::cast_possible_truncation)]
    let ns = epoch.elapsed().as_nanos() as u64;
    ns
}

fn next_uid() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

impl Command {
    fn alloc(kind: CommandKind) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            uid: next_uid(),
            kind,
            self_weak: weak.clone(),
            inner: Mutex::new(CommandInner {
                state: CommandState::Init,
                wait_count: 0,
                poisoned: false,
                fatal: false,
                ctx: 0,
                chain: Vec::new(),
                stream: Weak::new(),
                listener: None,
                end_ns: None,
            }),
            done: Condvar::new(),
        })
    }

    /// Create a kernel launch command
    pub fn kernel(kernel: impl Into<String>, regmap: Bytes) -> Arc<Self> {
        Self::alloc(CommandKind::Kernel(KernelLaunch {
            kernel: kernel.into(),
            regmap,
        }))
    }

    /// Create a buffer copy command
    pub fn copy(src: Bytes, dst_addr: u64) -> Arc<Self> {
        Self::alloc(CommandKind::Copy(CopyDescriptor { src, dst_addr }))
    }

    /// Create a pure synchronization marker
    pub fn marker() -> Arc<Self> {
        Self::alloc(CommandKind::Marker)
    }

    /// Create a host-resolved wait pseudo-command
    pub(crate) fn wait_marker() -> Arc<Self> {
        Self::alloc(CommandKind::Wait)
    }

    /// Unique command id
    #[must_use]
    pub const fn uid(&self) -> u64 {
        self.uid
    }

    /// Kind-specific payload
    #[must_use]
    pub const fn kind(&self) -> &CommandKind {
        &self.kind
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommandState {
        self.inner.lock().state
    }

    /// Whether the command reached a terminal state
    pub fn is_complete(&self) -> bool {
        self.state().is_terminal()
    }

    /// Completion timestamp in monotonic nanoseconds, once terminal
    pub(crate) fn end_ns(&self) -> Option<u64> {
        self.inner.lock().end_ns
    }

    /// Add a predecessor this command must wait for
    ///
    /// Legal only while the command is `Init` or `Queued`. Dependencies on
    /// already-completed commands do not block. A dependency on a command
    /// created *after* this one is rejected — construction order is what
    /// keeps the dependency graph acyclic.
    ///
    /// # Errors
    ///
    /// Returns `StateError` if the command was already dispatched, if the
    /// dependency is the command itself, or if it was created later.
    pub fn add_dependency(&self, dep: &Arc<Command>) -> Result<()> {
        if dep.uid == self.uid {
            return Err(RuntimeError::state("command cannot depend on itself"));
        }
        if dep.uid > self.uid {
            return Err(RuntimeError::state(format!(
                "command {} cannot depend on later-created command {}",
                self.uid, dep.uid
            )));
        }

        // Lock order: younger command first, then the older dependency.
        let mut inner = self.inner.lock();
        if !matches!(inner.state, CommandState::Init | CommandState::Queued) {
            return Err(RuntimeError::state(format!(
                "command {} is {:?}; dependencies may only be added before dispatch",
                self.uid, inner.state
            )));
        }

        let mut dep_inner = dep.inner.lock();
        match dep_inner.state {
            CommandState::Completed => {} // already satisfied
            CommandState::Error => {
                inner.poisoned = true;
                inner.fatal |= dep_inner.fatal;
            }
            _ => {
                dep_inner.chain.push(self.self_weak.clone());
                inner.wait_count += 1;
            }
        }
        Ok(())
    }

    /// Block until the command reaches a terminal state
    ///
    /// Safe against concurrent teardown of the owning stream or context:
    /// teardown retires pending commands with an error, so no waiter hangs.
    ///
    /// # Errors
    ///
    /// Returns `DeviceFatal` if the command was killed by a fatal context
    /// error; otherwise the terminal state is returned.
    pub fn synchronize(&self) -> Result<CommandState> {
        let mut inner = self.inner.lock();
        while !inner.state.is_terminal() {
            self.done.wait(&mut inner);
        }
        if inner.fatal {
            return Err(RuntimeError::fatal(inner.ctx));
        }
        Ok(inner.state)
    }

    /// Bind to a stream at enqueue time (`Init` → `Queued`)
    pub(crate) fn bind(&self, stream: Weak<Stream>, ctx: u32, listener: ListenerRef) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != CommandState::Init {
            return Err(RuntimeError::state(format!(
                "command {} is {:?} and cannot be enqueued again",
                self.uid, inner.state
            )));
        }
        inner.state = CommandState::Queued;
        inner.stream = stream;
        inner.ctx = ctx;
        inner.listener = listener.clone();
        drop(inner);

        profile::notify(&listener, self.uid, self.kind.name(), CommandState::Queued);
        Ok(())
    }

    /// Record hardware dispatch (`Queued` → `Running`)
    pub(crate) fn mark_running(&self) {
        let listener = {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.state, CommandState::Queued);
            inner.state = CommandState::Running;
            inner.listener.clone()
        };
        profile::notify(&listener, self.uid, self.kind.name(), CommandState::Running);
        tracing::debug!("command {} [queued->running]", self.uid);
    }

    /// Dispatch disposition as seen by the owning stream
    pub(crate) fn readiness(&self) -> Readiness {
        let inner = self.inner.lock();
        if inner.state != CommandState::Queued {
            Readiness::NotReady
        } else if inner.poisoned {
            // A failed dependency aborts the command without waiting for
            // the rest of its wait list.
            Readiness::Poisoned
        } else if inner.wait_count == 0 {
            Readiness::Ready
        } else {
            Readiness::NotReady
        }
    }

    /// Retire the command and propagate along the successor chain
    ///
    /// Must never be called while holding a stream or dispatcher lock: it
    /// takes successor command locks and re-enters stream pumping.
    pub(crate) fn finish(&self, status: SlotStatus, fatal: bool) {
        let (chain, stream, listener, state, fatal_out) = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return;
            }
            let state = if status.is_ok() {
                CommandState::Completed
            } else {
                CommandState::Error
            };
            inner.state = state;
            inner.fatal |= fatal;
            inner.end_ns = Some(monotonic_ns());
            let chain = std::mem::take(&mut inner.chain);
            (
                chain,
                inner.stream.clone(),
                inner.listener.clone(),
                state,
                inner.fatal,
            )
        };
        self.done.notify_all();

        profile::notify(&listener, self.uid, self.kind.name(), state);
        tracing::debug!("command {} retired as {:?} ({:?})", self.uid, state, status);

        let ok = status.is_ok();
        for succ in chain {
            let Some(succ) = succ.upgrade() else { continue };
            if ok {
                succ.dependency_satisfied();
            } else {
                succ.dependency_failed(fatal_out);
            }
        }

        // The slot this command held is free now; give the owning stream a
        // chance to dispatch its next pending command.
        if let Some(stream) = stream.upgrade() {
            stream.pump();
        }
    }

    /// One of our predecessors completed successfully
    fn dependency_satisfied(&self) {
        let wake = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                None
            } else {
                debug_assert!(inner.wait_count > 0);
                inner.wait_count -= 1;
                if inner.wait_count == 0 && inner.state == CommandState::Queued && !inner.poisoned
                {
                    Some(inner.stream.clone())
                } else {
                    None
                }
            }
        };
        if let Some(stream) = wake.and_then(|w| w.upgrade()) {
            stream.pump();
        }
    }

    /// One of our predecessors retired with an error
    fn dependency_failed(&self, fatal: bool) {
        let wake = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                None
            } else {
                debug_assert!(inner.wait_count > 0);
                inner.wait_count -= 1;
                inner.poisoned = true;
                inner.fatal |= fatal;
                if inner.state == CommandState::Queued {
                    Some(inner.stream.clone())
                } else {
                    None
                }
            }
        };
        if let Some(stream) = wake.and_then(|w| w.upgrade()) {
            stream.pump();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn new_command_starts_in_init() {
        let cmd = Command::marker();
        assert_eq!(cmd.state(), CommandState::Init);
        assert!(!cmd.is_complete());
    }

    #[test]
    fn dependency_on_later_command_is_rejected() {
        let older = Command::marker();
        let younger = Command::marker();
        let err = older.add_dependency(&younger).unwrap_err();
        assert!(matches!(err, RuntimeError::StateError { .. }));
    }

    #[test]
    fn self_dependency_is_rejected() {
        let cmd = Command::marker();
        assert!(cmd.add_dependency(&cmd.clone()).is_err());
    }

    #[test]
    fn dependency_on_completed_command_does_not_block() {
        let dep = Command::marker();
        dep.finish(SlotStatus::Completed, false);

        let cmd = Command::marker();
        cmd.add_dependency(&dep).unwrap();
        cmd.bind(Weak::new(), 0, None).unwrap();
        assert_eq!(cmd.readiness(), Readiness::Ready);
    }

    #[test]
    fn dependency_on_failed_command_poisons() {
        let dep = Command::marker();
        dep.finish(SlotStatus::Error, false);

        let cmd = Command::marker();
        cmd.add_dependency(&dep).unwrap();
        cmd.bind(Weak::new(), 0, None).unwrap();
        assert_eq!(cmd.readiness(), Readiness::Poisoned);
    }

    #[test]
    fn pending_dependency_gates_readiness() {
        let dep = Command::marker();
        let cmd = Command::marker();
        cmd.add_dependency(&dep).unwrap();
        cmd.bind(Weak::new(), 0, None).unwrap();
        assert_eq!(cmd.readiness(), Readiness::NotReady);

        dep.finish(SlotStatus::Completed, false);
        assert_eq!(cmd.readiness(), Readiness::Ready);
    }

    #[test]
    fn dependency_after_dispatch_fails() {
        let dep = Command::marker();
        let cmd = Command::marker();
        cmd.bind(Weak::new(), 0, None).unwrap();
        cmd.mark_running();
        let err = cmd.add_dependency(&dep).unwrap_err();
        assert!(matches!(err, RuntimeError::StateError { .. }));
    }

    #[test]
    fn double_enqueue_fails() {
        let cmd = Command::marker();
        cmd.bind(Weak::new(), 0, None).unwrap();
        assert!(cmd.bind(Weak::new(), 0, None).is_err());
    }

    #[test]
    fn finish_is_idempotent_and_monotonic() {
        let cmd = Command::marker();
        cmd.bind(Weak::new(), 0, None).unwrap();
        cmd.finish(SlotStatus::Completed, false);
        assert_eq!(cmd.state(), CommandState::Completed);

        // A late error report must not regress the terminal state
        cmd.finish(SlotStatus::Error, false);
        assert_eq!(cmd.state(), CommandState::Completed);
    }

    #[test]
    fn synchronize_wakes_on_completion() {
        let cmd = Command::marker();
        cmd.bind(Weak::new(), 0, None).unwrap();

        let waiter = {
            let cmd = cmd.clone();
            thread::spawn(move || cmd.synchronize())
        };

        thread::sleep(Duration::from_millis(20));
        cmd.finish(SlotStatus::Completed, false);

        let state = waiter.join().unwrap().unwrap();
        assert_eq!(state, CommandState::Completed);
    }

    #[test]
    fn synchronize_reports_fatal() {
        let cmd = Command::marker();
        cmd.bind(Weak::new(), 7, None).unwrap();
        cmd.finish(SlotStatus::Aborted, true);

        match cmd.synchronize() {
            Err(RuntimeError::DeviceFatal { context }) => assert_eq!(context, 7),
            other => panic!("expected DeviceFatal, got {other:?}"),
        }
    }

    #[test]
    fn completion_timestamp_is_monotonic() {
        let a = Command::marker();
        a.finish(SlotStatus::Completed, false);
        let b = Command::marker();
        b.finish(SlotStatus::Completed, false);
        assert!(a.end_ns().unwrap() <= b.end_ns().unwrap());
    }
}
