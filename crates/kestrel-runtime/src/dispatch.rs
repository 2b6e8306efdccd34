//! Hardware queue dispatcher
//!
//! Translates ready commands into ring packets, tracks in-flight slots,
//! and surfaces completions. One background poller thread per dispatcher
//! drains the backend; completions are collected under the dispatcher lock
//! but commands are retired strictly *outside* it, because retirement
//! re-enters stream pumping (lock order is stream → dispatcher → command,
//! never backwards).
//!
//! The dispatcher never reorders anything: slot completion order is
//! whatever the device reports. Stream-level ordering is the stream's job —
//! it defers dispatch of dependent commands rather than expecting ordered
//! retirement.

use crate::command::{Command, CommandKind};
use crate::error::Result;
use crate::queue::QueueBackend;
use crate::stream::Stream;
use bytes::Bytes;
use kestrel_ring::{CommandPacket, Opcode, SlotId, SlotStatus};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Poller nap between empty completion sweeps
const POLL_INTERVAL: Duration = Duration::from_micros(100);

struct DispatchState {
    backend: Box<dyn QueueBackend>,
    slots: HashMap<SlotId, Arc<Command>>,
}

struct DispatchShared {
    state: Mutex<DispatchState>,
    work: Condvar,
    stop: AtomicBool,
    ctx: u32,
    /// Streams that hit `ResourceExhausted`; re-pumped after completions
    /// free slots
    starved: Mutex<Vec<std::sync::Weak<Stream>>>,
}

/// Per-context hardware queue driver
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("ctx", &self.shared.ctx)
            .field("inflight", &self.shared.state.lock().slots.len())
            .finish()
    }
}

/// Frame a command into its ring packet plus bulk data
fn encode(kind: &CommandKind) -> (CommandPacket, Bytes) {
    match kind {
        CommandKind::Kernel(launch) => {
            let mut words = Vec::with_capacity(launch.regmap.len().div_ceil(4));
            for chunk in launch.regmap.chunks(4) {
                let mut word = [0u8; 4];
                word[..chunk.len()].copy_from_slice(chunk);
                words.push(u32::from_le_bytes(word));
            }
            (CommandPacket::new(Opcode::StartKernel, words), Bytes::new())
        }
        CommandKind::Copy(desc) => {
            #[allow(clippy::cast_possible_truncation)]
            let payload = vec![
                desc.dst_addr as u32,
                (desc.dst_addr >> 32) as u32,
                desc.src.len() as u32,
            ];
            (
                CommandPacket::new(Opcode::CopyBuffer, payload),
                desc.src.clone(),
            )
        }
        CommandKind::Marker => (CommandPacket::new(Opcode::Marker, Vec::new()), Bytes::new()),
        // Wait commands are retired by the stream, never submitted
        CommandKind::Wait => unreachable!("wait commands never reach the dispatcher"),
    }
}

impl Dispatcher {
    /// Wrap a backend and start its completion poller
    pub(crate) fn new(ctx: u32, backend: Box<dyn QueueBackend>) -> Self {
        let shared = Arc::new(DispatchShared {
            state: Mutex::new(DispatchState {
                backend,
                slots: HashMap::new(),
            }),
            work: Condvar::new(),
            stop: AtomicBool::new(false),
            ctx,
            starved: Mutex::new(Vec::new()),
        });

        let poller = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("kestrel-poll-{ctx}"))
                .spawn(move || poll_loop(&shared))
                .ok()
        };
        if poller.is_none() {
            tracing::warn!("context {ctx}: completion poller failed to start; drain-only mode");
        }

        Self {
            shared,
            poller: Mutex::new(poller),
        }
    }

    /// Ring slot count of the underlying backend
    pub fn slot_count(&self) -> usize {
        self.shared.state.lock().backend.slot_count()
    }

    /// Number of in-flight slots
    pub fn inflight(&self) -> usize {
        self.shared.state.lock().slots.len()
    }

    /// Submit a ready command to the hardware queue
    ///
    /// On success the command transitions to `Running` and its slot is
    /// tracked until a completion retires it.
    ///
    /// # Errors
    ///
    /// `ResourceExhausted` when the ring is full — the stream keeps the
    /// command pending and retries when a slot frees.
    pub(crate) fn submit(&self, cmd: &Arc<Command>) -> Result<SlotId> {
        let (packet, data) = encode(cmd.kind());

        let mut st = self.shared.state.lock();
        let slot = st.backend.submit(&packet, &data)?;
        st.slots.insert(slot, Arc::clone(cmd));
        cmd.mark_running();
        drop(st);

        tracing::debug!(
            "context {}: command {} -> {}",
            self.shared.ctx,
            cmd.uid(),
            slot
        );
        self.shared.work.notify_one();
        Ok(slot)
    }

    /// Park a stream that found the ring full
    ///
    /// The stream is re-pumped after the next completion sweep frees
    /// slots. Callers retry the submit once after registering, which
    /// closes the race against a completion landing in between.
    pub(crate) fn register_starved(&self, stream: std::sync::Weak<Stream>) {
        self.shared.starved.lock().push(stream);
    }

    /// One inline completion sweep
    ///
    /// Used by `Stream::await_completion` so synchronization latency does
    /// not depend on the poller's nap interval.
    pub(crate) fn drain(&self) {
        let completions = {
            let mut st = self.shared.state.lock();
            take_completions(&mut st)
        };
        let freed = !completions.is_empty();
        for (cmd, status) in completions {
            cmd.finish(status, false);
        }
        if freed {
            wake_starved(&self.shared);
        }
    }

    /// Abort every in-flight slot with a fatal error status
    pub(crate) fn abort_all(&self) {
        let victims: Vec<Arc<Command>> = {
            let mut st = self.shared.state.lock();
            st.slots.drain().map(|(_, cmd)| cmd).collect()
        };
        if !victims.is_empty() {
            tracing::warn!(
                "context {}: aborting {} in-flight command(s)",
                self.shared.ctx,
                victims.len()
            );
        }
        for cmd in victims {
            cmd.finish(SlotStatus::Aborted, true);
        }
    }

    /// Stop the poller and abort anything still in flight
    pub(crate) fn shutdown(&self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.work.notify_all();
        if let Some(handle) = self.poller.lock().take() {
            let _ = handle.join();
        }
        self.abort_all();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Re-pump every stream that was parked on a full ring
fn wake_starved(shared: &DispatchShared) {
    let waiters: Vec<Arc<Stream>> = {
        let mut starved = shared.starved.lock();
        starved.drain(..).filter_map(|w| w.upgrade()).collect()
    };
    for stream in waiters {
        stream.pump();
    }
}

/// Map retired slots back to their commands
fn take_completions(st: &mut DispatchState) -> Vec<(Arc<Command>, SlotStatus)> {
    let raw = st.backend.poll();
    let mut out = Vec::with_capacity(raw.len());
    for (slot, status) in raw {
        // A missing slot was already torn down by abort_all
        if let Some(cmd) = st.slots.remove(&slot) {
            out.push((cmd, status));
        }
    }
    out
}

fn poll_loop(shared: &DispatchShared) {
    loop {
        let completions = {
            let mut st = shared.state.lock();
            while !shared.stop.load(Ordering::SeqCst) && st.slots.is_empty() {
                shared.work.wait(&mut st);
            }
            if shared.stop.load(Ordering::SeqCst) {
                break;
            }
            let completions = take_completions(&mut st);
            if completions.is_empty() {
                // Nothing retired yet; nap with the lock released
                let _ = shared.work.wait_for(&mut st, POLL_INTERVAL);
                continue;
            }
            completions
        };

        // Retire outside the dispatcher lock: finish() walks dependency
        // chains and pumps streams.
        for (cmd, status) in completions {
            cmd.finish(status, false);
        }
        wake_starved(shared);
    }
    tracing::debug!("context {}: poller stopped", shared.ctx);
}
