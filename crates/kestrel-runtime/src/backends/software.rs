//! Software (simulated ring) queue backend
//!
//! Implements [`QueueBackend`] entirely in-process: submitted packets
//! occupy a slot for a configurable latency and then retire on the next
//! `poll`. This gives CI and unit tests the full dispatch/completion
//! machinery — slot exhaustion included — without a Kestrel card, and it
//! doubles as the ground truth when validating hardware runs.
//!
//! Fault injection: `inject_failures(n)` makes the next `n` submissions
//! retire with an error status, which is how the error-independence
//! properties of the dispatcher are exercised.

use crate::error::{Result, RuntimeError};
use crate::queue::QueueBackend;
use kestrel_ring::{CommandPacket, Opcode, SlotId, SlotStatus};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// In-flight slot bookkeeping
#[derive(Debug)]
struct Inflight {
    retire_at: Instant,
    status: SlotStatus,
}

/// In-process simulated command queue
#[derive(Debug)]
pub struct SoftwareQueue {
    slot_count: usize,
    latency: Duration,
    inflight: HashMap<SlotId, Inflight>,
    /// Pending injected failures (next submissions retire as `Error`)
    fail_next: usize,
}

impl SoftwareQueue {
    /// Create a queue with the given ring size
    ///
    /// Commands retire on the first `poll` after submission unless a
    /// latency is configured.
    #[must_use]
    pub fn new(slot_count: usize) -> Self {
        Self {
            slot_count: slot_count.max(1),
            latency: Duration::ZERO,
            inflight: HashMap::new(),
            fail_next: 0,
        }
    }

    /// Set a simulated per-command execution latency
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Make the next `n` submissions retire with an error status
    pub fn inject_failures(&mut self, n: usize) {
        self.fail_next += n;
    }

    /// Number of currently occupied slots
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.inflight.len()
    }

    fn free_slot(&self) -> Option<SlotId> {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.slot_count as u32;
        (0..count)
            .map(SlotId::new)
            .find(|slot| !self.inflight.contains_key(slot))
    }
}

impl QueueBackend for SoftwareQueue {
    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn submit(&mut self, packet: &CommandPacket, data: &[u8]) -> Result<SlotId> {
        debug_assert_ne!(
            packet.opcode(),
            Opcode::Wait,
            "wait commands are resolved by the runtime, never submitted"
        );

        let Some(slot) = self.free_slot() else {
            return Err(RuntimeError::exhausted("command slots"));
        };

        let status = if self.fail_next > 0 {
            self.fail_next -= 1;
            SlotStatus::Error
        } else {
            SlotStatus::Completed
        };

        debug!(
            "software queue: {:?} packet ({} payload words, {} data bytes) -> {}",
            packet.opcode(),
            packet.payload().len(),
            data.len(),
            slot
        );

        self.inflight.insert(
            slot,
            Inflight {
                retire_at: Instant::now() + self.latency,
                status,
            },
        );
        Ok(slot)
    }

    fn poll(&mut self) -> Vec<(SlotId, SlotStatus)> {
        let now = Instant::now();
        let retired: Vec<SlotId> = self
            .inflight
            .iter()
            .filter(|(_, inflight)| inflight.retire_at <= now)
            .map(|(slot, _)| *slot)
            .collect();

        let mut completions = Vec::with_capacity(retired.len());
        for slot in retired {
            let inflight = self.inflight.remove(&slot).unwrap();
            completions.push((slot, inflight.status));
        }
        // Stable order keeps logs readable
        completions.sort_by_key(|(slot, _)| *slot);
        completions
    }
}
