//! Queue backend abstraction
//!
//! The dispatcher drives hardware through this trait and nothing else — it
//! is the single point where the runtime crosses into driver territory.
//! The contract is deliberately small: write a framed packet into a free
//! ring slot (or report exhaustion), and drain completion records.

use crate::error::{Result, RuntimeError};
use kestrel_ring::{CommandPacket, SlotId, SlotStatus};
use std::fmt::Debug;
use std::time::Duration;

/// Command queue backend — the firmware/driver boundary
///
/// Implementations track their own free-slot accounting; the dispatcher
/// never assumes a particular ring geometry.
pub trait QueueBackend: Debug + Send {
    /// Number of submission slots in the ring
    fn slot_count(&self) -> usize;

    /// Write a packet into a free slot
    ///
    /// `data` carries bulk payload bytes that ride alongside the packet
    /// (the source buffer of a copy command); it is empty for other kinds.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when every slot is occupied — the caller
    /// holds the command pending and retries when a slot frees. Transport
    /// failures surface as `Io`.
    fn submit(&mut self, packet: &CommandPacket, data: &[u8]) -> Result<SlotId>;

    /// Drain completion records
    ///
    /// Non-blocking; returns an empty vector when nothing retired since the
    /// last call. Each returned slot is free for reuse afterwards.
    fn poll(&mut self) -> Vec<(SlotId, SlotStatus)>;
}

/// Backend selection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSelection {
    /// Probe the character device, fall back to the software queue
    Auto,

    /// Force the `/dev/kestrel*` character device transport
    CharDev,

    /// Force the in-process software queue (no hardware required)
    Software,
}

/// Queue construction parameters
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ring slot count (software queue; the device reports its own)
    pub slot_count: usize,
    /// Simulated execution latency per command (software queue only)
    pub latency: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            slot_count: 16,
            latency: Duration::ZERO,
        }
    }
}

/// Select and open a queue backend for a device target
///
/// # Errors
///
/// Returns `QueueUnavailable` if the forced backend cannot be opened for
/// the given target.
pub fn select_queue(
    selection: QueueSelection,
    target: &str,
    config: &QueueConfig,
) -> Result<Box<dyn QueueBackend>> {
    use crate::backends::chardev::CharDevQueue;
    use crate::backends::software::SoftwareQueue;

    match selection {
        QueueSelection::Auto => {
            match CharDevQueue::open(target) {
                Ok(queue) => {
                    tracing::info!("Using character device queue for {target}");
                    return Ok(Box::new(queue));
                }
                Err(e) => {
                    tracing::debug!("Character device unavailable for {target}: {e}");
                }
            }

            tracing::info!("Falling back to software queue for {target}");
            Ok(Box::new(
                SoftwareQueue::new(config.slot_count).with_latency(config.latency),
            ))
        }

        QueueSelection::CharDev => CharDevQueue::open(target)
            .map(|q| Box::new(q) as Box<dyn QueueBackend>)
            .map_err(|e| {
                tracing::warn!("Character device queue failed for {target}: {e}");
                RuntimeError::QueueUnavailable {
                    target: target.to_string(),
                }
            }),

        QueueSelection::Software => Ok(Box::new(
            SoftwareQueue::new(config.slot_count).with_latency(config.latency),
        )),
    }
}
