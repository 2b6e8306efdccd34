//! Character device queue backend
//!
//! Packet transport over the `/dev/kestrel*` nodes exposed by the kernel
//! module. The wire protocol is deliberately dumb: the host writes one
//! framed packet (header word, payload words, then any bulk data) per
//! `submit`, the driver answers with a 4-byte slot acknowledgement, and
//! completion records are drained as 8-byte `(slot, status)` pairs from
//! the same node. A full ring surfaces as `EAGAIN` on the submit write.
//!
//! Everything here is plain fd I/O via `rustix`; no ioctls, no mmap.

use crate::error::{Result, RuntimeError};
use crate::queue::QueueBackend;
use kestrel_ring::{CommandPacket, SlotId, SlotStatus};
use rustix::fs::OFlags;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Completion record size on the wire: slot word + status word
const COMPLETION_RECORD_BYTES: usize = 8;

/// Queue backend speaking to a `/dev/kestrel*` node
#[derive(Debug)]
pub struct CharDevQueue {
    path: PathBuf,
    file: File,
    slot_count: usize,
}

impl CharDevQueue {
    /// Open a queue on a device node
    ///
    /// `target` is either a device path (`/dev/kestrel0`) or a bare index
    /// (`0`). The driver's 8-byte hello (magic, slot count) is consumed
    /// during open.
    ///
    /// # Errors
    ///
    /// Returns an error if the node does not exist, cannot be opened, or
    /// answers with a malformed hello.
    pub fn open(target: &str) -> Result<Self> {
        let path = if target.starts_with("/dev/") {
            PathBuf::from(target)
        } else {
            PathBuf::from(format!("/dev/kestrel{target}"))
        };

        if !path.exists() {
            return Err(RuntimeError::QueueUnavailable {
                target: path.display().to_string(),
            });
        }

        // SAFETY-free flag plumbing: OFlags bits are small positive values
        #[allow(clippy::cast_possible_wrap)]
        let nonblock_flag = OFlags::NONBLOCK.bits() as i32;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(nonblock_flag)
            .open(&path)?;

        let slot_count = Self::read_hello(&file, &path)?;

        info!(
            "Opened command queue {} ({} slots)",
            path.display(),
            slot_count
        );

        Ok(Self {
            path,
            file,
            slot_count,
        })
    }

    /// Device node this queue is bound to
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_hello(file: &File, path: &Path) -> Result<usize> {
        let mut hello = [0u8; 8];
        let n = rustix::io::read(file.as_fd(), &mut hello).map_err(std::io::Error::from)?;
        if n != hello.len() {
            return Err(RuntimeError::QueueUnavailable {
                target: format!("{}: short hello ({n} bytes)", path.display()),
            });
        }

        let magic = u32::from_le_bytes(hello[0..4].try_into().unwrap_or_default());
        let slots = u32::from_le_bytes(hello[4..8].try_into().unwrap_or_default());
        // 'KSL1' little-endian
        if magic != 0x314C_534B || slots == 0 {
            return Err(RuntimeError::QueueUnavailable {
                target: format!("{}: bad hello magic {magic:#x}", path.display()),
            });
        }
        Ok(slots as usize)
    }
}

impl QueueBackend for CharDevQueue {
    fn slot_count(&self) -> usize {
        self.slot_count
    }

    fn submit(&mut self, packet: &CommandPacket, data: &[u8]) -> Result<SlotId> {
        let words = packet.to_words();
        let mut frame: Vec<u8> = Vec::with_capacity(words.len() * 4 + data.len());
        frame.extend_from_slice(bytemuck::cast_slice::<u32, u8>(&words));
        frame.extend_from_slice(data);

        match rustix::io::write(self.file.as_fd(), &frame) {
            Ok(n) if n == frame.len() => {}
            Ok(n) => {
                return Err(RuntimeError::Io {
                    source: std::io::Error::other(format!(
                        "short packet write: {n} of {} bytes",
                        frame.len()
                    )),
                })
            }
            Err(e) if e == rustix::io::Errno::AGAIN || e == rustix::io::Errno::NOSPC => {
                return Err(RuntimeError::exhausted("command slots"))
            }
            Err(e) => return Err(std::io::Error::from(e).into()),
        }

        // The driver acks each accepted packet with the slot it landed in
        let mut ack = [0u8; 4];
        let n = rustix::io::read(self.file.as_fd(), &mut ack).map_err(std::io::Error::from)?;
        if n != ack.len() {
            return Err(RuntimeError::Io {
                source: std::io::Error::other(format!("short slot ack: {n} bytes")),
            });
        }

        let slot = SlotId::new(u32::from_le_bytes(ack));
        debug!("{}: packet accepted into {}", self.path.display(), slot);
        Ok(slot)
    }

    fn poll(&mut self) -> Vec<(SlotId, SlotStatus)> {
        let mut completions = Vec::new();
        let mut record = [0u8; COMPLETION_RECORD_BYTES];

        loop {
            match rustix::io::read(self.file.as_fd(), &mut record) {
                Ok(n) if n == COMPLETION_RECORD_BYTES => {
                    let slot = u32::from_le_bytes(record[0..4].try_into().unwrap_or_default());
                    let word = u32::from_le_bytes(record[4..8].try_into().unwrap_or_default());
                    match SlotStatus::from_word(word) {
                        Some(status) => completions.push((SlotId::new(slot), status)),
                        None => {
                            tracing::warn!(
                                "{}: dropping completion with unknown status {word:#x}",
                                self.path.display()
                            );
                        }
                    }
                }
                Ok(_) => break,
                Err(e) if e == rustix::io::Errno::AGAIN => break,
                Err(e) => {
                    tracing::warn!("{}: completion read failed: {e}", self.path.display());
                    break;
                }
            }
        }

        completions
    }
}
