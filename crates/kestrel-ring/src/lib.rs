//! Submission-ring model for Kestrel K1 reconfigurable accelerator cards.
//!
//! This crate has **no dependencies** and **no hardware access** — it is a
//! pure model of the device-visible command queue: packet header layout,
//! opcodes, slot lifecycle states, and completion status codes. Both the
//! host runtime and the firmware share this vocabulary; the layout matches
//! what the K1 command processor reads out of its BAR-mapped ring.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`packet`] | Command packet header bit layout and payload framing |
//! | [`slot`] | Slot identifiers, slot lifecycle states, completion codes |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod packet;
pub mod slot;

pub use packet::{CommandPacket, Opcode, PacketHeader};
pub use slot::{SlotId, SlotState, SlotStatus};
