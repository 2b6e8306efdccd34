//! Command packet header layout and payload framing.
//!
//! Every submission-ring entry starts with a single 32-bit header word
//! followed by `payload_count` 32-bit payload words. The firmware command
//! processor reads the header, decodes the opcode, and interprets the
//! payload accordingly (register map for a kernel start, address pair for a
//! copy, nothing for a marker).
//!
//! ```text
//! header word
//!   [31:28]  reserved
//!   [27:23]  opcode
//!   [22:12]  payload word count (max 2047)
//!   [11:4]   reserved
//!   [3:0]    slot state nibble (owned by firmware once submitted)
//! ```

/// Command opcodes understood by the K1 command processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Start a compute kernel; payload is the kernel register map.
    StartKernel = 0,
    /// (Re)configure the command processor; payload is a config block.
    Configure = 1,
    /// Buffer copy; payload is `[src_lo, src_hi, dst_lo, dst_hi, len]`.
    CopyBuffer = 2,
    /// Pure synchronization marker; no payload.
    Marker = 3,
    /// Host-injected wait; never reaches hardware, resolved by the runtime.
    Wait = 4,
}

impl Opcode {
    /// Decode an opcode from its 5-bit field value.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(Self::StartKernel),
            1 => Some(Self::Configure),
            2 => Some(Self::CopyBuffer),
            3 => Some(Self::Marker),
            4 => Some(Self::Wait),
            _ => None,
        }
    }
}

/// Decoded view of a packet header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Command opcode.
    pub opcode: Opcode,
    /// Number of 32-bit payload words following the header.
    pub payload_count: u16,
}

impl PacketHeader {
    /// Maximum payload word count representable in the header field.
    pub const MAX_PAYLOAD_WORDS: usize = 0x7FF;

    /// Encode this header into its 32-bit wire form (state nibble zero).
    #[must_use]
    pub const fn encode(self) -> u32 {
        ((self.opcode as u32) << 23) | ((self.payload_count as u32 & 0x7FF) << 12)
    }

    /// Decode a header word. Returns `None` for an unknown opcode.
    #[must_use]
    pub const fn decode(word: u32) -> Option<Self> {
        let opcode = match Opcode::from_bits((word >> 23) & 0x1F) {
            Some(op) => op,
            None => return None,
        };
        Some(Self {
            opcode,
            payload_count: ((word >> 12) & 0x7FF) as u16,
        })
    }
}

/// A fully framed command packet: one header word plus payload words.
///
/// The host builds packets, the dispatcher writes them into a free ring
/// slot. Payload interpretation is opcode-specific; this type does not
/// validate payload contents beyond the size limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    header: PacketHeader,
    payload: Vec<u32>,
}

impl CommandPacket {
    /// Frame a packet from an opcode and payload words.
    ///
    /// Payloads longer than [`PacketHeader::MAX_PAYLOAD_WORDS`] are
    /// truncated to the representable maximum; the K1 ring slot is 8 KB so
    /// real payloads never get near the limit.
    #[must_use]
    pub fn new(opcode: Opcode, payload: Vec<u32>) -> Self {
        let mut payload = payload;
        payload.truncate(PacketHeader::MAX_PAYLOAD_WORDS);
        #[allow(clippy::cast_possible_truncation)]
        let header = PacketHeader {
            opcode,
            payload_count: payload.len() as u16,
        };
        Self { header, payload }
    }

    /// Header of this packet.
    #[must_use]
    pub const fn header(&self) -> PacketHeader {
        self.header
    }

    /// Opcode of this packet.
    #[must_use]
    pub const fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Payload words (without the header).
    #[must_use]
    pub fn payload(&self) -> &[u32] {
        &self.payload
    }

    /// Serialize into ring-order words: header first, then payload.
    #[must_use]
    pub fn to_words(&self) -> Vec<u32> {
        let mut words = Vec::with_capacity(1 + self.payload.len());
        words.push(self.header.encode());
        words.extend_from_slice(&self.payload);
        words
    }
}
