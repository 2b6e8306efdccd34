//! Queue backend implementations
//!
//! Two backends available:
//! - **CharDev**: packet transport over `/dev/kestrel*` (requires the
//!   kernel module; the real submission path)
//! - **Software**: in-process simulated ring (no hardware; CI, fault
//!   injection, and cross-checking against hardware runs)

pub mod chardev;
pub mod software;

pub use chardev::CharDevQueue;
pub use software::SoftwareQueue;
