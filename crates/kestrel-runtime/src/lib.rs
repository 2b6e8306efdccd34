//! Host command-queue runtime for Kestrel reconfigurable accelerator cards.
//!
//! This crate is the dispatch and completion engine that sits between API
//! shims (OpenCL/HIP-style entry points) and the kernel driver. Host
//! threads hand it asynchronous commands; it orders them per stream,
//! resolves dependencies between streams, pushes ready work into the
//! device submission ring, and wakes every waiter when commands retire.
//!
//! # Queue backend hierarchy
//!
//! ```text
//! Primary (kernel module loaded):
//!   CharDevQueue — packet transport over /dev/kestrel*
//!
//! Development / CI (no hardware required):
//!   SoftwareQueue — in-process simulated ring with fault injection
//! ```
//!
//! # Quick start
//!
//! ```
//! use kestrel_runtime::{Command, ContextConfig, Event, Runtime};
//! use std::time::Duration;
//!
//! # fn main() -> kestrel_runtime::Result<()> {
//! let rt = Runtime::new();
//! let ctx = rt.register_context(0, &ContextConfig::software(16, Duration::ZERO))?;
//!
//! let stream = rt.stream(rt.create_stream(ctx)?)?;
//! let launch = Command::kernel("scale", bytes::Bytes::from_static(&[1, 0, 0, 0]));
//! stream.enqueue(&launch)?;
//!
//! let done = Event::new();
//! done.record(&stream)?;
//! done.synchronize()?;
//! assert!(launch.is_complete());
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency model
//!
//! Any host thread may enqueue to any stream; one background poller per
//! hardware queue drains completions. Within a stream, commands complete
//! in enqueue order; across streams, ordering exists only where an
//! [`Event`] ties them. All blocking waits are condvar-based. There is no
//! mid-flight cancellation — context teardown ([`HwContext::raise_fatal`])
//! is the only abort path, and it errors every outstanding command rather
//! than leaving waiters hanging.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]

pub mod backends;
mod command;
mod context;
mod dispatch;
mod error;
mod event;
mod handle;
mod profile;
mod queue;
mod runtime;
mod stream;

pub use backends::{CharDevQueue, SoftwareQueue};
pub use command::{Command, CommandKind, CommandState, CopyDescriptor, KernelLaunch};
pub use context::{ContextConfig, Device, HwContext};
pub use dispatch::Dispatcher;
pub use error::{Result, RuntimeError};
pub use event::Event;
pub use handle::{Handle, HandleTable};
pub use profile::ProfileListener;
pub use queue::{select_queue, QueueBackend, QueueConfig, QueueSelection};
pub use runtime::Runtime;
pub use stream::{Stream, StreamKind};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        Command, CommandState, ContextConfig, Event, Handle, HwContext, Result, Runtime,
        RuntimeError, Stream, StreamKind,
    };
}
