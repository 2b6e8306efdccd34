//! Profiling hooks at command state transitions
//!
//! Trace/profiling layers can observe every command lifecycle transition by
//! installing a [`ProfileListener`] on a device before contexts are created.
//! When no listener is installed the hot path pays a single `Option` branch.

use crate::command::CommandState;
use std::sync::Arc;

/// Observer of command lifecycle transitions
///
/// Implementations must be cheap and non-blocking; they run on enqueue,
/// dispatch, and completion paths.
pub trait ProfileListener: Send + Sync {
    /// Called after a command transitions into `state`
    fn on_transition(&self, uid: u64, kind: &'static str, state: CommandState);
}

/// Shared listener slot stored on contexts and copied into commands
pub type ListenerRef = Option<Arc<dyn ProfileListener>>;

/// Notify a listener if one is installed
#[inline]
pub(crate) fn notify(listener: &ListenerRef, uid: u64, kind: &'static str, state: CommandState) {
    if let Some(l) = listener {
        l.on_transition(uid, kind, state);
    }
}
