//! Process-wide cooperative stop signal.
//!
//! Signal handlers and cross-thread requesters set the flag; the
//! execution loop converts it into the per-vCPU exit request at the
//! top of every dispatch iteration. Requesters that cannot yet see the
//! published running vCPU rely on this flag alone.

use std::sync::atomic::{AtomicBool, Ordering};

static EXIT_REQUEST: AtomicBool = AtomicBool::new(false);

/// Ask the running vCPU to leave its execution loop. Async-signal-safe:
/// a single atomic store.
pub fn request_exit() {
    EXIT_REQUEST.store(true, Ordering::SeqCst);
}

/// Whether a stop has been requested and not yet acknowledged.
pub fn pending() -> bool {
    EXIT_REQUEST.load(Ordering::SeqCst)
}

/// Acknowledge the request. Called by whoever resumes the vCPU.
pub fn reset() {
    EXIT_REQUEST.store(false, Ordering::SeqCst);
}
