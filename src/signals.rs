//! Shared run signals: the fault flag (killswitch) every worker polls, the
//! completion flag raised by the download coordinator, and the supervisor
//! that turns a worker's failure into a raised fault flag.

use anyhow::Result;
use log::error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A boolean that only ever moves from `false` to `true`.
#[derive(Debug, Clone, Default)]
struct Latch(Arc<AtomicBool>);

impl Latch {
    fn raise(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Raised by whichever worker hits an unrecoverable error. Every worker in
/// both pools checks it once per loop iteration and winds down when it is set.
#[derive(Debug, Clone, Default)]
pub struct FaultFlag(Latch);

impl FaultFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` for the caller that actually flipped the flag.
    pub fn raise(&self) -> bool {
        self.0.raise()
    }

    pub fn is_raised(&self) -> bool {
        self.0.is_raised()
    }
}

/// Set once by the download coordinator after its URL queue is fully drained.
/// Everything pushed to the handoff queue before the flag is raised is
/// visible to a consumer that observes it.
#[derive(Debug, Clone, Default)]
pub struct CompletionFlag(Latch);

impl CompletionFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_complete(&self) {
        self.0.raise();
    }

    pub fn is_complete(&self) -> bool {
        self.0.is_raised()
    }
}

/// Runs a worker entry point, catching both returned errors and panics. On
/// failure the full error chain is logged and the fault flag is raised so the
/// other workers shut down; nothing propagates to the caller.
///
/// Returns `true` when the worker finished cleanly.
pub fn supervise<F>(worker_name: &str, fault: &FaultFlag, entry: F) -> bool
where
    F: FnOnce() -> Result<()>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(entry));
    let failure = match outcome {
        Ok(Ok(())) => return true,
        Ok(Err(e)) => format!("{:#}", e),
        Err(payload) => panic_message(payload.as_ref()),
    };

    error!("{} failed: {}", worker_name, failure);
    if fault.raise() {
        error!("Fault flag raised by {}. Stopping all workers.", worker_name);
    }
    false
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked with a non-string payload".to_string()
    }
}
