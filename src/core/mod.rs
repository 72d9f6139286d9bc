//! The reconciliation engine. Operates purely on in-memory state handed to it
//! by the caller; no file, database or console I/O happens below this module.

use std::time::Instant;

use scopeguard::ScopeGuard;
use tracing::debug;

pub mod observability;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod tracer;
pub mod walker;

/// Logs how long a phase took when the returned guard drops, error or not.
pub(crate) fn phase_timer(phase: &'static str) -> ScopeGuard<Instant, impl FnOnce(Instant)> {
    scopeguard::guard(Instant::now(), move |started| {
        debug!(phase, elapsed_ms = started.elapsed().as_millis() as u64, "phase finished");
    })
}
