//! Execution context access for the thread that raised the current event.
//!
//! The event loop captures the registers once per event and writes them back
//! once, right before the event is continued. Everything in between (the
//! exception dispatcher, operator commands) works on the in-memory copy.

use crate::debug::DebugBackend;

pub use crate::debug::types::{ThreadContext, TRAP_FLAG};

use super::debugger::DebugError;

/// Read the full register state of `tid`
pub fn capture(backend: &mut dyn DebugBackend, tid: u32) -> Result<ThreadContext, DebugError> {
    let context = backend.get_context(tid)?;
    log::trace!("Captured context of thread {}: rip={:#x}", tid, context.rip);
    Ok(context)
}

/// Write a (possibly modified) register state back to `tid`
pub fn write_back(
    backend: &mut dyn DebugBackend,
    tid: u32,
    context: &ThreadContext,
) -> Result<(), DebugError> {
    backend.set_context(tid, context)?;
    log::trace!(
        "Wrote back context of thread {}: rip={:#x} tf={}",
        tid,
        context.rip,
        context.trap_flag()
    );
    Ok(())
}
