//! Non-interactive runner
//!
//! Drives a session through the programmatic surface: place the requested
//! breakpoints at the first stop, then print the context at every stop and
//! continue until the target exits or the stop budget is spent.

use std::io::Write;

use anyhow::Result;

use crate::app::CommandRouter;
use crate::core::debugger::{DebugError, Session};
use crate::debug::types::DebugStatus;

#[derive(Debug, Clone, Default)]
pub struct BatchPlan {
    /// Placed at the first stop
    pub breakpoints: Vec<u64>,
    /// Give up after this many stops; `None` runs to completion
    pub max_stops: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub stops: usize,
    /// The target exited on its own
    pub exited: bool,
}

pub fn run_batch<W: Write>(mut session: Session, plan: &BatchPlan, out: W) -> Result<BatchSummary> {
    let mut router = CommandRouter::new(out);
    let mut stops = 0;
    let mut pending = plan.breakpoints.as_slice();

    let exited = loop {
        if session.wait_until_suspended() != DebugStatus::Suspended {
            break true;
        }
        stops += 1;

        for &address in pending {
            match session.add_breakpoint(address) {
                Ok(()) => log::info!("Breakpoint set at {:#x}", address),
                Err(e) => log::warn!("Cannot set breakpoint at {:#x}: {}", address, e),
            }
        }
        pending = &[];

        router.show_context(&session)?;

        if plan.max_stops.is_some_and(|max| stops >= max) {
            log::info!("Stop budget of {} reached", stops);
            break false;
        }

        match session.continue_execution() {
            Ok(()) => {}
            Err(DebugError::NotSuspended) => break true,
            Err(e) => return Err(e.into()),
        }
    };

    if !pending.is_empty() {
        log::warn!(
            "Target never stopped; {} breakpoint(s) not placed",
            pending.len()
        );
    }

    session.exit_session()?;
    Ok(BatchSummary { stops, exited })
}
