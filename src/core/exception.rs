//! Exception classification and dispatch
//!
//! Resuming from a software breakpoint is a three step dance: put the stolen
//! byte back, execute the original instruction under the trap flag, then
//! re-arm the breakpoint from the single-step exception that follows. The
//! breakpoint and single-step handlers are tied together by [`LastException`].

use crate::debug::types::{ContinueStatus, ExceptionInfo, ExceptionKind, ThreadContext};

use super::breakpoint::{BreakpointManager, TRAP_WIDTH};
use super::notice::Notice;

/// The most recently serviced exception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastException {
    pub kind: ExceptionKind,
    pub address: u64,
    pub was_one_hit: bool,
}

/// Outcome of dispatching one exception
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub status: ContinueStatus,
    /// The exception was internal bookkeeping and must not stop the target
    pub bypass_halt: bool,
    pub notices: Vec<Notice>,
}

impl Dispatch {
    fn new(status: ContinueStatus) -> Self {
        Self {
            status,
            bypass_halt: false,
            notices: Vec::new(),
        }
    }

    fn notice(mut self, notice: Notice) -> Self {
        self.notices.push(notice);
        self
    }
}

/// Breakpoint / single-step state machine
#[derive(Debug, Default)]
pub struct ExceptionDispatcher {
    last: Option<LastException>,
    step_requested: bool,
}

impl ExceptionDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&LastException> {
        self.last.as_ref()
    }

    /// The operator asked for a single step; the next single-step exception
    /// surfaces even if it also re-arms a breakpoint.
    pub fn request_step(&mut self) {
        self.step_requested = true;
    }

    pub fn step_requested(&self) -> bool {
        self.step_requested
    }

    /// Forget everything about previous exceptions
    pub fn reset(&mut self) {
        self.last = None;
        self.step_requested = false;
    }

    /// Whether the thread stopped at `address` still owes a re-arm single step
    pub fn rearm_pending_at(&self, address: u64) -> bool {
        matches!(
            self.last,
            Some(LastException {
                kind: ExceptionKind::Breakpoint,
                address: a,
                was_one_hit: false,
            }) if a == address
        )
    }

    pub fn dispatch(
        &mut self,
        info: &ExceptionInfo,
        context: Option<&mut ThreadContext>,
        breakpoints: &mut BreakpointManager,
    ) -> Dispatch {
        match info.kind {
            ExceptionKind::Breakpoint => self.on_breakpoint(info.address, context, breakpoints),
            ExceptionKind::SingleStep => self.on_single_step(info.address, context, breakpoints),
            ExceptionKind::AccessViolation
            | ExceptionKind::DivideByZero
            | ExceptionKind::PrivilegedInstruction => self.on_fault(info),
            ExceptionKind::Other(_) => {
                self.record(info.kind, info.address, false);
                Dispatch::new(ContinueStatus::NotHandled).notice(Notice::unknown(format!(
                    "Not implemented exception yet: {:#010x} at {:#018x}",
                    info.kind.code(),
                    info.address
                )))
            }
        }
    }

    fn record(&mut self, kind: ExceptionKind, address: u64, was_one_hit: bool) {
        self.last = Some(LastException {
            kind,
            address,
            was_one_hit,
        });
    }

    fn on_fault(&mut self, info: &ExceptionInfo) -> Dispatch {
        self.record(info.kind, info.address, false);
        let chance = if info.first_chance { "First" } else { "Last" };
        Dispatch::new(ContinueStatus::NotHandled).notice(Notice::error(format!(
            "{} chance exception: {} ({:#010x}) at {:#018x}",
            chance,
            info.kind,
            info.kind.code(),
            info.address
        )))
    }

    fn on_breakpoint(
        &mut self,
        address: u64,
        context: Option<&mut ThreadContext>,
        breakpoints: &mut BreakpointManager,
    ) -> Dispatch {
        let dispatch = Dispatch::new(ContinueStatus::Continue);

        let one_hit = match breakpoints.find(address) {
            Some(bp) if bp.is_software() => bp.one_hit,
            _ => {
                self.record(ExceptionKind::Breakpoint, address, false);
                return dispatch.notice(Notice::info(format!(
                    "System breakpoint reached at {:#018x}",
                    address
                )));
            }
        };

        // Without registers the instruction pointer cannot be rolled back.
        // Nothing is touched: the trap stays armed and the thread resumes
        // one byte past it.
        let Some(context) = context else {
            self.record(ExceptionKind::Breakpoint, address, false);
            return dispatch.notice(Notice::error(format!(
                "Breakpoint at {:#018x} hit but the thread context is unavailable",
                address
            )));
        };

        let hits = breakpoints.record_hit(address).unwrap_or_default();
        if let Err(e) = breakpoints.restore(address) {
            self.record(ExceptionKind::Breakpoint, address, false);
            return dispatch.notice(Notice::error(format!("Cannot restore stolen byte: {}", e)));
        }

        // int3 already executed, re-execute the original instruction
        context.rip = context.rip.wrapping_sub(TRAP_WIDTH);
        if context.rip != address {
            log::warn!(
                "Rolled back rip {:#x} does not match trap address {:#x}",
                context.rip,
                address
            );
            context.rip = address;
        }

        let dispatch = if one_hit {
            match breakpoints.delete_by_address(address) {
                Ok(_) => dispatch,
                Err(e) => dispatch.notice(Notice::error(format!(
                    "Cannot discard one-hit breakpoint at {:#x}: {}",
                    address, e
                ))),
            }
        } else {
            context.set_trap_flag(true);
            dispatch
        };

        self.record(ExceptionKind::Breakpoint, address, one_hit);

        if one_hit {
            dispatch.notice(Notice::info(format!("Step reached {:#018x}", address)))
        } else {
            dispatch.notice(Notice::info(format!(
                "User breakpoint reached at {:#018x} (hit {})",
                address, hits
            )))
        }
    }

    fn on_single_step(
        &mut self,
        address: u64,
        context: Option<&mut ThreadContext>,
        breakpoints: &mut BreakpointManager,
    ) -> Dispatch {
        let mut dispatch = Dispatch::new(ContinueStatus::Continue);
        let operator_step = std::mem::take(&mut self.step_requested);

        let rearm_address = match self.last {
            Some(LastException {
                kind: ExceptionKind::Breakpoint,
                address: last_address,
                ..
            }) => breakpoints
                .find(last_address)
                .filter(|bp| bp.is_software() && !bp.one_hit)
                .map(|bp| bp.address),
            _ => None,
        };

        let mut was_one_hit = false;
        match rearm_address {
            Some(bp_address) => {
                if let Err(e) = breakpoints.rearm(bp_address) {
                    dispatch = dispatch.notice(Notice::error(format!(
                        "Cannot re-arm breakpoint at {:#x}: {}",
                        bp_address, e
                    )));
                }
                if let Some(context) = context {
                    context.set_trap_flag(false);
                }
                if operator_step {
                    dispatch = dispatch.notice(Notice::info(format!(
                        "Single step at {:#018x}",
                        address
                    )));
                } else {
                    log::debug!("Breakpoint at {:#x} re-armed", bp_address);
                    dispatch.bypass_halt = true;
                }
            }
            None => {
                was_one_hit = true;
                dispatch = dispatch.notice(Notice::info(format!(
                    "Single step at {:#018x}",
                    address
                )));
            }
        }

        self.record(ExceptionKind::SingleStep, address, was_one_hit);
        dispatch
    }
}
