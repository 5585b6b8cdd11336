//! Rendezvous between the event loop thread and the command thread.
//!
//! The loop raises a halt and parks until a resume is requested; the command
//! thread parks until a halt is raised. Both signals reset automatically when
//! consumed. Process exit releases every waiter.

use std::sync::{Condvar, Mutex, MutexGuard};

use crate::debug::types::DebugStatus;

#[derive(Debug, Default)]
struct Signals {
    status: DebugStatus,
    halt_pending: bool,
    resume_pending: bool,
}

#[derive(Debug, Default)]
pub struct Handshake {
    signals: Mutex<Signals>,
    cond: Condvar,
}

impl Handshake {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Signals> {
        // A panicking holder cannot leave the flags half-written
        self.signals.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait_while<'a>(
        &self,
        guard: MutexGuard<'a, Signals>,
        condition: impl FnMut(&mut Signals) -> bool,
    ) -> MutexGuard<'a, Signals> {
        self.cond
            .wait_while(guard, condition)
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> DebugStatus {
        self.lock().status
    }

    /// Loop thread: the target is suspended; block until a resume is requested.
    pub fn halt_and_wait(&self) {
        let mut signals = self.lock();
        signals.status = DebugStatus::Suspended;
        signals.halt_pending = true;
        self.cond.notify_all();

        let mut signals = self.wait_while(signals, |s| {
            !s.resume_pending && s.status != DebugStatus::Exited
        });
        signals.resume_pending = false;
        signals.halt_pending = false;
        if signals.status == DebugStatus::Suspended {
            signals.status = DebugStatus::Running;
        }
    }

    /// Command thread: block until the loop halts or the process is gone.
    /// Consumes the halt signal.
    pub fn wait_for_halt(&self) -> DebugStatus {
        let signals = self.lock();
        let mut signals = self.wait_while(signals, |s| {
            !s.halt_pending && s.status != DebugStatus::Exited
        });
        signals.halt_pending = false;
        signals.status
    }

    /// Block until the target is suspended or gone, without consuming anything.
    /// Returns at once when no target was ever started.
    pub fn wait_until_suspended(&self) -> DebugStatus {
        let signals = self.lock();
        let signals = self.wait_while(signals, |s| s.status == DebugStatus::Running);
        signals.status
    }

    /// Let the suspended loop continue the target. Returns `false` when the
    /// target is not suspended.
    pub fn request_resume(&self) -> bool {
        let mut signals = self.lock();
        if signals.status != DebugStatus::Suspended {
            return false;
        }
        signals.resume_pending = true;
        signals.status = DebugStatus::Running;
        self.cond.notify_all();
        true
    }

    /// A fresh loop is about to run; drop stale signals.
    pub fn mark_running(&self) {
        let mut signals = self.lock();
        *signals = Signals {
            status: DebugStatus::Running,
            ..Signals::default()
        };
        self.cond.notify_all();
    }

    /// The debugged process is gone; wake everybody.
    pub fn mark_exited(&self) {
        let mut signals = self.lock();
        signals.status = DebugStatus::Exited;
        signals.halt_pending = false;
        signals.resume_pending = false;
        self.cond.notify_all();
    }
}
