//! Linux debugging backend over ptrace (x86_64).
//!
//! Signal stops are translated into the same event model the Windows debug
//! API produces: the exec stop becomes process creation, `SIGTRAP` becomes a
//! breakpoint or single-step exception, fault signals become exceptions.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use goblin::elf::{header::ET_DYN, program_header::PT_LOAD, Elf};
use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{execv, fork, ForkResult, Pid};

use crate::core::debugger::DebugError;
use crate::core::memory::{parse_proc_maps, MemoryAccess, ProcessMemory};
use crate::debug::types::{
    ContinueStatus, DebugEvent, EventKind, ExceptionInfo, ExceptionKind, ProcessInfo,
    ThreadContext, TRAP_FLAG,
};
use crate::debug::DebugBackend;

/// `si_code` of a trap raised by the trap flag
const TRAP_TRACE: i32 = 2;

/// `si_code` of a trap raised by `int3`
const SI_KERNEL: i32 = 0x80;

/// Signals the target gets back silently; they are not faults
const PASS_THROUGH: [Signal; 4] = [
    Signal::SIGCHLD,
    Signal::SIGWINCH,
    Signal::SIGURG,
    Signal::SIGCONT,
];

pub struct LinuxBackend {
    pid: Option<Pid>,
    /// Exec stop not reported yet
    created: Option<ProcessInfo>,
    threads: BTreeSet<Pid>,
    /// Clone reported, initial stop of the new thread not seen yet
    starting: BTreeSet<Pid>,
    /// Resume with PTRACE_SINGLESTEP instead of PTRACE_CONT
    step_next: BTreeSet<Pid>,
    /// Resumed with PTRACE_SINGLESTEP
    stepping: BTreeSet<Pid>,
    /// Signal that raised the current exception, redelivered when not handled
    pending_signal: BTreeMap<Pid, Signal>,
    exited: bool,
}

impl LinuxBackend {
    pub fn new() -> Self {
        Self {
            pid: None,
            created: None,
            threads: BTreeSet::new(),
            starting: BTreeSet::new(),
            step_next: BTreeSet::new(),
            stepping: BTreeSet::new(),
            pending_signal: BTreeMap::new(),
            exited: false,
        }
    }

    fn event(&self, tid: Pid, kind: EventKind) -> DebugEvent {
        DebugEvent {
            pid: self.pid.map(|p| p.as_raw() as u32).unwrap_or_default(),
            tid: tid.as_raw() as u32,
            kind,
        }
    }

    fn rip(tid: Pid) -> Result<u64, DebugError> {
        ptrace::getregs(tid)
            .map(|regs| regs.rip)
            .map_err(|e| DebugError::ContextAccess {
                tid: tid.as_raw() as u32,
                reason: e.to_string(),
            })
    }

    fn resume(&mut self, tid: Pid, signal: Option<Signal>) -> Result<(), DebugError> {
        let result = if self.step_next.remove(&tid) {
            self.stepping.insert(tid);
            ptrace::step(tid, signal)
        } else {
            self.stepping.remove(&tid);
            ptrace::cont(tid, signal)
        };
        result.map_err(|e| DebugError::Continue(format!("thread {}: {}", tid, e)))
    }

    fn on_exit(&mut self, tid: Pid, exit_code: u32) -> Option<DebugEvent> {
        self.threads.remove(&tid);
        self.stepping.remove(&tid);
        self.step_next.remove(&tid);
        self.pending_signal.remove(&tid);

        if Some(tid) == self.pid {
            self.exited = true;
            Some(self.event(tid, EventKind::ProcessExited { exit_code }))
        } else {
            Some(self.event(
                tid,
                EventKind::ThreadExited {
                    thread_id: tid.as_raw() as u32,
                    exit_code,
                },
            ))
        }
    }

    /// Translate one wait status; `None` means keep waiting
    fn translate(&mut self, status: WaitStatus) -> Result<Option<DebugEvent>, DebugError> {
        match status {
            WaitStatus::Exited(tid, code) => Ok(self.on_exit(tid, code as u32)),
            WaitStatus::Signaled(tid, sig, _) => Ok(self.on_exit(tid, 128 + sig as u32)),

            WaitStatus::PtraceEvent(tid, _, event) if event == Event::PTRACE_EVENT_CLONE as i32 => {
                let child = ptrace::getevent(tid)
                    .map(|raw| Pid::from_raw(raw as i32))
                    .map_err(|e| DebugError::EventWait(format!("clone event: {}", e)))?;
                if !self.threads.contains(&child) {
                    self.starting.insert(child);
                }
                self.resume(tid, None)?;
                Ok(None)
            }
            WaitStatus::PtraceEvent(tid, _, _) => {
                self.resume(tid, None)?;
                Ok(None)
            }

            // first stop of a freshly cloned thread
            WaitStatus::Stopped(tid, Signal::SIGSTOP)
                if self.starting.remove(&tid) || !self.threads.contains(&tid) =>
            {
                self.threads.insert(tid);
                let start_address = Self::rip(tid).unwrap_or_default();
                Ok(Some(self.event(
                    tid,
                    EventKind::ThreadCreated {
                        thread_id: tid.as_raw() as u32,
                        start_address,
                    },
                )))
            }

            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                let rip = Self::rip(tid)?;
                let si_code = ptrace::getsiginfo(tid).map(|info| info.si_code).unwrap_or(0);
                let stepped = self.stepping.remove(&tid);

                let info = if si_code == TRAP_TRACE || (stepped && si_code != SI_KERNEL) {
                    ExceptionInfo {
                        kind: ExceptionKind::SingleStep,
                        address: rip,
                        first_chance: true,
                    }
                } else {
                    ExceptionInfo {
                        kind: ExceptionKind::Breakpoint,
                        address: rip.wrapping_sub(1),
                        first_chance: true,
                    }
                };
                self.pending_signal.insert(tid, Signal::SIGTRAP);
                Ok(Some(self.event(tid, EventKind::Exception(info))))
            }

            WaitStatus::Stopped(tid, sig) if PASS_THROUGH.contains(&sig) => {
                self.resume(tid, Some(sig))?;
                Ok(None)
            }

            WaitStatus::Stopped(tid, sig) => {
                self.stepping.remove(&tid);
                let kind = match sig {
                    Signal::SIGSEGV | Signal::SIGBUS => ExceptionKind::AccessViolation,
                    Signal::SIGFPE => ExceptionKind::DivideByZero,
                    Signal::SIGILL => ExceptionKind::PrivilegedInstruction,
                    other => ExceptionKind::Other(other as u32),
                };
                let address = Self::rip(tid).unwrap_or_default();
                self.pending_signal.insert(tid, sig);
                Ok(Some(self.event(
                    tid,
                    EventKind::Exception(ExceptionInfo {
                        kind,
                        address,
                        first_chance: true,
                    }),
                )))
            }

            WaitStatus::PtraceSyscall(_) | WaitStatus::Continued(_) | WaitStatus::StillAlive => {
                Ok(None)
            }
        }
    }
}

impl Default for LinuxBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Image name, load base and entry point of a process stopped at exec
fn image_info(pid: Pid) -> Result<ProcessInfo, DebugError> {
    let exe = std::fs::read_link(format!("/proc/{}/exe", pid))
        .map_err(|e| DebugError::Launch(format!("/proc/{}/exe: {}", pid, e)))?;
    let bytes = std::fs::read(&exe)
        .map_err(|e| DebugError::Launch(format!("{}: {}", exe.display(), e)))?;
    let elf = Elf::parse(&bytes)
        .map_err(|e| DebugError::Launch(format!("{}: {}", exe.display(), e)))?;

    let maps = std::fs::read_to_string(format!("/proc/{}/maps", pid))
        .map_err(|e| DebugError::Launch(format!("/proc/{}/maps: {}", pid, e)))?;
    let exe_name = exe.to_string_lossy();
    let mapped_base = parse_proc_maps(&maps)
        .iter()
        .filter(|r| r.name.as_deref() == Some(exe_name.as_ref()))
        .map(|r| r.base_address)
        .min();

    let lowest_vaddr = elf
        .program_headers
        .iter()
        .filter(|ph| ph.p_type == PT_LOAD)
        .map(|ph| ph.p_vaddr & !0xfff)
        .min()
        .unwrap_or(0);

    let (base_address, entry_point) = match mapped_base {
        Some(base) if elf.header.e_type == ET_DYN => {
            let bias = base.wrapping_sub(lowest_vaddr);
            (base, elf.entry.wrapping_add(bias))
        }
        Some(base) => (base, elf.entry),
        None => (lowest_vaddr, elf.entry),
    };

    Ok(ProcessInfo {
        pid: pid.as_raw() as u32,
        image_name: exe_name.into_owned(),
        base_address,
        entry_point,
    })
}

impl DebugBackend for LinuxBackend {
    fn launch(&mut self, path: &Path, args: &[String]) -> Result<Arc<dyn MemoryAccess>, DebugError> {
        if !path.exists() {
            return Err(DebugError::Launch(format!("{}: no such file", path.display())));
        }

        let program = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| DebugError::Launch(e.to_string()))?;
        let mut argv = vec![program.clone()];
        for arg in args {
            argv.push(CString::new(arg.as_bytes()).map_err(|e| DebugError::Launch(e.to_string()))?);
        }

        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = ptrace::traceme();
                let _ = execv(&program, &argv);
                unsafe { nix::libc::_exit(127) }
            }
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => return Err(DebugError::Launch(format!("fork: {}", e))),
        };

        match waitpid(child, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {}
            Ok(WaitStatus::Exited(_, code)) => {
                return Err(DebugError::Launch(format!(
                    "{} exited with code {} before it could be traced",
                    path.display(),
                    code
                )))
            }
            Ok(other) => {
                let _ = signal::kill(child, Signal::SIGKILL);
                return Err(DebugError::Launch(format!("unexpected stop {:?}", other)));
            }
            Err(e) => return Err(DebugError::Launch(format!("waitpid: {}", e))),
        }

        ptrace::setoptions(
            child,
            Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_EXITKILL,
        )
        .map_err(|e| DebugError::Launch(format!("ptrace options: {}", e)))?;

        let info = match image_info(child) {
            Ok(info) => info,
            Err(e) => {
                let _ = signal::kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
                return Err(e);
            }
        };
        log::info!(
            "Launched {} as pid {} (entry {:#x})",
            info.image_name,
            child,
            info.entry_point
        );

        self.pid = Some(child);
        self.created = Some(info);
        self.threads.insert(child);
        self.exited = false;

        Ok(Arc::new(ProcessMemory::new(child.as_raw() as u32)))
    }

    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError> {
        let Some(pid) = self.pid else {
            return Err(DebugError::EventWait("no process".into()));
        };
        if let Some(info) = self.created.take() {
            return Ok(self.event(pid, EventKind::ProcessCreated(info)));
        }

        loop {
            let status = waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL))
                .map_err(|e| DebugError::EventWait(e.to_string()))?;
            log::trace!("waitpid: {:?}", status);
            if let Some(event) = self.translate(status)? {
                return Ok(event);
            }
        }
    }

    fn continue_event(&mut self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError> {
        let tid = Pid::from_raw(event.tid as i32);
        match &event.kind {
            EventKind::ProcessExited { .. } | EventKind::ThreadExited { .. } => Ok(()),
            EventKind::Exception(_) => {
                let pending = self.pending_signal.remove(&tid);
                let signal = match status {
                    ContinueStatus::NotHandled => pending,
                    ContinueStatus::Continue => None,
                };
                self.resume(tid, signal)
            }
            _ => self.resume(tid, None),
        }
    }

    fn get_context(&mut self, tid: u32) -> Result<ThreadContext, DebugError> {
        let regs = ptrace::getregs(Pid::from_raw(tid as i32)).map_err(|e| {
            DebugError::ContextAccess {
                tid,
                reason: e.to_string(),
            }
        })?;

        Ok(ThreadContext {
            rax: regs.rax,
            rbx: regs.rbx,
            rcx: regs.rcx,
            rdx: regs.rdx,
            rsi: regs.rsi,
            rdi: regs.rdi,
            rbp: regs.rbp,
            rsp: regs.rsp,
            r8: regs.r8,
            r9: regs.r9,
            r10: regs.r10,
            r11: regs.r11,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
            rip: regs.rip,
            rflags: regs.eflags,
        })
    }

    fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<(), DebugError> {
        let pid = Pid::from_raw(tid as i32);
        let access = |e: nix::Error| DebugError::ContextAccess {
            tid,
            reason: e.to_string(),
        };
        let mut regs = ptrace::getregs(pid).map_err(access)?;

        regs.rax = context.rax;
        regs.rbx = context.rbx;
        regs.rcx = context.rcx;
        regs.rdx = context.rdx;
        regs.rsi = context.rsi;
        regs.rdi = context.rdi;
        regs.rbp = context.rbp;
        regs.rsp = context.rsp;
        regs.r8 = context.r8;
        regs.r9 = context.r9;
        regs.r10 = context.r10;
        regs.r11 = context.r11;
        regs.r12 = context.r12;
        regs.r13 = context.r13;
        regs.r14 = context.r14;
        regs.r15 = context.r15;
        regs.rip = context.rip;
        // The kernel owns TF for traced threads; ask for a single step instead
        regs.eflags = context.rflags & !TRAP_FLAG;

        if context.trap_flag() {
            self.step_next.insert(pid);
        } else {
            self.step_next.remove(&pid);
        }

        ptrace::setregs(pid, regs).map_err(access)
    }

    fn terminate(&mut self) -> Result<(), DebugError> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.exited {
            return Ok(());
        }

        signal::kill(pid, Signal::SIGKILL)
            .map_err(|e| DebugError::Continue(format!("kill {}: {}", pid, e)))?;
        // reap every traced thread so the pid is released
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(tid, _)) | Ok(WaitStatus::Signaled(tid, _, _))
                    if tid == pid =>
                {
                    break
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        self.exited = true;
        self.threads.clear();
        Ok(())
    }
}

impl Drop for LinuxBackend {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log::warn!("Failed to terminate target: {}", e);
        }
    }
}
