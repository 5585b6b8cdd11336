//! Debugger - debug session and event loop
//!
//! A [`Session`] owns the event loop thread, the debugged process and all of
//! the per-process state. The loop thread drives the platform backend; the
//! command thread (interactive REPL or the programmatic surface) only acts
//! while the loop is parked in the [`Handshake`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::debug::types::{
    ContinueStatus, DebugEvent, DebugStatus, EventCategory, EventKind, ProcessInfo, ThreadContext,
};
use crate::debug::DebugBackend;
use crate::disasm::engine::{Bitness, DisasmEngine, DisasmError, DisassembledInstruction};

use super::breakpoint::{Breakpoint, BreakpointError, BreakpointManager};
use super::context;
use super::exception::ExceptionDispatcher;
use super::handshake::Handshake;
use super::memory::{MemoryAccess, MemoryError, MemoryMap, MemoryRegion};
use super::notice::Notice;

/// Longest x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

/// Upper bound for a single disassembly read
const MAX_DISASM_WINDOW: usize = 4096;

/// Upper bound for a single memory read
const MAX_READ_SIZE: usize = 1 << 20;

/// Debugger-specific errors
#[derive(Error, Debug, Clone)]
pub enum DebugError {
    #[error("Cannot start debugged process: {0}")]
    Launch(String),

    #[error("Waiting for debug event failed: {0}")]
    EventWait(String),

    #[error("Cannot access context of thread {tid}: {reason}")]
    ContextAccess { tid: u32, reason: String },

    #[error("Cannot continue debug event: {0}")]
    Continue(String),

    #[error("The target is not suspended")]
    NotSuspended,

    #[error("No thread context available")]
    NoContext,

    #[error("Debug loop thread panicked")]
    LoopPanicked,

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Breakpoint(#[from] BreakpointError),

    #[error(transparent)]
    Disasm(#[from] DisasmError),
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Image to launch
    pub target: PathBuf,
    /// Arguments passed to the image
    pub args: Vec<String>,
    /// Event categories that suspend the target and hand control to the operator
    pub interrupting: BTreeSet<EventCategory>,
    /// Place a breakpoint on the image entry point when the process is created
    pub break_on_entry: bool,
    /// Instructions shown below the registers when the context is displayed
    pub context_instructions: usize,
}

impl SessionConfig {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
            args: Vec::new(),
            interrupting: BTreeSet::from([EventCategory::Exception]),
            break_on_entry: true,
            context_instructions: 5,
        }
    }
}

/// Creates a fresh backend for every launch of the target
pub type BackendFactory = Arc<dyn Fn() -> Box<dyn DebugBackend> + Send + Sync>;

/// Receives operator-facing notices from the loop thread
pub type NoticeSink = Arc<dyn Fn(&Notice) + Send + Sync>;

/// Breakpoint selector used by delete operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointRef {
    Address(u64),
    Index(usize),
}

/// Per-process debugging state
///
/// Touched by the loop thread while the target runs and by the command thread
/// only while the target is suspended.
#[derive(Default)]
pub struct SessionState {
    pub process: Option<ProcessInfo>,
    pub memory: Option<Arc<dyn MemoryAccess>>,
    pub memory_map: MemoryMap,
    /// Loaded modules by base address
    pub modules: BTreeMap<u64, String>,
    /// Live threads and their start address
    pub threads: BTreeMap<u32, u64>,
    pub current_event: Option<DebugEvent>,
    /// Registers of the thread that raised the current event
    pub context: Option<ThreadContext>,
    pub breakpoints: BreakpointManager,
    pub exceptions: ExceptionDispatcher,
    /// Skip the next halt; set by internal single steps
    pub bypass_halt: bool,
    /// Cleared to make the loop stop debugging
    pub active: bool,
}

impl SessionState {
    fn attach(&mut self, memory: Arc<dyn MemoryAccess>) {
        self.breakpoints = BreakpointManager::new(memory.clone());
        self.memory = Some(memory);
        self.exceptions.reset();
    }

    fn teardown(&mut self) {
        self.memory = None;
        self.memory_map.clear();
        self.breakpoints = BreakpointManager::default();
        self.context = None;
        self.modules.clear();
        self.threads.clear();
    }

    pub fn memory(&self) -> Result<&Arc<dyn MemoryAccess>, MemoryError> {
        self.memory.as_ref().ok_or(MemoryError::NoProcess)
    }

    fn refresh_memory_map(&mut self) -> Result<usize, MemoryError> {
        let memory = self.memory()?.clone();
        self.memory_map.refresh(memory.as_ref())
    }
}

struct Shared {
    state: Mutex<SessionState>,
    handshake: Handshake,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One debugging session over one target image
pub struct Session {
    config: Arc<SessionConfig>,
    factory: BackendFactory,
    sink: NoticeSink,
    shared: Arc<Shared>,
    loop_thread: Option<JoinHandle<Result<(), DebugError>>>,
}

impl Session {
    pub fn new(config: SessionConfig, factory: BackendFactory) -> Self {
        Self {
            config: Arc::new(config),
            factory,
            sink: Arc::new(crate::ui::console::emit),
            shared: Arc::new(Shared {
                state: Mutex::new(SessionState::default()),
                handshake: Handshake::new(),
            }),
            loop_thread: None,
        }
    }

    /// Route notices somewhere other than the console
    pub fn with_sink(mut self, sink: NoticeSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn status(&self) -> DebugStatus {
        self.shared.handshake.status()
    }

    pub fn handshake(&self) -> &Handshake {
        &self.shared.handshake
    }

    /// Lock the per-process state
    pub fn state(&self) -> MutexGuard<'_, SessionState> {
        self.shared.state()
    }

    fn emit(&self, notice: Notice) {
        (self.sink)(&notice);
    }

    /// Launch the target and start the event loop thread
    pub fn start(&mut self) -> Result<(), DebugError> {
        if self.loop_thread.is_some() {
            self.stop()?;
        }

        {
            let mut state = self.shared.state();
            *state = SessionState::default();
            state.active = true;
        }
        self.shared.handshake.mark_running();

        let (launched_tx, launched_rx) = mpsc::channel();
        let event_loop = EventLoop {
            shared: self.shared.clone(),
            config: self.config.clone(),
            sink: self.sink.clone(),
            factory: self.factory.clone(),
        };

        let handle = thread::Builder::new()
            .name("debug-loop".into())
            .spawn(move || event_loop.run(launched_tx))
            .map_err(|e| DebugError::Launch(e.to_string()))?;

        match launched_rx.recv() {
            Ok(Ok(())) => {
                log::info!("Debugging {}", self.config.target.display());
                self.loop_thread = Some(handle);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                self.shared.handshake.mark_exited();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                self.shared.handshake.mark_exited();
                Err(DebugError::Launch("debug loop ended before launch".into()))
            }
        }
    }

    /// Stop debugging: terminate the target and join the loop thread
    pub fn stop(&mut self) -> Result<(), DebugError> {
        let Some(handle) = self.loop_thread.take() else {
            return Ok(());
        };

        self.shared.state().active = false;
        self.shared.handshake.request_resume();

        let result = handle.join().map_err(|_| DebugError::LoopPanicked)?;
        self.shared.handshake.mark_exited();
        result
    }

    /// Start the same image again
    pub fn restart(&mut self) -> Result<(), DebugError> {
        if matches!(self.status(), DebugStatus::Running | DebugStatus::Suspended) {
            self.emit(Notice::warning(
                "The program is being debugged, running it again",
            ));
        }
        if let Err(e) = self.stop() {
            log::warn!("Previous debug loop ended with: {}", e);
        }
        self.start()
    }

    fn ensure_suspended(&self) -> Result<(), DebugError> {
        match self.status() {
            DebugStatus::Suspended => Ok(()),
            _ => Err(DebugError::NotSuspended),
        }
    }

    /// Let the suspended target run
    pub fn resume(&self) -> Result<(), DebugError> {
        if self.shared.handshake.request_resume() {
            Ok(())
        } else {
            Err(DebugError::NotSuspended)
        }
    }

    /// Execute exactly one instruction and stop again
    pub fn step_into(&self) -> Result<(), DebugError> {
        self.ensure_suspended()?;
        {
            let mut state = self.state();
            let SessionState {
                context,
                exceptions,
                ..
            } = &mut *state;
            context.as_mut().ok_or(DebugError::NoContext)?.set_trap_flag(true);
            exceptions.request_step();
        }
        self.resume()
    }

    /// Run until the instruction following the current one, returning its address
    pub fn step_over(&self) -> Result<u64, DebugError> {
        self.ensure_suspended()?;
        let rip = self.context().ok_or(DebugError::NoContext)?.rip;
        let current = self
            .disassemble(rip, 1)?
            .into_iter()
            .next()
            .ok_or(DisasmError::NothingDecoded { address: rip })?;
        let next = rip + current.length as u64;

        match self.state().breakpoints.place(next, true) {
            Ok(()) => {}
            // an existing breakpoint stops there just as well
            Err(BreakpointError::AlreadyExists(_)) => {
                log::debug!("Step over target {:#x} already has a breakpoint", next)
            }
            Err(e) => return Err(e.into()),
        }

        self.resume()?;
        Ok(next)
    }

    pub fn place_breakpoint(&self, address: u64) -> Result<(), DebugError> {
        self.state().breakpoints.place(address, false)?;
        Ok(())
    }

    pub fn delete_breakpoint(&self, which: BreakpointRef) -> Result<Breakpoint, DebugError> {
        let mut state = self.state();
        let removed = match which {
            BreakpointRef::Address(address) => state.breakpoints.delete_by_address(address)?,
            BreakpointRef::Index(index) => state.breakpoints.delete_by_index(index)?,
        };

        // The thread may be parked on this breakpoint with the trap flag set
        // only to re-arm it; nothing is left to re-arm now.
        let SessionState {
            context,
            exceptions,
            ..
        } = &mut *state;
        if let Some(ctx) = context.as_mut() {
            if ctx.rip == removed.address
                && exceptions.rearm_pending_at(removed.address)
                && !exceptions.step_requested()
            {
                ctx.set_trap_flag(false);
            }
        }

        Ok(removed)
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.state().breakpoints.list()
    }

    pub fn context(&self) -> Option<ThreadContext> {
        self.state().context
    }

    pub fn process(&self) -> Option<ProcessInfo> {
        self.state().process.clone()
    }

    /// Read target memory as the program sees it (breakpoint bytes hidden)
    ///
    /// The read stops at the end of the known region holding `address` and
    /// never exceeds `MAX_READ_SIZE`, so the result may be shorter than `size`.
    pub fn read_memory(&self, address: u64, size: usize) -> Result<Vec<u8>, DebugError> {
        let state = self.state();
        let mut size = size.min(MAX_READ_SIZE);
        if let Some(region) = state.memory_map.find(address) {
            let left = region.end_address().saturating_sub(address);
            size = size.min(usize::try_from(left).unwrap_or(usize::MAX));
        }
        let mut bytes = state.memory()?.read(address, size)?;
        if bytes.is_empty() && size > 0 {
            return Err(MemoryError::ReadFailed {
                address,
                reason: "no bytes readable".into(),
            }
            .into());
        }
        state.breakpoints.patch_view(address, &mut bytes);
        Ok(bytes)
    }

    /// Decode up to `count` instructions starting at `address`
    pub fn disassemble(
        &self,
        address: u64,
        count: usize,
    ) -> Result<Vec<DisassembledInstruction>, DebugError> {
        let size = count
            .max(1)
            .saturating_mul(MAX_INSTRUCTION_LEN)
            .min(MAX_DISASM_WINDOW);
        let bytes = self.read_memory(address, size)?;

        let engine = DisasmEngine::new(Bitness::Bit64)?;
        Ok(engine.disassemble(&bytes, address, count)?)
    }

    /// Re-enumerate the target's memory regions
    pub fn refresh_regions(&self) -> Result<Vec<MemoryRegion>, DebugError> {
        let mut state = self.state();
        state.refresh_memory_map()?;
        Ok(state.memory_map.regions().to_vec())
    }

    // Programmatic surface: each call waits for the target to be suspended.

    /// Block until the target is suspended, has exited, or was never started
    pub fn wait_until_suspended(&self) -> DebugStatus {
        self.shared.handshake.wait_until_suspended()
    }

    fn wait_suspended(&self) -> Result<(), DebugError> {
        match self.wait_until_suspended() {
            DebugStatus::Suspended => Ok(()),
            _ => Err(DebugError::NotSuspended),
        }
    }

    pub fn add_breakpoint(&self, address: u64) -> Result<(), DebugError> {
        self.wait_suspended()?;
        self.place_breakpoint(address)
    }

    pub fn continue_execution(&self) -> Result<(), DebugError> {
        self.wait_suspended()?;
        self.resume()
    }

    pub fn exit_session(&mut self) -> Result<(), DebugError> {
        if self.loop_thread.is_none() {
            return Ok(());
        }
        self.wait_until_suspended();
        self.stop()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(handle) = self.loop_thread.take() else {
            return;
        };
        self.shared.state().active = false;
        self.shared.handshake.request_resume();
        // A loop blocked on the target stops at its next event
        if self.status() != DebugStatus::Running {
            let _ = handle.join();
        }
    }
}

/// The loop thread's half of the session
struct EventLoop {
    shared: Arc<Shared>,
    config: Arc<SessionConfig>,
    sink: NoticeSink,
    factory: BackendFactory,
}

impl EventLoop {
    fn emit(&self, notice: Notice) {
        (self.sink)(&notice);
    }

    fn run(self, launched: mpsc::Sender<Result<(), DebugError>>) -> Result<(), DebugError> {
        let mut backend = (self.factory)();

        let memory = match backend.launch(&self.config.target, &self.config.args) {
            Ok(memory) => memory,
            Err(e) => {
                let _ = launched.send(Err(e.clone()));
                return Err(e);
            }
        };
        self.shared.state().attach(memory);
        let _ = launched.send(Ok(()));

        let result = self.pump(backend.as_mut());
        if let Err(e) = &result {
            self.emit(Notice::error(e.to_string()));
            let _ = backend.terminate();
            self.shared.state().teardown();
            self.shared.handshake.mark_exited();
        }
        result
    }

    fn pump(&self, backend: &mut dyn DebugBackend) -> Result<(), DebugError> {
        loop {
            if !self.shared.state().active {
                log::info!("Debugging stopped, terminating target");
                if let Err(e) = backend.terminate() {
                    self.emit(Notice::error(e.to_string()));
                }
                self.shared.state().teardown();
                self.shared.handshake.mark_exited();
                return Ok(());
            }

            let event = backend.wait_for_event()?;
            log::debug!("Debug event: {:?}", event);

            let captured = if event.kind.has_live_thread() {
                match context::capture(backend, event.tid) {
                    Ok(ctx) => Some(ctx),
                    Err(e) => {
                        self.emit(Notice::error(e.to_string()));
                        None
                    }
                }
            } else {
                None
            };

            let (status, interrupt, notices) = self.handle(&event, captured);
            for notice in notices {
                self.emit(notice);
            }

            if interrupt {
                self.shared.handshake.halt_and_wait();
            }

            // Write-back and every byte patch for this event happen before the
            // target is allowed to run again.
            let context = self.shared.state().context.take();
            if let Some(ctx) = context {
                if let Err(e) = context::write_back(backend, event.tid, &ctx) {
                    self.emit(Notice::error(e.to_string()));
                }
            }

            backend.continue_event(&event, status)?;

            if matches!(event.kind, EventKind::ProcessExited { .. }) {
                return Ok(());
            }
        }
    }

    /// Update bookkeeping for one event; returns the disposition, whether the
    /// operator gets control, and the notices to print.
    fn handle(
        &self,
        event: &DebugEvent,
        captured: Option<ThreadContext>,
    ) -> (ContinueStatus, bool, Vec<Notice>) {
        let mut state = self.shared.state();
        state.current_event = Some(event.clone());
        state.context = captured;

        let mut notices = Vec::new();
        let status = match &event.kind {
            EventKind::ProcessCreated(info) => {
                notices.push(Notice::info(format!(
                    "{} loaded, base {:#018x} entrypoint {:#018x}",
                    info.image_name, info.base_address, info.entry_point
                )));
                state.process = Some(info.clone());
                state.threads.insert(event.tid, info.entry_point);

                if let Err(e) = state.refresh_memory_map() {
                    notices.push(Notice::warning(format!("Cannot read memory map: {}", e)));
                }
                if self.config.break_on_entry {
                    if let Err(e) = state.breakpoints.place(info.entry_point, false) {
                        notices.push(Notice::error(format!(
                            "Cannot place entry point breakpoint: {}",
                            e
                        )));
                    }
                }
                ContinueStatus::Continue
            }
            EventKind::ProcessExited { exit_code } => {
                notices.push(Notice::info(format!(
                    "Process {} exited with code {:#010x}",
                    event.pid, exit_code
                )));
                state.teardown();
                state.active = false;
                self.shared.handshake.mark_exited();
                ContinueStatus::Continue
            }
            EventKind::ThreadCreated {
                thread_id,
                start_address,
            } => {
                state.threads.insert(*thread_id, *start_address);
                notices.push(Notice::thread(format!(
                    "Thread {:#x} created with entry address {:#018x}",
                    thread_id, start_address
                )));
                ContinueStatus::Continue
            }
            EventKind::ThreadExited {
                thread_id,
                exit_code,
            } => {
                state.threads.remove(thread_id);
                notices.push(Notice::thread(format!(
                    "Thread {} exited with code {:#010x}",
                    thread_id, exit_code
                )));
                ContinueStatus::Continue
            }
            EventKind::ModuleLoaded { base_address, name } => {
                state.modules.insert(*base_address, name.clone());
                if let Err(e) = state.refresh_memory_map() {
                    log::debug!("Memory map refresh failed: {}", e);
                }
                notices.push(Notice::module(format!(
                    "{} loaded ({:#018x})",
                    name, base_address
                )));
                ContinueStatus::Continue
            }
            EventKind::ModuleUnloaded { base_address } => {
                let name = state.modules.remove(base_address);
                if let Err(e) = state.refresh_memory_map() {
                    log::debug!("Memory map refresh failed: {}", e);
                }
                notices.push(Notice::module(format!(
                    "{:#018x} {} unloaded",
                    base_address,
                    name.as_deref().unwrap_or("module")
                )));
                ContinueStatus::Continue
            }
            EventKind::Exception(info) => {
                let SessionState {
                    exceptions,
                    breakpoints,
                    context,
                    bypass_halt,
                    ..
                } = &mut *state;
                let dispatch = exceptions.dispatch(info, context.as_mut(), breakpoints);
                *bypass_halt = dispatch.bypass_halt;
                notices.extend(dispatch.notices);
                dispatch.status
            }
            EventKind::Unknown { code } => {
                notices.push(Notice::unknown(format!(
                    "Not implemented debug event yet ({})",
                    code
                )));
                ContinueStatus::NotHandled
            }
        };

        // bypass lasts exactly one iteration
        let bypass = std::mem::take(&mut state.bypass_halt);
        let interrupt = state.active
            && !bypass
            && !matches!(event.kind, EventKind::ProcessExited { .. })
            && self.config.interrupting.contains(&event.kind.category());

        (status, interrupt, notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breakpoint::INT3;
    use crate::debug::sim::{SimBackend, SimProgram, SimTrace};
    use crate::debug::types::ExceptionKind;

    const CODE_BASE: u64 = 0x1_4000_0000;
    const BP: u64 = 0x1_4000_1000;

    struct Harness {
        session: Session,
        trace: Arc<SimTrace>,
        notices: Arc<Mutex<Vec<Notice>>>,
    }

    impl Harness {
        fn notice_texts(&self) -> Vec<String> {
            self.notices
                .lock()
                .unwrap()
                .iter()
                .map(|n| n.text.clone())
                .collect()
        }
    }

    fn harness(program: SimProgram, config: SessionConfig) -> Harness {
        let trace = Arc::new(SimTrace::default());
        let notices = Arc::new(Mutex::new(Vec::new()));

        let factory: BackendFactory = {
            let trace = trace.clone();
            Arc::new(move || Box::new(SimBackend::new(program.clone(), trace.clone())))
        };
        let sink: NoticeSink = {
            let notices = notices.clone();
            Arc::new(move |n: &Notice| notices.lock().unwrap().push(n.clone()))
        };

        Harness {
            session: Session::new(config, factory).with_sink(sink),
            trace,
            notices,
        }
    }

    fn config(break_on_entry: bool) -> SessionConfig {
        let mut config = SessionConfig::new("sim.exe");
        config.break_on_entry = break_on_entry;
        config
    }

    /// Entry at CODE_BASE, a nop sled up to BP, then `inc rax; nop; hlt`
    fn straight_line() -> SimProgram {
        let mut code = vec![0x90; (BP - CODE_BASE) as usize];
        code.extend_from_slice(&[0x48, 0xFF, 0xC0, 0x90, 0xF4]);
        SimProgram::new(CODE_BASE, CODE_BASE, code)
    }

    /// `inc rax; nop; hlt` at CODE_BASE
    fn short_program() -> SimProgram {
        SimProgram::new(CODE_BASE, CODE_BASE, vec![0x48, 0xFF, 0xC0, 0x90, 0xF4])
    }

    fn current_kind(session: &Session) -> Option<EventKind> {
        session.state().current_event.as_ref().map(|e| e.kind.clone())
    }

    #[test]
    fn test_breakpoint_hit_and_silent_rearm() {
        let mut h = harness(straight_line().with_system_breakpoint(), config(false));
        h.session.start().unwrap();

        // stopped at the loader breakpoint
        h.session.add_breakpoint(BP).unwrap();
        assert_eq!(h.trace.memory_byte(BP), Some(INT3));
        h.session.continue_execution().unwrap();

        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        match current_kind(&h.session) {
            Some(EventKind::Exception(info)) => {
                assert_eq!(info.kind, ExceptionKind::Breakpoint);
                assert_eq!(info.address, BP);
            }
            other => panic!("unexpected event {:?}", other),
        }
        let bp = h.session.breakpoints()[0].clone();
        assert_eq!(bp.hit_count, 1);
        assert!(!bp.armed);
        assert_eq!(h.trace.memory_byte(BP), Some(0x48));
        assert_eq!(h.session.context().unwrap().rip, BP);

        // the re-arm single step never surfaces; the next stop is the exit
        h.session.continue_execution().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Exited);
        assert_eq!(h.trace.single_steps(), 1);
        assert_eq!(h.trace.memory_byte(BP), Some(INT3));

        h.session.exit_session().unwrap();
        let texts = h.notice_texts();
        assert!(texts.iter().any(|t| t.starts_with("System breakpoint reached")));
        assert!(texts.iter().any(|t| t.starts_with("User breakpoint reached")));
        assert!(!texts.iter().any(|t| t.starts_with("Single step at")));
    }

    #[test]
    fn test_trap_context_is_rolled_back() {
        let mut h = harness(straight_line(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        h.session.continue_execution().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Exited);
        h.session.exit_session().unwrap();

        let trapped: Vec<ThreadContext> = h
            .trace
            .context_writes()
            .into_iter()
            .filter(|c| c.trap_flag())
            .collect();
        assert_eq!(trapped.len(), 1);
        assert_eq!(trapped[0].rip, CODE_BASE);
    }

    #[test]
    fn test_hit_count_over_loop() {
        // inc rax ; nop ; jmp -6
        let code = vec![0x48, 0xFF, 0xC0, 0x90, 0xEB, 0xFA];
        let bp = CODE_BASE + 3;
        let mut h = harness(
            SimProgram::new(CODE_BASE, CODE_BASE, code).with_system_breakpoint(),
            config(false),
        );
        h.session.start().unwrap();
        h.session.add_breakpoint(bp).unwrap();

        const HITS: u64 = 5;
        for _ in 0..HITS {
            h.session.continue_execution().unwrap();
            assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        }
        assert_eq!(h.session.breakpoints()[0].hit_count, HITS);
        assert_eq!(h.session.context().unwrap().rax, HITS);
        assert_eq!(h.trace.single_steps() as u64, HITS - 1);

        h.session.exit_session().unwrap();
        assert_eq!(h.session.status(), DebugStatus::Exited);
        assert!(h.trace.terminated());
    }

    #[test]
    fn test_step_over_places_one_hit_breakpoint() {
        let mut h = harness(short_program(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        assert_eq!(h.session.context().unwrap().rip, CODE_BASE);

        let next = h.session.step_over().unwrap();
        assert_eq!(next, CODE_BASE + 3);

        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        assert_eq!(h.session.context().unwrap().rip, next);
        assert!(h.session.breakpoints().iter().all(|bp| bp.address != next));
        assert_eq!(h.trace.memory_byte(next), Some(0x90));
        // the entry breakpoint got re-armed on the way
        assert_eq!(h.trace.memory_byte(CODE_BASE), Some(INT3));
        assert!(h.notice_texts().iter().any(|t| t.starts_with("Step reached")));

        h.session.exit_session().unwrap();
    }

    #[test]
    fn test_step_over_onto_existing_breakpoint() {
        let mut h = harness(short_program(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        h.session.place_breakpoint(CODE_BASE + 3).unwrap();

        h.session.step_over().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        assert_eq!(h.session.context().unwrap().rip, CODE_BASE + 3);
        // still a persistent breakpoint
        let kept = h.session.breakpoints();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|bp| !bp.one_hit));

        h.session.exit_session().unwrap();
    }

    #[test]
    fn test_step_into_surfaces_single_step() {
        let mut h = harness(short_program(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);

        h.session.step_into().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        let ctx = h.session.context().unwrap();
        assert_eq!(ctx.rip, CODE_BASE + 3);
        assert_eq!(ctx.rax, 1);
        // the same step re-armed the entry breakpoint
        assert_eq!(h.trace.memory_byte(CODE_BASE), Some(INT3));

        h.session.step_into().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        assert_eq!(h.session.context().unwrap().rip, CODE_BASE + 4);

        h.session.exit_session().unwrap();
    }

    #[test]
    fn test_process_exit_releases_halt_waiters() {
        let mut h = harness(straight_line(), config(false));
        let waiter = {
            let shared = h.session.shared.clone();
            thread::spawn(move || shared.handshake.wait_for_halt())
        };

        h.session.start().unwrap();
        assert_eq!(waiter.join().unwrap(), DebugStatus::Exited);
        assert_eq!(h.session.status(), DebugStatus::Exited);
        assert!(h.session.state().memory.is_none());
        assert!(matches!(
            h.session.continue_execution(),
            Err(DebugError::NotSuspended)
        ));

        h.session.exit_session().unwrap();
        assert!(h
            .notice_texts()
            .iter()
            .any(|t| t.contains("exited with code 0x00000001")));
    }

    #[test]
    fn test_unhandled_fault_gets_second_chance() {
        // nop ; ud2
        let code = vec![0x90, 0x0F, 0x0B];
        let mut h = harness(SimProgram::new(CODE_BASE, CODE_BASE, code), config(false));
        h.session.start().unwrap();

        let mut stops = 0;
        while h.session.wait_until_suspended() == DebugStatus::Suspended {
            stops += 1;
            h.session.continue_execution().unwrap();
        }
        assert_eq!(stops, 2);

        h.session.exit_session().unwrap();
        let statuses = h.trace.statuses();
        assert_eq!(
            statuses.iter().filter(|s| **s == ContinueStatus::NotHandled).count(),
            2
        );
        let texts = h.notice_texts();
        assert!(texts.iter().any(|t| t.starts_with("First chance exception")));
        assert!(texts.iter().any(|t| t.starts_with("Last chance exception")));
        assert!(texts.iter().any(|t| t.contains("0xc0000005")));
    }

    #[test]
    fn test_launch_failure() {
        let mut h = harness(straight_line().failing_launch(), config(false));
        let err = h.session.start().unwrap_err();
        assert!(matches!(err, DebugError::Launch(_)));
        assert_eq!(h.session.status(), DebugStatus::Exited);
        assert!(matches!(
            h.session.add_breakpoint(BP),
            Err(DebugError::NotSuspended)
        ));
    }

    #[test]
    fn test_programmatic_calls_before_start() {
        let h = harness(straight_line(), config(false));
        assert_eq!(h.session.status(), DebugStatus::NotStarted);
        assert!(matches!(
            h.session.continue_execution(),
            Err(DebugError::NotSuspended)
        ));
    }

    #[test]
    fn test_event_wait_failure_is_fatal() {
        let mut h = harness(straight_line().failing_wait_after(1), config(false));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Exited);
        let err = h.session.exit_session().unwrap_err();
        assert!(matches!(err, DebugError::EventWait(_)));
        assert!(h.trace.terminated());
    }

    #[test]
    fn test_restart_keeps_only_entry_breakpoint() {
        let mut h = harness(straight_line(), config(true));
        h.session.start().unwrap();
        h.session.add_breakpoint(BP).unwrap();
        assert_eq!(h.session.breakpoints().len(), 2);

        h.session.restart().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        let addresses: Vec<u64> = h.session.breakpoints().iter().map(|bp| bp.address).collect();
        assert_eq!(addresses, vec![CODE_BASE]);
        assert_eq!(h.trace.launches(), 2);
        assert!(h
            .notice_texts()
            .iter()
            .any(|t| t == "The program is being debugged, running it again"));

        h.session.exit_session().unwrap();
    }

    #[test]
    fn test_delete_breakpoint_pending_rearm_clears_trap_flag() {
        let mut h = harness(straight_line(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);
        assert!(h.session.context().unwrap().trap_flag());

        h.session
            .delete_breakpoint(BreakpointRef::Address(CODE_BASE))
            .unwrap();
        assert!(!h.session.context().unwrap().trap_flag());

        h.session.continue_execution().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Exited);
        assert_eq!(h.trace.single_steps(), 0);
        h.session.exit_session().unwrap();
    }

    #[test]
    fn test_disassemble_hides_breakpoints() {
        let mut h = harness(short_program(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);

        let listing = h.session.disassemble(CODE_BASE, 3).unwrap();
        assert_eq!(listing[0].mnemonic, "inc");
        assert_eq!(listing[0].length, 3);
        assert_eq!(listing[1].address, CODE_BASE + 3);
        assert_eq!(listing[1].mnemonic, "nop");

        let bytes = h.session.read_memory(CODE_BASE, 2).unwrap();
        assert_eq!(bytes, vec![0x48, 0xFF]);
        h.session.exit_session().unwrap();
    }

    #[test]
    fn test_oversized_read_stops_at_region_end() {
        let mut h = harness(short_program(), config(true));
        h.session.start().unwrap();
        assert_eq!(h.session.wait_until_suspended(), DebugStatus::Suspended);

        let bytes = h.session.read_memory(CODE_BASE, usize::MAX).unwrap();
        assert_eq!(bytes, vec![0x48, 0xFF, 0xC0, 0x90, 0xF4]);

        let bytes = h.session.read_memory(CODE_BASE + 3, 1 << 40).unwrap();
        assert_eq!(bytes, vec![0x90, 0xF4]);
        h.session.exit_session().unwrap();
    }
}
