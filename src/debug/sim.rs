//! In-memory target for unit tests.
//!
//! [`SimBackend`] runs a tiny x86 subset directly from a [`SimMemory`] image,
//! so breakpoints written by the engine are seen by the "CPU":
//!
//! | bytes      | instruction               |
//! |------------|---------------------------|
//! | `90`       | nop                       |
//! | `CC`       | int3                      |
//! | `48 FF C0` | inc rax                   |
//! | `EB xx`    | jmp rel8                  |
//! | `F4`       | hlt, exits with code rax  |
//!
//! Anything else raises an access violation.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::core::debugger::DebugError;
use crate::core::memory::{MemoryAccess, MemoryError, MemoryProtection, MemoryRegion};
use crate::debug::types::{
    ContinueStatus, DebugEvent, EventKind, ExceptionInfo, ExceptionKind, ProcessInfo,
    ThreadContext,
};
use crate::debug::DebugBackend;

pub const SIM_PID: u32 = 0x1000;
pub const SIM_TID: u32 = 0x1004;

/// Where the loader's initial breakpoint fires
pub const SYSTEM_BREAKPOINT: u64 = 0x7ff8_0000_1000;

/// Instructions executed without an event before the sim gives up
const RUNAWAY_LIMIT: usize = 1_000_000;

#[derive(Debug)]
struct SimBytes {
    bytes: Vec<u8>,
    failing_writes: Vec<u64>,
}

/// Flat byte image at a fixed base address
#[derive(Debug)]
pub struct SimMemory {
    base: u64,
    inner: Mutex<SimBytes>,
}

impl SimMemory {
    pub fn new(base: u64, bytes: &[u8]) -> Self {
        Self {
            base,
            inner: Mutex::new(SimBytes {
                bytes: bytes.to_vec(),
                failing_writes: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimBytes> {
        self.inner.lock().unwrap()
    }

    fn offset(&self, address: u64, len: usize) -> Option<usize> {
        let offset = address.checked_sub(self.base)? as usize;
        (offset < len).then_some(offset)
    }

    pub fn byte(&self, address: u64) -> Option<u8> {
        let inner = self.lock();
        let offset = self.offset(address, inner.bytes.len())?;
        Some(inner.bytes[offset])
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().bytes.clone()
    }

    /// Make every later write touching `address` fail
    pub fn fail_writes_at(&self, address: u64) {
        self.lock().failing_writes.push(address);
    }
}

impl MemoryAccess for SimMemory {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        let inner = self.lock();
        let offset = self
            .offset(address, inner.bytes.len())
            .ok_or_else(|| MemoryError::ReadFailed {
                address,
                reason: "unmapped".into(),
            })?;
        let count = buffer.len().min(inner.bytes.len() - offset);
        buffer[..count].copy_from_slice(&inner.bytes[offset..offset + count]);
        Ok(count)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError> {
        let mut inner = self.lock();
        let end = address + data.len() as u64;
        if inner
            .failing_writes
            .iter()
            .any(|&fail| fail >= address && fail < end)
        {
            return Err(MemoryError::WriteFailed {
                address,
                reason: "write protected".into(),
            });
        }
        let offset = self
            .offset(address, inner.bytes.len())
            .ok_or_else(|| MemoryError::WriteFailed {
                address,
                reason: "unmapped".into(),
            })?;
        let count = data.len().min(inner.bytes.len() - offset);
        inner.bytes[offset..offset + count].copy_from_slice(&data[..count]);
        Ok(count)
    }

    fn flush_code_cache(&self, _address: u64, _len: usize) -> Result<(), MemoryError> {
        Ok(())
    }

    fn query_regions(&self) -> Result<Vec<MemoryRegion>, MemoryError> {
        Ok(vec![MemoryRegion {
            base_address: self.base,
            size: self.lock().bytes.len(),
            protection: MemoryProtection::RX,
            name: Some("sim.exe".into()),
        }])
    }
}

/// Image and failure knobs for one simulated target
#[derive(Debug, Clone)]
pub struct SimProgram {
    base: u64,
    entry: u64,
    code: Vec<u8>,
    system_breakpoint: bool,
    fail_launch: bool,
    fail_wait_after: Option<usize>,
}

impl SimProgram {
    pub fn new(base: u64, entry: u64, code: Vec<u8>) -> Self {
        Self {
            base,
            entry,
            code,
            system_breakpoint: false,
            fail_launch: false,
            fail_wait_after: None,
        }
    }

    /// Raise a loader breakpoint right after process creation
    pub fn with_system_breakpoint(mut self) -> Self {
        self.system_breakpoint = true;
        self
    }

    pub fn failing_launch(mut self) -> Self {
        self.fail_launch = true;
        self
    }

    /// Fail the wait that follows the first `events` events
    pub fn failing_wait_after(mut self, events: usize) -> Self {
        self.fail_wait_after = Some(events);
        self
    }
}

#[derive(Debug, Default)]
struct TraceLog {
    memory: Option<Arc<SimMemory>>,
    context_writes: Vec<ThreadContext>,
    statuses: Vec<ContinueStatus>,
    single_steps: usize,
    launches: usize,
    terminated: bool,
}

/// What the engine did to the simulated target; shared with the test body
#[derive(Debug, Default)]
pub struct SimTrace {
    log: Mutex<TraceLog>,
}

impl SimTrace {
    fn lock(&self) -> MutexGuard<'_, TraceLog> {
        self.log.lock().unwrap()
    }

    /// Byte currently in the most recently launched image
    pub fn memory_byte(&self, address: u64) -> Option<u8> {
        self.lock().memory.as_ref()?.byte(address)
    }

    pub fn context_writes(&self) -> Vec<ThreadContext> {
        self.lock().context_writes.clone()
    }

    pub fn statuses(&self) -> Vec<ContinueStatus> {
        self.lock().statuses.clone()
    }

    /// Single-step exceptions raised by the trap flag
    pub fn single_steps(&self) -> usize {
        self.lock().single_steps
    }

    pub fn launches(&self) -> usize {
        self.lock().launches
    }

    pub fn terminated(&self) -> bool {
        self.lock().terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    NotLaunched,
    Created,
    Running,
    Exited,
}

pub struct SimBackend {
    program: SimProgram,
    trace: Arc<SimTrace>,
    memory: Option<Arc<SimMemory>>,
    cpu: ThreadContext,
    phase: Phase,
    delivered: usize,
    system_breakpoint_pending: bool,
    /// Fault that was not handled and comes back as last chance
    redeliver: Option<ExceptionInfo>,
    exit_code: Option<u32>,
}

impl SimBackend {
    pub fn new(program: SimProgram, trace: Arc<SimTrace>) -> Self {
        Self {
            system_breakpoint_pending: program.system_breakpoint,
            program,
            trace,
            memory: None,
            cpu: ThreadContext::default(),
            phase: Phase::NotLaunched,
            delivered: 0,
            redeliver: None,
            exit_code: None,
        }
    }

    fn event(&self, kind: EventKind) -> DebugEvent {
        DebugEvent {
            pid: SIM_PID,
            tid: SIM_TID,
            kind,
        }
    }

    fn fault(&self, kind: ExceptionKind) -> EventKind {
        EventKind::Exception(ExceptionInfo {
            kind,
            address: self.cpu.rip,
            first_chance: true,
        })
    }

    fn fetch(&self, memory: &SimMemory, offset: u64) -> Option<u8> {
        memory.byte(self.cpu.rip.wrapping_add(offset))
    }

    /// Execute until something raises an event
    fn run(&mut self) -> Result<EventKind, DebugError> {
        let memory = self
            .memory
            .clone()
            .ok_or_else(|| DebugError::EventWait("no process".into()))?;

        for _ in 0..RUNAWAY_LIMIT {
            let trapping = self.cpu.trap_flag();
            match self.fetch(&memory, 0) {
                Some(0x90) => self.cpu.rip += 1,
                Some(0xCC) => {
                    self.cpu.rip += 1;
                    self.cpu.set_trap_flag(false);
                    return Ok(EventKind::Exception(ExceptionInfo {
                        kind: ExceptionKind::Breakpoint,
                        address: self.cpu.rip - 1,
                        first_chance: true,
                    }));
                }
                Some(0x48)
                    if self.fetch(&memory, 1) == Some(0xFF)
                        && self.fetch(&memory, 2) == Some(0xC0) =>
                {
                    self.cpu.rax = self.cpu.rax.wrapping_add(1);
                    self.cpu.rip += 3;
                }
                Some(0xEB) => match self.fetch(&memory, 1) {
                    Some(rel) => {
                        let next = self.cpu.rip.wrapping_add(2);
                        self.cpu.rip = next.wrapping_add(rel as i8 as i64 as u64);
                    }
                    None => return Ok(self.fault(ExceptionKind::AccessViolation)),
                },
                Some(0xF4) => {
                    return Ok(EventKind::ProcessExited {
                        exit_code: self.cpu.rax as u32,
                    })
                }
                _ => return Ok(self.fault(ExceptionKind::AccessViolation)),
            }

            if trapping {
                self.cpu.set_trap_flag(false);
                self.trace.lock().single_steps += 1;
                return Ok(self.fault(ExceptionKind::SingleStep));
            }
        }

        Err(DebugError::EventWait("simulated target ran away".into()))
    }
}

impl DebugBackend for SimBackend {
    fn launch(&mut self, path: &Path, _args: &[String]) -> Result<Arc<dyn MemoryAccess>, DebugError> {
        if self.program.fail_launch {
            return Err(DebugError::Launch(format!("{}: image not found", path.display())));
        }

        let memory = Arc::new(SimMemory::new(self.program.base, &self.program.code));
        {
            let mut log = self.trace.lock();
            log.launches += 1;
            log.memory = Some(memory.clone());
        }
        self.memory = Some(memory.clone());
        self.cpu = ThreadContext {
            rip: self.program.entry,
            ..ThreadContext::default()
        };
        self.phase = Phase::Created;
        Ok(memory)
    }

    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError> {
        if let Some(limit) = self.program.fail_wait_after {
            if self.delivered >= limit {
                return Err(DebugError::EventWait("simulated wait failure".into()));
            }
        }

        let kind = match self.phase {
            Phase::NotLaunched | Phase::Exited => {
                return Err(DebugError::EventWait("no process".into()))
            }
            Phase::Created => {
                self.phase = Phase::Running;
                EventKind::ProcessCreated(ProcessInfo {
                    pid: SIM_PID,
                    image_name: "sim.exe".into(),
                    base_address: self.program.base,
                    entry_point: self.program.entry,
                })
            }
            Phase::Running => {
                if let Some(exit_code) = self.exit_code {
                    EventKind::ProcessExited { exit_code }
                } else if let Some(info) = self.redeliver.take() {
                    EventKind::Exception(info)
                } else if std::mem::take(&mut self.system_breakpoint_pending) {
                    EventKind::Exception(ExceptionInfo {
                        kind: ExceptionKind::Breakpoint,
                        address: SYSTEM_BREAKPOINT,
                        first_chance: true,
                    })
                } else {
                    self.run()?
                }
            }
        };

        self.delivered += 1;
        Ok(self.event(kind))
    }

    fn continue_event(&mut self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError> {
        self.trace.lock().statuses.push(status);

        match &event.kind {
            EventKind::ProcessExited { .. } => self.phase = Phase::Exited,
            EventKind::Exception(info) if status == ContinueStatus::NotHandled => {
                match info.kind {
                    ExceptionKind::Breakpoint | ExceptionKind::SingleStep => {}
                    _ if info.first_chance => {
                        self.redeliver = Some(ExceptionInfo {
                            first_chance: false,
                            ..*info
                        })
                    }
                    kind => self.exit_code = Some(kind.code()),
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn get_context(&mut self, tid: u32) -> Result<ThreadContext, DebugError> {
        if tid != SIM_TID || self.phase == Phase::NotLaunched {
            return Err(DebugError::ContextAccess {
                tid,
                reason: "no such thread".into(),
            });
        }
        Ok(self.cpu)
    }

    fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<(), DebugError> {
        if tid != SIM_TID {
            return Err(DebugError::ContextAccess {
                tid,
                reason: "no such thread".into(),
            });
        }
        self.trace.lock().context_writes.push(*context);
        self.cpu = *context;
        Ok(())
    }

    fn terminate(&mut self) -> Result<(), DebugError> {
        self.trace.lock().terminated = true;
        self.phase = Phase::Exited;
        Ok(())
    }
}
