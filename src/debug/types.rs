//! Common types for debugging functionality.

use std::fmt;

/// Windows exception codes. The Linux backend maps signals onto the same values.
pub const EXCEPTION_ACCESS_VIOLATION: u32 = 0xC000_0005;
pub const EXCEPTION_BREAKPOINT: u32 = 0x8000_0003;
pub const EXCEPTION_SINGLE_STEP: u32 = 0x8000_0004;
pub const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
pub const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;

/// Information about the debugged process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: u32,
    /// Image name (executable file name)
    pub image_name: String,
    /// Load address of the main image
    pub base_address: u64,
    /// Address of the first instruction executed in the image
    pub entry_point: u64,
}

/// Classified exception raised by the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    AccessViolation,
    Breakpoint,
    SingleStep,
    DivideByZero,
    PrivilegedInstruction,
    Other(u32),
}

impl ExceptionKind {
    pub fn from_code(code: u32) -> Self {
        match code {
            EXCEPTION_ACCESS_VIOLATION => Self::AccessViolation,
            EXCEPTION_BREAKPOINT => Self::Breakpoint,
            EXCEPTION_SINGLE_STEP => Self::SingleStep,
            EXCEPTION_INT_DIVIDE_BY_ZERO => Self::DivideByZero,
            EXCEPTION_PRIV_INSTRUCTION => Self::PrivilegedInstruction,
            other => Self::Other(other),
        }
    }

    pub fn code(&self) -> u32 {
        match self {
            Self::AccessViolation => EXCEPTION_ACCESS_VIOLATION,
            Self::Breakpoint => EXCEPTION_BREAKPOINT,
            Self::SingleStep => EXCEPTION_SINGLE_STEP,
            Self::DivideByZero => EXCEPTION_INT_DIVIDE_BY_ZERO,
            Self::PrivilegedInstruction => EXCEPTION_PRIV_INSTRUCTION,
            Self::Other(code) => *code,
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AccessViolation => write!(f, "Access Violation"),
            Self::Breakpoint => write!(f, "Breakpoint"),
            Self::SingleStep => write!(f, "Single step"),
            Self::DivideByZero => write!(f, "Division by zero"),
            Self::PrivilegedInstruction => write!(f, "Privileged instruction"),
            Self::Other(code) => write!(f, "Exception {:#010x}", code),
        }
    }
}

/// Exception record attached to an exception event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub kind: ExceptionKind,
    /// Address the exception was raised at (the trap byte itself for breakpoints)
    pub address: u64,
    pub first_chance: bool,
}

/// Debug event received from the target process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEvent {
    pub pid: u32,
    /// Thread that raised the event and is stopped until the event is continued
    pub tid: u32,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Process created
    ProcessCreated(ProcessInfo),
    /// Process exited
    ProcessExited { exit_code: u32 },
    /// Thread created
    ThreadCreated { thread_id: u32, start_address: u64 },
    /// Thread exited
    ThreadExited { thread_id: u32, exit_code: u32 },
    /// DLL / shared object loaded
    ModuleLoaded { base_address: u64, name: String },
    /// DLL / shared object unloaded
    ModuleUnloaded { base_address: u64 },
    /// Exception occurred
    Exception(ExceptionInfo),
    /// Native event without a translation
    Unknown { code: u32 },
}

impl EventKind {
    pub fn category(&self) -> EventCategory {
        match self {
            Self::ProcessCreated(_) => EventCategory::CreateProcess,
            Self::ProcessExited { .. } => EventCategory::ExitProcess,
            Self::ThreadCreated { .. } => EventCategory::CreateThread,
            Self::ThreadExited { .. } => EventCategory::ExitThread,
            Self::ModuleLoaded { .. } => EventCategory::LoadModule,
            Self::ModuleUnloaded { .. } => EventCategory::UnloadModule,
            Self::Exception(_) => EventCategory::Exception,
            Self::Unknown { .. } => EventCategory::Other,
        }
    }

    /// Whether the raising thread is still alive and has a register context.
    pub fn has_live_thread(&self) -> bool {
        !matches!(self, Self::ProcessExited { .. } | Self::ThreadExited { .. })
    }
}

/// Event categories that can be configured to suspend the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, clap::ValueEnum)]
pub enum EventCategory {
    Exception,
    CreateProcess,
    ExitProcess,
    CreateThread,
    ExitThread,
    LoadModule,
    UnloadModule,
    Other,
}

/// Disposition handed back to the OS when an event is continued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContinueStatus {
    #[default]
    Continue,
    /// Let the target's own handlers (or the OS default action) deal with the exception
    NotHandled,
}

/// Debug session status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugStatus {
    #[default]
    NotStarted,
    Running,
    Suspended,
    Exited,
}

impl fmt::Display for DebugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "idle",
            Self::Running => "run",
            Self::Suspended => "dbg",
            Self::Exited => "exit",
        };
        f.write_str(s)
    }
}

/// Trap / single-step bit in RFLAGS
pub const TRAP_FLAG: u64 = 0x100;

/// CPU register state (x64) of one thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
}

impl ThreadContext {
    pub fn trap_flag(&self) -> bool {
        self.rflags & TRAP_FLAG != 0
    }

    pub fn set_trap_flag(&mut self, enabled: bool) {
        if enabled {
            self.rflags |= TRAP_FLAG;
        } else {
            self.rflags &= !TRAP_FLAG;
        }
    }

    /// General purpose registers in display order
    pub fn general_registers(&self) -> [(&'static str, u64); 16] {
        [
            ("RAX", self.rax),
            ("RBX", self.rbx),
            ("RCX", self.rcx),
            ("RDX", self.rdx),
            ("RSI", self.rsi),
            ("RDI", self.rdi),
            ("R8", self.r8),
            ("R9", self.r9),
            ("R10", self.r10),
            ("R11", self.r11),
            ("R12", self.r12),
            ("R13", self.r13),
            ("R14", self.r14),
            ("R15", self.r15),
            ("RBP", self.rbp),
            ("RSP", self.rsp),
        ]
    }
}
