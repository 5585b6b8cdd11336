//! Windows-specific debugger implementation using Win32 Debug API.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, NTSTATUS};
use windows::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, GetThreadContext, SetThreadContext, WaitForDebugEvent, CONTEXT,
    CONTEXT_FLAGS, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT,
    EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
    LOAD_DLL_DEBUG_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::{
    CreateProcessW, OpenThread, TerminateProcess, DEBUG_ONLY_THIS_PROCESS, INFINITE,
    PROCESS_INFORMATION, STARTUPINFOW, THREAD_GET_CONTEXT, THREAD_QUERY_INFORMATION,
    THREAD_SET_CONTEXT,
};

use crate::core::debugger::DebugError;
use crate::core::memory::{MemoryAccess, ProcessMemory};
use crate::debug::types::{
    ContinueStatus, DebugEvent, EventKind, ExceptionInfo, ExceptionKind, ProcessInfo,
    ThreadContext,
};
use crate::debug::DebugBackend;

const DBG_CONTINUE: NTSTATUS = NTSTATUS(0x00010002i32);
const DBG_EXCEPTION_NOT_HANDLED: NTSTATUS = NTSTATUS(0x80010001u32 as i32);

/// CONTEXT_ALL
const CONTEXT_ALL: CONTEXT_FLAGS = CONTEXT_FLAGS(0x10001F);

/// How long teardown waits for the exit event of a killed target
const TEARDOWN_WAIT_MS: u32 = 1000;

/// Thread handles by tid
///
/// Handles handed out by create-process / create-thread events are closed by
/// the system; handles from `OpenThread` are ours to close.
#[derive(Debug, Default)]
struct ThreadHandles {
    handles: BTreeMap<u32, (HANDLE, bool)>,
}

impl ThreadHandles {
    fn get(&self, tid: u32) -> Option<HANDLE> {
        self.handles.get(&tid).map(|(handle, _)| *handle)
    }

    /// Returns a replaced handle that must be closed
    fn insert(&mut self, tid: u32, handle: HANDLE, owned: bool) -> Option<HANDLE> {
        self.handles
            .insert(tid, (handle, owned))
            .and_then(|(old, old_owned)| (old_owned && old != handle).then_some(old))
    }

    /// Forget a thread, returning its handle if it must be closed
    fn remove(&mut self, tid: u32) -> Option<HANDLE> {
        self.handles
            .remove(&tid)
            .and_then(|(handle, owned)| owned.then_some(handle))
    }

    /// Forget every thread, returning the handles that must be closed
    fn drain_owned(&mut self) -> Vec<HANDLE> {
        std::mem::take(&mut self.handles)
            .into_values()
            .filter_map(|(handle, owned)| owned.then_some(handle))
            .collect()
    }
}

fn close_all(handles: impl IntoIterator<Item = HANDLE>) {
    for handle in handles {
        unsafe {
            let _ = CloseHandle(handle);
        }
    }
}

/// Windows debugger implementation
pub struct WindowsBackend {
    process: Option<HANDLE>,
    pid: u32,
    threads: ThreadHandles,
    exited: bool,
}

// Raw handles are only used from the debug loop thread that owns the backend
unsafe impl Send for WindowsBackend {}

impl WindowsBackend {
    pub fn new() -> Self {
        Self {
            process: None,
            pid: 0,
            threads: ThreadHandles::default(),
            exited: false,
        }
    }

    /// Open the thread ourselves when no event handed us a handle
    fn thread_handle(&mut self, tid: u32) -> Result<HANDLE, DebugError> {
        if let Some(handle) = self.threads.get(tid) {
            return Ok(handle);
        }
        let handle = unsafe {
            OpenThread(
                THREAD_GET_CONTEXT | THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION,
                false,
                tid,
            )
        }
        .map_err(|e| DebugError::ContextAccess {
            tid,
            reason: format!("OpenThread: {}", e),
        })?;
        close_all(self.threads.insert(tid, handle, true));
        Ok(handle)
    }

    fn read_context(&mut self, tid: u32) -> Result<CONTEXT, DebugError> {
        let handle = self.thread_handle(tid)?;
        let mut context = CONTEXT {
            ContextFlags: CONTEXT_ALL,
            ..Default::default()
        };
        unsafe { GetThreadContext(handle, &mut context) }.map_err(|e| {
            DebugError::ContextAccess {
                tid,
                reason: format!("GetThreadContext: {}", e),
            }
        })?;
        Ok(context)
    }

    fn translate(&mut self, event: &DEBUG_EVENT) -> EventKind {
        let code = event.dwDebugEventCode;
        match code {
            EXCEPTION_DEBUG_EVENT => unsafe {
                let info = event.u.Exception;
                let record = info.ExceptionRecord;
                EventKind::Exception(ExceptionInfo {
                    kind: ExceptionKind::from_code(record.ExceptionCode.0 as u32),
                    address: record.ExceptionAddress as u64,
                    first_chance: info.dwFirstChance != 0,
                })
            },
            CREATE_PROCESS_DEBUG_EVENT => unsafe {
                let info = event.u.CreateProcessInfo;
                close_all(self.threads.insert(event.dwThreadId, info.hThread, false));
                let image_name = file_name(info.hFile).unwrap_or_else(|| "<image>".into());
                if !info.hFile.is_invalid() {
                    let _ = CloseHandle(info.hFile);
                }
                EventKind::ProcessCreated(ProcessInfo {
                    pid: event.dwProcessId,
                    image_name,
                    base_address: info.lpBaseOfImage as u64,
                    entry_point: info.lpStartAddress.map(|f| f as usize as u64).unwrap_or(0),
                })
            },
            EXIT_PROCESS_DEBUG_EVENT => {
                self.exited = true;
                EventKind::ProcessExited {
                    exit_code: unsafe { event.u.ExitProcess.dwExitCode },
                }
            }
            CREATE_THREAD_DEBUG_EVENT => unsafe {
                let info = event.u.CreateThread;
                close_all(self.threads.insert(event.dwThreadId, info.hThread, false));
                EventKind::ThreadCreated {
                    thread_id: event.dwThreadId,
                    start_address: info.lpStartAddress.map(|f| f as usize as u64).unwrap_or(0),
                }
            },
            EXIT_THREAD_DEBUG_EVENT => {
                close_all(self.threads.remove(event.dwThreadId));
                EventKind::ThreadExited {
                    thread_id: event.dwThreadId,
                    exit_code: unsafe { event.u.ExitThread.dwExitCode },
                }
            }
            LOAD_DLL_DEBUG_EVENT => unsafe {
                let info = event.u.LoadDll;
                let name = file_name(info.hFile).unwrap_or_else(|| "<dll>".into());
                if !info.hFile.is_invalid() {
                    let _ = CloseHandle(info.hFile);
                }
                EventKind::ModuleLoaded {
                    base_address: info.lpBaseOfDll as u64,
                    name,
                }
            },
            UNLOAD_DLL_DEBUG_EVENT => EventKind::ModuleUnloaded {
                base_address: unsafe { event.u.UnloadDll.lpBaseOfDll } as u64,
            },
            other => EventKind::Unknown { code: other.0 },
        }
    }
}

impl Default for WindowsBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Path of the file behind a handle from a debug event
fn file_name(file: HANDLE) -> Option<String> {
    if file.is_invalid() {
        return None;
    }
    let mut buffer = [0u16; 1024];
    let len = unsafe { GetFinalPathNameByHandleW(file, &mut buffer, FILE_NAME_NORMALIZED) } as usize;
    if len == 0 || len > buffer.len() {
        return None;
    }
    let path = String::from_utf16_lossy(&buffer[..len]);
    // drop the \\?\ prefix
    Some(path.strip_prefix(r"\\?\").map(str::to_string).unwrap_or(path))
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

fn command_line(path: &Path, args: &[String]) -> Vec<u16> {
    let mut line = format!("\"{}\"", path.display());
    for arg in args {
        if arg.contains(' ') || arg.is_empty() {
            line.push_str(&format!(" \"{}\"", arg));
        } else {
            line.push(' ');
            line.push_str(arg);
        }
    }
    wide(OsStr::new(&line))
}

impl DebugBackend for WindowsBackend {
    fn launch(&mut self, path: &Path, args: &[String]) -> Result<Arc<dyn MemoryAccess>, DebugError> {
        let application = wide(path.as_os_str());
        let mut command = command_line(path, args);

        let startup = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR(command.as_mut_ptr()),
                None,
                None,
                false,
                DEBUG_ONLY_THIS_PROCESS,
                None,
                PCWSTR::null(),
                &startup,
                &mut info,
            )
        }
        .map_err(|e| DebugError::Launch(format!("{}: {}", path.display(), e)))?;

        // the create-process event hands out its own thread handle
        unsafe {
            let _ = CloseHandle(info.hThread);
        }

        log::info!("Launched {} as pid {}", path.display(), info.dwProcessId);
        self.process = Some(info.hProcess);
        self.pid = info.dwProcessId;
        self.exited = false;

        Ok(Arc::new(ProcessMemory::new(info.hProcess.0)))
    }

    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError> {
        if self.process.is_none() {
            return Err(DebugError::EventWait("no process".into()));
        }

        let mut event = DEBUG_EVENT::default();
        unsafe { WaitForDebugEvent(&mut event, INFINITE) }
            .map_err(|e| DebugError::EventWait(e.to_string()))?;

        let kind = self.translate(&event);
        Ok(DebugEvent {
            pid: event.dwProcessId,
            tid: event.dwThreadId,
            kind,
        })
    }

    fn continue_event(&mut self, event: &DebugEvent, status: ContinueStatus) -> Result<(), DebugError> {
        let code = match status {
            ContinueStatus::Continue => DBG_CONTINUE,
            ContinueStatus::NotHandled => DBG_EXCEPTION_NOT_HANDLED,
        };
        unsafe { ContinueDebugEvent(event.pid, event.tid, code) }
            .map_err(|e| DebugError::Continue(e.to_string()))
    }

    fn get_context(&mut self, tid: u32) -> Result<ThreadContext, DebugError> {
        let context = self.read_context(tid)?;
        Ok(ThreadContext {
            rax: context.Rax,
            rbx: context.Rbx,
            rcx: context.Rcx,
            rdx: context.Rdx,
            rsi: context.Rsi,
            rdi: context.Rdi,
            rbp: context.Rbp,
            rsp: context.Rsp,
            r8: context.R8,
            r9: context.R9,
            r10: context.R10,
            r11: context.R11,
            r12: context.R12,
            r13: context.R13,
            r14: context.R14,
            r15: context.R15,
            rip: context.Rip,
            rflags: context.EFlags as u64,
        })
    }

    fn set_context(&mut self, tid: u32, regs: &ThreadContext) -> Result<(), DebugError> {
        // Start from the live context to preserve segment and debug registers
        let mut context = self.read_context(tid)?;
        context.Rax = regs.rax;
        context.Rbx = regs.rbx;
        context.Rcx = regs.rcx;
        context.Rdx = regs.rdx;
        context.Rsi = regs.rsi;
        context.Rdi = regs.rdi;
        context.Rbp = regs.rbp;
        context.Rsp = regs.rsp;
        context.R8 = regs.r8;
        context.R9 = regs.r9;
        context.R10 = regs.r10;
        context.R11 = regs.r11;
        context.R12 = regs.r12;
        context.R13 = regs.r13;
        context.R14 = regs.r14;
        context.R15 = regs.r15;
        context.Rip = regs.rip;
        context.EFlags = regs.rflags as u32;

        let handle = self.thread_handle(tid)?;
        unsafe { SetThreadContext(handle, &context) }.map_err(|e| DebugError::ContextAccess {
            tid,
            reason: format!("SetThreadContext: {}", e),
        })
    }

    fn terminate(&mut self) -> Result<(), DebugError> {
        let Some(process) = self.process.take() else {
            return Ok(());
        };

        if !self.exited {
            unsafe { TerminateProcess(process, 1) }
                .map_err(|e| DebugError::Continue(format!("TerminateProcess: {}", e)))?;

            // drain events until the exit event so the kernel can release the target
            let mut event = DEBUG_EVENT::default();
            while unsafe { WaitForDebugEvent(&mut event, TEARDOWN_WAIT_MS) }.is_ok() {
                let done = event.dwDebugEventCode == EXIT_PROCESS_DEBUG_EVENT;
                unsafe {
                    let _ = ContinueDebugEvent(event.dwProcessId, event.dwThreadId, DBG_CONTINUE);
                }
                if done {
                    break;
                }
            }
            self.exited = true;
        }

        close_all(self.threads.drain_owned());
        unsafe {
            let _ = CloseHandle(process);
        }
        log::debug!("Target pid {} released", self.pid);
        Ok(())
    }
}

impl Drop for WindowsBackend {
    fn drop(&mut self) {
        if let Err(e) = self.terminate() {
            log::warn!("Failed to terminate target: {}", e);
        }
    }
}
