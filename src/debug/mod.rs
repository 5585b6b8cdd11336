//! Debug module - Platform debugging backends.
//!
//! Provides the OS specific half of the debugger:
//! - Process launch
//! - Debug event wait / continue
//! - Register access
//! - A [`MemoryAccess`] handle for the launched process

pub mod types;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod linux;

#[cfg(test)]
pub(crate) mod sim;

use std::path::Path;
use std::sync::Arc;

use crate::core::debugger::DebugError;
use crate::core::memory::MemoryAccess;
use types::{ContinueStatus, DebugEvent, ThreadContext};

#[cfg(target_os = "windows")]
pub use windows::WindowsBackend as PlatformBackend;

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use linux::LinuxBackend as PlatformBackend;

/// Platform-agnostic debugger backend
///
/// A backend is created and driven by the event loop thread only; on Windows
/// the thread that created the process is the only one allowed to wait for
/// its debug events.
pub trait DebugBackend: Send {
    /// Create the target process under the debugger
    fn launch(&mut self, path: &Path, args: &[String])
        -> Result<Arc<dyn MemoryAccess>, DebugError>;

    /// Block until the next debug event
    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError>;

    /// Let the thread that raised `event` run again
    fn continue_event(&mut self, event: &DebugEvent, status: ContinueStatus)
        -> Result<(), DebugError>;

    /// Get the register state of a stopped thread
    fn get_context(&mut self, tid: u32) -> Result<ThreadContext, DebugError>;

    /// Set the register state of a stopped thread
    fn set_context(&mut self, tid: u32, context: &ThreadContext) -> Result<(), DebugError>;

    /// Kill the target and release every handle
    fn terminate(&mut self) -> Result<(), DebugError>;
}

/// Create the backend for the platform this binary was built for
#[cfg(any(target_os = "windows", all(target_os = "linux", target_arch = "x86_64")))]
pub fn platform_backend() -> Box<dyn DebugBackend> {
    Box::new(PlatformBackend::new())
}

#[cfg(not(any(target_os = "windows", all(target_os = "linux", target_arch = "x86_64"))))]
pub fn platform_backend() -> Box<dyn DebugBackend> {
    Box::new(UnsupportedBackend)
}

/// Stand-in for platforms without a debugging backend; every launch fails.
#[cfg(not(any(target_os = "windows", all(target_os = "linux", target_arch = "x86_64"))))]
struct UnsupportedBackend;

#[cfg(not(any(target_os = "windows", all(target_os = "linux", target_arch = "x86_64"))))]
impl DebugBackend for UnsupportedBackend {
    fn launch(&mut self, path: &Path, _args: &[String]) -> Result<Arc<dyn MemoryAccess>, DebugError> {
        Err(DebugError::Launch(format!(
            "{}: no debugging backend for this platform",
            path.display()
        )))
    }

    fn wait_for_event(&mut self) -> Result<DebugEvent, DebugError> {
        Err(DebugError::EventWait("no process".into()))
    }

    fn continue_event(&mut self, _event: &DebugEvent, _status: ContinueStatus) -> Result<(), DebugError> {
        Err(DebugError::Continue("no process".into()))
    }

    fn get_context(&mut self, tid: u32) -> Result<ThreadContext, DebugError> {
        Err(DebugError::ContextAccess {
            tid,
            reason: "no process".into(),
        })
    }

    fn set_context(&mut self, tid: u32, _context: &ThreadContext) -> Result<(), DebugError> {
        Err(DebugError::ContextAccess {
            tid,
            reason: "no process".into(),
        })
    }

    fn terminate(&mut self) -> Result<(), DebugError> {
        Ok(())
    }
}
