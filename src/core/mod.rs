//! Core module - Debugging engine
//!
//! This module contains the debug session and event loop, the exception
//! dispatcher, breakpoint management, context access, the loop/command
//! handshake and process memory utilities.

pub mod breakpoint;
pub mod context;
pub mod debugger;
pub mod exception;
pub mod handshake;
pub mod memory;
pub mod notice;

// Re-export common types
pub use breakpoint::{Breakpoint, BreakpointError, BreakpointManager};
pub use debugger::{BackendFactory, BreakpointRef, DebugError, Session, SessionConfig};
pub use handshake::Handshake;
pub use memory::{MemoryAccess, MemoryError, MemoryRegion};
pub use notice::{Notice, NoticeKind};
