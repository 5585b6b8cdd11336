//! Software breakpoint management
//!
//! A software breakpoint steals one byte of the instruction stream and
//! replaces it with `int3`. The manager keeps the stolen byte so the
//! original instruction can be put back when the trap fires or when the
//! breakpoint is deleted.

use std::sync::Arc;

use thiserror::Error;

use super::memory::{MemoryAccess, MemoryError};

/// INT3 opcode for software breakpoints
pub const INT3: u8 = 0xCC;

/// Width of the trap instruction; the instruction pointer is rolled back by
/// this much after the trap fires.
pub const TRAP_WIDTH: u64 = 1;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakpointError {
    #[error("Breakpoint already exists at {0:#x}")]
    AlreadyExists(u64),

    #[error("No breakpoint at {0:#x}")]
    NotFound(u64),

    #[error("Breakpoint index {index} out of range ({len} breakpoints)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Breakpoint types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakpointKind {
    /// Software breakpoint (INT3)
    #[default]
    Software,
    /// Hardware breakpoint (debug registers). Recognized, never armed.
    Hardware,
}

/// One instrumented location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub address: u64,
    pub kind: BreakpointKind,
    /// Byte overwritten by the trap instruction
    pub original_byte: u8,
    /// Discarded instead of re-armed after the first hit
    pub one_hit: bool,
    pub hit_count: u64,
    /// Trap byte currently written into the target
    pub armed: bool,
}

impl Breakpoint {
    pub fn is_software(&self) -> bool {
        self.kind == BreakpointKind::Software
    }
}

/// Owns the breakpoints of one debugged process
#[derive(Default)]
pub struct BreakpointManager {
    memory: Option<Arc<dyn MemoryAccess>>,
    breakpoints: Vec<Breakpoint>,
}

impl BreakpointManager {
    pub fn new(memory: Arc<dyn MemoryAccess>) -> Self {
        Self {
            memory: Some(memory),
            breakpoints: Vec::new(),
        }
    }

    fn memory(&self) -> Result<&dyn MemoryAccess, MemoryError> {
        self.memory.as_deref().ok_or(MemoryError::NoProcess)
    }

    /// Set a software breakpoint at `address`
    ///
    /// Nothing is registered, and the target is left untouched, when either
    /// the read of the original byte or the write of the trap byte fails.
    pub fn place(&mut self, address: u64, one_hit: bool) -> Result<(), BreakpointError> {
        if self.find(address).is_some() {
            return Err(BreakpointError::AlreadyExists(address));
        }

        let memory = self.memory()?;
        let original_byte = memory.read_u8(address)?;
        memory.write_all(address, &[INT3])?;
        if let Err(e) = memory.flush_code_cache(address, 1) {
            log::warn!("Cache flush after patching {:#x} failed: {}", address, e);
        }

        log::debug!(
            "Breakpoint placed at {:#x} (stolen byte {:#04x}, one-hit: {})",
            address,
            original_byte,
            one_hit
        );

        self.breakpoints.push(Breakpoint {
            address,
            kind: BreakpointKind::Software,
            original_byte,
            one_hit,
            hit_count: 0,
            armed: true,
        });
        Ok(())
    }

    /// Put the stolen byte back. No-op when already disarmed.
    pub fn restore(&mut self, address: u64) -> Result<(), BreakpointError> {
        let index = self.position(address)?;
        if !self.breakpoints[index].armed {
            return Ok(());
        }

        let original = self.breakpoints[index].original_byte;
        self.patch(address, original)?;
        self.breakpoints[index].armed = false;
        Ok(())
    }

    /// Write the trap byte again after the original instruction executed once.
    pub fn rearm(&mut self, address: u64) -> Result<(), BreakpointError> {
        let index = self.position(address)?;
        if self.breakpoints[index].armed {
            return Ok(());
        }

        self.patch(address, INT3)?;
        self.breakpoints[index].armed = true;
        Ok(())
    }

    fn patch(&self, address: u64, byte: u8) -> Result<(), BreakpointError> {
        let memory = self.memory()?;
        memory.write_all(address, &[byte])?;
        if let Err(e) = memory.flush_code_cache(address, 1) {
            log::warn!("Cache flush after patching {:#x} failed: {}", address, e);
        }
        Ok(())
    }

    fn position(&self, address: u64) -> Result<usize, BreakpointError> {
        self.breakpoints
            .iter()
            .position(|bp| bp.address == address)
            .ok_or(BreakpointError::NotFound(address))
    }

    pub fn find(&self, address: u64) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.address == address)
    }

    /// Record a hit on a breakpoint
    pub fn record_hit(&mut self, address: u64) -> Option<u64> {
        let bp = self.breakpoints.iter_mut().find(|bp| bp.address == address)?;
        bp.hit_count += 1;
        Some(bp.hit_count)
    }

    /// Remove a breakpoint, restoring the original byte first
    pub fn delete_by_address(&mut self, address: u64) -> Result<Breakpoint, BreakpointError> {
        let index = self.position(address)?;
        self.remove_at(index)
    }

    /// Remove the breakpoint at `index` in listing order
    pub fn delete_by_index(&mut self, index: usize) -> Result<Breakpoint, BreakpointError> {
        if index >= self.breakpoints.len() {
            return Err(BreakpointError::IndexOutOfRange {
                index,
                len: self.breakpoints.len(),
            });
        }
        self.remove_at(index)
    }

    fn remove_at(&mut self, index: usize) -> Result<Breakpoint, BreakpointError> {
        let address = self.breakpoints[index].address;
        // The entry survives a failed restore so the stolen byte is not lost.
        self.restore(address)?;
        Ok(self.breakpoints.remove(index))
    }

    /// Snapshot of all breakpoints in listing order
    pub fn list(&self) -> Vec<Breakpoint> {
        self.breakpoints.clone()
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    /// Replace armed trap bytes in a buffer read from `base` with the bytes
    /// they stole, so views of target memory show the real instructions.
    pub fn patch_view(&self, base: u64, buffer: &mut [u8]) {
        let end = base.saturating_add(buffer.len() as u64);
        for bp in self.breakpoints.iter().filter(|bp| bp.armed) {
            if bp.address >= base && bp.address < end {
                buffer[(bp.address - base) as usize] = bp.original_byte;
            }
        }
    }
}
