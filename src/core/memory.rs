//! Memory - Process memory operations
//!
//! Provides unified memory read/write/mapping operations across platforms.

use thiserror::Error;

/// Memory operation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },

    #[error("Short write at {address:#x}: {written} of {expected} bytes")]
    Partial {
        address: u64,
        written: usize,
        expected: usize,
    },

    #[error("No process attached")]
    NoProcess,
}

/// Memory protection flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryProtection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl MemoryProtection {
    pub const RX: Self = Self {
        read: true,
        write: false,
        execute: true,
    };
    pub const RW: Self = Self {
        read: true,
        write: true,
        execute: false,
    };
    pub const NONE: Self = Self {
        read: false,
        write: false,
        execute: false,
    };
}

impl std::fmt::Display for MemoryProtection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.execute { 'x' } else { '-' }
        )
    }
}

/// Represents a memory region in the target process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Start address of the region
    pub base_address: u64,

    /// Size of the region in bytes
    pub size: usize,

    /// Memory protection flags
    pub protection: MemoryProtection,

    /// Optional name (e.g., module name, "[stack]", "[heap]")
    pub name: Option<String>,
}

impl MemoryRegion {
    pub fn end_address(&self) -> u64 {
        self.base_address + self.size as u64
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address < self.end_address()
    }
}

/// Byte-level access to the address space of the debugged process.
///
/// Implementations must be usable from both the event loop thread and the
/// command thread.
pub trait MemoryAccess: Send + Sync {
    /// Read memory into an existing buffer, returning the number of bytes read
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError>;

    /// Write memory to the target process, returning the number of bytes written
    fn write(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError>;

    /// Make the CPU observe code bytes patched in `[address, address + len)`
    fn flush_code_cache(&self, address: u64, len: usize) -> Result<(), MemoryError>;

    /// Enumerate the mapped regions of the target process
    fn query_regions(&self) -> Result<Vec<MemoryRegion>, MemoryError>;

    /// Read up to `size` bytes; the result may be shorter at the end of a mapping
    fn read(&self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        let mut buffer = vec![0u8; size];
        let read = self.read_into(address, &mut buffer)?;
        buffer.truncate(read);
        Ok(buffer)
    }

    fn read_u8(&self, address: u64) -> Result<u8, MemoryError> {
        let mut byte = [0u8; 1];
        match self.read_into(address, &mut byte)? {
            1 => Ok(byte[0]),
            _ => Err(MemoryError::ReadFailed {
                address,
                reason: "no bytes readable".into(),
            }),
        }
    }

    /// Write all of `data` or fail
    fn write_all(&self, address: u64, data: &[u8]) -> Result<(), MemoryError> {
        let written = self.write(address, data)?;
        if written != data.len() {
            return Err(MemoryError::Partial {
                address,
                written,
                expected: data.len(),
            });
        }
        Ok(())
    }
}

/// Cached view of the target's memory regions
#[derive(Debug, Default, Clone)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
}

impl MemoryMap {
    /// Re-enumerate the regions of the target, returning how many were found
    pub fn refresh(&mut self, memory: &dyn MemoryAccess) -> Result<usize, MemoryError> {
        let mut regions = memory.query_regions()?;
        regions.sort_by_key(|r| r.base_address);
        self.regions = regions;
        Ok(self.regions.len())
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// Region holding `address`
    pub fn find(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions.iter().find(|r| r.contains(address))
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

/// Parse the contents of `/proc/<pid>/maps`
///
/// Lines look like `55d0c9a00000-55d0c9a02000 r-xp 00000000 08:01 1234  /usr/bin/cat`.
pub fn parse_proc_maps(text: &str) -> Vec<MemoryRegion> {
    text.lines().filter_map(parse_maps_line).collect()
}

fn parse_maps_line(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    // offset, device, inode
    let _ = (fields.next()?, fields.next()?, fields.next()?);
    let name: Vec<&str> = fields.collect();

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end < start {
        return None;
    }

    let perms = perms.as_bytes();
    let protection = MemoryProtection {
        read: perms.first() == Some(&b'r'),
        write: perms.get(1) == Some(&b'w'),
        execute: perms.get(2) == Some(&b'x'),
    };

    Some(MemoryRegion {
        base_address: start,
        size: (end - start) as usize,
        protection,
        name: if name.is_empty() {
            None
        } else {
            Some(name.join(" "))
        },
    })
}

/// Memory access to a live process through the native OS interfaces
pub struct ProcessMemory {
    #[cfg(target_os = "windows")]
    process_handle: isize,

    #[cfg(target_os = "linux")]
    target_pid: u32,
}

#[cfg(target_os = "windows")]
impl ProcessMemory {
    /// Wrap a process handle opened with VM read/write/operation rights.
    /// The handle stays owned by the caller.
    pub fn new(process_handle: isize) -> Self {
        Self { process_handle }
    }

    fn handle(&self) -> windows::Win32::Foundation::HANDLE {
        windows::Win32::Foundation::HANDLE(self.process_handle)
    }
}

#[cfg(target_os = "linux")]
impl ProcessMemory {
    pub fn new(pid: u32) -> Self {
        Self { target_pid: pid }
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.target_pid)
    }
}

// Windows-specific implementations
#[cfg(target_os = "windows")]
impl MemoryAccess for ProcessMemory {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        use windows::Win32::System::Diagnostics::Debug::ReadProcessMemory;

        let mut bytes_read = 0usize;

        unsafe {
            ReadProcessMemory(
                self.handle(),
                address as *const std::ffi::c_void,
                buffer.as_mut_ptr() as *mut std::ffi::c_void,
                buffer.len(),
                Some(&mut bytes_read),
            )
            .map_err(|e| MemoryError::ReadFailed {
                address,
                reason: e.to_string(),
            })?;
        }

        Ok(bytes_read)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError> {
        use windows::Win32::System::Diagnostics::Debug::WriteProcessMemory;

        let mut bytes_written = 0usize;

        unsafe {
            WriteProcessMemory(
                self.handle(),
                address as *const std::ffi::c_void,
                data.as_ptr() as *const std::ffi::c_void,
                data.len(),
                Some(&mut bytes_written),
            )
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: e.to_string(),
            })?;
        }

        Ok(bytes_written)
    }

    fn flush_code_cache(&self, address: u64, len: usize) -> Result<(), MemoryError> {
        use windows::Win32::System::Diagnostics::Debug::FlushInstructionCache;

        unsafe {
            FlushInstructionCache(
                self.handle(),
                Some(address as *const std::ffi::c_void),
                len,
            )
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: format!("FlushInstructionCache: {}", e),
            })
        }
    }

    fn query_regions(&self) -> Result<Vec<MemoryRegion>, MemoryError> {
        use windows::Win32::System::Memory::{VirtualQueryEx, MEMORY_BASIC_INFORMATION, MEM_COMMIT};

        let mut regions = Vec::new();
        let mut address = 0u64;

        loop {
            let mut info = MEMORY_BASIC_INFORMATION::default();
            let written = unsafe {
                VirtualQueryEx(
                    self.handle(),
                    Some(address as *const std::ffi::c_void),
                    &mut info,
                    std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                )
            };
            if written == 0 {
                break;
            }

            let base = info.BaseAddress as u64;
            let size = info.RegionSize;
            if info.State == MEM_COMMIT {
                regions.push(MemoryRegion {
                    base_address: base,
                    size,
                    protection: page_protection(info.Protect.0),
                    name: None,
                });
            }

            let next = base.saturating_add(size as u64);
            if next <= address {
                break;
            }
            address = next;
        }

        Ok(regions)
    }
}

#[cfg(target_os = "windows")]
fn page_protection(protect: u32) -> MemoryProtection {
    const EXECUTE_ANY: u32 = 0x10 | 0x20 | 0x40 | 0x80;
    const WRITE_ANY: u32 = 0x04 | 0x08 | 0x40 | 0x80;
    const READ_ANY: u32 = 0x02 | 0x04 | 0x08 | 0x20 | 0x40 | 0x80;

    MemoryProtection {
        read: protect & READ_ANY != 0,
        write: protect & WRITE_ANY != 0,
        execute: protect & EXECUTE_ANY != 0,
    }
}

// Linux-specific implementations
#[cfg(target_os = "linux")]
impl MemoryAccess for ProcessMemory {
    fn read_into(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        use std::fs::File;
        use std::io::{Read, Seek, SeekFrom};

        let mut file = File::open(self.mem_path()).map_err(|e| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        })?;

        file.seek(SeekFrom::Start(address))
            .map_err(|e| MemoryError::ReadFailed {
                address,
                reason: e.to_string(),
            })?;

        let bytes_read = file.read(buffer).map_err(|e| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        })?;

        Ok(bytes_read)
    }

    fn write(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError> {
        use std::fs::OpenOptions;
        use std::io::{Seek, SeekFrom, Write};

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.mem_path())
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: e.to_string(),
            })?;

        file.seek(SeekFrom::Start(address))
            .map_err(|e| MemoryError::WriteFailed {
                address,
                reason: e.to_string(),
            })?;

        let bytes_written = file.write(data).map_err(|e| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        })?;

        Ok(bytes_written)
    }

    // x86 keeps the instruction cache coherent with writes through /proc/<pid>/mem
    fn flush_code_cache(&self, _address: u64, _len: usize) -> Result<(), MemoryError> {
        Ok(())
    }

    fn query_regions(&self) -> Result<Vec<MemoryRegion>, MemoryError> {
        let maps_path = format!("/proc/{}/maps", self.target_pid);
        let text = std::fs::read_to_string(&maps_path).map_err(|e| MemoryError::ReadFailed {
            address: 0,
            reason: format!("{}: {}", maps_path, e),
        })?;
        Ok(parse_proc_maps(&text))
    }
}
