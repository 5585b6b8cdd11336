//! Disassembly module - x86/x64 instruction decoding backed by Capstone.

pub mod engine;

pub use engine::{Bitness, DisasmEngine, DisasmError, DisassembledInstruction};
