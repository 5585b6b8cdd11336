//! Disassembly Engine using Capstone
//!
//! Decodes instructions read from the debugged process for the context view
//! and the `disasm` command, and measures instruction length for step-over.

use capstone::prelude::*;
use thiserror::Error;

/// Disassembly errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisasmError {
    #[error("Capstone error: {0}")]
    Capstone(String),

    #[error("No valid instruction at {address:#x}")]
    NothingDecoded { address: u64 },
}

impl From<capstone::Error> for DisasmError {
    fn from(err: capstone::Error) -> Self {
        DisasmError::Capstone(err.to_string())
    }
}

/// Target architecture bitness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Bitness {
    Bit32 = 32,
    #[default]
    Bit64 = 64,
}

/// A single disassembled instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub length: usize,
}

impl DisassembledInstruction {
    /// `mnemonic operands`, Intel syntax
    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Capstone handles are not `Send`; build one per decoding request.
pub struct DisasmEngine {
    cs: Capstone,
}

impl DisasmEngine {
    pub fn new(bitness: Bitness) -> Result<Self, DisasmError> {
        let mode = match bitness {
            Bitness::Bit64 => arch::x86::ArchMode::Mode64,
            Bitness::Bit32 => arch::x86::ArchMode::Mode32,
        };

        let cs = Capstone::new()
            .x86()
            .mode(mode)
            .syntax(arch::x86::ArchSyntax::Intel)
            .build()?;

        Ok(Self { cs })
    }

    /// Decode at most `count` instructions from `bytes`, which were read at
    /// `address`. Decoding stops early at the first invalid encoding.
    pub fn disassemble(
        &self,
        bytes: &[u8],
        address: u64,
        count: usize,
    ) -> Result<Vec<DisassembledInstruction>, DisasmError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let insns = self.cs.disasm_count(bytes, address, count)?;
        let result: Vec<DisassembledInstruction> = insns
            .iter()
            .map(|insn| DisassembledInstruction {
                address: insn.address(),
                bytes: insn.bytes().to_vec(),
                mnemonic: insn.mnemonic().unwrap_or("???").to_string(),
                operands: insn.op_str().unwrap_or("").to_string(),
                length: insn.len(),
            })
            .collect();

        if result.is_empty() {
            return Err(DisasmError::NothingDecoded { address });
        }
        Ok(result)
    }
}
