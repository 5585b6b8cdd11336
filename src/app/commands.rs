//! Command processing
//!
//! Operator input is parsed into a [`Command`] here; the router decides what
//! each command does to the session.

use crate::core::debugger::BreakpointRef;

/// Instructions listed by `disasm` without an explicit count
pub const DEFAULT_DISASM_COUNT: usize = 10;

/// Bytes dumped by `hexdump` without an explicit size
pub const DEFAULT_HEXDUMP_SIZE: usize = 64;

/// Largest `hexdump` accepted from the operator
pub const MAX_HEXDUMP_SIZE: usize = 0x10000;

/// Operator commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Resume the target: c
    Continue,
    /// Restart the target: r
    Run,
    /// Stop debugging and leave: q
    Exit,
    /// Registers plus disassembly at rip: ctx
    Context,
    /// Set breakpoint: b <addr>
    BreakpointSet(u64),
    /// Delete breakpoint: bd <index | 0xaddr>
    BreakpointDelete(BreakpointRef),
    /// List breakpoints: bl
    BreakpointList,
    /// Disassemble: u <addr> <count>
    Disassemble { address: u64, count: usize },
    /// Hexdump: x <addr> <size>
    Hexdump { address: u64, size: usize },
    /// Memory regions: dm
    Regions,
    /// Single step: si
    StepInto,
    /// Step over: so
    StepOver,
    /// Help: ? or help
    Help,
    /// Blank line
    Empty,
    /// Known command with unusable arguments
    Invalid(String),
    /// Unknown command
    Unknown(String),
}

/// Parse a command string into a structured command
pub fn parse_command(input: &str) -> Command {
    let input = input.trim();
    let mut parts = input.split_whitespace();
    let Some(cmd) = parts.next() else {
        return Command::Empty;
    };
    let args: Vec<&str> = parts.collect();

    match cmd.to_ascii_lowercase().as_str() {
        "c" | "cont" | "continue" => Command::Continue,
        "r" | "run" => Command::Run,
        "e" | "exit" | "q" | "quit" => Command::Exit,
        "context" | "ctx" | "regs" => Command::Context,

        // Breakpoints
        "b" | "br" | "bp" | "breakpoint" => match args.first() {
            Some(addr) => match parse_address(addr) {
                Some(address) => Command::BreakpointSet(address),
                None => Command::Invalid(format!("Invalid address '{}'", addr)),
            },
            None => Command::Invalid("usage: breakpoint <address>".into()),
        },
        "bd" | "delete" => match args.first() {
            Some(target) => match parse_breakpoint_ref(target) {
                Some(which) => Command::BreakpointDelete(which),
                None => Command::Invalid(format!("Invalid index or address '{}'", target)),
            },
            None => Command::Invalid("usage: delete <index | 0xaddress>".into()),
        },
        "bl" | "breakpoints" => Command::BreakpointList,

        // Memory
        "disasm" | "disassembly" | "u" => {
            match parse_range(&args, DEFAULT_DISASM_COUNT) {
                Ok((address, count)) => Command::Disassemble { address, count },
                Err(msg) => Command::Invalid(format!("{} (usage: disasm <address> <count>)", msg)),
            }
        }
        "x" | "hexdump" => match parse_range(&args, DEFAULT_HEXDUMP_SIZE) {
            Ok((_, size)) if size > MAX_HEXDUMP_SIZE => Command::Invalid(format!(
                "Size {:#x} is over the {:#x} byte limit",
                size, MAX_HEXDUMP_SIZE
            )),
            Ok((address, size)) => Command::Hexdump { address, size },
            Err(msg) => Command::Invalid(format!("{} (usage: hexdump <address> <size>)", msg)),
        },
        "regions" | "vmmap" | "dm" => Command::Regions,

        // Stepping
        "si" | "stepi" | "step" => Command::StepInto,
        "so" | "n" | "next" | "stepover" => Command::StepOver,

        "h" | "help" | "?" => Command::Help,

        _ => Command::Unknown(input.to_string()),
    }
}

/// `<address> [amount]`
fn parse_range(args: &[&str], default_amount: usize) -> Result<(u64, usize), String> {
    let addr = args.first().ok_or_else(|| "Missing address".to_string())?;
    let address = parse_address(addr).ok_or_else(|| format!("Invalid address '{}'", addr))?;
    let amount = match args.get(1) {
        Some(amount) => parse_amount(amount).ok_or_else(|| format!("Invalid amount '{}'", amount))?,
        None => default_amount,
    };
    Ok((address, amount))
}

/// Addresses are hexadecimal, with or without a `0x` prefix
pub fn parse_address(s: &str) -> Option<u64> {
    let s = s.trim();
    let digits = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
        .replace('`', "");
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(&digits, 16).ok()
}

/// Counts and sizes are decimal unless prefixed with `0x`
fn parse_amount(s: &str) -> Option<usize> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

/// A bare number is a listing index; a `0x` prefix makes it an address
fn parse_breakpoint_ref(s: &str) -> Option<BreakpointRef> {
    if s.starts_with("0x") || s.starts_with("0X") {
        parse_address(s).map(BreakpointRef::Address)
    } else {
        s.parse().ok().map(BreakpointRef::Index)
    }
}
