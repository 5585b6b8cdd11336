//! Text rendering of debugger state for the console.
//!
//! Every function returns a `String` so the router can write it to any sink.

use std::fmt::Write;

use colored::Colorize;

use crate::core::breakpoint::Breakpoint;
use crate::core::memory::MemoryRegion;
use crate::debug::types::ThreadContext;
use crate::disasm::DisassembledInstruction;

const HEXDUMP_WIDTH: usize = 16;

/// General purpose registers, four per row, then rip and rflags
pub fn registers(ctx: &ThreadContext) -> String {
    let mut out = String::new();
    for row in ctx.general_registers().chunks(4) {
        let line: Vec<String> = row
            .iter()
            .map(|(name, value)| format!("{:>3} = {:016x}", name, value))
            .collect();
        let _ = writeln!(out, "{}", line.join("  "));
    }
    let _ = writeln!(
        out,
        "RIP = {}  RFLAGS = {:08x}{}",
        format!("{:016x}", ctx.rip).yellow(),
        ctx.rflags,
        if ctx.trap_flag() { " [TF]" } else { "" }
    );
    out
}

/// Disassembly listing; `current` marks the instruction at rip and `*` marks
/// instructions carrying a breakpoint.
pub fn listing(
    insns: &[DisassembledInstruction],
    current: Option<u64>,
    breakpoints: &[Breakpoint],
) -> String {
    let mut out = String::new();
    for insn in insns {
        let marker = if current == Some(insn.address) { "=>" } else { "  " };
        let bp = if breakpoints.iter().any(|bp| bp.address == insn.address) {
            "*"
        } else {
            " "
        };
        let line = format!(
            "{}{} {:016x}  {:<20} {}",
            marker,
            bp,
            insn.address,
            hex::encode(&insn.bytes),
            insn.text()
        );
        if current == Some(insn.address) {
            let _ = writeln!(out, "{}", line.bold());
        } else {
            let _ = writeln!(out, "{}", line);
        }
    }
    out
}

/// Classic 16-bytes-per-row dump with an ASCII column
pub fn hexdump(address: u64, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(HEXDUMP_WIDTH).enumerate() {
        let hex_cols: Vec<String> = chunk.iter().map(|b| hex::encode([*b])).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        let _ = writeln!(
            out,
            "{:016x}  {:<width$}  |{}|",
            address + (row * HEXDUMP_WIDTH) as u64,
            hex_cols.join(" "),
            ascii,
            width = HEXDUMP_WIDTH * 3 - 1
        );
    }
    out
}

pub fn regions(regions: &[MemoryRegion]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<18} {:<18} {:>10}  {}  {}",
        "start", "end", "size", "prot", "name"
    );
    for region in regions {
        let _ = writeln!(
            out,
            "{:016x}   {:016x}   {:>10x}  {}   {}",
            region.base_address,
            region.end_address(),
            region.size,
            region.protection,
            region.name.as_deref().unwrap_or("")
        );
    }
    out
}

pub fn breakpoints(breakpoints: &[Breakpoint]) -> String {
    if breakpoints.is_empty() {
        return "No breakpoints\n".to_string();
    }
    let mut out = String::new();
    for (index, bp) in breakpoints.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:>3}  {:016x}  hits {:<5} {}{}",
            index,
            bp.address,
            bp.hit_count,
            if bp.armed { "armed" } else { "pending re-arm" },
            if bp.one_hit { " (one-hit)" } else { "" }
        );
    }
    out
}

/// Operator command reference
pub fn help() -> String {
    let sections: [(&str, &[(&str, &str)]); 5] = [
        (
            "Execution:",
            &[
                ("c, continue", "Resume the target"),
                ("si, step", "Execute one instruction"),
                ("so, next", "Step over the current instruction"),
                ("r, run", "Restart the target"),
                ("q, exit", "Terminate the target and quit"),
            ],
        ),
        (
            "Breakpoints:",
            &[
                ("b <addr>", "Set breakpoint"),
                ("bd <index|0xaddr>", "Delete breakpoint"),
                ("bl", "List breakpoints"),
            ],
        ),
        (
            "State:",
            &[("ctx, regs", "Registers and code at rip")],
        ),
        (
            "Memory:",
            &[
                ("u <addr> <count>", "Disassemble"),
                ("x <addr> <size>", "Hexdump"),
                ("dm, regions", "Show memory map"),
            ],
        ),
        ("Other:", &[("?, help", "Show this help")]),
    ];

    let mut out = String::new();
    let _ = writeln!(out, "{}", "Trapdoor Commands".bold().cyan());
    let _ = writeln!(out, "{}", "═".repeat(50).cyan());
    for (title, commands) in sections {
        let _ = writeln!(out, "\n{}", title.bold().yellow());
        for (syntax, what) in commands {
            let _ = writeln!(out, "  {} {}", format!("{:<20}", syntax).green(), what);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::breakpoint::BreakpointKind;
    use crate::core::memory::MemoryProtection;

    fn plain() {
        colored::control::set_override(false);
    }

    #[test]
    fn test_hexdump_rows() {
        plain();
        let bytes: Vec<u8> = (0x41..0x41 + 20).collect();
        let dump = hexdump(0x1000, &bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000000000001000  41 42 43"));
        assert!(lines[0].ends_with("|ABCDEFGHIJKLMNOP|"));
        assert!(lines[1].starts_with("0000000000001010  51 52 53 54"));
        assert!(lines[1].ends_with("|QRST|"));
    }

    #[test]
    fn test_hexdump_non_printable() {
        plain();
        let dump = hexdump(0, &[0x00, 0xCC, b'a']);
        assert!(dump.contains("00 cc 61"));
        assert!(dump.trim_end().ends_with("|..a|"));
    }

    #[test]
    fn test_registers() {
        plain();
        let ctx = ThreadContext {
            rax: 0x1234,
            rip: 0x1_4000_1000,
            rflags: 0x346,
            ..ThreadContext::default()
        };
        let text = registers(&ctx);
        assert!(text.contains("RAX = 0000000000001234"));
        assert!(text.contains("R15 = 0000000000000000"));
        assert!(text.contains("RIP = 0000000140001000"));
        assert!(text.contains("[TF]"));
        assert_eq!(text.lines().count(), 5);
    }

    #[test]
    fn test_breakpoint_listing() {
        plain();
        assert_eq!(breakpoints(&[]), "No breakpoints\n");

        let bps = vec![
            Breakpoint {
                address: 0x401000,
                kind: BreakpointKind::Software,
                original_byte: 0x55,
                one_hit: false,
                hit_count: 3,
                armed: true,
            },
            Breakpoint {
                address: 0x401005,
                kind: BreakpointKind::Software,
                original_byte: 0x90,
                one_hit: true,
                hit_count: 0,
                armed: true,
            },
        ];
        let text = breakpoints(&bps);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("  0  0000000000401000  hits 3"));
        assert!(lines[1].ends_with("(one-hit)"));
    }

    #[test]
    fn test_listing_marks_current_and_breakpoints() {
        plain();
        let insns = vec![
            DisassembledInstruction {
                address: 0x10,
                bytes: vec![0x90],
                mnemonic: "nop".into(),
                operands: String::new(),
                length: 1,
            },
            DisassembledInstruction {
                address: 0x11,
                bytes: vec![0x48, 0xff, 0xc0],
                mnemonic: "inc".into(),
                operands: "rax".into(),
                length: 3,
            },
        ];
        let bp = Breakpoint {
            address: 0x11,
            kind: BreakpointKind::Software,
            original_byte: 0x48,
            one_hit: false,
            hit_count: 0,
            armed: true,
        };
        let text = listing(&insns, Some(0x10), &[bp]);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("=>  0000000000000010  90"));
        assert!(lines[1].starts_with("  * 0000000000000011  48ffc0"));
        assert!(lines[1].ends_with("inc rax"));
    }

    #[test]
    fn test_regions() {
        plain();
        let text = regions(&[MemoryRegion {
            base_address: 0x400000,
            size: 0x1000,
            protection: MemoryProtection::RX,
            name: Some("/bin/true".into()),
        }]);
        let row = text.lines().nth(1).unwrap();
        assert!(row.starts_with("0000000000400000   0000000000401000"));
        assert!(row.contains("r-x"));
        assert!(row.ends_with("/bin/true"));
    }
}
