//! Command router
//!
//! Maps each parsed [`Command`] onto the session while the target is
//! suspended, writing results and diagnostics to an output sink.

use std::io::{self, Write};

use colored::Colorize;

use crate::core::debugger::{DebugError, Session};
use crate::debug::types::DebugStatus;
use crate::ui::render;

use super::commands::Command;

/// What the command thread does after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Read another command
    Stay,
    /// The target runs again; wait for the next halt
    Resume,
    /// Leave the debugger
    Exit,
}

pub struct CommandRouter<W: Write> {
    out: W,
}

impl<W: Write> CommandRouter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn diagnostic(&mut self, message: impl std::fmt::Display) -> io::Result<()> {
        writeln!(self.out, "{} {}", "[!]".red(), message)
    }

    /// Registers of the stopped thread followed by the code at rip
    pub fn show_context(&mut self, session: &Session) -> io::Result<()> {
        let Some(ctx) = session.context() else {
            return self.diagnostic(DebugError::NoContext);
        };
        write!(self.out, "{}", render::registers(&ctx))?;

        let count = session.config().context_instructions;
        if count == 0 {
            return Ok(());
        }
        match session.disassemble(ctx.rip, count) {
            Ok(insns) => write!(
                self.out,
                "{}",
                render::listing(&insns, Some(ctx.rip), &session.breakpoints())
            ),
            Err(e) => self.diagnostic(e),
        }
    }

    pub fn dispatch(&mut self, session: &mut Session, command: Command) -> io::Result<Flow> {
        log::trace!("Dispatching {:?}", command);

        match command {
            Command::Empty => Ok(Flow::Stay),

            Command::Continue => match session.resume() {
                Ok(()) => Ok(Flow::Resume),
                Err(e) => self.diagnostic(e).map(|_| Flow::Stay),
            },

            Command::Run => match session.restart() {
                Ok(()) => Ok(Flow::Resume),
                Err(e) => self.diagnostic(e).map(|_| Flow::Stay),
            },

            Command::Exit => {
                if let Err(e) = session.stop() {
                    log::warn!("Debug loop ended with: {}", e);
                }
                writeln!(self.out, "[*] Shutting down...")?;
                Ok(Flow::Exit)
            }

            Command::Context => self.show_context(session).map(|_| Flow::Stay),

            Command::BreakpointSet(address) => {
                match session.place_breakpoint(address) {
                    Ok(()) => writeln!(self.out, "[*] Breakpoint set at {:#x}", address)?,
                    Err(e) => self.diagnostic(e)?,
                }
                Ok(Flow::Stay)
            }

            Command::BreakpointDelete(which) => {
                match session.delete_breakpoint(which) {
                    Ok(bp) => writeln!(self.out, "[*] Breakpoint deleted at {:#x}", bp.address)?,
                    Err(e) => self.diagnostic(e)?,
                }
                Ok(Flow::Stay)
            }

            Command::BreakpointList => {
                write!(self.out, "{}", render::breakpoints(&session.breakpoints()))?;
                Ok(Flow::Stay)
            }

            Command::Disassemble { address, count } => {
                let current = session.context().map(|ctx| ctx.rip);
                match session.disassemble(address, count) {
                    Ok(insns) => write!(
                        self.out,
                        "{}",
                        render::listing(&insns, current, &session.breakpoints())
                    )?,
                    Err(e) => self.diagnostic(e)?,
                }
                Ok(Flow::Stay)
            }

            Command::Hexdump { address, size } => {
                match session.read_memory(address, size) {
                    Ok(bytes) => {
                        write!(self.out, "{}", render::hexdump(address, &bytes))?;
                        if bytes.len() < size {
                            writeln!(
                                self.out,
                                "[*] Only {} of {} bytes readable",
                                bytes.len(),
                                size
                            )?;
                        }
                    }
                    Err(e) => self.diagnostic(e)?,
                }
                Ok(Flow::Stay)
            }

            Command::Regions => {
                match session.refresh_regions() {
                    Ok(regions) => write!(self.out, "{}", render::regions(&regions))?,
                    Err(e) => self.diagnostic(e)?,
                }
                Ok(Flow::Stay)
            }

            Command::StepInto => match session.step_into() {
                Ok(()) => Ok(Flow::Resume),
                Err(e) => self.diagnostic(e).map(|_| Flow::Stay),
            },

            Command::StepOver => match session.step_over() {
                Ok(next) => {
                    log::debug!("Stepping over to {:#x}", next);
                    Ok(Flow::Resume)
                }
                Err(e) => self.diagnostic(e).map(|_| Flow::Stay),
            },

            Command::Help => {
                write!(self.out, "{}", render::help())?;
                Ok(Flow::Stay)
            }

            Command::Invalid(message) => self.diagnostic(message).map(|_| Flow::Stay),

            Command::Unknown(input) => {
                self.diagnostic(format!("Unknown command: '{}'", input))?;
                writeln!(self.out, "    Type '?' for help")?;
                Ok(Flow::Stay)
            }
        }
    }

    /// Header printed whenever the command thread gains control
    pub fn announce(&mut self, session: &Session, status: DebugStatus) -> io::Result<()> {
        match status {
            DebugStatus::Exited => writeln!(
                self.out,
                "[*] No process is being debugged ('r' to run again, 'q' to quit)"
            ),
            _ => self.show_context(session),
        }
    }
}
