//! CLI - reedline-based REPL interface
//!
//! The command thread: waits for the target to halt, shows where it stopped
//! and feeds operator input to the command router until the target runs again.

use anyhow::Result;
use colored::Colorize;
use reedline::{Prompt, PromptHistorySearch, PromptHistorySearchStatus, Reedline, Signal};
use std::borrow::Cow;
use std::io;

use crate::app::{parse_command, CommandRouter, Flow};
use crate::core::debugger::Session;
use crate::debug::types::DebugStatus;

/// Custom prompt for the Trapdoor REPL
pub struct TrapdoorPrompt {
    /// Instruction pointer of the stopped thread
    current_address: u64,
    status: DebugStatus,
}

impl TrapdoorPrompt {
    pub fn new() -> Self {
        Self {
            current_address: 0,
            status: DebugStatus::NotStarted,
        }
    }

    pub fn set_address(&mut self, addr: u64) {
        self.current_address = addr;
    }

    pub fn set_status(&mut self, status: DebugStatus) {
        self.status = status;
    }
}

impl Default for TrapdoorPrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl Prompt for TrapdoorPrompt {
    fn render_prompt_left(&self) -> Cow<'_, str> {
        Cow::Owned(format!("[{}:{:#x}]", self.status, self.current_address))
    }

    fn render_prompt_right(&self) -> Cow<'_, str> {
        Cow::Borrowed("")
    }

    fn render_prompt_indicator(&self, _prompt_mode: reedline::PromptEditMode) -> Cow<'_, str> {
        Cow::Borrowed("> ")
    }

    fn render_prompt_multiline_indicator(&self) -> Cow<'_, str> {
        Cow::Borrowed("... ")
    }

    fn render_prompt_history_search_indicator(
        &self,
        history_search: PromptHistorySearch,
    ) -> Cow<'_, str> {
        let prefix = match history_search.status {
            PromptHistorySearchStatus::Passing => "",
            PromptHistorySearchStatus::Failing => "(failed) ",
        };
        Cow::Owned(format!("(search: {}{}) ", prefix, history_search.term))
    }
}

/// Run the interactive debugger on an already started session
pub fn run_cli(mut session: Session) -> Result<()> {
    let mut line_editor = Reedline::create();
    let mut prompt = TrapdoorPrompt::new();
    let mut router = CommandRouter::new(io::stdout());

    println!(
        "{}",
        "╔══════════════════════════════════════════════════════════════╗".cyan()
    );
    println!(
        "{}",
        "║  Trapdoor - Type '?' for help, 'q' to quit                   ║".cyan()
    );
    println!(
        "{}",
        "╚══════════════════════════════════════════════════════════════╝".cyan()
    );

    'halts: loop {
        let status = session.handshake().wait_for_halt();
        router.announce(&session, status)?;
        prompt.set_status(status);
        prompt.set_address(session.context().map(|ctx| ctx.rip).unwrap_or(0));

        loop {
            match line_editor.read_line(&prompt)? {
                Signal::Success(buffer) => {
                    let command = parse_command(&buffer);
                    match router.dispatch(&mut session, command)? {
                        Flow::Stay => {}
                        Flow::Resume => continue 'halts,
                        Flow::Exit => break 'halts,
                    }
                }
                Signal::CtrlD | Signal::CtrlC => {
                    println!("\n[*] Interrupted");
                    session.stop()?;
                    break 'halts;
                }
            }
        }
    }

    Ok(())
}
