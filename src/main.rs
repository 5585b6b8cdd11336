//! Trapdoor - Interactive user-mode process debugger
//!
//! Entry point that handles CLI argument parsing and mode switching
//! between the interactive REPL and the non-interactive batch runner.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;

use clap::Parser;

use trapdoor::app::parse_address;
use trapdoor::core::debugger::{BackendFactory, Session, SessionConfig};
use trapdoor::debug::platform_backend;
use trapdoor::debug::types::EventCategory;
use trapdoor::ui::batch::{run_batch, BatchPlan};
use trapdoor::ui::cli::run_cli;

/// Trapdoor: launch a program under the debugger
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target binary path to debug
    target: String,

    /// Arguments passed to the target
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Run without a REPL: print the context at every stop and continue
    #[arg(long, default_value_t = false)]
    batch: bool,

    /// Breakpoint address (hex), placed at the first stop; repeatable
    #[arg(short = 'b', long = "break", value_parser = parse_hex_address)]
    breakpoints: Vec<u64>,

    /// Do not break on the image entry point
    #[arg(long, default_value_t = false)]
    no_entry_break: bool,

    /// Event categories that suspend the target; repeatable
    #[arg(long = "interrupt-on", value_enum, default_values_t = [EventCategory::Exception])]
    interrupt_on: Vec<EventCategory>,

    /// Instructions shown with the registers at every stop
    #[arg(long, default_value_t = 5)]
    context_lines: usize,

    /// Batch mode: stop after this many suspensions
    #[arg(long)]
    max_stops: Option<usize>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_hex_address(s: &str) -> Result<u64, String> {
    parse_address(s).ok_or_else(|| format!("'{}' is not a hex address", s))
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        },
    ))
    .init();

    log::info!("Trapdoor v{}", env!("CARGO_PKG_VERSION"));
    log::debug!("Target: {} {:?}", args.target, args.args);
    log::debug!("Batch: {}", args.batch);

    // 3. Build the session
    let config = SessionConfig {
        target: args.target.clone().into(),
        args: args.args.clone(),
        interrupting: args.interrupt_on.iter().copied().collect::<BTreeSet<_>>(),
        break_on_entry: !args.no_entry_break,
        context_instructions: args.context_lines,
    };
    let factory: BackendFactory = Arc::new(platform_backend);
    let mut session = Session::new(config, factory);

    println!("[*] Debugging {}", args.target);
    session.start()?;

    // 4. Branch based on execution mode
    if args.batch {
        let plan = BatchPlan {
            breakpoints: args.breakpoints,
            max_stops: args.max_stops,
        };
        let summary = run_batch(session, &plan, std::io::stdout())?;
        println!(
            "[*] {} stop(s), target {}",
            summary.stops,
            if summary.exited { "exited" } else { "terminated" }
        );
    } else {
        if !args.breakpoints.is_empty() {
            if let Err(e) = place_initial_breakpoints(&session, &args.breakpoints) {
                log::warn!("{}", e);
            }
        }

        // The REPL is the command thread; the debug loop runs on its own
        let cli = thread::Builder::new()
            .name("commands".into())
            .spawn(move || run_cli(session))?;
        cli.join()
            .map_err(|_| anyhow::anyhow!("Command thread panicked"))??;
    }

    Ok(())
}

/// Place `-b` breakpoints once the target first stops
fn place_initial_breakpoints(session: &Session, addresses: &[u64]) -> anyhow::Result<()> {
    for &address in addresses {
        session.add_breakpoint(address)?;
        println!("[*] Breakpoint set at {:#x}", address);
    }
    Ok(())
}
