//! Integration tests against the native debugging backend
//!
//! The live-target test needs ptrace permission:
//! cargo test --test session_test -- --ignored --nocapture

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use trapdoor::app::{parse_command, Command};
    use trapdoor::core::debugger::{BackendFactory, DebugError, NoticeSink, Session, SessionConfig};
    use trapdoor::core::notice::Notice;
    use trapdoor::debug::platform_backend;
    use trapdoor::debug::types::DebugStatus;

    fn session(target: &str, notices: Arc<Mutex<Vec<Notice>>>) -> Session {
        let factory: BackendFactory = Arc::new(platform_backend);
        let sink: NoticeSink = Arc::new(move |notice: &Notice| {
            notices.lock().unwrap().push(notice.clone());
        });
        Session::new(SessionConfig::new(target), factory).with_sink(sink)
    }

    #[test]
    fn test_missing_target_fails_to_launch() {
        let notices = Arc::new(Mutex::new(Vec::new()));
        let mut session = session("/definitely/not/here/target.bin", notices);

        match session.start() {
            Err(DebugError::Launch(reason)) => println!("launch refused: {}", reason),
            other => panic!("expected a launch error, got {:?}", other),
        }
        assert_ne!(session.status(), DebugStatus::Suspended);
        assert!(matches!(
            session.continue_execution(),
            Err(DebugError::NotSuspended)
        ));
    }

    #[test]
    fn test_operator_script_parses() {
        let script = ["b 401000", "c", "ctx", "bl", "bd 0", "so", "x rsp", "q"];
        let parsed: Vec<Command> = script.iter().map(|line| parse_command(line)).collect();

        assert_eq!(parsed[0], Command::BreakpointSet(0x401000));
        assert_eq!(parsed[1], Command::Continue);
        assert_eq!(parsed[2], Command::Context);
        assert_eq!(parsed[3], Command::BreakpointList);
        assert!(matches!(parsed[4], Command::BreakpointDelete(_)));
        assert_eq!(parsed[5], Command::StepOver);
        assert!(matches!(parsed[6], Command::Invalid(_)));
        assert_eq!(parsed[7], Command::Exit);
    }

    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    #[test]
    #[ignore = "needs ptrace permission"]
    fn test_breaks_on_entry_and_runs_to_exit() {
        let notices = Arc::new(Mutex::new(Vec::new()));
        let mut session = session("/bin/true", notices.clone());
        session.start().expect("launch /bin/true");

        assert_eq!(session.wait_until_suspended(), DebugStatus::Suspended);
        let process = session.process().expect("process info");
        let ctx = session.context().expect("context at entry");
        assert_eq!(ctx.rip, process.entry_point);

        let listing = session.disassemble(ctx.rip, 3).expect("disassembly at entry");
        assert!(!listing.is_empty());
        assert_eq!(listing[0].address, ctx.rip);

        session.continue_execution().expect("continue");
        assert_eq!(session.wait_until_suspended(), DebugStatus::Exited);
        session.exit_session().expect("exit");

        let notices = notices.lock().unwrap();
        assert!(notices.iter().any(|n| n.text.contains("exited with code 0x00000000")));
    }
}
