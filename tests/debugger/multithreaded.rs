use crate::common::{launch, TestInfo};
use crate::{assert_no_proc, MT_APP};
use haltpoint::debugger::control::ptrace::PtraceControl;
use haltpoint::debugger::control::ProcessControl;
use haltpoint::debugger::{StopReason, TraceeStatus};
use serial_test::serial;
use std::mem;
use std::path::Path;

#[test]
#[serial]
fn test_multithreaded_breakpoints() {
    let info = TestInfo::default();
    let mut debugger = launch(MT_APP, &[], &info);
    let pid = debugger.pid();

    debugger
        .install_breakpoint_at_line(Path::new("mt.rs"), 21, None)
        .unwrap();
    debugger
        .install_breakpoint_at_line(Path::new("mt.rs"), 32, None)
        .unwrap();

    for _ in 0..2 {
        let event = debugger.continue_debugee().unwrap();
        assert!(matches!(event.reason, StopReason::Breakpoint(_)));
        assert_ne!(event.thread, pid);

        let threads = debugger.threads();
        assert!(threads.len() >= 2);
        assert!(threads
            .iter()
            .all(|t| matches!(t.status, TraceeStatus::Stopped(_))));
        let focus: Vec<_> = threads.iter().filter(|t| t.in_focus).collect();
        assert_eq!(focus.len(), 1);
        assert_eq!(focus[0].tid, event.thread);

        let mut tracked: Vec<_> = threads.iter().map(|t| t.tid).collect();
        tracked.sort();
        let mut os_threads = PtraceControl::new(pid).thread_ids().unwrap();
        os_threads.sort();
        assert_eq!(tracked, os_threads);
    }

    let mut lines = info.lines_hit.take();
    lines.sort();
    assert_eq!(lines, vec![21, 32]);

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
    assert!(info.new_threads.get() >= 2);

    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_step_over_in_thread() {
    let info = TestInfo::default();
    let mut debugger = launch(MT_APP, &[], &info);
    let pid = debugger.pid();

    let mut handles = debugger
        .install_breakpoint_at_line(Path::new("mt.rs"), 17, None)
        .unwrap();
    let event = debugger.continue_debugee().unwrap();
    let thread = event.thread;
    assert_ne!(thread, pid);
    assert_eq!(info.line.take(), Some(17));
    debugger.remove_breakpoint(handles.remove(0)).unwrap();

    let event = debugger.step_over().unwrap();
    assert_eq!(event.reason, StopReason::Step);
    assert_eq!(event.thread, thread);
    assert_eq!(info.line.take(), Some(18));

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));

    mem::drop(debugger);
    assert_no_proc!(pid);
}
