use crate::common::{launch, TestInfo};
use crate::{assert_no_proc, HELLO_APP, RECURSION_APP};
use haltpoint::debugger::{Condition, StopReason};
use serial_test::serial;
use std::mem;
use std::path::Path;

#[test]
#[serial]
fn test_step_over() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);
    let pid = debugger.pid();

    debugger
        .install_breakpoint_at_line(Path::new("hello.rs"), 5, None)
        .unwrap();
    debugger.continue_debugee().unwrap();
    assert_eq!(info.line.take(), Some(5));

    let event = debugger.step_over().unwrap();
    assert_eq!(event.reason, StopReason::Step);
    assert_eq!(info.line.take(), Some(7));
    debugger.step_over().unwrap();
    assert_eq!(info.line.take(), Some(9));
    debugger.step_over().unwrap();
    assert_eq!(info.line.take(), Some(10));

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_step_into_and_out() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);
    let pid = debugger.pid();

    debugger
        .install_breakpoint_at_line(Path::new("hello.rs"), 9, None)
        .unwrap();
    debugger.continue_debugee().unwrap();
    assert_eq!(info.line.take(), Some(9));

    let event = debugger.step_into().unwrap();
    assert_eq!(event.reason, StopReason::Step);
    let function = info.function.take().unwrap();
    assert!(function.ends_with("sum"), "unexpected function {function}");
    let line = info.line.take().unwrap();
    assert!((19..=20).contains(&line), "unexpected line {line}");

    let event = debugger.step_out().unwrap();
    assert_eq!(event.reason, StopReason::StepOut);
    assert_eq!(info.line.take(), Some(9));
    let function = info.function.take().unwrap();
    assert!(function.ends_with("main"), "unexpected function {function}");

    debugger.step_over().unwrap();
    assert_eq!(info.line.take(), Some(10));

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_step_over_recursion() {
    let info = TestInfo::default();
    let mut debugger = launch(RECURSION_APP, &[], &info);
    let pid = debugger.pid();

    // third call of depth, level = 3
    let mut handles = debugger
        .install_breakpoint_at_line(Path::new("recursion.rs"), 5, Some(Condition::hit_count_ge(3)))
        .unwrap();
    assert_eq!(handles.len(), 1);
    debugger.continue_debugee().unwrap();
    assert_eq!(info.line.take(), Some(5));
    assert_eq!(info.breakpoint_hits.get(), 1);
    debugger.remove_breakpoint(handles.remove(0)).unwrap();

    debugger.step_over().unwrap();
    assert_eq!(info.line.take(), Some(8));

    // recursive calls of depth stay behind a step over
    let event = debugger.step_over().unwrap();
    assert_eq!(event.reason, StopReason::Step);
    assert_eq!(info.line.take(), Some(9));

    let event = debugger.step_out().unwrap();
    assert_eq!(event.reason, StopReason::StepOut);
    assert_eq!(info.line.take(), Some(8));

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(5));
    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_step_instruction() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);

    let handles = debugger
        .install_breakpoint_at_line(Path::new("hello.rs"), 20, None)
        .unwrap();
    debugger.continue_debugee().unwrap();
    let start = info.addr.take().unwrap();
    assert_eq!(start, handles[0].addr());

    let event = debugger.step_instruction().unwrap();
    assert_eq!(event.reason, StopReason::Step);
    let pc = event.pc.unwrap();
    assert!(pc > start);
    assert_eq!(info.addr.take(), Some(pc));

    // breakpoint stays in place after stepping off it
    assert_eq!(debugger.breakpoints().len(), 1);
    assert_eq!(debugger.read_memory(start, 1).unwrap().len(), 1);
}
