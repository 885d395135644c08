use crate::common::{launch, TestInfo};
use crate::{assert_no_proc, HELLO_APP};
use haltpoint::debugger::error::Error;
use haltpoint::debugger::{BreakpointKind, Condition, StopReason};
use serial_test::serial;
use std::mem;
use std::path::Path;

#[test]
#[serial]
fn test_line_breakpoint() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);
    let pid = debugger.pid();

    let handles = debugger
        .install_breakpoint_at_line(Path::new("hello.rs"), 15, None)
        .unwrap();
    assert_eq!(handles.len(), 1);

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Breakpoint(handles[0].number()));
    assert_eq!(event.pc, Some(handles[0].addr()));
    assert_eq!(info.line.take(), Some(15));
    assert!(info.file.take().unwrap().ends_with("hello.rs"));

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Breakpoint(handles[0].number()));

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
    assert_eq!(info.breakpoint_hits.get(), 2);

    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_address_breakpoint() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);
    let pid = debugger.pid();

    let addr = debugger
        .symbols()
        .addresses_for_line(Path::new("hello.rs"), 22)
        .into_iter()
        .next()
        .unwrap();
    let handle = debugger.install_breakpoint(addr, None).unwrap();

    let view = debugger.breakpoints().pop().unwrap();
    assert_eq!(view.addr, addr);
    assert_eq!(view.kind, BreakpointKind::User);
    assert_eq!(view.place.map(|p| p.line), Some(22));

    debugger.continue_debugee().unwrap();
    assert_eq!(info.addr.take(), Some(addr));
    assert_eq!(info.line.take(), Some(22));
    debugger.continue_debugee().unwrap();
    assert_eq!(info.breakpoint_hits.get(), 2);

    debugger.remove_breakpoint(handle).unwrap();
    assert!(debugger.breakpoints().is_empty());

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
    assert_eq!(info.breakpoint_hits.get(), 2);

    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_conditional_breakpoint() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);

    // loop body of `sum` runs ten times
    debugger
        .install_breakpoint_at_line(Path::new("hello.rs"), 22, Some(Condition::hit_count_ge(10)))
        .unwrap();

    let event = debugger.continue_debugee().unwrap();
    assert!(matches!(event.reason, StopReason::Breakpoint(_)));
    assert_eq!(debugger.breakpoints()[0].hits, 10);

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
    assert_eq!(info.breakpoint_hits.get(), 1);
}

#[test]
#[serial]
fn test_breakpoint_is_invisible_in_memory() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);

    let addr = debugger
        .symbols()
        .addresses_for_line(Path::new("hello.rs"), 15)
        .into_iter()
        .next()
        .unwrap();
    let before = debugger.read_memory(addr, 16).unwrap();
    let _handle = debugger.install_breakpoint(addr, None).unwrap();
    assert_eq!(debugger.read_memory(addr, 16).unwrap(), before);

    debugger.continue_debugee().unwrap();
    assert_eq!(debugger.read_memory(addr, 16).unwrap(), before);
}

#[test]
#[serial]
fn test_unknown_place() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);

    assert!(matches!(
        debugger.install_breakpoint_at_line(Path::new("hello.rs"), 1000, None),
        Err(Error::PlaceNotFound(_, 1000))
    ));
    assert!(matches!(
        debugger.install_breakpoint(0x10_usize.into(), None),
        Err(Error::InvalidAddress(_))
    ));
    assert!(debugger.breakpoints().is_empty());

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(0));
}
