#![cfg(feature = "int_test")]

mod breakpoints;
mod multithreaded;
mod signal;
mod steps;

use crate::common::{launch, TestInfo};
use haltpoint::debugger::StopReason;
use serial_test::serial;
use std::mem;
use std::path::Path;

const HELLO_APP: &str = env!("CARGO_BIN_EXE_hello");
const RECURSION_APP: &str = env!("CARGO_BIN_EXE_recursion");
const MT_APP: &str = env!("CARGO_BIN_EXE_mt");
const SIGNALS_APP: &str = env!("CARGO_BIN_EXE_signals");
const SLEEPER_APP: &str = env!("CARGO_BIN_EXE_sleeper");

#[test]
#[serial]
fn test_debugger_graceful_shutdown() {
    let info = TestInfo::default();
    let mut debugger = launch(HELLO_APP, &[], &info);
    let pid = debugger.pid();
    debugger
        .install_breakpoint_at_line(Path::new("hello.rs"), 15, None)
        .unwrap();
    debugger.continue_debugee().unwrap();
    mem::drop(debugger);

    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_debugger_graceful_shutdown_multithreaded() {
    let info = TestInfo::default();
    let mut debugger = launch(MT_APP, &[], &info);
    let pid = debugger.pid();
    debugger
        .install_breakpoint_at_line(Path::new("mt.rs"), 19, None)
        .unwrap();
    debugger.continue_debugee().unwrap();
    mem::drop(debugger);

    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_exit_code() {
    let info = TestInfo::default();
    let mut debugger = launch(RECURSION_APP, &[], &info);
    let pid = debugger.pid();

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Exited(5));
    assert_eq!(info.exit_code.get(), Some(5));
    assert!(debugger.continue_debugee().is_err());

    mem::drop(debugger);
    assert_no_proc!(pid);
}
