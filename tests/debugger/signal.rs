use crate::common::{launch, launch_with_config, TestInfo};
use crate::{assert_no_proc, SIGNALS_APP};
use haltpoint::config::EngineConfig;
use haltpoint::debugger::StopReason;
use nix::sys::signal::Signal;
use serial_test::serial;
use std::mem;

#[test]
#[serial]
fn test_signal_stop_and_delivery() {
    let info = TestInfo::default();
    let mut debugger = launch(SIGNALS_APP, &[], &info);
    let pid = debugger.pid();

    // SIGURG is quiet and goes to a program without a stop
    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Signal(Signal::SIGUSR1));
    assert_eq!(event.thread, pid);
    assert_eq!(info.signals.take(), vec![Signal::SIGUSR1]);

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Killed(Signal::SIGUSR1));
    assert!(event.pc.is_none());

    mem::drop(debugger);
    assert_no_proc!(pid);
}

#[test]
#[serial]
fn test_configured_quiet_signal() {
    let info = TestInfo::default();
    let config = EngineConfig {
        quiet_signals: vec!["SIGUSR1".to_string()],
        ..EngineConfig::default()
    };
    let mut debugger = launch_with_config(SIGNALS_APP, &[], &info, config);
    let pid = debugger.pid();

    let event = debugger.continue_debugee().unwrap();
    assert_eq!(event.reason, StopReason::Killed(Signal::SIGUSR1));
    assert_eq!(info.signals.take(), vec![Signal::SIGUSR1]);

    mem::drop(debugger);
    assert_no_proc!(pid);
}
