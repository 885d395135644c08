//! Platform process control primitives.
//!
//! Engine talks to a traced process only through [`ProcessControl`], kernel wait statuses are
//! normalized into [`TraceEvent`] by an implementation.

pub mod ptrace;
#[cfg(test)]
pub mod sim;

use crate::debugger::address::RelocatedAddress;
use crate::debugger::error::Error;
use crate::debugger::register::RegisterMap;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

/// Origin of a `SIGTRAP` stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    /// Trap instruction executed, program counter points past it.
    Breakpoint,
    /// Single step done.
    SingleStep,
    /// Any other trap (syscall, unknown `si_code`).
    Other,
}

/// Thread event observed by the tracer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceEvent {
    /// Thread exited with code.
    Exited { tid: Pid, code: i32 },
    /// Thread terminated by signal.
    Killed { tid: Pid, signal: Signal },
    /// Thread stopped with `SIGTRAP`.
    Trap { tid: Pid, kind: TrapKind },
    /// Thread in signal-delivery-stop.
    Signal { tid: Pid, signal: Signal },
    /// Thread creates a new one (`PTRACE_EVENT_CLONE`).
    Clone { tid: Pid, new_tid: Pid },
    /// Thread stopped by `PTRACE_INTERRUPT`, group-stop or just started (`PTRACE_EVENT_STOP`).
    Interrupted { tid: Pid },
    /// Thread is about to exit (`PTRACE_EVENT_EXIT`).
    ThreadExiting { tid: Pid },
    /// New program image loaded (`PTRACE_EVENT_EXEC`).
    Exec { tid: Pid },
}

impl TraceEvent {
    /// Thread that reports an event.
    pub fn tid(&self) -> Pid {
        match self {
            TraceEvent::Exited { tid, .. }
            | TraceEvent::Killed { tid, .. }
            | TraceEvent::Trap { tid, .. }
            | TraceEvent::Signal { tid, .. }
            | TraceEvent::Clone { tid, .. }
            | TraceEvent::Interrupted { tid }
            | TraceEvent::ThreadExiting { tid }
            | TraceEvent::Exec { tid } => *tid,
        }
    }
}

/// Memory mapping of a traced process.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: RelocatedAddress,
    pub end: RelocatedAddress,
    pub executable: bool,
    pub writable: bool,
    pub path: Option<PathBuf>,
}

impl MemoryRegion {
    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Asynchronous request to stop a running debugee.
///
/// Cloneable and sendable across threads (for example into a `ctrl+c` handler).
#[derive(Clone)]
pub struct HaltHandle(Arc<dyn Fn() -> Result<(), Error> + Send + Sync>);

impl HaltHandle {
    pub fn new(f: impl Fn() -> Result<(), Error> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// Ask the debugee to stop. Blocked `continue` returns with a `Halt` stop.
    pub fn halt(&self) -> Result<(), Error> {
        (self.0)()
    }
}

impl Debug for HaltHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("HaltHandle")
    }
}

/// Capability set needed for controlling a traced process.
///
/// All methods except [`ProcessControl::wait`] and [`ProcessControl::halt_handle`]
/// require the target thread (or any thread for memory access) to be in ptrace-stop.
pub trait ProcessControl {
    /// Pid of the process (thread group leader).
    fn pid(&self) -> Pid;

    /// Read `len` bytes at `addr`.
    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error>;

    /// Write `data` at `addr`. A failed write must leave memory untouched.
    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error>;

    fn registers(&self, tid: Pid) -> Result<RegisterMap, Error>;

    fn set_registers(&self, tid: Pid, registers: &RegisterMap) -> Result<(), Error>;

    /// Execute one instruction, optionally delivering a signal.
    fn step(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error>;

    /// Resume thread, optionally delivering a signal.
    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error>;

    /// Stop a running thread, the stop is reported as [`TraceEvent::Interrupted`].
    fn interrupt(&self, tid: Pid) -> Result<(), Error>;

    /// Block until a thread (any thread if `tid` is `None`) reports an event.
    fn wait(&self, tid: Option<Pid>) -> Result<TraceEvent, Error>;

    /// Arm tracing options (clone, exec and exit tracking) on a thread.
    fn set_options(&self, tid: Pid) -> Result<(), Error>;

    /// Release thread from tracing, optionally delivering a signal.
    fn detach(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error>;

    /// Terminate the whole process.
    fn kill(&self) -> Result<(), Error>;

    /// Threads that the OS reports as belonging to the process.
    fn thread_ids(&self) -> Result<Vec<Pid>, Error>;

    /// Memory mappings of the process.
    fn regions(&self) -> Result<Vec<MemoryRegion>, Error>;

    /// Mapping that contains an address.
    fn region(&self, addr: RelocatedAddress) -> Result<Option<MemoryRegion>, Error> {
        Ok(self.regions()?.into_iter().find(|r| r.contains(addr)))
    }

    fn halt_handle(&self) -> HaltHandle;
}
