use crate::debugger::address::RelocatedAddress;
use crate::debugger::control::{ProcessControl, TraceEvent};
use crate::debugger::debugee::tracee::StopType::Interrupt;
use crate::debugger::debugee::tracee::TraceeStatus::{Running, Stopped};
use crate::debugger::error::Error;
use crate::debugger::error::Error::TraceeNotFound;
use crate::debugger::register::{Register, RegisterMap};
use log::{debug, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::Cell;
use std::collections::HashMap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StopType {
    Interrupt,
    SignalStop(Signal),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TraceeStatus {
    Stopped(StopType),
    Running,
}

/// Tracee is a thread attached to debugger with ptrace.
#[derive(Clone, Debug, PartialEq)]
pub struct Tracee {
    /// Tracee thread id.
    pub pid: Pid,
    /// Tracee current status.
    pub status: TraceeStatus,
    /// Signal that will be injected at next resume.
    pub pending_signal: Option<Signal>,
    /// Registers read at current stop, reset on every resume.
    registers: Cell<Option<RegisterMap>>,
}

impl Tracee {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            status: Stopped(Interrupt),
            pending_signal: None,
            registers: Cell::new(None),
        }
    }

    /// Wait for change of tracee status.
    pub fn wait_one(&self, control: &dyn ProcessControl) -> Result<TraceEvent, Error> {
        debug!(target: "tracer", "wait for tracee status, thread {pid}", pid = self.pid);
        let event = control.wait(Some(self.pid))?;
        debug!(target: "tracer", "receive tracee event, thread {pid}, event: {event:?}", pid = self.pid);
        Ok(event)
    }

    fn update_status(&mut self, status: TraceeStatus) {
        debug!(
            target: "tracer",
            "tracee accept new status ({status:?}), thread: {pid}",
            pid = self.pid
        );
        self.status = status
    }

    /// Resume tracee, if signal is some - inject signal or resuming.
    pub fn r#continue(
        &mut self,
        control: &dyn ProcessControl,
        sig: Option<Signal>,
    ) -> Result<(), Error> {
        debug!(
            target: "tracer",
            "continue tracee execution with signal {sig:?}, thread: {pid}",
            pid = self.pid,
        );
        self.registers.set(None);
        control.cont(self.pid, sig)?;
        self.update_status(Running);
        Ok(())
    }

    /// Execute one instruction. Tracee status is not changed, caller must wait for the step end.
    pub fn step(&self, control: &dyn ProcessControl, sig: Option<Signal>) -> Result<(), Error> {
        self.registers.set(None);
        control.step(self.pid, sig)
    }

    /// Set tracee status into stop.
    ///
    /// Note: this function does not actually stop the tracee.
    pub fn set_stop(&mut self, r#type: StopType) {
        self.update_status(Stopped(r#type));
    }

    /// Returns true if tracee in one of stopping statuses.
    pub fn is_stopped(&self) -> bool {
        matches!(self.status, Stopped(_))
    }

    /// Current register values (cached until next resume).
    pub fn registers(&self, control: &dyn ProcessControl) -> Result<RegisterMap, Error> {
        if let Some(registers) = self.registers.get() {
            return Ok(registers);
        }
        let registers = control.registers(self.pid)?;
        self.registers.set(Some(registers));
        Ok(registers)
    }

    /// Write registers and refresh the cache.
    pub fn set_registers(
        &self,
        control: &dyn ProcessControl,
        registers: &RegisterMap,
    ) -> Result<(), Error> {
        control.set_registers(self.pid, registers)?;
        self.registers.set(Some(*registers));
        Ok(())
    }

    /// Get current program counter value.
    pub fn pc(&self, control: &dyn ProcessControl) -> Result<RelocatedAddress, Error> {
        Ok(self.registers(control)?.pc())
    }

    /// Set new program counter value.
    pub fn set_pc(&self, control: &dyn ProcessControl, value: RelocatedAddress) -> Result<(), Error> {
        let mut map = self.registers(control)?;
        map.update(Register::Rip, value.as_u64());
        self.set_registers(control, &map)
    }
}

/// Set of debugee threads under control.
pub struct TraceeCtl {
    process_pid: Pid,
    in_focus_tid: Pid,
    threads_state: HashMap<Pid, Tracee>,
}

impl TraceeCtl {
    pub fn new(proc_pid: Pid) -> TraceeCtl {
        Self {
            process_pid: proc_pid,
            in_focus_tid: proc_pid,
            threads_state: HashMap::from([(proc_pid, Tracee::new(proc_pid))]),
        }
    }

    /// Create thread set from already stopped threads (attach case).
    pub fn new_from_threads(proc_pid: Pid, threads: &[Pid]) -> TraceeCtl {
        let mut ctl = Self::new(proc_pid);
        for tid in threads {
            ctl.add(*tid);
        }
        ctl
    }

    pub(crate) fn tracee(&self, pid: Pid) -> Option<&Tracee> {
        self.threads_state.get(&pid)
    }

    pub(crate) fn tracee_mut(&mut self, pid: Pid) -> Option<&mut Tracee> {
        self.threads_state.get_mut(&pid)
    }

    /// Like [`TraceeCtl::tracee`] but return error if thread is unknown.
    pub(crate) fn tracee_ensure(&self, pid: Pid) -> Result<&Tracee, Error> {
        self.threads_state.get(&pid).ok_or(TraceeNotFound(pid))
    }

    pub(crate) fn tracee_ensure_mut(&mut self, pid: Pid) -> Result<&mut Tracee, Error> {
        self.threads_state.get_mut(&pid).ok_or(TraceeNotFound(pid))
    }

    /// Return pid of debugee process main thread.
    pub fn proc_pid(&self) -> Pid {
        self.process_pid
    }

    /// Set tracee into focus.
    pub fn set_tracee_to_focus(&mut self, tid: Pid) {
        self.in_focus_tid = tid
    }

    /// Return current focused tracee, if focused thread is gone - return a process leader
    /// or any other living thread.
    pub fn tracee_in_focus(&self) -> Option<&Tracee> {
        self.threads_state
            .get(&self.in_focus_tid)
            .or_else(|| self.threads_state.get(&self.process_pid))
            .or_else(|| self.threads_state.values().min_by_key(|t| t.pid))
    }

    /// Adds thread in stopped state.
    pub fn add(&mut self, pid: Pid) -> &Tracee {
        debug!(target: "tracer", "add new tracee, thread: {pid}");
        self.threads_state
            .entry(pid)
            .or_insert_with(|| Tracee::new(pid))
    }

    /// Remove thread from set.
    pub fn remove(&mut self, pid: Pid) -> Option<Tracee> {
        debug!(target: "tracer", "try to remove tracee, thread: {pid}");
        self.threads_state.remove(&pid)
    }

    /// Forget all threads (process is gone).
    pub fn clear(&mut self) {
        self.threads_state.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.threads_state.is_empty()
    }

    /// Continue all currently stopped tracees, pending signals are injected.
    pub fn cont_stopped(&mut self, control: &dyn ProcessControl) -> Result<(), Vec<Error>> {
        let mut errors = vec![];

        self.threads_state.iter_mut().for_each(|(_, tracee)| {
            if !tracee.is_stopped() {
                return;
            }

            let signal = tracee.pending_signal.take();
            if let Err(e) = tracee.r#continue(control, signal) {
                // if no such process - continue, it will be removed later, on PTRACE_EVENT_EXIT event.
                if e.is_esrch() {
                    warn!(target: "tracer", "thread {} not found, ESRCH", tracee.pid);
                    return;
                }
                errors.push(e);
            }
        });

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(())
    }

    /// All threads ordered by thread id.
    pub fn snapshot(&self) -> Vec<Tracee> {
        let mut threads: Vec<_> = self.threads_state.values().cloned().collect();
        threads.sort_by_key(|t| t.pid);
        threads
    }
}
