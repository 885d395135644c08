use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakpointManager;
use crate::debugger::control::{ProcessControl, TraceEvent, TrapKind};
use crate::debugger::debugee::tracee::{StopType, TraceeCtl};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{
    MultipleErrors, ProcessExit, ProcessKilled, ThreadVanished, Waitpid,
};
use crate::muted_error;
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::collections::VecDeque;

/// List of signals that dont interrupt debugging process and send
/// to debugee directly on fire.
pub static QUIET_SIGNALS: [Signal; 7] = [
    Signal::SIGALRM,
    Signal::SIGURG,
    Signal::SIGCHLD,
    Signal::SIGIO,
    Signal::SIGVTALRM,
    Signal::SIGPROF,
    Signal::SIGWINCH,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Whole debugee process exited with code
    DebugeeExit(i32),
    /// Whole debugee process terminated by signal
    DebugeeKilled(Signal),
    /// Debugee stopped at breakpoint, program counter already points to breakpoint address
    Breakpoint(Pid, RelocatedAddress),
    /// Debugee stopped with OS signal
    SignalStop(Pid, Signal),
    /// Debugee stopped by halt request (`SIGSTOP`)
    Halt(Pid),
    /// Debugee stopped with Errno::ECHILD
    NoSuchProcess(Pid),
}

/// Change in the debugee thread set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadChange {
    Created,
    Exited,
}

#[derive(Clone, Copy)]
pub struct TraceContext<'a> {
    pub breakpoints: &'a BreakpointManager,
}

impl<'a> TraceContext<'a> {
    pub fn new(breakpoints: &'a BreakpointManager) -> Self {
        Self { breakpoints }
    }
}

/// Ptrace tracer.
pub struct Tracer {
    pub(crate) tracee_ctl: TraceeCtl,

    quiet_signals: Vec<Signal>,
    /// Stops observed during a group stop, reported by next `resume` calls.
    deferred: VecDeque<StopReason>,
    group_stop_guard: bool,
    thread_log: Vec<(Pid, ThreadChange)>,
}

impl Tracer {
    pub fn new(tracee_ctl: TraceeCtl, extra_quiet_signals: &[Signal]) -> Self {
        let mut quiet_signals = QUIET_SIGNALS.to_vec();
        quiet_signals.extend(extra_quiet_signals);
        Self {
            tracee_ctl,
            quiet_signals,
            deferred: VecDeque::new(),
            group_stop_guard: false,
            thread_log: vec![],
        }
    }

    pub fn is_quiet(&self, signal: Signal) -> bool {
        self.quiet_signals.contains(&signal)
    }

    /// Return and forget thread set changes since last call.
    pub fn take_thread_changes(&mut self) -> Vec<(Pid, ThreadChange)> {
        std::mem::take(&mut self.thread_log)
    }

    /// Continue debugee execution until stop happened.
    pub fn resume(
        &mut self,
        control: &dyn ProcessControl,
        ctx: TraceContext,
    ) -> Result<StopReason, Error> {
        loop {
            if let Some(stop) = self.deferred.pop_front() {
                debug!(target: "tracer", "report deferred stop: {stop:?}");
                return Ok(stop);
            }

            self.tracee_ctl
                .cont_stopped(control)
                .map_err(MultipleErrors)?;

            debug!(target: "tracer", "resume debugee execution, wait for updates");
            let event = match control.wait(None) {
                Ok(event) => event,
                Err(Waitpid(Errno::ECHILD)) => {
                    return Ok(StopReason::NoSuchProcess(self.tracee_ctl.proc_pid()))
                }
                Err(e) => return Err(e),
            };

            if let Some(stop) = self.apply_new_event(control, ctx, event)? {
                // if stop fired by quiet signal - go to next iteration, this will inject signal at
                // tracee process and resume it
                if let StopReason::SignalStop(_, signal) = stop {
                    if self.is_quiet(signal) {
                        continue;
                    }
                }

                debug!(target: "tracer", "debugee stopped, reason: {stop:?}");
                return Ok(stop);
            }
        }
    }

    /// For stop whole debugee process this function stops tracees (threads) one by one
    /// using PTRACE_INTERRUPT request.
    ///
    /// Stops only already running tracees.
    ///
    /// If tracee receives signals before interrupt - then tracee in signal-stop and no need to interrupt it.
    ///
    /// # Arguments
    ///
    /// * `initiator_pid`: tracee with this thread id already stopped, there is no need to interrupt it.
    fn stop_all(
        &mut self,
        control: &dyn ProcessControl,
        ctx: TraceContext,
        initiator_pid: Pid,
    ) -> Result<(), Error> {
        if self.group_stop_guard {
            return Ok(());
        }

        debug!(
            target: "tracer",
            "initiate group stop, initiator: {initiator_pid}, debugee state: {:?}",
            self.tracee_ctl.snapshot()
        );

        let non_stopped_exists = self
            .tracee_ctl
            .snapshot()
            .into_iter()
            .any(|t| t.pid != initiator_pid && !t.is_stopped());
        if !non_stopped_exists {
            return Ok(());
        }

        self.group_stop_guard = true;
        let result = self.interrupt_rounds(control, ctx);
        self.group_stop_guard = false;

        debug!(
            target: "tracer",
            "group stop complete, debugee state: {:?}",
            self.tracee_ctl.snapshot()
        );
        result
    }

    fn interrupt_rounds(
        &mut self,
        control: &dyn ProcessControl,
        ctx: TraceContext,
    ) -> Result<(), Error> {
        // two rounds, cause may be new tracees at first round, they stopped at round 2
        for _ in 0..2 {
            for tid in self.tracee_ctl.snapshot().into_iter().map(|t| t.pid) {
                match self.tracee_ctl.tracee(tid) {
                    Some(tracee) if !tracee.is_stopped() => {}
                    _ => continue,
                }

                if let Err(e) = control.interrupt(tid) {
                    // if no such process - continue, it will be removed later, on PTRACE_EVENT_EXIT event.
                    if e.is_esrch() {
                        warn!(target: "tracer", "thread {tid} not found, ESRCH");
                        if let Some(t) = self.tracee_ctl.tracee_mut(tid) {
                            t.set_stop(StopType::Interrupt);
                        }
                        continue;
                    }
                    return Err(e);
                }

                self.wait_interrupted(control, ctx, tid)?;
            }
        }
        Ok(())
    }

    /// Wait until interrupted thread stops, events that come before the interrupt-stop
    /// are applied.
    fn wait_interrupted(
        &mut self,
        control: &dyn ProcessControl,
        ctx: TraceContext,
        tid: Pid,
    ) -> Result<(), Error> {
        loop {
            let event = match control.wait(Some(tid)) {
                Ok(event) => event,
                Err(Waitpid(Errno::ECHILD)) => {
                    // thread is already reaped
                    self.tracee_ctl.remove(tid);
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            if let TraceEvent::Interrupted { tid: t } = event {
                if t == tid {
                    if let Some(tracee) = self.tracee_ctl.tracee_mut(tid) {
                        tracee.set_stop(StopType::Interrupt);
                    }
                    return Ok(());
                }
            }

            match self.apply_new_event(control, ctx, event)? {
                None | Some(StopReason::Breakpoint(_, _)) => {
                    // breakpoint hit by a non-initiator thread: pc already rewound,
                    // trap will fire again after resume
                }
                Some(StopReason::DebugeeExit(code)) => return Err(ProcessExit(code)),
                Some(StopReason::DebugeeKilled(signal)) => return Err(ProcessKilled(signal)),
                Some(stop @ StopReason::SignalStop(_, signal)) => {
                    if !self.is_quiet(signal) {
                        self.deferred.push_back(stop);
                    }
                }
                Some(stop @ StopReason::Halt(_)) => self.deferred.push_back(stop),
                Some(StopReason::NoSuchProcess(_)) => return Ok(()),
            }

            // reload tracee, it state must be change after handle event
            match self.tracee_ctl.tracee(tid) {
                None => return Ok(()),
                Some(tracee) if tracee.is_stopped() => return Ok(()),
                _ => {}
            }
        }
    }

    fn register_thread(&mut self, control: &dyn ProcessControl, tid: Pid) {
        self.tracee_ctl.add(tid);
        // new thread must track its own clones
        muted_error!(control.set_options(tid), "set trace options:");
        self.thread_log.push((tid, ThreadChange::Created));
    }

    /// Handle tracee event fired by `wait` syscall.
    /// After this function ends tracee_ctl must be in consistent state.
    /// If debugee process stop detected - returns a stop reason.
    ///
    /// # Arguments
    ///
    /// * `event`: new thread event.
    fn apply_new_event(
        &mut self,
        control: &dyn ProcessControl,
        ctx: TraceContext,
        event: TraceEvent,
    ) -> Result<Option<StopReason>, Error> {
        match event {
            TraceEvent::Exited { tid, code } => {
                if self.tracee_ctl.remove(tid).is_some() && tid != self.tracee_ctl.proc_pid() {
                    self.thread_log.push((tid, ThreadChange::Exited));
                }
                if tid == self.tracee_ctl.proc_pid() {
                    self.tracee_ctl.clear();
                    return Ok(Some(StopReason::DebugeeExit(code)));
                }
                Ok(None)
            }
            TraceEvent::Killed { tid, signal } => {
                self.tracee_ctl.remove(tid);
                if tid == self.tracee_ctl.proc_pid() {
                    self.tracee_ctl.clear();
                    return Ok(Some(StopReason::DebugeeKilled(signal)));
                }
                Ok(None)
            }
            TraceEvent::Exec { tid } => {
                // fork+exec inside debugee is unsupported, image replaced in place
                warn!(target: "tracer", "thread {tid} executes a new program image");
                self.tracee_ctl.add(tid);
                self.tracee_ctl.tracee_ensure_mut(tid)?.set_stop(StopType::Interrupt);
                Ok(None)
            }
            TraceEvent::Clone { tid, new_tid } => {
                // fire just before new thread created
                if let Some(tracee) = self.tracee_ctl.tracee_mut(tid) {
                    tracee.set_stop(StopType::Interrupt);
                }

                // PTRACE_EVENT_STOP may be received first, and new tracee may be already registered at this point
                if self.tracee_ctl.tracee(new_tid).is_none() {
                    self.tracee_ctl.add(new_tid);
                    let new_trace_event = self.tracee_ctl.tracee_ensure(new_tid)?.wait_one(control)?;
                    debug_assert!(
                        matches!(new_trace_event, TraceEvent::Interrupted { tid } if tid == new_tid),
                        "the newly cloned thread must start with PTRACE_EVENT_STOP (cause PTRACE_SEIZE was used)"
                    );
                    self.register_thread(control, new_tid);
                }
                Ok(None)
            }
            TraceEvent::Interrupted { tid } => {
                // fire right after new thread started or PTRACE_INTERRUPT called.
                match self.tracee_ctl.tracee_mut(tid) {
                    Some(tracee) => tracee.set_stop(StopType::Interrupt),
                    None => self.register_thread(control, tid),
                }
                Ok(None)
            }
            TraceEvent::ThreadExiting { tid } => {
                // Stop the tracee at exit
                if let Some(mut tracee) = self.tracee_ctl.remove(tid) {
                    if tid != self.tracee_ctl.proc_pid() {
                        self.thread_log.push((tid, ThreadChange::Exited));
                    }
                    if let Err(e) = tracee.r#continue(control, None) {
                        if !e.is_esrch() {
                            return Err(e);
                        }
                    }
                }
                Ok(None)
            }
            TraceEvent::Trap { tid, kind } => {
                if self.tracee_ctl.tracee(tid).is_none() {
                    self.tracee_ctl.add(tid);
                }
                self.tracee_ctl
                    .tracee_ensure_mut(tid)?
                    .set_stop(StopType::Interrupt);

                match kind {
                    TrapKind::Breakpoint => {
                        let tracee = self.tracee_ctl.tracee_ensure(tid)?;
                        let pc = match tracee.pc(control) {
                            Ok(pc) => pc,
                            Err(e) if e.is_esrch() => return Ok(None),
                            Err(e) => return Err(e),
                        };

                        let (is_hit, addr) = ctx.breakpoints.translate_hit_address(pc);
                        if is_hit {
                            tracee.set_pc(control, addr)?;
                            self.stop_all(control, ctx, tid)?;
                            Ok(Some(StopReason::Breakpoint(tid, addr)))
                        } else {
                            // trap instruction that is a part of the program itself
                            self.stop_all(control, ctx, tid)?;
                            Ok(Some(StopReason::SignalStop(tid, Signal::SIGTRAP)))
                        }
                    }
                    TrapKind::SingleStep | TrapKind::Other => {
                        debug!(target: "tracer", "unexpected trap ({kind:?}), thread: {tid}");
                        Ok(None)
                    }
                }
            }
            TraceEvent::Signal { tid, signal } => {
                if self.tracee_ctl.tracee(tid).is_none() {
                    self.tracee_ctl.add(tid);
                }
                let tracee = self.tracee_ctl.tracee_ensure_mut(tid)?;
                tracee.set_stop(StopType::SignalStop(signal));

                if signal == Signal::SIGSTOP {
                    // halt request, signal is never delivered to debugee
                    self.stop_all(control, ctx, tid)?;
                    return Ok(Some(StopReason::Halt(tid)));
                }

                tracee.pending_signal = Some(signal);
                if !self.is_quiet(signal) {
                    self.stop_all(control, ctx, tid)?;
                }
                Ok(Some(StopReason::SignalStop(tid, signal)))
            }
        }
    }

    /// Execute next instruction, then stop with `TRAP_TRACE`. Other threads stay stopped.
    ///
    /// # Arguments
    ///
    /// * `ctx`: trace context
    /// * `pid`: tracee pid
    ///
    /// returns: a [`None`] if instruction step done successfully. A [`StopReason::SignalStop`] or
    /// [`StopReason::Halt`] returned if step interrupt cause tracee in a signal-stop.
    /// [`Error::ProcessExit`] returned if debugee exits during step, [`Error::ThreadVanished`]
    /// if only stepping thread is gone.
    pub fn single_step(
        &mut self,
        control: &dyn ProcessControl,
        ctx: TraceContext,
        pid: Pid,
    ) -> Result<Option<StopReason>, Error> {
        let tracee = self.tracee_ctl.tracee_ensure(pid)?;
        let initial_pc = tracee.pc(control)?;
        tracee.step(control, None)?;

        loop {
            let event = match control.wait(Some(pid)) {
                Ok(event) => event,
                Err(Waitpid(Errno::ECHILD)) => {
                    self.tracee_ctl.remove(pid);
                    return Err(ThreadVanished(pid));
                }
                Err(e) => return Err(e),
            };

            match event {
                TraceEvent::Trap {
                    kind: TrapKind::SingleStep | TrapKind::Breakpoint,
                    ..
                }
                | TraceEvent::Interrupted { .. } => {
                    let tracee = self.tracee_ctl.tracee_ensure_mut(pid)?;
                    tracee.set_stop(StopType::Interrupt);
                    // check that we are not on original pc value
                    if tracee.pc(control)? == initial_pc {
                        tracee.step(control, None)?;
                        continue;
                    }
                    return Ok(None);
                }
                TraceEvent::Trap {
                    kind: TrapKind::Other,
                    ..
                } => {
                    self.tracee_ctl.tracee_ensure(pid)?.step(control, None)?;
                }
                TraceEvent::Clone { .. } => {
                    self.apply_new_event(control, ctx, event)?;
                    self.tracee_ctl.tracee_ensure(pid)?.step(control, None)?;
                }
                TraceEvent::ThreadExiting { .. } => {
                    self.apply_new_event(control, ctx, event)?;
                    if pid != self.tracee_ctl.proc_pid() {
                        return Err(ThreadVanished(pid));
                    }
                    return Err(self.drain_until_exit(control, ctx));
                }
                TraceEvent::Exited { .. } | TraceEvent::Killed { .. } => {
                    return match self.apply_new_event(control, ctx, event)? {
                        Some(StopReason::DebugeeExit(code)) => Err(ProcessExit(code)),
                        Some(StopReason::DebugeeKilled(signal)) => Err(ProcessKilled(signal)),
                        _ => Err(ThreadVanished(pid)),
                    };
                }
                TraceEvent::Exec { .. } => {
                    self.apply_new_event(control, ctx, event)?;
                    return Ok(None);
                }
                TraceEvent::Signal { signal, .. } => {
                    let stop = self.apply_new_event(control, ctx, event)?;
                    if self.is_quiet(signal) {
                        let tracee = self.tracee_ctl.tracee_ensure_mut(pid)?;
                        let signal = tracee.pending_signal.take();
                        tracee.set_stop(StopType::Interrupt);
                        tracee.step(control, signal)?;
                        continue;
                    }
                    // tracee in signal-stop
                    return Ok(stop);
                }
            }
        }
    }

    /// Process leader exits during step, wait for the whole process exit.
    fn drain_until_exit(&mut self, control: &dyn ProcessControl, ctx: TraceContext) -> Error {
        loop {
            let event = match control.wait(None) {
                Ok(event) => event,
                Err(Waitpid(Errno::ECHILD)) => return ProcessExit(0),
                Err(e) => return e,
            };
            match self.apply_new_event(control, ctx, event) {
                Ok(Some(StopReason::DebugeeExit(code))) => return ProcessExit(code),
                Ok(Some(StopReason::DebugeeKilled(signal))) => return ProcessKilled(signal),
                Ok(_) => {}
                Err(e) => return e,
            }
        }
    }
}
