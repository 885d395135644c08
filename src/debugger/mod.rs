pub mod address;
pub mod breakpoint;
pub mod code;
pub mod control;
pub mod debugee;
pub mod dwarf;
pub mod error;
pub mod process;
pub mod register;
mod step;
pub mod symbol;

pub use breakpoint::{BreakpointHandle, BreakpointKind, BreakpointView, Condition, HitContext, Place};
pub use control::HaltHandle;
pub use debugee::tracee::TraceeStatus;
pub use debugee::tracer::ThreadChange;
pub use debugee::{ExecutionStatus, Origin};
pub use error::Error;

use crate::config::EngineConfig;
use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakpointManager;
use crate::debugger::control::ptrace::PtraceControl;
use crate::debugger::control::{ProcessControl, TraceEvent};
use crate::debugger::debugee::tracee::TraceeCtl;
use crate::debugger::debugee::tracer::Tracer;
use crate::debugger::debugee::Debugee;
use crate::debugger::dwarf::DwarfSymbols;
use crate::debugger::error::Error::{
    InvalidAddress, MultipleErrors, PlaceNotFound, ProcessNotStarted, TargetExited, Waitpid,
};
use crate::debugger::process::Child;
use crate::debugger::register::{Register, RegisterMap};
use crate::debugger::step::{Stop, StepResult};
use crate::debugger::symbol::{FunctionRange, LineRange, NoSymbols, SymbolResolver};
use crate::{muted_error, weak_error};
use itertools::Itertools;
use log::{info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Debugger event handlers. Called on every stop that is surfaced to the user.
pub trait EventHook {
    /// Called when debugee stops at a user breakpoint.
    ///
    /// # Arguments
    ///
    /// * `pc`: address of the breakpoint
    /// * `num`: breakpoint number
    /// * `place`: line row at breakpoint address
    /// * `function`: function at breakpoint address
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        num: u32,
        place: Option<&LineRange>,
        function: Option<&FunctionRange>,
    ) -> anyhow::Result<()>;

    /// Called when a step or step out operation is done.
    fn on_step(
        &self,
        pc: RelocatedAddress,
        place: Option<&LineRange>,
        function: Option<&FunctionRange>,
    ) -> anyhow::Result<()>;

    /// Called when debugee stops at a signal or is killed by it.
    fn on_signal(&self, thread: Pid, signal: Signal);

    /// Called when debugee exits with code.
    fn on_exit(&self, code: i32);

    /// Called for each thread set change observed since the previous stop.
    fn on_thread(&self, thread: Pid, change: ThreadChange);
}

pub struct NopHook;

impl EventHook for NopHook {
    fn on_breakpoint(
        &self,
        _: RelocatedAddress,
        _: u32,
        _: Option<&LineRange>,
        _: Option<&FunctionRange>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_step(
        &self,
        _: RelocatedAddress,
        _: Option<&LineRange>,
        _: Option<&FunctionRange>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_signal(&self, _: Pid, _: Signal) {}

    fn on_exit(&self, _: i32) {}

    fn on_thread(&self, _: Pid, _: ThreadChange) {}
}

/// Why a control operation returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// User breakpoint with this number reached.
    Breakpoint(u32),
    Step,
    StepOut,
    Signal(Signal),
    /// Stopped by a [`HaltHandle`] request.
    Halt,
    Exited(i32),
    Killed(Signal),
}

/// Result of every control operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopEvent {
    pub reason: StopReason,
    /// Thread in focus after the stop, process leader if debugee is gone.
    pub thread: Pid,
    /// Program counter of the focus thread, [`None`] if debugee is gone.
    pub pc: Option<RelocatedAddress>,
    /// Step ends in a code without line information.
    pub unsymbolized: bool,
    /// Threads that exited during the operation.
    pub vanished: Vec<Pid>,
}

/// Debugee thread state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub tid: Pid,
    pub status: TraceeStatus,
    pub pc: Option<RelocatedAddress>,
    pub in_focus: bool,
}

#[derive(Default)]
pub struct DebuggerBuilder {
    hooks: Option<Box<dyn EventHook>>,
    symbols: Option<Box<dyn SymbolResolver>>,
    config: EngineConfig,
}

impl DebuggerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set event hooks, by default events are ignored.
    pub fn with_hooks(self, hooks: impl EventHook + 'static) -> Self {
        Self {
            hooks: Some(Box::new(hooks)),
            ..self
        }
    }

    /// Set symbol resolver. If not set, debug information of a program is loaded at start.
    pub fn with_symbols(self, symbols: impl SymbolResolver + 'static) -> Self {
        Self {
            symbols: Some(Box::new(symbols)),
            ..self
        }
    }

    pub fn with_config(self, config: EngineConfig) -> Self {
        Self { config, ..self }
    }

    fn load_symbols(mut self, program: &Path) -> Self {
        if self.symbols.is_none() {
            self.symbols = match DwarfSymbols::load(program) {
                Ok(symbols) => Some(Box::new(symbols)),
                Err(e) => {
                    warn!(target: "debugger", "no debug information for {program:?}: {e:#}");
                    None
                }
            };
        }
        self
    }

    /// Start a new program under debugger control, program stops before its first instruction.
    ///
    /// # Arguments
    ///
    /// * `program`: path to an executable, bare names are searched in `PATH`
    /// * `args`: program arguments
    /// * `cwd`: working directory, current directory if [`None`]
    pub fn launch<I: Into<String>>(
        self,
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = I>,
        cwd: Option<&Path>,
    ) -> Result<Debugger, Error> {
        self.config.quiet_signals()?;
        let child = Child::new(program, args, cwd, self.config.disable_aslr).install()?;
        let pid = child.pid();

        self.load_symbols(child.program())
            .build(
                PtraceControl::new(pid),
                &[pid],
                Origin::Launched,
                Some(child.program()),
            )
            .map_err(|e| {
                weak_error!(PtraceControl::new(pid).kill(), "kill debugee:");
                e
            })
    }

    /// Take a running process under debugger control, all its threads become stopped.
    pub fn attach(self, pid: Pid) -> Result<Debugger, Error> {
        self.config.quiet_signals()?;
        let child = Child::from_external(pid, self.config.attach_rounds())?;
        let (threads, pending) = child
            .external_info()
            .map(|info| (info.threads.clone(), info.pending_signals.clone()))
            .unwrap_or_else(|| (vec![pid], vec![]));

        let control = PtraceControl::new(pid);
        let mut debugger = match self.load_symbols(child.program()).build(
            control,
            &threads,
            Origin::Attached,
            Some(child.program()),
        ) {
            Ok(debugger) => debugger,
            Err(e) => {
                let control = PtraceControl::new(pid);
                for tid in threads {
                    muted_error!(control.detach(tid, None), "release thread:");
                }
                return Err(e);
            }
        };

        for (tid, signal) in pending {
            if let Some(tracee) = debugger.debugee.tracer.tracee_ctl.tracee_mut(tid) {
                tracee.pending_signal = Some(signal);
            }
        }
        Ok(debugger)
    }

    /// Create a debugger over already controlled threads. All threads must be stopped.
    ///
    /// # Arguments
    ///
    /// * `control`: process control primitives
    /// * `threads`: debugee threads, process leader included
    /// * `origin`: how debugee was taken under control
    /// * `path`: debugee executable, used to find a load address
    pub fn build<C: ProcessControl>(
        self,
        control: C,
        threads: &[Pid],
        origin: Origin,
        path: Option<&Path>,
    ) -> Result<Debugger<C>, Error> {
        let quiet_signals = self.config.quiet_signals()?;
        let tracee_ctl = TraceeCtl::new_from_threads(control.pid(), threads);
        let tracer = Tracer::new(tracee_ctl, &quiet_signals);
        let mut debugee = Debugee::new(control, tracer, origin, path);

        let mut symbols = self.symbols.unwrap_or_else(|| Box::new(NoSymbols));
        if path.is_some() {
            if let Some(offset) =
                weak_error!(debugee.define_mapping_addr(), "define mapping address:")
            {
                symbols.relocate(offset);
            }
        }

        Ok(Debugger {
            debugee,
            breakpoints: BreakpointManager::new(),
            symbols,
            hooks: self.hooks.unwrap_or_else(|| Box::new(NopHook)),
            kill_on_drop: self
                .config
                .kill_on_detach
                .unwrap_or(origin == Origin::Launched),
        })
    }
}

/// Main structure of the engine. Owns debugee, breakpoints and stepping logic.
pub struct Debugger<C: ProcessControl = PtraceControl> {
    debugee: Debugee<C>,
    breakpoints: BreakpointManager,
    symbols: Box<dyn SymbolResolver>,
    hooks: Box<dyn EventHook>,
    kill_on_drop: bool,
}

impl<C: ProcessControl> Debugger<C> {
    pub fn pid(&self) -> Pid {
        self.debugee.tracee_ctl().proc_pid()
    }

    pub fn execution_status(&self) -> ExecutionStatus {
        self.debugee.execution_status
    }

    pub fn origin(&self) -> Origin {
        self.debugee.origin()
    }

    pub fn symbols(&self) -> &dyn SymbolResolver {
        self.symbols.as_ref()
    }

    /// Handle for stopping running debugee from another thread (a signal handler for example).
    pub fn halt_handle(&self) -> HaltHandle {
        self.debugee.control.halt_handle()
    }

    fn focus_tid(&self) -> Option<Pid> {
        self.debugee.tracee_ctl().tracee_in_focus().map(|t| t.pid)
    }

    fn ensure_stopped(&self) -> Result<(), Error> {
        match self.debugee.execution_status {
            ExecutionStatus::Stopped => Ok(()),
            ExecutionStatus::Exited(_) | ExecutionStatus::Killed(_) => Err(TargetExited),
            ExecutionStatus::Running | ExecutionStatus::Detached => Err(ProcessNotStarted),
        }
    }

    /// Thread for a control operation.
    fn operation_thread(&self) -> Result<Pid, Error> {
        self.ensure_stopped()?;
        self.focus_tid().ok_or(ProcessNotStarted)
    }

    /// Continue debugee execution until a breakpoint, a signal or exit.
    pub fn continue_debugee(&mut self) -> Result<StopEvent, Error> {
        let thread = self.operation_thread()?;
        let result = self.continue_execution()?;
        self.report(result, thread, StopReason::Step)
    }

    /// Execute one instruction of the focus thread.
    pub fn step_instruction(&mut self) -> Result<StopEvent, Error> {
        let thread = self.operation_thread()?;
        let result = self.step_instruction_of(thread)?;
        self.report(result, thread, StopReason::Step)
    }

    /// Move to the next line, enter called functions.
    pub fn step_into(&mut self) -> Result<StopEvent, Error> {
        let thread = self.operation_thread()?;
        let result = self.step_in(thread)?;
        self.report(result, thread, StopReason::Step)
    }

    /// Move to the next line of the current function (or its caller).
    pub fn step_over(&mut self) -> Result<StopEvent, Error> {
        let thread = self.operation_thread()?;
        let result = self.step_over_any(thread)?;
        self.report(result, thread, StopReason::Step)
    }

    /// Run until the current function returns into its caller.
    pub fn step_out(&mut self) -> Result<StopEvent, Error> {
        let thread = self.operation_thread()?;
        let result = self.step_out_frame(thread)?;
        self.report(result, thread, StopReason::StepOut)
    }

    /// Turn a controller result into a [`StopEvent`], update focus and notify hooks.
    fn report(
        &mut self,
        result: StepResult,
        thread: Pid,
        done_reason: StopReason,
    ) -> Result<StopEvent, Error> {
        let mut vanished = vec![];
        for (tid, change) in self.debugee.tracer.take_thread_changes() {
            self.hooks.on_thread(tid, change);
            if change == ThreadChange::Exited {
                vanished.push(tid);
            }
        }

        let proc_pid = self.pid();
        let (reason, thread, unsymbolized) = match result {
            StepResult::Done { unsymbolized } => (done_reason, thread, unsymbolized),
            StepResult::Interrupted(stop) => match stop {
                Stop::Breakpoint { thread, number } => (StopReason::Breakpoint(number), thread, false),
                Stop::Signal { thread, signal } => (StopReason::Signal(signal), thread, false),
                Stop::Halt { thread } => (StopReason::Halt, thread, false),
                Stop::Exited(code) => (StopReason::Exited(code), proc_pid, false),
                Stop::Killed(signal) => (StopReason::Killed(signal), proc_pid, false),
                Stop::ThreadGone(tid) => {
                    if !vanished.contains(&tid) {
                        vanished.push(tid);
                    }
                    (done_reason, self.focus_tid().unwrap_or(proc_pid), false)
                }
            },
        };

        let mut event = StopEvent {
            reason,
            thread,
            pc: None,
            unsymbolized,
            vanished,
        };
        if !self.debugee.execution_status.is_terminated() {
            self.debugee.tracer.tracee_ctl.set_tracee_to_focus(thread);
            event.pc = weak_error!(self.debugee.location(thread), "stop location:").map(|l| l.pc);
        }

        self.notify(&event).map_err(Error::Hook)?;
        Ok(event)
    }

    fn notify(&self, event: &StopEvent) -> anyhow::Result<()> {
        let place = |pc| {
            (
                self.symbols.line_containing(pc),
                self.symbols.function_containing(pc),
            )
        };

        match event.reason {
            StopReason::Breakpoint(number) => {
                if let Some(pc) = event.pc {
                    let (line, function) = place(pc);
                    self.hooks
                        .on_breakpoint(pc, number, line.as_ref(), function.as_ref())?;
                }
            }
            StopReason::Step | StopReason::StepOut => {
                if let Some(pc) = event.pc {
                    let (line, function) = place(pc);
                    self.hooks.on_step(pc, line.as_ref(), function.as_ref())?;
                }
            }
            StopReason::Signal(signal) | StopReason::Killed(signal) => {
                self.hooks.on_signal(event.thread, signal)
            }
            StopReason::Exited(code) => self.hooks.on_exit(code),
            StopReason::Halt => {}
        }
        Ok(())
    }

    /// Install a user breakpoint at address.
    pub fn install_breakpoint(
        &mut self,
        addr: RelocatedAddress,
        condition: Option<Condition>,
    ) -> Result<BreakpointHandle, Error> {
        self.ensure_stopped()?;
        let place = self
            .symbols
            .line_containing(addr)
            .filter(|line| line.start == addr)
            .map(|line| Place {
                file: line.file,
                line: line.line,
            });
        self.breakpoints.install(
            &self.debugee.control,
            addr,
            BreakpointKind::User,
            condition,
            place,
        )
    }

    /// Install user breakpoints at a source line, one at the lowest address of the line
    /// in each function. Either all breakpoints are installed or none.
    pub fn install_breakpoint_at_line(
        &mut self,
        file: &Path,
        line: u64,
        condition: Option<Condition>,
    ) -> Result<Vec<BreakpointHandle>, Error> {
        self.ensure_stopped()?;
        let addresses: Vec<_> = self
            .symbols
            .addresses_for_line(file, line)
            .into_iter()
            .sorted()
            .unique_by(|addr| {
                self.symbols
                    .function_containing(*addr)
                    .map(|f| f.entry)
                    .unwrap_or(*addr)
            })
            .collect();
        if addresses.is_empty() {
            return Err(PlaceNotFound(file.display().to_string(), line));
        }

        let mut handles = Vec::with_capacity(addresses.len());
        for addr in addresses {
            let place = Place {
                file: self
                    .symbols
                    .line_containing(addr)
                    .map(|row| row.file)
                    .unwrap_or_else(|| file.to_path_buf()),
                line,
            };
            let installed = self.breakpoints.install(
                &self.debugee.control,
                addr,
                BreakpointKind::User,
                condition.clone(),
                Some(place),
            );
            match installed {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    for handle in handles {
                        weak_error!(
                            self.breakpoints.remove(&self.debugee.control, handle),
                            "rollback line breakpoint:"
                        );
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Remove a user breakpoint. After debugee is gone only forgets it.
    pub fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<(), Error> {
        if self.debugee.execution_status.is_terminated() {
            self.breakpoints.discard(handle);
            return Ok(());
        }
        self.breakpoints.remove(&self.debugee.control, handle)
    }

    pub fn breakpoints(&self) -> Vec<BreakpointView> {
        self.breakpoints.list()
    }

    fn ensure_mapped(&self, addr: RelocatedAddress, len: usize) -> Result<(), Error> {
        let last = addr.offset(len.saturating_sub(1) as isize);
        for bound in [addr, last] {
            if self.debugee.control.region(bound)?.is_none() {
                return Err(InvalidAddress(bound));
            }
        }
        Ok(())
    }

    /// Read debugee memory, breakpoint traps are replaced by original bytes.
    pub fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        self.ensure_stopped()?;
        self.ensure_mapped(addr, len)?;
        let mut data = self.debugee.control.read_memory(addr, len)?;
        self.breakpoints.mask_traps(addr, &mut data);
        Ok(data)
    }

    /// Write debugee memory. Bytes under breakpoint traps become new original bytes,
    /// traps stay in place.
    pub fn write_memory(&mut self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.ensure_mapped(addr, data.len())?;
        let mut data = data.to_vec();
        let prepared = self.breakpoints.prepare_write(addr, &mut data);
        self.debugee.control.write_memory(addr, &data)?;
        self.breakpoints.commit_write(prepared);
        Ok(())
    }

    pub fn read_registers(&self, tid: Pid) -> Result<RegisterMap, Error> {
        self.ensure_stopped()?;
        self.thread_registers(tid)
    }

    pub fn write_registers(&mut self, tid: Pid, registers: &RegisterMap) -> Result<(), Error> {
        self.ensure_stopped()?;
        self.debugee
            .tracee_ctl()
            .tracee_ensure(tid)?
            .set_registers(&self.debugee.control, registers)
    }

    /// Read a register by its name (`rip`, `rsp`, `rax` ...).
    pub fn register_value(&self, tid: Pid, name: &str) -> Result<u64, Error> {
        let register = Register::from_name(name)?;
        Ok(self.read_registers(tid)?.value(register))
    }

    pub fn set_register_value(&mut self, tid: Pid, name: &str, value: u64) -> Result<(), Error> {
        let register = Register::from_name(name)?;
        let mut registers = self.read_registers(tid)?;
        registers.update(register, value);
        self.write_registers(tid, &registers)
    }

    /// Debugee threads ordered by thread id.
    pub fn threads(&self) -> Vec<ThreadSnapshot> {
        let focus = self.focus_tid();
        self.debugee
            .tracee_ctl()
            .snapshot()
            .into_iter()
            .map(|tracee| ThreadSnapshot {
                tid: tracee.pid,
                status: tracee.status,
                pc: if tracee.is_stopped() {
                    muted_error!(tracee.pc(&self.debugee.control))
                } else {
                    None
                },
                in_focus: Some(tracee.pid) == focus,
            })
            .collect()
    }

    /// Set a thread used by next control operations.
    pub fn set_focus(&mut self, tid: Pid) -> Result<(), Error> {
        self.debugee.tracee_ctl().tracee_ensure(tid)?;
        self.debugee.tracer.tracee_ctl.set_tracee_to_focus(tid);
        Ok(())
    }

    /// Release debugee. All breakpoints are removed from debugee memory first,
    /// then threads are detached (pending signals delivered) or the process is killed.
    pub fn detach(&mut self, kill: bool) -> Result<(), Error> {
        if self.debugee.execution_status.is_terminated() {
            return Ok(());
        }

        let mut errors = vec![];
        if let Err(e) = self.breakpoints.restore_all(&self.debugee.control) {
            errors.push(e);
        }

        if kill {
            if let Err(e) = self.kill_debugee() {
                errors.push(e);
            }
        } else {
            for tracee in self.debugee.tracee_ctl().snapshot() {
                if let Err(e) = self
                    .debugee
                    .control
                    .detach(tracee.pid, tracee.pending_signal)
                {
                    if !e.is_esrch() {
                        errors.push(e);
                    }
                }
            }
        }

        info!(target: "debugger", "debugee {} released, killed: {kill}", self.pid());
        self.on_terminated(ExecutionStatus::Detached);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultipleErrors(errors))
        }
    }

    fn kill_debugee(&mut self) -> Result<(), Error> {
        let pid = self.pid();
        self.debugee.control.kill()?;
        loop {
            match self.debugee.control.wait(None) {
                Ok(TraceEvent::Killed { tid, .. } | TraceEvent::Exited { tid, .. }) if tid == pid => {
                    return Ok(())
                }
                Ok(TraceEvent::ThreadExiting { tid }) => {
                    muted_error!(self.debugee.control.cont(tid, None));
                }
                Ok(_) => {}
                Err(Waitpid(Errno::ECHILD)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }
}

impl<C: ProcessControl> Drop for Debugger<C> {
    fn drop(&mut self) {
        if self.debugee.execution_status.is_terminated() {
            return;
        }
        let kill = self.kill_on_drop;
        weak_error!(self.detach(kill), "release debugee:");
    }
}
