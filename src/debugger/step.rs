use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::{BreakpointHandle, BreakpointKind};
use crate::debugger::control::ProcessControl;
use crate::debugger::debugee::tracer::{self, TraceContext};
use crate::debugger::debugee::ExecutionStatus;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{ProcessExit, ProcessKilled, ReturnAddressNotFound, ThreadVanished};
use crate::debugger::register::RegisterMap;
use crate::debugger::symbol::{CallerFrame, FrameContext, FunctionRange, LineRange};
use crate::debugger::Debugger;
use crate::weak_error;
use log::debug;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Event that interrupts an execution control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Stop {
    /// User breakpoint reached and its condition holds.
    Breakpoint { thread: Pid, number: u32 },
    Signal { thread: Pid, signal: Signal },
    Halt { thread: Pid },
    Exited(i32),
    Killed(Signal),
    /// Thread of the operation exited.
    ThreadGone(Pid),
}

/// Result of a step. If [`StepResult::Interrupted`] then step process interrupted by some event
/// and user must know it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum StepResult {
    Done { unsymbolized: bool },
    Interrupted(Stop),
}

impl StepResult {
    fn done() -> Self {
        StepResult::Done {
            unsymbolized: false,
        }
    }
}

/// Result of a run until next breakpoint.
enum Hit {
    Stop(Stop),
    /// Internal breakpoint reached by the watched thread, pc points to its address.
    Internal { thread: Pid, addr: RelocatedAddress },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepKind {
    Over,
    Into,
    Out,
}

/// State of a single step operation. Temporary breakpoints live exactly as long as request.
struct StepRequest {
    kind: StepKind,
    thread: Pid,
    start_line: Option<LineRange>,
    start_cfa: Option<RelocatedAddress>,
    start_sp: RelocatedAddress,
    return_addr: Option<RelocatedAddress>,
    /// Return instructions used when frame can not be unwound.
    ret_sites: Vec<RelocatedAddress>,
    /// Thread left the start frame.
    returned: bool,
    temporary: Vec<BreakpointHandle>,
}

impl StepRequest {
    fn new(kind: StepKind, thread: Pid, registers: &RegisterMap) -> Self {
        Self {
            kind,
            thread,
            start_line: None,
            start_cfa: None,
            start_sp: registers.sp(),
            return_addr: None,
            ret_sites: vec![],
            returned: false,
            temporary: vec![],
        }
    }
}

/// Outcome of a single line sweep of step into.
enum Sweep {
    Finished(StepResult),
    /// Thread stands on a call instruction of the swept line.
    AtCall,
    /// Thread returned into the caller frame.
    Returned,
}

impl Sweep {
    fn after_return(result: StepResult) -> Self {
        match result {
            StepResult::Done { .. } => Sweep::Returned,
            interrupted => Sweep::Finished(interrupted),
        }
    }
}

impl<C: ProcessControl> Debugger<C> {
    pub(super) fn thread_registers(&self, tid: Pid) -> Result<RegisterMap, Error> {
        self.debugee
            .tracer
            .tracee_ctl
            .tracee_ensure(tid)?
            .registers(&self.debugee.control)
    }

    /// Unwind one frame of a stopped thread.
    fn unwind(&self, tid: Pid) -> Option<CallerFrame> {
        let registers = weak_error!(self.thread_registers(tid))?;
        let ctx = FrameContext {
            pid: tid,
            registers: &registers,
            control: &self.debugee.control,
        };
        self.symbols.unwind_frame(&ctx)
    }

    fn is_terminated(&self) -> bool {
        self.debugee.execution_status.is_terminated()
    }

    /// Debugee is gone, breakpoint sites no longer need restoring.
    pub(super) fn on_terminated(&mut self, status: ExecutionStatus) {
        debug!(target: "debugger", "debugee terminated: {status:?}");
        self.debugee.set_terminated(status);
        self.breakpoints.forget_sites();
    }

    fn install_internal(
        &mut self,
        req: &mut StepRequest,
        addr: RelocatedAddress,
    ) -> Result<(), Error> {
        let handle = self.breakpoints.install(
            &self.debugee.control,
            addr,
            BreakpointKind::Internal,
            None,
            None,
        )?;
        req.temporary.push(handle);
        Ok(())
    }

    fn release_handle(&mut self, handle: BreakpointHandle) {
        if self.is_terminated() {
            self.breakpoints.discard(handle);
        } else {
            weak_error!(
                self.breakpoints.remove(&self.debugee.control, handle),
                "remove temporary breakpoint:"
            );
        }
    }

    /// Remove (or discard if debugee is gone) all temporary breakpoints of a request.
    fn release_request(&mut self, req: &mut StepRequest) {
        debug!(
            target: "debugger",
            "release {:?} step request, thread: {}, start line: {:?}",
            req.kind,
            req.thread,
            req.start_line.as_ref().map(|l| l.line)
        );
        for handle in std::mem::take(&mut req.temporary) {
            self.release_handle(handle);
        }
    }

    fn map_single_step(
        &mut self,
        result: Result<Option<tracer::StopReason>, Error>,
    ) -> Result<Option<Stop>, Error> {
        match result {
            Ok(None) => Ok(None),
            Ok(Some(reason)) => Ok(self.stop_from_reason(reason)),
            Err(ProcessExit(code)) => {
                self.on_terminated(ExecutionStatus::Exited(code));
                Ok(Some(Stop::Exited(code)))
            }
            Err(ProcessKilled(signal)) => {
                self.on_terminated(ExecutionStatus::Killed(signal));
                Ok(Some(Stop::Killed(signal)))
            }
            Err(ThreadVanished(tid)) => Ok(Some(Stop::ThreadGone(tid))),
            Err(e) => Err(e),
        }
    }

    fn stop_from_reason(&mut self, reason: tracer::StopReason) -> Option<Stop> {
        match reason {
            tracer::StopReason::SignalStop(thread, signal) => Some(Stop::Signal { thread, signal }),
            tracer::StopReason::Halt(thread) => Some(Stop::Halt { thread }),
            tracer::StopReason::DebugeeExit(code) => {
                self.on_terminated(ExecutionStatus::Exited(code));
                Some(Stop::Exited(code))
            }
            tracer::StopReason::DebugeeKilled(signal) => {
                self.on_terminated(ExecutionStatus::Killed(signal));
                Some(Stop::Killed(signal))
            }
            tracer::StopReason::NoSuchProcess(_) => {
                self.on_terminated(ExecutionStatus::Exited(0));
                Some(Stop::Exited(0))
            }
            tracer::StopReason::Breakpoint(_, _) => None,
        }
    }

    /// Move thread to next instruction, step over breakpoint if needed.
    /// Other threads stay stopped while the original instruction is in memory.
    ///
    /// Return a stop if the step didn't happen cause signal, thread or process exit.
    pub(super) fn single_step_instruction(&mut self, tid: Pid) -> Result<Option<Stop>, Error> {
        let pc = self
            .debugee
            .tracer
            .tracee_ctl
            .tracee_ensure(tid)?
            .pc(&self.debugee.control)?;

        let lifted = self.breakpoints.lift(&self.debugee.control, pc)?;
        let result = self.debugee.tracer.single_step(
            &self.debugee.control,
            TraceContext::new(&self.breakpoints),
            tid,
        );
        let debugee_gone = matches!(result, Err(ProcessExit(_)) | Err(ProcessKilled(_)));
        if let Some(lifted) = lifted {
            if !debugee_gone {
                self.breakpoints.reinstall(&self.debugee.control, lifted)?;
            }
        }

        self.map_single_step(result)
    }

    /// Resume debugee until a user breakpoint (with true condition), a signal, an exit,
    /// or an internal breakpoint reached by `watch` thread.
    fn continue_until_stop(&mut self, watch: Option<Pid>) -> Result<Hit, Error> {
        let mut step_over = match watch {
            Some(tid) => Some(tid),
            None => self.focus_tid(),
        };

        loop {
            if let Some(tid) = step_over.take() {
                let at_site = self
                    .debugee
                    .tracer
                    .tracee_ctl
                    .tracee(tid)
                    .and_then(|tracee| tracee.pc(&self.debugee.control).ok())
                    .map(|pc| self.breakpoints.is_installed(pc))
                    .unwrap_or(false);
                if at_site {
                    match self.single_step_instruction(tid)? {
                        None => {}
                        // stepping thread is gone, other threads are still stopped
                        Some(Stop::ThreadGone(gone)) if Some(gone) != watch => {}
                        Some(stop) => return Ok(Hit::Stop(stop)),
                    }
                }
            }

            let reason = self
                .debugee
                .trace_until_stop(TraceContext::new(&self.breakpoints))?;
            let (tid, addr) = match reason {
                tracer::StopReason::Breakpoint(tid, addr) => (tid, addr),
                reason => {
                    return match self.stop_from_reason(reason) {
                        Some(stop) => Ok(Hit::Stop(stop)),
                        None => continue,
                    };
                }
            };

            let registers = self.thread_registers(tid)?;
            if let Some(number) = self.breakpoints.evaluate_hit(addr, tid, &registers) {
                return Ok(Hit::Stop(Stop::Breakpoint {
                    thread: tid,
                    number,
                }));
            }
            if Some(tid) == watch && self.breakpoints.has_internal(addr) {
                return Ok(Hit::Internal { thread: tid, addr });
            }

            debug!(target: "debugger", "skip breakpoint at {addr}, thread: {tid}");
            step_over = Some(tid);
        }
    }

    /// Continue debugee execution until user breakpoint, signal or exit.
    pub(super) fn continue_execution(&mut self) -> Result<StepResult, Error> {
        match self.continue_until_stop(None)? {
            Hit::Stop(stop) => Ok(StepResult::Interrupted(stop)),
            Hit::Internal { .. } => Ok(StepResult::done()),
        }
    }

    /// Execute exactly one instruction of a thread.
    pub(super) fn step_instruction_of(&mut self, tid: Pid) -> Result<StepResult, Error> {
        Ok(match self.single_step_instruction(tid)? {
            None => StepResult::done(),
            Some(stop) => StepResult::Interrupted(stop),
        })
    }

    /// Degraded step for a code without line information.
    fn unsymbolized_step(&mut self, tid: Pid) -> Result<StepResult, Error> {
        debug!(target: "debugger", "no line information, step one instruction");
        Ok(match self.single_step_instruction(tid)? {
            None => StepResult::Done { unsymbolized: true },
            Some(stop) => StepResult::Interrupted(stop),
        })
    }

    fn done_at(&self, tid: Pid) -> StepResult {
        let unsymbolized = self
            .thread_registers(tid)
            .map(|regs| self.symbols.line_containing(regs.pc()).is_none())
            .unwrap_or(false);
        StepResult::Done { unsymbolized }
    }

    /// Run thread until it returns into a frame with a given return address and CFA.
    fn run_to_return(
        &mut self,
        req: &mut StepRequest,
        ret_addr: RelocatedAddress,
        cfa: RelocatedAddress,
    ) -> Result<Option<Stop>, Error> {
        self.install_internal(req, ret_addr)?;
        let result = self.wait_return(req.thread, ret_addr, cfa);
        self.release_request(req);
        result
    }

    fn wait_return(
        &mut self,
        tid: Pid,
        ret_addr: RelocatedAddress,
        cfa: RelocatedAddress,
    ) -> Result<Option<Stop>, Error> {
        loop {
            match self.continue_until_stop(Some(tid))? {
                Hit::Stop(stop) => return Ok(Some(stop)),
                Hit::Internal { thread, addr } => {
                    let sp = self.thread_registers(thread)?.sp();
                    if addr == ret_addr && sp >= cfa {
                        return Ok(None);
                    }
                    debug!(target: "debugger", "return address reached in a deeper frame");
                }
            }
        }
    }

    /// Run to the caller frame.
    pub(super) fn step_out_frame(&mut self, tid: Pid) -> Result<StepResult, Error> {
        let registers = self.thread_registers(tid)?;
        let mut req = StepRequest::new(StepKind::Out, tid, &registers);
        let result = self.step_out_inner(&mut req, &registers);
        self.release_request(&mut req);
        result
    }

    fn step_out_inner(
        &mut self,
        req: &mut StepRequest,
        registers: &RegisterMap,
    ) -> Result<StepResult, Error> {
        let tid = req.thread;
        let pc = registers.pc();

        if let Some(frame) = self.unwind(tid) {
            req.return_addr = Some(frame.caller_pc);
            req.start_cfa = Some(frame.cfa);
            return Ok(match self.run_to_return(req, frame.caller_pc, frame.cfa)? {
                None => self.done_at(tid),
                Some(stop) => StepResult::Interrupted(stop),
            });
        }

        // no unwind information, wait for any return instruction of current frame
        let func = self
            .symbols
            .function_containing(pc)
            .ok_or(ReturnAddressNotFound(pc))?;
        req.ret_sites = self.symbols.return_addresses_of(&func);
        if req.ret_sites.is_empty() {
            return Err(ReturnAddressNotFound(pc));
        }
        if req.ret_sites.contains(&pc) {
            return self.step_return(tid);
        }
        for ret in req.ret_sites.clone() {
            self.install_internal(req, ret)?;
        }

        loop {
            match self.continue_until_stop(Some(tid))? {
                Hit::Stop(stop) => return Ok(StepResult::Interrupted(stop)),
                Hit::Internal { thread, .. } => {
                    let sp = self.thread_registers(thread)?.sp();
                    if sp >= req.start_sp {
                        self.release_request(req);
                        return self.step_return(tid);
                    }
                }
            }
        }
    }

    /// Execute a return instruction the thread stands on.
    fn step_return(&mut self, tid: Pid) -> Result<StepResult, Error> {
        Ok(match self.single_step_instruction(tid)? {
            None => self.done_at(tid),
            Some(stop) => StepResult::Interrupted(stop),
        })
    }

    /// Do debugee step (over subroutine calls too).
    pub(super) fn step_over_any(&mut self, tid: Pid) -> Result<StepResult, Error> {
        let registers = self.thread_registers(tid)?;
        let mut req = StepRequest::new(StepKind::Over, tid, &registers);
        let result = self.step_over_inner(&mut req, &registers);
        self.release_request(&mut req);

        // returned into the middle of a caller line, finish this line too
        if let Ok(StepResult::Done {
            unsymbolized: false,
        }) = result
        {
            if req.kind == StepKind::Over && self.stopped_mid_line(tid) && req.returned {
                return self.step_over_any(tid);
            }
        }
        result
    }

    /// True if thread is inside a line, a row start that continues the previous row of the same
    /// line is inside it too.
    fn stopped_mid_line(&self, tid: Pid) -> bool {
        self.thread_registers(tid)
            .ok()
            .and_then(|regs| {
                let pc = regs.pc();
                let line = self.symbols.line_containing(pc)?;
                if line.start != pc {
                    return Some(true);
                }
                let prev = self.symbols.line_containing(pc.offset(-1))?;
                Some(prev.end == pc && prev.same_line(&line))
            })
            .unwrap_or(false)
    }

    fn step_over_inner(
        &mut self,
        req: &mut StepRequest,
        registers: &RegisterMap,
    ) -> Result<StepResult, Error> {
        let tid = req.thread;
        let pc = registers.pc();
        let Some(line) = self.symbols.line_containing(pc) else {
            return self.unsymbolized_step(tid);
        };
        let func = self.symbols.function_containing(pc);
        let frame = self.unwind(tid);
        req.start_line = Some(line.clone());
        req.start_cfa = frame.map(|f| f.cfa);
        req.return_addr = frame.map(|f| f.caller_pc);

        let line_stops = match &func {
            Some(func) => self.install_line_breakpoints(req, func, &line)?,
            None => vec![],
        };

        match (req.return_addr, &func) {
            (Some(ret_addr), _) => self.install_internal(req, ret_addr)?,
            (None, Some(func)) => {
                req.ret_sites = self.symbols.return_addresses_of(func);
                if req.ret_sites.contains(&pc) {
                    self.release_request(req);
                    req.returned = true;
                    return self.step_return(tid);
                }
                for ret in req.ret_sites.clone() {
                    self.install_internal(req, ret)?;
                }
            }
            (None, None) => {}
        }

        if req.temporary.is_empty() {
            return self.sweep_line(tid, &line);
        }

        loop {
            let (thread, addr) = match self.continue_until_stop(Some(tid))? {
                Hit::Stop(stop) => return Ok(StepResult::Interrupted(stop)),
                Hit::Internal { thread, addr } => (thread, addr),
            };
            let sp = self.thread_registers(thread)?.sp();

            if Some(addr) == req.return_addr && req.start_cfa.map(|cfa| sp >= cfa).unwrap_or(true)
            {
                req.returned = true;
                return Ok(self.done_at(tid));
            }

            if req.ret_sites.contains(&addr) {
                if sp >= req.start_sp {
                    self.release_request(req);
                    req.returned = true;
                    return self.step_return(tid);
                }
                continue;
            }

            if line_stops.contains(&addr) && self.in_start_frame(thread, req) {
                return Ok(StepResult::done());
            }
        }
    }

    /// Install temporary breakpoints at every row of another line in a function.
    /// Return addresses of installed breakpoints.
    fn install_line_breakpoints(
        &mut self,
        req: &mut StepRequest,
        func: &FunctionRange,
        line: &LineRange,
    ) -> Result<Vec<RelocatedAddress>, Error> {
        let mut stops = vec![];
        let mut addr = func.entry;
        while addr < func.end {
            match self.symbols.line_containing(addr) {
                Some(row) => {
                    if !row.same_line(line) && row.start == addr {
                        self.install_internal(req, addr)?;
                        stops.push(addr);
                    }
                    addr = row.end.max(addr.offset(1));
                }
                None => addr = addr.offset(1),
            }
        }
        Ok(stops)
    }

    /// True if thread is in the same or an outer frame than the one where request started.
    /// Recursive calls reach the same addresses in deeper frames.
    fn in_start_frame(&self, thread: Pid, req: &StepRequest) -> bool {
        match (self.unwind(thread), req.start_cfa) {
            (Some(frame), Some(start_cfa)) => frame.cfa >= start_cfa,
            _ => true,
        }
    }

    /// Step instructions until line changes, used when no temporary breakpoints can be set.
    fn sweep_line(&mut self, tid: Pid, line: &LineRange) -> Result<StepResult, Error> {
        loop {
            if let Some(stop) = self.single_step_instruction(tid)? {
                return Ok(StepResult::Interrupted(stop));
            }
            let pc = self.thread_registers(tid)?.pc();
            match self.symbols.line_containing(pc) {
                Some(row) if row.same_line(line) => {}
                Some(row) if row.start == pc => return Ok(StepResult::done()),
                Some(_) => {}
                None => return Ok(StepResult::Done { unsymbolized: true }),
            }
        }
    }

    /// Do single step (until debugee reaches a different source line), enter called functions.
    ///
    /// A line is swept with temporary breakpoints like in step over, with additional breakpoints
    /// at call instructions of the line. When thread reaches a call, the call is executed
    /// by a single instruction step and the sweep continues from the callee's first line.
    pub(super) fn step_in(&mut self, tid: Pid) -> Result<StepResult, Error> {
        loop {
            let registers = self.thread_registers(tid)?;
            let mut req = StepRequest::new(StepKind::Into, tid, &registers);
            let sweep = self.sweep_into(&mut req, &registers);
            self.release_request(&mut req);

            match sweep? {
                Sweep::Finished(result) => return Ok(result),
                Sweep::AtCall => {
                    if let Some(stop) = self.single_step_instruction(tid)? {
                        return Ok(StepResult::Interrupted(stop));
                    }
                    let callee_regs = self.thread_registers(tid)?;
                    let pc = callee_regs.pc();
                    if let (Some(func), Some(_)) = (
                        self.symbols.function_containing(pc),
                        self.symbols.line_containing(pc),
                    ) {
                        // callee entry line is the reference line of the next sweep
                        debug!(target: "debugger", "enter function {}", func.name);
                        continue;
                    }
                    if let Some(stop) = self.finish_callee(tid, &callee_regs)? {
                        return Ok(StepResult::Interrupted(stop));
                    }
                }
                Sweep::Returned => {}
            }

            // back in the middle of a caller line, finish this line too
            if !self.stopped_mid_line(tid) {
                return Ok(self.done_at(tid));
            }
        }
    }

    /// Run a just entered callee without line information (plt stub, library) until it returns.
    fn finish_callee(&mut self, tid: Pid, registers: &RegisterMap) -> Result<Option<Stop>, Error> {
        let ctx = FrameContext {
            pid: tid,
            registers,
            control: &self.debugee.control,
        };
        let Some(ret_addr) = ctx.read_u64(registers.sp()).map(RelocatedAddress::from) else {
            debug!(target: "debugger", "return address of {} is unreadable", registers.pc());
            return Ok(None);
        };
        let cfa = registers.sp().offset(8);
        debug!(
            target: "debugger",
            "no line information at {}, run until return to {ret_addr}",
            registers.pc()
        );

        let mut req = StepRequest::new(StepKind::Into, tid, registers);
        req.return_addr = Some(ret_addr);
        req.start_cfa = Some(cfa);
        self.run_to_return(&mut req, ret_addr, cfa)
    }

    /// Run thread until it leaves current line, reaches a call of current line
    /// or returns from current frame.
    fn sweep_into(
        &mut self,
        req: &mut StepRequest,
        registers: &RegisterMap,
    ) -> Result<Sweep, Error> {
        let tid = req.thread;
        let pc = registers.pc();
        let Some(line) = self.symbols.line_containing(pc) else {
            return Ok(Sweep::Finished(self.unsymbolized_step(tid)?));
        };
        let func = self.symbols.function_containing(pc);
        let frame = self.unwind(tid);
        req.start_line = Some(line.clone());
        req.start_cfa = frame.map(|f| f.cfa);
        req.return_addr = frame.map(|f| f.caller_pc);

        let calls = func
            .as_ref()
            .map(|func| self.symbols.call_addresses_of(func))
            .unwrap_or_default()
            .into_iter()
            .filter(|addr| {
                self.symbols
                    .line_containing(*addr)
                    .is_some_and(|row| row.same_line(&line))
            })
            .collect::<Vec<_>>();
        if calls.contains(&pc) {
            return Ok(Sweep::AtCall);
        }

        let line_stops = match &func {
            Some(func) => self.install_line_breakpoints(req, func, &line)?,
            None => vec![],
        };
        for call in &calls {
            self.install_internal(req, *call)?;
        }

        match (req.return_addr, &func) {
            (Some(ret_addr), _) => self.install_internal(req, ret_addr)?,
            (None, Some(func)) => {
                req.ret_sites = self.symbols.return_addresses_of(func);
                if req.ret_sites.contains(&pc) {
                    self.release_request(req);
                    return Ok(Sweep::after_return(self.step_return(tid)?));
                }
                for ret in req.ret_sites.clone() {
                    self.install_internal(req, ret)?;
                }
            }
            (None, None) => {}
        }

        if req.temporary.is_empty() {
            return Ok(Sweep::Finished(self.sweep_line(tid, &line)?));
        }

        loop {
            let (thread, addr) = match self.continue_until_stop(Some(tid))? {
                Hit::Stop(stop) => return Ok(Sweep::Finished(StepResult::Interrupted(stop))),
                Hit::Internal { thread, addr } => (thread, addr),
            };
            let sp = self.thread_registers(thread)?.sp();

            if Some(addr) == req.return_addr && req.start_cfa.map(|cfa| sp >= cfa).unwrap_or(true)
            {
                return Ok(Sweep::Returned);
            }

            if req.ret_sites.contains(&addr) {
                if sp >= req.start_sp {
                    self.release_request(req);
                    return Ok(Sweep::after_return(self.step_return(tid)?));
                }
                continue;
            }

            if !self.in_start_frame(thread, req) {
                continue;
            }
            if calls.contains(&addr) {
                return Ok(Sweep::AtCall);
            }
            if line_stops.contains(&addr) {
                return Ok(Sweep::Finished(StepResult::done()));
            }
        }
    }
}
