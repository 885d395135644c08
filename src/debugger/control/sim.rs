//! Simulated process used by the engine tests.
//!
//! Machine executes a tiny instruction set from a flat memory:
//!
//! | opcode | size | instruction                                                  |
//! |--------|------|--------------------------------------------------------------|
//! | `0x90` | 1    | `nop`                                                        |
//! | `0x01` | 5    | `inc [addr32]` - increment a byte                            |
//! | `0xE8` | 5    | `call target32` - push return address, jump                  |
//! | `0xC3` | 1    | `ret`                                                        |
//! | `0xE9` | 5    | `jmp target32`                                               |
//! | `0x74` | 9    | `dec_jz [addr32], target32` - decrement byte, jump if zero   |
//! | `0x0F` | 5    | `spawn entry32` - start new thread                           |
//! | `0x0B` | 1    | `thread_exit`                                                |
//! | `0xF4` | 2    | `exit code8` - terminate process                             |
//! | `0xCC` | 1    | `int3`                                                       |
//!
//! Thread events follow `PTRACE_SEIZE` semantics: new threads start with an interrupt stop,
//! exits are reported by an exit stop before the exit status.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::code;
use crate::debugger::control::{HaltHandle, MemoryRegion, ProcessControl, TraceEvent, TrapKind};
use crate::debugger::error::Error;
use crate::debugger::register::{Register, RegisterMap};
use crate::debugger::symbol::{FunctionRange, LineRange, StaticSymbols};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::cell::{Ref, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const CODE_BASE: usize = 0x1000;
pub const CODE_END: usize = 0x3000;
pub const DATA_BASE: usize = 0x4000;
pub const DATA_END: usize = 0x5000;
const STACK_AREA: usize = 0x8000;
const MEMORY_SIZE: usize = 0x20000;
const STACK_SIZE: usize = 0x1000;
const INSTRUCTION_BUDGET: usize = 100_000;

pub const PID: i32 = 100;

pub mod op {
    pub const NOP: u8 = 0x90;
    pub const INC: u8 = 0x01;
    pub const CALL: u8 = 0xE8;
    pub const RET: u8 = 0xC3;
    pub const JMP: u8 = 0xE9;
    pub const DEC_JZ: u8 = 0x74;
    pub const SPAWN: u8 = 0x0F;
    pub const THREAD_EXIT: u8 = 0x0B;
    pub const EXIT: u8 = 0xF4;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Run {
    Stopped,
    Running,
    Stepping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Exit {
    Thread,
    Process(i32),
}

#[derive(Debug)]
struct SimThread {
    regs: RegisterMap,
    run: Run,
    interrupt_pending: bool,
    signals: VecDeque<Signal>,
    exiting: Option<Exit>,
    step_trap_pending: bool,
}

impl SimThread {
    fn new(pc: usize, sp: usize, run: Run) -> Self {
        let mut regs = RegisterMap::default();
        regs.update(Register::Rip, pc as u64);
        regs.update(Register::Rsp, sp as u64);
        Self {
            regs,
            run,
            interrupt_pending: false,
            signals: VecDeque::new(),
            exiting: None,
            step_trap_pending: false,
        }
    }
}

pub struct Machine {
    pid: Pid,
    memory: Vec<u8>,
    threads: BTreeMap<Pid, SimThread>,
    next_tid: i32,
    next_stack_top: usize,
    final_event: Option<TraceEvent>,
    gone: bool,
    halt: Arc<AtomicBool>,
    /// Signals injected into threads by the tracer.
    pub delivered: Vec<(Pid, Signal)>,
    /// Threads released by detach.
    pub detached: Vec<Pid>,
    /// Every memory write: address and written bytes.
    pub writes: Vec<(usize, Vec<u8>)>,
}

impl Machine {
    fn mapped(&self, addr: usize, len: usize) -> bool {
        let end = addr + len;
        [
            (CODE_BASE, CODE_END),
            (DATA_BASE, DATA_END),
            (STACK_AREA, MEMORY_SIZE),
        ]
        .iter()
        .any(|(start, stop)| *start <= addr && end <= *stop)
    }

    fn read_u32(&self, addr: usize) -> usize {
        let bytes: [u8; 4] = self.memory[addr..addr + 4].try_into().expect("4 bytes");
        u32::from_le_bytes(bytes) as usize
    }

    fn read_u64(&self, addr: usize) -> u64 {
        let bytes: [u8; 8] = self.memory[addr..addr + 8].try_into().expect("8 bytes");
        u64::from_le_bytes(bytes)
    }

    fn alloc_stack(&mut self) -> usize {
        let top = self.next_stack_top;
        self.next_stack_top -= STACK_SIZE;
        assert!(self.next_stack_top >= STACK_AREA, "out of simulated stacks");
        // zero return address terminates unwinding
        let sp = top - 8;
        self.memory[sp..top].fill(0);
        sp
    }

    fn stopped_thread(&mut self, tid: Pid) -> Result<&mut SimThread, Error> {
        match self.threads.get_mut(&tid) {
            Some(t) if t.run == Run::Stopped => Ok(t),
            _ => Err(Error::Ptrace(Errno::ESRCH)),
        }
    }

    fn resume(&mut self, tid: Pid, signal: Option<Signal>, run: Run) -> Result<(), Error> {
        let thread = self.stopped_thread(tid)?;
        thread.run = run;
        if run == Run::Running {
            thread.step_trap_pending = false;
        }
        if let Some(signal) = signal {
            self.delivered.push((tid, signal));
        }
        Ok(())
    }

    /// Advance a thread by at most one instruction. Return an event if thread stops.
    fn tick(&mut self, tid: Pid) -> Option<TraceEvent> {
        let pid = self.pid;
        let thread = self.threads.get_mut(&tid)?;
        debug_assert!(thread.run != Run::Stopped);

        if let Some(exit) = thread.exiting.take() {
            return match exit {
                Exit::Thread => {
                    self.threads.remove(&tid);
                    Some(TraceEvent::Exited { tid, code: 0 })
                }
                Exit::Process(code) => {
                    self.threads.clear();
                    self.gone = true;
                    Some(TraceEvent::Exited { tid: pid, code })
                }
            };
        }
        if thread.interrupt_pending {
            thread.interrupt_pending = false;
            thread.run = Run::Stopped;
            return Some(TraceEvent::Interrupted { tid });
        }
        if let Some(signal) = thread.signals.pop_front() {
            thread.run = Run::Stopped;
            return Some(TraceEvent::Signal { tid, signal });
        }
        if thread.step_trap_pending {
            thread.step_trap_pending = false;
            thread.run = Run::Stopped;
            return Some(TraceEvent::Trap {
                tid,
                kind: TrapKind::SingleStep,
            });
        }

        let stepping = thread.run == Run::Stepping;
        let pc = thread.regs.value(Register::Rip) as usize;
        let sp = thread.regs.value(Register::Rsp) as usize;
        let opcode = self.memory[pc];

        let mut event = None;
        let mut next_pc = pc;
        let mut next_sp = sp;
        match opcode {
            code::TRAP => {
                next_pc = pc + 1;
                event = Some(TraceEvent::Trap {
                    tid,
                    kind: TrapKind::Breakpoint,
                });
            }
            op::NOP => next_pc = pc + 1,
            op::INC => {
                let addr = self.read_u32(pc + 1);
                self.memory[addr] = self.memory[addr].wrapping_add(1);
                next_pc = pc + 5;
            }
            op::CALL => {
                next_sp = sp - 8;
                self.memory[next_sp..sp].copy_from_slice(&((pc + 5) as u64).to_le_bytes());
                next_pc = self.read_u32(pc + 1);
            }
            op::RET => {
                next_pc = self.read_u64(sp) as usize;
                next_sp = sp + 8;
            }
            op::JMP => next_pc = self.read_u32(pc + 1),
            op::DEC_JZ => {
                let addr = self.read_u32(pc + 1);
                self.memory[addr] = self.memory[addr].wrapping_sub(1);
                next_pc = if self.memory[addr] == 0 {
                    self.read_u32(pc + 5)
                } else {
                    pc + 9
                };
            }
            op::SPAWN => {
                let entry = self.read_u32(pc + 1);
                let new_tid = Pid::from_raw(self.next_tid);
                self.next_tid += 1;
                let stack = self.alloc_stack();
                let mut new_thread = SimThread::new(entry, stack, Run::Running);
                new_thread.interrupt_pending = true;
                self.threads.insert(new_tid, new_thread);
                next_pc = pc + 5;
                event = Some(TraceEvent::Clone { tid, new_tid });
            }
            op::THREAD_EXIT => {
                next_pc = pc + 1;
                event = Some(TraceEvent::ThreadExiting { tid });
            }
            op::EXIT => {
                next_pc = pc + 2;
                event = Some(TraceEvent::ThreadExiting { tid });
            }
            _ => panic!("illegal instruction {opcode:#X} at {pc:#X}"),
        }

        let exit_code = self.memory[pc + 1] as i32;
        let thread = self.threads.get_mut(&tid)?;
        thread.regs.update(Register::Rip, next_pc as u64);
        thread.regs.update(Register::Rsp, next_sp as u64);
        match opcode {
            op::THREAD_EXIT => thread.exiting = Some(Exit::Thread),
            op::EXIT => thread.exiting = Some(Exit::Process(exit_code)),
            _ => {}
        }

        if let Some(event) = event {
            thread.run = Run::Stopped;
            // a stepping thread reports end of step after resuming from an event stop
            if stepping && matches!(event, TraceEvent::Clone { .. }) {
                thread.step_trap_pending = true;
            }
            return Some(event);
        }
        if stepping {
            thread.run = Run::Stopped;
            return Some(TraceEvent::Trap {
                tid,
                kind: TrapKind::SingleStep,
            });
        }
        None
    }

    fn deliver_halt(&mut self) {
        if self.halt.swap(false, Ordering::SeqCst) {
            let target = self
                .threads
                .iter_mut()
                .find(|(_, t)| t.run != Run::Stopped);
            match target {
                Some((_, thread)) => thread.signals.push_back(Signal::SIGSTOP),
                None => self.halt.store(true, Ordering::SeqCst),
            }
        }
    }

    fn wait_event(&mut self, tid: Option<Pid>) -> Result<TraceEvent, Error> {
        if let Some(event) = self.final_event.take() {
            return Ok(event);
        }
        if self.gone {
            return Err(Error::Waitpid(Errno::ECHILD));
        }
        self.deliver_halt();

        for _ in 0..INSTRUCTION_BUDGET {
            let candidates: Vec<Pid> = match tid {
                Some(tid) => {
                    if !self.threads.contains_key(&tid) {
                        return Err(Error::Waitpid(Errno::ECHILD));
                    }
                    vec![tid]
                }
                None => self.threads.keys().copied().collect(),
            };
            let runnable: Vec<Pid> = candidates
                .into_iter()
                .filter(|t| self.threads[t].run != Run::Stopped)
                .collect();
            assert!(
                !runnable.is_empty(),
                "wait({tid:?}) would block forever, all threads are stopped"
            );

            for t in runnable {
                if let Some(event) = self.tick(t) {
                    return Ok(event);
                }
            }
        }
        panic!("instruction budget exhausted");
    }
}

/// Shared handle to a simulated process. Clones observe the same machine.
#[derive(Clone)]
pub struct SimControl(Rc<RefCell<Machine>>);

impl SimControl {
    /// Load a program and create a process stopped at `entry`.
    pub fn new(program: &Assembler, entry: usize) -> Self {
        let mut machine = Machine {
            pid: Pid::from_raw(PID),
            memory: vec![0; MEMORY_SIZE],
            threads: BTreeMap::new(),
            next_tid: PID + 1,
            next_stack_top: MEMORY_SIZE,
            final_event: None,
            gone: false,
            halt: Arc::new(AtomicBool::new(false)),
            delivered: vec![],
            detached: vec![],
            writes: vec![],
        };
        for (addr, bytes) in &program.code {
            machine.memory[*addr..*addr + bytes.len()].copy_from_slice(bytes);
        }
        let stack = machine.alloc_stack();
        machine
            .threads
            .insert(machine.pid, SimThread::new(entry, stack, Run::Stopped));
        Self(Rc::new(RefCell::new(machine)))
    }

    pub fn machine(&self) -> Ref<'_, Machine> {
        self.0.borrow()
    }

    pub fn byte(&self, addr: usize) -> u8 {
        self.0.borrow().memory[addr]
    }

    pub fn set_byte(&self, addr: usize, value: u8) {
        self.0.borrow_mut().memory[addr] = value;
    }

    /// Queue a signal, running thread reports it on its next scheduling.
    pub fn raise(&self, tid: Pid, signal: Signal) {
        if let Some(thread) = self.0.borrow_mut().threads.get_mut(&tid) {
            thread.signals.push_back(signal);
        }
    }

    /// Number of writes that touched an address.
    pub fn writes_at(&self, addr: usize) -> usize {
        self.0
            .borrow()
            .writes
            .iter()
            .filter(|(start, data)| *start <= addr && addr < start + data.len())
            .count()
    }

    pub fn live_threads(&self) -> Vec<Pid> {
        self.0.borrow().threads.keys().copied().collect()
    }
}

impl ProcessControl for SimControl {
    fn pid(&self) -> Pid {
        self.0.borrow().pid
    }

    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let machine = self.0.borrow();
        let addr = addr.as_usize();
        if !machine.mapped(addr, len) {
            return Err(Error::Ptrace(Errno::EIO));
        }
        Ok(machine.memory[addr..addr + len].to_vec())
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let mut machine = self.0.borrow_mut();
        let addr = addr.as_usize();
        if !machine.mapped(addr, data.len()) {
            return Err(Error::Ptrace(Errno::EIO));
        }
        machine.memory[addr..addr + data.len()].copy_from_slice(data);
        machine.writes.push((addr, data.to_vec()));
        Ok(())
    }

    fn registers(&self, tid: Pid) -> Result<RegisterMap, Error> {
        let mut machine = self.0.borrow_mut();
        Ok(machine.stopped_thread(tid)?.regs)
    }

    fn set_registers(&self, tid: Pid, registers: &RegisterMap) -> Result<(), Error> {
        let mut machine = self.0.borrow_mut();
        machine.stopped_thread(tid)?.regs = *registers;
        Ok(())
    }

    fn step(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        self.0.borrow_mut().resume(tid, signal, Run::Stepping)
    }

    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        self.0.borrow_mut().resume(tid, signal, Run::Running)
    }

    fn interrupt(&self, tid: Pid) -> Result<(), Error> {
        let mut machine = self.0.borrow_mut();
        let thread = machine
            .threads
            .get_mut(&tid)
            .ok_or(Error::Ptrace(Errno::ESRCH))?;
        thread.interrupt_pending = true;
        Ok(())
    }

    fn wait(&self, tid: Option<Pid>) -> Result<TraceEvent, Error> {
        self.0.borrow_mut().wait_event(tid)
    }

    fn set_options(&self, tid: Pid) -> Result<(), Error> {
        let machine = self.0.borrow();
        machine
            .threads
            .contains_key(&tid)
            .then_some(())
            .ok_or(Error::Ptrace(Errno::ESRCH))
    }

    fn detach(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        let mut machine = self.0.borrow_mut();
        machine.stopped_thread(tid)?;
        machine.threads.remove(&tid);
        machine.detached.push(tid);
        if let Some(signal) = signal {
            machine.delivered.push((tid, signal));
        }
        Ok(())
    }

    fn kill(&self) -> Result<(), Error> {
        let mut machine = self.0.borrow_mut();
        if machine.gone {
            return Err(Error::Syscall("kill", Errno::ESRCH));
        }
        machine.threads.clear();
        machine.gone = true;
        machine.final_event = Some(TraceEvent::Killed {
            tid: machine.pid,
            signal: Signal::SIGKILL,
        });
        Ok(())
    }

    fn thread_ids(&self) -> Result<Vec<Pid>, Error> {
        Ok(self.live_threads())
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, Error> {
        let region = |start: usize, end: usize, executable: bool| MemoryRegion {
            start: start.into(),
            end: end.into(),
            executable,
            writable: !executable,
            path: None,
        };
        Ok(vec![
            region(CODE_BASE, CODE_END, true),
            region(DATA_BASE, DATA_END, false),
            region(STACK_AREA, MEMORY_SIZE, false),
        ])
    }

    fn halt_handle(&self) -> HaltHandle {
        let flag = self.0.borrow().halt.clone();
        HaltHandle::new(move || {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Builds a program for the [`Machine`] together with its symbol tables.
pub struct Assembler {
    file: PathBuf,
    code: Vec<(usize, Vec<u8>)>,
    symbols: StaticSymbols,
    unwind: bool,
}

impl Assembler {
    pub fn new(file: &str) -> Self {
        Self {
            file: PathBuf::from(file),
            code: vec![],
            symbols: StaticSymbols::new(),
            unwind: true,
        }
    }

    /// Functions emitted after this call have no unwind information.
    pub fn no_unwind(&mut self) -> &mut Self {
        self.unwind = false;
        self
    }

    /// Emit a function with line information at `entry`.
    pub fn function(
        &mut self,
        name: &str,
        entry: usize,
        body: impl FnOnce(&mut FunctionBuilder),
    ) -> &mut Self {
        let mut builder = FunctionBuilder::new(entry);
        body(&mut builder);
        let end = builder.here();

        // every `line` call starts a row, even for a line that continues the previous one
        for (i, (start, line)) in builder.rows.iter().enumerate() {
            let row_end = builder.rows.get(i + 1).map(|(s, _)| *s).unwrap_or(end);
            if row_end == *start {
                continue;
            }
            self.symbols.add_line(LineRange {
                file: self.file.clone(),
                line: *line,
                start: (*start).into(),
                end: row_end.into(),
            });
        }
        self.symbols.add_function(
            FunctionRange {
                entry: entry.into(),
                end: end.into(),
                name: name.to_string(),
            },
            builder.rets.iter().map(|r| RelocatedAddress::from(*r)).collect(),
            builder.calls.iter().map(|c| RelocatedAddress::from(*c)).collect(),
            self.unwind.then_some(8),
        );
        self.code.push((entry, builder.bytes));
        self
    }

    /// Emit code without any symbols (like a plt stub).
    pub fn raw(&mut self, entry: usize, body: impl FnOnce(&mut FunctionBuilder)) -> &mut Self {
        let mut builder = FunctionBuilder::new(entry);
        body(&mut builder);
        self.code.push((entry, builder.bytes));
        self
    }

    pub fn symbols(&self) -> StaticSymbols {
        self.symbols.clone()
    }
}

pub struct FunctionBuilder {
    entry: usize,
    bytes: Vec<u8>,
    rows: Vec<(usize, u64)>,
    rets: Vec<usize>,
    calls: Vec<usize>,
}

impl FunctionBuilder {
    fn new(entry: usize) -> Self {
        Self {
            entry,
            bytes: vec![],
            rows: vec![],
            rets: vec![],
            calls: vec![],
        }
    }

    /// Address of the next emitted instruction.
    pub fn here(&self) -> usize {
        self.entry + self.bytes.len()
    }

    /// Start a new line row at the current address.
    pub fn line(&mut self, line: u64) -> &mut Self {
        self.rows.push((self.here(), line));
        self
    }

    fn emit(&mut self, opcode: u8, args: &[usize]) -> &mut Self {
        self.bytes.push(opcode);
        for arg in args {
            self.bytes.extend_from_slice(&(*arg as u32).to_le_bytes());
        }
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.emit(op::NOP, &[])
    }

    pub fn inc(&mut self, addr: usize) -> &mut Self {
        self.emit(op::INC, &[addr])
    }

    pub fn call(&mut self, target: usize) -> &mut Self {
        self.calls.push(self.here());
        self.emit(op::CALL, &[target])
    }

    pub fn ret(&mut self) -> &mut Self {
        self.rets.push(self.here());
        self.emit(op::RET, &[])
    }

    pub fn jmp(&mut self, target: usize) -> &mut Self {
        self.emit(op::JMP, &[target])
    }

    pub fn dec_jz(&mut self, addr: usize, target: usize) -> &mut Self {
        self.emit(op::DEC_JZ, &[addr, target])
    }

    pub fn spawn(&mut self, entry: usize) -> &mut Self {
        self.emit(op::SPAWN, &[entry])
    }

    pub fn thread_exit(&mut self) -> &mut Self {
        self.emit(op::THREAD_EXIT, &[])
    }

    pub fn exit(&mut self, code: u8) -> &mut Self {
        self.bytes.push(op::EXIT);
        self.bytes.push(code);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COUNTER: usize = DATA_BASE;

    #[test]
    fn test_machine_executes_until_event() {
        let mut asm = Assembler::new("sim.rs");
        asm.function("main", 0x1000, |f| {
            f.line(1).inc(COUNTER).inc(COUNTER);
            f.line(2).exit(3);
        });
        let sim = SimControl::new(&asm, 0x1000);
        let pid = sim.pid();

        sim.cont(pid, None).unwrap();
        assert_eq!(
            sim.wait(None).unwrap(),
            TraceEvent::ThreadExiting { tid: pid }
        );
        assert_eq!(sim.byte(COUNTER), 2);
        sim.cont(pid, None).unwrap();
        assert_eq!(
            sim.wait(None).unwrap(),
            TraceEvent::Exited { tid: pid, code: 3 }
        );
        assert!(matches!(
            sim.wait(None),
            Err(Error::Waitpid(Errno::ECHILD))
        ));
    }

    #[test]
    fn test_machine_call_and_trap() {
        let mut asm = Assembler::new("sim.rs");
        asm.function("main", 0x1000, |f| {
            f.line(1).call(0x1100);
            f.line(2).exit(0);
        });
        asm.function("callee", 0x1100, |f| {
            f.line(10).nop().ret();
        });
        let sim = SimControl::new(&asm, 0x1000);
        let pid = sim.pid();
        let sp = sim.registers(pid).unwrap().sp();

        sim.step(pid, None).unwrap();
        assert_eq!(
            sim.wait(Some(pid)).unwrap(),
            TraceEvent::Trap {
                tid: pid,
                kind: TrapKind::SingleStep
            }
        );
        let regs = sim.registers(pid).unwrap();
        assert_eq!(regs.pc().as_usize(), 0x1100);
        assert_eq!(regs.sp(), sp.offset(-8));

        sim.set_byte(0x1101, code::TRAP);
        sim.cont(pid, None).unwrap();
        assert_eq!(
            sim.wait(None).unwrap(),
            TraceEvent::Trap {
                tid: pid,
                kind: TrapKind::Breakpoint
            }
        );
        assert_eq!(sim.registers(pid).unwrap().pc().as_usize(), 0x1102);
    }

    #[test]
    fn test_assembler_symbols() {
        let mut asm = Assembler::new("/src/sim.rs");
        asm.function("main", 0x1000, |f| {
            f.line(1).nop().nop();
            f.line(1).call(0x1100);
            f.line(2).ret();
        });
        let symbols = asm.symbols();
        use crate::debugger::symbol::SymbolResolver;
        let row = symbols.line_containing(0x1003_usize.into()).unwrap();
        assert_eq!(row.line, 1);
        assert_eq!(row.start.as_usize(), 0x1002);
        assert_eq!(row.end.as_usize(), 0x1007);
        assert_eq!(
            symbols.addresses_for_line(std::path::Path::new("sim.rs"), 1),
            vec![RelocatedAddress::from(0x1000_usize), 0x1002_usize.into()]
        );
        let func = symbols.function_containing(0x1007_usize.into()).unwrap();
        assert_eq!(func.end.as_usize(), 0x1008);
        assert_eq!(
            symbols.return_addresses_of(&func),
            vec![RelocatedAddress::from(0x1007_usize)]
        );
        assert_eq!(
            symbols.call_addresses_of(&func),
            vec![RelocatedAddress::from(0x1002_usize)]
        );
    }
}
