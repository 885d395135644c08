use crate::debugger::address::RelocatedAddress;
use crate::debugger::code;
use crate::debugger::control::{HaltHandle, MemoryRegion, ProcessControl, TraceEvent, TrapKind};
use crate::debugger::error::Error;
use crate::debugger::error::Error::{Ptrace, Syscall, Waitpid};
use crate::debugger::register::RegisterMap;
use log::{debug, warn};
use nix::errno::Errno;
use nix::libc::{self, c_long, c_void, pid_t};
use nix::sys;
use nix::sys::ptrace::Options;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs;
use std::mem;

const WORD: usize = mem::size_of::<c_long>();

/// Options that every tracee must carry: clone, exec and exit tracking.
pub(crate) fn trace_options() -> Options {
    Options::PTRACE_O_TRACECLONE
        .union(Options::PTRACE_O_TRACEEXEC)
        .union(Options::PTRACE_O_TRACEEXIT)
}

/// List threads of a process using `/proc/<pid>/task` directory.
pub(crate) fn process_threads(pid: Pid) -> Result<Vec<Pid>, Error> {
    let mut threads = fs::read_dir(format!("/proc/{pid}/task"))?
        .filter_map(|entry| {
            let entry = entry.ok()?;
            let tid: pid_t = entry.file_name().to_str()?.parse().ok()?;
            Some(Pid::from_raw(tid))
        })
        .collect::<Vec<_>>();
    threads.sort();
    Ok(threads)
}

/// [`ProcessControl`] implementation over `ptrace` and `waitpid` system calls.
pub struct PtraceControl {
    pid: Pid,
}

impl PtraceControl {
    /// Create control for a process which threads are already seized by the current process.
    pub fn new(pid: Pid) -> Self {
        Self { pid }
    }

    fn read_word(&self, addr: usize) -> Result<[u8; WORD], Error> {
        let word = sys::ptrace::read(self.pid, addr as *mut c_void).map_err(Ptrace)?;
        Ok(word.to_ne_bytes())
    }

    /// Translate kernel wait status into a [`TraceEvent`].
    /// Return [`None`] for statuses that are not interesting to the tracer.
    fn normalize(&self, status: WaitStatus) -> Result<Option<TraceEvent>, Error> {
        let event = match status {
            WaitStatus::Exited(tid, code) => TraceEvent::Exited { tid, code },
            WaitStatus::Signaled(tid, signal, _) => TraceEvent::Killed { tid, signal },
            WaitStatus::PtraceEvent(tid, _, code) => match code {
                libc::PTRACE_EVENT_CLONE => {
                    let new_tid = sys::ptrace::getevent(tid).map_err(Ptrace)?;
                    TraceEvent::Clone {
                        tid,
                        new_tid: Pid::from_raw(new_tid as pid_t),
                    }
                }
                libc::PTRACE_EVENT_STOP => TraceEvent::Interrupted { tid },
                libc::PTRACE_EVENT_EXIT => TraceEvent::ThreadExiting { tid },
                libc::PTRACE_EVENT_EXEC => TraceEvent::Exec { tid },
                _ => {
                    warn!(target: "tracer", "unsupported ptrace event, code: {code}");
                    TraceEvent::Trap {
                        tid,
                        kind: TrapKind::Other,
                    }
                }
            },
            WaitStatus::Stopped(tid, Signal::SIGTRAP) => {
                let info = match sys::ptrace::getsiginfo(tid) {
                    Ok(info) => info,
                    Err(Errno::ESRCH) => {
                        // thread already gone, its exit will be reported later
                        debug!(target: "tracer", "thread {tid} not found while reading siginfo");
                        return Ok(None);
                    }
                    Err(e) => return Err(Ptrace(e)),
                };
                let kind = match info.si_code {
                    code::TRAP_BRKPT | code::SI_KERNEL => TrapKind::Breakpoint,
                    code::TRAP_TRACE => TrapKind::SingleStep,
                    _ => TrapKind::Other,
                };
                TraceEvent::Trap { tid, kind }
            }
            WaitStatus::Stopped(tid, signal) => TraceEvent::Signal { tid, signal },
            WaitStatus::PtraceSyscall(tid) => TraceEvent::Trap {
                tid,
                kind: TrapKind::Other,
            },
            WaitStatus::Continued(_) | WaitStatus::StillAlive => return Ok(None),
        };
        Ok(Some(event))
    }
}

impl ProcessControl for PtraceControl {
    fn pid(&self) -> Pid {
        self.pid
    }

    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let start = addr.as_usize();
        let aligned = start & !(WORD - 1);
        let mut data = Vec::with_capacity(len + WORD * 2);
        let mut word_addr = aligned;
        while word_addr < start + len {
            data.extend_from_slice(&self.read_word(word_addr)?);
            word_addr += WORD;
        }
        let skip = start - aligned;
        Ok(data[skip..skip + len].to_vec())
    }

    fn write_memory(&self, addr: RelocatedAddress, data: &[u8]) -> Result<(), Error> {
        let start = addr.as_usize();
        let aligned = start & !(WORD - 1);

        // read all affected words first, so a read failure leaves memory intact
        let mut words = vec![];
        let mut word_addr = aligned;
        while word_addr < start + data.len() {
            words.push((word_addr, self.read_word(word_addr)?));
            word_addr += WORD;
        }

        for (word_addr, mut word) in words {
            for (i, byte) in word.iter_mut().enumerate() {
                let byte_addr = word_addr + i;
                if byte_addr >= start && byte_addr < start + data.len() {
                    *byte = data[byte_addr - start];
                }
            }
            let value = c_long::from_ne_bytes(word);
            unsafe {
                sys::ptrace::write(self.pid, word_addr as *mut c_void, value as *mut c_void)
                    .map_err(Ptrace)?;
            }
        }
        Ok(())
    }

    fn registers(&self, tid: Pid) -> Result<RegisterMap, Error> {
        sys::ptrace::getregs(tid)
            .map(RegisterMap::from)
            .map_err(Ptrace)
    }

    fn set_registers(&self, tid: Pid, registers: &RegisterMap) -> Result<(), Error> {
        let mut regs = sys::ptrace::getregs(tid).map_err(Ptrace)?;
        registers.write_to(&mut regs);
        sys::ptrace::setregs(tid, regs).map_err(Ptrace)
    }

    fn step(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::step(tid, signal).map_err(Ptrace)
    }

    fn cont(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::cont(tid, signal).map_err(Ptrace)
    }

    fn interrupt(&self, tid: Pid) -> Result<(), Error> {
        sys::ptrace::interrupt(tid).map_err(Ptrace)
    }

    fn wait(&self, tid: Option<Pid>) -> Result<TraceEvent, Error> {
        let target = tid.unwrap_or(Pid::from_raw(-1));
        loop {
            let status = waitpid(target, Some(WaitPidFlag::__WALL)).map_err(Waitpid)?;
            debug!(target: "tracer", "received new thread status: {status:?}");
            if let Some(event) = self.normalize(status)? {
                return Ok(event);
            }
        }
    }

    fn set_options(&self, tid: Pid) -> Result<(), Error> {
        sys::ptrace::setoptions(tid, trace_options()).map_err(Ptrace)
    }

    fn detach(&self, tid: Pid, signal: Option<Signal>) -> Result<(), Error> {
        sys::ptrace::detach(tid, signal).map_err(Ptrace)
    }

    fn kill(&self) -> Result<(), Error> {
        sys::signal::kill(self.pid, Signal::SIGKILL).map_err(|e| Syscall("kill", e))
    }

    fn thread_ids(&self) -> Result<Vec<Pid>, Error> {
        process_threads(self.pid)
    }

    fn regions(&self) -> Result<Vec<MemoryRegion>, Error> {
        let maps = proc_maps::get_process_maps(self.pid.as_raw())?;
        Ok(maps
            .into_iter()
            .map(|map| MemoryRegion {
                start: RelocatedAddress::from(map.start()),
                end: RelocatedAddress::from(map.start() + map.size()),
                executable: map.is_exec(),
                writable: map.is_write(),
                path: map.filename().map(ToOwned::to_owned),
            })
            .collect())
    }

    fn halt_handle(&self) -> HaltHandle {
        let pid = self.pid;
        HaltHandle::new(move || {
            sys::signal::kill(pid, Signal::SIGSTOP).map_err(|e| Syscall("kill", e))
        })
    }
}
