use crate::debugger::control::ptrace::{process_threads, trace_options, PtraceControl};
use crate::debugger::control::{ProcessControl, TraceEvent};
use crate::debugger::error::Error::{Launch, Ptrace, Syscall, Waitpid};
use crate::debugger::error::{AttachError, Error};
use crate::weak_error;
use indexmap::IndexMap;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys;
use nix::sys::personality::Persona;
use nix::sys::signal::{Signal, SIGSTOP};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use sysinfo::{RefreshKind, System};

/// Process state.
pub trait State {}

/// Process running and attached with `ptrace` system call.
pub struct Installed {
    pid: Pid,
}

impl State for Installed {}

/// Process prepare for instantiation by a `fork` call.
pub struct Template;

impl State for Template {}

/// External process information.
pub struct ExternalInfo {
    /// Threads captured at the time of attaching, ordered by capture.
    pub threads: Vec<Pid>,
    /// Signals observed while threads were interrupted, must be delivered on resume.
    pub pending_signals: Vec<(Pid, Signal)>,
}

/// Process attached to tracer with ptrace.
pub struct Child<S: State> {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    disable_aslr: bool,
    external_info: Option<ExternalInfo>,
    state: S,
}

impl Child<Template> {
    /// Create new process, but dont start it.
    ///
    /// # Arguments
    ///
    /// * `program`: program name or path
    /// * `args`: program arguments
    /// * `cwd`: working directory of a new process
    /// * `disable_aslr`: run program with `ADDR_NO_RANDOMIZE` personality
    pub fn new<ARGS: IntoIterator<Item = I>, I: Into<String>>(
        program: impl Into<PathBuf>,
        args: ARGS,
        cwd: Option<impl Into<PathBuf>>,
        disable_aslr: bool,
    ) -> Child<Template> {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            cwd: cwd.map(Into::into),
            disable_aslr,
            external_info: None,
            state: Template,
        }
    }

    /// Resolve program path, bare names are searched in `PATH`.
    fn resolve_program(&self) -> Result<PathBuf, Error> {
        if self.program.components().count() > 1 {
            return Ok(self.program.clone());
        }
        which::which(&self.program)
            .map_err(|e| Launch(format!("{}: {e}", self.program.display())))
    }

    /// Instantiate process by `fork()` system call with caller as a parent process.
    /// After installation new program image is loaded and stopped before its first instruction.
    pub fn install(&self) -> Result<Child<Installed>, Error> {
        let program = self.resolve_program()?;

        let mut debugee_cmd = Command::new(&program);
        let debugee_cmd = debugee_cmd.args(&self.args);
        if let Some(cwd) = self.cwd.as_deref() {
            debugee_cmd.current_dir(cwd);
        }

        if self.disable_aslr {
            unsafe {
                debugee_cmd.pre_exec(move || {
                    sys::personality::set(Persona::ADDR_NO_RANDOMIZE)?;
                    Ok(())
                });
            }
        }

        match unsafe { fork() }.map_err(|e| Syscall("fork", e))? {
            ForkResult::Parent { child: pid } => {
                waitpid(pid, Some(WaitPidFlag::WSTOPPED)).map_err(Waitpid)?;
                sys::ptrace::seize(pid, trace_options()).map_err(Ptrace)?;
                wait_exec(pid)?;
                info!(target: "debugger", "program {program:?} started, pid: {pid}");

                Ok(Child {
                    program,
                    args: self.args.clone(),
                    cwd: self.cwd.clone(),
                    disable_aslr: self.disable_aslr,
                    external_info: None,
                    state: Installed { pid },
                })
            }
            ForkResult::Child => {
                if sys::signal::raise(SIGSTOP).is_err() {
                    unsafe { libc::_exit(127) };
                }
                let err = debugee_cmd.exec();
                eprintln!("run debugee fail with: {err}");
                unsafe { libc::_exit(127) };
            }
        }
    }
}

/// Resume a just seized child until it loads a new program image.
fn wait_exec(pid: Pid) -> Result<(), Error> {
    let control = PtraceControl::new(pid);
    // seized child still in the group stop caused by `SIGSTOP`
    control.cont(pid, None)?;
    loop {
        match control.wait(Some(pid))? {
            TraceEvent::Exec { .. } => return Ok(()),
            TraceEvent::Exited { code, .. } => {
                return Err(Launch(format!("process exit with code {code} before exec")))
            }
            TraceEvent::Killed { signal, .. } => {
                return Err(Launch(format!("process killed by {signal} before exec")))
            }
            TraceEvent::Signal { signal, .. } if signal != SIGSTOP => {
                control.cont(pid, Some(signal))?
            }
            event => {
                debug!(target: "debugger", "skip event before exec: {event:?}");
                if let Err(e) = control.cont(pid, None) {
                    if !e.is_esrch() {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl Child<Installed> {
    /// Return running process pid.
    pub fn pid(&self) -> Pid {
        self.state.pid
    }

    ///  Create [`Child`] from already running external process.
    ///
    /// Threads are captured in rounds until a round finds no new threads. On any error every
    /// already captured thread is released.
    ///
    /// # Arguments
    ///
    /// * `pid`: an external process pid
    /// * `rounds`: maximum number of capture rounds, at least two rounds are done
    pub fn from_external(pid: Pid, rounds: u32) -> Result<Self, Error> {
        let sys =
            System::new_with_specifics(RefreshKind::everything().without_cpu().without_memory());
        let external_process = sys
            .process(sysinfo::Pid::from_u32(pid.as_raw() as u32))
            .ok_or(AttachError::NoSuchProcess(pid))?;
        let program = external_process
            .exe()
            .map(Path::to_path_buf)
            .ok_or(AttachError::NoSuchProcess(pid))?;
        let args = external_process.cmd().iter().skip(1).cloned().collect();
        let cwd = external_process.cwd().map(ToOwned::to_owned);

        let mut capture = Capture::default();
        if let Err(e) = capture.run(pid, rounds.max(2)) {
            capture.rollback();
            return Err(e);
        }
        info!(
            target: "debugger",
            "attached to {pid}, threads: {:?}",
            capture.threads.keys().collect::<Vec<_>>()
        );

        Ok(Self {
            program,
            args,
            cwd,
            disable_aslr: false,
            external_info: Some(ExternalInfo {
                pending_signals: capture
                    .threads
                    .iter()
                    .filter_map(|(tid, sig)| sig.map(|sig| (*tid, sig)))
                    .collect(),
                threads: capture.threads.into_keys().collect(),
            }),
            state: Installed { pid },
        })
    }
}

/// Threads of an external process taken under control, with signals caught while stopping them.
#[derive(Default)]
struct Capture {
    threads: IndexMap<Pid, Option<Signal>>,
}

impl Capture {
    fn run(&mut self, pid: Pid, rounds: u32) -> Result<(), Error> {
        for round in 0..rounds {
            let new_threads: Vec<Pid> = process_threads(pid)
                .map_err(|_| AttachError::NoSuchProcess(pid))?
                .into_iter()
                .filter(|tid| !self.threads.contains_key(tid))
                .collect();
            debug!(target: "debugger", "attach round {round}, new threads: {new_threads:?}");
            if new_threads.is_empty() && round > 0 {
                break;
            }

            let mut seized = vec![];
            for tid in new_threads {
                match sys::ptrace::seize(tid, trace_options()) {
                    Ok(()) => {
                        self.threads.insert(tid, None);
                        seized.push(tid);
                    }
                    Err(Errno::EPERM) => {
                        return Err(match tracer_of(tid) {
                            Some(tracer) => AttachError::AlreadyTraced(tid, tracer),
                            None => AttachError::Permission,
                        }
                        .into())
                    }
                    Err(Errno::ESRCH) if tid == pid => {
                        return Err(AttachError::NoSuchProcess(pid).into())
                    }
                    // thread exits right now
                    Err(Errno::ESRCH) => continue,
                    Err(e) => return Err(Ptrace(e)),
                }
            }

            for tid in &seized {
                match sys::ptrace::interrupt(*tid) {
                    Ok(()) => {}
                    Err(Errno::ESRCH) => continue,
                    Err(e) => return Err(Ptrace(e)),
                }
                self.wait_interrupted(pid, *tid)?;
            }
        }
        Ok(())
    }

    /// Wait until thread reaches an interrupt stop, signals received before it are remembered.
    fn wait_interrupted(&mut self, pid: Pid, tid: Pid) -> Result<(), Error> {
        loop {
            let status = match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    self.threads.shift_remove(&tid);
                    return Ok(());
                }
                Err(e) => return Err(Waitpid(e)),
            };

            match status {
                WaitStatus::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => return Ok(()),
                WaitStatus::PtraceEvent(_, _, _) => {
                    // exit or exec in progress, interrupt stop follows
                    sys::ptrace::cont(tid, None).map_err(Ptrace)?;
                }
                WaitStatus::Stopped(_, signal) => {
                    debug!(target: "debugger", "thread {tid} catch {signal} while attaching");
                    if signal != SIGSTOP {
                        self.threads.insert(tid, Some(signal));
                    }
                    sys::ptrace::cont(tid, None).map_err(Ptrace)?;
                }
                WaitStatus::Exited(_, _) | WaitStatus::Signaled(_, _, _) => {
                    self.threads.shift_remove(&tid);
                    if tid == pid {
                        return Err(AttachError::NoSuchProcess(pid).into());
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Release every captured thread.
    fn rollback(&mut self) {
        for (tid, signal) in self.threads.drain(..) {
            weak_error!(
                sys::ptrace::detach(tid, signal).map_err(Ptrace),
                "rollback attach:"
            );
        }
    }
}

/// Pid of a process that traces a thread, from `/proc/<tid>/status`.
fn tracer_of(tid: Pid) -> Option<Pid> {
    let status = fs::read_to_string(format!("/proc/{tid}/status")).ok()?;
    let tracer: i32 = status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))?
        .trim()
        .parse()
        .ok()?;
    if tracer == 0 {
        warn!(target: "debugger", "ptrace permission denied for {tid}");
        return None;
    }
    Some(Pid::from_raw(tracer))
}

impl<S: State> Child<S> {
    /// Return a program path.
    pub fn program(&self) -> &Path {
        self.program.as_path()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn disable_aslr(&self) -> bool {
        self.disable_aslr
    }

    /// True when process was attached by its pid, false elsewhere.
    pub fn is_external(&self) -> bool {
        self.external_info.is_some()
    }

    /// Return [`ExternalInfo`] if underline process is external (attached by pid).
    pub fn external_info(&self) -> Option<&ExternalInfo> {
        self.external_info.as_ref()
    }
}
