use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::control::ProcessControl;
use crate::debugger::debugee::tracee::TraceeCtl;
use crate::debugger::debugee::tracer::{StopReason, TraceContext, Tracer};
use crate::debugger::error::Error;
use crate::debugger::error::Error::MappingNotFound;
use log::{info, warn};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

pub mod tracee;
pub mod tracer;

/// Thread position.
/// Contains pid of thread, relocated and global address of instruction where thread stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Location {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub pid: Pid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Debugee is running, controller waits for a stop.
    Running,
    /// All threads are stopped.
    Stopped,
    Exited(i32),
    Killed(Signal),
    Detached,
}

impl ExecutionStatus {
    pub fn is_terminated(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Exited(_) | ExecutionStatus::Killed(_) | ExecutionStatus::Detached
        )
    }
}

/// How debugee process was taken under control.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Launched,
    Attached,
}

/// Debugee - represent runtime debugee information.
pub struct Debugee<C: ProcessControl> {
    /// Process control primitives.
    pub(crate) control: C,
    /// Debugee tracer. Control debugee process.
    pub(crate) tracer: Tracer,
    /// debugee running-status.
    pub execution_status: ExecutionStatus,
    origin: Origin,
    /// path to debugee file.
    path: Option<PathBuf>,
    /// debugee process map address.
    mapping_addr: usize,
}

impl<C: ProcessControl> Debugee<C> {
    pub fn new(control: C, tracer: Tracer, origin: Origin, path: Option<&Path>) -> Self {
        Self {
            control,
            tracer,
            execution_status: ExecutionStatus::Stopped,
            origin,
            path: path.map(Path::to_path_buf),
            mapping_addr: 0,
        }
    }

    pub fn control(&self) -> &C {
        &self.control
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn tracee_ctl(&self) -> &TraceeCtl {
        &self.tracer.tracee_ctl
    }

    /// Return debugee process mapping offset (zero until the executable mapping is known).
    pub fn mapping_offset(&self) -> usize {
        self.mapping_addr
    }

    /// Find a lowest memory region of debugee executable, its start is a load address.
    pub fn define_mapping_addr(&mut self) -> Result<usize, Error> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| MappingNotFound("<unknown executable>".to_string()))?;
        let absolute_debugee_path = path.canonicalize()?;

        let lowest_map = self
            .control
            .regions()?
            .into_iter()
            .filter(|region| region.path.as_deref() == Some(absolute_debugee_path.as_path()))
            .min_by_key(|region| region.start)
            .ok_or_else(|| MappingNotFound(absolute_debugee_path.to_string_lossy().to_string()))?;

        self.mapping_addr = lowest_map.start.as_usize();
        info!(target: "debugger", "debugee mapped at {}", lowest_map.start);
        Ok(self.mapping_addr)
    }

    /// Resume debugee and wait until next stop, execution status updates accordingly.
    pub fn trace_until_stop(&mut self, ctx: TraceContext) -> Result<StopReason, Error> {
        self.execution_status = ExecutionStatus::Running;
        let result = self.tracer.resume(&self.control, ctx);
        let stop = match result {
            Ok(stop) => stop,
            Err(e) => {
                self.execution_status = ExecutionStatus::Stopped;
                return Err(e);
            }
        };

        self.execution_status = match stop {
            StopReason::DebugeeExit(code) => ExecutionStatus::Exited(code),
            StopReason::DebugeeKilled(signal) => ExecutionStatus::Killed(signal),
            StopReason::NoSuchProcess(pid) => {
                warn!(target: "debugger", "process {pid} vanished without exit status");
                ExecutionStatus::Exited(0)
            }
            _ => ExecutionStatus::Stopped,
        };
        Ok(stop)
    }

    /// Get current thread location.
    pub fn location(&self, pid: Pid) -> Result<Location, Error> {
        let pc = self
            .tracee_ctl()
            .tracee_ensure(pid)?
            .pc(&self.control)?;
        Ok(Location {
            pid,
            pc,
            global_pc: pc.into_global(self.mapping_offset()),
        })
    }

    /// Mark debugee as gone, all threads are forgotten.
    pub(crate) fn set_terminated(&mut self, status: ExecutionStatus) {
        self.tracer.tracee_ctl.clear();
        self.execution_status = status;
    }
}
