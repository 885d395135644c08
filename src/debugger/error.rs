use crate::debugger::address::RelocatedAddress;
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Reasons why a running process can not be taken under control.
#[derive(Debug, thiserror::Error)]
pub enum AttachError {
    #[error("operation not permitted (check /proc/sys/kernel/yama/ptrace_scope and process owner)")]
    Permission,
    #[error("process {0} not found")]
    NoSuchProcess(Pid),
    #[error("process {0} already traced by {1}")]
    AlreadyTraced(Pid, Pid),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("unknown register {0:?}")]
    RegisterNotFound(gimli::Register),
    #[error("unknown register {0:?}")]
    RegisterNameNotFound(String),
    #[error("no instructions found for {0}:{1}")]
    PlaceNotFound(String, u64),
    #[error("tracee number {0} not found")]
    TraceeNotFound(Pid),
    #[error("breakpoint number {0} not found")]
    BreakpointNotFound(u32),
    #[error("return address not found for frame at {0}")]
    ReturnAddressNotFound(RelocatedAddress),
    #[error("no line information at address {0}")]
    UnsymbolizedLocation(RelocatedAddress),

    // --------------------------------- remote memory errors --------------------------------------
    #[error("address {0} is not mapped (or not executable for a breakpoint)")]
    InvalidAddress(RelocatedAddress),
    #[error("memory region not found for a file: {0}")]
    MappingNotFound(String),

    // --------------------------------- syscall errors --------------------------------------------
    #[error("waitpid syscall error: {0}")]
    Waitpid(nix::Error),
    #[error("ptrace syscall error: {0}")]
    Ptrace(nix::Error),
    #[error("{0} syscall error: {1}")]
    Syscall(&'static str, nix::Error),
    #[error("multiple syscall errors {0:?}")]
    MultipleErrors(Vec<Self>),

    // --------------------------------- parsing errors --------------------------------------------
    #[error("dwarf file parsing error: {0}")]
    DwarfParsing(#[from] gimli::Error),
    #[error("object file parsing error: {0}")]
    ObjParsing(#[from] object::Error),

    // --------------------------------- disasm ----------------------------------------------------
    #[error("install disassembler: {0}")]
    DisAsmInit(capstone::Error),
    #[error("instructions disassembly error: {0}")]
    DisAsm(capstone::Error),

    // --------------------------------- debugee process errors ------------------------------------
    #[error("attach a running process: {0}")]
    Attach(#[from] AttachError),
    #[error("launch program: {0}")]
    Launch(String),
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("debugee process killed by signal {0}")]
    ProcessKilled(Signal),
    #[error("program is not being started")]
    ProcessNotStarted,
    #[error("debugee process already exited")]
    TargetExited,
    #[error("thread {0} exited during operation")]
    ThreadVanished(Pid),

    // --------------------------------- third party errors ----------------------------------------
    #[error("hook: {0}")]
    Hook(anyhow::Error),
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::IO(_) => false,
            Error::Config(_) => false,
            Error::RegisterNotFound(_) => false,
            Error::RegisterNameNotFound(_) => false,
            Error::PlaceNotFound(_, _) => false,
            Error::TraceeNotFound(_) => false,
            Error::BreakpointNotFound(_) => false,
            Error::ReturnAddressNotFound(_) => false,
            Error::UnsymbolizedLocation(_) => false,
            Error::InvalidAddress(_) => false,
            Error::MappingNotFound(_) => false,
            Error::Waitpid(_) => false,
            Error::Ptrace(_) => false,
            Error::MultipleErrors(_) => false,
            Error::DisAsm(_) => false,
            Error::ProcessExit(_) => false,
            Error::ProcessKilled(_) => false,
            Error::ProcessNotStarted => false,
            Error::TargetExited => false,
            Error::ThreadVanished(_) => false,
            Error::Hook(_) => false,

            // currently fatal errors
            Error::DwarfParsing(_) => true,
            Error::ObjParsing(_) => true,
            Error::Syscall(_, _) => true,
            Error::DisAsmInit(_) => true,
            Error::Attach(_) => true,
            Error::Launch(_) => true,
        }
    }

    /// True if error means that the thread (or the whole process) no longer exists.
    pub(crate) fn is_esrch(&self) -> bool {
        matches!(
            self,
            Error::Ptrace(nix::errno::Errno::ESRCH) | Error::Waitpid(nix::errno::Errno::ESRCH)
        )
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
