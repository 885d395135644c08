//! Symbolic lookups consumed by the execution controller.
//!
//! Debugger does not own a full debug information loader, it asks a [`SymbolResolver`]
//! about function bounds, line rows and frame unwinding.

use crate::debugger::address::RelocatedAddress;
use crate::debugger::control::ProcessControl;
use crate::debugger::register::RegisterMap;
use itertools::Itertools;
use nix::unistd::Pid;
use std::path::{Path, PathBuf};

/// Bounds of a function, `end` is exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionRange {
    pub entry: RelocatedAddress,
    pub end: RelocatedAddress,
    pub name: String,
}

impl FunctionRange {
    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        self.entry <= addr && addr < self.end
    }
}

/// Address range of a single source line row, `end` is exclusive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineRange {
    pub file: PathBuf,
    pub line: u64,
    pub start: RelocatedAddress,
    pub end: RelocatedAddress,
}

impl LineRange {
    pub fn contains(&self, addr: RelocatedAddress) -> bool {
        self.start <= addr && addr < self.end
    }

    /// True if both ranges belong to the same source line.
    pub fn same_line(&self, other: &LineRange) -> bool {
        self.line == other.line && self.file == other.file
    }
}

/// Caller frame restored by one unwind step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallerFrame {
    /// Address where execution continues after current function returns.
    pub caller_pc: RelocatedAddress,
    /// Canonical frame address of the current frame (caller stack pointer after return).
    pub cfa: RelocatedAddress,
}

/// Stopped thread state available to an unwinder.
pub struct FrameContext<'a> {
    pub pid: Pid,
    pub registers: &'a RegisterMap,
    pub control: &'a dyn ProcessControl,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn read_u64(&self, addr: RelocatedAddress) -> Option<u64> {
        let bytes = crate::muted_error!(self.control.read_memory(addr, 8))?;
        Some(u64::from_ne_bytes(bytes.try_into().ok()?))
    }
}

pub trait SymbolResolver {
    /// Function that owns an address.
    fn function_containing(&self, addr: RelocatedAddress) -> Option<FunctionRange>;

    /// Line row that owns an address.
    fn line_containing(&self, addr: RelocatedAddress) -> Option<LineRange>;

    /// Start addresses of all rows of a source line. File matched by path suffix.
    fn addresses_for_line(&self, file: &Path, line: u64) -> Vec<RelocatedAddress>;

    /// Addresses of all return instructions of a function.
    fn return_addresses_of(&self, function: &FunctionRange) -> Vec<RelocatedAddress>;

    /// Addresses of all call instructions of a function.
    fn call_addresses_of(&self, function: &FunctionRange) -> Vec<RelocatedAddress>;

    /// Restore caller frame for a stopped thread.
    fn unwind_frame(&self, ctx: &FrameContext) -> Option<CallerFrame>;

    /// Called once the load address of the main executable is known.
    fn relocate(&mut self, _mapping_offset: usize) {}
}

/// Resolver without any information, debugger works in instruction mode.
#[derive(Default, Clone, Copy, Debug)]
pub struct NoSymbols;

impl SymbolResolver for NoSymbols {
    fn function_containing(&self, _: RelocatedAddress) -> Option<FunctionRange> {
        None
    }

    fn line_containing(&self, _: RelocatedAddress) -> Option<LineRange> {
        None
    }

    fn addresses_for_line(&self, _: &Path, _: u64) -> Vec<RelocatedAddress> {
        vec![]
    }

    fn return_addresses_of(&self, _: &FunctionRange) -> Vec<RelocatedAddress> {
        vec![]
    }

    fn call_addresses_of(&self, _: &FunctionRange) -> Vec<RelocatedAddress> {
        vec![]
    }

    fn unwind_frame(&self, _: &FrameContext) -> Option<CallerFrame> {
        None
    }
}

#[derive(Clone, Debug)]
struct StaticFunction {
    range: FunctionRange,
    returns: Vec<RelocatedAddress>,
    calls: Vec<RelocatedAddress>,
    cfa_offset: Option<u64>,
}

/// In-memory symbol tables, for hosts that already own a debug information loader.
///
/// Unwinding is supported for functions registered with a CFA offset: CFA is `rsp + offset`
/// and the return address is stored right below it.
#[derive(Clone, Debug, Default)]
pub struct StaticSymbols {
    functions: Vec<StaticFunction>,
    lines: Vec<LineRange>,
}

impl StaticSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function.
    ///
    /// # Arguments
    ///
    /// * `range`: function bounds
    /// * `returns`: addresses of return instructions
    /// * `calls`: addresses of call instructions
    /// * `cfa_offset`: distance between stack pointer and CFA, if constant in the whole function
    pub fn add_function(
        &mut self,
        range: FunctionRange,
        returns: Vec<RelocatedAddress>,
        calls: Vec<RelocatedAddress>,
        cfa_offset: Option<u64>,
    ) {
        self.functions.push(StaticFunction {
            range,
            returns,
            calls,
            cfa_offset,
        });
        self.functions.sort_by_key(|f| f.range.entry);
    }

    pub fn add_line(&mut self, line: LineRange) {
        self.lines.push(line);
        self.lines.sort_by_key(|l| l.start);
    }

    fn function(&self, addr: RelocatedAddress) -> Option<&StaticFunction> {
        self.functions.iter().find(|f| f.range.contains(addr))
    }
}

impl SymbolResolver for StaticSymbols {
    fn function_containing(&self, addr: RelocatedAddress) -> Option<FunctionRange> {
        self.function(addr).map(|f| f.range.clone())
    }

    fn line_containing(&self, addr: RelocatedAddress) -> Option<LineRange> {
        self.lines.iter().find(|l| l.contains(addr)).cloned()
    }

    fn addresses_for_line(&self, file: &Path, line: u64) -> Vec<RelocatedAddress> {
        self.lines
            .iter()
            .filter(|l| l.line == line && l.file.ends_with(file))
            .map(|l| l.start)
            .sorted()
            .dedup()
            .collect()
    }

    fn return_addresses_of(&self, function: &FunctionRange) -> Vec<RelocatedAddress> {
        self.function(function.entry)
            .map(|f| f.returns.clone())
            .unwrap_or_default()
    }

    fn call_addresses_of(&self, function: &FunctionRange) -> Vec<RelocatedAddress> {
        self.function(function.entry)
            .map(|f| f.calls.clone())
            .unwrap_or_default()
    }

    fn unwind_frame(&self, ctx: &FrameContext) -> Option<CallerFrame> {
        let offset = self.function(ctx.registers.pc())?.cfa_offset?;
        let cfa = ctx.registers.sp().offset(offset as isize);
        let caller_pc = ctx.read_u64(cfa.offset(-8))?;
        if caller_pc == 0 {
            return None;
        }
        Some(CallerFrame {
            caller_pc: RelocatedAddress::from(caller_pc),
            cfa,
        })
    }
}
