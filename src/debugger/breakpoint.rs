use crate::debugger::address::RelocatedAddress;
use crate::debugger::code::TRAP;
use crate::debugger::control::ProcessControl;
use crate::debugger::error::Error;
use crate::debugger::error::Error::{InvalidAddress, MultipleErrors};
use crate::debugger::register::{Register, RegisterMap};
use indexmap::IndexMap;
use log::{debug, warn};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::rc::Rc;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Installed by a user, may carry a condition.
    User,
    /// Temporary breakpoint of a stepping operation.
    Internal,
}

/// State of a thread that reaches a breakpoint, passed into a condition.
pub struct HitContext<'a> {
    pub thread: Pid,
    pub pc: RelocatedAddress,
    pub registers: &'a RegisterMap,
    /// Number of times the breakpoint was reached, including the current one.
    pub hit_count: u32,
}

/// Breakpoint condition, evaluated on each hit. Debugger stops only if it returns true.
#[derive(Clone)]
pub struct Condition(Rc<dyn Fn(&HitContext) -> bool>);

impl Condition {
    pub fn new(predicate: impl Fn(&HitContext) -> bool + 'static) -> Self {
        Self(Rc::new(predicate))
    }

    /// Stop only when a register holds an expected value.
    pub fn register_eq(register: Register, value: u64) -> Self {
        Self::new(move |ctx| ctx.registers.value(register) == value)
    }

    /// Stop on the n-th hit and on every hit after it.
    pub fn hit_count_ge(count: u32) -> Self {
        Self::new(move |ctx| ctx.hit_count >= count)
    }

    fn evaluate(&self, ctx: &HitContext) -> bool {
        (self.0)(ctx)
    }
}

impl Debug for Condition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("Condition")
    }
}

/// Source place of a breakpoint installed by file and line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Place {
    pub file: PathBuf,
    pub line: u64,
}

/// Logical breakpoint.
#[derive(Debug)]
struct Breakpoint {
    addr: RelocatedAddress,
    kind: BreakpointKind,
    condition: Option<Condition>,
    hits: u32,
    place: Option<Place>,
}

/// Read-only breakpoint representation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BreakpointView {
    pub number: u32,
    pub addr: RelocatedAddress,
    pub kind: BreakpointKind,
    pub hits: u32,
    pub place: Option<Place>,
    pub conditional: bool,
}

/// Ownership token of an installed breakpoint. Can be released only once.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub struct BreakpointHandle {
    number: u32,
    addr: RelocatedAddress,
}

impl BreakpointHandle {
    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn addr(&self) -> RelocatedAddress {
        self.addr
    }
}

/// Patched location in debugee memory. Shared by all breakpoints at the same address.
#[derive(Debug)]
struct Site {
    /// Original byte, present iff the trap is in memory.
    saved: Option<u8>,
    refs: u32,
}

/// Original byte of a site that is temporary restored in memory.
#[must_use]
#[derive(Debug)]
pub struct LiftedSite {
    addr: RelocatedAddress,
    original: u8,
}

/// Original bytes overwritten by a pending memory write.
#[must_use]
#[derive(Debug)]
pub struct PreparedWrite {
    originals: Vec<(RelocatedAddress, u8)>,
}

/// Owns all breakpoints of a debugee and keeps debugee memory consistent with them.
#[derive(Default)]
pub struct BreakpointManager {
    sites: HashMap<RelocatedAddress, Site>,
    breakpoints: IndexMap<u32, Breakpoint>,
    next_number: u32,
}

fn read_byte(control: &dyn ProcessControl, addr: RelocatedAddress) -> Result<u8, Error> {
    let data = control.read_memory(addr, 1)?;
    Ok(data[0])
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self {
            next_number: 1,
            ..Default::default()
        }
    }

    /// Install a breakpoint. First breakpoint at an address patches debugee memory,
    /// next ones only share the existing patch.
    ///
    /// # Arguments
    ///
    /// * `control`: debugee control
    /// * `addr`: breakpoint address, must be inside an executable mapping
    /// * `kind`: breakpoint kind
    /// * `condition`: optional stop condition (used by user breakpoints only)
    /// * `place`: source place that produce this address
    pub fn install(
        &mut self,
        control: &dyn ProcessControl,
        addr: RelocatedAddress,
        kind: BreakpointKind,
        condition: Option<Condition>,
        place: Option<Place>,
    ) -> Result<BreakpointHandle, Error> {
        match self.sites.get_mut(&addr) {
            Some(site) => {
                if site.saved.is_none() {
                    // site is lifted right now, it is patched again at reinstall
                    debug!(target: "debugger", "share lifted site at {addr}");
                }
                site.refs += 1;
            }
            None => {
                let executable = control
                    .region(addr)?
                    .map(|region| region.executable)
                    .unwrap_or(false);
                if !executable {
                    return Err(InvalidAddress(addr));
                }
                let original = read_byte(control, addr)?;
                control.write_memory(addr, &[TRAP])?;
                self.sites.insert(
                    addr,
                    Site {
                        saved: Some(original),
                        refs: 1,
                    },
                );
            }
        }

        let number = self.next_number;
        self.next_number += 1;
        self.breakpoints.insert(
            number,
            Breakpoint {
                addr,
                kind,
                condition,
                hits: 0,
                place,
            },
        );
        debug!(target: "debugger", "breakpoint {number} ({kind:?}) installed at {addr}");

        Ok(BreakpointHandle { number, addr })
    }

    /// Remove a breakpoint. When the last breakpoint at an address is gone, the original
    /// byte is restored (only if the trap is still there).
    ///
    /// If restoring fails the site is kept as an orphan, so [`BreakpointManager::restore_all`]
    /// can restore it later.
    pub fn remove(
        &mut self,
        control: &dyn ProcessControl,
        handle: BreakpointHandle,
    ) -> Result<(), Error> {
        let addr = handle.addr;
        if self.breakpoints.shift_remove(&handle.number).is_none() {
            return Err(Error::BreakpointNotFound(handle.number));
        }
        debug!(target: "debugger", "breakpoint {} removed from {addr}", handle.number);

        let Some(site) = self.sites.get_mut(&addr) else {
            return Ok(());
        };
        site.refs = site.refs.saturating_sub(1);
        if site.refs > 0 {
            return Ok(());
        }
        if let Some(original) = site.saved {
            Self::restore_byte(control, addr, original)?;
        }
        self.sites.remove(&addr);
        Ok(())
    }

    /// Forget a breakpoint without touching debugee memory (debugee is gone).
    pub fn discard(&mut self, handle: BreakpointHandle) {
        self.breakpoints.shift_remove(&handle.number);
        if let Some(site) = self.sites.get_mut(&handle.addr) {
            site.refs = site.refs.saturating_sub(1);
            if site.refs == 0 {
                self.sites.remove(&handle.addr);
            }
        }
    }

    /// Forget all sites without touching debugee memory (debugee is gone).
    /// Logical breakpoints are kept until their handles are released.
    pub fn forget_sites(&mut self) {
        self.sites.clear();
    }

    fn restore_byte(
        control: &dyn ProcessControl,
        addr: RelocatedAddress,
        original: u8,
    ) -> Result<(), Error> {
        let current = read_byte(control, addr)?;
        if current == TRAP {
            control.write_memory(addr, &[original])
        } else {
            warn!(
                target: "debugger",
                "trap at {addr} was overwritten by debugee, original byte not restored"
            );
            Ok(())
        }
    }

    /// Pure lookup, true if there is a site (installed or lifted) at address.
    pub fn is_breakpoint_address(&self, addr: RelocatedAddress) -> bool {
        self.sites.contains_key(&addr)
    }

    /// True if trap byte at address is in debugee memory now.
    pub fn is_installed(&self, addr: RelocatedAddress) -> bool {
        self.sites
            .get(&addr)
            .map(|s| s.saved.is_some())
            .unwrap_or(false)
    }

    /// Program counter reported after a trap points past the trap instruction.
    /// Returns whether `pc - TRAP_WIDTH` is a known breakpoint, and this address.
    pub fn translate_hit_address(&self, pc: RelocatedAddress) -> (bool, RelocatedAddress) {
        let addr = pc.offset(-(crate::debugger::code::TRAP_WIDTH as isize));
        (self.is_installed(addr), addr)
    }

    /// Temporary restore original byte at address. Returns [`None`] if there is no trap.
    pub fn lift(
        &mut self,
        control: &dyn ProcessControl,
        addr: RelocatedAddress,
    ) -> Result<Option<LiftedSite>, Error> {
        let Some(site) = self.sites.get_mut(&addr) else {
            return Ok(None);
        };
        let Some(original) = site.saved else {
            return Ok(None);
        };
        Self::restore_byte(control, addr, original)?;
        site.saved = None;
        Ok(Some(LiftedSite { addr, original }))
    }

    /// Put the trap back after [`BreakpointManager::lift`]. Does nothing if all breakpoints at
    /// this address were removed in the meantime.
    pub fn reinstall(
        &mut self,
        control: &dyn ProcessControl,
        lifted: LiftedSite,
    ) -> Result<(), Error> {
        let Some(site) = self.sites.get_mut(&lifted.addr) else {
            return Ok(());
        };
        let current = read_byte(control, lifted.addr)?;
        if current != lifted.original {
            warn!(
                target: "debugger",
                "instruction at {} was changed while trap was lifted", lifted.addr
            );
        }
        control.write_memory(lifted.addr, &[TRAP])?;
        site.saved = Some(current);
        Ok(())
    }

    /// Restore original bytes at every installed site, including orphans.
    pub fn restore_all(&mut self, control: &dyn ProcessControl) -> Result<(), Error> {
        let mut errors = vec![];
        for (addr, site) in self.sites.iter_mut() {
            if let Some(original) = site.saved {
                match Self::restore_byte(control, *addr, original) {
                    Ok(_) => site.saved = None,
                    Err(e) => errors.push(e),
                }
            }
        }
        if !errors.is_empty() {
            return Err(MultipleErrors(errors));
        }
        Ok(())
    }

    /// Replace trap bytes in a memory dump with the original ones.
    pub fn mask_traps(&self, addr: RelocatedAddress, data: &mut [u8]) {
        for (site_addr, site) in &self.sites {
            if let Some(original) = site.saved {
                if *site_addr >= addr && site_addr.as_usize() < addr.as_usize() + data.len() {
                    data[site_addr.as_usize() - addr.as_usize()] = original;
                }
            }
        }
    }

    /// Prepare data for writing into debugee memory: bytes that land on installed sites
    /// are replaced by the trap, overwritten bytes become new original ones
    /// after [`BreakpointManager::commit_write`].
    pub fn prepare_write(&self, addr: RelocatedAddress, data: &mut [u8]) -> PreparedWrite {
        let mut originals = vec![];
        for (site_addr, site) in &self.sites {
            if site.saved.is_some()
                && *site_addr >= addr
                && site_addr.as_usize() < addr.as_usize() + data.len()
            {
                let idx = site_addr.as_usize() - addr.as_usize();
                originals.push((*site_addr, data[idx]));
                data[idx] = TRAP;
            }
        }
        PreparedWrite { originals }
    }

    /// Remember original bytes after a successful write.
    pub fn commit_write(&mut self, prepared: PreparedWrite) {
        for (addr, byte) in prepared.originals {
            if let Some(site) = self.sites.get_mut(&addr) {
                site.saved = Some(byte);
            }
        }
    }

    /// Register a hit at address. Every user breakpoint at address counts the hit,
    /// returns the number of the first one whose condition holds.
    pub fn evaluate_hit(
        &mut self,
        addr: RelocatedAddress,
        thread: Pid,
        registers: &RegisterMap,
    ) -> Option<u32> {
        let mut stop_at = None;
        for (number, brkpt) in self.breakpoints.iter_mut() {
            if brkpt.addr != addr || brkpt.kind != BreakpointKind::User {
                continue;
            }
            brkpt.hits += 1;
            let ctx = HitContext {
                thread,
                pc: addr,
                registers,
                hit_count: brkpt.hits,
            };
            let fired = brkpt
                .condition
                .as_ref()
                .map(|c| c.evaluate(&ctx))
                .unwrap_or(true);
            if fired && stop_at.is_none() {
                stop_at = Some(*number);
            }
        }
        stop_at
    }

    /// True if there is an internal breakpoint at address.
    pub fn has_internal(&self, addr: RelocatedAddress) -> bool {
        self.breakpoints
            .values()
            .any(|b| b.addr == addr && b.kind == BreakpointKind::Internal)
    }

    /// Place of a breakpoint.
    pub fn place(&self, number: u32) -> Option<&Place> {
        self.breakpoints.get(&number).and_then(|b| b.place.as_ref())
    }

    /// All breakpoints in installation order.
    pub fn list(&self) -> Vec<BreakpointView> {
        self.breakpoints
            .iter()
            .map(|(number, brkpt)| BreakpointView {
                number: *number,
                addr: brkpt.addr,
                kind: brkpt.kind,
                hits: brkpt.hits,
                place: brkpt.place.clone(),
                conditional: brkpt.condition.is_some(),
            })
            .collect()
    }
}
