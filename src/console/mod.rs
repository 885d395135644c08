//! Minimal terminal front end: runs a debugee from stop to stop and prints every stop.

use crate::config::EngineConfig;
use crate::console::hook::TerminalHook;
use crate::debugger::address::RelocatedAddress;
use crate::debugger::{Debugger, DebuggerBuilder, StopEvent, StopReason};
use anyhow::Context;
use log::warn;
use nix::unistd::Pid;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub mod hook;

/// Breakpoint location from a command line: `0x401000` or `main.rs:12`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BreakpointSpec {
    Address(RelocatedAddress),
    Line(PathBuf, u64),
}

impl FromStr for BreakpointSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(hex) = s.strip_prefix("0x") {
            let addr = usize::from_str_radix(hex, 16)
                .map_err(|e| format!("invalid address {s}: {e}"))?;
            return Ok(BreakpointSpec::Address(addr.into()));
        }

        let (file, line) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expect ADDR or FILE:LINE, got {s}"))?;
        let line = line
            .parse()
            .map_err(|e| format!("invalid line number in {s}: {e}"))?;
        Ok(BreakpointSpec::Line(PathBuf::from(file), line))
    }
}

impl Display for BreakpointSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakpointSpec::Address(addr) => write!(f, "{addr}"),
            BreakpointSpec::Line(file, line) => write!(f, "{}:{line}", file.display()),
        }
    }
}

#[derive(Default)]
pub struct AppBuilder {
    config: EngineConfig,
    breakpoints: Vec<BreakpointSpec>,
    step_after_break: bool,
}

impl AppBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn breakpoints(self, breakpoints: Vec<BreakpointSpec>) -> Self {
        Self {
            breakpoints,
            ..self
        }
    }

    /// Do a step over after each breakpoint stop.
    pub fn step_after_break(self, enable: bool) -> Self {
        Self {
            step_after_break: enable,
            ..self
        }
    }

    fn debugger_builder(&self) -> DebuggerBuilder {
        DebuggerBuilder::new()
            .with_hooks(TerminalHook)
            .with_config(self.config.clone())
    }

    /// Start a new program.
    pub fn launch(
        self,
        program: &str,
        args: &[String],
        cwd: Option<&Path>,
    ) -> anyhow::Result<TerminalApplication> {
        let debugger = self
            .debugger_builder()
            .launch(program, args.iter().cloned(), cwd)
            .with_context(|| format!("launch {program}"))?;
        println!("Program {program} started, pid: {}", debugger.pid());
        self.into_app(debugger)
    }

    /// Attach to a running process.
    pub fn attach(self, pid: Pid) -> anyhow::Result<TerminalApplication> {
        let debugger = self
            .debugger_builder()
            .attach(pid)
            .with_context(|| format!("attach to {pid}"))?;
        println!(
            "Attached to {pid}, threads: {}",
            debugger.threads().len()
        );
        self.into_app(debugger)
    }

    fn into_app(self, mut debugger: Debugger) -> anyhow::Result<TerminalApplication> {
        for spec in &self.breakpoints {
            match spec {
                BreakpointSpec::Address(addr) => {
                    let handle = debugger.install_breakpoint(*addr, None)?;
                    println!("Breakpoint {} at {addr}", handle.number());
                }
                BreakpointSpec::Line(file, line) => {
                    for handle in debugger.install_breakpoint_at_line(file, *line, None)? {
                        println!("Breakpoint {} at {} ({spec})", handle.number(), handle.addr());
                    }
                }
            }
        }

        let halt = debugger.halt_handle();
        ctrlc::set_handler(move || {
            if let Err(e) = halt.halt() {
                warn!(target: "debugger", "halt debugee: {e:#}");
            }
        })?;

        Ok(TerminalApplication {
            debugger,
            step_after_break: self.step_after_break,
        })
    }
}

pub struct TerminalApplication {
    debugger: Debugger,
    step_after_break: bool,
}

impl TerminalApplication {
    /// Continue debugee from stop to stop until it exits or halted by user.
    pub fn run(mut self) -> anyhow::Result<()> {
        loop {
            let event = self.debugger.continue_debugee()?;
            if Self::is_final(&event) {
                return Ok(());
            }

            if self.step_after_break && matches!(event.reason, StopReason::Breakpoint(_)) {
                let event = self.debugger.step_over()?;
                if Self::is_final(&event) {
                    return Ok(());
                }
            }
        }
    }

    fn is_final(event: &StopEvent) -> bool {
        for tid in &event.vanished {
            println!("Thread {tid} exited");
        }
        if event.unsymbolized {
            println!("No line information at {:?}", event.pc);
        }

        match event.reason {
            StopReason::Exited(_) | StopReason::Killed(_) => true,
            StopReason::Halt => {
                println!("Program halted by user, thread {}", event.thread);
                true
            }
            _ => false,
        }
    }
}
