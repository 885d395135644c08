use crate::debugger::address::RelocatedAddress;
use crate::debugger::symbol::{FunctionRange, LineRange};
use crate::debugger::{EventHook, ThreadChange};
use nix::sys::signal::Signal;
use nix::unistd::Pid;

/// Prints debugger events to stdout.
pub struct TerminalHook;

fn render_place(place: Option<&LineRange>, function: Option<&FunctionRange>) -> String {
    let function = function.map(|f| f.name.as_str()).unwrap_or("??");
    match place {
        Some(place) => format!("{function} at {}:{}", place.file.display(), place.line),
        None => format!("{function} (undefined place)"),
    }
}

impl EventHook for TerminalHook {
    fn on_breakpoint(
        &self,
        pc: RelocatedAddress,
        num: u32,
        place: Option<&LineRange>,
        function: Option<&FunctionRange>,
    ) -> anyhow::Result<()> {
        println!(
            "Hit breakpoint {num} at address {pc}: {}",
            render_place(place, function)
        );
        Ok(())
    }

    fn on_step(
        &self,
        pc: RelocatedAddress,
        place: Option<&LineRange>,
        function: Option<&FunctionRange>,
    ) -> anyhow::Result<()> {
        println!("Step to {pc}: {}", render_place(place, function));
        Ok(())
    }

    fn on_signal(&self, thread: Pid, signal: Signal) {
        println!("Thread {thread} receive signal {signal}, debugee stopped");
    }

    fn on_exit(&self, code: i32) {
        println!("Program exit with code: {code}");
    }

    fn on_thread(&self, thread: Pid, change: ThreadChange) {
        match change {
            ThreadChange::Created => println!("New thread {thread}"),
            ThreadChange::Exited => println!("Thread {thread} exited"),
        }
    }
}
