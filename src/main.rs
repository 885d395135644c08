use clap::{Parser, Subcommand};
use haltpoint::config::EngineConfig;
use haltpoint::console::{AppBuilder, BreakpointSpec};
use nix::unistd::Pid;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a configuration file, `~/.config/haltpoint/config.toml` by default
    #[arg(long, env = "HALTPOINT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a program under debugger
    Run {
        program: String,

        /// Breakpoint location: ADDR (hex with 0x prefix) or FILE:LINE
        #[arg(short, long = "break")]
        breakpoints: Vec<BreakpointSpec>,

        /// Working directory of a program
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Step over a line after each breakpoint hit
        #[arg(long)]
        next: bool,

        /// Program arguments
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Attach to a running process
    Attach {
        pid: i32,

        /// Breakpoint location: ADDR (hex with 0x prefix) or FILE:LINE
        #[arg(short, long = "break")]
        breakpoints: Vec<BreakpointSpec>,

        /// Step over a line after each breakpoint hit
        #[arg(long)]
        next: bool,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = EngineConfig::load(args.config.as_deref())?;

    let app = match args.command {
        Command::Run {
            program,
            breakpoints,
            cwd,
            next,
            args,
        } => AppBuilder::new(config)
            .breakpoints(breakpoints)
            .step_after_break(next)
            .launch(&program, &args, cwd.as_deref())?,
        Command::Attach {
            pid,
            breakpoints,
            next,
        } => AppBuilder::new(config)
            .breakpoints(breakpoints)
            .step_after_break(next)
            .attach(Pid::from_raw(pid))?,
    };

    app.run()
}
