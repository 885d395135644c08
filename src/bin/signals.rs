use nix::sys::signal::{raise, Signal};

fn main() {
    // default action of SIGURG is ignore, program continues
    raise(Signal::SIGURG).unwrap();
    println!("SIGURG raised");

    // default action of SIGUSR1 terminates a program
    raise(Signal::SIGUSR1).unwrap();
    println!("unreachable");
}
