/// Process breakpoint
pub const TRAP_BRKPT: i32 = 0x1;
/// Process trace trap
pub const TRAP_TRACE: i32 = 0x2;
/// Sent by the kernel from somewhere
pub const SI_KERNEL: i32 = 0x80;

/// `int3` opcode.
pub const TRAP: u8 = 0xCC;
/// Length of the trap instruction, after a hit the program counter points this far past it.
pub const TRAP_WIDTH: usize = 1;
