use std::process::exit;

#[inline(never)]
fn depth(level: u64) -> u64 {
    if level == 0 {
        return 0;
    }
    let below = depth(level - 1);
    below + 1
}

fn main() {
    let result = depth(5);
    println!("depth: {result}");
    exit(result as i32);
}
