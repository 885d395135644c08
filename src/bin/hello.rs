use std::thread::sleep;
use std::time::Duration;

fn main() {
    greet("Hello, world!");

    sleep(Duration::from_millis(100));

    let total = sum(10);
    greet(&format!("sum: {total}"));
}

#[inline(never)]
fn greet(s: &str) {
    println!("{}", s)
}

#[inline(never)]
fn sum(n: u64) -> u64 {
    let mut total = 0;
    for i in 0..n {
        total += i;
    }
    total
}
