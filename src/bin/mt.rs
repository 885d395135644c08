use std::thread;
use std::time::Duration;

fn main() {
    let jh1 = thread::spawn(sum1);
    let jh2 = thread::spawn(sum2);

    let sum1 = jh1.join().unwrap();
    let sum2 = jh2.join().unwrap();

    println!("total {}", sum1 + sum2);
}

#[inline(never)]
fn sum1() -> i32 {
    thread::sleep(Duration::from_millis(200));
    let mut sum = 0;
    for i in 0..100 {
        sum += i;
    }
    println!("sum1: {sum}");
    sum
}

#[inline(never)]
fn sum2() -> i32 {
    thread::sleep(Duration::from_millis(100));
    let mut sum = 0;
    for i in 0..200 {
        sum += i;
    }
    println!("sum2: {sum}");
    sum
}
