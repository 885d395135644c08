use std::thread;
use std::thread::sleep;
use std::time::Duration;

fn main() {
    let workers: Vec<_> = (0..2)
        .map(|i| {
            thread::spawn(move || loop {
                sleep(Duration::from_millis(100 * (i + 1)));
            })
        })
        .collect();

    loop {
        sleep(Duration::from_millis(50));
        if workers.iter().any(|w| w.is_finished()) {
            break;
        }
    }
}
