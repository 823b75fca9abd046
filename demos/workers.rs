extern crate fiberio;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use fiberio::{Dispatcher, Scheduler, Task};

fn main() {
    env_logger::init();

    let threads = num_cpus::get();
    let sched = Scheduler::new(threads, false, "workers");
    sched.start();

    let done = Arc::new(AtomicUsize::new(0));
    for i in 0..threads * 4 {
        let done = done.clone();
        sched.schedule(Task::new(move || {
            println!(
                "task {} on thread {} ({})",
                i,
                fiberio::thread::current_tid(),
                fiberio::thread::current_name()
            );
            done.fetch_add(1, Ordering::SeqCst);
        }));
    }

    while done.load(Ordering::SeqCst) < threads * 4 {
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    sched.stop();
}
