extern crate fiberio;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fiberio::{Dispatcher, Event, IoManager};

fn main() {
    env_logger::init();

    let io = IoManager::new(2, false, "reactor").unwrap();

    // A recurring heartbeat, cancelled once it has fired a few times.
    let beats = Arc::new(AtomicUsize::new(0));
    let heartbeat = {
        let beats = beats.clone();
        io.add_timer(
            100,
            move || {
                let n = beats.fetch_add(1, Ordering::SeqCst) + 1;
                println!("heartbeat {}", n);
            },
            true,
        )
    };

    // Wake a closure when the pipe becomes readable.
    let mut fds = [0 as libc::c_int; 2];
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
    io.add_event_with(fds[0], Event::Read, || {
        println!("pipe is readable");
    })
    .unwrap();

    std::thread::sleep(Duration::from_millis(250));
    unsafe {
        libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1);
    }

    std::thread::sleep(Duration::from_millis(250));
    heartbeat.cancel();

    io.stop();
    unsafe {
        libc::close(fds[0]);
        libc::close(fds[1]);
    }
}
