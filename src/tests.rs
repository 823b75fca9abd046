// The MIT License (MIT)

// Copyright (c) 2015 Rustcc developers

// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:

// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.

// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! End-to-end scenarios across the scheduler, the timers and the reactor.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::coroutine::Coroutine;
use crate::io::{Event, IoManager};
use crate::scheduler::{Dispatcher, Scheduler, Task};
use crate::sys;
use crate::thread;
use crate::State;

fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// Polls `cond` for up to two seconds.
fn wait_until<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        sleep_ms(10);
    }
    false
}

#[test]
fn test_pingpong_yield() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1, false, "pingpong");
    sched.start();

    let log = Arc::new(Mutex::new(Vec::new()));

    let spawn_bouncer = |tag: &'static str| {
        let log = log.clone();
        crate::Builder::new().spawn(move || {
            log.lock().unwrap().push(format!("{}1", tag));
            // Get back in line before yielding, so the worker finds us again.
            if let Some(d) = Scheduler::get_this() {
                d.schedule_task(Task::from(Coroutine::current()));
            }
            crate::sched();
            log.lock().unwrap().push(format!("{}2", tag));
        })
    };

    let a = spawn_bouncer("A");
    let b = spawn_bouncer("B");
    // Enqueue both from inside the worker so it cannot pop A before B is in
    // line behind it.
    let first = {
        let (a, b) = (a.clone(), b.clone());
        Task::new(move || {
            let d = Scheduler::get_this().unwrap();
            d.schedule_task(Task::from(a));
            d.schedule_task(Task::from(b));
        })
    };
    sched.schedule(first);

    assert!(wait_until(|| {
        a.state() == State::Terminated && b.state() == State::Terminated
    }));

    sched.stop();
    assert!(sched.base_stopping());
    assert_eq!(
        *log.lock().unwrap(),
        vec!["A1", "B1", "A2", "B2"],
        "the two coroutines must interleave once each"
    );
}

#[test]
fn test_scheduler_runs_closures() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(4, false, "closures");
    sched.start();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let counter = counter.clone();
        sched.schedule(Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }

    assert!(wait_until(|| counter.load(Ordering::SeqCst) == 100));
    sched.stop();
    assert!(sched.base_stopping());

    // A stopped scheduler rejects new work at the door.
    let late = counter.clone();
    sched.schedule(Task::new(move || {
        late.fetch_add(1, Ordering::SeqCst);
    }));
    sleep_ms(50);
    assert_eq!(counter.load(Ordering::SeqCst), 100);
}

#[test]
fn test_use_caller_drains_on_stop() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(1, true, "caller");
    sched.start();

    let counter = Arc::new(AtomicUsize::new(0));
    for _ in 0..10 {
        let counter = counter.clone();
        sched.schedule(Task::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    }
    // No worker threads exist; the queue drains on this thread inside stop.
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    sched.stop();
    assert_eq!(counter.load(Ordering::SeqCst), 10);
}

#[test]
fn test_affinity_pins_tasks() {
    let _ = env_logger::try_init();
    let sched = Scheduler::new(4, false, "affinity");
    sched.start();

    let ids = sched.thread_ids();
    assert_eq!(ids.len(), 4);
    let target = ids[1];

    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..10 {
        let seen = seen.clone();
        sched.schedule(
            Task::new(move || {
                seen.lock().unwrap().push(thread::current_tid());
            })
            .with_thread(target),
        );
    }

    assert!(wait_until(|| seen.lock().unwrap().len() == 10));
    sched.stop();

    let seen = seen.lock().unwrap();
    assert!(
        seen.iter().all(|&tid| tid == target),
        "pinned tasks ran on {:?}, wanted {}",
        *seen,
        target
    );
}

#[test]
fn test_pipe_readiness() {
    let _ = env_logger::try_init();
    let io = IoManager::new(2, false, "io-pipe").unwrap();
    let fds = sys::pipe().unwrap();

    let log = Arc::new(Mutex::new(String::new()));
    {
        let log = log.clone();
        io.add_event_with(fds[0], Event::Read, move || {
            log.lock().unwrap().push('R');
        })
        .unwrap();
    }
    assert_eq!(io.pending_events(), 1);

    sys::write_byte(fds[1], b'x').unwrap();

    assert!(wait_until(|| *log.lock().unwrap() == "R"));
    assert_eq!(io.pending_events(), 0);

    io.stop();
    sys::close(fds[0]);
    sys::close(fds[1]);
}

#[test]
fn test_add_then_del_does_not_fire() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-del").unwrap();
    let fds = sys::pipe().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        io.add_event_with(fds[0], Event::Read, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    assert_eq!(io.pending_events(), 1);

    assert!(io.del_event(fds[0], Event::Read));
    assert_eq!(io.pending_events(), 0);
    assert!(!io.del_event(fds[0], Event::Read), "second del must miss");

    sys::write_byte(fds[1], b'x').unwrap();
    sleep_ms(100);
    assert_eq!(fired.load(Ordering::SeqCst), 0, "del_event must not fire");

    // The slot is back to its pre-add state: arming again works.
    io.add_event_with(fds[0], Event::Read, || {}).unwrap();
    assert!(io.del_event(fds[0], Event::Read));

    io.stop();
    sys::close(fds[0]);
    sys::close(fds[1]);
}

#[test]
fn test_cancel_event_fires_exactly_once() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-cancel").unwrap();
    let fds = sys::pipe().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        // The pipe stays empty, so readiness alone can never fire this.
        io.add_event_with(fds[0], Event::Read, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    assert!(io.cancel_event(fds[0], Event::Read));
    assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1));
    assert_eq!(io.pending_events(), 0);

    assert!(!io.cancel_event(fds[0], Event::Read), "nothing left to cancel");
    sleep_ms(100);
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    io.stop();
    sys::close(fds[0]);
    sys::close(fds[1]);
}

#[test]
fn test_cancel_all_fires_both_slots() {
    let _ = env_logger::try_init();
    let io = IoManager::new(2, false, "io-all").unwrap();

    let mut pair = [0 as libc::c_int; 2];
    let rt = unsafe {
        libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, pair.as_mut_ptr())
    };
    assert_eq!(rt, 0);

    let reads = Arc::new(AtomicUsize::new(0));
    let writes = Arc::new(AtomicUsize::new(0));
    {
        let reads = reads.clone();
        io.add_event_with(pair[0], Event::Read, move || {
            reads.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    {
        let writes = writes.clone();
        // A fresh socket is writable, so the reactor may beat cancel_all to
        // this one; either path must fire it exactly once.
        io.add_event_with(pair[0], Event::Write, move || {
            writes.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    sleep_ms(50);
    io.cancel_all(pair[0]);

    assert!(wait_until(|| {
        reads.load(Ordering::SeqCst) == 1 && writes.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(io.pending_events(), 0);
    sleep_ms(100);
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert_eq!(writes.load(Ordering::SeqCst), 1);

    io.stop();
    sys::close(pair[0]);
    sys::close(pair[1]);
}

#[test]
fn test_event_wait_resumes_coroutine() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-wait").unwrap();
    let fds = sys::pipe().unwrap();

    let woke = Arc::new(AtomicBool::new(false));
    let task = {
        let io = io.clone();
        let woke = woke.clone();
        let fd = fds[0];
        Task::new(move || {
            io.add_event(fd, Event::Read).unwrap();
            // Suspended here until the read end becomes readable.
            crate::sched();
            woke.store(true, Ordering::SeqCst);
        })
    };
    io.schedule_task(task);

    sleep_ms(50);
    assert!(!woke.load(Ordering::SeqCst));
    assert_eq!(io.pending_events(), 1);

    sys::write_byte(fds[1], b'x').unwrap();
    assert!(wait_until(|| woke.load(Ordering::SeqCst)));
    assert_eq!(io.pending_events(), 0);

    io.stop();
    sys::close(fds[0]);
    sys::close(fds[1]);
}

#[test]
fn test_one_shot_timer() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-timer").unwrap();

    let log = Arc::new(Mutex::new(String::new()));
    let timer = {
        let log = log.clone();
        io.add_timer(
            50,
            move || {
                log.lock().unwrap().push('T');
            },
            false,
        )
    };

    sleep_ms(100);
    assert_eq!(*log.lock().unwrap(), "T");
    assert!(!timer.cancel(), "cancel after firing must report false");
    assert!(!io.has_timer());

    io.stop();
}

#[test]
fn test_recurring_timer() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-recur").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let timer = {
        let count = count.clone();
        io.add_timer(
            30,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            true,
        )
    };

    sleep_ms(100);
    assert!(timer.cancel());
    let fired = count.load(Ordering::SeqCst);
    assert!((2..=4).contains(&fired), "fired {} times", fired);

    sleep_ms(200);
    assert_eq!(count.load(Ordering::SeqCst), fired, "cancelled timer kept firing");
    assert!(!io.has_timer());

    io.stop();
}

#[test]
fn test_condition_timer_dead_cond() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-cond").unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let cond = Arc::new(());
    {
        let count = count.clone();
        io.add_condition_timer(
            30,
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            },
            &cond,
            false,
        );
    }
    drop(cond);

    sleep_ms(100);
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(!io.has_timer());

    io.stop();
}

#[test]
fn test_context_table_growth_preserves_events() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-grow").unwrap();
    let fds = sys::pipe().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = fired.clone();
        io.add_event_with(fds[0], Event::Read, move || {
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }

    // Push a descriptor past the initial table size to force growth.
    let mut dups = Vec::new();
    for _ in 0..40 {
        let fd = unsafe { libc::dup(fds[0]) };
        assert!(fd >= 0);
        dups.push(fd);
    }
    let high = *dups.last().unwrap();
    assert!(high >= 32, "fd {} did not outgrow the initial table", high);

    io.add_event_with(high, Event::Write, || {}).unwrap();
    assert_eq!(io.pending_events(), 2);
    assert!(io.del_event(high, Event::Write));

    // The low registration survived the growth.
    sys::write_byte(fds[1], b'x').unwrap();
    assert!(wait_until(|| fired.load(Ordering::SeqCst) == 1));
    assert_eq!(io.pending_events(), 0);

    io.stop();
    for fd in dups {
        sys::close(fd);
    }
    sys::close(fds[0]);
    sys::close(fds[1]);
}

#[test]
fn test_double_arm_rejected() {
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-dup").unwrap();
    let fds = sys::pipe().unwrap();

    io.add_event_with(fds[0], Event::Read, || {}).unwrap();
    let err = io.add_event_with(fds[0], Event::Read, || {}).unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
    assert_eq!(io.pending_events(), 1);

    assert!(io.del_event(fds[0], Event::Read));
    io.stop();
    sys::close(fds[0]);
    sys::close(fds[1]);
}

#[test]
fn test_drop_without_stop_releases_runtime() {
    let _ = env_logger::try_init();
    let io = IoManager::new(2, false, "io-drop").unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    {
        let ticks = ticks.clone();
        // Recurring wakeups keep the workers' poll timeouts short, so they
        // notice the dropped runtime promptly.
        io.add_timer(
            20,
            move || {
                ticks.fetch_add(1, Ordering::SeqCst);
            },
            true,
        );
    }
    assert!(wait_until(|| ticks.load(Ordering::SeqCst) >= 1));

    let weak = Arc::downgrade(&io);
    drop(io);

    // Workers fail their next upgrade, the last one runs the teardown, and
    // the manager is truly gone.
    assert!(wait_until(|| weak.upgrade().is_none()));
}

#[test]
fn test_event_timeout_composed_from_timer() {
    // An event wait with a timeout: a timer cancels the registration, which
    // pushes the waiter out through the same wakeup it was armed with.
    let _ = env_logger::try_init();
    let io = IoManager::new(1, false, "io-timeout").unwrap();
    let fds = sys::pipe().unwrap();

    let woken = Arc::new(AtomicUsize::new(0));
    {
        let woken = woken.clone();
        io.add_event_with(fds[0], Event::Read, move || {
            woken.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    }
    {
        let io2 = io.clone();
        let fd = fds[0];
        io.add_timer(
            60,
            move || {
                // Nothing arrived in time; push the waiter out.
                io2.cancel_event(fd, Event::Read);
            },
            false,
        );
    }

    // No data is ever written, so only the timeout path can wake the waiter.
    assert!(wait_until(|| woken.load(Ordering::SeqCst) == 1));
    assert_eq!(io.pending_events(), 0);
    sleep_ms(100);
    assert_eq!(woken.load(Ordering::SeqCst), 1);

    io.stop();
    sys::close(fds[0]);
    sys::close(fds[1]);
}
