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

//! Named OS threads with a startup handshake.

use std::cell::{Cell, RefCell};
use std::io;
use std::sync::mpsc;
use std::thread::JoinHandle;

use log::error;

use crate::sys;

// The kernel caps thread names at 15 bytes plus the terminator.
const OS_NAME_LIMIT: usize = 15;

thread_local! {
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from("UNKNOWN"));
    static THREAD_TID: Cell<libc::pid_t> = Cell::new(-1);
}

/// OS thread id of the calling thread, fetched once and cached.
pub fn current_tid() -> libc::pid_t {
    THREAD_TID.with(|t| {
        let mut tid = t.get();
        if tid < 0 {
            tid = sys::gettid();
            t.set(tid);
        }
        tid
    })
}

/// Name of the calling thread as recorded by this module.
pub fn current_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

pub(crate) fn set_current_name(name: &str) {
    THREAD_NAME.with(|n| *n.borrow_mut() = name.to_string());
}

/// A named OS thread running a closure.
///
/// The constructor does not return until the child has recorded its tid and
/// name, so `tid()` is valid the moment `spawn` comes back. Joining is
/// explicit; dropping an unjoined `Thread` detaches it.
pub struct Thread {
    name: String,
    tid: libc::pid_t,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    pub fn spawn<F>(f: F, name: &str) -> io::Result<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let full_name = name.to_string();
        let child_name = full_name.clone();
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::Builder::new()
            .name(truncate_name(name))
            .spawn(move || {
                set_current_name(&child_name);
                let tid = current_tid();
                // Handshake before any user code runs.
                let _ = tx.send(tid);
                f();
            })?;

        let tid = rx.recv().map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "thread exited before the startup handshake")
        })?;

        Ok(Thread {
            name: full_name,
            tid,
            handle: Some(handle),
        })
    }

    pub fn tid(&self) -> libc::pid_t {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("thread {} panicked", self.name);
            }
        }
    }
}

fn truncate_name(name: &str) -> String {
    if name.len() <= OS_NAME_LIMIT {
        return name.to_string();
    }
    let mut end = OS_NAME_LIMIT;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tid_valid_on_return() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut t = Thread::spawn(
            move || {
                tx.send(current_tid()).unwrap();
            },
            "handshake",
        )
        .unwrap();
        let reported = t.tid();
        assert!(reported > 0);
        assert_eq!(rx.recv().unwrap(), reported);
        t.join();
    }

    #[test]
    fn test_name_recorded_in_child() {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut t = Thread::spawn(
            move || {
                tx.send(current_name()).unwrap();
            },
            "a thread name longer than the kernel allows",
        )
        .unwrap();
        // The full name survives in the thread-local even though the OS name
        // is truncated.
        assert_eq!(rx.recv().unwrap(), "a thread name longer than the kernel allows");
        t.join();
    }

    #[test]
    fn test_truncate_name() {
        assert_eq!(truncate_name("short"), "short");
        assert_eq!(truncate_name("exactly15bytes!"), "exactly15bytes!");
        assert_eq!(truncate_name("more than fifteen bytes"), "more than fifte");
    }
}
