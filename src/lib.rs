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

//! # fiberio
//!
//! Stackful coroutines multiplexed onto a small thread pool, with an epoll
//! reactor and a timer queue driving wakeups. The pieces compose bottom-up:
//!
//! * [`Coroutine`] — a task with its own stack, suspended and resumed by
//!   explicit context switches.
//! * [`Scheduler`] — worker threads pulling coroutines and closures from a
//!   shared FIFO queue, with optional per-task thread affinity.
//! * [`TimerManager`] — a deadline-sorted timer set, safe against the wall
//!   clock stepping backward.
//! * [`IoManager`] — a scheduler whose idle loop polls epoll, converting fd
//!   readiness and timer expirations back into scheduler tasks.
//!
//! ```no_run
//! use fiberio::{Dispatcher, IoManager};
//!
//! let io = IoManager::new(2, false, "io").unwrap();
//!
//! io.add_timer(50, || println!("50ms elapsed"), false);
//! io.schedule_task(fiberio::Task::new(|| println!("hello from a worker")));
//!
//! std::thread::sleep(std::time::Duration::from_millis(100));
//! io.stop();
//! ```

pub use crate::builder::Builder;
pub use crate::coroutine::{Coroutine, Handle, State};
pub use crate::io::{Event, IoManager};
pub use crate::options::{Options, DEFAULT_STACK_SIZE};
pub use crate::scheduler::{Dispatcher, Scheduler, Task};
pub use crate::thread::Thread;
pub use crate::timer::{Timer, TimerCallback, TimerManager, NO_TIMER};

pub mod builder;
pub mod coroutine;
pub mod io;
pub mod options;
pub mod scheduler;
mod stack;
mod sys;
pub mod thread;
pub mod timer;

#[cfg(test)]
mod tests;

use std::error;
use std::fmt;
use std::result;

/// Why a coroutine could not be resumed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error {
    /// The coroutine's entry function has returned.
    Terminated,
    /// The coroutine is already running on some thread.
    Running,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Terminated => write!(f, "coroutine has terminated"),
            Error::Running => write!(f, "coroutine is already running"),
        }
    }
}

impl error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

/// Spawn a new Coroutine
///
/// Equivalent to `Coroutine::spawn`.
pub fn spawn<F>(f: F) -> Handle
where
    F: FnOnce() + Send + 'static,
{
    Coroutine::spawn(f)
}

/// Get the current Coroutine
///
/// Equivalent to `Coroutine::current`.
pub fn current() -> Handle {
    Coroutine::current()
}

/// Yield the current Coroutine
///
/// Equivalent to `Coroutine::sched`.
pub fn sched() {
    Coroutine::sched()
}
