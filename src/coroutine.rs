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

//! Stackful coroutines switched with the ucontext facility.
//!
//! ```no_run
//! use fiberio::{spawn, sched};
//!
//! let coro = spawn(|| {
//!     println!("before yield");
//!
//!     // Yield back to whoever resumed this coroutine
//!     sched();
//!
//!     println!("I am back!");
//! });
//!
//! coro.resume().expect("failed to resume");
//!
//! println!("back to main");
//!
//! coro.resume().expect("failed to resume");
//!
//! println!("coroutine finished");
//! ```

/* Every thread keeps three coroutine slots:
 *
 *   main      - the thread's native stack, created lazily by `current()`
 *   scheduler - the coroutine a scheduled task swaps against; defaults to
 *               main, replaced on a use_caller thread by the coroutine that
 *               runs the worker loop
 *   current   - whatever is executing right now
 *
 * A coroutine built with run_in_scheduler pairs its resume/yield with the
 * scheduler slot, everything else pairs with main:
 *
 *            resume                       resume
 *   main <-----------> scheduler coro <-----------> task coro
 *            yield     (worker loop)      yield
 *
 * On a plain worker thread the scheduler slot *is* main, so the worker loop
 * runs on the native stack and the same pairing holds.
 */

use std::cell::{RefCell, UnsafeCell};
use std::fmt;
use std::io;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::error;

use crate::options::Options;
use crate::stack::Stack;
use crate::{Error, Result};

/// Coroutine state
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    /// Suspended, may be resumed
    Ready,
    /// Executing on some thread
    Running,
    /// Entry function returned; only `reset` can revive it
    Terminated,
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static CURRENT: RefCell<Option<Handle>> = RefCell::new(None);
    static MAIN: RefCell<Option<Handle>> = RefCell::new(None);
    static SCHEDULER_TARGET: RefCell<Option<Handle>> = RefCell::new(None);
}

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static LIVE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Handle of a Coroutine
pub struct Handle(Arc<UnsafeCell<Coroutine>>);

unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Clone for Handle {
    fn clone(&self) -> Handle {
        Handle(self.0.clone())
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Coroutine({})", self.id())
    }
}

impl Handle {
    fn new(c: Coroutine) -> Handle {
        Handle(Arc::new(UnsafeCell::new(c)))
    }

    fn as_raw(&self) -> *mut Coroutine {
        self.0.get()
    }

    unsafe fn get_inner(&self) -> &Coroutine {
        &*self.0.get()
    }

    unsafe fn get_inner_mut(&self) -> &mut Coroutine {
        &mut *self.0.get()
    }

    pub fn id(&self) -> u64 {
        unsafe { self.get_inner().id }
    }

    /// Get the state of the Coroutine
    pub fn state(&self) -> State {
        unsafe { *self.get_inner().state.lock() }
    }

    fn set_state(&self, state: State) {
        unsafe {
            *self.get_inner().state.lock() = state;
        }
    }

    /// Resume the Coroutine on the calling thread.
    ///
    /// Switches out of the thread's scheduler coroutine or main coroutine,
    /// depending on how this coroutine was spawned, and into this one. The
    /// call returns when the coroutine yields or terminates.
    pub fn resume(&self) -> Result<()> {
        {
            let mut state = unsafe { self.get_inner().state.lock() };
            match *state {
                State::Terminated => return Err(Error::Terminated),
                State::Running => return Err(Error::Running),
                State::Ready => *state = State::Running,
            }
        }

        let run_in_scheduler = unsafe { self.get_inner().run_in_scheduler };
        let from = swap_partner(run_in_scheduler);
        // The swap source stops being the thread's running coroutine for the
        // whole suspension.
        from.set_state(State::Ready);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        unsafe {
            // `from` stays on this frame for the whole suspension, so the
            // context we save into cannot go away under us.
            let from_ctx = &mut from.get_inner_mut().ctx as *mut libc::ucontext_t;
            let to_ctx = &self.get_inner().ctx as *const libc::ucontext_t;
            if libc::swapcontext(from_ctx, to_ctx) != 0 {
                fatal("swapcontext");
            }
        }
        from.set_state(State::Running);
        Ok(())
    }

    /// Reinitialize a Terminated coroutine atop its existing stack with a new
    /// entry function.
    pub fn reset<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = unsafe { self.get_inner_mut() };
        {
            let state = inner.state.lock();
            assert_eq!(*state, State::Terminated, "only a terminated coroutine can be reset");
        }
        assert!(inner.stack.is_some(), "cannot reset a coroutine that has no stack of its own");
        inner.func = Some(Box::new(f));
        unsafe {
            init_context(inner);
        }
        self.set_state(State::Ready);
    }

    fn ptr_eq(&self, other: &Handle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A coroutine: a register context plus the stack it runs on.
pub struct Coroutine {
    id: u64,

    /// Guards the resume/state-check window against another worker.
    state: spin::Mutex<State>,

    /// None for a thread's main coroutine, which borrows the native stack.
    stack: Option<Stack>,

    /// Valid whenever the coroutine is alive and not running.
    ctx: libc::ucontext_t,

    func: Option<EntryFn>,

    run_in_scheduler: bool,
}

unsafe impl Send for Coroutine {}

impl Drop for Coroutine {
    fn drop(&mut self) {
        LIVE_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Coroutine {
    /// Spawn a Coroutine with the given options.
    pub fn spawn_opts<F>(f: F, opts: Options) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine::spawn_boxed(Box::new(f), opts)
    }

    /// Spawn a Coroutine with default options.
    pub fn spawn<F>(f: F) -> Handle
    where
        F: FnOnce() + Send + 'static,
    {
        Coroutine::spawn_opts(f, Options::default())
    }

    pub(crate) fn spawn_boxed(f: EntryFn, opts: Options) -> Handle {
        let handle = Handle::new(Coroutine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: spin::Mutex::new(State::Ready),
            stack: Some(Stack::new(opts.stack_size)),
            ctx: unsafe { mem::zeroed() },
            func: Some(f),
            run_in_scheduler: opts.run_in_scheduler,
        });
        LIVE_COUNT.fetch_add(1, Ordering::SeqCst);
        // The context refers into its own allocation, so it is only built
        // once the coroutine has its final address.
        unsafe {
            init_context(handle.get_inner_mut());
        }
        handle
    }

    /// Get a Handle to this thread's current coroutine.
    ///
    /// The first call on a thread creates the thread's main coroutine, which
    /// represents the native stack, and installs it as both the main and the
    /// default scheduler coroutine for the thread.
    pub fn current() -> Handle {
        if let Some(handle) = CURRENT.with(|c| c.borrow().clone()) {
            return handle;
        }

        let handle = Handle::new(Coroutine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            state: spin::Mutex::new(State::Running),
            stack: None,
            ctx: unsafe { mem::zeroed() },
            func: None,
            run_in_scheduler: false,
        });
        LIVE_COUNT.fetch_add(1, Ordering::SeqCst);
        unsafe {
            if libc::getcontext(&mut handle.get_inner_mut().ctx) != 0 {
                fatal("getcontext");
            }
        }

        CURRENT.with(|c| *c.borrow_mut() = Some(handle.clone()));
        MAIN.with(|m| *m.borrow_mut() = Some(handle.clone()));
        SCHEDULER_TARGET.with(|s| *s.borrow_mut() = Some(handle.clone()));
        handle
    }

    /// Id of the current coroutine, or `u64::MAX` if the thread has none yet.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map(|h| h.id()).unwrap_or(u64::MAX))
    }

    /// Number of live coroutines in the process, main coroutines included.
    pub fn total() -> u64 {
        LIVE_COUNT.load(Ordering::SeqCst)
    }

    /// Yield the current coroutine back to its resume partner.
    ///
    /// A Running coroutine becomes Ready; whoever resumed it continues after
    /// its `resume()` call. Yielding a thread's root coroutine is a no-op.
    pub fn sched() {
        let cur = Coroutine::current();
        let raw = cur.as_raw();
        let run_in_scheduler = unsafe { (*raw).run_in_scheduler };
        let partner = swap_partner(run_in_scheduler);
        if cur.ptr_eq(&partner) {
            return;
        }
        {
            let mut state = unsafe { &(*raw).state }.lock();
            debug_assert!(*state == State::Running || *state == State::Terminated);
            if *state != State::Terminated {
                *state = State::Ready;
            }
        }
        drop(partner);
        unsafe {
            switch_out(raw);
        }
    }
}

/// Installs the coroutine the worker loop of a use_caller scheduler runs in
/// as this thread's scheduler slot.
pub(crate) fn set_scheduler_target(handle: Handle) {
    SCHEDULER_TARGET.with(|s| *s.borrow_mut() = Some(handle));
}

/// Points the scheduler slot back at the main coroutine, once the worker
/// loop coroutine it referred to has terminated.
pub(crate) fn reset_scheduler_target() {
    let main = MAIN.with(|m| m.borrow().clone());
    SCHEDULER_TARGET.with(|s| *s.borrow_mut() = main);
}

fn swap_partner(run_in_scheduler: bool) -> Handle {
    let _ = Coroutine::current();
    if run_in_scheduler {
        SCHEDULER_TARGET.with(|s| s.borrow().clone()).expect("no scheduler coroutine on this thread")
    } else {
        MAIN.with(|m| m.borrow().clone()).expect("no main coroutine on this thread")
    }
}

/// Switches from `co` to its swap partner without keeping any owning handle
/// on the current stack.
///
/// Safety: `co` must be the thread's current coroutine, and the caller must
/// guarantee some other handle to it outlives the switch; the terminating
/// path relies on the resuming frame for that.
unsafe fn switch_out(co: *mut Coroutine) {
    let target = swap_partner((*co).run_in_scheduler);
    let to: *mut Coroutine = target.as_raw();
    debug_assert!(!ptr::eq(co, to));
    // Dropping the previous current handle here is fine: the resumer's frame
    // still owns one.
    CURRENT.with(|c| *c.borrow_mut() = Some(target));
    if libc::swapcontext(&mut (*co).ctx, &(*to).ctx) != 0 {
        fatal("swapcontext");
    }
}

unsafe fn init_context(co: &mut Coroutine) {
    if libc::getcontext(&mut co.ctx) != 0 {
        fatal("getcontext");
    }
    let stack = co.stack.as_ref().expect("coroutine context needs a stack");
    co.ctx.uc_link = ptr::null_mut();
    co.ctx.uc_stack.ss_sp = stack.bottom();
    co.ctx.uc_stack.ss_size = stack.len();
    libc::makecontext(&mut co.ctx, coroutine_entry, 0);
}

/// Entry trampoline for every spawned coroutine.
extern "C" fn coroutine_entry() {
    let cur = Coroutine::current();

    let func = unsafe { cur.get_inner_mut().func.take() };
    match func {
        Some(f) => {
            if let Err(err) = panic::catch_unwind(AssertUnwindSafe(f)) {
                let msg = match err.downcast_ref::<&'static str>() {
                    Some(s) => *s,
                    None => match err.downcast_ref::<String>() {
                        Some(s) => &s[..],
                        None => "Box<Any>",
                    },
                };
                error!("coroutine {} panicked at '{}'", cur.id(), msg);
            }
        }
        None => error!("coroutine {} has no entry function", cur.id()),
    }

    cur.set_state(State::Terminated);

    // Stage a raw pointer and give up our own handle before the final
    // switch; anything still owned by this frame would never be dropped.
    let raw = cur.as_raw();
    drop(cur);
    unsafe {
        switch_out(raw);
    }
    unreachable!("terminated coroutine was switched back in");
}

fn fatal(op: &str) -> ! {
    // The stack or register state is unknown at this point; unwinding
    // through it would make things worse.
    error!("{} failed: {}", op, io::Error::last_os_error());
    process::abort();
}
