// The MIT License (MIT)

// Copyright (c) 2015 Rustcc Developers

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

//! The I/O manager: a scheduler whose idle coroutine polls epoll, plus a
//! timer set whose expirations turn into scheduler tasks.

use std::any::Any;
use std::cmp;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{error, warn};

use crate::coroutine::{Coroutine, Handle, State};
use crate::scheduler::{Dispatcher, Scheduler, Task};
use crate::sys;
use crate::timer::{Timer, TimerCallback, TimerManager, NO_TIMER};

const READ: u32 = libc::EPOLLIN as u32;
const WRITE: u32 = libc::EPOLLOUT as u32;
const EDGE: u32 = libc::EPOLLET as u32;
const ERR_HUP: u32 = (libc::EPOLLERR | libc::EPOLLHUP) as u32;

/// Events drained per epoll_wait call.
const MAX_EVENTS: usize = 256;
/// Cap on the idle poll so shutdown is bounded.
const MAX_TIMEOUT_MS: u64 = 5000;
const INITIAL_CONTEXTS: usize = 32;

/// A single readiness interest on a file descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Read,
    Write,
}

impl Event {
    fn mask(self) -> u32 {
        match self {
            Event::Read => READ,
            Event::Write => WRITE,
        }
    }
}

enum Waiter {
    Coroutine(Handle),
    Func(Box<dyn FnOnce() + Send + 'static>),
}

/// One armed interest: where to wake, and what to wake.
struct EventSlot {
    scheduler: Weak<dyn Dispatcher>,
    waiter: Waiter,
}

struct FdInner {
    /// Currently armed event mask; a slot below is populated iff its bit is set.
    events: u32,
    read: Option<EventSlot>,
    write: Option<EventSlot>,
}

impl FdInner {
    fn slot_mut(&mut self, event: Event) -> &mut Option<EventSlot> {
        match event {
            Event::Read => &mut self.read,
            Event::Write => &mut self.write,
        }
    }
}

/// Per-descriptor registration record; addressed by fd index.
struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: 0,
                read: None,
                write: None,
            }),
        })
    }
}

/// Scheduler + timer manager + epoll reactor.
///
/// Worker threads share one epoll instance, polled from the idle coroutine.
/// A self-pipe breaks them out of the poll when new work or a nearer timer
/// deadline arrives. Shut it down with [`Dispatcher::stop`], which drains the
/// queue first; dropping the last handle also stops it, but abandons any
/// queued work.
pub struct IoManager {
    scheduler: Scheduler,
    timers: TimerManager,
    epfd: RawFd,
    tickle_fds: [RawFd; 2],
    pending_events: AtomicUsize,
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
}

impl IoManager {
    pub fn new(threads: usize, use_caller: bool, name: &str) -> io::Result<Arc<IoManager>> {
        let epfd = sys::epoll_create()?;
        let tickle_fds = match sys::pipe() {
            Ok(fds) => fds,
            Err(err) => {
                sys::close(epfd);
                return Err(err);
            }
        };
        let setup = sys::set_nonblocking(tickle_fds[0]).and_then(|_| {
            sys::epoll_ctl(
                epfd,
                libc::EPOLL_CTL_ADD,
                tickle_fds[0],
                READ | EDGE,
                tickle_fds[0] as u64,
            )
        });
        if let Err(err) = setup {
            sys::close(epfd);
            sys::close(tickle_fds[0]);
            sys::close(tickle_fds[1]);
            return Err(err);
        }

        let io = Arc::new_cyclic(|weak: &Weak<IoManager>| {
            let owner: Weak<dyn Dispatcher> = weak.clone();
            let wake = weak.clone();
            IoManager {
                scheduler: Scheduler::with_owner(threads, use_caller, name, owner),
                timers: TimerManager::with_notify(Box::new(move || {
                    // A timer moved to the front of the set; break a worker
                    // out of epoll_wait so it recomputes its timeout.
                    if let Some(io) = wake.upgrade() {
                        io.tickle();
                    }
                })),
                epfd,
                tickle_fds,
                pending_events: AtomicUsize::new(0),
                fd_contexts: RwLock::new(Vec::new()),
            }
        });
        io.resize_contexts(INITIAL_CONTEXTS);
        io.start();
        Ok(io)
    }

    /// The IoManager the calling thread works for, if any.
    pub fn get_this() -> Option<Arc<IoManager>> {
        let dispatcher = Scheduler::get_this()?;
        let any: Arc<dyn Any + Send + Sync> = dispatcher;
        any.downcast::<IoManager>().ok()
    }

    /// Registers interest in `event` on `fd`, capturing the calling
    /// coroutine. When the event fires (or is cancelled) the coroutine is
    /// rescheduled; the usual pattern is to yield right after this returns.
    ///
    /// Fails if the event is already armed or epoll rejects the fd.
    pub fn add_event(&self, fd: RawFd, event: Event) -> io::Result<()> {
        let coro = Coroutine::current();
        assert_eq!(
            coro.state(),
            State::Running,
            "add_event must be called from a running coroutine"
        );
        self.add_event_inner(fd, event, Waiter::Coroutine(coro))
    }

    /// Like [`add_event`](IoManager::add_event), but fires `f` instead of
    /// rescheduling the caller.
    pub fn add_event_with<F>(&self, fd: RawFd, event: Event, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_event_inner(fd, event, Waiter::Func(Box::new(f)))
    }

    fn add_event_inner(&self, fd: RawFd, event: Event, waiter: Waiter) -> io::Result<()> {
        let ctx = self.context_for(fd);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events & event.mask() != 0 {
            warn!("fd {} already armed for {:?}", fd, event);
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "event already armed for this fd",
            ));
        }

        let op = if inner.events != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        let armed = EDGE | inner.events | event.mask();
        if let Err(err) = sys::epoll_ctl(self.epfd, op, fd, armed, fd as u64) {
            error!("add_event: epoll_ctl failed for fd {}: {}", fd, err);
            return Err(err);
        }

        self.pending_events.fetch_add(1, Ordering::SeqCst);
        inner.events |= event.mask();

        let slot = inner.slot_mut(event);
        debug_assert!(slot.is_none());
        let scheduler = Scheduler::current_weak().unwrap_or_else(|| self.scheduler.owner_weak());
        *slot = Some(EventSlot { scheduler, waiter });
        Ok(())
    }

    /// Disarms `event` on `fd` without firing its pending callback.
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.mask() == 0 {
            return false;
        }

        let left = inner.events & !event.mask();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if let Err(err) = sys::epoll_ctl(self.epfd, op, fd, EDGE | left, fd as u64) {
            error!("del_event: epoll_ctl failed for fd {}: {}", fd, err);
            return false;
        }

        self.pending_events.fetch_sub(1, Ordering::SeqCst);
        inner.events = left;
        *inner.slot_mut(event) = None;
        true
    }

    /// Disarms `event` on `fd` and fires its pending callback exactly once.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events & event.mask() == 0 {
            return false;
        }

        let left = inner.events & !event.mask();
        let op = if left != 0 {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_DEL
        };
        if let Err(err) = sys::epoll_ctl(self.epfd, op, fd, EDGE | left, fd as u64) {
            error!("cancel_event: epoll_ctl failed for fd {}: {}", fd, err);
            return false;
        }

        self.trigger_event(&mut inner, event);
        true
    }

    /// Deletes the whole registration for `fd`, firing both armed slots.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events == 0 {
            return false;
        }

        if let Err(err) = sys::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, 0, fd as u64) {
            error!("cancel_all: epoll_ctl failed for fd {}: {}", fd, err);
            return false;
        }

        if inner.events & READ != 0 {
            self.trigger_event(&mut inner, Event::Read);
        }
        if inner.events & WRITE != 0 {
            self.trigger_event(&mut inner, Event::Write);
        }
        debug_assert_eq!(inner.events, 0);
        true
    }

    /// Armed `(fd, event)` pairs not yet fired.
    pub fn pending_events(&self) -> usize {
        self.pending_events.load(Ordering::SeqCst)
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// See [`TimerManager::add_timer`].
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(ms, f, recurring)
    }

    /// See [`TimerManager::add_condition_timer`].
    pub fn add_condition_timer<F, T>(&self, ms: u64, f: F, cond: &Arc<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(ms, f, cond, recurring)
    }

    pub fn has_timer(&self) -> bool {
        self.timers.has_timer()
    }

    /// Clears the slot, schedules its payload on the slot's scheduler and
    /// drops the pending count. The fd lock is held by the caller.
    fn trigger_event(&self, inner: &mut FdInner, event: Event) {
        debug_assert!(inner.events & event.mask() != 0);
        inner.events &= !event.mask();
        let slot = inner.slot_mut(event).take();
        self.pending_events.fetch_sub(1, Ordering::SeqCst);

        let slot = match slot {
            Some(slot) => slot,
            None => return,
        };
        let scheduler = match slot.scheduler.upgrade() {
            Some(scheduler) => scheduler,
            None => {
                warn!("dropping a wakeup whose scheduler is gone");
                return;
            }
        };
        match slot.waiter {
            Waiter::Coroutine(coro) => scheduler.schedule_task(Task::from(coro)),
            Waiter::Func(f) => scheduler.schedule_task(Task::from_boxed(f)),
        }
    }

    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        self.fd_contexts.read().unwrap().get(fd as usize).cloned()
    }

    /// Fetches the context for `fd`, growing the table to fd * 1.5 if it is
    /// too small.
    fn context_for(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let table = self.fd_contexts.read().unwrap();
            if let Some(ctx) = table.get(idx) {
                return ctx.clone();
            }
        }
        let mut table = self.fd_contexts.write().unwrap();
        grow_contexts(&mut table, cmp::max(idx + 1, idx + idx / 2));
        table[idx].clone()
    }

    fn resize_contexts(&self, size: usize) {
        let mut table = self.fd_contexts.write().unwrap();
        grow_contexts(&mut table, size);
    }
}

fn grow_contexts(table: &mut Vec<Arc<FdContext>>, size: usize) {
    for fd in table.len()..size {
        table.push(FdContext::new(fd as RawFd));
    }
}

impl Dispatcher for IoManager {
    fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    fn tickle(&self) {
        if !self.scheduler.has_idle_threads() {
            return;
        }
        if let Err(err) = sys::write_byte(self.tickle_fds[1], b'T') {
            warn!("tickle write failed: {}", err);
        }
    }

    fn stopping(&self) -> bool {
        self.timers.next_timer() == NO_TIMER
            && self.pending_events.load(Ordering::SeqCst) == 0
            && self.scheduler.base_stopping()
    }

    /// One reactor pass: wait for readiness or the next deadline, then turn
    /// expirations and fd events back into scheduler tasks. The idle
    /// coroutine yields to the worker loop after every pass.
    fn idle(&self) {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let ready = loop {
            let timeout = cmp::min(self.timers.next_timer(), MAX_TIMEOUT_MS) as libc::c_int;
            match sys::epoll_wait(self.epfd, &mut events, timeout) {
                Ok(n) => break n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("epoll_wait failed: {}", err);
                    break 0;
                }
            }
        };

        let mut expired: Vec<TimerCallback> = Vec::new();
        self.timers.list_expired(&mut expired);
        for f in expired {
            self.schedule_task(Task::new(move || f()));
        }

        for ev in events.iter().take(ready) {
            let ev = *ev;
            let fd = ev.u64 as RawFd;

            if fd == self.tickle_fds[0] {
                sys::drain(self.tickle_fds[0]);
                continue;
            }

            let ctx = match self.lookup(fd) {
                Some(ctx) => ctx,
                None => continue,
            };
            let mut inner = ctx.inner.lock().unwrap();

            let mut revents = ev.events;
            // An error or hangup wakes whatever is armed, both ways.
            if revents & ERR_HUP != 0 {
                revents |= (READ | WRITE) & inner.events;
            }
            let mut real = 0;
            if revents & READ != 0 {
                real |= READ;
            }
            if revents & WRITE != 0 {
                real |= WRITE;
            }
            if inner.events & real == 0 {
                continue;
            }

            let left = inner.events & !real;
            let op = if left != 0 {
                libc::EPOLL_CTL_MOD
            } else {
                libc::EPOLL_CTL_DEL
            };
            if let Err(err) = sys::epoll_ctl(self.epfd, op, ctx.fd, EDGE | left, ev.u64) {
                error!("idle: epoll_ctl failed for fd {}: {}", ctx.fd, err);
                continue;
            }

            if real & READ != 0 {
                self.trigger_event(&mut inner, Event::Read);
            }
            if real & WRITE != 0 {
                self.trigger_event(&mut inner, Event::Write);
            }
        }
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Stop the scheduler, close the polling endpoint and pipe, drop the
        // fd contexts. Workers hold this manager only weakly, so this can run
        // on whichever thread releases the last handle, a worker included;
        // the remaining workers fail their next upgrade and get joined here
        // (the current thread excepted), before their fds go away.
        let undrained = self.scheduler.prepare_teardown();
        if undrained > 0 {
            warn!(
                "io manager {}: dropped with {} queued tasks undrained; stop() first to run them",
                self.scheduler.name(),
                undrained
            );
        }
        self.scheduler.join_workers();

        sys::close(self.epfd);
        sys::close(self.tickle_fds[0]);
        sys::close(self.tickle_fds[1]);
        self.fd_contexts.write().unwrap().clear();
    }
}
