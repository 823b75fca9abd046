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

//! A thread pool pulling coroutines and closures from a shared FIFO queue.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::builder::Builder;
use crate::coroutine::{self, Coroutine, Handle, State};
use crate::options::Options;
use crate::thread::{self, Thread};

/// How long the default idle hook naps between queue checks.
const IDLE_SLEEP_MS: u64 = 10;

thread_local! {
    static SCHEDULER: RefCell<Option<Weak<dyn Dispatcher>>> = RefCell::new(None);
}

enum TaskPayload {
    Coroutine(Handle),
    Func(Box<dyn FnOnce() + Send + 'static>),
}

/// A unit of work for the scheduler: a coroutine to resume or a closure to
/// wrap in a fresh coroutine, optionally pinned to one worker thread.
pub struct Task {
    payload: TaskPayload,
    thread: Option<libc::pid_t>,
}

impl Task {
    pub fn new<F>(f: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            payload: TaskPayload::Func(Box::new(f)),
            thread: None,
        }
    }

    pub(crate) fn from_boxed(f: Box<dyn FnOnce() + Send + 'static>) -> Task {
        Task {
            payload: TaskPayload::Func(f),
            thread: None,
        }
    }

    /// Pin the task to the worker with the given OS thread id.
    pub fn with_thread(mut self, tid: libc::pid_t) -> Task {
        self.thread = Some(tid);
        self
    }
}

impl From<Handle> for Task {
    fn from(coro: Handle) -> Task {
        Task {
            payload: TaskPayload::Coroutine(coro),
            thread: None,
        }
    }
}

/// The overridable scheduler surface.
///
/// `Scheduler` itself implements this with the defaults below; `IoManager`
/// overrides `tickle`, `idle` and `stopping` to hang a reactor off the same
/// worker loop.
pub trait Dispatcher: Any + Send + Sync {
    fn scheduler(&self) -> &Scheduler;

    /// Wakes an idle worker. The base scheduler has nothing to wake through;
    /// its idle hook polls.
    fn tickle(&self) {}

    /// One pass of the idle hook, run inside the per-thread idle coroutine
    /// whenever a worker finds no task. Each pass should block until work
    /// may be available; the idle coroutine yields between passes and exits
    /// once `stopping()`. The base scheduler just naps; the reactor polls
    /// epoll here.
    fn idle(&self) {
        std::thread::sleep(Duration::from_millis(IDLE_SLEEP_MS));
    }

    /// Whether the worker loops may exit.
    fn stopping(&self) -> bool {
        self.scheduler().base_stopping()
    }

    /// Submits a task, waking a worker iff the queue was empty.
    fn schedule_task(&self, task: Task) {
        if self.scheduler().enqueue(task) {
            self.tickle();
        }
    }

    /// Submits a coroutine handle or a `Task`.
    fn schedule<T: Into<Task>>(&self, task: T)
    where
        Self: Sized,
    {
        self.schedule_task(task.into());
    }

    /// Spawns the worker threads. Called once, by the owner.
    fn start(&self) {
        self.scheduler().do_start();
    }

    /// Stops the pool: drains the queue, runs the caller-thread scheduler
    /// coroutine if there is one, and joins every worker.
    fn stop(&self) {
        self.scheduler().do_stop();
    }
}

/// Thread pool plus FIFO task queue with per-task thread affinity.
pub struct Scheduler {
    name: String,
    tasks: Mutex<VecDeque<Task>>,
    threads: Mutex<Vec<Thread>>,
    thread_ids: Mutex<Vec<libc::pid_t>>,
    /// Workers to spawn in `start`, after the caller consumed its share.
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    stopping: AtomicBool,
    /// Tid of the caller thread when `use_caller`, -1 otherwise.
    root_tid: libc::pid_t,
    /// The caller thread's worker-loop coroutine when `use_caller`.
    sched_coroutine: Mutex<Option<Handle>>,
    /// Non-owning back-reference to the concrete dispatcher this scheduler
    /// serves (itself, or the IoManager embedding it).
    owner: Weak<dyn Dispatcher>,
}

impl Dispatcher for Scheduler {
    fn scheduler(&self) -> &Scheduler {
        self
    }
}

impl Scheduler {
    /// Creates a standalone scheduler.
    ///
    /// `threads` is the total worker count; with `use_caller` the
    /// constructing thread serves as one of them and drains the queue inside
    /// `stop()`.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        Arc::new_cyclic(|weak: &Weak<Scheduler>| {
            let owner: Weak<dyn Dispatcher> = weak.clone();
            Scheduler::with_owner(threads, use_caller, name, owner)
        })
    }

    pub(crate) fn with_owner(
        threads: usize,
        use_caller: bool,
        name: &str,
        owner: Weak<dyn Dispatcher>,
    ) -> Scheduler {
        assert!(threads >= 1, "a scheduler needs at least one thread");
        assert!(
            Scheduler::get_this().is_none(),
            "this thread already runs a scheduler"
        );
        set_this(owner.clone());
        thread::set_current_name(name);

        let mut thread_count = threads;
        let mut root_tid = -1;
        let mut thread_ids = Vec::new();
        let mut sched_coroutine = None;

        if use_caller {
            thread_count -= 1;
            let _ = Coroutine::current();

            let loop_owner = owner.clone();
            let coro = Builder::new()
                .run_in_scheduler(false)
                .spawn(move || run_worker(loop_owner));
            coroutine::set_scheduler_target(coro.clone());
            sched_coroutine = Some(coro);

            root_tid = thread::current_tid();
            thread_ids.push(root_tid);
        }

        Scheduler {
            name: name.to_string(),
            tasks: Mutex::new(VecDeque::new()),
            threads: Mutex::new(Vec::new()),
            thread_ids: Mutex::new(thread_ids),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stopping: AtomicBool::new(false),
            root_tid,
            sched_coroutine: Mutex::new(sched_coroutine),
            owner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// OS thread ids of every worker, the caller thread included when
    /// `use_caller`. Complete once `start` has returned.
    pub fn thread_ids(&self) -> Vec<libc::pid_t> {
        self.thread_ids.lock().unwrap().clone()
    }

    /// The dispatcher the calling thread is working for, if any.
    pub fn get_this() -> Option<Arc<dyn Dispatcher>> {
        SCHEDULER.with(|s| s.borrow().as_ref().and_then(|weak| weak.upgrade()))
    }

    pub(crate) fn current_weak() -> Option<Weak<dyn Dispatcher>> {
        SCHEDULER.with(|s| s.borrow().clone())
    }

    pub(crate) fn owner_weak(&self) -> Weak<dyn Dispatcher> {
        self.owner.clone()
    }

    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }

    /// Pushes a task; true means the queue was empty and a tickle is due.
    pub(crate) fn enqueue(&self, task: Task) -> bool {
        if self.stopping.load(Ordering::SeqCst) {
            warn!("scheduler {}: task submitted after stop, dropping it", self.name);
            return false;
        }
        let mut tasks = self.tasks.lock().unwrap();
        let was_empty = tasks.is_empty();
        tasks.push_back(task);
        was_empty
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
            && self.tasks.lock().unwrap().is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn do_start(&self) {
        if self.stopping.load(Ordering::SeqCst) {
            error!("scheduler {} is stopped", self.name);
            return;
        }

        let mut threads = self.threads.lock().unwrap();
        assert!(threads.is_empty(), "scheduler started twice");
        let mut ids = self.thread_ids.lock().unwrap();
        for i in 0..self.thread_count {
            // Workers hold the dispatcher weakly and re-take it every loop
            // iteration, so the last strong handle is always a caller's and
            // dropping it reaches the teardown in Drop.
            let dispatcher = self.owner.clone();
            let t = Thread::spawn(
                move || run_worker(dispatcher),
                &format!("{}_{}", self.name, i),
            )
            .unwrap_or_else(|err| panic!("failed to spawn worker thread: {}", err));
            ids.push(t.tid());
            threads.push(t);
        }
    }

    pub(crate) fn do_stop(&self) {
        let owner = match self.owner.upgrade() {
            Some(owner) => owner,
            None => return,
        };
        if owner.stopping() {
            return;
        }
        self.stopping.store(true, Ordering::SeqCst);

        for _ in 0..self.thread_count {
            owner.tickle();
        }

        let sched_coroutine = self.sched_coroutine.lock().unwrap().take();
        if sched_coroutine.is_some() {
            owner.tickle();
        }
        if let Some(coro) = sched_coroutine {
            // The caller thread becomes a worker until the queue drains.
            if let Err(err) = coro.resume() {
                error!("scheduler coroutine would not run: {}", err);
            }
            // The worker loop is gone; coroutines on this thread pair with
            // the main coroutine again.
            coroutine::reset_scheduler_target();
        }

        self.join_workers();
        info!("scheduler {} stopped", self.name);
    }

    /// Flags the pool for teardown without draining. Returns the number of
    /// queued tasks that will never run.
    pub(crate) fn prepare_teardown(&self) -> usize {
        self.stopping.store(true, Ordering::SeqCst);
        self.tasks.lock().unwrap().len()
    }

    /// Joins every worker except the calling thread. Teardown may run on a
    /// worker itself when it releases the last strong handle; that worker is
    /// left to detach and exits right after.
    pub(crate) fn join_workers(&self) {
        let tid = thread::current_tid();
        let threads = mem::take(&mut *self.threads.lock().unwrap());
        for mut t in threads {
            if t.tid() == tid {
                continue;
            }
            t.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Reached without an explicit stop when the last strong handle goes
        // away; workers notice on their next upgrade and exit, so they can
        // be joined here. An IoManager runs this sequence itself before its
        // fds close, which leaves nothing for the nested drop to do.
        if !self.stopping.load(Ordering::SeqCst) {
            warn!("scheduler {} dropped without stop; tearing it down now", self.name);
        }
        let undrained = self.prepare_teardown();
        if undrained > 0 {
            warn!(
                "scheduler {}: {} queued tasks dropped at teardown",
                self.name, undrained
            );
        }
        self.join_workers();

        SCHEDULER.with(|s| {
            let ours = match &*s.borrow() {
                Some(weak) => {
                    weak.as_ptr() as *const () == self.owner.as_ptr() as *const ()
                }
                None => false,
            };
            if ours {
                *s.borrow_mut() = None;
            }
        });
    }
}

fn set_this(owner: Weak<dyn Dispatcher>) {
    SCHEDULER.with(|s| *s.borrow_mut() = Some(owner));
}

/// The worker loop. Runs on each pool thread's native stack, and inside the
/// scheduler coroutine on a use_caller thread.
///
/// The dispatcher is held weakly and re-taken once per iteration: when the
/// last strong handle is released, every worker's next upgrade fails and the
/// loop unwinds, letting `Drop` tear the runtime down.
pub(crate) fn run_worker(this: Weak<dyn Dispatcher>) {
    let tid = thread::current_tid();
    {
        let dispatcher = match this.upgrade() {
            Some(dispatcher) => dispatcher,
            None => return,
        };
        let sched = dispatcher.scheduler();
        debug!("worker {} entering scheduler {}", tid, sched.name);
        set_this(sched.owner.clone());
        if tid != sched.root_tid {
            // A pool thread; give it its main coroutine. The caller thread
            // made one when the scheduler was built.
            let _ = Coroutine::current();
        }
    }

    let idle_coroutine = {
        let idle_this = this.clone();
        Builder::new().spawn(move || {
            // One idle pass per upgrade; the strong handle is given back
            // before yielding so a suspended idle coroutine never pins the
            // dispatcher alive.
            loop {
                let dispatcher = match idle_this.upgrade() {
                    Some(dispatcher) => dispatcher,
                    None => break,
                };
                if dispatcher.stopping() {
                    break;
                }
                dispatcher.idle();
                drop(dispatcher);
                Coroutine::sched();
            }
        })
    };

    loop {
        let dispatcher = match this.upgrade() {
            Some(dispatcher) => dispatcher,
            None => break,
        };
        let sched = dispatcher.scheduler();

        let mut task = None;
        let mut tickle_me = false;
        {
            let mut tasks = sched.tasks.lock().unwrap();
            let mut found = None;
            for (i, t) in tasks.iter().enumerate() {
                match t.thread {
                    // Someone else's task; they need a wakeup.
                    Some(want) if want != tid => tickle_me = true,
                    _ => {
                        found = Some(i);
                        break;
                    }
                }
            }
            if let Some(i) = found {
                task = tasks.remove(i);
                sched.active_threads.fetch_add(1, Ordering::SeqCst);
            }
            if !tasks.is_empty() {
                tickle_me = true;
            }
        }
        if tickle_me {
            dispatcher.tickle();
        }

        match task.map(|t| t.payload) {
            Some(TaskPayload::Coroutine(coro)) => {
                if coro.state() != State::Terminated {
                    if let Err(err) = coro.resume() {
                        debug!("not resuming coroutine {}: {}", coro.id(), err);
                    }
                }
                sched.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            Some(TaskPayload::Func(f)) => {
                let coro = Coroutine::spawn_boxed(f, Options::default());
                if let Err(err) = coro.resume() {
                    debug!("not resuming coroutine {}: {}", coro.id(), err);
                }
                sched.active_threads.fetch_sub(1, Ordering::SeqCst);
            }
            None => {
                if idle_coroutine.state() == State::Terminated {
                    break;
                }
                sched.idle_threads.fetch_add(1, Ordering::SeqCst);
                let _ = idle_coroutine.resume();
                sched.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
        // `dispatcher` drops here; if this worker held the last strong
        // handle, teardown runs now, on this thread, and skips joining it.
    }

    debug!("worker {} leaving", tid);
}
