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

//! Deadline-sorted timers over the wall clock, with rollover detection.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

/// `next_timer()` result when the set is empty.
pub const NO_TIMER: u64 = u64::MAX;

/// A wall-clock step this far backward flushes every pending timer.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Timer callbacks may fire more than once (recurring timers), so they are
/// shared `Fn`s rather than one-shot closures.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync + 'static>;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

static TIMER_SEQ: AtomicU64 = AtomicU64::new(0);

struct TimerState {
    period_ms: u64,
    deadline_ms: u64,
    /// Cleared on cancel and after a one-shot fires.
    callback: Option<TimerCallback>,
}

struct TimerInner {
    /// Insertion sequence; breaks ties between equal deadlines.
    seq: u64,
    recurring: bool,
    state: Mutex<TimerState>,
    manager: Weak<TimerShared>,
}

/// Handle to a timer living in a [`TimerManager`].
#[derive(Clone)]
pub struct Timer {
    inner: Arc<TimerInner>,
}

impl Timer {
    /// Removes the timer. Returns false if it was already cancelled or has
    /// already fired for the last time.
    pub fn cancel(&self) -> bool {
        let shared = match self.inner.manager.upgrade() {
            Some(shared) => shared,
            None => return false,
        };
        let mut set = shared.set.write().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if state.callback.is_none() {
            return false;
        }
        state.callback = None;
        set.timers.remove(&(state.deadline_ms, self.inner.seq));
        true
    }

    /// Re-arms the timer a full period from now.
    pub fn refresh(&self) -> bool {
        let shared = match self.inner.manager.upgrade() {
            Some(shared) => shared,
            None => return false,
        };
        let mut set = shared.set.write().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if state.callback.is_none() {
            return false;
        }
        let inner = match set.timers.remove(&(state.deadline_ms, self.inner.seq)) {
            Some(inner) => inner,
            None => return false,
        };
        state.deadline_ms = now_ms() + state.period_ms;
        set.timers.insert((state.deadline_ms, self.inner.seq), inner);
        true
    }

    /// Changes the period. With `from_now` the new deadline counts from the
    /// current time, otherwise from the timer's original base.
    pub fn reset(&self, ms: u64, from_now: bool) -> bool {
        let shared = match self.inner.manager.upgrade() {
            Some(shared) => shared,
            None => return false,
        };
        let inner = {
            let mut set = shared.set.write().unwrap();
            let mut state = self.inner.state.lock().unwrap();
            if ms == state.period_ms && !from_now {
                return true;
            }
            if state.callback.is_none() {
                return false;
            }
            let inner = match set.timers.remove(&(state.deadline_ms, self.inner.seq)) {
                Some(inner) => inner,
                None => return false,
            };
            let base = if from_now {
                now_ms()
            } else {
                state.deadline_ms - state.period_ms
            };
            state.period_ms = ms;
            state.deadline_ms = base + ms;
            inner
        };
        // Re-inserting may move the head of the set; goes through the same
        // notification path as a fresh timer.
        shared.insert(inner);
        true
    }
}

struct TimerSet {
    timers: BTreeMap<(u64, u64), Arc<TimerInner>>,
    /// `now` recorded by the previous expiry sweep.
    previous_ms: u64,
}

struct TimerShared {
    set: RwLock<TimerSet>,
    /// Coalesces front-insert notifications until the next `next_timer`.
    tickled: AtomicBool,
    notify: Box<dyn Fn() + Send + Sync>,
}

impl TimerShared {
    fn insert(&self, inner: Arc<TimerInner>) {
        let at_front = {
            let mut set = self.set.write().unwrap();
            let key = (inner.state.lock().unwrap().deadline_ms, inner.seq);
            set.timers.insert(key, inner);
            if set.timers.keys().next() == Some(&key) {
                !self.tickled.swap(true, Ordering::SeqCst)
            } else {
                false
            }
        };
        if at_front {
            (self.notify)();
        }
    }

    fn next_timer(&self) -> u64 {
        self.tickled.store(false, Ordering::SeqCst);
        let set = self.set.read().unwrap();
        match set.timers.keys().next() {
            Some(&(deadline_ms, _)) => deadline_ms.saturating_sub(now_ms()),
            None => NO_TIMER,
        }
    }

    fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = now_ms();
        let mut set = self.set.write().unwrap();
        let rollover = now < set.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        set.previous_ms = now;

        loop {
            let key = match set.timers.keys().next() {
                Some(&key) if rollover || key.0 <= now => key,
                _ => break,
            };
            let inner = set.timers.remove(&key).unwrap();
            let mut state = inner.state.lock().unwrap();
            if let Some(callback) = state.callback.clone() {
                out.push(callback);
            }
            if inner.recurring {
                state.deadline_ms = now + state.period_ms;
                let key = (state.deadline_ms, inner.seq);
                drop(state);
                set.timers.insert(key, inner);
            } else {
                state.callback = None;
            }
        }
    }
}

/// Owns the deadline-sorted timer set.
pub struct TimerManager {
    shared: Arc<TimerShared>,
}

impl TimerManager {
    pub fn new() -> TimerManager {
        TimerManager::with_notify(Box::new(|| {}))
    }

    /// `notify` runs (outside the set lock) whenever an insertion lands at
    /// the front of the set, at most once until the next `next_timer` call.
    pub(crate) fn with_notify(notify: Box<dyn Fn() + Send + Sync>) -> TimerManager {
        TimerManager {
            shared: Arc::new(TimerShared {
                set: RwLock::new(TimerSet {
                    timers: BTreeMap::new(),
                    previous_ms: now_ms(),
                }),
                tickled: AtomicBool::new(false),
                notify,
            }),
        }
    }

    /// Arms a timer `ms` milliseconds from now.
    pub fn add_timer<F>(&self, ms: u64, f: F, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.add_timer_callback(ms, Arc::new(f), recurring)
    }

    fn add_timer_callback(&self, ms: u64, callback: TimerCallback, recurring: bool) -> Timer {
        let inner = Arc::new(TimerInner {
            seq: TIMER_SEQ.fetch_add(1, Ordering::Relaxed),
            recurring,
            state: Mutex::new(TimerState {
                period_ms: ms,
                deadline_ms: now_ms() + ms,
                callback: Some(callback),
            }),
            manager: Arc::downgrade(&self.shared),
        });
        self.shared.insert(inner.clone());
        Timer { inner }
    }

    /// Arms a timer whose callback only runs while `cond` is still alive
    /// somewhere else; dropping the last strong reference to `cond` is a
    /// passive cancellation.
    pub fn add_condition_timer<F, T>(&self, ms: u64, f: F, cond: &Arc<T>, recurring: bool) -> Timer
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        let cond = Arc::downgrade(cond);
        self.add_timer(
            ms,
            move || {
                if cond.upgrade().is_some() {
                    f();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the next deadline: 0 if it has already passed,
    /// [`NO_TIMER`] if the set is empty.
    pub fn next_timer(&self) -> u64 {
        self.shared.next_timer()
    }

    /// Drains every expired timer (or, after a clock rollover, every timer)
    /// into `out` in deadline order. Recurring timers are re-armed a period
    /// from now.
    pub fn list_expired(&self, out: &mut Vec<TimerCallback>) {
        self.shared.list_expired(out)
    }

    pub fn has_timer(&self) -> bool {
        !self.shared.set.read().unwrap().timers.is_empty()
    }
}

impl Default for TimerManager {
    fn default() -> TimerManager {
        TimerManager::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_next_timer_boundaries() {
        let mgr = TimerManager::new();
        assert_eq!(mgr.next_timer(), NO_TIMER);

        let t = mgr.add_timer(0, || {}, false);
        assert_eq!(mgr.next_timer(), 0);
        t.cancel();

        mgr.add_timer(60_000, || {}, false);
        let next = mgr.next_timer();
        assert!(next > 59_000 && next <= 60_000, "next = {}", next);
    }

    #[test]
    fn test_cancelled_timer_never_fires() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let t = mgr.add_timer(
            0,
            {
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            },
            false,
        );
        assert!(t.cancel());
        assert!(!t.cancel(), "double cancel must report false");

        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert!(out.is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_expiry_preserves_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for label in [3u64, 1, 2] {
            let order = order.clone();
            // 0ms deadlines plus distinct ones; all already expired.
            mgr.add_timer(label, move || order.lock().unwrap().push(label), false);
        }
        std::thread::sleep(std::time::Duration::from_millis(10));

        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert_eq!(out.len(), 3);
        for f in &out {
            f();
        }
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_recurring_timer_rearms() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(0, || {}, true);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert_eq!(out.len(), 1);
        assert!(mgr.has_timer(), "recurring timer must be re-inserted");

        assert!(t.cancel());
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_reset_and_refresh() {
        let mgr = TimerManager::new();
        let t = mgr.add_timer(50, || {}, false);
        assert!(t.reset(10_000, true));
        let next = mgr.next_timer();
        assert!(next > 9_000, "next = {}", next);

        assert!(t.refresh());

        assert!(t.cancel());
        assert!(!t.reset(1, true));
        assert!(!t.refresh());
    }

    #[test]
    fn test_condition_timer_skips_dead_cond() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let cond = Arc::new(());
        mgr.add_condition_timer(
            0,
            {
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            },
            &cond,
            false,
        );
        drop(cond);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        for f in out {
            f();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rollover_flushes_everything() {
        let mgr = TimerManager::new();
        mgr.add_timer(3_600_000, || {}, false);
        assert!(mgr.has_timer());

        // Pretend the previous sweep happened far in the future; the next
        // sweep then sees the clock stepping backward past the window.
        mgr.shared.set.write().unwrap().previous_ms = now_ms() + 2 * ROLLOVER_WINDOW_MS;

        let mut out = Vec::new();
        mgr.list_expired(&mut out);
        assert_eq!(out.len(), 1, "rollover must drain unexpired timers too");
        assert!(!mgr.has_timer());
    }

    #[test]
    fn test_front_insert_notification_coalesces() {
        let notified = Arc::new(AtomicUsize::new(0));
        let mgr = {
            let notified = notified.clone();
            TimerManager::with_notify(Box::new(move || {
                notified.fetch_add(1, Ordering::SeqCst);
            }))
        };

        mgr.add_timer(1_000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // A later deadline does not move the front.
        mgr.add_timer(5_000, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // An earlier one does, but the flag is still set.
        mgr.add_timer(500, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 1);

        // next_timer clears the coalescing flag.
        let _ = mgr.next_timer();
        mgr.add_timer(100, || {}, false);
        assert_eq!(notified.load(Ordering::SeqCst), 2);
    }
}
