//! Coordination primitives used by the endpoint threads. All of them are
//! plain Mutex/Condvar constructions; none of them are held across I/O.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Counting latch with an upper limit. The acceptor counts up before every
/// accept and blocks while the limit is reached; closing a connection
/// counts back down. `release_all` lets every waiter through so shutdown
/// never deadlocks on a full endpoint.
pub struct LimitLatch {
    inner: Mutex<LimitInner>,
    cond: Condvar,
}

struct LimitInner {
    count: usize,
    limit: usize,
    released: bool,
}

impl LimitLatch {
    pub fn new(limit: usize) -> LimitLatch {
        LimitLatch {
            inner: Mutex::new(LimitInner {
                count: 0,
                limit,
                released: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Acquires one permit, blocking while the latch is at its limit.
    /// Returns false if the latch was released while waiting.
    pub fn count_up_or_await(&self) -> bool {
        let mut inner = self.inner.lock().expect("LimitLatch lock poisoned");

        while inner.count >= inner.limit && !inner.released {
            inner = self.cond.wait(inner).expect("LimitLatch lock poisoned");
        }

        if inner.released {
            return false;
        }

        inner.count += 1;
        true
    }

    /// Returns one permit. Tolerates being called after `release_all`.
    pub fn count_down(&self) -> usize {
        let mut inner = self.inner.lock().expect("LimitLatch lock poisoned");
        inner.count = inner.count.saturating_sub(1);
        self.cond.notify_one();
        inner.count
    }

    /// Lets all waiters through and stops admitting new permits.
    pub fn release_all(&self) {
        let mut inner = self.inner.lock().expect("LimitLatch lock poisoned");
        inner.released = true;
        self.cond.notify_all();
    }

    pub fn current(&self) -> usize {
        self.inner.lock().expect("LimitLatch lock poisoned").count
    }

    pub fn available(&self) -> usize {
        let inner = self.inner.lock().expect("LimitLatch lock poisoned");
        inner.limit.saturating_sub(inner.count)
    }
}

/// One-shot countdown latch. The poller counts it down as its loop exits;
/// `Endpoint::stop` awaits it with an explicit bound.
pub struct CountDownLatch {
    count: Mutex<usize>,
    cond: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> CountDownLatch {
        CountDownLatch {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock().expect("CountDownLatch lock poisoned");
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.cond.notify_all();
            }
        }
    }

    /// Waits for the latch to reach zero. Returns false on timeout.
    pub fn await_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock().expect("CountDownLatch lock poisoned");

        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(count, deadline - now)
                .expect("CountDownLatch lock poisoned");
            count = guard;
        }

        true
    }
}

/// Binary gate. Open lets callers pass immediately; closed parks them.
/// The acceptor waits on this while the endpoint is paused.
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    pub fn new(open: bool) -> Gate {
        Gate {
            open: Mutex::new(open),
            cond: Condvar::new(),
        }
    }

    pub fn close(&self) {
        *self.open.lock().expect("Gate lock poisoned") = false;
    }

    pub fn open(&self) {
        let mut open = self.open.lock().expect("Gate lock poisoned");
        *open = true;
        self.cond.notify_all();
    }

    pub fn is_open(&self) -> bool {
        *self.open.lock().expect("Gate lock poisoned")
    }

    /// Waits until the gate opens or the timeout passes. Returns the gate
    /// state at the time of return.
    pub fn await_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut open = self.open.lock().expect("Gate lock poisoned");

        while !*open {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(open, deadline - now)
                .expect("Gate lock poisoned");
            open = guard;
        }

        true
    }
}

/// Resettable completion flag. A worker that could not obtain a pooled
/// selector parks on this; the poller opens it when readiness arrives.
pub struct Flag {
    set: Mutex<bool>,
    cond: Condvar,
}

impl Flag {
    pub fn new() -> Flag {
        Flag {
            set: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        *self.set.lock().expect("Flag lock poisoned") = false;
    }

    pub fn open(&self) {
        let mut set = self.set.lock().expect("Flag lock poisoned");
        *set = true;
        self.cond.notify_all();
    }

    /// Waits for the flag to be opened. Returns false on timeout.
    pub fn await_open(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut set = self.set.lock().expect("Flag lock poisoned");

        while !*set {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(set, deadline - now)
                .expect("Flag lock poisoned");
            set = guard;
        }

        true
    }
}
