// Copyright 2020 Joyent, Inc.

//! Per-service blocking primitive used by callers waiting for a connection.
//!
//! A `Gate` pairs a mutex with a condition variable. The mutex guards only a
//! signal counter, never pool contents: code that mutates a pool does so under
//! the pool's own lock and calls `signal` afterward. A waiter reads the
//! counter with `generation` *before* inspecting the pool and then passes that
//! value to `wait_for_connection`, so a signal delivered between the pool
//! check and the wait is never lost.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use derive_more::{Display, From, Into};

/// The number of signals delivered through a gate so far.
#[derive(
    Clone, Copy, Debug, Default, Display, Eq, From, Into, PartialEq,
)]
pub struct Generation(u64);

#[derive(Debug, Default)]
pub struct Gate {
    signals: Mutex<Generation>,
    condvar: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Gate {
            signals: Mutex::new(Generation::default()),
            condvar: Condvar::new(),
        }
    }

    fn signals_lock(&self) -> MutexGuard<Generation> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current signal count.
    pub fn generation(&self) -> Generation {
        *self.signals_lock()
    }

    /// Block the calling thread until the gate has been signaled since
    /// `observed` was read, or until `timeout` elapses. Returns `true` if a
    /// signal arrived. Spurious condvar wakeups are absorbed here; the caller
    /// is still responsible for re-checking whatever state it is waiting on.
    pub fn wait_for_connection(
        &self,
        observed: Generation,
        timeout: Duration,
    ) -> bool {
        let guard = self.signals_lock();
        let (_guard, wait_result) = self
            .condvar
            .wait_timeout_while(guard, timeout, |current| *current == observed)
            .unwrap_or_else(PoisonError::into_inner);
        !wait_result.timed_out()
    }

    /// Wake every thread waiting on this gate.
    pub fn signal(&self) {
        let mut signals = self.signals_lock();
        *signals = Generation(signals.0.wrapping_add(1));
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn gate_wait_times_out_without_signal() {
        let gate = Gate::new();
        let observed = gate.generation();
        let start = Instant::now();
        assert!(!gate.wait_for_connection(observed, Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn gate_signal_before_wait_is_not_lost() {
        let gate = Gate::new();
        let observed = gate.generation();
        gate.signal();
        let start = Instant::now();
        assert!(gate.wait_for_connection(observed, Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn gate_signal_wakes_all_waiters() {
        let gate = Arc::new(Gate::new());
        let observed = gate.generation();
        let barrier = Arc::new(Barrier::new(4));

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    gate.wait_for_connection(observed, Duration::from_secs(5))
                })
            })
            .collect();

        barrier.wait();
        gate.signal();

        for waiter in waiters {
            assert!(waiter.join().unwrap());
        }
        assert_eq!(gate.generation(), Generation::from(1));
    }
}
