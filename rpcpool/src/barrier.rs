// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::endpoint::Endpoint;

#[derive(Debug, Default)]
struct BarrierState {
    armed: bool,
    pending: HashSet<Endpoint>,
}

/// One-shot countdown over the endpoints known when the registry is
/// initialized.
///
/// The barrier starts closed. `arm` records the initial endpoint set; each
/// endpoint releases its slot the first time it `arrive`s, whether its connect
/// attempt succeeded or not. Later arrivals of the same endpoint, and arrivals
/// of endpoints outside the initial set, have no effect. Once every slot is
/// released the barrier is drained for good.
#[derive(Debug, Default)]
pub struct InitBarrier {
    state: Mutex<BarrierState>,
    drained: AtomicBool,
}

impl InitBarrier {
    pub fn new() -> Self {
        InitBarrier {
            state: Mutex::new(BarrierState::default()),
            drained: AtomicBool::new(false),
        }
    }

    fn state_lock(&self) -> MutexGuard<BarrierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the countdown over `endpoints`. An empty set drains the barrier
    /// immediately. Arming an already armed barrier does nothing.
    pub fn arm<I>(&self, endpoints: I)
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let mut state = self.state_lock();
        if state.armed {
            return;
        }
        state.armed = true;
        state.pending = endpoints.into_iter().collect();
        if state.pending.is_empty() {
            self.drained.store(true, Ordering::SeqCst);
        }
    }

    /// Release the slot held by `endpoint`. Returns `true` only for the
    /// arrival that drains the barrier.
    pub fn arrive(&self, endpoint: &Endpoint) -> bool {
        if self.is_drained() {
            return false;
        }
        let mut state = self.state_lock();
        if !state.pending.remove(endpoint) {
            return false;
        }
        if state.pending.is_empty() {
            self.drained.store(true, Ordering::SeqCst);
            return true;
        }
        false
    }

    pub fn is_drained(&self) -> bool {
        self.drained.load(Ordering::SeqCst)
    }

    /// The number of initial endpoints that have not yet arrived.
    pub fn remaining(&self) -> usize {
        self.state_lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("Hello", "127.0.0.1", 55555),
            Endpoint::new("Hello", "127.0.0.1", 55556),
            Endpoint::new("World", "127.0.0.1", 55557),
        ]
    }

    #[test]
    fn barrier_closed_until_armed() {
        let barrier = InitBarrier::new();
        assert!(!barrier.is_drained());
        assert!(!barrier.arrive(&endpoints()[0]));
        assert!(!barrier.is_drained());
    }

    #[test]
    fn barrier_empty_set_drains_immediately() {
        let barrier = InitBarrier::new();
        barrier.arm(vec![]);
        assert!(barrier.is_drained());
        assert_eq!(barrier.remaining(), 0);
    }

    #[test]
    fn barrier_drains_once_every_endpoint_arrives() {
        let barrier = InitBarrier::new();
        let eps = endpoints();
        barrier.arm(eps.clone());
        assert_eq!(barrier.remaining(), 3);

        assert!(!barrier.arrive(&eps[0]));
        assert!(!barrier.arrive(&eps[1]));
        assert!(!barrier.is_drained());
        assert!(barrier.arrive(&eps[2]));
        assert!(barrier.is_drained());

        // Drained stays drained
        assert!(!barrier.arrive(&eps[2]));
        assert!(barrier.is_drained());
    }

    #[test]
    fn barrier_ignores_duplicate_and_unknown_arrivals() {
        let barrier = InitBarrier::new();
        let eps = endpoints();
        barrier.arm(eps.clone());

        // The same endpoint registering twice only releases one slot
        barrier.arrive(&eps[0]);
        barrier.arrive(&eps[0]);
        barrier.arrive(&Endpoint::new("Other", "127.0.0.1", 1));
        assert_eq!(barrier.remaining(), 2);
        assert!(!barrier.is_drained());
    }
}
