// Copyright 2020 Joyent, Inc.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use derive_more::{Add, AddAssign, Display, From, Into, Sub, SubAssign};
use slog::Logger;

use crate::endpoint::Endpoint;
use crate::gate::Gate;
use crate::resolver::DiscoveryMsg;
use crate::selector::PollingSelector;

/// The configuration options for a connection registry.
#[derive(Clone, Debug, Default)]
pub struct RegistryOptions {
    /// An optional timeout in milliseconds. It bounds how long
    /// `acquire_connection` waits for a service with no active connection,
    /// and how long each bootstrap connect attempt may take. If not specified
    /// the default is 6000 milliseconds.
    pub connect_timeout_ms: Option<u64>,
    /// An optional number of bootstrap worker threads. If not specified the
    /// default is 16.
    pub bootstrap_workers: Option<usize>,
    /// An optional capacity for the bootstrap task queue. Connect attempts
    /// submitted while the queue is full are rejected. If not specified the
    /// default is 1024.
    pub bootstrap_queue_capacity: Option<usize>,
    /// An optional `slog` logger instance. If none is provided then the logging
    /// will fall back to using the [`slog-stdlog`](https://docs.rs/slog-stdlog)
    /// drain which is essentially the same as using the rust standard
    /// [`log`](https://docs.rs/log) crate.
    pub log: Option<Logger>,
}

/// A newtype wrapper around u32 used for connection counts reported by the
/// registry.
#[derive(
    Add,
    AddAssign,
    Clone,
    Copy,
    Debug,
    Default,
    Display,
    Eq,
    From,
    Into,
    Ord,
    PartialOrd,
    PartialEq,
    Sub,
    SubAssign,
)]
pub struct ConnectionCount(u32);

/// The connection counts for one service.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceStats {
    /// Connections eligible for selection
    pub active_connections: ConnectionCount,
    /// Connections quarantined by a health check
    pub inactive_connections: ConnectionCount,
    /// Endpoints with a connect attempt in flight
    pub pending_connections: ConnectionCount,
}

/// The registry is running until it is shut down. There is no way back.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RegistryState {
    Running,
    Stopped,
}

impl fmt::Display for RegistryState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryState::Running => String::from("running").fmt(fmt),
            RegistryState::Stopped => String::from("stopped").fmt(fmt),
        }
    }
}

// The connections held for one service. An endpoint is a key of at most one
// of `active` and `inactive`.
#[doc(hidden)]
#[derive(Debug)]
pub struct ServicePool<C> {
    pub active: HashMap<Endpoint, Arc<C>>,
    pub inactive: HashMap<Endpoint, Arc<C>>,
    pub connecting: HashSet<Endpoint>,
}

impl<C> ServicePool<C> {
    pub fn new() -> Self {
        ServicePool {
            active: HashMap::new(),
            inactive: HashMap::new(),
            connecting: HashSet::new(),
        }
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            active_connections: count(self.active.len()),
            inactive_connections: count(self.inactive.len()),
            pending_connections: count(self.connecting.len()),
        }
    }
}

impl<C> Default for ServicePool<C> {
    fn default() -> Self {
        Self::new()
    }
}

// Saturates rather than wrapping for pools beyond u32::MAX entries
fn count(len: usize) -> ConnectionCount {
    ConnectionCount::from(u32::try_from(len).unwrap_or(u32::MAX))
}

// Everything the registry keeps per service. Created once, on first sight of
// the service name, and never removed.
#[doc(hidden)]
#[derive(Debug)]
pub struct ServiceState<C> {
    pool: Mutex<ServicePool<C>>,
    pub gate: Gate,
    pub selector: PollingSelector,
}

impl<C> ServiceState<C> {
    pub fn new() -> Self {
        ServiceState {
            pool: Mutex::new(ServicePool::new()),
            gate: Gate::new(),
            selector: PollingSelector::new(),
        }
    }

    pub fn pool_lock(&self) -> MutexGuard<ServicePool<C>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pick the next active connection in round-robin order.
    pub fn select(&self) -> Option<Arc<C>> {
        let pool = self.pool_lock();
        self.selector
            .select(&pool.active)
            .map(|(_, conn)| Arc::clone(conn))
    }
}

impl<C> Default for ServiceState<C> {
    fn default() -> Self {
        Self::new()
    }
}

// Handles for the threads running a resolver on behalf of the registry.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct DiscoveryHandles {
    pub resolver_thread: Option<thread::JoinHandle<()>>,
    pub resolver_rx_thread: Option<thread::JoinHandle<()>>,
    pub resolver_tx: Option<Sender<DiscoveryMsg>>,
}

// Monotone false -> true flag shared by every registry handle.
#[doc(hidden)]
#[derive(Debug, Default)]
pub struct ShutdownFlag(AtomicBool);

impl ShutdownFlag {
    pub fn is_set(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }

    /// Set the flag, returning whether it was already set.
    pub fn set(&self) -> bool {
        self.0.swap(true, AtomicOrdering::SeqCst)
    }
}
