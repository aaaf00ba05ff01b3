// Copyright 2020 Joyent, Inc.

pub mod types;

use std::collections::HashSet;
use std::fmt::Result as FmtResult;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use slog::{debug, error, info, o, trace, warn, Drain, Logger};

use crate::barrier::InitBarrier;
use crate::bootstrap::{
    AsyncBootstrap, DEFAULT_BOOTSTRAP_QUEUE_CAPACITY,
    DEFAULT_BOOTSTRAP_WORKERS,
};
use crate::connection::{Connection, Transport};
use crate::endpoint::{Endpoint, ServiceName, Snapshot};
use crate::error::Error;
use crate::registry::types::{
    DiscoveryHandles, RegistryOptions, RegistryState, ServiceState,
    ServiceStats, ShutdownFlag,
};
use crate::resolver::{DiscoveryMsg, Resolver};

// Connect and acquisition timeout in milliseconds
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 6000;

type Conn<T> = <T as Transport>::Connection;

struct RegistryInner<T>
where
    T: Transport,
{
    services: DashMap<ServiceName, Arc<ServiceState<Conn<T>>>>,
    barrier: InitBarrier,
    bootstrap: AsyncBootstrap,
    transport: T,
    connect_timeout: Duration,
    initialized: AtomicBool,
    shutdown: ShutdownFlag,
    discovery: Mutex<DiscoveryHandles>,
    log: Logger,
}

/// Persistent connections to every known instance of every service the
/// process talks to.
///
/// A registry is created once at process start and shared by cloning; every
/// clone is a handle to the same pools. Connections are opened by a bounded
/// pool of bootstrap workers and become selectable as soon as they are
/// registered. `acquire_connection` hands out an active connection in
/// round-robin order, blocking for up to the connect timeout when a service
/// has none.
///
/// Dropping the last handle shuts the registry down. A registry running
/// discovery holds a handle of its own, so `shutdown` must be called
/// explicitly in that case.
pub struct ConnectionRegistry<T>
where
    T: Transport,
{
    inner: Arc<RegistryInner<T>>,
}

impl<T> Clone for ConnectionRegistry<T>
where
    T: Transport,
{
    fn clone(&self) -> ConnectionRegistry<T> {
        ConnectionRegistry {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Debug for ConnectionRegistry<T>
where
    T: Transport,
{
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        f.debug_struct("ConnectionRegistry")
            .field("services", &self.inner.services.len())
            .field("connect_timeout", &self.inner.connect_timeout)
            .field("bootstrapped", &self.inner.barrier.is_drained())
            .field("state", &self.state())
            .finish()
    }
}

impl<T> ConnectionRegistry<T>
where
    T: Transport,
{
    pub fn new(options: RegistryOptions, transport: T) -> Result<Self, Error> {
        let log = options
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));

        let connect_timeout = Duration::from_millis(
            options
                .connect_timeout_ms
                .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        );

        let bootstrap = AsyncBootstrap::new(
            options.bootstrap_workers.unwrap_or(DEFAULT_BOOTSTRAP_WORKERS),
            options
                .bootstrap_queue_capacity
                .unwrap_or(DEFAULT_BOOTSTRAP_QUEUE_CAPACITY),
            log.new(o!("component" => "bootstrap")),
        )?;

        Ok(ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                services: DashMap::new(),
                barrier: InitBarrier::new(),
                bootstrap,
                transport,
                connect_timeout,
                initialized: AtomicBool::new(false),
                shutdown: ShutdownFlag::default(),
                discovery: Mutex::new(DiscoveryHandles::default()),
                log,
            }),
        })
    }

    /// Create a registry, initialize it from the resolver's snapshot, and
    /// start feeding it the resolver's topology changes.
    pub fn start<R>(
        options: RegistryOptions,
        transport: T,
        mut resolver: R,
    ) -> Result<Self, Error>
    where
        R: Resolver,
    {
        let registry = Self::new(options, transport)?;
        registry.initialize(resolver.snapshot())?;
        registry.start_discovery(resolver)?;
        Ok(registry)
    }

    /// Seed a gate and an empty pool for every service in `snapshot` and
    /// queue one connect attempt per endpoint. Discovered endpoints are
    /// ignored until every endpoint in the snapshot has had its first
    /// attempt.
    ///
    /// Never blocks on connect attempts. If some attempts cannot be queued
    /// the rest are still queued and the first rejection is returned.
    pub fn initialize(&self, snapshot: Snapshot) -> Result<(), Error> {
        if self.inner.shutdown.is_set() {
            return Err(Error::RegistryShutdown);
        }
        if self.inner.initialized.swap(true, AtomicOrdering::SeqCst) {
            return Err(Error::AlreadyInitialized);
        }

        let service_count = snapshot.len();
        let mut seen = HashSet::new();
        let mut initial = Vec::new();
        for (service, endpoints) in snapshot {
            let state = self.service_state(service.as_str());
            for endpoint in endpoints {
                if seen.insert(endpoint.clone()) {
                    initial.push((state.clone(), service.clone(), endpoint));
                }
            }
        }

        self.inner
            .barrier
            .arm(initial.iter().map(|(_, _, endpoint)| endpoint.clone()));

        info!(
            self.inner.log,
            "initializing connection registry with {} services and {} \
             endpoints",
            service_count,
            initial.len()
        );

        let mut result = Ok(());
        for (state, service, endpoint) in initial {
            state.pool_lock().connecting.insert(endpoint.clone());
            if let Err(e) = self.submit_connect(&state, service, endpoint.clone())
            {
                // A rejected endpoint has had its attempt
                self.barrier_arrive(&endpoint);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Return an active connection for `service`, selected round-robin.
    ///
    /// If the service has no active connection the caller blocks until one
    /// is registered. Fails with `ServiceUnavailable` once the connect
    /// timeout has elapsed or as soon as the registry is shut down.
    ///
    /// An unknown service name gets a gate of its own so the caller can be
    /// woken by the service's first registration. Service state is never
    /// removed, so every distinct name asked for stays in `services` for
    /// the life of the registry.
    pub fn acquire_connection(
        &self,
        service: &str,
    ) -> Result<Arc<Conn<T>>, Error> {
        let state = self.service_state(service);
        let deadline = Instant::now() + self.inner.connect_timeout;

        loop {
            // Read the generation first so a registration that lands after
            // the pool check still wakes the wait below
            let observed = state.gate.generation();

            if self.inner.shutdown.is_set() {
                return Err(Error::ServiceUnavailable(String::from(service)));
            }

            if let Some(conn) = state.select() {
                return Ok(conn);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    self.inner.log,
                    "timed out waiting for a connection to service {}", service
                );
                return Err(Error::ServiceUnavailable(String::from(service)));
            }

            trace!(
                self.inner.log,
                "no active connection for service {}, waiting", service
            );
            state.gate.wait_for_connection(observed, deadline - now);
        }
    }

    /// Non-blocking variant of `acquire_connection`.
    pub fn try_acquire_connection(
        &self,
        service: &str,
    ) -> Option<Arc<Conn<T>>> {
        if self.inner.shutdown.is_set() {
            return None;
        }
        self.existing_state(service).and_then(|state| state.select())
    }

    /// Make `connection` selectable for `service` under `endpoint` and wake
    /// every caller waiting on the service. Used to hand the registry a
    /// connection opened elsewhere and to promote an endpoint previously
    /// passed to `demote`.
    ///
    /// A connection registered after shutdown is closed instead.
    pub fn register_connection(
        &self,
        service: &str,
        endpoint: Endpoint,
        connection: Arc<Conn<T>>,
    ) {
        self.insert_connection(service, endpoint, connection, false);
    }

    // With `require_pending` set the connection is only registered if the
    // endpoint is still marked as connecting. A deregistration clears the
    // mark, so a connect that completes afterward is closed instead.
    fn insert_connection(
        &self,
        service: &str,
        endpoint: Endpoint,
        connection: Arc<Conn<T>>,
        require_pending: bool,
    ) {
        let log = &self.inner.log;

        if self.inner.shutdown.is_set() {
            debug!(
                log,
                "registry stopped, not registering endpoint {}", endpoint
            );
            close_connection(log, &endpoint, &connection);
            return;
        }

        let state = self.service_state(service);
        let displaced: Option<Vec<Arc<Conn<T>>>> = {
            let mut pool = state.pool_lock();
            if !pool.connecting.remove(&endpoint) && require_pending {
                None
            } else {
                let previous_inactive = pool.inactive.remove(&endpoint);
                let previous_active = pool
                    .active
                    .insert(endpoint.clone(), Arc::clone(&connection));
                Some(
                    previous_active
                        .into_iter()
                        .chain(previous_inactive)
                        .filter(|previous| !Arc::ptr_eq(previous, &connection))
                        .collect(),
                )
            }
        };

        let displaced = match displaced {
            Some(displaced) => displaced,
            None => {
                info!(
                    log,
                    "endpoint {} removed while connecting, discarding \
                     connection",
                    endpoint
                );
                close_connection(log, &endpoint, &connection);
                self.barrier_arrive(&endpoint);
                return;
            }
        };

        for previous in displaced.iter() {
            debug!(log, "replacing connection for endpoint {}", endpoint);
            close_connection(log, &endpoint, previous);
        }

        info!(log, "registered connection for endpoint {}", endpoint);

        self.barrier_arrive(&endpoint);
        state.gate.signal();

        // Shutdown may have drained the pools while this connection was being
        // inserted
        if self.inner.shutdown.is_set() {
            let stranded = state.pool_lock().active.remove(&endpoint);
            if let Some(conn) = stranded {
                close_connection(log, &endpoint, &conn);
            }
        }
    }

    /// Close and forget the connection held for `endpoint`, whether it is
    /// active or inactive. A connect still in flight for the endpoint is
    /// discarded when it completes. Does nothing for an unknown endpoint.
    pub fn deregister_endpoint(&self, service: &str, endpoint: &Endpoint) {
        let state = match self.existing_state(service) {
            Some(state) => state,
            None => {
                debug!(
                    self.inner.log,
                    "deregister for unknown service {}", service
                );
                return;
            }
        };

        let (removed, cancelled): (Vec<Arc<Conn<T>>>, bool) = {
            let mut pool = state.pool_lock();
            let removed = pool
                .active
                .remove(endpoint)
                .into_iter()
                .chain(pool.inactive.remove(endpoint))
                .collect();
            (removed, pool.connecting.remove(endpoint))
        };

        if cancelled {
            info!(
                self.inner.log,
                "endpoint {} removed while connecting", endpoint
            );
        }

        if removed.is_empty() {
            debug!(
                self.inner.log,
                "endpoint {} not registered, nothing to remove", endpoint
            );
            return;
        }

        info!(self.inner.log, "deregistering endpoint {}", endpoint);
        for conn in removed.iter() {
            close_connection(&self.inner.log, endpoint, conn);
        }
    }

    /// Move the connection for `endpoint` out of rotation without closing
    /// it. `register_connection` puts it back.
    pub fn demote(&self, service: &str, endpoint: &Endpoint) {
        let demoted = self.existing_state(service).map_or(false, |state| {
            let mut pool = state.pool_lock();
            match pool.active.remove(endpoint) {
                Some(conn) => {
                    pool.inactive.insert(endpoint.clone(), conn);
                    true
                }
                None => false,
            }
        });

        if demoted {
            warn!(self.inner.log, "demoted endpoint {}", endpoint);
        } else {
            debug!(
                self.inner.log,
                "endpoint {} not active, nothing to demote", endpoint
            );
        }
    }

    /// Queue a connect attempt for an endpoint reported by service
    /// discovery.
    ///
    /// Ignored while the initial bootstrap is still in flight, and for
    /// endpoints that are already active or already connecting.
    pub fn add_discovered_endpoint(
        &self,
        service: &str,
        endpoint: Endpoint,
    ) -> Result<(), Error> {
        if self.inner.shutdown.is_set() {
            return Err(Error::RegistryShutdown);
        }

        if !self.inner.barrier.is_drained() {
            debug!(
                self.inner.log,
                "initial bootstrap in progress, ignoring discovered \
                 endpoint {}",
                endpoint
            );
            return Ok(());
        }

        let state = self.service_state(service);
        {
            let mut pool = state.pool_lock();
            if pool.active.contains_key(&endpoint)
                || pool.connecting.contains(&endpoint)
            {
                trace!(
                    self.inner.log,
                    "endpoint {} already known, skipping", endpoint
                );
                return Ok(());
            }
            pool.connecting.insert(endpoint.clone());
        }

        info!(self.inner.log, "adding discovered endpoint {}", endpoint);
        self.submit_connect(&state, ServiceName::from(service), endpoint)
    }

    /// Run `resolver` on its own thread and apply the changes it reports:
    /// added endpoints go through `add_discovered_endpoint` and removed ones
    /// through `deregister_endpoint`. Stopped by `shutdown`.
    pub fn start_discovery<R>(&self, mut resolver: R) -> Result<(), Error>
    where
        R: Resolver,
    {
        let mut handles = self.inner.discovery_lock();

        // Checked under the lock so a concurrent shutdown cannot miss the
        // threads started here
        if self.inner.shutdown.is_set() {
            return Err(Error::RegistryShutdown);
        }
        if handles.resolver_rx_thread.is_some() {
            warn!(self.inner.log, "discovery already running");
            return Ok(());
        }

        // The registry keeps the resolver_tx side of the channel so that it
        // can stop the receiving thread on shutdown.
        let (resolver_tx, resolver_rx) = channel();

        let resolver_tx_clone = resolver_tx.clone();
        let resolver_thread = thread::Builder::new()
            .name(String::from("resolver"))
            .spawn(move || resolver.run(resolver_tx_clone))?;

        let registry = self.clone();
        let resolver_log = self.inner.log.new(o!("component" => "discovery"));
        let resolver_rx_thread = thread::Builder::new()
            .name(String::from("resolver-recv"))
            .spawn(move || {
                discovery_recv_loop(resolver_rx, registry, resolver_log)
            })?;

        handles.resolver_thread = Some(resolver_thread);
        handles.resolver_rx_thread = Some(resolver_rx_thread);
        handles.resolver_tx = Some(resolver_tx);
        Ok(())
    }

    /// Stop the registry: fail every waiting and future acquisition, close
    /// every connection, and stop the bootstrap workers, the discovery
    /// threads, and the transport. Calling this more than once is harmless.
    pub fn shutdown(&self) {
        self.inner.teardown();
    }

    pub fn state(&self) -> RegistryState {
        if self.inner.shutdown.is_set() {
            RegistryState::Stopped
        } else {
            RegistryState::Running
        }
    }

    /// Whether every endpoint of the initial snapshot has had its first
    /// connect attempt, which is when discovered endpoints start being
    /// honored.
    pub fn is_bootstrapped(&self) -> bool {
        self.inner.barrier.is_drained()
    }

    /// Connection counts for `service`, or `None` if the service has never
    /// been seen.
    pub fn stats(&self, service: &str) -> Option<ServiceStats> {
        self.existing_state(service).map(|state| {
            let pool = state.pool_lock();
            pool.stats()
        })
    }

    /// Every service the registry knows about.
    pub fn services(&self) -> Vec<ServiceName> {
        self.inner
            .services
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn existing_state(
        &self,
        service: &str,
    ) -> Option<Arc<ServiceState<Conn<T>>>> {
        self.inner
            .services
            .get(service)
            .map(|entry| Arc::clone(entry.value()))
    }

    // Get or create the state for `service`. The entry API makes creation
    // atomic, so concurrent first sightings share one gate.
    fn service_state(&self, service: &str) -> Arc<ServiceState<Conn<T>>> {
        if let Some(state) = self.existing_state(service) {
            return state;
        }
        let log = &self.inner.log;
        let entry = self
            .inner
            .services
            .entry(ServiceName::from(service))
            .or_insert_with(|| {
                debug!(log, "creating gate for service {}", service);
                Arc::new(ServiceState::new())
            });
        Arc::clone(entry.value())
    }

    fn barrier_arrive(&self, endpoint: &Endpoint) {
        if self.inner.barrier.arrive(endpoint) {
            info!(
                self.inner.log,
                "initial bootstrap complete, accepting discovered endpoints"
            );
        }
    }

    // The caller has already marked `endpoint` as connecting.
    fn submit_connect(
        &self,
        state: &Arc<ServiceState<Conn<T>>>,
        service: ServiceName,
        endpoint: Endpoint,
    ) -> Result<(), Error> {
        let registry = self.clone();
        let task_endpoint = endpoint.clone();
        let submitted = self.inner.bootstrap.submit(Box::new(move || {
            registry.connect_endpoint(service, task_endpoint)
        }));

        submitted.map_err(|reason| {
            state.pool_lock().connecting.remove(&endpoint);
            error!(
                self.inner.log,
                "unable to queue connect for endpoint {}: {}", endpoint, reason
            );
            Error::TaskRejected(endpoint, reason)
        })
    }

    // Runs on a bootstrap worker. A failed attempt is logged and dropped;
    // recovering the endpoint is up to discovery.
    fn connect_endpoint(&self, service: ServiceName, endpoint: Endpoint) {
        let log = &self.inner.log;
        if self.inner.shutdown.is_set() {
            return;
        }

        debug!(log, "connecting to endpoint {}", endpoint);
        match self
            .inner
            .transport
            .connect(&endpoint, self.inner.connect_timeout)
        {
            Ok(conn) => {
                self.insert_connection(
                    service.as_str(),
                    endpoint,
                    Arc::new(conn),
                    true,
                );
            }
            Err(e) => {
                error!(
                    log,
                    "failed to connect to endpoint {}: {}", endpoint, e
                );
                if let Some(state) = self.existing_state(service.as_str()) {
                    state.pool_lock().connecting.remove(&endpoint);
                }
                self.barrier_arrive(&endpoint);
            }
        }
    }
}

impl<T> RegistryInner<T>
where
    T: Transport,
{
    fn discovery_lock(&self) -> MutexGuard<DiscoveryHandles> {
        self.discovery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self) {
        if self.shutdown.set() {
            trace!(self.log, "shutdown called on stopped registry");
            return;
        }

        info!(self.log, "shutting down connection registry");

        self.stop_discovery();

        let states: Vec<(ServiceName, Arc<ServiceState<Conn<T>>>)> = self
            .services
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (service, state) in states.iter() {
            let closing: Vec<(Endpoint, Arc<Conn<T>>)> = {
                let mut guard = state.pool_lock();
                let pool = &mut *guard;
                pool.connecting.clear();
                pool.active.drain().chain(pool.inactive.drain()).collect()
            };
            info!(
                self.log,
                "closing {} connections for service {}",
                closing.len(),
                service
            );
            for (endpoint, conn) in closing.iter() {
                close_connection(&self.log, endpoint, conn);
            }
        }

        // Waiters observe the flag on wake and fail
        for (_, state) in states.iter() {
            state.gate.signal();
        }

        self.bootstrap.shutdown();
        self.transport.shutdown();

        info!(self.log, "connection registry stopped");
    }

    fn stop_discovery(&self) {
        let (resolver_tx, resolver_rx_thread, resolver_thread) = {
            let mut handles = self.discovery_lock();
            (
                handles.resolver_tx.take(),
                handles.resolver_rx_thread.take(),
                handles.resolver_thread.take(),
            )
        };

        if let Some(resolver_tx) = resolver_tx {
            if let Err(e) = resolver_tx.send(DiscoveryMsg::StopMsg) {
                warn!(
                    self.log,
                    "Failed to send stop message to resolver receiver \
                     thread: {}",
                    e
                );
            }
        }

        if let Some(resolver_rx_thread) = resolver_rx_thread {
            if resolver_rx_thread.thread().id() != thread::current().id() {
                let _ = resolver_rx_thread.join();
            }
        }

        // The resolver is not ours to join. It exits once its sends start
        // failing.
        drop(resolver_thread);
        trace!(self.log, "stop: discovery threads stopped");
    }
}

impl<T> Drop for RegistryInner<T>
where
    T: Transport,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

fn close_connection<C>(log: &Logger, endpoint: &Endpoint, conn: &Arc<C>)
where
    C: Connection,
{
    info!(log, "closing connection for endpoint {}", endpoint);
    if let Err(err) = conn.close() {
        warn!(
            log,
            "Failed to properly close connection for endpoint {}. Reason: {}",
            endpoint,
            err
        );
    }
}

fn discovery_recv_loop<T>(
    rx: Receiver<DiscoveryMsg>,
    registry: ConnectionRegistry<T>,
    log: Logger,
) where
    T: Transport,
{
    loop {
        match rx.recv() {
            Ok(DiscoveryMsg::AddedMsg(endpoint)) => {
                let service = endpoint.service().clone();
                if let Err(e) =
                    registry.add_discovered_endpoint(service.as_str(), endpoint)
                {
                    warn!(log, "Failed to add discovered endpoint: {}", e);
                }
            }
            Ok(DiscoveryMsg::RemovedMsg(endpoint)) => {
                let service = endpoint.service().clone();
                registry.deregister_endpoint(service.as_str(), &endpoint);
            }
            Ok(DiscoveryMsg::HeartbeatMsg) => {
                trace!(log, "resolver heartbeat");
            }
            Ok(DiscoveryMsg::StopMsg) | Err(_) => break,
        }
    }
    trace!(log, "discovery_recv_loop exiting");
}
