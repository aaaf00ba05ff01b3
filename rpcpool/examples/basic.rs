// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::io::Error as IOError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use slog::{info, o, Drain, Logger};

use rpcpool::connection::{Connection, Transport};
use rpcpool::endpoint::{Endpoint, Snapshot};
use rpcpool::error::Error;
use rpcpool::registry::types::RegistryOptions;
use rpcpool::registry::ConnectionRegistry;
use rpcpool::resolver::{DiscoveryMsg, Resolver};

const REPORT_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct DummyConnection {
    endpoint: Endpoint,
    connected: AtomicBool,
}

impl Connection for DummyConnection {
    type Error = Error;

    fn close(&self) -> Result<(), Error> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

pub struct DummyTransport;

impl Transport for DummyTransport {
    type Connection = DummyConnection;
    type Error = IOError;

    fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<DummyConnection, IOError> {
        Ok(DummyConnection {
            endpoint: endpoint.clone(),
            connected: AtomicBool::new(true),
        })
    }
}

pub struct FakeResolver {
    endpoints: Vec<Endpoint>,
    running: bool,
}

impl FakeResolver {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        FakeResolver {
            endpoints,
            running: false,
        }
    }
}

impl Resolver for FakeResolver {
    fn snapshot(&mut self) -> Snapshot {
        let mut snapshot: Snapshot = HashMap::new();
        self.endpoints.iter().for_each(|e| {
            snapshot
                .entry(e.service().clone())
                .or_insert_with(Vec::new)
                .push(e.clone())
        });
        snapshot
    }

    fn run(&mut self, s: Sender<DiscoveryMsg>) {
        if self.running {
            return;
        }
        self.running = true;

        // A fourth instance shows up after startup. Reports that arrive
        // before the initial bootstrap completes are ignored by the
        // registry, so everything is reported again on each interval.
        let late = Endpoint::new("Hello", "127.0.0.1", 55558);
        'report: loop {
            for e in self.endpoints.iter().chain(Some(&late)) {
                if s.send(DiscoveryMsg::AddedMsg(e.clone())).is_err() {
                    break 'report;
                }
            }
            thread::sleep(REPORT_INTERVAL);
        }
        self.running = false;
    }
}

fn main() {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    let log = Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    );

    info!(log, "running basic rpcpool example");

    let resolver = FakeResolver::new(vec![
        Endpoint::new("Hello", "127.0.0.1", 55555),
        Endpoint::new("Hello", "127.0.0.1", 55556),
        Endpoint::new("Hello", "127.0.0.1", 55557),
    ]);

    let registry_opts = RegistryOptions {
        connect_timeout_ms: Some(1000),
        log: Some(log.clone()),
        ..Default::default()
    };

    let registry =
        match ConnectionRegistry::start(registry_opts, DummyTransport, resolver)
        {
            Ok(registry) => registry,
            Err(e) => {
                info!(log, "failed to start registry: {}", e);
                return;
            }
        };

    // Callers may ask for a connection right away; they wait until the
    // bootstrap workers have registered one
    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..3)
        .map(|i| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let log = log.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..4 {
                    match registry.acquire_connection("Hello") {
                        Ok(conn) => {
                            info!(log, "caller {} using {}", i, conn.endpoint)
                        }
                        Err(e) => info!(log, "caller {} failed: {}", i, e),
                    }
                }
            })
        })
        .collect();

    barrier.wait();
    for worker in workers {
        let _ = worker.join();
    }

    // A service nobody serves times out after connect_timeout_ms
    if let Err(e) = registry.acquire_connection("World") {
        info!(log, "{}", e);
    }

    if let Some(stats) = registry.stats("Hello") {
        info!(
            log,
            "Hello: {} active, {} inactive",
            stats.active_connections,
            stats.inactive_connections
        );
    }

    registry.shutdown();
    info!(log, "registry {}", registry.state());
}
