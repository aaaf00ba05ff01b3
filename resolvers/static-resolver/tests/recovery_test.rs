// Copyright 2020 Joyent, Inc.

use std::collections::HashSet;
use std::io::{Error as IOError, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use slog::{o, Drain, Logger};

use rpcpool::connection::{Connection, Transport};
use rpcpool::endpoint::Endpoint;
use rpcpool::registry::types::{ConnectionCount, RegistryOptions};
use rpcpool::registry::ConnectionRegistry;
use rpcpool_static_resolver::StaticResolver;

#[derive(Debug)]
pub struct DummyConnection {
    endpoint: Endpoint,
    closed: AtomicBool,
}

impl Connection for DummyConnection {
    type Error = IOError;

    fn close(&self) -> Result<(), IOError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// Refuses the first attempt for each endpoint in `flaky`.
#[derive(Clone, Default)]
pub struct FlakyTransport {
    flaky: Arc<Mutex<HashSet<Endpoint>>>,
    attempts: Arc<Mutex<Vec<Endpoint>>>,
}

impl FlakyTransport {
    fn attempts_for(&self, endpoint: &Endpoint) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|e| *e == endpoint)
            .count()
    }
}

impl Transport for FlakyTransport {
    type Connection = DummyConnection;
    type Error = IOError;

    fn connect(
        &self,
        endpoint: &Endpoint,
        _timeout: Duration,
    ) -> Result<DummyConnection, IOError> {
        self.attempts.lock().unwrap().push(endpoint.clone());
        if self.flaky.lock().unwrap().remove(endpoint) {
            return Err(IOError::new(
                ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        Ok(DummyConnection {
            endpoint: endpoint.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
        o!("build-id" => "0.1.0"),
    )
}

#[test]
fn static_resolver_reconnects_failed_initial_endpoint() {
    let a = Endpoint::new("Hello", "127.0.0.1", 55555);
    let b = Endpoint::new("Hello", "127.0.0.1", 55556);

    let transport = FlakyTransport::default();
    transport.flaky.lock().unwrap().insert(a.clone());

    let resolver = StaticResolver::from_addresses(
        "Hello",
        vec![("127.0.0.1", 55555), ("127.0.0.1", 55556)],
    )
    .with_interval(Duration::from_millis(50));

    let options = RegistryOptions {
        connect_timeout_ms: Some(1000),
        log: Some(test_log()),
        ..Default::default()
    };
    let registry =
        ConnectionRegistry::start(options, transport.clone(), resolver)
            .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let active = registry
            .stats("Hello")
            .map_or(false, |stats| {
                stats.active_connections == ConnectionCount::from(2)
            });
        if active {
            break;
        }
        assert!(Instant::now() < deadline, "endpoint was never reconnected");
        thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(transport.attempts_for(&a), 2);
    // Repeated reports leave connected endpoints alone
    thread::sleep(Duration::from_millis(200));
    assert_eq!(transport.attempts_for(&a), 2);
    assert_eq!(transport.attempts_for(&b), 1);

    let conns: Vec<Arc<DummyConnection>> = (0..2)
        .map(|_| registry.acquire_connection("Hello").unwrap())
        .collect();
    registry.shutdown();
    conns
        .iter()
        .for_each(|conn| assert!(conn.closed.load(Ordering::SeqCst)));
    assert!(conns.iter().any(|conn| conn.endpoint == a));
}
