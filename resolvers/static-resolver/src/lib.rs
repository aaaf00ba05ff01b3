// Copyright 2020 Joyent, Inc.

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use rpcpool::endpoint::{Endpoint, EndpointPort, ServiceName, Snapshot};
use rpcpool::resolver::{DiscoveryMsg, Resolver};

// Default interval between reports of the snapshot
const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// A resolver for a fixed set of endpoints. The snapshot never changes; `run`
/// reports every endpoint again on each interval until the registry stops
/// listening. The registry skips endpoints that are active or connecting, so
/// the repeats only reconnect an endpoint whose last connect failed or whose
/// connection was demoted.
pub struct StaticResolver {
    snapshot: Snapshot,
    interval: Duration,
    running: bool,
}

impl StaticResolver {
    pub fn new(snapshot: Snapshot) -> Self {
        StaticResolver {
            snapshot,
            interval: DEFAULT_REPORT_INTERVAL,
            running: false,
        }
    }

    /// Set the time between reports. The default is 5 seconds.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Build a resolver for a single service from `(host, port)` pairs.
    pub fn from_addresses<S, H>(
        service: S,
        addresses: Vec<(H, EndpointPort)>,
    ) -> Self
    where
        S: Into<ServiceName>,
        H: Into<String>,
    {
        let service = service.into();
        let endpoints = addresses
            .into_iter()
            .map(|(host, port)| Endpoint::new(service.clone(), host, port))
            .collect();
        let mut snapshot = HashMap::new();
        snapshot.insert(service, endpoints);
        StaticResolver::new(snapshot)
    }
}

impl Resolver for StaticResolver {
    fn snapshot(&mut self) -> Snapshot {
        self.snapshot.clone()
    }

    fn run(&mut self, s: Sender<DiscoveryMsg>) {
        if self.running {
            return;
        }
        self.running = true;

        'report: loop {
            for endpoint in self.snapshot.values().flatten() {
                if s.send(DiscoveryMsg::AddedMsg(endpoint.clone())).is_err() {
                    break 'report;
                }
            }
            thread::sleep(self.interval);
        }

        self.running = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc::channel;

    fn resolver() -> StaticResolver {
        StaticResolver::from_addresses(
            "Hello",
            vec![("127.0.0.1", 55555), ("127.0.0.1", 55556)],
        )
        .with_interval(Duration::from_millis(10))
    }

    #[test]
    fn static_resolver_snapshot() {
        let mut resolver = resolver();
        let snapshot = resolver.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("Hello").map(Vec::len), Some(2));
        // The snapshot is not consumed
        assert_eq!(resolver.snapshot(), snapshot);
    }

    #[test]
    fn static_resolver_reports_until_channel_closes() {
        let (tx, rx) = channel();
        let runner = thread::spawn(move || {
            let mut resolver = resolver();
            resolver.run(tx);
        });

        let expected = vec![
            DiscoveryMsg::AddedMsg(Endpoint::new("Hello", "127.0.0.1", 55555)),
            DiscoveryMsg::AddedMsg(Endpoint::new("Hello", "127.0.0.1", 55556)),
        ];
        for _ in 0..3 {
            let round: Vec<DiscoveryMsg> = (0..2)
                .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
                .collect();
            assert_eq!(round, expected);
        }

        // Returns once its sends start failing
        drop(rx);
        runner.join().unwrap();
    }
}
