// Copyright 2020 Joyent, Inc.

use std::sync::mpsc::Sender;

use crate::endpoint::{Endpoint, Snapshot};

/// Messages a resolver sends to the connection registry as the topology of
/// the services it watches changes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DiscoveryMsg {
    /// A new instance of a service was discovered.
    AddedMsg(Endpoint),
    /// An instance of a service went away.
    RemovedMsg(Endpoint),
    /// Sent periodically so the resolver can notice a closed channel.
    HeartbeatMsg,
    /// Stops the registry's discovery loop.
    StopMsg,
}

/// Registry resolver
///
/// A `Resolver` is the registry's view of a service discovery system. It
/// provides the initial snapshot consumed by `ConnectionRegistry::initialize`
/// and then pushes topology changes over the channel passed to `run`. A
/// well-behaved resolver returns from `run` once a send on the channel fails.
pub trait Resolver: Send + 'static {
    /// All endpoints currently known, grouped by service.
    fn snapshot(&mut self) -> Snapshot;
    /// Watch for changes and report them on `s`.
    fn run(&mut self, s: Sender<DiscoveryMsg>);
}
