// Copyright 2020 Joyent, Inc.

use std::error;
use std::time::Duration;

use crate::endpoint::Endpoint;

/// Registry connection
///
/// The `Connection` trait defines the interface that must be implemented by a
/// live transport handle in order to be held by the connection registry. The
/// registry never looks inside a connection; it only selects it, hands out
/// shared references to it, and closes it. Because a single connection is
/// shared by every caller that selects it, `close` takes `&self` and
/// implementations are expected to use interior mutability.
pub trait Connection: Send + Sync + 'static {
    /// The error type returned by the `close` function. Each implementation
    /// may choose the concrete error type that is relevant to it, provided it
    /// implements the standard library
    /// [Error](https://doc.rust-lang.org/std/error/trait.Error.html) trait.
    type Error: error::Error;
    /// Close the connection to the endpoint. Closing a connection that is
    /// already closed must succeed and have no further effect.
    fn close(&self) -> Result<(), Self::Error>;
}

/// Registry transport
///
/// A `Transport` knows how to open a connection to an `Endpoint`. The
/// registry invokes `connect` from its bootstrap worker threads, never from a
/// caller of `acquire_connection`, so a blocking implementation is expected.
pub trait Transport: Send + Sync + 'static {
    type Connection: Connection;
    type Error: error::Error;
    /// Attempt to establish a connection to `endpoint`, giving up after
    /// `timeout` has elapsed.
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Self::Connection, Self::Error>;
    /// Release any shared resources held by the transport, such as an event
    /// loop. Called once by the registry during shutdown. Must be idempotent.
    fn shutdown(&self) {}
}
