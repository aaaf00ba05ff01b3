// Copyright 2020 Joyent, Inc.

//! Client-side connection registry for a multi-service RPC framework
//!
//! `rpcpool` keeps persistent transport connections to every known instance
//! of every service a process calls, and hands the invocation layer a live
//! connection for a service on demand. It relies on three traits supplied by
//! its users: [`Transport`](connection/trait.Transport.html),
//! [`Connection`](connection/trait.Connection.html), and
//! [`Resolver`](resolver/trait.Resolver.html).
//!
//! ## Transports and connections
//!
//! A *transport* opens a connection to an
//! [`Endpoint`](endpoint/struct.Endpoint.html), the identity of one instance of
//! a service (service name, host, port). The registry never calls `connect`
//! on the caller's thread: connect attempts run on a bounded pool of
//! bootstrap worker threads. A failed attempt is logged and dropped; the
//! registry does not retry on its own. Submitting an attempt while the
//! bootstrap queue is full fails immediately with
//! [`Error::TaskRejected`](error/enum.Error.html).
//!
//! A *connection* is shared: every caller that selects it gets an `Arc` to
//! the same handle, and the registry's only use for it is closing it.
//!
//! ## Resolvers
//!
//! A *resolver* is a service discovery client. It provides the snapshot the
//! registry is initialized from, and then reports endpoints as they come and
//! go. Discovered endpoints are ignored until every endpoint of the initial
//! snapshot has had a first connect attempt, so discovery cannot race the
//! initial bootstrap into connecting to the same endpoint twice.
//!
//! ## Selection and waiting
//!
//! Each service has an *active* pool, selected from round-robin, and an
//! *inactive* pool holding connections a health check has demoted. A caller
//! asking for a service with an empty active pool blocks on the service's
//! gate until a connection is registered, the connect timeout (6 seconds by
//! default) elapses, or the registry is shut down.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Mutex;
//!
//! use slog::{o, Drain, Logger};
//!
//! use rpcpool::registry::types::RegistryOptions;
//! use rpcpool::registry::ConnectionRegistry;
//! use rpcpool_static_resolver::StaticResolver;
//! use rpcpool_tcp_connection::{TcpTransport, TcpTransportOptions};
//!
//! let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
//! let log = Logger::root(
//!     Mutex::new(slog_term::FullFormat::new(plain).build()).fuse(),
//!     o!("build-id" => "0.1.0"),
//! );
//!
//! let resolver = StaticResolver::from_addresses(
//!     "Hello",
//!     vec![("127.0.0.1", 55555), ("127.0.0.1", 55556)],
//! );
//! let transport = TcpTransport::new(TcpTransportOptions::default())?;
//!
//! let options = RegistryOptions {
//!     connect_timeout_ms: Some(1000),
//!     log: Some(log),
//!     ..Default::default()
//! };
//!
//! let registry = ConnectionRegistry::start(options, transport, resolver)?;
//! let conn = registry.acquire_connection("Hello")?;
//! conn.send(b"ping")?;
//! registry.shutdown();
//! ```

pub mod barrier;
pub mod bootstrap;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod registry;
pub mod resolver;
pub mod selector;
