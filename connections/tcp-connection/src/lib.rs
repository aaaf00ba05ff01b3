// Copyright 2020 Joyent, Inc.

use std::io::{Error as IOError, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use slog::{debug, info, o, Drain, Logger};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Handle, Runtime};

use rpcpool::connection::{Connection, Transport};
use rpcpool::endpoint::Endpoint;

// Default number of event loop threads
const DEFAULT_EVENT_LOOP_THREADS: usize = 6;

/// The configuration options for a TCP transport.
#[derive(Clone, Debug, Default)]
pub struct TcpTransportOptions {
    /// An optional number of threads for the event loop that drives every
    /// connection opened by the transport. If not specified the default is 6.
    pub event_loop_threads: Option<usize>,
    /// Whether to disable Nagle's algorithm on new connections. If not
    /// specified the default is true.
    pub nodelay: Option<bool>,
    /// An optional `slog` logger instance. Falls back to the `slog-stdlog`
    /// drain.
    pub log: Option<Logger>,
}

/// Opens TCP connections on a shared multi-threaded event loop.
#[derive(Debug)]
pub struct TcpTransport {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    stopped: AtomicBool,
    nodelay: bool,
    log: Logger,
}

impl TcpTransport {
    pub fn new(opts: TcpTransportOptions) -> Result<Self, IOError> {
        let log = opts
            .log
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let threads = opts
            .event_loop_threads
            .unwrap_or(DEFAULT_EVENT_LOOP_THREADS)
            .max(1);

        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("rpcpool-event-loop")
            .enable_io()
            .enable_time()
            .build()?;

        debug!(log, "started event loop with {} threads", threads);

        Ok(TcpTransport {
            handle: runtime.handle().clone(),
            runtime: Mutex::new(Some(runtime)),
            stopped: AtomicBool::new(false),
            nodelay: opts.nodelay.unwrap_or(true),
            log,
        })
    }

    fn runtime_lock(&self) -> MutexGuard<Option<Runtime>> {
        self.runtime.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for TcpTransport {
    type Connection = TcpConnection;
    type Error = IOError;

    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<TcpConnection, IOError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(IOError::new(ErrorKind::Other, "transport shut down"));
        }

        let addr = endpoint.address();
        let stream = self
            .handle
            .block_on(async {
                tokio::time::timeout(timeout, TcpStream::connect(addr)).await
            })
            .map_err(|_| {
                IOError::new(
                    ErrorKind::TimedOut,
                    format!("connect to {} timed out", endpoint),
                )
            })??;
        stream.set_nodelay(self.nodelay)?;

        info!(self.log, "connected to {}", endpoint);
        Ok(TcpConnection {
            endpoint: endpoint.clone(),
            stream: Mutex::new(Some(stream)),
            handle: self.handle.clone(),
        })
    }

    fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(runtime) = self.runtime_lock().take() {
            runtime.shutdown_background();
            info!(self.log, "event loop stopped");
        }
    }
}

/// A TCP connection to one endpoint. Reads and writes run on the transport's
/// event loop and block the calling thread until they complete.
#[derive(Debug)]
pub struct TcpConnection {
    endpoint: Endpoint,
    stream: Mutex<Option<TcpStream>>,
    handle: Handle,
}

impl TcpConnection {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn stream_lock(&self) -> MutexGuard<Option<TcpStream>> {
        self.stream.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_closed(&self) -> bool {
        self.stream_lock().is_none()
    }

    /// Write all of `buf` to the connection.
    pub fn send(&self, buf: &[u8]) -> Result<(), IOError> {
        let mut guard = self.stream_lock();
        let stream = guard.as_mut().ok_or_else(not_connected)?;
        self.handle.block_on(stream.write_all(buf))
    }

    /// Read exactly `buf.len()` bytes from the connection.
    pub fn recv_exact(&self, buf: &mut [u8]) -> Result<(), IOError> {
        let mut guard = self.stream_lock();
        let stream = guard.as_mut().ok_or_else(not_connected)?;
        self.handle.block_on(stream.read_exact(buf)).map(|_| ())
    }
}

impl Connection for TcpConnection {
    type Error = IOError;

    fn close(&self) -> Result<(), Self::Error> {
        // Dropping the stream closes the socket
        drop(self.stream_lock().take());
        Ok(())
    }
}

fn not_connected() -> IOError {
    IOError::new(ErrorKind::NotConnected, "connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use slog::Discard;

    fn transport() -> TcpTransport {
        TcpTransport::new(TcpTransportOptions {
            event_loop_threads: Some(2),
            nodelay: None,
            log: Some(Logger::root(Discard, o!())),
        })
        .unwrap()
    }

    #[test]
    fn tcp_connect_send_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(b"pong").unwrap();
            buf
        });

        let transport = transport();
        let endpoint = Endpoint::new("Hello", "127.0.0.1", port);
        let conn = transport
            .connect(&endpoint, Duration::from_secs(5))
            .unwrap();
        assert_eq!(conn.endpoint(), &endpoint);

        conn.send(b"ping").unwrap();
        let mut reply = [0u8; 4];
        conn.recv_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"pong");
        assert_eq!(&server.join().unwrap(), b"ping");

        conn.close().unwrap();
        conn.close().unwrap();
        assert!(conn.is_closed());
        assert_eq!(
            conn.send(b"ping").unwrap_err().kind(),
            ErrorKind::NotConnected
        );

        transport.shutdown();
        transport.shutdown();
    }

    #[test]
    fn tcp_connect_refused() {
        // Bind and drop a listener to find a port with nothing behind it
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let transport = transport();
        let endpoint = Endpoint::new("Hello", "127.0.0.1", port);
        assert!(transport
            .connect(&endpoint, Duration::from_secs(5))
            .is_err());
        transport.shutdown();
    }

    #[test]
    fn tcp_connect_after_shutdown() {
        let transport = transport();
        transport.shutdown();
        let endpoint = Endpoint::new("Hello", "127.0.0.1", 1);
        assert!(transport
            .connect(&endpoint, Duration::from_millis(100))
            .is_err());
    }
}
