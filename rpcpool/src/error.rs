// Copyright 2020 Joyent, Inc.

use std::error::Error as StdError;
use std::fmt;

use crate::bootstrap::Rejection;
use crate::endpoint::Endpoint;

#[derive(Debug)]
pub enum Error {
    /// No connection became available for the named service before the
    /// acquisition timeout elapsed, or the registry was shut down.
    ServiceUnavailable(String),
    /// A connect attempt for the endpoint could not be queued.
    TaskRejected(Endpoint, Rejection),
    AlreadyInitialized,
    RegistryShutdown,
    IOError(std::io::Error),
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::IOError(error)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::ServiceUnavailable(service) => {
                write!(fmt, "no connection available for service {}", service)
            }
            Error::TaskRejected(endpoint, reason) => write!(
                fmt,
                "connect task for endpoint {} rejected: {}",
                endpoint, reason
            ),
            Error::AlreadyInitialized => {
                String::from("connection registry already initialized").fmt(fmt)
            }
            Error::RegistryShutdown => {
                String::from("connection registry is shut down").fmt(fmt)
            }
            Error::IOError(io_err) => io_err.fmt(fmt),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::IOError(io_err) => Some(io_err),
            _ => None,
        }
    }
}
