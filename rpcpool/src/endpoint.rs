// Copyright 2020 Joyent, Inc.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;

use derive_more::{Display, From, Into};

/// The name of a logical service published in the service registry.
#[derive(
    Clone, Debug, Display, Eq, From, Hash, Into, Ord, PartialOrd, PartialEq,
)]
pub struct ServiceName(String);

impl ServiceName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceName {
    fn from(name: &str) -> Self {
        ServiceName(String::from(name))
    }
}

impl Borrow<str> for ServiceName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The host name or IP address of an endpoint. This is a type alias for
/// String.
pub type EndpointHost = String;
/// The port number of an endpoint. This is a type alias for u16.
pub type EndpointPort = u16;

/// The identity of one remote instance of a service. Two endpoints are the
/// same endpoint when all three fields are equal.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialOrd, PartialEq)]
pub struct Endpoint {
    service: ServiceName,
    host: EndpointHost,
    port: EndpointPort,
}

impl Endpoint {
    /// Return a new instance of `Endpoint` for the given service, host, and
    /// port.
    pub fn new<S, H>(service: S, host: H, port: EndpointPort) -> Self
    where
        S: Into<ServiceName>,
        H: Into<EndpointHost>,
    {
        Endpoint {
            service: service.into(),
            host: host.into(),
            port,
        }
    }

    pub fn service(&self) -> &ServiceName {
        &self.service
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> EndpointPort {
        self.port
    }

    /// The concatenation of the host and port with a colon delimiter, suitable
    /// for handing to a socket connect call.
    pub fn address(&self) -> String {
        [self.host.clone(), String::from(":"), self.port.to_string()].concat()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}@{}:{}", self.service, self.host, self.port)
    }
}

/// The set of endpoints known for each service at one point in time, as
/// served by a resolver.
pub type Snapshot = HashMap<ServiceName, Vec<Endpoint>>;

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    #[test]
    fn endpoint_equality_is_by_value() {
        let a = Endpoint::new("Hello", "127.0.0.1", 8080);
        let b = Endpoint::new(String::from("Hello"), "127.0.0.1", 8080);
        let c = Endpoint::new("Hello", "127.0.0.1", 8081);
        let d = Endpoint::new("World", "127.0.0.1", 8080);

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);

        let set: HashSet<Endpoint> = vec![a, b, c, d].into_iter().collect();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn endpoint_address_and_display() {
        let e = Endpoint::new("Hello", "10.0.0.4", 2181);
        assert_eq!(e.address(), "10.0.0.4:2181");
        assert_eq!(e.to_string(), "Hello@10.0.0.4:2181");
        assert_eq!(e.service().as_str(), "Hello");
    }

    #[test]
    fn service_name_lookup_by_str() {
        let mut map: HashMap<ServiceName, u32> = HashMap::new();
        map.insert(ServiceName::from("Hello"), 1);
        assert_eq!(map.get("Hello"), Some(&1));
        assert_eq!(map.get("World"), None);
    }
}
