//! Host resolution for destination URIs

use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};

use crate::error::{DispatcherError, Result};

/// Resolves the host of a destination while a generation is built
pub trait HostResolver: Send + Sync {
    fn resolve(&self, host: &str, port: u16) -> Result<IpAddr>;
}

/// Resolver using the operating system; IP literals are not looked up
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

impl HostResolver for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        (host, port)
            .to_socket_addrs()
            .map_err(|e| DispatcherError::Config(format!("could not resolve {}: {}", host, e)))?
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| DispatcherError::Config(format!("no address for {}", host)))
    }
}

/// Fixed host table, with an optional address for every other name
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
    fallback: Option<IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(host.into().to_ascii_lowercase(), ip);
        self
    }

    pub fn with_fallback(mut self, ip: IpAddr) -> Self {
        self.fallback = Some(ip);
        self
    }
}

impl HostResolver for StaticResolver {
    fn resolve(&self, host: &str, _port: u16) -> Result<IpAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        self.hosts
            .get(&host.to_ascii_lowercase())
            .copied()
            .or(self.fallback)
            .ok_or_else(|| DispatcherError::Config(format!("unknown host {}", host)))
    }
}
