//! Host name resolution for outbound connects

use super::TransportError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::lookup_host;

/// Turns a host name into a single address to connect to
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError>;
}

/// Resolver backed by the operating system
#[derive(Debug, Clone)]
pub struct SystemResolver {
    timeout: Duration,
}

impl SystemResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        // Literal addresses skip the lookup entirely
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        let addrs: Vec<SocketAddr> = tokio::time::timeout(self.timeout, lookup_host((host, port)))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::Resolve(format!("{}: {}", host, e)))?
            .collect();

        pick_address(&addrs)
            .ok_or_else(|| TransportError::Resolve(format!("{}: no addresses", host)))
    }
}

/// Prefer the first IPv4 address, otherwise the first of any family
fn pick_address(addrs: &[SocketAddr]) -> Option<SocketAddr> {
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

/// Fixed host table, for deployments that pin destinations and for tests
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, IpAddr>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a host entry
    pub fn with_host(mut self, host: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(host.into(), ip);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr, TransportError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }
        self.hosts
            .get(host)
            .map(|ip| SocketAddr::new(*ip, port))
            .ok_or_else(|| TransportError::Resolve(format!("{}: unknown host", host)))
    }
}
