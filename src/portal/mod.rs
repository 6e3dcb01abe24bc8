//! Captive portal services.
//!
//! While the hotspot is up the device answers every DNS query with its own
//! address ([`dns`]) and serves the provisioning pages over HTTP
//! ([`http`], [`provisioning`]). Phones and laptops treat that combination
//! as a captive portal and open the setup page on their own.
//!
//! The connection manager composes against [`DnsService`] and
//! [`HttpService`] so tests can substitute doubles.

pub mod dns;
pub mod http;
pub mod provisioning;

pub use dns::{CaptiveDns, DnsResponder, PacketHandler, DEFAULT_DNS_ADDR};
pub use http::{
    HttpMethod, HttpRequest, HttpResponse, HttpServer, RouteTable, Router, DEFAULT_HTTP_ADDR,
    MAX_CONTENT_LENGTH,
};
pub use provisioning::{ProvisioningHandler, Template};

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;

/// Future returned by the portal service traits.
pub type ServiceFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Captive DNS service.
pub trait DnsService: Send {
    /// Start answering queries with `ip`. A running instance is stopped
    /// first, so the listen address is free again before rebinding.
    fn start(&mut self, ip: Ipv4Addr) -> ServiceFuture<'_, Result<(), PortalError>>;

    /// Stop answering. Resolves once the socket is closed; no-op when stopped.
    fn stop(&mut self) -> ServiceFuture<'_, ()>;

    /// Whether the service is running.
    fn is_running(&self) -> bool;
}

/// HTTP service dispatching to a [`Router`].
pub trait HttpService: Send {
    /// Start serving `router`. A running instance is stopped first.
    fn start(&mut self, router: Arc<dyn Router>) -> ServiceFuture<'_, Result<(), PortalError>>;

    /// Stop serving. Resolves once the server thread has exited; no-op
    /// when stopped.
    fn stop(&mut self) -> ServiceFuture<'_, ()>;

    /// Whether the service is running.
    fn is_running(&self) -> bool;
}

/// Portal service errors.
#[derive(Debug)]
pub enum PortalError {
    /// Could not bind the listening socket.
    Bind { addr: SocketAddr, source: io::Error },
    /// Not a valid IPv4 address.
    InvalidIp(String),
    /// Generic I/O error.
    Io(io::Error),
}

impl fmt::Display for PortalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { addr, source } => write!(f, "failed to bind {}: {}", addr, source),
            Self::InvalidIp(ip) => write!(f, "invalid IP: {}", ip),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for PortalError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bind { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            Self::InvalidIp(_) => None,
        }
    }
}

impl From<io::Error> for PortalError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
