//! Client address resolution behind reverse proxies.
//!
//! # Header Priority
//!
//! Checks in order (first usable value wins):
//! 1. `X-Forwarded-For` header (first hop of a comma-separated list)
//! 2. `X-Real-IP` header
//! 3. The transport peer address (`ConnectInfo<SocketAddr>`)
//! 4. Falls back to [`UNKNOWN_ADDR`] (the empty string)
//!
//! A header value that is not an IP address (an `ip:port` form is accepted
//! and the port dropped) is treated as if the header were absent. Malformed
//! headers are never an error.
//!
//! # Security Warning: IP Spoofing Risk
//!
//! **Forwarding headers are client-controlled.** Only deploy this layer
//! behind a reverse proxy that overwrites (not appends to) them:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! # Ordering
//!
//! [`ClientAddrLayer`] must run before anything that reads
//! [`ClientAddr`](super::context::ClientAddr) on the way in. Readers that
//! run earlier see the empty string.

use std::net::{IpAddr, SocketAddr};
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::debug;

use super::context::{ClientAddr, RequestContext};

/// Value published when no client address can be determined.
pub const UNKNOWN_ADDR: &str = "";

/// Where a resolved address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrSource {
    /// First hop of `X-Forwarded-For`.
    ForwardedFor,
    /// `X-Real-IP`.
    RealIp,
    /// The TCP peer of the connection.
    Peer,
    /// Nothing usable was found.
    Unknown,
}

impl AddrSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddrSource::ForwardedFor => "x-forwarded-for",
            AddrSource::RealIp => "x-real-ip",
            AddrSource::Peer => "peer",
            AddrSource::Unknown => "unknown",
        }
    }
}

/// Parse a single header token as an IP, tolerating a trailing port.
fn parse_addr(raw: &str) -> Option<IpAddr> {
    let raw = raw.trim();
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|s| s.ip()))
}

/// Resolve the originating client address and where it came from.
///
/// Pure function of the request headers and the connection peer, so calling
/// it twice on the same request yields the same answer.
pub fn resolve_with_source<B>(req: &Request<B>) -> (String, AddrSource) {
    if let Some(forwarded) = req.headers().get("x-forwarded-for")
        && let Ok(value) = forwarded.to_str()
        && let Some(first_hop) = value.split(',').next()
        && let Some(ip) = parse_addr(first_hop)
    {
        return (ip.to_string(), AddrSource::ForwardedFor);
    }

    if let Some(real_ip) = req.headers().get("x-real-ip")
        && let Ok(value) = real_ip.to_str()
        && let Some(ip) = parse_addr(value)
    {
        return (ip.to_string(), AddrSource::RealIp);
    }

    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        return (peer.ip().to_string(), AddrSource::Peer);
    }

    (UNKNOWN_ADDR.to_string(), AddrSource::Unknown)
}

/// Resolve the originating client address (see module docs for precedence).
#[inline]
pub fn resolve_client_addr<B>(req: &Request<B>) -> String {
    resolve_with_source(req).0
}

/// The transport peer address as a string, or `""` when not served with
/// connect info.
pub fn peer_addr<B>(req: &Request<B>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(peer)| peer.to_string())
        .unwrap_or_default()
}

/// Layer that publishes [`ClientAddr`] into the request's context store.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientAddrLayer;

impl ClientAddrLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for ClientAddrLayer {
    type Service = ClientAddrService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ClientAddrService { inner }
    }
}

/// Client address resolving service wrapper.
#[derive(Debug, Clone)]
pub struct ClientAddrService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for ClientAddrService<S>
where
    S: Service<Request<Body>, Response = Response<Body>>,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let (addr, source) = resolve_with_source(&req);
        debug!(client_addr = %addr, source = source.as_str(), "Resolved client address");

        RequestContext::ensure(&mut req).publish(ClientAddr(addr));
        self.inner.call(req)
    }
}
