//! Per-connection facts handed to delegates: who is on the other end and over which scheme.

use std::collections::HashSet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use http::HeaderMap;
use tracing::trace;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const X_SCHEME: &str = "x-scheme";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, Clone)]
pub struct ConnectionContext {
    address: Option<SocketAddr>,
    remote_ip: IpAddr,
    protocol: &'static str,
    xheaders: bool,
    trusted_downstream: HashSet<IpAddr>,
    orig_remote_ip: IpAddr,
    orig_protocol: &'static str,
}

impl ConnectionContext {
    pub fn new(address: Option<SocketAddr>, secure: bool) -> Self {
        let remote_ip = address.map_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED), |address| address.ip());
        let protocol = if secure { "https" } else { "http" };
        Self {
            address,
            remote_ip,
            protocol,
            xheaders: false,
            trusted_downstream: HashSet::new(),
            orig_remote_ip: remote_ip,
            orig_protocol: protocol,
        }
    }

    /// Trust `X-Real-Ip`, `X-Forwarded-For`, `X-Scheme` and `X-Forwarded-Proto` from the peer.
    pub fn with_xheaders(mut self, xheaders: bool) -> Self {
        self.xheaders = xheaders;
        self
    }

    /// Proxies whose addresses are skipped when walking `X-Forwarded-For` from the right.
    pub fn with_trusted_downstream<I: IntoIterator<Item = IpAddr>>(mut self, trusted: I) -> Self {
        self.trusted_downstream = trusted.into_iter().collect();
        self
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote_ip
    }

    /// `"http"` or `"https"`.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn xheaders(&self) -> bool {
        self.xheaders
    }

    /// Rewrites the remote ip and protocol from proxy headers for the current request.
    pub(crate) fn apply_xheaders(&mut self, headers: &HeaderMap) {
        let forwarded_for = headers.get(X_FORWARDED_FOR).and_then(|value| value.to_str().ok());
        let mut candidate = forwarded_for.and_then(|chain| {
            chain
                .rsplit(',')
                .map(str::trim)
                .find(|hop| hop.parse::<IpAddr>().map_or(true, |ip| !self.trusted_downstream.contains(&ip)))
        });

        if let Some(real_ip) = headers.get(X_REAL_IP).and_then(|value| value.to_str().ok()) {
            candidate = Some(real_ip.trim());
        }
        if let Some(ip) = candidate.and_then(|candidate| candidate.parse::<IpAddr>().ok()) {
            self.remote_ip = ip;
        }

        let proto = headers
            .get(X_SCHEME)
            .or_else(|| headers.get(X_FORWARDED_PROTO))
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.rsplit(',').next())
            .map(str::trim);
        match proto {
            Some("http") => self.protocol = "http",
            Some("https") => self.protocol = "https",
            _ => {}
        }
        trace!(remote_ip = %self.remote_ip, protocol = self.protocol, "applied proxy headers");
    }

    /// Restores the values seen on the socket once the request is over.
    pub(crate) fn unapply_xheaders(&mut self) {
        self.remote_ip = self.orig_remote_ip;
        self.protocol = self.orig_protocol;
    }
}

impl fmt::Display for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.address {
            Some(_) => write!(f, "{}", self.remote_ip),
            None => f.write_str("unknown peer"),
        }
    }
}
