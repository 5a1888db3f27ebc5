//! Client key derivation.

use std::net::{IpAddr, SocketAddr};

use axum::http::HeaderMap;

const FORWARDED_FOR: &str = "x-forwarded-for";
const REAL_IP: &str = "x-real-ip";
const UNKNOWN_CLIENT: &str = "unknown";

/// The store key that partitions counters per client.
///
/// Composed of a namespace prefix and the resolved client address, so it
/// cannot collide with unrelated keys in a shared store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey(String);

impl ClientKey {
    /// Build a key from a namespace prefix and a client identifier.
    pub fn new(prefix: &str, client: &str) -> Self {
        Self(format!("{}{}", prefix, client))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolve the address a request originates from.
///
/// With `trust_proxy` set, the left-most valid `X-Forwarded-For` entry wins,
/// then `X-Real-IP`. Otherwise, or when neither header carries an address,
/// the connection's peer address is used, and `"unknown"` when there is none.
/// IPv4-mapped IPv6 addresses are reported in their IPv4 form.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    remote_addr: Option<SocketAddr>,
    trust_proxy: bool,
) -> String {
    let forwarded = if trust_proxy {
        forwarded_for(headers).or_else(|| real_ip(headers))
    } else {
        None
    };

    forwarded
        .or_else(|| remote_addr.map(|addr| addr.ip()))
        .map(|ip| ip.to_canonical().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<IpAddr> {
    let value = headers.get(FORWARDED_FOR)?.to_str().ok()?;
    value
        .split(',')
        .map(str::trim)
        .find_map(|entry| entry.parse::<IpAddr>().ok())
}

fn real_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers.get(REAL_IP)?.to_str().ok()?.trim().parse().ok()
}
