//! Host identity with loopback normalization.
//!
//! # Equality
//!
//! Two hosts are equal when their addresses match (or both are local) and
//! their ports match, where a port of `-1` on either side matches any port.
//! This makes equality non-transitive, so `Host` implements `PartialEq` only.

use crate::{Result, SbwError};
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};

pub const LOCAL_ADDRESS: &str = "127.0.0.1";
pub const LOCAL_NAME: &str = "localhost";

/// Port value meaning "unspecified".
pub const ANY_PORT: i32 = -1;

#[derive(Debug, Clone)]
pub struct Host {
    // ---
    name: String,
    full_name: String,
    address: String,
    port: i32,
}

impl Host {
    // ---

    /// Resolve `name` (a host name or dotted quad), optionally with a port.
    ///
    /// `name` may also carry the port as `name/port`. Ports below 1 are
    /// stored as [`ANY_PORT`].
    pub fn resolve(name: &str, port: Option<i32>) -> Result<Self> {
        // ---
        let (name, embedded) = match name.split_once('/') {
            Some((n, p)) => {
                let p = p
                    .trim()
                    .parse::<i32>()
                    .map_err(|_| SbwError::Config(format!("invalid port in host {name:?}")))?;
                (n.trim(), Some(p))
            }
            None => (name.trim(), None),
        };
        let port = normalize_port(port.or(embedded).unwrap_or(ANY_PORT));

        if name.is_empty() {
            return Ok(Self::local(port));
        }
        if let Ok(ip) = name.parse::<IpAddr>() {
            return Ok(Self::from_ip(ip, port));
        }

        let resolved = (name, 0u16)
            .to_socket_addrs()
            .map_err(|e| SbwError::communication_detail(format!("unknown host {name}"), e.to_string()))?
            .map(|a| a.ip())
            .collect::<Vec<_>>();
        let ip = resolved
            .iter()
            .copied()
            .find(IpAddr::is_ipv4)
            .or_else(|| resolved.first().copied())
            .ok_or_else(|| SbwError::communication(format!("unknown host {name}")))?;

        if ip.is_loopback() {
            return Ok(Self::local(port));
        }
        Ok(Self {
            name: short_name(name),
            full_name: name.to_owned(),
            address: ip.to_string(),
            port,
        })
    }

    /// Host for a peer address, without DNS.
    pub fn from_ip(ip: IpAddr, port: i32) -> Self {
        // ---
        let port = normalize_port(port);
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        if ip.is_loopback() {
            return Self::local(port);
        }
        let address = ip.to_string();
        Self {
            name: address.clone(),
            full_name: address.clone(),
            address,
            port,
        }
    }

    pub fn local(port: i32) -> Self {
        // ---
        Self {
            name: LOCAL_NAME.to_owned(),
            full_name: LOCAL_NAME.to_owned(),
            address: LOCAL_ADDRESS.to_owned(),
            port: normalize_port(port),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> i32 {
        self.port
    }

    pub fn is_local(&self) -> bool {
        self.address == LOCAL_ADDRESS
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        self.address.parse().ok()
    }
}

impl PartialEq for Host {
    fn eq(&self, other: &Self) -> bool {
        // ---
        let same_address = self.address == other.address || (self.is_local() && other.is_local());
        let same_port =
            self.port == other.port || self.port == ANY_PORT || other.port == ANY_PORT;
        same_address && same_port
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        if self.port == ANY_PORT {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{}/{}", self.address, self.port)
        }
    }
}

fn normalize_port(port: i32) -> i32 {
    if port < 1 {
        ANY_PORT
    } else {
        port
    }
}

fn short_name(name: &str) -> String {
    name.split('.').next().unwrap_or(name).to_owned()
}
