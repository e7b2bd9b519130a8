//! Bind, advertise and peer address handling.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::warn;

use crate::error::SwarmError;

/// Token replaced by the node's externally reachable address.
pub const PUBLIC_TOKEN: &str = "public";

/// Resolves a configured bind or advertise address.
///
/// A leading `:` binds all interfaces and the first `public` token is
/// replaced with [`external_ip`].
///
/// # Errors
///
/// Returns [`SwarmError::Address`] if the address cannot be resolved.
pub fn resolve(text: &str) -> Result<SocketAddr, SwarmError> {
    if text.contains(PUBLIC_TOKEN) {
        resolve_with(text, external_ip())
    } else {
        resolve_with(text, IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }
}

/// Resolves an address using `public` as the substitute for the public token.
///
/// # Errors
///
/// Returns [`SwarmError::Address`] if the address cannot be resolved.
pub fn resolve_with(text: &str, public: IpAddr) -> Result<SocketAddr, SwarmError> {
    if text.is_empty() {
        return Err(SwarmError::address(text, "address is empty"));
    }

    let mut expanded = if text.starts_with(':') {
        format!("0.0.0.0{text}")
    } else {
        text.to_string()
    };

    if expanded.contains(PUBLIC_TOKEN) {
        let host = match public {
            IpAddr::V4(ip) => ip.to_string(),
            IpAddr::V6(ip) => format!("[{ip}]"),
        };
        expanded = expanded.replacen(PUBLIC_TOKEN, &host, 1);
    }

    expanded
        .to_socket_addrs()
        .map_err(|e| SwarmError::address(text, e.to_string()))?
        .next()
        .ok_or_else(|| SwarmError::address(text, "no address resolved"))
}

/// Best-effort discovery of the address other hosts reach us on.
///
/// Connecting a UDP socket sends no packets; it only selects the outbound
/// interface. Falls back to loopback when there is no route.
#[must_use]
pub fn external_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip())
    };

    probe().unwrap_or_else(|e| {
        warn!(error = %e, "unable to determine external address, using loopback");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    })
}

/// Validates a `host:port` peer address before it is handed to the transport.
///
/// # Errors
///
/// Returns [`SwarmError::Address`] when the host is missing or the port is
/// not a non-zero integer.
pub fn validate_peer(addr: &str) -> Result<(), SwarmError> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| SwarmError::address(addr, "expected host:port"))?;

    if host.is_empty() {
        return Err(SwarmError::address(addr, "missing host"));
    }

    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(SwarmError::address(addr, "invalid port")),
        Ok(_) => Ok(()),
    }
}
