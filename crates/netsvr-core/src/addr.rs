//! Worker address encoding.
//!
//! Registries key their entries by a fixed-width hex form of the gateway
//! worker address: the four IPv4 octets followed by the big-endian port,
//! twelve lower-case hex characters in total. Gateways prefix every uniq id
//! they issue with the same encoding, so the owning worker can be recovered
//! from a uniq id without a directory lookup.

use crate::error::RegistryError;
use std::net::Ipv4Addr;

/// Length of an encoded worker address.
pub const WORKER_ADDR_HEX_LEN: usize = 12;

/// Encodes `host:port` into its registry key.
///
/// ```
/// use netsvr_core::addr::worker_addr_to_hex;
///
/// assert_eq!(worker_addr_to_hex("127.0.0.1:6061").unwrap(), "7f00000117ad");
/// ```
pub fn worker_addr_to_hex(worker_addr: &str) -> Result<String, RegistryError> {
    let (host, port) = worker_addr
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| RegistryError::invalid_addr(worker_addr, "missing port"))?;

    let port: u16 = port
        .parse()
        .map_err(|_| RegistryError::invalid_addr(worker_addr, "port is not a number"))?;

    let ip = if host.eq_ignore_ascii_case("localhost") {
        Ipv4Addr::LOCALHOST
    } else {
        host.parse::<Ipv4Addr>()
            .map_err(|_| RegistryError::invalid_addr(worker_addr, "host is not an IPv4 address"))?
    };

    let mut raw = [0u8; WORKER_ADDR_HEX_LEN / 2];
    raw[..4].copy_from_slice(&ip.octets());
    raw[4..].copy_from_slice(&port.to_be_bytes());
    Ok(hex::encode(raw))
}

/// Extracts the encoded worker address embedded at the front of a uniq id.
pub fn uniq_id_to_worker_addr_hex(uniq_id: &str) -> Option<&str> {
    let prefix = uniq_id.get(..WORKER_ADDR_HEX_LEN)?;
    prefix
        .bytes()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        .then_some(prefix)
}
