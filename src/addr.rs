//! Peer endpoints and address groups.
//!
//! An [`Endpoint`] is a network address and port; a [`PeerAddr`] is what
//! peers gossip about each other: an endpoint plus its advertised service
//! bits and a "last seen" timestamp.
//!
//! Every address belongs to a *group*: the autonomous-system number it maps
//! to when an asmap is loaded, or a family-specific prefix otherwise. Groups
//! are the unit of adversary budgeting in the bucket tables, so the mapping
//! must be deterministic and stable across runs for a given asmap.
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net;

use bitcoin::network::address::AddrV2;
use bitcoin::network::constants::ServiceFlags;

use crate::asmap::AsMap;
use crate::time::Timestamp;

/// BIP155 network id of an address.
pub(crate) fn network_id(addr: &AddrV2) -> u8 {
    match addr {
        AddrV2::Ipv4(_) => 1,
        AddrV2::Ipv6(_) => 2,
        AddrV2::TorV2(_) => 3,
        AddrV2::TorV3(_) => 4,
        AddrV2::I2p(_) => 5,
        AddrV2::Cjdns(_) => 6,
        AddrV2::Unknown(id, _) => *id,
    }
}

/// Raw address bytes, in network byte order.
pub(crate) fn address_bytes(addr: &AddrV2) -> Vec<u8> {
    match addr {
        AddrV2::Ipv4(ip) => ip.octets().to_vec(),
        AddrV2::Ipv6(ip) | AddrV2::Cjdns(ip) => ip.octets().to_vec(),
        AddrV2::TorV2(bytes) => bytes.to_vec(),
        AddrV2::TorV3(bytes) | AddrV2::I2p(bytes) => bytes.to_vec(),
        AddrV2::Unknown(_, bytes) => bytes.clone(),
    }
}

/// The group an address belongs to, as an opaque byte key.
///
/// With a non-empty asmap, IP addresses group by the AS number their prefix
/// resolves to. Without one, IPv4 groups by /16 and IPv6 by /32, while the
/// overlay families (Tor, I2P, Cjdns) each collapse to a single per-family
/// group.
pub fn group(addr: &AddrV2, asmap: &AsMap) -> Vec<u8> {
    let asn = mapped_as(addr, asmap);
    if asn != 0 {
        // Tagged as IPv6, so that v4 and v6 addresses of one AS share a group.
        let mut key = vec![2u8];
        key.extend_from_slice(&asn.to_le_bytes());
        return key;
    }
    match addr {
        AddrV2::Ipv4(ip) => {
            let octets = ip.octets();
            vec![network_id(addr), octets[0], octets[1]]
        }
        AddrV2::Ipv6(ip) => {
            let octets = ip.octets();
            vec![network_id(addr), octets[0], octets[1], octets[2], octets[3]]
        }
        other => vec![network_id(other)],
    }
}

/// The AS number an address maps to under the given asmap, or zero when the
/// map is empty or the address family cannot be mapped.
pub fn mapped_as(addr: &AddrV2, asmap: &AsMap) -> u32 {
    if asmap.is_empty() {
        return 0;
    }
    match ip_bits(addr) {
        Some(bits) => asmap.lookup(&bits),
        None => 0,
    }
}

/// The 128 address bits used for asmap lookup: IPv6 addresses verbatim,
/// IPv4 addresses embedded in `::ffff:0:0/96`.
fn ip_bits(addr: &AddrV2) -> Option<[bool; 128]> {
    let octets: [u8; 16] = match addr {
        AddrV2::Ipv4(ip) => ip.to_ipv6_mapped().octets(),
        AddrV2::Ipv6(ip) => ip.octets(),
        _ => return None,
    };
    let mut bits = [false; 128];
    for (i, byte) in octets.iter().enumerate() {
        for bit in 0..8 {
            bits[i * 8 + bit] = (byte >> (7 - bit)) & 1 == 1;
        }
    }
    Some(bits)
}

/// Check whether an address is globally routable.
pub fn is_routable(addr: &AddrV2) -> bool {
    match addr {
        AddrV2::Ipv4(ip) => ipv4_is_routable(ip),
        AddrV2::Ipv6(ip) => ipv6_is_routable(ip),
        AddrV2::TorV2(_) | AddrV2::TorV3(_) | AddrV2::I2p(_) | AddrV2::Cjdns(_) => true,
        AddrV2::Unknown(..) => false,
    }
}

/// Check whether an IPv4 address is globally routable.
///
/// This code is adapted from the Rust standard library's
/// `net::Ipv4Addr::is_global`. It can be replaced once that function is
/// stabilized.
fn ipv4_is_routable(addr: &net::Ipv4Addr) -> bool {
    // Check if this address is 192.0.0.9 or 192.0.0.10. These addresses are the only two
    // globally routable addresses in the 192.0.0.0/24 range.
    if u32::from(*addr) == 0xc0000009 || u32::from(*addr) == 0xc000000a {
        return true;
    }
    !addr.is_private()
        && !addr.is_loopback()
        && !addr.is_link_local()
        && !addr.is_broadcast()
        && !addr.is_documentation()
        // Make sure the address is not in 0.0.0.0/8.
        && addr.octets()[0] != 0
}

/// Check whether an IPv6 address is globally routable.
fn ipv6_is_routable(addr: &net::Ipv6Addr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}

/// A peer endpoint: a network address and port.
///
/// Two endpoints are equal iff their address and port are equal; service
/// bits are metadata carried by [`PeerAddr`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Network address.
    pub addr: AddrV2,
    /// Port number.
    pub port: u16,
}

impl Endpoint {
    /// Create a new endpoint.
    pub fn new(addr: AddrV2, port: u16) -> Self {
        Self { addr, port }
    }

    /// The canonical byte encoding of this endpoint: network id, raw
    /// address bytes, and the port in network byte order. This is the
    /// identity fed to the keyed placement hashes.
    pub fn identity(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(19);
        bytes.push(network_id(&self.addr));
        bytes.extend(address_bytes(&self.addr));
        bytes.extend_from_slice(&self.port.to_be_bytes());
        bytes
    }

    /// Whether the endpoint's address is globally routable.
    pub fn is_routable(&self) -> bool {
        self::is_routable(&self.addr)
    }

    /// The group the endpoint's address belongs to.
    pub fn group(&self, asmap: &AsMap) -> Vec<u8> {
        self::group(&self.addr, asmap)
    }
}

impl Hash for Endpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.identity());
    }
}

impl From<net::SocketAddr> for Endpoint {
    fn from(addr: net::SocketAddr) -> Self {
        match addr {
            net::SocketAddr::V4(v4) => Self::new(AddrV2::Ipv4(*v4.ip()), v4.port()),
            net::SocketAddr::V6(v6) => match v6.ip().to_ipv4() {
                Some(ip) => Self::new(AddrV2::Ipv4(ip), v6.port()),
                None => Self::new(AddrV2::Ipv6(*v6.ip()), v6.port()),
            },
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            AddrV2::Ipv4(ip) => write!(f, "{}:{}", ip, self.port),
            AddrV2::Ipv6(ip) | AddrV2::Cjdns(ip) => write!(f, "[{}]:{}", ip, self.port),
            other => write!(f, "{:?}:{}", other, self.port),
        }
    }
}

/// A gossiped peer address: an endpoint together with the service bits the
/// peer advertises and the timestamp it was last vouched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddr {
    /// The peer endpoint.
    pub endpoint: Endpoint,
    /// Advertised service bits.
    pub services: ServiceFlags,
    /// Advisory timestamp of the last time any peer vouched for this
    /// address. Zero means never.
    pub last_seen: Timestamp,
}

impl PeerAddr {
    /// Create a new peer address.
    pub fn new(endpoint: Endpoint, services: ServiceFlags, last_seen: Timestamp) -> Self {
        Self {
            endpoint,
            services,
            last_seen,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_by_prefix() {
        let asmap = AsMap::empty();

        let a = AddrV2::Ipv4(net::Ipv4Addr::new(100, 99, 43, 12));
        let b = AddrV2::Ipv4(net::Ipv4Addr::new(100, 99, 12, 8));
        let c = AddrV2::Ipv4(net::Ipv4Addr::new(100, 54, 43, 12));

        assert_eq!(group(&a, &asmap), group(&b, &asmap));
        assert_ne!(group(&a, &asmap), group(&c, &asmap));
    }

    #[test]
    fn test_group_families_are_disjoint() {
        let asmap = AsMap::empty();

        let ip = AddrV2::Ipv4(net::Ipv4Addr::new(100, 99, 43, 12));
        let tor = AddrV2::TorV3([7; 32]);
        let i2p = AddrV2::I2p([7; 32]);

        assert_ne!(group(&ip, &asmap), group(&tor, &asmap));
        assert_ne!(group(&tor, &asmap), group(&i2p, &asmap));
    }

    #[test]
    fn test_identity_includes_port() {
        let a = Endpoint::from(net::SocketAddr::from(([33, 33, 33, 33], 8333)));
        let b = Endpoint::from(net::SocketAddr::from(([33, 33, 33, 33], 8334)));

        assert_ne!(a.identity(), b.identity());
        assert_ne!(a, b);
    }

    #[test]
    fn test_routability() {
        assert!(!is_routable(&AddrV2::Ipv4(net::Ipv4Addr::new(127, 0, 0, 1))));
        assert!(!is_routable(&AddrV2::Ipv4(net::Ipv4Addr::new(192, 168, 1, 1))));
        assert!(!is_routable(&AddrV2::Ipv4(net::Ipv4Addr::new(
            255, 255, 255, 255
        ))));
        assert!(is_routable(&AddrV2::Ipv4(net::Ipv4Addr::new(33, 33, 33, 33))));
        assert!(is_routable(&AddrV2::TorV3([1; 32])));
        assert!(!is_routable(&AddrV2::Unknown(42, vec![1, 2, 3])));
    }

    #[test]
    fn test_v4_mapped_socket_addr() {
        let v6 = net::SocketAddr::new(
            net::IpAddr::V6(net::Ipv4Addr::new(33, 33, 33, 33).to_ipv6_mapped()),
            8333,
        );
        let v4 = net::SocketAddr::from(([33, 33, 33, 33], 8333));

        assert_eq!(Endpoint::from(v6), Endpoint::from(v4));
    }
}
