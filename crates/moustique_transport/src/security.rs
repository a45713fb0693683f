//! Peer access control.
//!
//! Requests are admitted by source address before any parsing happens.
//! Loopback, the local 192.168/16 network and the carrier-grade NAT range
//! used by mesh VPNs are always allowed; everything else must match a
//! configured address or CIDR block.

use std::collections::HashSet;
use std::net::IpAddr;

use tracing::warn;

/// An IPv4 or IPv6 network in prefix notation.
#[derive(Debug, Clone, Copy)]
enum CidrBlock {
    V4 { network: u32, prefix: u8 },
    V6 { network: u128, prefix: u8 },
}

impl CidrBlock {
    fn parse(spec: &str) -> Option<Self> {
        let (addr, prefix) = spec.split_once('/')?;
        let prefix: u8 = prefix.parse().ok()?;
        match addr.parse::<IpAddr>().ok()? {
            IpAddr::V4(v4) if prefix <= 32 => Some(Self::V4 {
                network: u32::from(v4) & mask4(prefix),
                prefix,
            }),
            IpAddr::V6(v6) if prefix <= 128 => Some(Self::V6 {
                network: u128::from(v6) & mask6(prefix),
                prefix,
            }),
            _ => None,
        }
    }

    fn contains(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::V4 { network, prefix }, IpAddr::V4(v4)) => {
                u32::from(v4) & mask4(*prefix) == *network
            }
            (Self::V6 { network, prefix }, IpAddr::V6(v6)) => {
                u128::from(v6) & mask6(*prefix) == *network
            }
            _ => false,
        }
    }
}

fn mask4(prefix: u8) -> u32 {
    if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    }
}

fn mask6(prefix: u8) -> u128 {
    if prefix == 0 {
        0
    } else {
        u128::MAX << (128 - prefix)
    }
}

/// 100.64.0.0/10, the carrier-grade NAT range handed out by mesh VPNs.
const CGNAT: CidrBlock = CidrBlock::V4 {
    network: 0x6440_0000,
    prefix: 10,
};

pub struct PeerAllowlist {
    allowed_ips: HashSet<IpAddr>,
    allowed_nets: Vec<CidrBlock>,
}

impl PeerAllowlist {
    /// Build from configured entries; each is a single address or a CIDR
    /// block. Unparseable entries are skipped with a warning.
    pub fn new(allowed_peers: &[String]) -> Self {
        let mut allowed_ips = HashSet::new();
        let mut allowed_nets = Vec::new();

        for peer in allowed_peers {
            if peer.contains('/') {
                match CidrBlock::parse(peer) {
                    Some(block) => allowed_nets.push(block),
                    None => warn!(peer = %peer, "ignoring unparseable allowlist entry"),
                }
            } else {
                match peer.parse::<IpAddr>() {
                    Ok(ip) => {
                        allowed_ips.insert(ip);
                    }
                    Err(_) => warn!(peer = %peer, "ignoring unparseable allowlist entry"),
                }
            }
        }

        Self {
            allowed_ips,
            allowed_nets,
        }
    }

    /// Whether a peer address may talk to the broker at all.
    pub fn is_allowed(&self, ip: IpAddr) -> bool {
        if ip.is_loopback() {
            return true;
        }

        if let IpAddr::V4(v4) = ip {
            let octets = v4.octets();
            if octets[0] == 192 && octets[1] == 168 {
                return true;
            }
            if CGNAT.contains(ip) {
                return true;
            }
        }

        if self.allowed_ips.contains(&ip) {
            return true;
        }

        self.allowed_nets.iter().any(|net| net.contains(ip))
    }
}
