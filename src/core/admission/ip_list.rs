//! Static source lists with CIDR support.

use std::{net::IpAddr, str::FromStr};

/// CIDR network representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix_len: u8,
}

impl IpNetwork {
    pub fn new(addr: IpAddr, prefix_len: u8) -> Result<Self, String> {
        match addr {
            IpAddr::V4(_) if prefix_len > 32 => {
                return Err("IPv4 prefix length must be <= 32".to_string());
            }
            IpAddr::V6(_) if prefix_len > 128 => {
                return Err("IPv6 prefix length must be <= 128".to_string());
            }
            _ => {}
        }

        Ok(Self {
            addr: normalize_ip(addr),
            prefix_len: match addr {
                // A mapped /N (N >= 96) becomes the equivalent IPv4 /N-96.
                IpAddr::V6(v6) if v6.to_ipv4_mapped().is_some() => prefix_len.saturating_sub(96),
                _ => prefix_len,
            },
        })
    }

    /// Parse a single address or CIDR notation (e.g. "192.168.1.0/24")
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if let Some((ip_str, prefix_str)) = s.split_once('/') {
            let addr = IpAddr::from_str(ip_str).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len: u8 = prefix_str
                .parse()
                .map_err(|e| format!("Invalid prefix length: {e}"))?;
            Self::new(addr, prefix_len)
        } else {
            let addr = IpAddr::from_str(s).map_err(|e| format!("Invalid IP address: {e}"))?;
            let prefix_len = match addr {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            Self::new(addr, prefix_len)
        }
    }

    /// Check if an IP address is contained in this network
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, normalize_ip(ip)) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u32 << (32 - self.prefix_len)
                };
                (u32::from(net) & mask) == (u32::from(addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix_len == 0 {
                    0
                } else {
                    !0u128 << (128 - self.prefix_len)
                };
                (u128::from(net) & mask) == (u128::from(addr) & mask)
            }
            _ => false,
        }
    }
}

impl FromStr for IpNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IpNetwork::parse(s)
    }
}

/// Strip the IPv4-mapped IPv6 prefix (`::ffff:a.b.c.d` becomes `a.b.c.d`).
pub fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

/// An immutable set of networks.
#[derive(Debug, Clone, Default)]
pub struct IpList {
    networks: Vec<IpNetwork>,
}

impl IpList {
    /// Build from configuration entries; the first bad entry fails the whole list.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, String> {
        let networks = entries
            .iter()
            .map(|entry| {
                IpNetwork::parse(entry.as_ref())
                    .map_err(|e| format!("Invalid list entry '{}': {e}", entry.as_ref()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { networks })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.networks.iter().any(|network| network.contains(ip))
    }

    pub fn len(&self) -> usize {
        self.networks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
