//! IPv4 address ranges for discovery scans.

use crate::Result;
use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::str::FromStr;

/// An inclusive range of IPv4 host addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
    label: String,
}

impl NetworkRange {
    /// Parse a range.
    ///
    /// Accepted forms:
    /// - CIDR: `192.168.1.0/24` (network and broadcast addresses excluded for prefixes < 31)
    /// - single address: `192.168.1.40`
    /// - last-octet range: `192.168.1.10-50`
    /// - full range: `192.168.1.10-192.168.1.50`
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || crate::Error::InvalidNetworkRange(s.to_string());

        if let Some((addr, prefix)) = s.split_once('/') {
            let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
            let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
            if prefix > 32 {
                return Err(invalid());
            }
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            let network = u32::from(addr) & mask;
            let broadcast = network | !mask;
            let (start, end) = if prefix >= 31 {
                (network, broadcast)
            } else {
                (network + 1, broadcast - 1)
            };
            return Ok(Self {
                start: Ipv4Addr::from(start),
                end: Ipv4Addr::from(end),
                label: s.to_string(),
            });
        }

        if let Some((first, last)) = s.split_once('-') {
            let start: Ipv4Addr = first.trim().parse().map_err(|_| invalid())?;
            let last = last.trim();
            let end: Ipv4Addr = match last.parse::<u8>() {
                Ok(octet) => {
                    let o = start.octets();
                    Ipv4Addr::new(o[0], o[1], o[2], octet)
                }
                Err(_) => last.parse().map_err(|_| invalid())?,
            };
            if u32::from(end) < u32::from(start) {
                return Err(invalid());
            }
            return Ok(Self {
                start,
                end,
                label: s.to_string(),
            });
        }

        let addr: Ipv4Addr = s.parse().map_err(|_| invalid())?;
        Ok(Self {
            start: addr,
            end: addr,
            label: s.to_string(),
        })
    }

    /// The /24 of the interface used for the default route.
    ///
    /// No packets are sent; connecting a UDP socket only selects a route.
    pub fn local_default() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        let local = socket.local_addr()?.ip();
        match local {
            std::net::IpAddr::V4(v4) => {
                let o = v4.octets();
                Self::parse(&format!("{}.{}.{}.0/24", o[0], o[1], o[2]))
            }
            std::net::IpAddr::V6(_) => Err(crate::Error::InvalidNetworkRange(
                "local address is IPv6; pass --network explicitly".to_string(),
            )),
        }
    }

    /// Number of host addresses in the range.
    pub fn len(&self) -> usize {
        (u32::from(self.end) - u32::from(self.start)) as usize + 1
    }

    /// Whether the range holds no addresses.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterate host addresses in ascending order.
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.start)..=u32::from(self.end)).map(Ipv4Addr::from)
    }
}

impl fmt::Display for NetworkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl FromStr for NetworkRange {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
