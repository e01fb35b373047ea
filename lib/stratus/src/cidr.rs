// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid CIDR {0:?}")]
pub struct CidrError(pub String);

/// An address block written as `addr/prefix`. A bare address is treated as
/// a host route.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Dotted-quad netmask for IPv4 blocks; IPv6 blocks have none.
    pub fn netmask(&self) -> Option<Ipv4Addr> {
        match self.addr {
            IpAddr::V4(_) => {
                let bits = u32::MAX
                    .checked_shl(32 - u32::from(self.prefix))
                    .unwrap_or(0);
                Some(Ipv4Addr::from(bits))
            }
            IpAddr::V6(_) => None,
        }
    }
}

impl FromStr for Cidr {
    type Err = CidrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || CidrError(s.to_string());
        let (addr, prefix) = match s.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (s, None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| err())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().map_err(|_| err())?,
            None => max,
        };
        if prefix > max {
            return Err(err());
        }
        Ok(Cidr { addr, prefix })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_both_families() {
        let v4: Cidr = "192.168.10.0/24".parse().unwrap();
        assert!(!v4.is_ipv6());
        assert_eq!(v4.prefix(), 24);
        assert_eq!(v4.netmask(), Some(Ipv4Addr::new(255, 255, 255, 0)));

        let v6: Cidr = "2001:db8::/64".parse().unwrap();
        assert!(v6.is_ipv6());
        assert_eq!(v6.prefix(), 64);
        assert_eq!(v6.netmask(), None);

        let host: Cidr = "10.0.0.1".parse().unwrap();
        assert_eq!(host.prefix(), 32);
        assert_eq!(host.to_string(), "10.0.0.1/32");

        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert_eq!(any.netmask(), Some(Ipv4Addr::new(0, 0, 0, 0)));
    }

    #[test]
    fn rejects_garbage() {
        assert!("nope/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
    }
}
