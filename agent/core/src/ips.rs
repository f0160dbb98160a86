use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The addresses assigned to an object.
///
/// The first address seen for each family is primary; later ones are kept in the `other_*` lists.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct IpAddresses {
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    pub other_ipv4s: Vec<Ipv4Addr>,
    pub other_ipv6s: Vec<Ipv6Addr>,
}

impl IpAddresses {
    /// The preferred address of the set: IPv4 if present, otherwise IPv6.
    pub fn primary_ip(&self) -> Option<IpAddr> {
        self.ipv4
            .map(IpAddr::V4)
            .or_else(|| self.ipv6.map(IpAddr::V6))
    }

    pub fn push(&mut self, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => match self.ipv4 {
                None => self.ipv4 = Some(v4),
                Some(primary) if primary == v4 => {}
                Some(_) => {
                    if !self.other_ipv4s.contains(&v4) {
                        self.other_ipv4s.push(v4);
                    }
                }
            },
            IpAddr::V6(v6) => match self.ipv6 {
                None => self.ipv6 = Some(v6),
                Some(primary) if primary == v6 => {}
                Some(_) => {
                    if !self.other_ipv6s.contains(&v6) {
                        self.other_ipv6s.push(v6);
                    }
                }
            },
        }
    }

    /// Iterates over all addresses, primaries first.
    pub fn iter(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.ipv4
            .map(IpAddr::V4)
            .into_iter()
            .chain(self.ipv6.map(IpAddr::V6))
            .chain(self.other_ipv4s.iter().copied().map(IpAddr::V4))
            .chain(self.other_ipv6s.iter().copied().map(IpAddr::V6))
    }

    pub fn is_empty(&self) -> bool {
        self.ipv4.is_none() && self.ipv6.is_none()
    }
}

impl From<IpAddr> for IpAddresses {
    fn from(ip: IpAddr) -> Self {
        let mut ips = Self::default();
        ips.push(ip);
        ips
    }
}

impl FromIterator<IpAddr> for IpAddresses {
    fn from_iter<I: IntoIterator<Item = IpAddr>>(iter: I) -> Self {
        let mut ips = Self::default();
        for ip in iter {
            ips.push(ip);
        }
        ips
    }
}
