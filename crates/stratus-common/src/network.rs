use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Smallest subnet the compute backend accepts.
pub const MAX_SUBNET_MASK: u8 = 28;

/// An IPv4 address range in CIDR notation. Host bits are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Cidr {
    /// Every IPv4 address. Listeners must opt into this explicitly.
    pub const ANY: Cidr = Cidr {
        network: Ipv4Addr::UNSPECIFIED,
        prefix: 0,
    };

    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(Error::InvalidConfig(format!(
                "prefix /{prefix} is longer than 32 bits"
            )));
        }
        let network = Ipv4Addr::from(u32::from(addr) & Self::mask_bits(prefix));
        Ok(Self { network, prefix })
    }

    fn mask_bits(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn is_any(&self) -> bool {
        self.prefix == 0
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.network)
    }

    pub fn overlaps(&self, other: &Cidr) -> bool {
        let shorter = self.prefix.min(other.prefix);
        let mask = Self::mask_bits(shorter);
        u32::from(self.network) & mask == u32::from(other.network) & mask
    }

    /// Number of `/mask` sub-ranges this range can be cut into.
    pub fn subnet_capacity(&self, mask: u8) -> u32 {
        if mask < self.prefix || mask > 32 {
            return 0;
        }
        let bits = u32::from(mask - self.prefix);
        if bits >= 32 {
            u32::MAX
        } else {
            1u32 << bits
        }
    }

    /// The `index`-th `/mask` sub-range, counting from the bottom of the range.
    pub fn subnet(&self, mask: u8, index: u32) -> Option<Cidr> {
        if index >= self.subnet_capacity(mask) {
            return None;
        }
        let size = if mask == 0 { 0 } else { 1u64 << (32 - u32::from(mask)) };
        let base = u64::from(u32::from(self.network)) + u64::from(index) * size;
        let base = u32::try_from(base).ok()?;
        Some(Cidr {
            network: Ipv4Addr::from(base),
            prefix: mask,
        })
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("'{s}' is not an IPv4 CIDR"));
        let (addr, prefix) = s.trim().split_once('/').ok_or_else(invalid)?;
        let addr: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        Cidr::new(addr, prefix)
    }
}

impl TryFrom<String> for Cidr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(value: Cidr) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubnetKind {
    /// Routes to the internet directly; hosts the load balancer and the gateway.
    Public,
    /// Outbound only, through the shared gateway; hosts service replicas.
    Private,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Subnet {
    pub zone: String,
    pub kind: SubnetKind,
    pub cidr: Cidr,
}

/// Shared outbound gateway for private subnets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gateway {
    pub name: String,
    pub zone: String,
    pub public_subnet: Cidr,
}

/// Isolated network spread over failure zones. Planned once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkTopology {
    cidr: Cidr,
    subnet_mask: u8,
    subnets: Vec<Subnet>,
    gateways: Vec<Gateway>,
}

impl NetworkTopology {
    /// Cut `cidr` into one public and one private `/subnet_mask` subnet per
    /// zone, public ranges first, plus a single gateway in the first zone.
    pub fn plan(cidr: Cidr, zones: &[String], subnet_mask: u8) -> Result<Self> {
        if zones.is_empty() {
            return Err(Error::InvalidConfig("at least one zone is required".into()));
        }
        if subnet_mask > MAX_SUBNET_MASK {
            return Err(Error::InvalidConfig(format!(
                "subnet mask /{subnet_mask} is smaller than the /{MAX_SUBNET_MASK} minimum"
            )));
        }

        let zone_count = zones.len() as u32;
        let requested = zone_count.saturating_mul(2);
        let available = cidr.subnet_capacity(subnet_mask);
        if requested > available {
            return Err(Error::Capacity {
                cidr: cidr.to_string(),
                mask: subnet_mask,
                requested,
                available,
            });
        }

        let mut subnets = Vec::with_capacity(requested as usize);
        for (kind, offset) in [(SubnetKind::Public, 0), (SubnetKind::Private, zone_count)] {
            for (i, zone) in zones.iter().enumerate() {
                let index = offset + i as u32;
                let sub = cidr.subnet(subnet_mask, index).ok_or(Error::Capacity {
                    cidr: cidr.to_string(),
                    mask: subnet_mask,
                    requested,
                    available,
                })?;
                subnets.push(Subnet {
                    zone: zone.clone(),
                    kind,
                    cidr: sub,
                });
            }
        }

        let gateway = Gateway {
            name: "gateway-0".to_string(),
            zone: zones[0].clone(),
            public_subnet: subnets[0].cidr,
        };

        let topology = Self {
            cidr,
            subnet_mask,
            subnets,
            gateways: vec![gateway],
        };
        topology.check_invariants()?;
        Ok(topology)
    }

    pub fn cidr(&self) -> Cidr {
        self.cidr
    }

    pub fn subnet_mask(&self) -> u8 {
        self.subnet_mask
    }

    pub fn subnets(&self) -> &[Subnet] {
        &self.subnets
    }

    pub fn gateways(&self) -> &[Gateway] {
        &self.gateways
    }

    pub fn zones(&self) -> Vec<&str> {
        let mut zones: Vec<&str> = Vec::new();
        for s in &self.subnets {
            if !zones.contains(&s.zone.as_str()) {
                zones.push(&s.zone);
            }
        }
        zones
    }

    pub fn subnets_of(&self, kind: SubnetKind) -> impl Iterator<Item = &Subnet> {
        self.subnets.iter().filter(move |s| s.kind == kind)
    }

    fn check_invariants(&self) -> Result<()> {
        for zone in self.zones() {
            for kind in [SubnetKind::Public, SubnetKind::Private] {
                if !self.subnets.iter().any(|s| s.zone == zone && s.kind == kind) {
                    return Err(Error::InvalidConfig(format!(
                        "zone {zone} is missing a {kind:?} subnet"
                    )));
                }
            }
        }

        if self.subnets_of(SubnetKind::Private).next().is_some() && self.gateways.is_empty() {
            return Err(Error::InvalidConfig(
                "private subnets require an outbound gateway".into(),
            ));
        }

        for (i, a) in self.subnets.iter().enumerate() {
            for b in &self.subnets[i + 1..] {
                if a.cidr.overlaps(&b.cidr) {
                    return Err(Error::InvalidConfig(format!(
                        "subnets {} and {} overlap",
                        a.cidr, b.cidr
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zones(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("zone-{}", (b'a' + i as u8) as char)).collect()
    }

    #[test]
    fn test_parse_normalizes_host_bits() {
        let c: Cidr = "10.1.7.9/16".parse().unwrap();
        assert_eq!(c.to_string(), "10.1.0.0/16");
        assert!("10.1.0.0".parse::<Cidr>().is_err());
        assert!("10.1.0.0/33".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_three_zone_layout() {
        let cidr: Cidr = "10.1.0.0/16".parse().unwrap();
        let net = NetworkTopology::plan(cidr, &zones(3), 24).unwrap();

        assert_eq!(net.subnets_of(SubnetKind::Public).count(), 3);
        assert_eq!(net.subnets_of(SubnetKind::Private).count(), 3);
        assert_eq!(net.gateways().len(), 1);

        let ranges: Vec<String> = net.subnets().iter().map(|s| s.cidr.to_string()).collect();
        assert_eq!(
            ranges,
            vec![
                "10.1.0.0/24",
                "10.1.1.0/24",
                "10.1.2.0/24",
                "10.1.3.0/24",
                "10.1.4.0/24",
                "10.1.5.0/24"
            ]
        );
        assert_eq!(net.gateways()[0].public_subnet.to_string(), "10.1.0.0/24");
    }

    #[test]
    fn test_capacity_error() {
        let cidr: Cidr = "10.1.0.0/24".parse().unwrap();
        let err = NetworkTopology::plan(cidr, &zones(3), 26).unwrap_err();
        assert_eq!(
            err,
            Error::Capacity {
                cidr: "10.1.0.0/24".into(),
                mask: 26,
                requested: 6,
                available: 4,
            }
        );
    }

    #[test]
    fn test_mask_shorter_than_range_has_no_room() {
        let cidr: Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(matches!(
            NetworkTopology::plan(cidr, &zones(1), 20),
            Err(Error::Capacity { available: 0, .. })
        ));
    }

    #[test]
    fn test_overlap() {
        let a: Cidr = "10.0.0.0/16".parse().unwrap();
        let b: Cidr = "10.0.3.0/24".parse().unwrap();
        let c: Cidr = "10.1.0.0/24".parse().unwrap();
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!b.overlaps(&c));
        assert!(Cidr::ANY.contains("192.168.1.1".parse().unwrap()));
    }
}
