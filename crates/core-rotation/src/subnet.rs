//! Source subnet model and random address generation.

use rand::{rngs::OsRng, RngCore};
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

const ADDR_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubnetError {
    #[error("invalid CIDR '{0}'")]
    InvalidCidr(String),

    #[error("'{0}' is not an IPv6 network")]
    NotIpv6(String),

    #[error("prefix length {0} out of range (max 128)")]
    PrefixLength(u8),

    #[error("subnet detection failed: {0}")]
    Detection(String),

    #[error("no subnet detected, configure one manually (e.g. 2001:db8::/48)")]
    NotFound,
}

/// An IPv6 block used as the pool of local source addresses.
///
/// Immutable once built. The prefix is stored already masked, so two subnets
/// written differently (`2001:db8::1/48` and `2001:db8::/48`) compare equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    prefix: [u8; ADDR_LEN],
    mask: [u8; ADDR_LEN],
    prefix_len: u8,
}

impl Subnet {
    pub fn new(addr: Ipv6Addr, prefix_len: u8) -> Result<Self, SubnetError> {
        if prefix_len > 128 {
            return Err(SubnetError::PrefixLength(prefix_len));
        }
        let mask = mask_bytes(prefix_len);
        let mut prefix = addr.octets();
        for (p, m) in prefix.iter_mut().zip(mask.iter()) {
            *p &= m;
        }
        Ok(Self {
            prefix,
            mask,
            prefix_len,
        })
    }

    pub fn network(&self) -> Ipv6Addr {
        Ipv6Addr::from(self.prefix)
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn mask(&self) -> &[u8; ADDR_LEN] {
        &self.mask
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        addr.octets()
            .iter()
            .zip(self.mask.iter())
            .zip(self.prefix.iter())
            .all(|((a, m), p)| a & m == *p)
    }

    /// Draw a random address inside this subnet.
    ///
    /// Returns `None` only if the OS random source fails; callers treat that as
    /// "connect without binding".
    pub fn generate(&self) -> Option<Ipv6Addr> {
        generate_in(&self.prefix, &self.mask)
    }
}

impl FromStr for Subnet {
    type Err = SubnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| SubnetError::InvalidCidr(s.to_string()))?;
        let len: u8 = len
            .parse()
            .map_err(|_| SubnetError::InvalidCidr(s.to_string()))?;
        match addr.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => Self::new(v6, len),
            Ok(IpAddr::V4(_)) => Err(SubnetError::NotIpv6(s.to_string())),
            Err(_) => Err(SubnetError::InvalidCidr(s.to_string())),
        }
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix_len)
    }
}

/// Anything that can hand out a local address to bind an outbound socket to.
pub trait SourceAddressGenerator: Send + Sync {
    fn generate(&self) -> Option<Ipv6Addr>;
}

impl SourceAddressGenerator for Subnet {
    fn generate(&self) -> Option<Ipv6Addr> {
        Subnet::generate(self)
    }
}

impl<T: SourceAddressGenerator> SourceAddressGenerator for Option<T> {
    fn generate(&self) -> Option<Ipv6Addr> {
        self.as_ref().and_then(SourceAddressGenerator::generate)
    }
}

/// `(prefix & mask) | (random & !mask)`, byte by byte.
///
/// Both slices must be exactly 16 bytes; anything else yields `None`.
pub fn generate_in(prefix: &[u8], mask: &[u8]) -> Option<Ipv6Addr> {
    if prefix.len() != ADDR_LEN || mask.len() != ADDR_LEN {
        return None;
    }
    let mut random = [0u8; ADDR_LEN];
    OsRng.try_fill_bytes(&mut random).ok()?;

    let mut out = [0u8; ADDR_LEN];
    for i in 0..ADDR_LEN {
        out[i] = (prefix[i] & mask[i]) | (random[i] & !mask[i]);
    }
    Some(Ipv6Addr::from(out))
}

fn mask_bytes(prefix_len: u8) -> [u8; ADDR_LEN] {
    let bits = u128::MAX
        .checked_shl(128 - u32::from(prefix_len))
        .unwrap_or(0);
    bits.to_be_bytes()
}
