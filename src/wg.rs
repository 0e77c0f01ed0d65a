use base64::prelude::*;
use bincode::{Decode, Encode};
use config::ParseError;
use instance::WgInterfaceInfo;
use peer::WgPeerInfo;
use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
};

pub mod cmd;
pub mod config;
pub mod instance;
pub mod memory;
pub mod peer;

pub type DecodeError = base64::DecodeSliceError;

pub const KEY_LENGTH: usize = 32;

#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Key([u8; KEY_LENGTH]);

impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; KEY_LENGTH]> for Key {
    fn from(bytes: [u8; KEY_LENGTH]) -> Self {
        Key(bytes)
    }
}

impl FromStr for Key {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut inner = [0u8; KEY_LENGTH];
        let len = BASE64_STANDARD.decode_slice(s, &mut inner)?;
        if len != KEY_LENGTH {
            return Err(ParseError::KeyLength(len));
        }

        Ok(Key(inner))
    }
}

impl Key {
    pub fn to_bytes(self) -> [u8; KEY_LENGTH] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", BASE64_STANDARD.encode(self))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({self})")
    }
}

/// A peer as the tunnel runtime sees it: the key it may handshake with and
/// the address it is allowed to source traffic from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdmittedPeer(pub Key, pub Cidr);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub struct Cidr {
    pub ip: IpAddr,
    pub mask: u8,
}

impl Default for Cidr {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            mask: 0,
        }
    }
}

impl Cidr {
    /// Single-host prefix (/32 or /128) for `ip`.
    pub fn host(ip: IpAddr) -> Self {
        Cidr {
            ip,
            mask: max_mask(ip),
        }
    }

    pub fn is_host(&self) -> bool {
        self.mask == max_mask(self.ip)
    }

    pub fn network(&self) -> Cidr {
        Cidr {
            ip: from_bits(to_bits(self.ip) & !self.host_mask(), self.ip),
            mask: self.mask,
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        if ip.is_ipv4() != self.ip.is_ipv4() {
            return false;
        }

        to_bits(ip) & !self.host_mask() == to_bits(self.ip) & !self.host_mask()
    }

    /// First and last address a peer may be assigned within this prefix.
    /// IPv4 excludes the network and broadcast addresses, IPv6 only the
    /// subnet-router anycast (all-zero host) address.
    pub fn host_range(&self) -> Option<(IpAddr, IpAddr)> {
        let network = to_bits(self.ip) & !self.host_mask();
        let last = network | self.host_mask();
        let (first, last) = match self.ip {
            IpAddr::V4(_) => (network.checked_add(1)?, last.checked_sub(1)?),
            IpAddr::V6(_) => (network.checked_add(1)?, last),
        };

        if self.host_mask() == 0 || first > last {
            return None;
        }

        Some((from_bits(first, self.ip), from_bits(last, self.ip)))
    }

    fn host_mask(&self) -> u128 {
        let host_bits = u32::from(max_mask(self.ip).saturating_sub(self.mask));
        if host_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << host_bits) - 1
        }
    }
}

pub(crate) fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub(crate) fn from_bits(bits: u128, family: IpAddr) -> IpAddr {
    match family {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::from(bits as u32)),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::from(bits)),
    }
}

fn max_mask(ip: IpAddr) -> u8 {
    if ip.is_ipv4() { 32 } else { 128 }
}

impl FromStr for Cidr {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip, mask) = s.split_once('/').unwrap_or((s, ""));
        let ip: IpAddr = ip.trim().parse()?;
        let mask = mask.trim();

        let mask: u8 = if !mask.is_empty() {
            mask.parse()?
        } else {
            max_mask(ip)
        };

        if mask > max_mask(ip) {
            return Err(ParseError::InvalidMask(mask));
        }

        Ok(Cidr { ip, mask })
    }
}

impl std::fmt::Display for Cidr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.ip, self.mask)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum Endpoint {
    Domain(String),
    Ip(SocketAddr),
}

impl Endpoint {
    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Domain(dom) => dom.rsplit_once(':').and_then(|(_, p)| p.parse().ok()),
            Endpoint::Ip(addr) => Some(addr.port()),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Domain(dom) => write!(f, "{dom}"),
            Endpoint::Ip(addr) => write!(f, "{addr}"),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(addr) = s.parse() {
            return Ok(Self::Ip(addr));
        }

        // a bare IPv6 host would be ambiguous with the port; it must come bracketed
        match s.rsplit_once(':') {
            Some((host, port))
                if !host.is_empty()
                    && !host.contains(|c: char| c.is_whitespace() || matches!(c, ':' | '[' | ']'))
                    && port.parse::<u16>().is_ok() =>
            {
                Ok(Self::Domain(s.to_string()))
            }
            _ => Err(ParseError::EndpointParseError(s.to_string())),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgState {
    pub interface: WgInterfaceInfo,
    pub peers: Vec<WgPeerInfo>,
}

/// The tunnel runtime the service drives. It admits exactly the peers handed
/// to `apply_peer_set` and reports per-peer handshake and transfer data.
pub trait TunnelRuntime {
    type Error;

    /// Replaces the admitted peer set. Returns only once the runtime has
    /// dropped every key missing from `peers`.
    fn apply_peer_set(&mut self, peers: &[AdmittedPeer]) -> Result<(), Self::Error>;

    fn set_private_key(&mut self, key: &Key) -> Result<(), Self::Error>;

    fn dump(&self) -> Result<WgState, Self::Error>;
}
