use std::{
    fmt::{self, Display, Write as _},
    net::{AddrParseError, IpAddr},
    num::ParseIntError,
    result::Result,
    str::FromStr,
};

use super::{Cidr, DecodeError, Endpoint, Key};

/// Stands in for the client private key in rendered configs.
pub const PRIVATE_KEY_PLACEHOLDER: &str = "<CLIENT_PRIVATE_KEY>";

/// A wg-quick style configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WgConfig {
    pub interface: WgConfigInterface,
    pub peers: Vec<WgConfigPeer>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgConfigInterface {
    // PrivateKey, `None` renders the placeholder
    pub private_key: Option<Key>,

    // Address
    pub address: Cidr,

    // ListenPort
    pub listen_port: Option<u16>,

    // DNS
    pub dns: Option<Vec<IpAddr>>,

    // MTU
    pub mtu: Option<u16>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgConfigPeer {
    // comment trailing the [Peer] header
    pub name: Option<String>,

    // PublicKey
    pub public_key: Key,

    // PresharedKey
    pub preshared_key: Option<Key>,

    // Endpoint
    pub endpoint: Option<Endpoint>,

    // AllowedIPs
    pub allowed_ips: Option<Vec<Cidr>>,

    // PersistentKeepalive
    pub persistent_keepalive: Option<u16>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unexpected line: {0}")]
    UnexpectedToken(String),

    #[error("key parse error: {0}")]
    KeyParseError(#[from] DecodeError),

    #[error("key must be 32 bytes, got {0}")]
    KeyLength(usize),

    #[error("addr parse error: {0}")]
    SocketAddrParseError(#[from] AddrParseError),

    #[error("invalid prefix length: {0}")]
    InvalidMask(u8),

    #[error("invalid endpoint: {0}")]
    EndpointParseError(String),

    #[error("expected char: {0}")]
    Expected(char),

    #[error("int parse error: {0}")]
    ParseIntError(#[from] ParseIntError),

    #[error("no interface section")]
    NoInterfaceSection,

    #[error("peer section without PublicKey")]
    MissingPublicKey,

    #[error("dump line has {0} fields")]
    DumpFieldCount(usize),
}

struct List<I>(Vec<I>);
impl<I: FromStr> FromStr for List<I> {
    type Err = I::Err;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut items = Vec::new();

        for s in s.split(',') {
            items.push(s.trim().parse()?);
        }

        Ok(List(items))
    }
}

struct Joined<'a, I>(&'a [I]);
impl<I: Display> Display for Joined<'_, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

enum WgPropKind {
    PublicKey,
    PresharedKey,
    Endpoint,
    AllowedIPs,
    PersistentKeepalive,
    PrivateKey,
    Address,
    ListenPort,
    DNS,
    MTU,
    Unknown,
}

impl FromStr for WgPropKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PublicKey" => WgPropKind::PublicKey,
            "PresharedKey" => WgPropKind::PresharedKey,
            "Endpoint" => WgPropKind::Endpoint,
            "AllowedIPs" => WgPropKind::AllowedIPs,
            "PersistentKeepalive" => WgPropKind::PersistentKeepalive,
            "PrivateKey" => WgPropKind::PrivateKey,
            "Address" => WgPropKind::Address,
            "ListenPort" => WgPropKind::ListenPort,
            "DNS" => WgPropKind::DNS,
            "MTU" => WgPropKind::MTU,
            _ => WgPropKind::Unknown,
        })
    }
}

enum Section {
    Preamble,
    Interface,
    Peer,
}

fn header_comment(rest: &str) -> Option<String> {
    let name = rest.trim().strip_prefix('#')?.trim();
    (!name.is_empty()).then(|| name.to_string())
}

impl WgConfigInterface {
    fn set(&mut self, prop: WgPropKind, value: &str) -> Result<(), ParseError> {
        match prop {
            WgPropKind::PrivateKey if value == PRIVATE_KEY_PLACEHOLDER => self.private_key = None,
            WgPropKind::PrivateKey => self.private_key = Some(value.parse()?),
            WgPropKind::Address => self.address = value.parse()?,
            WgPropKind::ListenPort => self.listen_port = Some(value.parse()?),
            WgPropKind::DNS => self.dns = Some(value.parse::<List<IpAddr>>()?.0),
            WgPropKind::MTU => self.mtu = Some(value.parse()?),
            _ => {}
        }
        Ok(())
    }
}

impl WgConfigPeer {
    fn set(&mut self, prop: WgPropKind, value: &str) -> Result<(), ParseError> {
        match prop {
            WgPropKind::PublicKey => self.public_key = value.parse()?,
            WgPropKind::PresharedKey => self.preshared_key = Some(value.parse()?),
            WgPropKind::Endpoint => self.endpoint = Some(value.parse()?),
            WgPropKind::AllowedIPs => self.allowed_ips = Some(value.parse::<List<Cidr>>()?.0),
            WgPropKind::PersistentKeepalive if value == "off" => self.persistent_keepalive = None,
            WgPropKind::PersistentKeepalive => self.persistent_keepalive = Some(value.parse()?),
            _ => {}
        }
        Ok(())
    }
}

impl WgConfig {
    pub fn parse_config(input: &str) -> Result<Self, ParseError> {
        let mut interface = None;
        let mut peers: Vec<WgConfigPeer> = Vec::new();
        let mut section = Section::Preamble;

        for line in input.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.starts_with("[Interface]") {
                interface = Some(WgConfigInterface::default());
                section = Section::Interface;
                continue;
            }

            if let Some(rest) = line.strip_prefix("[Peer]") {
                peers.push(WgConfigPeer {
                    name: header_comment(rest),
                    ..Default::default()
                });
                section = Section::Peer;
                continue;
            }

            let (prop, value) = line.split_once('=').ok_or(ParseError::Expected('='))?;
            let prop: WgPropKind = prop.trim().parse()?;
            let value = value.trim();

            match (&section, interface.as_mut(), peers.last_mut()) {
                (Section::Interface, Some(iface), _) => iface.set(prop, value)?,
                (Section::Peer, _, Some(peer)) => peer.set(prop, value)?,
                _ => return Err(ParseError::UnexpectedToken(line.to_string())),
            }
        }

        if peers.iter().any(|p| p.public_key.is_zero()) {
            return Err(ParseError::MissingPublicKey);
        }

        Ok(WgConfig {
            interface: interface.ok_or(ParseError::NoInterfaceSection)?,
            peers,
        })
    }
}

impl Display for WgConfigInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[Interface]")?;
        match &self.private_key {
            Some(key) => writeln!(f, "PrivateKey = {key}")?,
            None => writeln!(f, "PrivateKey = {PRIVATE_KEY_PLACEHOLDER}")?,
        }
        writeln!(f, "Address = {}", self.address)?;
        if let Some(port) = self.listen_port {
            writeln!(f, "ListenPort = {port}")?;
        }
        if let Some(dns) = self.dns.as_deref().filter(|d| !d.is_empty()) {
            writeln!(f, "DNS = {}", Joined(dns))?;
        }
        if let Some(mtu) = self.mtu {
            writeln!(f, "MTU = {mtu}")?;
        }
        Ok(())
    }
}

impl Display for WgConfigPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => writeln!(f, "[Peer] # {name}")?,
            None => writeln!(f, "[Peer]")?,
        }
        writeln!(f, "PublicKey = {}", self.public_key)?;
        if let Some(psk) = &self.preshared_key {
            writeln!(f, "PresharedKey = {psk}")?;
        }
        if let Some(endpoint) = &self.endpoint {
            writeln!(f, "Endpoint = {endpoint}")?;
        }
        if let Some(ips) = self.allowed_ips.as_deref().filter(|ips| !ips.is_empty()) {
            writeln!(f, "AllowedIPs = {}", Joined(ips))?;
        }
        if let Some(keepalive) = self.persistent_keepalive {
            writeln!(f, "PersistentKeepalive = {keepalive}")?;
        }
        Ok(())
    }
}

impl Display for WgConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = self.interface.to_string();
        for peer in &self.peers {
            out.push('\n');
            write!(out, "{peer}")?;
        }
        f.write_str(&out)
    }
}
