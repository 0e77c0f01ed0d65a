use std::{collections::HashSet, net::IpAddr, str::FromStr};

use bincode::{Decode, Encode};
use uuid::Uuid;

use crate::{
    error::Error,
    wg::{AdmittedPeer, Cidr, Key, from_bits, to_bits},
};

pub const MAX_NAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct PeerId([u8; 16]);

impl PeerId {
    pub fn random() -> Self {
        PeerId(Uuid::new_v4().into_bytes())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).hyphenated())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(|id| PeerId(id.into_bytes()))
            .map_err(|err| Error::Validation(format!("malformed peer id {s:?}: {err}")))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Peer {
    pub id: PeerId,
    pub name: String,
    pub public_key: Key,
    pub allowed_ip: Cidr,
    pub created_at: u64,
}

impl Peer {
    pub fn admitted(&self) -> AdmittedPeer {
        AdmittedPeer(self.public_key, self.allowed_ip)
    }
}

pub fn validate_name(name: &str) -> Result<String, Error> {
    let name = name.trim();

    if name.is_empty() {
        return Err(Error::Validation("peer name is empty".into()));
    }
    if name.chars().count() > MAX_NAME_LENGTH {
        return Err(Error::Validation(format!(
            "peer name is longer than {MAX_NAME_LENGTH} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(Error::Validation("peer name contains control characters".into()));
    }

    Ok(name.to_string())
}

/// Peers in creation order plus the address plan they are allocated from.
#[derive(Debug, Clone)]
pub struct PeerRegistry {
    subnet: Cidr,
    server_ip: IpAddr,
    peers: Vec<Peer>,
}

impl PeerRegistry {
    /// `server` is the server's own address with the subnet prefix.
    pub fn new(server: Cidr) -> Self {
        Self {
            subnet: server.network(),
            server_ip: server.ip,
            peers: Vec::new(),
        }
    }

    /// Rebuilds a registry from stored entries, re-checking every invariant.
    pub fn with_peers(server: Cidr, peers: Vec<Peer>) -> Result<Self, Error> {
        let mut registry = Self::new(server);
        for peer in peers {
            registry.check_free(&peer.public_key, peer.allowed_ip.ip)?;
            if !registry.subnet.contains(peer.allowed_ip.ip) {
                return Err(Error::Conflict(format!(
                    "peer {} has {} outside {}",
                    peer.id, peer.allowed_ip, registry.subnet
                )));
            }
            registry.peers.push(peer);
        }
        Ok(registry)
    }

    pub fn subnet(&self) -> Cidr {
        self.subnet
    }

    pub fn add_peer(&mut self, name: &str, public_key: Key, now: u64) -> Result<Peer, Error> {
        let name = validate_name(name)?;
        let allowed_ip = self.allocate()?;
        self.insert(name, public_key, allowed_ip, now)
    }

    /// Registers an already existing public key, keeping `requested` when it
    /// is a free host address inside the subnet.
    pub fn adopt(
        &mut self,
        name: &str,
        public_key: Key,
        requested: Option<IpAddr>,
        now: u64,
    ) -> Result<Peer, Error> {
        let name = validate_name(name)?;

        let allowed_ip = match requested {
            Some(ip) if self.is_assignable(ip) => Cidr::host(ip),
            Some(ip) => {
                log::warn!("{ip} is not assignable in {}, allocating for {name}", self.subnet);
                self.allocate()?
            }
            None => self.allocate()?,
        };

        self.insert(name, public_key, allowed_ip, now)
    }

    /// Fails with `NotFound` when `id` is absent; nothing is changed then.
    pub fn remove_peer(&mut self, id: PeerId) -> Result<Peer, Error> {
        let idx = self
            .peers
            .iter()
            .position(|p| p.id == id)
            .ok_or(Error::NotFound(id))?;

        Ok(self.peers.remove(idx))
    }

    pub fn list_peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    pub fn find_by_key(&self, key: &Key) -> Option<&Peer> {
        self.peers.iter().find(|p| p.public_key == *key)
    }

    pub fn peer_set(&self) -> Vec<AdmittedPeer> {
        self.peers.iter().map(Peer::admitted).collect()
    }

    fn insert(
        &mut self,
        name: String,
        public_key: Key,
        allowed_ip: Cidr,
        now: u64,
    ) -> Result<Peer, Error> {
        self.check_free(&public_key, allowed_ip.ip)?;

        let peer = Peer {
            id: PeerId::random(),
            name,
            public_key,
            allowed_ip,
            created_at: now,
        };
        self.peers.push(peer.clone());
        Ok(peer)
    }

    fn check_free(&self, public_key: &Key, ip: IpAddr) -> Result<(), Error> {
        if public_key.is_zero() {
            return Err(Error::Validation("all-zero public key".into()));
        }
        if ip == self.server_ip {
            return Err(Error::Conflict(format!("{ip} is the server address")));
        }
        for peer in &self.peers {
            if peer.public_key == *public_key {
                return Err(Error::Conflict(format!(
                    "public key already belongs to peer {}",
                    peer.id
                )));
            }
            if peer.allowed_ip.ip == ip {
                return Err(Error::Conflict(format!("{ip} already belongs to peer {}", peer.id)));
            }
        }
        Ok(())
    }

    fn is_assignable(&self, ip: IpAddr) -> bool {
        let Some((first, last)) = self.subnet.host_range() else {
            return false;
        };

        self.subnet.contains(ip)
            && (to_bits(first)..=to_bits(last)).contains(&to_bits(ip))
            && ip != self.server_ip
            && self.peers.iter().all(|p| p.allowed_ip.ip != ip)
    }

    /// Lowest free host address. Freed slots are reused before the scan
    /// moves past them.
    fn allocate(&self) -> Result<Cidr, Error> {
        let (first, last) = self
            .subnet
            .host_range()
            .ok_or(Error::ResourceExhausted(self.subnet))?;
        let used: HashSet<IpAddr> = self.peers.iter().map(|p| p.allowed_ip.ip).collect();

        let (mut candidate, last) = (to_bits(first), to_bits(last));
        loop {
            let ip = from_bits(candidate, self.subnet.ip);
            if ip != self.server_ip && !used.contains(&ip) {
                return Ok(Cidr::host(ip));
            }
            if candidate == last {
                return Err(Error::ResourceExhausted(self.subnet));
            }
            candidate += 1;
        }
    }
}
