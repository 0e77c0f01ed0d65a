use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use bincode::{Decode, Encode};

use crate::{
    error::Error,
    keystore,
    tracker::DEFAULT_LIVENESS_WINDOW,
    wg::{Cidr, Endpoint, Key},
};

pub const DEFAULT_ADDRESS: Cidr = Cidr {
    ip: IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1)),
    mask: 24,
};
pub const DEFAULT_LISTEN_PORT: u16 = 51820;
pub const DEFAULT_DNS: [IpAddr; 2] = [
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
    IpAddr::V4(Ipv4Addr::new(1, 0, 0, 1)),
];
pub const DEFAULT_MTU: u16 = 1420;
pub const DEFAULT_KEEPALIVE: u16 = 25;

/// The deployment's own tunnel endpoint. `address` is the server's address
/// inside the VPN and carries the subnet prefix, e.g. `10.8.0.1/24`.
#[derive(Clone, PartialEq, Eq, Encode, Decode)]
pub struct ServerConfig {
    pub private_key: Key,
    pub address: Cidr,
    pub endpoint: Endpoint,
    pub listen_port: u16,
    pub dns: Vec<IpAddr>,
    pub mtu: u16,
    pub persistent_keepalive: u16,
    /// Seconds without a handshake before a peer counts as disconnected.
    pub liveness_window: u64,
}

impl ServerConfig {
    pub fn new(private_key: Key, endpoint: Endpoint) -> Self {
        Self {
            private_key,
            address: DEFAULT_ADDRESS,
            listen_port: endpoint.port().unwrap_or(DEFAULT_LISTEN_PORT),
            endpoint,
            dns: DEFAULT_DNS.to_vec(),
            mtu: DEFAULT_MTU,
            persistent_keepalive: DEFAULT_KEEPALIVE,
            liveness_window: DEFAULT_LIVENESS_WINDOW.as_secs(),
        }
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window)
    }

    pub fn public_key(&self) -> Key {
        keystore::public_key_of(&self.private_key)
    }

    /// The VPN subnet peers are allocated from.
    pub fn subnet(&self) -> Cidr {
        self.address.network()
    }

    pub fn validate(&self) -> Result<(), Error> {
        let (first, last) = self.address.host_range().ok_or_else(|| {
            Error::Validation(format!("{} leaves no room for peers", self.address))
        })?;

        let ip = crate::wg::to_bits(self.address.ip);
        if ip < crate::wg::to_bits(first) || ip > crate::wg::to_bits(last) {
            return Err(Error::Validation(format!(
                "{} is not a usable host address",
                self.address
            )));
        }

        if self.mtu < 1280 {
            return Err(Error::Validation(format!("MTU {} is below 1280", self.mtu)));
        }

        if self.liveness_window == 0 {
            return Err(Error::Validation("liveness window must be positive".into()));
        }

        Ok(())
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("public_key", &self.public_key())
            .field("address", &self.address)
            .field("endpoint", &self.endpoint)
            .field("listen_port", &self.listen_port)
            .field("dns", &self.dns)
            .field("mtu", &self.mtu)
            .field("persistent_keepalive", &self.persistent_keepalive)
            .field("liveness_window", &self.liveness_window)
            .finish()
    }
}
