use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::{
    error::Error,
    keystore::PrivateKey,
    registry::Peer,
    server::ServerConfig,
    wg::{
        Cidr,
        config::{WgConfig, WgConfigInterface, WgConfigPeer},
    },
};

const FULL_TUNNEL: [Cidr; 2] = [
    Cidr {
        ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        mask: 0,
    },
    Cidr {
        ip: IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        mask: 0,
    },
];

/// Client-side configuration for `peer`, routing everything through the
/// server. The private key is left out.
pub fn client_config(peer: &Peer, server: &ServerConfig) -> WgConfig {
    WgConfig {
        interface: WgConfigInterface {
            private_key: None,
            address: peer.allowed_ip,
            listen_port: None,
            dns: Some(server.dns.clone()),
            mtu: Some(server.mtu),
        },
        peers: vec![WgConfigPeer {
            public_key: server.public_key(),
            endpoint: Some(server.endpoint.clone()),
            allowed_ips: Some(FULL_TUNNEL.to_vec()),
            persistent_keepalive: Some(server.persistent_keepalive).filter(|k| *k != 0),
            ..Default::default()
        }],
    }
}

pub fn render(peer: &Peer, server: &ServerConfig) -> String {
    client_config(peer, server).to_string()
}

/// The one-time variant handed out at issuance, with the private key filled in.
pub fn render_with_key(
    peer: &Peer,
    server: &ServerConfig,
    private_key: &PrivateKey,
) -> Result<String, Error> {
    if private_key.public_key() != peer.public_key {
        return Err(Error::Validation(format!(
            "private key does not belong to peer {}",
            peer.id
        )));
    }

    let mut config = client_config(peer, server);
    config.interface.private_key = Some(private_key.reveal());
    Ok(config.to_string())
}

#[cfg(test)]
mod tests {
    use crate::{
        keystore::KeyStore,
        registry::{Peer, PeerId},
        server::ServerConfig,
        wg::{Key, config::WgConfig},
    };

    use super::{client_config, render, render_with_key};

    fn fixture() -> (Peer, ServerConfig) {
        let server = ServerConfig::new(Key::from([3; 32]), "vpn.example.com:51820".parse().unwrap());
        let peer = Peer {
            id: "6f1c1f3e-52a4-4a8e-9d0c-3a3c5e7b9d11".parse::<PeerId>().unwrap(),
            name: "Laptop".into(),
            public_key: Key::from([4; 32]),
            allowed_ip: "10.8.0.2/32".parse().unwrap(),
            created_at: 0,
        };
        (peer, server)
    }

    #[test]
    fn renders_the_client_config() {
        let (peer, server) = fixture();

        let expected = format!(
            "[Interface]
PrivateKey = <CLIENT_PRIVATE_KEY>
Address = 10.8.0.2/32
DNS = 1.1.1.1, 1.0.0.1
MTU = 1420

[Peer]
PublicKey = {}
Endpoint = vpn.example.com:51820
AllowedIPs = 0.0.0.0/0, ::/0
PersistentKeepalive = 25
",
            server.public_key()
        );

        assert_eq!(render(&peer, &server), expected);
    }

    #[test]
    fn output_is_byte_stable() {
        let (peer, server) = fixture();
        let copy = (peer.clone(), server.clone());

        assert_eq!(render(&peer, &server), render(&copy.0, &copy.1));
    }

    #[test]
    fn parses_back_to_the_same_structure() {
        let (peer, server) = fixture();

        let parsed = WgConfig::parse_config(&render(&peer, &server)).unwrap();
        assert_eq!(parsed, client_config(&peer, &server));
    }

    #[test]
    fn never_contains_the_issued_private_key() {
        let (mut peer, server) = fixture();
        let (public, private) = KeyStore::new().issue().unwrap();
        peer.public_key = public;

        let text = render(&peer, &server);
        assert!(!text.contains(&private.reveal().to_string()));
        assert!(!text.contains(&server.private_key.to_string()));
    }

    #[test]
    fn one_time_variant_checks_the_key() {
        let (mut peer, server) = fixture();
        let (public, private) = KeyStore::new().issue().unwrap();

        assert!(render_with_key(&peer, &server, &private).is_err());

        peer.public_key = public;
        let text = render_with_key(&peer, &server, &private).unwrap();
        let parsed = WgConfig::parse_config(&text).unwrap();
        assert_eq!(parsed.interface.private_key, Some(private.reveal()));
    }
}
