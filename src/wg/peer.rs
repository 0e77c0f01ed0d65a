use std::str::FromStr;

use super::{Cidr, Endpoint, Key, config::ParseError};

const NONE: &str = "(none)";

/// One peer row of `wg show <iface> dump`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgPeerInfo {
    // PublicKey
    pub public_key: Key,

    // PresharedKey
    pub preshared_key: Option<Key>,

    // Endpoint
    pub endpoint: Option<Endpoint>,

    // AllowedIPs
    pub allowed_ips: Vec<Cidr>,

    // LatestHandshake, unix seconds
    pub latest_handshake: Option<u64>,

    // Transfer (rx, tx), cumulative since the peer was added
    pub transfer: (u64, u64),

    // PersistentKeepalive
    pub persistent_keepalive: Option<u16>,
}

fn optional<T: FromStr>(field: &str) -> Result<Option<T>, T::Err> {
    match field {
        NONE | "off" => Ok(None),
        field => field.parse().map(Some),
    }
}

impl FromStr for WgPeerInfo {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let [key, psk, endpoint, allowed_ips, handshake, rx, tx, keepalive] = fields[..] else {
            return Err(ParseError::DumpFieldCount(fields.len()));
        };

        let allowed_ips = match allowed_ips {
            NONE | "" => Vec::new(),
            list => list
                .split(',')
                .map(|s| s.parse())
                .collect::<Result<_, _>>()?,
        };

        Ok(WgPeerInfo {
            public_key: key.parse()?,
            preshared_key: optional(psk)?,
            endpoint: optional(endpoint)?,
            allowed_ips,
            latest_handshake: Some(handshake.parse::<u64>()?).filter(|ts| *ts != 0),
            transfer: (rx.parse()?, tx.parse()?),
            persistent_keepalive: optional(keepalive)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::wg::{Key, config::ParseError};

    use super::WgPeerInfo;

    #[test]
    fn parses_dump_row() {
        let key = Key::from([4; 32]);
        let line = format!(
            "{key}\t(none)\t198.51.100.7:51000\t10.8.0.2/32\t1700000000\t4096\t2048\t25"
        );

        let info: WgPeerInfo = line.parse().unwrap();
        assert_eq!(info.public_key, key);
        assert_eq!(info.preshared_key, None);
        assert_eq!(info.endpoint.unwrap().to_string(), "198.51.100.7:51000");
        assert_eq!(info.allowed_ips, vec!["10.8.0.2/32".parse().unwrap()]);
        assert_eq!(info.latest_handshake, Some(1_700_000_000));
        assert_eq!(info.transfer, (4096, 2048));
        assert_eq!(info.persistent_keepalive, Some(25));
    }

    #[test]
    fn peer_that_never_connected() {
        let line = format!("{}\t(none)\t(none)\t(none)\t0\t0\t0\toff", Key::from([4; 32]));

        let info: WgPeerInfo = line.parse().unwrap();
        assert_eq!(info.endpoint, None);
        assert!(info.allowed_ips.is_empty());
        assert_eq!(info.latest_handshake, None);
        assert_eq!(info.persistent_keepalive, None);
    }

    #[test]
    fn short_row_is_rejected() {
        assert!(matches!(
            "abc\t(none)".parse::<WgPeerInfo>(),
            Err(ParseError::DumpFieldCount(2))
        ));
    }
}
