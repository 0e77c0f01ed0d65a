use std::str::FromStr;

use super::{Key, config::ParseError};

/// Interface row of `wg show <iface> dump`. The private key column is
/// skipped and never kept in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WgInterfaceInfo {
    // PublicKey
    pub public_key: Option<Key>,

    // ListenPort
    pub listen_port: Option<u16>,

    // FwMark
    pub fwmark: Option<u32>,
}

impl FromStr for WgInterfaceInfo {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split('\t').map(str::trim).collect();
        let [_, public_key, listen_port, fwmark] = fields[..] else {
            return Err(ParseError::DumpFieldCount(fields.len()));
        };

        Ok(WgInterfaceInfo {
            public_key: match public_key {
                "(none)" => None,
                key => Some(key.parse()?),
            },
            listen_port: match listen_port.parse::<u16>()? {
                0 => None,
                port => Some(port),
            },
            fwmark: match fwmark {
                "off" => None,
                mark => Some(match mark.strip_prefix("0x") {
                    Some(hex) => u32::from_str_radix(hex, 16)?,
                    None => mark.parse()?,
                }),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::wg::Key;

    use super::WgInterfaceInfo;

    #[test]
    fn parses_interface_row() {
        let public = Key::from([8; 32]);
        let line = format!("{}\t{public}\t51820\toff", Key::from([6; 32]));

        let info: WgInterfaceInfo = line.parse().unwrap();
        assert_eq!(info.public_key, Some(public));
        assert_eq!(info.listen_port, Some(51820));
        assert_eq!(info.fwmark, None);
    }
}
