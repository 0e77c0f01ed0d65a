use std::{
    collections::HashSet,
    io::Write,
    process::{Command, Stdio},
    str::FromStr,
};

use crate::error::Error;

use super::{AdmittedPeer, Key, TunnelRuntime, WgState, config::ParseError};

/// Drives a kernel or userspace WireGuard interface through `wg(8)`.
pub struct WgCmdBackend {
    iface: String,
}

impl WgCmdBackend {
    pub(crate) fn new(iface: impl Into<String>) -> Self {
        Self {
            iface: iface.into(),
        }
    }

    fn wg(&self, args: &[&str]) -> Result<String, Error> {
        let out = Command::new("wg").args(args).output()?;

        if !out.status.success() {
            log::warn!(
                "wg {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
            return Err(Error::WgCommandFail(out.status.code()));
        }

        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn current_peers(&self) -> Result<HashSet<Key>, Error> {
        self.wg(&["show", &self.iface, "peers"])?
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| Key::from_str(line.trim()).map_err(Error::from))
            .collect()
    }
}

impl TunnelRuntime for WgCmdBackend {
    type Error = Error;

    fn apply_peer_set(&mut self, peers: &[AdmittedPeer]) -> Result<(), Self::Error> {
        let wanted: HashSet<Key> = peers.iter().map(|p| p.0).collect();

        // removals go first so a revoked key is gone before anything else changes
        for stale in self.current_peers()?.difference(&wanted) {
            let key = stale.to_string();
            self.wg(&["set", &self.iface, "peer", &key, "remove"])?;
            log::info!("runtime dropped peer {key}");
        }

        for AdmittedPeer(key, allowed_ip) in peers {
            let (key, allowed_ip) = (key.to_string(), allowed_ip.to_string());
            self.wg(&["set", &self.iface, "peer", &key, "allowed-ips", &allowed_ip])?;
        }

        Ok(())
    }

    fn set_private_key(&mut self, key: &Key) -> Result<(), Self::Error> {
        let mut child = Command::new("wg")
            .args(["set", &self.iface, "private-key", "/dev/stdin"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            writeln!(stdin, "{key}")?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::WgCommandFail(status.code()));
        }

        Ok(())
    }

    fn dump(&self) -> Result<WgState, Self::Error> {
        let table = self.wg(&["show", &self.iface, "dump"])?;
        let mut lines = table.lines().filter(|line| !line.trim().is_empty());

        let interface = lines
            .next()
            .ok_or(ParseError::DumpFieldCount(0))?
            .parse()?;

        let peers = lines
            .map(|line| line.parse())
            .collect::<Result<_, ParseError>>()?;

        Ok(WgState { interface, peers })
    }
}
