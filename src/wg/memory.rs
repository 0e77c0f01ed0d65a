use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::{error::Error, keystore};

use super::{AdmittedPeer, Key, TunnelRuntime, WgState, instance::WgInterfaceInfo, peer::WgPeerInfo};

#[derive(Debug, Default)]
struct Inner {
    public_key: Option<Key>,
    listen_port: Option<u16>,
    peers: Vec<AdmittedPeer>,
    activity: HashMap<Key, (u64, u64, u64)>,
    applies: usize,
    fail_applies: usize,
}

/// In-process tunnel runtime. Handles are cheap clones of the same state, so
/// one can be handed to the service while another feeds it traffic.
#[derive(Debug, Default, Clone)]
pub struct MemoryRuntime {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRuntime {
    pub fn new(listen_port: u16) -> Self {
        let runtime = Self::default();
        runtime.lock().listen_port = Some(listen_port);
        runtime
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulates a handshake plus traffic from `key`. Keys outside the
    /// admitted set are refused, the way a revoked peer's handshake fails.
    #[cfg(test)]
    pub fn record_activity(&self, key: Key, handshake: u64, rx: u64, tx: u64) -> bool {
        let mut inner = self.lock();
        if !inner.peers.iter().any(|p| p.0 == key) {
            return false;
        }

        let entry = inner.activity.entry(key).or_insert((0, 0, 0));
        entry.0 = entry.0.max(handshake);
        entry.1 += rx;
        entry.2 += tx;
        true
    }

    #[cfg(test)]
    pub fn peers(&self) -> Vec<AdmittedPeer> {
        self.lock().peers.clone()
    }

    #[cfg(test)]
    pub fn public_key(&self) -> Option<Key> {
        self.lock().public_key
    }

    #[cfg(test)]
    pub fn applies(&self) -> usize {
        self.lock().applies
    }

    #[cfg(test)]
    pub fn fail_next_apply(&self) {
        self.lock().fail_applies += 1;
    }
}

impl TunnelRuntime for MemoryRuntime {
    type Error = Error;

    fn apply_peer_set(&mut self, peers: &[AdmittedPeer]) -> Result<(), Self::Error> {
        let mut inner = self.lock();
        if inner.fail_applies > 0 {
            inner.fail_applies -= 1;
            return Err(Error::WgCommandFail(None));
        }

        inner.activity.retain(|key, _| peers.iter().any(|p| p.0 == *key));
        inner.peers = peers.to_vec();
        inner.applies += 1;
        log::debug!("peer set #{} admits {} peers", inner.applies, peers.len());
        Ok(())
    }

    fn set_private_key(&mut self, key: &Key) -> Result<(), Self::Error> {
        self.lock().public_key = Some(keystore::public_key_of(key));
        Ok(())
    }

    fn dump(&self) -> Result<WgState, Self::Error> {
        let inner = self.lock();

        let peers = inner
            .peers
            .iter()
            .map(|AdmittedPeer(key, allowed_ip)| {
                let (handshake, rx, tx) = inner.activity.get(key).copied().unwrap_or_default();
                WgPeerInfo {
                    public_key: *key,
                    allowed_ips: vec![*allowed_ip],
                    latest_handshake: Some(handshake).filter(|ts| *ts != 0),
                    transfer: (rx, tx),
                    ..Default::default()
                }
            })
            .collect();

        Ok(WgState {
            interface: WgInterfaceInfo {
                public_key: inner.public_key,
                listen_port: inner.listen_port,
                fwmark: None,
            },
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::wg::{AdmittedPeer, Key, TunnelRuntime};

    use super::MemoryRuntime;

    #[test]
    fn refuses_activity_from_peers_outside_the_set() {
        let mut runtime = MemoryRuntime::new(51820);
        let admitted = Key::from([1; 32]);
        let stranger = Key::from([2; 32]);

        runtime
            .apply_peer_set(&[AdmittedPeer(admitted, "10.8.0.2/32".parse().unwrap())])
            .unwrap();

        assert!(runtime.record_activity(admitted, 100, 10, 5));
        assert!(!runtime.record_activity(stranger, 100, 10, 5));

        let state = runtime.dump().unwrap();
        assert_eq!(state.peers.len(), 1);
        assert_eq!(state.peers[0].latest_handshake, Some(100));
        assert_eq!(state.peers[0].transfer, (10, 5));
    }

    #[test]
    fn dropping_a_peer_clears_its_counters() {
        let mut runtime = MemoryRuntime::new(51820);
        let key = Key::from([1; 32]);
        let peer = AdmittedPeer(key, "10.8.0.2/32".parse().unwrap());

        runtime.apply_peer_set(&[peer]).unwrap();
        runtime.record_activity(key, 100, 10, 5);
        runtime.apply_peer_set(&[]).unwrap();
        runtime.apply_peer_set(&[peer]).unwrap();

        assert_eq!(runtime.dump().unwrap().peers[0].transfer, (0, 0));
        assert_eq!(runtime.applies(), 3);
    }
}
