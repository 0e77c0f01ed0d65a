use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use crate::wg::{Key, peer::WgPeerInfo};

pub const DEFAULT_LIVENESS_WINDOW: Duration = Duration::from_secs(180);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
        })
    }
}

/// One observation from the tunnel runtime: a handshake time (unix seconds)
/// and the bytes moved since the previous observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSample {
    pub public_key: Key,
    pub timestamp: u64,
    pub rx_delta: u64,
    pub tx_delta: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub last_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub state: ConnectionState,
}

impl Session {
    pub fn state_at(&self, now: u64, window: Duration) -> ConnectionState {
        match self.last_handshake {
            Some(ts) if now.saturating_sub(ts) <= window.as_secs() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Connected(Key),
    Disconnected(Key),
}

/// Per-peer handshake time and transfer counters. Counters only grow and a
/// sample is applied only when its timestamp is newer than the stored one.
#[derive(Debug)]
pub struct SessionTracker {
    sessions: HashMap<Key, Session>,
    liveness_window: Duration,
    dropped_samples: u64,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_LIVENESS_WINDOW)
    }
}

impl SessionTracker {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            sessions: HashMap::new(),
            liveness_window,
            dropped_samples: 0,
        }
    }

    pub fn set_liveness_window(&mut self, window: Duration) {
        self.liveness_window = window;
    }

    /// Starts accepting samples for `key`.
    pub fn track(&mut self, key: Key) {
        self.sessions.entry(key).or_default();
    }

    /// Tracks exactly `keys`: new ones start empty, the rest are forgotten.
    /// Returns how many sessions were dropped.
    pub fn retain_keys(&mut self, keys: &HashSet<Key>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|key, _| keys.contains(key));
        let dropped = before - self.sessions.len();

        for key in keys {
            self.track(*key);
        }
        dropped
    }

    pub fn forget(&mut self, key: &Key) -> Option<Session> {
        self.sessions.remove(key)
    }

    pub fn session(&self, key: &Key) -> Option<&Session> {
        self.sessions.get(key)
    }

    pub fn state_of(&self, key: &Key, now: u64) -> ConnectionState {
        self.sessions
            .get(key)
            .map(|s| s.state_at(now, self.liveness_window))
            .unwrap_or_default()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    /// Applies `sample` as seen at `now`. Counters always advance; the peer
    /// only turns connected when the handshake is inside the liveness window.
    pub fn observe(&mut self, sample: SessionSample, now: u64) -> Option<Transition> {
        let Some(session) = self.sessions.get_mut(&sample.public_key) else {
            self.dropped_samples += 1;
            log::debug!("dropped sample for unknown key {}", sample.public_key);
            return None;
        };

        if session.last_handshake.is_some_and(|ts| sample.timestamp <= ts) {
            log::debug!(
                "ignored stale sample for {} at {}",
                sample.public_key,
                sample.timestamp
            );
            return None;
        }

        session.last_handshake = Some(sample.timestamp);
        session.rx_bytes = session.rx_bytes.saturating_add(sample.rx_delta);
        session.tx_bytes = session.tx_bytes.saturating_add(sample.tx_delta);

        let state = session.state_at(now, self.liveness_window);
        match (std::mem::replace(&mut session.state, state), state) {
            (ConnectionState::Disconnected, ConnectionState::Connected) => {
                Some(Transition::Connected(sample.public_key))
            }
            (ConnectionState::Connected, ConnectionState::Disconnected) => {
                Some(Transition::Disconnected(sample.public_key))
            }
            _ => None,
        }
    }

    /// Marks every session whose last handshake fell out of the liveness
    /// window as disconnected.
    pub fn sweep(&mut self, now: u64) -> Vec<Transition> {
        let window = self.liveness_window;
        let mut transitions = Vec::new();

        for (key, session) in &mut self.sessions {
            if session.state == ConnectionState::Connected
                && session.state_at(now, window) == ConnectionState::Disconnected
            {
                session.state = ConnectionState::Disconnected;
                transitions.push(Transition::Disconnected(*key));
            }
        }

        transitions
    }
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    handshake: u64,
    rx: u64,
    tx: u64,
}

/// Turns the runtime's cumulative counters into samples. A sample is emitted
/// only when the handshake time advances; its deltas cover everything since
/// the previous emitted sample.
#[derive(Debug, Default)]
pub struct SampleFeed {
    baselines: HashMap<Key, Baseline>,
}

impl SampleFeed {
    pub fn samples(&mut self, peers: &[WgPeerInfo]) -> Vec<SessionSample> {
        let mut samples = Vec::new();

        for info in peers {
            let Some(handshake) = info.latest_handshake else {
                continue;
            };
            let (rx, tx) = info.transfer;

            let (rx_delta, tx_delta) = match self.baselines.get(&info.public_key) {
                Some(base) if handshake <= base.handshake => continue,
                // counters going backwards means the runtime lost the peer in between
                Some(base) if rx < base.rx || tx < base.tx => (rx, tx),
                Some(base) => (rx - base.rx, tx - base.tx),
                None => (rx, tx),
            };

            self.baselines
                .insert(info.public_key, Baseline { handshake, rx, tx });
            samples.push(SessionSample {
                public_key: info.public_key,
                timestamp: handshake,
                rx_delta,
                tx_delta,
            });
        }

        let present: HashSet<Key> = peers.iter().map(|p| p.public_key).collect();
        self.baselines.retain(|key, _| present.contains(key));

        samples
    }
}
