use std::time::Duration;

use crate::{
    registry::{Peer, PeerRegistry},
    server::ServerConfig,
    tracker::{ConnectionState, SessionTracker},
    wg::{Endpoint, Key},
};

const BYTE_UNITS: [&str; 7] = ["B", "KB", "MB", "GB", "TB", "PB", "EB"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    pub running: bool,
    pub uptime: Duration,
    pub total_peers: usize,
    pub active_connections: usize,
    pub total_rx: u64,
    pub total_tx: u64,
    pub dropped_samples: u64,
    pub public_key: Key,
    pub endpoint: Endpoint,
    pub listen_port: u16,
}

/// A registry entry joined with its session, as shown to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerStatus {
    pub peer: Peer,
    pub last_handshake: Option<u64>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub state: ConnectionState,
}

pub fn peer_statuses(registry: &PeerRegistry, tracker: &SessionTracker, now: u64) -> Vec<PeerStatus> {
    registry
        .list_peers()
        .iter()
        .map(|peer| {
            let session = tracker.session(&peer.public_key).copied().unwrap_or_default();
            PeerStatus {
                peer: peer.clone(),
                last_handshake: session.last_handshake,
                rx_bytes: session.rx_bytes,
                tx_bytes: session.tx_bytes,
                state: tracker.state_of(&peer.public_key, now),
            }
        })
        .collect()
}

/// Server-wide figures at `now`. Connection state is evaluated against the
/// liveness window here, so a peer that went quiet counts as disconnected
/// even before the tracker sweeps it. `started_at` is when the service loop
/// came up; uptime is zero while it is not running.
pub fn compute_stats(
    registry: &PeerRegistry,
    tracker: &SessionTracker,
    server: &ServerConfig,
    started_at: Option<u64>,
    now: u64,
) -> ServerStats {
    let statuses = peer_statuses(registry, tracker, now);

    ServerStats {
        running: started_at.is_some(),
        uptime: started_at
            .map(|at| Duration::from_secs(now.saturating_sub(at)))
            .unwrap_or_default(),
        total_peers: statuses.len(),
        active_connections: statuses
            .iter()
            .filter(|s| s.state == ConnectionState::Connected)
            .count(),
        total_rx: statuses.iter().fold(0u64, |acc, s| acc.saturating_add(s.rx_bytes)),
        total_tx: statuses.iter().fold(0u64, |acc, s| acc.saturating_add(s.tx_bytes)),
        dropped_samples: tracker.dropped_samples(),
        public_key: server.public_key(),
        endpoint: server.endpoint.clone(),
        listen_port: server.listen_port,
    }
}

/// `5d 12h 30m`; leading zero units are left out.
pub fn format_uptime(uptime: Duration) -> String {
    let minutes = uptime.as_secs() / 60;
    let (days, hours, minutes) = (minutes / 1440, minutes / 60 % 24, minutes % 60);

    match (days, hours) {
        (0, 0) => format!("{minutes}m"),
        (0, _) => format!("{hours}h {minutes}m"),
        _ => format!("{days}d {hours}h {minutes}m"),
    }
}

pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    let text = format!("{value:.2}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    format!("{text} {}", BYTE_UNITS[unit])
}

impl std::fmt::Display for ServerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.running {
            writeln!(f, "uptime:      {}", format_uptime(self.uptime))?;
        } else {
            writeln!(f, "uptime:      not running")?;
        }
        writeln!(
            f,
            "peers:       {} ({} connected)",
            self.total_peers, self.active_connections
        )?;
        writeln!(
            f,
            "transfer:    rx {} / tx {}",
            format_bytes(self.total_rx),
            format_bytes(self.total_tx)
        )?;
        writeln!(f, "endpoint:    {}", self.endpoint)?;
        writeln!(f, "listen port: {}", self.listen_port)?;
        write!(f, "public key:  {}", self.public_key)
    }
}
