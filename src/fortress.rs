use std::{
    collections::HashSet,
    net::IpAddr,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;

use crate::{
    error::Error,
    keystore::{KeySource, KeyStore, OsKeySource, PrivateKey},
    registry::{Peer, PeerId, PeerRegistry},
    render,
    server::ServerConfig,
    stats::{self, PeerStatus, ServerStats},
    store::{Snapshot, Store},
    tracker::{SampleFeed, SessionTracker, Transition},
    wg::{Key, TunnelRuntime},
};

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A newly created peer together with its private key. The key exists only
/// in this value.
#[derive(Debug)]
pub struct IssuedPeer {
    pub peer: Peer,
    pub private_key: PrivateKey,
}

fn validated(snapshot: Snapshot) -> Result<(ServerConfig, PeerRegistry, Option<u64>), Error> {
    snapshot.server.validate()?;
    let registry = PeerRegistry::with_peers(snapshot.server.address, snapshot.peers)?;
    Ok((snapshot.server, registry, snapshot.started_at))
}

struct Admin<R> {
    server: ServerConfig,
    registry: PeerRegistry,
    started_at: Option<u64>,
    runtime: R,
    store: Store,
}

impl<R: TunnelRuntime<Error = Error>> Admin<R> {
    fn snapshot(&self) -> Snapshot {
        let mut snapshot = Snapshot::new(self.server.clone(), self.registry.list_peers().to_vec());
        snapshot.started_at = self.started_at;
        snapshot
    }

    /// Replaces the in-memory state with the stored one. Callers hold the
    /// store lock, so other processes' changes are seen before mutating.
    fn refresh(&mut self) -> Result<(), Error> {
        let (server, registry, started_at) = validated(self.store.load()?)?;
        self.server = server;
        self.registry = registry;
        self.started_at = started_at;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        self.store.save(&self.snapshot())?;
        self.runtime.apply_peer_set(&self.registry.peer_set())
    }

    fn install_server_key(&mut self) -> Result<(), Error> {
        self.store.save(&self.snapshot())?;
        let key = self.server.private_key;
        self.runtime.set_private_key(&key)
    }

    /// Persists and applies the current registry, restoring `previous` in
    /// memory, on disk and in the runtime if either step fails.
    fn commit_or_restore(&mut self, previous: PeerRegistry) -> Result<(), Error> {
        let Err(err) = self.commit() else {
            return Ok(());
        };

        self.registry = previous;
        if let Err(restore) = self.commit() {
            log::error!("failed to restore the previous peer set: {restore}");
        }
        Err(err)
    }
}

struct Sessions {
    tracker: SessionTracker,
    feed: SampleFeed,
}

impl Sessions {
    /// Tracks exactly the registered keys with the configured window.
    /// Returns how many sessions were dropped.
    fn follow(&mut self, server: &ServerConfig, registry: &PeerRegistry) -> usize {
        self.tracker.set_liveness_window(server.liveness_window());
        let keys: HashSet<Key> = registry.list_peers().iter().map(|p| p.public_key).collect();
        self.tracker.retain_keys(&keys)
    }
}

/// The peer-management service. Registry, server config and runtime sit
/// behind one lock so every mutation and the runtime hand-off that follows it
/// are serialized; across processes the store lock does the same. Session
/// data has its own lock and never waits on key generation.
///
/// Locks are taken in the order keys, admin, store file, sessions.
pub struct Fortress<R, S = OsKeySource> {
    admin: Mutex<Admin<R>>,
    keys: Mutex<KeyStore<S>>,
    sessions: Mutex<Sessions>,
}

impl<R, S> Fortress<R, S>
where
    R: TunnelRuntime<Error = Error>,
    S: KeySource,
{
    pub fn open(snapshot: Snapshot, store: Store, runtime: R, keys: KeyStore<S>) -> Result<Self, Error> {
        let (server, registry, started_at) = validated(snapshot)?;

        let mut sessions = Sessions {
            tracker: SessionTracker::new(server.liveness_window()),
            feed: SampleFeed::default(),
        };
        sessions.follow(&server, &registry);

        log::debug!(
            "opened {} with {} peers in {}",
            store.path().display(),
            registry.list_peers().len(),
            registry.subnet()
        );

        Ok(Self {
            admin: Mutex::new(Admin {
                server,
                registry,
                started_at,
                runtime,
                store,
            }),
            keys: Mutex::new(keys),
            sessions: Mutex::new(sessions),
        })
    }

    /// Brings the runtime in line with the stored state: server key first,
    /// then the peer set.
    pub async fn sync_runtime(&self) -> Result<(), Error> {
        let mut admin = self.admin.lock().await;
        let expected = admin.server.public_key();
        let state = admin.runtime.dump()?;

        if let Some(port) = state.interface.listen_port.filter(|p| *p != admin.server.listen_port) {
            log::warn!(
                "interface listens on {port} but clients are told {}",
                admin.server.listen_port
            );
        }

        if state.interface.public_key != Some(expected) {
            log::info!("installing server key {expected}");
            let key = admin.server.private_key;
            admin.runtime.set_private_key(&key)?;
        }

        let peers = admin.registry.peer_set();
        admin.runtime.apply_peer_set(&peers)?;
        log::info!("runtime admits {} peers", peers.len());
        Ok(())
    }

    /// Applies `change` to the stored registry under the store lock, then
    /// persists it and hands the peer set to the runtime. Sessions follow the
    /// new registry before the admin lock is released.
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut PeerRegistry) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut admin = self.admin.lock().await;

        let value = {
            let _guard = admin.store.lock()?;
            admin.refresh()?;

            let previous = admin.registry.clone();
            let value = change(&mut admin.registry)?;
            admin.commit_or_restore(previous)?;
            value
        };

        self.sessions
            .lock()
            .await
            .follow(&admin.server, &admin.registry);
        Ok(value)
    }

    pub async fn add_peer(&self, name: &str, now: u64) -> Result<IssuedPeer, Error> {
        let (public_key, private_key) = self.keys.lock().await.issue()?;

        let peer = self
            .mutate(|registry| registry.add_peer(name, public_key, now))
            .await?;
        log::info!("added peer {} ({}) at {}", peer.name, peer.id, peer.allowed_ip);

        Ok(IssuedPeer { peer, private_key })
    }

    /// Registers a peer whose key pair was generated elsewhere.
    pub async fn adopt_peer(
        &self,
        name: &str,
        public_key: Key,
        requested: Option<IpAddr>,
        now: u64,
    ) -> Result<Peer, Error> {
        let peer = self
            .mutate(|registry| registry.adopt(name, public_key, requested, now))
            .await?;
        log::info!("adopted peer {} ({}) at {}", peer.name, peer.id, peer.allowed_ip);

        Ok(peer)
    }

    /// Revokes `id`. Returns only after the runtime has accepted the peer
    /// set without its key; `NotFound` if the id is unknown.
    pub async fn remove_peer(&self, id: PeerId) -> Result<Peer, Error> {
        let peer = self.mutate(|registry| registry.remove_peer(id)).await?;
        log::info!("removed peer {} ({}), {} is free", peer.name, peer.id, peer.allowed_ip);

        Ok(peer)
    }

    /// Replaces the server key pair. Every peer needs a freshly rendered
    /// config afterwards.
    pub async fn rotate_server_key(&self) -> Result<Key, Error> {
        let mut keys = self.keys.lock().await;
        let mut admin = self.admin.lock().await;
        let _guard = admin.store.lock()?;
        admin.refresh()?;

        let previous = admin.server.clone();
        let public = keys.rotate_server_key(&mut admin.server)?;

        if let Err(err) = admin.install_server_key() {
            admin.server = previous;
            if let Err(restore) = admin.install_server_key() {
                log::error!("failed to restore the previous server key: {restore}");
            }
            return Err(err);
        }

        log::warn!(
            "server key rotated to {public}, {} peers need a new config",
            admin.registry.list_peers().len()
        );
        Ok(public)
    }

    /// Records that the service loop is up, optionally with a new liveness
    /// window, so one-shot commands report the same uptime and liveness.
    pub async fn mark_started(&self, now: u64, liveness_window: Option<Duration>) -> Result<(), Error> {
        if liveness_window.is_some_and(|w| w.as_secs() == 0) {
            return Err(Error::Validation("liveness window must be positive".into()));
        }

        self.record_service(Some(now), liveness_window).await
    }

    pub async fn mark_stopped(&self) -> Result<(), Error> {
        self.record_service(None, None).await
    }

    async fn record_service(
        &self,
        started_at: Option<u64>,
        liveness_window: Option<Duration>,
    ) -> Result<(), Error> {
        let mut admin = self.admin.lock().await;
        {
            let _guard = admin.store.lock()?;
            admin.refresh()?;

            admin.started_at = started_at;
            if let Some(window) = liveness_window {
                admin.server.liveness_window = window.as_secs();
            }
            admin.store.save(&admin.snapshot())?;
        }

        self.sessions
            .lock()
            .await
            .follow(&admin.server, &admin.registry);
        Ok(())
    }

    pub async fn list_peers(&self, now: u64) -> Vec<PeerStatus> {
        let admin = self.admin.lock().await;
        let sessions = self.sessions.lock().await;
        stats::peer_statuses(&admin.registry, &sessions.tracker, now)
    }

    #[cfg(test)]
    pub async fn find_peer(&self, id: PeerId) -> Result<Peer, Error> {
        self.admin
            .lock()
            .await
            .registry
            .get(id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    pub async fn render(&self, id: PeerId) -> Result<String, Error> {
        let admin = self.admin.lock().await;
        let peer = admin.registry.get(id).ok_or(Error::NotFound(id))?;
        Ok(render::render(peer, &admin.server))
    }

    pub async fn render_issued(&self, issued: &IssuedPeer) -> Result<String, Error> {
        let admin = self.admin.lock().await;
        render::render_with_key(&issued.peer, &admin.server, &issued.private_key)
    }

    pub async fn stats(&self, now: u64) -> ServerStats {
        let admin = self.admin.lock().await;
        let sessions = self.sessions.lock().await;
        stats::compute_stats(
            &admin.registry,
            &sessions.tracker,
            &admin.server,
            admin.started_at,
            now,
        )
    }

    /// `name (address)` for registered keys, the bare key otherwise.
    pub async fn describe(&self, key: &Key) -> String {
        match self.admin.lock().await.registry.find_by_key(key) {
            Some(peer) => format!("{} ({})", peer.name, peer.allowed_ip),
            None => key.to_string(),
        }
    }

    pub async fn server_config(&self) -> ServerConfig {
        self.admin.lock().await.server.clone()
    }

    /// Reads the runtime once, folds new handshakes into the tracker and
    /// expires quiet sessions.
    pub async fn poll_runtime(&self, now: u64) -> Result<Vec<Transition>, Error> {
        let state = self.admin.lock().await.runtime.dump()?;

        let mut sessions = self.sessions.lock().await;
        let samples = sessions.feed.samples(&state.peers);

        let mut transitions: Vec<Transition> = samples
            .into_iter()
            .filter_map(|sample| sessions.tracker.observe(sample, now))
            .collect();
        transitions.extend(sessions.tracker.sweep(now));

        Ok(transitions)
    }

    /// Swaps in a snapshot written by another process and re-applies it.
    pub async fn reload(&self, snapshot: Snapshot) -> Result<(), Error> {
        let (server, registry, started_at) = validated(snapshot)?;

        let mut admin = self.admin.lock().await;
        if admin.server.private_key != server.private_key {
            log::info!("server key changed on disk, installing {}", server.public_key());
            admin.runtime.set_private_key(&server.private_key)?;
        }
        admin.runtime.apply_peer_set(&registry.peer_set())?;

        admin.server = server;
        admin.registry = registry;
        admin.started_at = started_at;

        let dropped = self
            .sessions
            .lock()
            .await
            .follow(&admin.server, &admin.registry);

        log::info!(
            "reloaded {} peers, {} dropped",
            admin.registry.list_peers().len(),
            dropped
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, time::Duration};

    use crate::{
        error::Error,
        keystore::{
            KeySource, KeyStore,
            fake::{FailingSource, SeqSource},
        },
        registry::PeerId,
        server::ServerConfig,
        store::{Snapshot, Store, temp_path},
        tracker::Transition,
        wg::{AdmittedPeer, Key, TunnelRuntime, config::WgConfig, memory::MemoryRuntime},
    };

    use super::Fortress;

    fn server() -> ServerConfig {
        ServerConfig::new(Key::from([0xaa; 32]), "vpn.example.com:51820".parse().unwrap())
    }

    fn open_with<S: KeySource>(source: S) -> (Fortress<MemoryRuntime, S>, MemoryRuntime, Store) {
        let store = Store::new(temp_path("fortress"));
        let snapshot = Snapshot::new(server(), Vec::new());
        store.save(&snapshot).unwrap();

        let runtime = MemoryRuntime::new(51820);
        let fortress = Fortress::open(snapshot, store.clone(), runtime.clone(), KeyStore::with_source(source))
            .unwrap();
        (fortress, runtime, store)
    }

    /// A second handle on the same state file and interface, as a separate
    /// CLI process would have.
    fn reopen(store: &Store, runtime: &MemoryRuntime, seed: u8) -> Fortress<MemoryRuntime, SeqSource> {
        Fortress::open(
            store.load().unwrap(),
            store.clone(),
            runtime.clone(),
            KeyStore::with_source(SeqSource(seed)),
        )
        .unwrap()
    }

    fn open() -> (Fortress<MemoryRuntime, SeqSource>, MemoryRuntime, Store) {
        open_with(SeqSource(1))
    }

    #[tokio::test]
    async fn add_peer_allocates_persists_and_admits() {
        let (fortress, runtime, store) = open();

        let laptop = fortress.add_peer("Laptop", 1_000).await.unwrap();
        let phone = fortress.add_peer("Phone", 1_000).await.unwrap();

        assert_eq!(laptop.peer.allowed_ip.to_string(), "10.8.0.2/32");
        assert_eq!(phone.peer.allowed_ip.to_string(), "10.8.0.3/32");
        assert_eq!(laptop.private_key.public_key(), laptop.peer.public_key);

        assert_eq!(runtime.peers(), vec![laptop.peer.admitted(), phone.peer.admitted()]);
        assert_eq!(store.load().unwrap().peers, vec![laptop.peer, phone.peer]);
    }

    #[tokio::test]
    async fn removal_frees_the_address_and_drops_the_key() {
        let (fortress, runtime, store) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;
        let b = fortress.add_peer("b", 1_000).await.unwrap().peer;

        fortress.remove_peer(a.id).await.unwrap();
        assert!(runtime.peers().iter().all(|p| p.0 != a.public_key));
        assert!(!runtime.record_activity(a.public_key, 2_000, 1, 1));

        let c = fortress.add_peer("c", 1_000).await.unwrap().peer;
        assert_eq!(c.allowed_ip, a.allowed_ip);
        assert_eq!(runtime.peers(), vec![b.admitted(), c.admitted()]);
        assert_eq!(store.load().unwrap().peers, vec![b, c]);
    }

    #[tokio::test]
    async fn removing_an_unknown_peer_is_not_found() {
        let (fortress, runtime, _) = open();
        fortress.add_peer("a", 1_000).await.unwrap();
        let applies = runtime.applies();

        let missing = PeerId::random();
        assert!(matches!(
            fortress.remove_peer(missing).await,
            Err(Error::NotFound(id)) if id == missing
        ));
        assert_eq!(runtime.applies(), applies);
        assert_eq!(fortress.list_peers(1_000).await.len(), 1);
    }

    #[tokio::test]
    async fn key_generation_failure_commits_nothing() {
        let (fortress, runtime, store) = open_with(FailingSource);

        assert!(matches!(
            fortress.add_peer("a", 1_000).await,
            Err(Error::CryptoFailure(_))
        ));
        assert!(fortress.list_peers(1_000).await.is_empty());
        assert_eq!(runtime.applies(), 0);
        assert!(store.load().unwrap().peers.is_empty());
    }

    #[tokio::test]
    async fn runtime_failure_rolls_the_addition_back() {
        let (fortress, runtime, store) = open();
        runtime.fail_next_apply();

        assert!(fortress.add_peer("a", 1_000).await.is_err());
        assert!(fortress.list_peers(1_000).await.is_empty());
        assert!(store.load().unwrap().peers.is_empty());
        assert!(runtime.peers().is_empty());
    }

    #[tokio::test]
    async fn failed_revocation_is_not_acknowledged() {
        let (fortress, runtime, store) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;
        runtime.fail_next_apply();

        assert!(fortress.remove_peer(a.id).await.is_err());
        assert_eq!(fortress.find_peer(a.id).await.unwrap(), a);
        assert_eq!(runtime.peers(), vec![a.admitted()]);
        assert_eq!(store.load().unwrap().peers, vec![a]);
    }

    #[tokio::test]
    async fn rotation_updates_runtime_store_and_configs() {
        let (fortress, runtime, store) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;
        let before = fortress.render(a.id).await.unwrap();

        let public = fortress.rotate_server_key().await.unwrap();

        assert_eq!(runtime.public_key(), Some(public));
        assert_eq!(store.load().unwrap().server.public_key(), public);

        let after = fortress.render(a.id).await.unwrap();
        assert_ne!(before, after);
        let parsed = WgConfig::parse_config(&after).unwrap();
        assert_eq!(parsed.peers[0].public_key, public);
    }

    #[tokio::test]
    async fn render_is_stable_and_keyless() {
        let (fortress, _, _) = open();
        let issued = fortress.add_peer("a", 1_000).await.unwrap();

        let first = fortress.render(issued.peer.id).await.unwrap();
        assert_eq!(first, fortress.render(issued.peer.id).await.unwrap());
        assert!(!first.contains(&issued.private_key.reveal().to_string()));

        let once = fortress.render_issued(&issued).await.unwrap();
        assert!(once.contains(&issued.private_key.reveal().to_string()));

        assert!(matches!(
            fortress.render(PeerId::random()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn polling_tracks_sessions_and_liveness() {
        let (fortress, runtime, _) = open();
        fortress.mark_started(1_000, None).await.unwrap();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;
        fortress.add_peer("b", 1_000).await.unwrap();

        runtime.record_activity(a.public_key, 1_100, 4_096, 1_024);
        let transitions = fortress.poll_runtime(1_105).await.unwrap();
        assert_eq!(transitions, vec![Transition::Connected(a.public_key)]);

        assert_eq!(fortress.describe(&a.public_key).await, "a (10.8.0.2/32)");

        let stats = fortress.stats(1_105).await;
        assert_eq!(stats.uptime, Duration::from_secs(105));
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.active_connections, 1);
        assert_eq!((stats.total_rx, stats.total_tx), (4_096, 1_024));

        // quiet for longer than the window: reported disconnected before any sweep
        assert_eq!(fortress.stats(1_281).await.active_connections, 0);
        let statuses = fortress.list_peers(1_281).await;
        assert!(statuses.iter().all(|s| s.state.to_string() == "disconnected"));

        assert_eq!(
            fortress.poll_runtime(1_281).await.unwrap(),
            vec![Transition::Disconnected(a.public_key)]
        );
    }

    #[tokio::test]
    async fn samples_from_unregistered_keys_are_counted() {
        let (fortress, runtime, _) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;

        // a peer configured on the interface by hand, behind the registry's back
        let stranger = Key::from([0x77; 32]);
        let mut handle = runtime.clone();
        handle
            .apply_peer_set(&[a.admitted(), AdmittedPeer(stranger, "10.8.0.200/32".parse().unwrap())])
            .unwrap();
        runtime.record_activity(stranger, 1_100, 1, 1);

        assert!(fortress.poll_runtime(1_100).await.unwrap().is_empty());
        assert_eq!(fortress.stats(1_100).await.dropped_samples, 1);
    }

    #[tokio::test]
    async fn state_survives_a_restart() {
        let (fortress, _, store) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;
        let public = fortress.rotate_server_key().await.unwrap();
        drop(fortress);

        let runtime = MemoryRuntime::new(51820);
        let reopened = reopen(&store, &runtime, 100);
        reopened.sync_runtime().await.unwrap();

        assert_eq!(reopened.find_peer(a.id).await.unwrap(), a);
        assert_eq!(reopened.server_config().await.public_key(), public);
        assert_eq!(runtime.public_key(), Some(public));
        assert_eq!(runtime.peers(), vec![a.admitted()]);

        let b = reopened.add_peer("b", 5_000).await.unwrap().peer;
        assert_eq!(b.allowed_ip.to_string(), "10.8.0.3/32");
    }

    #[tokio::test]
    async fn separate_handles_on_one_store_never_share_an_address() {
        let (first, runtime, store) = open();
        let second = reopen(&store, &runtime, 50);

        let a = first.add_peer("a", 1_000).await.unwrap().peer;
        let b = second.add_peer("b", 1_000).await.unwrap().peer;
        let c = first.add_peer("c", 1_000).await.unwrap().peer;

        assert_eq!(a.allowed_ip.to_string(), "10.8.0.2/32");
        assert_eq!(b.allowed_ip.to_string(), "10.8.0.3/32");
        assert_eq!(c.allowed_ip.to_string(), "10.8.0.4/32");

        let stored = store.load().unwrap().peers;
        assert_eq!(stored, vec![a.clone(), b.clone(), c.clone()]);
        assert_eq!(runtime.peers(), vec![a.admitted(), b.admitted(), c.admitted()]);

        // a removal through one handle is not undone by the other
        second.remove_peer(a.id).await.unwrap();
        first.add_peer("d", 1_000).await.unwrap();
        assert!(store.load().unwrap().peers.iter().all(|p| p.id != a.id));
        assert!(runtime.peers().iter().all(|p| p.0 != a.public_key));
    }

    #[tokio::test]
    async fn peers_added_elsewhere_are_tracked_after_a_change() {
        let (first, runtime, store) = open();
        let second = reopen(&store, &runtime, 50);

        let b = second.add_peer("b", 1_000).await.unwrap().peer;
        first.add_peer("c", 1_000).await.unwrap();

        runtime.record_activity(b.public_key, 1_100, 300, 30);
        first.poll_runtime(1_100).await.unwrap();

        let stats = first.stats(1_100).await;
        assert_eq!(stats.dropped_samples, 0);
        assert_eq!((stats.total_rx, stats.total_tx), (300, 30));
    }

    #[tokio::test]
    async fn long_quiet_peers_do_not_flap_on_first_poll() {
        let (fortress, runtime, _) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;
        runtime.record_activity(a.public_key, 1_000, 64, 64);

        assert!(fortress.poll_runtime(4_600).await.unwrap().is_empty());

        let stats = fortress.stats(4_600).await;
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_rx, 64);
    }

    #[tokio::test]
    async fn service_start_and_window_are_shared_through_the_store() {
        let (service, runtime, store) = open();
        service
            .mark_started(2_000, Some(Duration::from_secs(300)))
            .await
            .unwrap();
        let a = service.add_peer("a", 2_000).await.unwrap().peer;

        let cli = reopen(&store, &runtime, 50);
        let stats = cli.stats(2_000 + 5 * 86_400).await;
        assert!(stats.running);
        assert_eq!(stats.uptime, Duration::from_secs(5 * 86_400));

        runtime.record_activity(a.public_key, 2_100, 1, 1);
        cli.poll_runtime(2_100).await.unwrap();
        // inside 300 s, outside the default 180 s
        assert_eq!(cli.stats(2_350).await.active_connections, 1);

        assert!(service.mark_started(2_000, Some(Duration::ZERO)).await.is_err());

        service.mark_stopped().await.unwrap();
        let stopped = reopen(&store, &runtime, 60).stats(9_999).await;
        assert!(!stopped.running);
        assert_eq!(store.load().unwrap().server.liveness_window, 300);
    }

    #[tokio::test]
    async fn reload_picks_up_external_changes() {
        let (fortress, runtime, store) = open();
        let a = fortress.add_peer("a", 1_000).await.unwrap().peer;

        let mut snapshot = store.load().unwrap();
        snapshot.peers.clear();
        fortress.reload(snapshot).await.unwrap();

        assert!(runtime.peers().is_empty());
        assert!(fortress.find_peer(a.id).await.is_err());
    }

    #[tokio::test]
    async fn adopted_peers_keep_their_keys() {
        let (fortress, runtime, _) = open();
        let key = Key::from([0x42; 32]);

        let peer = fortress
            .adopt_peer("imported", key, Some("10.8.0.9".parse().unwrap()), 1_000)
            .await
            .unwrap();

        assert_eq!(peer.public_key, key);
        assert_eq!(peer.allowed_ip.to_string(), "10.8.0.9/32");
        assert_eq!(runtime.peers(), vec![peer.admitted()]);
        assert!(matches!(
            fortress.adopt_peer("again", key, None, 1_000).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_additions_never_share_an_address() {
        let (fortress, runtime, store) = open_with(crate::keystore::OsKeySource);
        let fortress = Arc::new(fortress);

        let tasks: Vec<_> = (0..32)
            .map(|n| {
                let fortress = fortress.clone();
                tokio::spawn(async move { fortress.add_peer(&format!("peer-{n}"), 1_000).await })
            })
            .collect();

        let mut ips = HashSet::new();
        for task in tasks {
            let issued = task.await.unwrap().unwrap();
            assert!(ips.insert(issued.peer.allowed_ip));
        }

        assert_eq!(runtime.peers().len(), 32);
        assert_eq!(store.load().unwrap().peers.len(), 32);
    }
}
