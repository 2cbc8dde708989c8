//! Peer registry
//!
//! Bounded map of live peer sessions. Admission is refused once
//! `max_peers` is reached. Signaling forwards SDP and ICE through here by
//! peer id; the media pipeline broadcasts access units through here to
//! every connected session. A reaper task removes sessions that reached
//! `closed` or `failed` every couple of seconds.
//!
//! The peer map lock is a plain mutex held only for map operations and the
//! broadcast loop; per-peer sends inside the loop are non-blocking
//! enqueues, never network I/O.

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WebRtcConfig;
use crate::peer::PeerSession;
use crate::protocol::OutboundMessage;

/// Reap interval for closed sessions.
const REAP_INTERVAL_MS: u64 = 2000;
/// Sleep slice inside the reaper so shutdown stays responsive.
const REAP_SLICE_MS: u64 = 100;

/// Aggregated view over all sessions.
#[derive(Debug, Clone, Default)]
pub struct RegistryStats {
    pub total_peers: usize,
    pub connected_peers: usize,
    pub total_bytes_sent: u64,
}

type PeerMap = Arc<Mutex<HashMap<String, Arc<PeerSession>>>>;

/// Bounded set of peer sessions with periodic reaping.
pub struct PeerRegistry {
    config: WebRtcConfig,
    peers: PeerMap,
    /// Every id ever handed out; ids are unique for the process lifetime.
    issued_ids: Mutex<HashSet<String>>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl PeerRegistry {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            peers: Arc::new(Mutex::new(HashMap::new())),
            issued_ids: Mutex::new(HashSet::new()),
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        }
    }

    /// Admit a new viewer and build its session. Returns `None` when the
    /// registry is full or session construction fails.
    pub async fn create_peer(
        &self,
        signaling_out: mpsc::Sender<OutboundMessage>,
    ) -> Option<String> {
        {
            let peers = self.peers.lock().unwrap();
            if peers.len() >= self.config.max_peers {
                warn!(
                    "max peers ({}) reached, rejecting new connection",
                    self.config.max_peers
                );
                return None;
            }
        }

        let peer_id = self.allocate_peer_id();
        let session = match PeerSession::new(peer_id.clone(), &self.config, signaling_out).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "failed to create peer session");
                return None;
            }
        };

        // Re-check the cap at insert time: another admission may have won
        // the race while the session was being built.
        let evicted = {
            let mut peers = self.peers.lock().unwrap();
            if peers.len() >= self.config.max_peers {
                warn!(
                    "max peers ({}) reached during setup, rejecting {}",
                    self.config.max_peers, peer_id
                );
                Some(session)
            } else {
                info!(peer = %peer_id, total = peers.len() + 1, "created peer");
                peers.insert(peer_id.clone(), session);
                None
            }
        };

        match evicted {
            Some(session) => {
                session.close().await;
                None
            }
            None => Some(peer_id),
        }
    }

    /// Ask the named session to generate its offer.
    pub async fn start_offer(&self, peer_id: &str) {
        let Some(session) = self.lookup(peer_id) else {
            warn!(peer = %peer_id, "unknown peer for offer");
            return;
        };
        if let Err(e) = session.start_offer().await {
            warn!(peer = %peer_id, error = %e, "failed to start offer");
        }
    }

    /// Forward the browser's answer to the named session.
    pub async fn handle_answer(&self, peer_id: &str, sdp: String) {
        let Some(session) = self.lookup(peer_id) else {
            warn!(peer = %peer_id, "unknown peer for answer");
            return;
        };
        if let Err(e) = session.handle_answer(sdp).await {
            warn!(peer = %peer_id, error = %e, "failed to apply answer");
        }
    }

    /// Forward a remote ICE candidate to the named session.
    pub async fn handle_candidate(&self, peer_id: &str, candidate: &str, mid: &str) {
        let Some(session) = self.lookup(peer_id) else {
            warn!(peer = %peer_id, "unknown peer for candidate");
            return;
        };
        session.handle_candidate(candidate, mid).await;
    }

    /// Remove and close a session. Idempotent.
    pub async fn remove_peer(&self, peer_id: &str) {
        let removed = self.peers.lock().unwrap().remove(peer_id);
        if let Some(session) = removed {
            session.close().await;
            info!(
                peer = %peer_id,
                remaining = self.peers.lock().unwrap().len(),
                "removed peer"
            );
        }
    }

    /// Hand one access unit to every connected session. Non-blocking: each
    /// send is an enqueue into the session's transport queue, so holding
    /// the map lock across the loop is fine.
    pub fn broadcast_nal(&self, data: &Bytes, pts_us: u64) {
        let peers = self.peers.lock().unwrap();
        for session in peers.values() {
            if session.is_connected() {
                session.send_nal(data.clone(), pts_us);
            }
        }
    }

    /// Spawn the reaper task.
    pub fn start(&self) {
        let mut reaper = self.reaper.lock().unwrap();
        if reaper.is_some() {
            warn!("peer registry already started");
            return;
        }
        info!("peer registry started (max peers: {})", self.config.max_peers);
        *reaper = Some(tokio::spawn(reap_loop(
            self.shutdown.clone(),
            Arc::clone(&self.peers),
        )));
    }

    /// Stop the reaper and close every session.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self.reaper.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.ok();
        }

        let drained: Vec<Arc<PeerSession>> =
            self.peers.lock().unwrap().drain().map(|(_, s)| s).collect();
        for session in drained {
            session.close().await;
        }
        info!("peer registry stopped");
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn get_stats(&self) -> RegistryStats {
        let peers = self.peers.lock().unwrap();
        let mut stats = RegistryStats {
            total_peers: peers.len(),
            ..Default::default()
        };
        for session in peers.values() {
            if session.is_connected() {
                stats.connected_peers += 1;
            }
            stats.total_bytes_sent += session.get_stats().bytes_sent;
        }
        stats
    }

    fn lookup(&self, peer_id: &str) -> Option<Arc<PeerSession>> {
        self.peers.lock().unwrap().get(peer_id).cloned()
    }

    /// Opaque 8-hex-digit id, unique for the process lifetime.
    fn allocate_peer_id(&self) -> String {
        let mut issued = self.issued_ids.lock().unwrap();
        loop {
            let id = format!("{:08x}", rand::random::<u32>());
            if issued.insert(id.clone()) {
                return id;
            }
        }
    }
}

async fn reap_loop(shutdown: CancellationToken, peers: PeerMap) {
    loop {
        // sleep REAP_INTERVAL_MS in small slices, bailing early on shutdown
        let mut slept = 0u64;
        while slept < REAP_INTERVAL_MS {
            if shutdown.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(REAP_SLICE_MS)).await;
            slept += REAP_SLICE_MS;
        }

        let reaped: Vec<(String, Arc<PeerSession>)> = {
            let mut peers = peers.lock().unwrap();
            let dead: Vec<String> = peers
                .iter()
                .filter(|(_, s)| s.is_closed())
                .map(|(id, _)| id.clone())
                .collect();
            dead.into_iter()
                .filter_map(|id| peers.remove(&id).map(|s| (id, s)))
                .collect()
        };

        for (id, session) in reaped {
            info!(peer = %id, "reaped disconnected peer");
            session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry_with_cap(max_peers: usize) -> PeerRegistry {
        let mut cfg = WebRtcConfig::default();
        cfg.max_peers = max_peers;
        PeerRegistry::new(cfg)
    }

    fn out_channel() -> mpsc::Sender<OutboundMessage> {
        let (tx, mut rx) = mpsc::channel(64);
        // keep the receiver alive so session sends never error
        tokio::spawn(async move { while rx.recv().await.is_some() {} });
        tx
    }

    #[tokio::test]
    async fn admission_refused_at_cap() {
        let registry = registry_with_cap(2);

        let a = registry.create_peer(out_channel()).await;
        let b = registry.create_peer(out_channel()).await;
        let c = registry.create_peer(out_channel()).await;

        assert!(a.is_some());
        assert!(b.is_some());
        assert!(c.is_none(), "third peer must be refused at max_peers=2");
        assert_eq!(registry.peer_count(), 2);

        registry.stop().await;
    }

    #[tokio::test]
    async fn create_then_remove_restores_count() {
        let registry = registry_with_cap(4);
        assert_eq!(registry.peer_count(), 0);

        let id = registry.create_peer(out_channel()).await.unwrap();
        assert_eq!(registry.peer_count(), 1);

        registry.remove_peer(&id).await;
        assert_eq!(registry.peer_count(), 0);

        // removing again is a no-op
        registry.remove_peer(&id).await;
        assert_eq!(registry.peer_count(), 0);

        registry.stop().await;
    }

    #[tokio::test]
    async fn peer_ids_are_8_hex_digits_and_unique() {
        let registry = registry_with_cap(4);
        let a = registry.create_peer(out_channel()).await.unwrap();
        let b = registry.create_peer(out_channel()).await.unwrap();

        assert_eq!(a.len(), 8);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);

        registry.stop().await;
    }

    #[tokio::test]
    async fn live_sessions_have_distinct_ssrcs() {
        let registry = registry_with_cap(4);
        let a = registry.create_peer(out_channel()).await.unwrap();
        let b = registry.create_peer(out_channel()).await.unwrap();

        let ssrc_a = registry.lookup(&a).unwrap().ssrc();
        let ssrc_b = registry.lookup(&b).unwrap().ssrc();
        assert_ne!(ssrc_a, ssrc_b);

        registry.stop().await;
    }

    #[tokio::test]
    async fn forwarding_to_unknown_ids_is_ignored() {
        let registry = registry_with_cap(4);
        // none of these may panic or error out
        registry.start_offer("ffffffff").await;
        registry.handle_answer("ffffffff", "v=0".to_string()).await;
        registry.handle_candidate("ffffffff", "candidate:1", "0").await;
        registry.stop().await;
    }

    #[tokio::test]
    async fn broadcast_with_no_peers_is_harmless() {
        let registry = registry_with_cap(4);
        let au = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]);
        registry.broadcast_nal(&au, 1000);
        registry.stop().await;
    }

    #[tokio::test]
    async fn broadcast_skips_unconnected_peers() {
        let registry = registry_with_cap(4);
        let id = registry.create_peer(out_channel()).await.unwrap();

        let au = Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88]);
        registry.broadcast_nal(&au, 1000);

        // session never connected, so nothing was sent
        let stats = registry.lookup(&id).unwrap().get_stats();
        assert_eq!(stats.bytes_sent, 0);
        assert_eq!(registry.get_stats().connected_peers, 0);

        registry.stop().await;
    }

    #[tokio::test]
    async fn reaper_removes_closed_sessions() {
        let registry = registry_with_cap(4);
        registry.start();

        let id = registry.create_peer(out_channel()).await.unwrap();
        registry.lookup(&id).unwrap().close().await;
        assert_eq!(registry.peer_count(), 1, "closed but not yet reaped");

        // one reap cycle is 2 s; allow a little slack
        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert_eq!(registry.peer_count(), 0, "reaper should have removed it");

        registry.stop().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let registry = registry_with_cap(4);
        registry.start();
        let _ = registry.create_peer(out_channel()).await.unwrap();

        registry.stop().await;
        assert_eq!(registry.peer_count(), 0);
        // second stop must not hang or panic
        registry.stop().await;
    }

    #[tokio::test]
    async fn stats_aggregate_over_sessions() {
        let registry = registry_with_cap(4);
        let _a = registry.create_peer(out_channel()).await.unwrap();
        let _b = registry.create_peer(out_channel()).await.unwrap();

        let stats = registry.get_stats();
        assert_eq!(stats.total_peers, 2);
        assert_eq!(stats.connected_peers, 0);
        assert_eq!(stats.total_bytes_sent, 0);

        registry.stop().await;
    }
}
