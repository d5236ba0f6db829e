//! Peer pool and outbound connection selection (§4.5).
//!
//! A [`PeerPool`] tracks every peer this runtime has ever referenced by
//! `host:port`, each with zero or more live connections and a running health
//! score. Peers are never removed implicitly — a temporarily-unreachable
//! peer stays known so a later call can retry it once its penalty decays.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tchannel_core::{Connection, ConnectionConfig, ConnectionEvents};
use tokio::net::TcpStream;

/// Callback invoked with every freshly handshaked connection (inbound or
/// outbound) so the dispatcher can serve calls the peer sends back on it
/// (§4.5: peers are symmetric).
type ConnectionHook = Arc<dyn Fn(Connection, ConnectionEvents) + Send + Sync>;

/// How quickly a recent failure's score penalty decays. After one window
/// has elapsed the penalty has dropped to roughly a third of its peak.
const FAILURE_DECAY_WINDOW: Duration = Duration::from_secs(30);

/// A small xorshift generator for selection jitter (§4.5: "a small random
/// jitter to avoid herd behavior"). Hand-rolled rather than pulling in a
/// `rand` dependency the rest of the workspace has no other use for,
/// matching the teacher's habit of hand-rolling small wire-level pieces
/// (see `tchannel_core::checksum`).
fn jitter() -> f64 {
    static STATE: AtomicU64 = AtomicU64::new(0x9E3779B97F4A7C15);
    let mut x = STATE.load(Ordering::Relaxed);
    if x == 0x9E3779B97F4A7C15 {
        // Mix in the clock once so repeated process runs don't collide,
        // without pulling in a getrandom-backed crate for it.
        x ^= Instant::now().elapsed().as_nanos() as u64;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    (x >> 11) as f64 / (1u64 << 53) as f64
}

/// One known remote endpoint: its connection(s) and health stats (§3 Peer).
pub struct Peer {
    pub host_port: String,
    connections: Mutex<Vec<Connection>>,
    last_failure: Mutex<Option<Instant>>,
    dial_lock: tokio::sync::Mutex<()>,
}

impl Peer {
    fn new(host_port: String) -> Self {
        Peer {
            host_port,
            connections: Mutex::new(Vec::new()),
            last_failure: Mutex::new(None),
            dial_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Number of live connections to this peer, pruning any that have
    /// since closed.
    pub fn connection_count(&self) -> usize {
        let mut conns = self.connections.lock();
        conns.retain(|c| !c.is_closed());
        conns.len()
    }

    /// Total in-flight outbound calls across this peer's connections.
    pub fn in_flight_count(&self) -> usize {
        self.connections.lock().iter().map(|c| c.in_flight_outbound()).sum()
    }

    pub fn record_failure(&self) {
        *self.last_failure.lock() = Some(Instant::now());
    }

    pub fn record_success(&self) {
        *self.last_failure.lock() = None;
    }

    /// A live connection to this peer, if one already exists.
    pub fn existing_connection(&self) -> Option<Connection> {
        let mut conns = self.connections.lock();
        conns.retain(|c| !c.is_closed());
        conns.first().cloned()
    }

    /// All live connections to this peer, e.g. to close every one of them.
    pub fn connections(&self) -> Vec<Connection> {
        let mut conns = self.connections.lock();
        conns.retain(|c| !c.is_closed());
        conns.clone()
    }

    fn push_connection(&self, conn: Connection) {
        self.connections.lock().push(conn);
    }

    /// Score this peer for outbound selection. Higher is better. Combines
    /// connection availability, current load, failure recency and jitter
    /// (§4.5); never panics, never returns NaN.
    fn score(&self) -> f64 {
        let conn_factor = if self.connection_count() > 0 { 1.0 } else { 0.0 };
        let in_flight = self.in_flight_count() as f64;
        let load_factor = 1.0 / (1.0 + in_flight);
        let recency_penalty = match *self.last_failure.lock() {
            Some(at) => {
                let elapsed = at.elapsed().as_secs_f64();
                (-elapsed / FAILURE_DECAY_WINDOW.as_secs_f64()).exp()
            }
            None => 0.0,
        };
        conn_factor * 0.4 + load_factor * 0.4 + (1.0 - recency_penalty) * 0.2 + jitter() * 0.01
    }
}

/// Pool of known peers, shared by one [`crate::runtime::Runtime`] (§4.5).
#[derive(Default)]
pub struct PeerPool {
    peers: Mutex<HashMap<String, Arc<Peer>>>,
    config: ConnectionConfig,
    on_connection: Mutex<Option<ConnectionHook>>,
}

impl PeerPool {
    pub fn new(config: ConnectionConfig) -> Self {
        PeerPool { peers: Mutex::new(HashMap::new()), config, on_connection: Mutex::new(None) }
    }

    /// Install the hook that serves inbound events on every new
    /// connection this pool establishes. Set once by
    /// [`crate::runtime::Runtime`] before accepting/dialing anything.
    pub fn set_on_connection(&self, hook: ConnectionHook) {
        *self.on_connection.lock() = Some(hook);
    }

    /// Register a peer as known without connecting to it yet.
    pub fn add_known(&self, host_port: impl Into<String>) {
        self.get_or_create(&host_port.into());
    }

    /// Adopt an already-handshaked inbound connection into the pool, so a
    /// server that also happens to call back out reuses it (§4.5: peers
    /// may hold more than one connection during reconnect, but a freshly
    /// accepted connection is a fine first entry), and start serving its
    /// inbound events.
    pub fn adopt_inbound(&self, conn: Connection, events: ConnectionEvents) {
        let host_port = conn.peer_host_port();
        if !host_port.is_empty() {
            self.get_or_create(&host_port).push_connection(conn.clone());
        }
        self.dispatch_events(conn, events);
    }

    fn get_or_create(&self, host_port: &str) -> Arc<Peer> {
        let mut peers = self.peers.lock();
        peers
            .entry(host_port.to_string())
            .or_insert_with(|| Arc::new(Peer::new(host_port.to_string())))
            .clone()
    }

    pub fn peer(&self, host_port: &str) -> Option<Arc<Peer>> {
        self.peers.lock().get(host_port).cloned()
    }

    pub fn known_peers(&self) -> Vec<Arc<Peer>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Hand a connection's inbound events to the installed hook, or drain
    /// them silently if no dispatcher has been wired up yet (e.g. in unit
    /// tests that only exercise selection).
    pub fn dispatch_events(&self, conn: Connection, events: ConnectionEvents) {
        match self.on_connection.lock().clone() {
            Some(hook) => hook(conn, events),
            None => {
                tokio::spawn(async move {
                    let mut events = events;
                    while events.recv().await.is_some() {}
                });
            }
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Score-based selection among known peers, excluding any in
    /// `exclude`. Ties broken deterministically by `host_port` (§4.5).
    pub fn select(&self, candidates: &[String], exclude: &[String]) -> Option<Arc<Peer>> {
        let pool = self.peers.lock();
        let mut best: Option<(f64, Arc<Peer>)> = None;
        for host_port in candidates {
            if exclude.iter().any(|e| e == host_port) {
                continue;
            }
            let Some(peer) = pool.get(host_port) else { continue };
            let score = peer.score();
            let better = match &best {
                None => true,
                Some((best_score, best_peer)) => {
                    score > *best_score
                        || (score == *best_score && peer.host_port < best_peer.host_port)
                }
            };
            if better {
                best = Some((score, peer.clone()));
            }
        }
        best.map(|(_, peer)| peer)
    }

    /// Get (or establish) a handshaked connection to `peer`. Concurrent
    /// callers for the same peer share one in-flight dial via `dial_lock`
    /// (§4.5: "share a single `Once`-style guard per peer").
    pub async fn connection_for(
        &self,
        peer: &Arc<Peer>,
    ) -> Result<Connection, tchannel_core::ConnectionError> {
        if let Some(conn) = peer.existing_connection() {
            return Ok(conn);
        }
        let _guard = peer.dial_lock.lock().await;
        if let Some(conn) = peer.existing_connection() {
            return Ok(conn);
        }
        let stream = TcpStream::connect(&peer.host_port)
            .await
            .map_err(|e| tchannel_core::ConnectionError::Frame(e.into()))?;
        let (conn, events) =
            Connection::handshake_client(stream, self.config.clone()).await?;
        peer.push_connection(conn.clone());
        self.dispatch_events(conn.clone(), events);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_prefers_connected_and_idle_peer() {
        let pool = PeerPool::new(ConnectionConfig::default());
        pool.add_known("a:1");
        pool.add_known("b:1");
        let busy = pool.peer("a:1").unwrap();
        let idle = pool.peer("b:1").unwrap();
        // Neither has a connection yet, but `a` has recorded a recent
        // failure so it should score lower.
        busy.record_failure();
        let chosen = pool.select(&["a:1".into(), "b:1".into()], &[]).unwrap();
        assert_eq!(chosen.host_port, "b:1");
        let _ = idle;
    }

    #[test]
    fn select_excludes_listed_peers() {
        let pool = PeerPool::new(ConnectionConfig::default());
        pool.add_known("a:1");
        pool.add_known("b:1");
        let chosen = pool.select(&["a:1".into(), "b:1".into()], &["a:1".into()]).unwrap();
        assert_eq!(chosen.host_port, "b:1");
    }

    #[test]
    fn select_returns_none_when_all_excluded() {
        let pool = PeerPool::new(ConnectionConfig::default());
        pool.add_known("a:1");
        assert!(pool.select(&["a:1".into()], &["a:1".into()]).is_none());
    }

    #[test]
    fn ties_break_deterministically_by_host_port() {
        let pool = PeerPool::new(ConnectionConfig::default());
        pool.add_known("z:1");
        pool.add_known("a:1");
        // Both idle, no connections, no failures: score differs only by
        // jitter, but repeated selection must not panic or flap wildly;
        // what we assert is just that a choice is made.
        assert!(pool.select(&["z:1".into(), "a:1".into()], &[]).is_some());
    }
}
