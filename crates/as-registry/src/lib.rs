//! Assigns gossip-seed node IDs and serves as the liveness directory peers
//! heartbeat against.

use as_types::{GossipConfig, RegistryConfig};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub node_id: u64,
    pub ip: String,
    pub port: u16,
}

struct Record {
    ip: String,
    port: u16,
    last_seen: Instant,
}

struct Inner {
    peers: HashMap<u64, Record>,
}

pub struct RegisterResponse {
    pub node_id: u64,
    pub heartbeat_interval: Duration,
    pub random_pick: usize,
    pub prob_to_r: f64,
}

pub struct HeartbeatResponse {
    pub node_id: u64,
    pub peers: Vec<Peer>,
}

pub struct Registry {
    inner: RwLock<Inner>,
    registry: RegistryConfig,
    gossip: GossipConfig,
}

impl Registry {
    pub fn new(registry: RegistryConfig, gossip: GossipConfig) -> Self {
        Self {
            inner: RwLock::new(Inner { peers: HashMap::new() }),
            registry,
            gossip,
        }
    }

    fn fresh_node_id(&self, inner: &Inner) -> u64 {
        let bound = 1u64 << self.registry.node_id_bits;
        let mut rng = rand::thread_rng();
        loop {
            let candidate = rng.gen_range(0..bound);
            if !inner.peers.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    pub fn register(&self, ip: String, port: u16) -> RegisterResponse {
        let mut inner = self.inner.write();
        let node_id = self.fresh_node_id(&inner);
        inner.peers.insert(
            node_id,
            Record {
                ip,
                port,
                last_seen: Instant::now(),
            },
        );
        tracing::info!(node_id, "seed registered");
        RegisterResponse {
            node_id,
            // Peers heartbeat at 2/3 of the sweep interval so they're never
            // swept between beats.
            heartbeat_interval: self.registry.heartbeat_interval * 2 / 3,
            random_pick: self.gossip.random_pick,
            prob_to_r: self.gossip.prob_to_r,
        }
    }

    /// Refreshes a peer's liveness. If the prior record is missing, or its
    /// `(ip, port)` no longer matches (the id was recycled to someone else),
    /// a fresh node id is minted.
    pub fn heartbeat(&self, node_id: u64, ip: String, port: u16) -> HeartbeatResponse {
        let mut inner = self.inner.write();
        let needs_new_id = match inner.peers.get(&node_id) {
            Some(rec) => rec.ip != ip || rec.port != port,
            None => true,
        };
        let effective_id = if needs_new_id {
            let fresh = self.fresh_node_id(&inner);
            tracing::warn!(old = node_id, new = fresh, "heartbeat node id recycled, reissuing");
            fresh
        } else {
            node_id
        };
        inner.peers.insert(
            effective_id,
            Record {
                ip: ip.clone(),
                port,
                last_seen: Instant::now(),
            },
        );
        let peers = inner
            .peers
            .iter()
            .filter(|(&id, _)| id != effective_id)
            .map(|(&id, rec)| Peer {
                node_id: id,
                ip: rec.ip.clone(),
                port: rec.port,
            })
            .collect();
        HeartbeatResponse {
            node_id: effective_id,
            peers,
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_alive(&self, node_id: u64) -> bool {
        self.inner.read().peers.contains_key(&node_id)
    }

    pub fn sweep_once(&self) {
        let mut inner = self.inner.write();
        let now = Instant::now();
        let interval = self.registry.heartbeat_interval;
        let dead: Vec<u64> = inner
            .peers
            .iter()
            .filter(|(_, rec)| now.duration_since(rec.last_seen) > interval)
            .map(|(&id, _)| id)
            .collect();
        for id in &dead {
            inner.peers.remove(id);
            tracing::debug!(node_id = id, "removed dead peer");
        }
    }

    pub fn spawn_sweep(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        let interval = self.registry.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => registry.sweep_once(),
                    _ = stop.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Registry {
        Registry::new(RegistryConfig::default(), GossipConfig::default())
    }

    #[test]
    fn register_assigns_unique_ids() {
        let reg = registry();
        let a = reg.register("10.0.0.1".into(), 9000);
        let b = reg.register("10.0.0.2".into(), 9000);
        assert_ne!(a.node_id, b.node_id);
        assert_eq!(reg.peer_count(), 2);
    }

    #[test]
    fn heartbeat_refreshes_same_peer() {
        let reg = registry();
        let r = reg.register("10.0.0.1".into(), 9000);
        let hb = reg.heartbeat(r.node_id, "10.0.0.1".into(), 9000);
        assert_eq!(hb.node_id, r.node_id);
        assert_eq!(reg.peer_count(), 1);
    }

    #[test]
    fn heartbeat_with_stale_id_gets_new_id() {
        let reg = registry();
        // Heartbeat for a node id that was never registered must mint a new one.
        let hb = reg.heartbeat(12345, "10.0.0.9".into(), 9000);
        assert!(reg.is_alive(hb.node_id));
    }

    #[test]
    fn heartbeat_returns_other_live_peers_only() {
        let reg = registry();
        let a = reg.register("10.0.0.1".into(), 9000);
        let b = reg.register("10.0.0.2".into(), 9000);
        let hb = reg.heartbeat(a.node_id, "10.0.0.1".into(), 9000);
        assert_eq!(hb.peers.len(), 1);
        assert_eq!(hb.peers[0].node_id, b.node_id);
    }

    #[test]
    fn sweep_removes_idle_peers() {
        let reg = Registry::new(
            RegistryConfig {
                node_id_bits: 20,
                heartbeat_interval: Duration::from_millis(1),
            },
            GossipConfig::default(),
        );
        reg.register("10.0.0.1".into(), 9000);
        std::thread::sleep(Duration::from_millis(5));
        reg.sweep_once();
        assert_eq!(reg.peer_count(), 0);
    }
}
