//! Dials peers' `Seed.Sync` RPC to forward gossip messages over the wire.

use crate::convert::gossip_message_to_proto;
use as_gossip::{GossipTransport, Message};
use as_proto::seed_client::SeedClient;
use as_registry::Peer;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tonic::transport::Channel;

/// Caches one tonic channel per peer so repeated forwards don't redial.
pub struct TonicGossipTransport {
    clients: Arc<Mutex<HashMap<u64, SeedClient<Channel>>>>,
    runtime: tokio::runtime::Handle,
}

impl TonicGossipTransport {
    pub fn new(runtime: tokio::runtime::Handle) -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
            runtime,
        }
    }

    fn cached_client(&self, node_id: u64) -> Option<SeedClient<Channel>> {
        self.clients.lock().get(&node_id).cloned()
    }
}

impl GossipTransport for TonicGossipTransport {
    /// Spawns the dial-and-send as a detached task so this never blocks the
    /// caller (which may itself be running inside the same runtime).
    fn send(&self, peer: &Peer, message: &Message) {
        let request = gossip_message_to_proto(message);
        let node_id = peer.node_id;
        let cached = self.cached_client(node_id);
        let endpoint = format!("http://{}:{}", peer.ip, peer.port);
        let clients = Arc::clone(&self.clients);
        self.runtime.spawn(async move {
            let mut client = match cached {
                Some(client) => client,
                None => match SeedClient::connect(endpoint).await {
                    Ok(client) => {
                        clients.lock().insert(node_id, client.clone());
                        client
                    }
                    Err(e) => {
                        tracing::debug!(node_id, %e, "failed to dial gossip peer");
                        return;
                    }
                },
            };
            if let Err(e) = client.sync(request).await {
                tracing::debug!(node_id, %e, "gossip forward failed");
            }
        });
    }
}
