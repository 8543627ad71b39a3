//! Epidemic dissemination: an SIR (Susceptible/Infected/Removed) state machine
//! over message ids, plus the snowflake-style id generator that keeps those
//! ids unique across a mesh whose node ids may be recycled.

use as_registry::Peer;
use as_types::{GossipConfig, Operation, Relation, RuleSet};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    NewRelation(Relation),
    NewOperation(Operation),
    ExpiredOperation(Operation),
    EvaluatingTags(RuleSet),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub msg_id: i64,
    pub kind: MessageKind,
}

/// 63-bit id: 41 bits of millisecond timestamp, `node_id_bits` bits of node
/// id, and whatever remains for an in-millisecond sequence counter.
pub struct Snowflake {
    node_id: u64,
    node_id_bits: u32,
    sequence_bits: u32,
    state: Mutex<(i64, u64)>, // (last_ts_ms, sequence)
}

impl Snowflake {
    pub fn new(node_id: u64, node_id_bits: u32) -> Self {
        let sequence_bits = 63u32.saturating_sub(41).saturating_sub(node_id_bits).max(1);
        Self {
            node_id,
            node_id_bits,
            sequence_bits,
            state: Mutex::new((0, 0)),
        }
    }

    fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }

    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        let seq_mask = (1u64 << self.sequence_bits) - 1;
        loop {
            let now = Self::now_ms();
            let (last_ts, seq) = *state;
            if now > last_ts {
                *state = (now, 0);
                break;
            }
            let next_seq = (seq + 1) & seq_mask;
            if next_seq == 0 {
                // sequence exhausted this millisecond; spin to the next one.
                continue;
            }
            *state = (last_ts, next_seq);
            break;
        }
        let (ts, seq) = *state;
        (ts << (self.node_id_bits + self.sequence_bits)) | ((self.node_id & ((1 << self.node_id_bits) - 1)) << self.sequence_bits) | seq
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SirState {
    Infected,
    Removed,
}

struct MessageCache {
    capacity: usize,
    order: VecDeque<i64>,
    state: HashMap<i64, SirState>,
}

impl MessageCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            state: HashMap::new(),
        }
    }

    fn get(&self, msg_id: i64) -> Option<SirState> {
        self.state.get(&msg_id).copied()
    }

    fn set(&mut self, msg_id: i64, state: SirState) {
        self.state.insert(msg_id, state);
    }

    /// Atomically checks and claims first reception of `msg_id`: if absent,
    /// inserts a provisional `Infected` entry and returns `true`; otherwise
    /// leaves the existing entry untouched and returns `false`. Callers that
    /// win the claim own delivering the message exactly once.
    fn claim_first(&mut self, msg_id: i64) -> bool {
        use std::collections::hash_map::Entry;
        match self.state.entry(msg_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(v) => {
                v.insert(SirState::Infected);
                self.order.push_back(msg_id);
                while self.order.len() > self.capacity {
                    if let Some(evicted) = self.order.pop_front() {
                        self.state.remove(&evicted);
                    }
                }
                true
            }
        }
    }
}

/// Handles a message delivered locally for the first time.
pub trait MessageHandler: Send + Sync {
    fn on_new_relation(&self, relation: &Relation);
    fn on_new_operation(&self, op: &Operation);
    fn on_expired_operation(&self, op: &Operation);
    fn on_evaluating_tags(&self, rules: &RuleSet);
}

/// Unary RPC to another seed; implemented by the RPC transport layer.
pub trait GossipTransport: Send + Sync {
    fn send(&self, peer: &Peer, message: &Message);
}

pub struct GossipSeed {
    config: GossipConfig,
    snowflake: Snowflake,
    cache: Mutex<MessageCache>,
    peers: Mutex<Vec<Peer>>,
    handler: Arc<dyn MessageHandler>,
    transport: Arc<dyn GossipTransport>,
}

impl GossipSeed {
    pub fn new(
        config: GossipConfig,
        node_id: u64,
        node_id_bits: u32,
        handler: Arc<dyn MessageHandler>,
        transport: Arc<dyn GossipTransport>,
    ) -> Self {
        Self {
            cache: Mutex::new(MessageCache::new(config.lru_size)),
            snowflake: Snowflake::new(node_id, node_id_bits),
            config,
            peers: Mutex::new(Vec::new()),
            handler,
            transport,
        }
    }

    pub fn set_peers(&self, peers: Vec<Peer>) {
        *self.peers.lock() = peers;
    }

    fn deliver(&self, kind: &MessageKind) {
        match kind {
            MessageKind::NewRelation(r) => self.handler.on_new_relation(r),
            MessageKind::NewOperation(op) => self.handler.on_new_operation(op),
            MessageKind::ExpiredOperation(op) => self.handler.on_expired_operation(op),
            MessageKind::EvaluatingTags(rs) => self.handler.on_evaluating_tags(rs),
        }
    }

    fn forward(&self, message: &Message) {
        let peers = self.peers.lock().clone();
        if peers.is_empty() {
            return;
        }
        let pick = self.config.random_pick.min(peers.len());
        let mut rng = rand::thread_rng();
        let mut indices: Vec<usize> = (0..peers.len()).collect();
        for i in (1..indices.len()).rev() {
            let j = rng.gen_range(0..=i);
            indices.swap(i, j);
        }
        for &idx in indices.iter().take(pick) {
            self.transport.send(&peers[idx], message);
        }
    }

    /// Processes a message received from the wire (or from `originate`),
    /// applying the SIR transition and forwarding as specified. First
    /// reception is claimed atomically under the cache lock so concurrent
    /// `receive` calls for the same `msg_id` never both deliver.
    pub fn receive(&self, message: Message) {
        let mut rng = rand::thread_rng();
        let won_first = self.cache.lock().claim_first(message.msg_id);
        if won_first {
            self.deliver(&message.kind);
            let roll: f64 = rng.gen();
            let new_state = if roll < self.config.prob_to_r {
                SirState::Removed
            } else {
                SirState::Infected
            };
            self.cache.lock().set(message.msg_id, new_state);
            self.forward(&message);
            return;
        }
        match self.cache.lock().get(message.msg_id) {
            Some(SirState::Infected) | None => {
                let roll: f64 = rng.gen();
                if roll < self.config.prob_to_r {
                    self.cache.lock().set(message.msg_id, SirState::Removed);
                } else {
                    self.forward(&message);
                }
            }
            Some(SirState::Removed) => {
                tracing::trace!(msg_id = message.msg_id, "dropping removed-state gossip message");
            }
        }
    }

    /// Originates a fresh message, delivering it locally through the same
    /// path an inbound message would take so the originator is immunised too.
    pub fn originate(&self, kind: MessageKind) -> i64 {
        let msg_id = self.snowflake.next_id();
        let message = Message { msg_id, kind };
        self.receive(message);
        msg_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct CountingHandler {
        relations: AtomicUsize,
    }

    impl MessageHandler for CountingHandler {
        fn on_new_relation(&self, _: &Relation) {
            self.relations.fetch_add(1, Ordering::SeqCst);
        }
        fn on_new_operation(&self, _: &Operation) {}
        fn on_expired_operation(&self, _: &Operation) {}
        fn on_evaluating_tags(&self, _: &RuleSet) {}
    }

    struct RecordingTransport {
        sent: StdMutex<Vec<(u64, i64)>>,
    }

    impl GossipTransport for RecordingTransport {
        fn send(&self, peer: &Peer, message: &Message) {
            self.sent.lock().unwrap().push((peer.node_id, message.msg_id));
        }
    }

    fn seed(handler: Arc<CountingHandler>, transport: Arc<RecordingTransport>) -> GossipSeed {
        GossipSeed::new(GossipConfig::default(), 1, 20, handler, transport)
    }

    #[test]
    fn snowflake_ids_are_monotonic_and_unique() {
        let sf = Snowflake::new(7, 20);
        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(sf.next_id());
        }
        for w in ids.windows(2) {
            assert!(w[1] > w[0], "{:?}", w);
        }
    }

    #[test]
    fn different_node_ids_never_collide_in_same_tick() {
        let a = Snowflake::new(1, 20);
        let b = Snowflake::new(2, 20);
        assert_ne!(a.next_id(), b.next_id());
    }

    #[test]
    fn concurrent_first_reception_delivers_exactly_once() {
        let handler = Arc::new(CountingHandler { relations: AtomicUsize::new(0) });
        let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
        let seed = Arc::new(seed(Arc::clone(&handler), transport));
        let a = Operation::new("svc", "a").unwrap();
        let b = Operation::new("svc", "b").unwrap();
        let relation = Relation::new(a, b).unwrap();
        let msg = Message { msg_id: 7, kind: MessageKind::NewRelation(relation) };

        let threads: Vec<_> = (0..16)
            .map(|_| {
                let seed = Arc::clone(&seed);
                let msg = msg.clone();
                std::thread::spawn(move || seed.receive(msg))
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(handler.relations.load(Ordering::SeqCst), 1, "concurrent Sync calls for the same msg_id must deliver only once");
    }

    #[test]
    fn first_reception_delivers_exactly_once() {
        let handler = Arc::new(CountingHandler { relations: AtomicUsize::new(0) });
        let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
        let seed = seed(Arc::clone(&handler), transport);
        let a = Operation::new("svc", "a").unwrap();
        let b = Operation::new("svc", "b").unwrap();
        let relation = Relation::new(a, b).unwrap();
        let msg = Message { msg_id: 42, kind: MessageKind::NewRelation(relation) };
        seed.receive(msg.clone());
        seed.receive(msg);
        assert_eq!(handler.relations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_state_never_forwards_again() {
        let handler = Arc::new(CountingHandler { relations: AtomicUsize::new(0) });
        let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
        let config = GossipConfig { prob_to_r: 1.0, ..GossipConfig::default() };
        let seed = GossipSeed::new(config, 1, 20, handler, Arc::clone(&transport));
        seed.set_peers(vec![Peer { node_id: 99, ip: "10.0.0.2".into(), port: 9000 }]);
        let a = Operation::new("svc", "a").unwrap();
        seed.receive(Message { msg_id: 1, kind: MessageKind::NewOperation(a) });
        // prob_to_r = 1.0 so the very first reception already transitions to Removed
        // but still forwards once (the S-tick always forwards per spec).
        assert_eq!(transport.sent.lock().unwrap().len(), 1);
        let a2 = Operation::new("svc", "a").unwrap();
        seed.receive(Message { msg_id: 1, kind: MessageKind::NewOperation(a2) });
        assert_eq!(transport.sent.lock().unwrap().len(), 1, "removed state must not forward again");
    }

    #[test]
    fn originate_immunises_the_originator() {
        let handler = Arc::new(CountingHandler { relations: AtomicUsize::new(0) });
        let transport = Arc::new(RecordingTransport { sent: StdMutex::new(Vec::new()) });
        let seed = seed(Arc::clone(&handler), Arc::clone(&transport));
        let a = Operation::new("svc", "a").unwrap();
        let b = Operation::new("svc", "b").unwrap();
        let relation = Relation::new(a, b).unwrap();
        let msg_id = seed.originate(MessageKind::NewRelation(relation.clone()));
        seed.receive(Message { msg_id, kind: MessageKind::NewRelation(relation) });
        assert_eq!(handler.relations.load(Ordering::SeqCst), 1);
    }
}
