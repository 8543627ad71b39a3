//! `StrategyManager` is the façade agents talk to: it classifies operations
//! via the trace graph, refreshes the operation store, consults the sampling
//! strategy tree for ingress operations, and closes the promotion loop.
//! `ConfigServer` is the composition root wiring every component together.

use as_evaluator::Evaluator;
use as_gossip::{GossipSeed, GossipTransport, MessageHandler, MessageKind};
use as_processor::{GraphSink, InboundSpan, PromoteSink, SpanFilter, SpanProcessor, SpanWriter};
use as_registry::Registry;
use as_sst::Sst;
use as_store::OperationStore;
use as_tracegraph::TraceGraph;
use as_types::{clamp, Config, DefaultStrategyKind, Operation, Relation, RuleSet, Strategy, StrategyKind, StrategyPayload};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub struct StrategyManager {
    tg: Arc<TraceGraph>,
    sst: Arc<Sst>,
    store: Arc<OperationStore>,
    gossip: Arc<GossipSeed>,
    config: as_types::ManagerConfig,
    overrides: RwLock<HashMap<Operation, DefaultStrategyKind>>,
}

impl StrategyManager {
    pub fn new(
        tg: Arc<TraceGraph>,
        sst: Arc<Sst>,
        store: Arc<OperationStore>,
        gossip: Arc<GossipSeed>,
        config: as_types::ManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            tg,
            sst,
            store,
            gossip,
            config,
            overrides: RwLock::new(HashMap::new()),
        })
    }

    pub fn set_override(&self, op: Operation, kind: DefaultStrategyKind) {
        self.overrides.write().insert(op, kind);
    }

    /// Computes a strategy per requested `(operation name, reported qps)` pair.
    /// Lock order follows the documented discipline: trace graph, then the
    /// operation store, then the sampling strategy tree.
    pub fn get_strategies(&self, service: &str, ops: &[(String, f64)]) -> Vec<Strategy> {
        let mut strategies = Vec::with_capacity(ops.len());
        for (name, qps) in ops {
            let Ok(op) = Operation::new(service, name.clone()) else {
                continue;
            };

            let is_ingress = match self.tg.is_ingress(&op) {
                Ok(b) => b,
                Err(_) => {
                    let _ = self.tg.add(op.clone());
                    self.gossip.originate(MessageKind::NewOperation(op.clone()));
                    true
                }
            };

            self.store.up_to_date(op.clone(), is_ingress, *qps);

            if !is_ingress {
                if self.sst.contains(&op) {
                    let _ = self.sst.prune(&op);
                }
                let default_kind = self.overrides.read().get(&op).copied().unwrap_or(self.config.default_strategy);
                strategies.push(self.default_strategy(op, default_kind));
                continue;
            }

            let kind = self
                .overrides
                .read()
                .get(&op)
                .copied()
                .unwrap_or(self.config.default_strategy);
            let weight = self.store.qps_weight(&op);

            let strategy = match kind {
                DefaultStrategyKind::Dynamic => {
                    if !self.sst.contains(&op) {
                        let _ = self.sst.add(op.clone());
                    }
                    let sr = self.sst.generate(&op).unwrap_or(1.0);
                    let rate = clamp(sr * weight * self.config.scale_factor, self.config.min_sampling_rate, 1.0);
                    Strategy {
                        operation: op,
                        kind: StrategyKind::Dynamic,
                        payload: StrategyPayload::Dynamic { sampling_rate: rate },
                    }
                }
                DefaultStrategyKind::Adaptive => {
                    let rate = clamp(weight * self.config.scale_factor, self.config.min_sampling_rate, 1.0);
                    Strategy {
                        operation: op,
                        kind: StrategyKind::Adaptive,
                        payload: StrategyPayload::Adaptive { sampling_rate: rate },
                    }
                }
            };
            strategies.push(strategy);
        }
        strategies
    }

    /// Full-rate strategy for a non-ingress operation, shaped as the
    /// configured default strategy kind rebound to `op` rather than a fixed
    /// wire type.
    fn default_strategy(&self, op: Operation, kind: DefaultStrategyKind) -> Strategy {
        match kind {
            DefaultStrategyKind::Dynamic => Strategy {
                operation: op,
                kind: StrategyKind::Dynamic,
                payload: StrategyPayload::Dynamic { sampling_rate: 1.0 },
            },
            DefaultStrategyKind::Adaptive => Strategy {
                operation: op,
                kind: StrategyKind::Adaptive,
                payload: StrategyPayload::Adaptive { sampling_rate: 1.0 },
            },
        }
    }

    /// Promotes `op` if it's an ingress; otherwise promotes every ingress
    /// that reaches it, per the richer fallback this repository settled on.
    pub fn promote(&self, op: &Operation) {
        match self.tg.is_ingress(op) {
            Ok(true) => {
                let _ = self.sst.promote(op);
            }
            Ok(false) => {
                if let Ok(ingresses) = self.tg.get_ingresses(op) {
                    for ingress in ingresses {
                        let _ = self.sst.promote(&ingress);
                    }
                }
            }
            Err(_) => tracing::debug!(%op, "promote requested for unknown operation"),
        }
    }
}

/// Wires gossip-delivered messages back into the trace graph / SST / evaluator.
pub struct GossipBridge {
    tg: Arc<TraceGraph>,
    sst: Arc<Sst>,
    evaluator: Arc<Evaluator>,
}

impl MessageHandler for GossipBridge {
    fn on_new_relation(&self, relation: &Relation) {
        let _ = self.tg.add(relation.from().clone());
        let _ = self.tg.add(relation.to().clone());
        let _ = self.tg.add_relation(relation.from(), relation.to());
    }

    fn on_new_operation(&self, op: &Operation) {
        let _ = self.tg.add(op.clone());
    }

    fn on_expired_operation(&self, op: &Operation) {
        let _ = self.tg.remove(op);
        let _ = self.sst.prune(op);
    }

    fn on_evaluating_tags(&self, rules: &RuleSet) {
        self.evaluator.update(rules.clone());
    }
}

/// Bridges the span processor's parser stage into the trace graph, gossiping
/// whatever it newly learns.
pub struct ProcessorGraphBridge {
    tg: Arc<TraceGraph>,
    gossip: Arc<GossipSeed>,
}

impl GraphSink for ProcessorGraphBridge {
    fn knows(&self, op: &Operation) -> bool {
        self.tg.contains(op)
    }

    fn commit_relation(&self, relation: &Relation) {
        if self.tg.add(relation.from().clone()).is_ok() {
            self.gossip.originate(MessageKind::NewOperation(relation.from().clone()));
        }
        if self.tg.add(relation.to().clone()).is_ok() {
            self.gossip.originate(MessageKind::NewOperation(relation.to().clone()));
        }
        if self.tg.add_relation(relation.from(), relation.to()).is_ok() {
            self.gossip.originate(MessageKind::NewRelation(relation.clone()));
        }
    }
}

/// Bridges the span processor's evaluate stage into `StrategyManager::promote`.
pub struct ProcessorPromoteBridge {
    manager: Arc<StrategyManager>,
}

impl PromoteSink for ProcessorPromoteBridge {
    fn promote(&self, op: &Operation) {
        self.manager.promote(op);
    }
}

/// The composition root: owns every component and the background tasks that
/// drive their sweeps, matching the single-process, multi-service layout
/// this control plane is specified to run as.
pub struct ConfigServer {
    pub tg: Arc<TraceGraph>,
    pub sst: Arc<Sst>,
    pub store: Arc<OperationStore>,
    pub evaluator: Arc<Evaluator>,
    pub registry: Arc<Registry>,
    pub gossip: Arc<GossipSeed>,
    pub processor: Arc<SpanProcessor>,
    pub manager: Arc<StrategyManager>,
    stop_tx: watch::Sender<bool>,
    tasks: AsyncMutex<Vec<JoinHandle<()>>>,
}

impl ConfigServer {
    pub fn new(
        config: Config,
        node_id: u64,
        filter: Arc<dyn SpanFilter>,
        writer: Arc<dyn SpanWriter>,
        transport: Arc<dyn GossipTransport>,
    ) -> Arc<Self> {
        let tg = Arc::new(TraceGraph::new());
        let sst = Arc::new(Sst::new(config.sst.max_fanout));
        let store = Arc::new(OperationStore::new(config.store));
        let evaluator = Arc::new(Evaluator::new());
        let registry = Arc::new(Registry::new(config.registry, config.gossip));

        let gossip_bridge = Arc::new(GossipBridge {
            tg: Arc::clone(&tg),
            sst: Arc::clone(&sst),
            evaluator: Arc::clone(&evaluator),
        });
        let gossip = Arc::new(GossipSeed::new(
            config.gossip,
            node_id,
            config.registry.node_id_bits,
            gossip_bridge,
            transport,
        ));

        let manager = StrategyManager::new(
            Arc::clone(&tg),
            Arc::clone(&sst),
            Arc::clone(&store),
            Arc::clone(&gossip),
            config.manager,
        );

        let graph_bridge = Arc::new(ProcessorGraphBridge {
            tg: Arc::clone(&tg),
            gossip: Arc::clone(&gossip),
        });
        let promote_bridge = Arc::new(ProcessorPromoteBridge { manager: Arc::clone(&manager) });
        let processor = SpanProcessor::new(
            config.queue,
            filter,
            Arc::clone(&evaluator),
            graph_bridge,
            promote_bridge,
            writer,
        );

        let (stop_tx, _) = watch::channel(false);

        Arc::new(Self {
            tg,
            sst,
            store,
            evaluator,
            registry,
            gossip,
            processor,
            manager,
            stop_tx,
            tasks: AsyncMutex::new(Vec::new()),
        })
    }

    /// Spawns every background sweep/resize task. Idempotent only in the
    /// sense that calling it twice spawns a second set of tasks; callers
    /// should call it once per process lifetime.
    pub async fn start(self: &Arc<Self>) {
        let stop = self.stop_tx.subscribe();
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.store.spawn_sweep(
            Arc::new({
                let tg = Arc::clone(&self.tg);
                let sst = Arc::clone(&self.sst);
                let gossip = Arc::clone(&self.gossip);
                move |op: &Operation| {
                    let _ = tg.remove(op);
                    let _ = sst.prune(op);
                    gossip.originate(MessageKind::ExpiredOperation(op.clone()));
                }
            }),
            stop.clone(),
        ));
        tasks.push(self.registry.spawn_sweep(stop.clone()));
        for handle in self.processor.spawn_workers(stop.clone()) {
            tasks.push(handle);
        }
        tasks.push(self.processor.spawn_resize_loop(stop.clone()));
        tasks.push(self.processor.spawn_retry_sweep(stop.clone()));
    }

    /// Signals every background task to stop and waits for them to finish.
    pub async fn stop(self: &Arc<Self>) {
        let _ = self.stop_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
    }

    pub fn process_spans(&self, spans: Vec<InboundSpan>, report_busy: bool) -> Result<Vec<bool>, as_processor::ProcessorError> {
        self.processor.process_spans(spans, report_busy)
    }
}
