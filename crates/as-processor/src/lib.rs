//! Dynamic bounded span queue feeding a worker pool that runs the
//! filter -> parse -> promote-check -> persist pipeline per span.

use as_evaluator::Evaluator;
use as_types::{Operation, QueueConfig, Relation, SpanTags};
use parking_lot::RwLock;
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

const GROW_THRESHOLD: usize = 1 << 20;

/// A span as the processor sees it: its own identity plus the tags the
/// filter/parser/evaluator stages read.
#[derive(Debug, Clone)]
pub struct InboundSpan {
    pub operation: Operation,
    pub tags: SpanTags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    Busy,
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "span queue is at capacity"),
        }
    }
}

impl Error for ProcessorError {}

struct Channel<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<AsyncMutex<mpsc::Receiver<T>>>,
}

/// Bounded queue that resizes its backing channel under a write lock while
/// producers only ever need a read lock.
pub struct DynamicQueue<T> {
    channel: RwLock<Channel<T>>,
    len: AtomicUsize,
    capacity: AtomicUsize,
    min_capacity: usize,
}

impl<T: Send + 'static> DynamicQueue<T> {
    pub fn new(min_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(min_capacity);
        Self {
            channel: RwLock::new(Channel { tx, rx: Arc::new(AsyncMutex::new(rx)) }),
            len: AtomicUsize::new(0),
            capacity: AtomicUsize::new(min_capacity),
            min_capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.len.load(Ordering::SeqCst)
    }

    /// Non-blocking enqueue; false means the channel is currently full.
    pub fn produce(&self, item: T) -> bool {
        let channel = self.channel.read();
        match channel.tx.try_send(item) {
            Ok(()) => {
                self.len.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(_) => false,
        }
    }

    pub async fn recv(&self) -> Option<T> {
        let rx = self.channel.read().rx.clone();
        let mut guard = rx.lock().await;
        let item = guard.recv().await;
        if item.is_some() {
            self.len.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Applies the resize policy for one tick: grow when at/above capacity,
    /// shrink when at/below half capacity and above the configured floor.
    pub async fn maybe_resize(&self) {
        let capacity = self.capacity();
        let size = self.size();
        let new_capacity = if size >= capacity {
            if capacity < GROW_THRESHOLD {
                capacity * 2
            } else {
                (capacity as f64 * 1.25) as usize
            }
        } else if size <= capacity / 2 && capacity > self.min_capacity {
            ((capacity as f64 * 0.6) as usize).max(self.min_capacity)
        } else {
            capacity
        };
        if new_capacity != capacity {
            self.resize(new_capacity).await;
        }
    }

    async fn resize(&self, new_capacity: usize) {
        let (new_tx, mut new_rx) = mpsc::channel(new_capacity.max(1));
        let mut channel = self.channel.write();
        let old_rx = channel.rx.clone();
        drop(channel);
        {
            let mut old_guard = old_rx.lock().await;
            while let Ok(item) = old_guard.try_recv() {
                if new_tx.try_send(item).is_err() {
                    break;
                }
            }
        }
        let new_len = new_rx.len();
        let mut channel = self.channel.write();
        *channel = Channel { tx: new_tx, rx: Arc::new(AsyncMutex::new(new_rx)) };
        self.capacity.store(new_capacity, Ordering::SeqCst);
        self.len.store(new_len, Ordering::SeqCst);
        tracing::debug!(new_capacity, new_len, "span queue resized");
    }
}

/// External filter stage (upstream collaborator, not implemented here).
pub trait SpanFilter: Send + Sync {
    fn accept(&self, tags: &SpanTags) -> bool;
}

/// External persistence stage (upstream collaborator, not implemented here).
pub trait SpanWriter: Send + Sync {
    fn write(&self, span: &InboundSpan);
}

/// Bridge into the trace graph: whether an operation is already known, and
/// how to commit a resolved parent -> child relation (wiring TG and gossip).
pub trait GraphSink: Send + Sync {
    fn knows(&self, op: &Operation) -> bool;
    fn commit_relation(&self, relation: &Relation);
}

/// Bridge into the strategy manager's promotion path.
pub trait PromoteSink: Send + Sync {
    fn promote(&self, op: &Operation);
}

struct RetryEntry {
    relation: Relation,
    since: Instant,
}

/// Holds parsed relations whose parent endpoint is not yet known to the
/// trace graph, retrying until `retry_expiry` elapses (the expiry-based
/// semantics this repository settled on; see DESIGN.md).
struct RetryQueue {
    entries: parking_lot::Mutex<Vec<RetryEntry>>,
    expiry: Duration,
}

impl RetryQueue {
    fn new(expiry: Duration) -> Self {
        Self { entries: parking_lot::Mutex::new(Vec::new()), expiry }
    }

    fn push(&self, relation: Relation) {
        self.entries.lock().push(RetryEntry { relation, since: Instant::now() });
    }

    fn sweep_once(&self, graph: &dyn GraphSink) {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        entries.retain_mut(|entry| {
            if graph.knows(entry.relation.from()) {
                graph.commit_relation(&entry.relation);
                false
            } else if now.duration_since(entry.since) > self.expiry {
                tracing::debug!(from = %entry.relation.from(), to = %entry.relation.to(), "retry relation expired, dropping");
                false
            } else {
                true
            }
        });
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct SpanProcessor {
    queue: DynamicQueue<InboundSpan>,
    retry: RetryQueue,
    filter: Arc<dyn SpanFilter>,
    evaluator: Arc<Evaluator>,
    graph: Arc<dyn GraphSink>,
    promote: Arc<dyn PromoteSink>,
    writer: Arc<dyn SpanWriter>,
    config: QueueConfig,
}

impl SpanProcessor {
    pub fn new(
        config: QueueConfig,
        filter: Arc<dyn SpanFilter>,
        evaluator: Arc<Evaluator>,
        graph: Arc<dyn GraphSink>,
        promote: Arc<dyn PromoteSink>,
        writer: Arc<dyn SpanWriter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue: DynamicQueue::new(config.min_capacity),
            retry: RetryQueue::new(config.retry_expiry),
            filter,
            evaluator,
            graph,
            promote,
            writer,
            config,
        })
    }

    pub fn queue_size(&self) -> usize {
        self.queue.size()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn retry_queue_len(&self) -> usize {
        self.retry.len()
    }

    /// Enqueues every span; returns `Busy` as soon as one enqueue is rejected
    /// when `report_busy` is set, otherwise returns the full acceptance vector.
    pub fn process_spans(&self, spans: Vec<InboundSpan>, report_busy: bool) -> Result<Vec<bool>, ProcessorError> {
        let mut accepted = Vec::with_capacity(spans.len());
        for span in spans {
            let ok = self.queue.produce(span);
            if !ok && report_busy {
                return Err(ProcessorError::Busy);
            }
            accepted.push(ok);
        }
        Ok(accepted)
    }

    fn process_one(&self, span: InboundSpan) {
        if !self.filter.accept(&span.tags) {
            return;
        }
        if let Some((p_svc, p_op)) = span.tags.parent() {
            if let Ok(parent) = Operation::new(p_svc, p_op) {
                if let Ok(relation) = Relation::new(parent.clone(), span.operation.clone()) {
                    if self.graph.knows(&parent) {
                        self.graph.commit_relation(&relation);
                    } else {
                        self.retry.push(relation);
                    }
                }
            }
        }
        if self.evaluator.evaluate(&span.tags) {
            self.promote.promote(&span.operation);
        }
        self.writer.write(&span);
    }

    pub async fn run_worker(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                item = self.queue.recv() => match item {
                    Some(span) => self.process_one(span),
                    None => break,
                },
                _ = stop.changed() => break,
            }
        }
    }

    pub fn spawn_workers(self: &Arc<Self>, stop: watch::Receiver<bool>) -> Vec<tokio::task::JoinHandle<()>> {
        (0..self.config.worker_count)
            .map(|_| tokio::spawn(Arc::clone(self).run_worker(stop.clone())))
            .collect()
    }

    pub fn spawn_resize_loop(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let processor = Arc::clone(self);
        let interval = self.config.resize_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => processor.queue.maybe_resize().await,
                    _ = stop.changed() => break,
                }
            }
        })
    }

    pub fn spawn_retry_sweep(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let processor = Arc::clone(self);
        let interval = self.config.retry_expiry;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => processor.retry.sweep_once(processor.graph.as_ref()),
                    _ = stop.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use as_types::TaggedValue;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct AcceptAll;
    impl SpanFilter for AcceptAll {
        fn accept(&self, _: &SpanTags) -> bool {
            true
        }
    }

    struct RejectAll;
    impl SpanFilter for RejectAll {
        fn accept(&self, _: &SpanTags) -> bool {
            false
        }
    }

    struct RecordingWriter {
        written: StdMutex<Vec<Operation>>,
    }
    impl SpanWriter for RecordingWriter {
        fn write(&self, span: &InboundSpan) {
            self.written.lock().unwrap().push(span.operation.clone());
        }
    }

    struct FakeGraph {
        known: StdMutex<Vec<Operation>>,
        committed: StdMutex<Vec<Relation>>,
    }
    impl GraphSink for FakeGraph {
        fn knows(&self, op: &Operation) -> bool {
            self.known.lock().unwrap().contains(op)
        }
        fn commit_relation(&self, relation: &Relation) {
            self.committed.lock().unwrap().push(relation.clone());
        }
    }

    struct FlagPromote {
        promoted: AtomicBool,
    }
    impl PromoteSink for FlagPromote {
        fn promote(&self, _: &Operation) {
            self.promoted.store(true, Ordering::SeqCst);
        }
    }

    fn op(s: &str, n: &str) -> Operation {
        Operation::new(s, n).unwrap()
    }

    #[tokio::test]
    async fn queue_resize_grows_when_full() {
        let q: DynamicQueue<u32> = DynamicQueue::new(2);
        assert!(q.produce(1));
        assert!(q.produce(2));
        assert!(!q.produce(3), "queue at capacity must reject");
        q.maybe_resize().await;
        assert!(q.capacity() > 2);
        assert!(q.produce(3));
    }

    #[tokio::test]
    async fn queue_resize_shrinks_when_underutilized() {
        let q: DynamicQueue<u32> = DynamicQueue::new(100);
        q.maybe_resize().await; // size 0 <= 50, capacity(100) > min_capacity(100)? false, no shrink since capacity==min
        assert_eq!(q.capacity(), 100);
    }

    #[test]
    fn process_spans_reports_busy_when_requested() {
        let graph = Arc::new(FakeGraph { known: StdMutex::new(vec![]), committed: StdMutex::new(vec![]) });
        let processor = SpanProcessor::new(
            QueueConfig { min_capacity: 1, ..QueueConfig::default() },
            Arc::new(AcceptAll),
            Arc::new(Evaluator::new()),
            graph,
            Arc::new(FlagPromote { promoted: AtomicBool::new(false) }),
            Arc::new(RecordingWriter { written: StdMutex::new(vec![]) }),
        );
        let spans = vec![
            InboundSpan { operation: op("svc", "a"), tags: SpanTags::default() },
            InboundSpan { operation: op("svc", "b"), tags: SpanTags::default() },
        ];
        let result = processor.process_spans(spans, true);
        assert_eq!(result, Err(ProcessorError::Busy));
    }

    #[tokio::test]
    async fn pipeline_commits_known_relation_and_promotes_on_match() {
        let a = op("web", "a");
        let b = op("web", "b");
        let graph = Arc::new(FakeGraph {
            known: StdMutex::new(vec![a.clone()]),
            committed: StdMutex::new(vec![]),
        });
        let evaluator = Arc::new(Evaluator::new());
        evaluator.update(as_types::RuleSet {
            rules: vec![as_types::Rule::new("error", as_types::Operator::Eq, TaggedValue::Bool(true)).unwrap()],
        });
        let promote = Arc::new(FlagPromote { promoted: AtomicBool::new(false) });
        let writer = Arc::new(RecordingWriter { written: StdMutex::new(vec![]) });
        let processor = SpanProcessor::new(
            QueueConfig { min_capacity: 16, worker_count: 1, ..QueueConfig::default() },
            Arc::new(AcceptAll),
            evaluator,
            Arc::clone(&graph) as Arc<dyn GraphSink>,
            Arc::clone(&promote) as Arc<dyn PromoteSink>,
            Arc::clone(&writer) as Arc<dyn SpanWriter>,
        );
        let span = InboundSpan {
            operation: b.clone(),
            tags: SpanTags {
                tags: vec![
                    ("p-svc".into(), TaggedValue::Str("web".into())),
                    ("p-op".into(), TaggedValue::Str("a".into())),
                    ("error".into(), TaggedValue::Bool(true)),
                ],
            },
        };
        processor.process_one(span);
        assert_eq!(graph.committed.lock().unwrap().len(), 1);
        assert!(promote.promoted.load(Ordering::SeqCst));
        assert_eq!(writer.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unresolved_parent_goes_to_retry_queue() {
        let a = op("web", "a");
        let b = op("web", "b");
        let graph = Arc::new(FakeGraph { known: StdMutex::new(vec![]), committed: StdMutex::new(vec![]) });
        let processor = SpanProcessor::new(
            QueueConfig::default(),
            Arc::new(AcceptAll),
            Arc::new(Evaluator::new()),
            Arc::clone(&graph) as Arc<dyn GraphSink>,
            Arc::new(FlagPromote { promoted: AtomicBool::new(false) }),
            Arc::new(RecordingWriter { written: StdMutex::new(vec![]) }),
        );
        let span = InboundSpan {
            operation: b,
            tags: SpanTags {
                tags: vec![
                    ("p-svc".into(), TaggedValue::Str("web".into())),
                    ("p-op".into(), TaggedValue::Str("a".into())),
                ],
            },
        };
        processor.process_one(span);
        assert_eq!(processor.retry_queue_len(), 1);
        graph.known.lock().unwrap().push(a);
        processor.retry.sweep_once(graph.as_ref());
        assert_eq!(processor.retry_queue_len(), 0);
        assert_eq!(graph.committed.lock().unwrap().len(), 1);
    }

    #[test]
    fn rejecting_filter_drops_span_before_any_stage() {
        let graph = Arc::new(FakeGraph { known: StdMutex::new(vec![]), committed: StdMutex::new(vec![]) });
        let writer = Arc::new(RecordingWriter { written: StdMutex::new(vec![]) });
        let processor = SpanProcessor::new(
            QueueConfig::default(),
            Arc::new(RejectAll),
            Arc::new(Evaluator::new()),
            graph,
            Arc::new(FlagPromote { promoted: AtomicBool::new(false) }),
            Arc::clone(&writer) as Arc<dyn SpanWriter>,
        );
        processor.process_one(InboundSpan { operation: op("svc", "a"), tags: SpanTags::default() });
        assert!(writer.written.lock().unwrap().is_empty());
    }
}
