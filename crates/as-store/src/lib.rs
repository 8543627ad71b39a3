//! Tracks, per operation, when it was last seen and at what QPS, expiring
//! stale entries on a background sweep and computing QPS-weighted sampling
//! shares for ingress operations.

use as_types::{Operation, StoreConfig};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

struct Entry {
    is_ingress: bool,
    qps: f64,
    last_seen: Instant,
}

struct Inner {
    entries: HashMap<Operation, Entry>,
}

/// Hook invoked for every operation the sweep expires.
pub trait ExpiryHandler: Send + Sync {
    fn on_expire(&self, op: &Operation);
}

impl<F: Fn(&Operation) + Send + Sync> ExpiryHandler for F {
    fn on_expire(&self, op: &Operation) {
        self(op)
    }
}

pub struct OperationStore {
    inner: RwLock<Inner>,
    config: StoreConfig,
}

impl OperationStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: RwLock::new(Inner { entries: HashMap::new() }),
            config,
        }
    }

    pub fn up_to_date(&self, op: Operation, is_ingress: bool, qps: f64) {
        let mut inner = self.inner.write();
        inner.entries.insert(
            op,
            Entry {
                is_ingress,
                qps,
                last_seen: Instant::now(),
            },
        );
    }

    /// Returns 1.0 if `op` is absent, non-ingress, or itself reports zero QPS
    /// (preserving the upstream behaviour this is ported from — see DESIGN.md).
    pub fn qps_weight(&self, op: &Operation) -> f64 {
        let inner = self.inner.read();
        let Some(entry) = inner.entries.get(op) else {
            return 1.0;
        };
        if !entry.is_ingress || entry.qps == 0.0 {
            return 1.0;
        }
        let sum_inverse: f64 = inner
            .entries
            .values()
            .filter(|e| e.is_ingress && e.qps != 0.0)
            .map(|e| 1.0 / e.qps)
            .sum();
        if sum_inverse == 0.0 {
            return 1.0;
        }
        (1.0 / entry.qps) / sum_inverse
    }

    pub fn is_ingress(&self, op: &Operation) -> Option<bool> {
        self.inner.read().entries.get(op).map(|e| e.is_ingress)
    }

    pub fn contains(&self, op: &Operation) -> bool {
        self.inner.read().entries.contains_key(op)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One sweep pass: expires entries idle longer than `expiry_interval`,
    /// invoking `handler` for each before removing it. Exposed directly so
    /// callers can drive it deterministically in tests; `spawn_sweep` wraps
    /// this in a periodic background task.
    pub fn sweep_once(&self, handler: &dyn ExpiryHandler) {
        let expired: Vec<Operation> = {
            let inner = self.inner.read();
            let now = Instant::now();
            inner
                .entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_seen) > self.config.expiry_interval)
                .map(|(op, _)| op.clone())
                .collect()
        };
        for op in &expired {
            handler.on_expire(op);
            tracing::debug!(%op, "operation expired");
        }
        let mut inner = self.inner.write();
        for op in &expired {
            inner.entries.remove(op);
        }
    }

    /// Spawns a background task that sweeps every `expiry_interval`, until
    /// `stop` fires.
    pub fn spawn_sweep(
        self: &Arc<Self>,
        handler: Arc<dyn ExpiryHandler>,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        let interval = self.config.expiry_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => store.sweep_once(handler.as_ref()),
                    _ = stop.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn op(s: &str, n: &str) -> Operation {
        Operation::new(s, n).unwrap()
    }

    #[test]
    fn unknown_operation_weight_is_one() {
        let store = OperationStore::new(StoreConfig::default());
        assert_eq!(store.qps_weight(&op("svc", "missing")), 1.0);
    }

    #[test]
    fn zero_qps_ingress_weight_is_one() {
        let store = OperationStore::new(StoreConfig::default());
        let a = op("svc", "a");
        store.up_to_date(a.clone(), true, 0.0);
        assert_eq!(store.qps_weight(&a), 1.0);
    }

    #[test]
    fn non_ingress_weight_is_one() {
        let store = OperationStore::new(StoreConfig::default());
        let a = op("svc", "a");
        store.up_to_date(a.clone(), false, 5.0);
        assert_eq!(store.qps_weight(&a), 1.0);
    }

    #[test]
    fn two_ingresses_split_inverse_qps_share() {
        let store = OperationStore::new(StoreConfig::default());
        let a = op("svc", "a");
        let b = op("svc", "b");
        store.up_to_date(a.clone(), true, 10.0);
        store.up_to_date(b.clone(), true, 40.0);
        // inverse qps: a=0.1, b=0.025, sum=0.125
        let wa = store.qps_weight(&a);
        let wb = store.qps_weight(&b);
        assert!((wa - 0.8).abs() < 1e-9, "{wa}");
        assert!((wb - 0.2).abs() < 1e-9, "{wb}");
        assert!((wa + wb - 1.0).abs() < 1e-9);
    }

    #[test]
    fn sweep_expires_stale_entries_and_invokes_handler() {
        let store = OperationStore::new(StoreConfig {
            expiry_interval: Duration::from_millis(1),
        });
        let a = op("svc", "a");
        store.up_to_date(a.clone(), true, 1.0);
        std::thread::sleep(Duration::from_millis(5));
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_handler = Arc::clone(&calls);
        let handler = move |_: &Operation| {
            calls_handler.fetch_add(1, Ordering::SeqCst);
        };
        store.sweep_once(&handler);
        assert!(!store.contains(&a));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
