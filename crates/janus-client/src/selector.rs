//! Default load balancer: weighted power-of-two-choices.
//!
//! The candidate set is swapped atomically on every applier push; picking
//! never blocks. Two random candidates are compared by
//! `weight / (inflight + 1)` and the less-loaded one wins; its inflight
//! count is released by the returned done callback.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;

use janus_core::selector::{DoneFunc, Node, NodeFilter, Selector};
use janus_core::GatewayError;

const DEFAULT_WEIGHT: i64 = 10;

struct Weighted {
    node: Arc<dyn Node>,
    weight: i64,
    inflight: AtomicI64,
}

impl Weighted {
    fn load(&self) -> f64 {
        self.weight as f64 / (self.inflight.load(Ordering::Relaxed) + 1) as f64
    }
}

/// Power-of-two-choices selector over weighted nodes.
pub struct P2cSelector {
    endpoint: String,
    nodes: ArcSwap<Vec<Arc<Weighted>>>,
}

impl P2cSelector {
    /// A selector for the named endpoint (used only in errors and logs).
    #[must_use]
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            nodes: ArcSwap::from_pointee(Vec::new()),
        }
    }

    fn pick(&self, candidates: Vec<Arc<Weighted>>) -> Arc<Weighted> {
        debug_assert!(!candidates.is_empty());
        if candidates.len() == 1 {
            return candidates.into_iter().next().expect("one candidate");
        }
        let mut rng = rand::thread_rng();
        let a = rng.gen_range(0..candidates.len());
        let mut b = rng.gen_range(0..candidates.len() - 1);
        if b >= a {
            b += 1;
        }
        let (a, b) = (&candidates[a], &candidates[b]);
        if a.load() >= b.load() { a.clone() } else { b.clone() }
    }
}

impl Selector for P2cSelector {
    fn apply(&self, nodes: Vec<Arc<dyn Node>>) {
        let weighted = nodes
            .into_iter()
            .map(|node| {
                let weight = node
                    .initial_weight()
                    .filter(|w| *w > 0)
                    .unwrap_or(DEFAULT_WEIGHT);
                Arc::new(Weighted { node, weight, inflight: AtomicI64::new(0) })
            })
            .collect::<Vec<_>>();
        self.nodes.store(Arc::new(weighted));
    }

    fn select(&self, filters: &[NodeFilter]) -> Result<(Arc<dyn Node>, DoneFunc), GatewayError> {
        let snapshot = self.nodes.load_full();
        let mut candidates: Vec<Arc<Weighted>> = snapshot.as_ref().clone();
        if !filters.is_empty() && !candidates.is_empty() {
            let mut filtered: Vec<Arc<dyn Node>> =
                candidates.iter().map(|w| w.node.clone()).collect();
            for filter in filters {
                filtered = filter(filtered);
            }
            let keep: HashSet<String> =
                filtered.iter().map(|n| n.address().to_string()).collect();
            candidates.retain(|w| keep.contains(w.node.address()));
        }
        if candidates.is_empty() {
            return Err(GatewayError::NoInstances { endpoint: self.endpoint.clone() });
        }
        let chosen = self.pick(candidates);
        chosen.inflight.fetch_add(1, Ordering::Relaxed);
        // The guard releases the slot even when the attempt future is
        // dropped before its done callback runs (per-attempt timeout).
        let guard = InflightGuard(chosen.clone());
        let done: DoneFunc = Box::new(move |_info| {
            drop(guard);
        });
        Ok((chosen.node.clone(), done))
    }
}

struct InflightGuard(Arc<Weighted>);

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.0.inflight.fetch_sub(1, Ordering::Relaxed);
    }
}
