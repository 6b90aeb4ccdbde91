use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::{config::ActiveNodePolicy, core::node::NodeAddress};

/// Picks the next active node when the current one is gone.
pub trait NodeSelectionStrategy: Send + Sync + 'static {
    /// Select a node from the candidates, in discovery order.
    fn select_node(&self, candidates: &[NodeAddress]) -> Option<NodeAddress>;

    fn boxed(self) -> Box<dyn NodeSelectionStrategy>
    where
        Self: Sized,
    {
        Box::new(self)
    }
}

/// Always the first discovered node.
#[derive(Default)]
pub struct FirstDiscoveredStrategy;

impl NodeSelectionStrategy for FirstDiscoveredStrategy {
    fn select_node(&self, candidates: &[NodeAddress]) -> Option<NodeAddress> {
        candidates.first().cloned()
    }
}

/// Rotates through the candidates on every selection.
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl NodeSelectionStrategy for RoundRobinStrategy {
    fn select_node(&self, candidates: &[NodeAddress]) -> Option<NodeAddress> {
        if candidates.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::SeqCst);
        Some(candidates[count % candidates.len()].clone())
    }
}

/// Uniformly random selection
#[derive(Default)]
pub struct RandomStrategy;

impl NodeSelectionStrategy for RandomStrategy {
    fn select_node(&self, candidates: &[NodeAddress]) -> Option<NodeAddress> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..candidates.len());
        Some(candidates[index].clone())
    }
}

/// Factory for creating selection strategies from configuration
pub struct NodeSelectorFactory;

impl NodeSelectorFactory {
    pub fn create_strategy(policy: ActiveNodePolicy) -> Box<dyn NodeSelectionStrategy> {
        match policy {
            ActiveNodePolicy::FirstDiscovered => FirstDiscoveredStrategy.boxed(),
            ActiveNodePolicy::RoundRobin => RoundRobinStrategy::new().boxed(),
            ActiveNodePolicy::Random => RandomStrategy.boxed(),
        }
    }
}
