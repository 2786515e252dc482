//! Rendering-node pool and failover selection
//!
//! The pool owns node registration and answers "which node should this
//! session use now": least-loaded first among available nodes, skipping the
//! excluded node and anything marked degraded for the error class that
//! triggered the move.

use super::client::Node;
use crate::session::recovery::ErrorClass;
use std::sync::{Arc, RwLock};
use tracing::info;

/// Shared pool of registered rendering nodes
#[derive(Default)]
pub struct NodePool {
    nodes: RwLock<Vec<Arc<Node>>>,
}

impl NodePool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: Arc<Node>) {
        info!(node = %node.id, "Registering rendering node");
        self.nodes.write().expect("node list poisoned").push(node);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Node>> {
        self.nodes
            .read()
            .expect("node list poisoned")
            .iter()
            .find(|n| n.id == id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<Node>> {
        self.nodes.read().expect("node list poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().expect("node list poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick the best node for a fresh session: available, least loaded
    pub fn select(&self) -> Option<Arc<Node>> {
        self.select_replacement(None, None)
    }

    /// Pick a replacement node for a migrating session.
    ///
    /// Ranks available nodes by ascending bound-player count, excluding the
    /// node being left and any node degraded for the triggering class.
    pub fn select_replacement(
        &self,
        excluding: Option<&str>,
        class: Option<ErrorClass>,
    ) -> Option<Arc<Node>> {
        let nodes = self.nodes.read().expect("node list poisoned");
        let mut eligible: Vec<&Arc<Node>> = nodes
            .iter()
            .filter(|n| n.is_available())
            .filter(|n| excluding != Some(n.id.as_str()))
            .filter(|n| class.map_or(true, |c| !n.is_degraded(c)))
            .collect();

        eligible.sort_by_key(|n| n.player_count());
        eligible.first().map(|n| Arc::clone(*n))
    }
}
