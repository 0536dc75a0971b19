//! The node registry.
//!
//! Institutions register once with their identity and public key material
//! and afterwards prove liveness through heartbeats. Nodes are never
//! deleted; an operator can suspend a node, which permanently bars it from
//! new rounds until it is reinstated outside of the coordinator. The
//! registry is the single source of truth for round eligibility.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use chrono::{DateTime, Utc};
use thiserror::Error;

use fedmed_core::{Node, NodeId, NodePublicKey, NodeStatus};

/// Error returned by registry operations.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RegistryError {
    /// A node with the same id is already registered.
    #[error("a node with the id {0} is already registered")]
    DuplicateNode(NodeId),

    /// The node id is not known to the registry.
    #[error("the node {0} is not registered")]
    UnknownNode(NodeId),
}

/// A cheaply clonable handle to the shared node registry.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<NodeId, Node>>>,
}

impl NodeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new node.
    ///
    /// The node starts out in the [`NodeStatus::Registered`] state and
    /// becomes eligible for rounds with its first heartbeat.
    ///
    /// # Errors
    /// Fails with [`RegistryError::DuplicateNode`] if the id is taken.
    pub fn register(
        &self,
        id: NodeId,
        public_key: NodePublicKey,
    ) -> Result<Node, RegistryError> {
        let mut nodes = self.write();
        if nodes.contains_key(&id) {
            return Err(RegistryError::DuplicateNode(id));
        }
        let node = Node {
            id: id.clone(),
            public_key,
            registered_at: Utc::now(),
            last_seen: None,
            status: NodeStatus::Registered,
        };
        nodes.insert(id, node.clone());
        Ok(node)
    }

    /// Records a heartbeat for the node and returns the new `last_seen`
    /// timestamp.
    ///
    /// The first heartbeat moves a freshly registered node to
    /// [`NodeStatus::Active`]. Heartbeats of suspended nodes refresh
    /// `last_seen` but do not lift the suspension.
    ///
    /// # Errors
    /// Fails with [`RegistryError::UnknownNode`] if the id is not registered.
    pub fn heartbeat(&self, id: &NodeId) -> Result<DateTime<Utc>, RegistryError> {
        let mut nodes = self.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownNode(id.clone()))?;
        let now = Utc::now();
        node.last_seen = Some(now);
        if node.status == NodeStatus::Registered {
            node.status = NodeStatus::Active;
        }
        Ok(now)
    }

    /// Suspends the node with the given operator-supplied reason.
    ///
    /// Suspension is permanent within the coordinator; there is no automatic
    /// un-suspension.
    ///
    /// # Errors
    /// Fails with [`RegistryError::UnknownNode`] if the id is not registered.
    pub fn suspend(&self, id: &NodeId, reason: impl Into<String>) -> Result<(), RegistryError> {
        let mut nodes = self.write();
        let node = nodes
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownNode(id.clone()))?;
        node.status = NodeStatus::Suspended {
            reason: reason.into(),
        };
        Ok(())
    }

    /// Returns the node record for the given id.
    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.read().get(id).cloned()
    }

    /// Whether the node is currently eligible to participate in rounds.
    pub fn is_active(&self, id: &NodeId) -> bool {
        self.read().get(id).map(Node::is_active).unwrap_or(false)
    }

    /// Returns all nodes that are currently eligible to be invited to a
    /// round.
    pub fn eligible_nodes(&self) -> Vec<Node> {
        self.read()
            .values()
            .filter(|node| node.is_active())
            .cloned()
            .collect()
    }

    /// Returns the number of registered nodes, regardless of status.
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether no node has registered yet.
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // All mutations are single inserts or field assignments, so a poisoned
    // lock still holds consistent data.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<NodeId, Node>> {
        self.nodes.write().unwrap_or_else(|e| e.into_inner())
    }
}
