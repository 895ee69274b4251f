//! Node registry — tracks connected nodes and their interfaces.
//!
//! A registry entry is created at accept time with an empty name and no
//! interfaces, populated when that connection registers, and removed when
//! the connection exits, hangs up, or loses its name to a newer
//! registration. Removal is atomic under the registry lock: a lookup sees
//! an entry fully present or not at all, never half torn down.

use crate::queue::DeliveryQueue;
use chrono::{DateTime, Utc};
use rpcbus_proto::InterfaceDescriptor;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::task::JoinHandle;

/// Connection identifier, unique for the broker's lifetime.
pub type ConnId = u64;

/// One connected node.
#[derive(Debug)]
pub struct NodeEntry {
    pub conn_id: ConnId,
    /// Empty until the connection registers; unique across live nodes
    /// afterwards (last registration wins).
    pub name: String,
    pub interfaces: Vec<InterfaceDescriptor>,
    pub queue: DeliveryQueue,
    pub connected_at: DateTime<Utc>,
    /// Receive/transmit task handles, set once the connection pair is
    /// spawned. The destroy path aborts these — except a receive task
    /// processing its own exit, which observes the router's verdict and
    /// returns on its own instead of aborting itself.
    pub rx_task: Option<JoinHandle<()>>,
    pub tx_task: Option<JoinHandle<()>>,
}

/// Thread-safe registry of all live nodes, shared by every connection task.
#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    nodes: Arc<RwLock<HashMap<ConnId, NodeEntry>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the entry for a freshly accepted connection.
    pub fn insert(&self, conn_id: ConnId, queue: DeliveryQueue) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(
            conn_id,
            NodeEntry {
                conn_id,
                name: String::new(),
                interfaces: Vec::new(),
                queue,
                connected_at: Utc::now(),
                rx_task: None,
                tx_task: None,
            },
        );
    }

    /// Attach the connection pair's task handles after spawning.
    pub fn set_tasks(&self, conn_id: ConnId, rx_task: JoinHandle<()>, tx_task: JoinHandle<()>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = nodes.get_mut(&conn_id) {
            entry.rx_task = Some(rx_task);
            entry.tx_task = Some(tx_task);
        }
    }

    /// Record a registration: the name and the full replacement interface
    /// list (replace, not merge).
    pub fn set_identity(&self, conn_id: ConnId, name: &str, interfaces: Vec<InterfaceDescriptor>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = nodes.get_mut(&conn_id) {
            entry.name = name.to_string();
            entry.interfaces = interfaces;
        }
    }

    /// The registered name of a connection, if it exists.
    pub fn name_of(&self, conn_id: ConnId) -> Option<String> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(&conn_id).map(|e| e.name.clone())
    }

    /// The delivery queue of a connection.
    pub fn queue_of(&self, conn_id: ConnId) -> Option<DeliveryQueue> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(&conn_id).map(|e| e.queue.clone())
    }

    /// Find a live node by registered name. Linear scan; the expected node
    /// population is small.
    pub fn conn_by_name(&self, name: &str) -> Option<ConnId> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .values()
            .find(|e| !e.name.is_empty() && e.name == name)
            .map(|e| e.conn_id)
    }

    /// Delivery queue of a node looked up by name.
    pub fn queue_by_name(&self, name: &str) -> Option<DeliveryQueue> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes
            .values()
            .find(|e| !e.name.is_empty() && e.name == name)
            .map(|e| e.queue.clone())
    }

    /// Interface list snapshot for a connection.
    pub fn interfaces_of(&self, conn_id: ConnId) -> Option<Vec<InterfaceDescriptor>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(&conn_id).map(|e| e.interfaces.clone())
    }

    /// Remove a node, returning its entry (queue and task handles) for the
    /// destroy path. Atomic with respect to all lookups.
    pub fn remove(&self, conn_id: ConnId) -> Option<NodeEntry> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.remove(&conn_id)
    }

    /// Remove every node (broker shutdown).
    pub fn drain(&self) -> Vec<NodeEntry> {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.drain().map(|(_, entry)| entry).collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Log every live node, interfaces included. Used at shutdown.
    pub fn dump(&self) {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        for entry in nodes.values() {
            tracing::debug!(
                conn_id = entry.conn_id,
                name = %entry.name,
                interfaces = entry.interfaces.len(),
                connected_at = %entry.connected_at,
                "registered node"
            );
        }
    }
}
