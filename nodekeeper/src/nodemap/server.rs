use crate::core::{ClusterError, ClusterResult, Health, Identity, Node, NodeId};
use crate::nodemap::{MappingStore, NodeAssignPolicy, PlacementBackend, PlacementCoordinator};
use crate::watchdog::NodeListener;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Owns the identity mapping. Every placement decision goes through the policy first; the store
/// only records it.
#[derive(Clone)]
pub struct NodeMapServer {
  policy: Arc<dyn NodeAssignPolicy>,
  store: Arc<dyn MappingStore>,
}
impl NodeMapServer {
  pub fn new(policy: Arc<dyn NodeAssignPolicy>, store: Arc<dyn MappingStore>) -> NodeMapServer {
    NodeMapServer {
      policy: policy,
      store: store,
    }
  }

  pub fn policy(&self) -> &Arc<dyn NodeAssignPolicy> {
    &self.policy
  }

  /// Maps `identity` to a live node for `service`. An identity already on an available node stays
  /// put.
  pub async fn assign_node(
    &self,
    service: &str,
    identity: &Identity,
    requesting: Option<NodeId>,
  ) -> ClusterResult<NodeId> {
    if let Some(node) = self.store.node_of(identity).await? {
      if self.policy.is_node_available(node) {
        self.store.set_status(service, identity, true).await?;
        return Ok(node);
      }
    }
    let node = self.policy.choose_node_for(requesting, identity)?;
    self.store.assign_node(service, identity, node).await?;
    debug!(identity = %identity, node = %node, %service, "assigned identity");
    Ok(node)
  }

  pub async fn node_of(&self, identity: &Identity) -> ClusterResult<Option<NodeId>> {
    self.store.node_of(identity).await
  }

  pub async fn set_status(
    &self,
    service: &str,
    identity: &Identity,
    active: bool,
  ) -> ClusterResult<()> {
    self.store.set_status(service, identity, active).await
  }

  pub async fn move_identity(
    &self,
    identity: &Identity,
    from: Option<NodeId>,
    target: Option<NodeId>,
  ) -> ClusterResult<NodeId> {
    let target = match target {
      Some(t) if self.policy.is_node_available(t) => t,
      Some(_) => return Err(ClusterError::NoNodesAvailable),
      None => self.policy.choose_node_for(from, identity)?,
    };
    if from == Some(target) {
      trace!(identity = %identity, node = %target, "identity already in place");
      return Ok(target);
    }
    self.store.move_identity(identity, target).await?;
    trace!(identity = %identity, ?from, to = %target, "moved identity");
    Ok(target)
  }
}
#[async_trait]
impl PlacementBackend for NodeMapServer {
  fn choose_node(&self, requesting: Option<NodeId>) -> ClusterResult<NodeId> {
    self.policy.choose_node(requesting)
  }

  fn is_node_available(&self, node: NodeId) -> bool {
    self.policy.is_node_available(node)
  }

  async fn node_of(&self, identity: &Identity) -> ClusterResult<Option<NodeId>> {
    NodeMapServer::node_of(self, identity).await
  }

  async fn move_identity(
    &self,
    identity: &Identity,
    from: Option<NodeId>,
    target: Option<NodeId>,
  ) -> ClusterResult<NodeId> {
    NodeMapServer::move_identity(self, identity, from, target).await
  }

  async fn identities_on(&self, node: NodeId) -> ClusterResult<Vec<Identity>> {
    self.store.identities_on(node).await
  }
}

/// Feeds registry events to the placement layer. Live nodes update the policy. A failed node is
/// dropped from the policy and drained, a node that just turned `Red` gives up some of its load.
pub struct PlacementListener {
  policy: Arc<dyn NodeAssignPolicy>,
  coordinator: PlacementCoordinator,
  last_health: Mutex<HashMap<NodeId, Health>>,
}
impl PlacementListener {
  pub fn new(policy: Arc<dyn NodeAssignPolicy>, coordinator: PlacementCoordinator) -> Self {
    PlacementListener {
      policy: policy,
      coordinator: coordinator,
      last_health: Mutex::new(HashMap::new()),
    }
  }
}
#[async_trait]
impl NodeListener for PlacementListener {
  async fn node_health_change(&self, node: Node) {
    let previous = self.last_health.lock().insert(node.id, node.health);
    if node.is_alive() {
      self.policy.node_update(node.id, node.health);
      // records are re-sent when only the backup changed
      if node.health != Health::Red || previous == Some(Health::Red) {
        return;
      }
    } else {
      self.policy.node_unavailable(node.id);
    }
    match self.coordinator.offload(&node).await {
      Ok(()) => {}
      Err(ClusterError::IllegalState(_)) => trace!(node = %node.id, "coordinator shut down"),
      Err(e) => warn!(node = %node.id, "offload failed: {}", e),
    }
  }
}
