use crate::core::{ClusterError, ClusterResult, Health, Host, Node, NodeId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// What a node learns when it registers.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Registration {
  pub node_id: NodeId,
  /// The node must renew at least this often or it is declared failed.
  pub renew_interval: Duration,
}

/// A batch of node status changes pushed by the registry. The vectors are parallel: index `i` of
/// each describes the same node.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct StatusBatch {
  pub ids: Vec<NodeId>,
  pub hosts: Vec<Host>,
  pub health: Vec<Health>,
  /// Only meaningful for nodes that are not alive.
  pub backups: Vec<Option<NodeId>>,
}
impl StatusBatch {
  pub fn push(&mut self, node: &Node) {
    self.ids.push(node.id);
    self.hosts.push(node.host.clone());
    self.health.push(node.health);
    self.backups.push(node.backup);
  }

  pub fn len(&self) -> usize {
    self.ids.len()
  }

  pub fn is_empty(&self) -> bool {
    self.ids.is_empty()
  }

  /// Rejects batches whose vectors disagree in length. Nothing of an invalid batch may be acted
  /// upon.
  pub fn validate(&self) -> ClusterResult<()> {
    let n = self.ids.len();
    if self.hosts.len() != n || self.health.len() != n || self.backups.len() != n {
      return Err(ClusterError::ProtocolViolation(format!(
        "status batch lengths don't match: ids={}, hosts={}, health={}, backups={}",
        n,
        self.hosts.len(),
        self.health.len(),
        self.backups.len()
      )));
    }
    Ok(())
  }

  /// Validates, then unpacks the batch.
  pub fn nodes(&self) -> ClusterResult<Vec<Node>> {
    self.validate()?;
    Ok(
      (0..self.ids.len())
        .map(|i| Node::new(self.ids[i], self.hosts[i].clone(), self.health[i], self.backups[i]))
        .collect(),
    )
  }
}
impl<'a> FromIterator<&'a Node> for StatusBatch {
  fn from_iter<T: IntoIterator<Item = &'a Node>>(iter: T) -> Self {
    let mut batch = StatusBatch::default();
    for node in iter {
      batch.push(node);
    }
    batch
  }
}

/// The remote-callable surface of the [`NodeRegistry`](crate::watchdog::NodeRegistry).
#[async_trait]
pub trait RegistryRpc: Send + Sync {
  /// Registers a node running on `host`. Status changes are pushed to `client` from then on.
  async fn register_node(
    &self,
    host: Host,
    client: Arc<dyn StatusRpc>,
  ) -> ClusterResult<Registration>;

  /// Returns `false` if the registry does not know the node, or has already declared it failed.
  async fn renew_node(&self, node: NodeId) -> ClusterResult<bool>;

  /// Tells the registry that `backup` finished recovering `failed`.
  async fn recovered_node(&self, failed: NodeId, backup: NodeId) -> ClusterResult<()>;

  /// Sets the health of a node. `component` names the reporter.
  async fn set_node_health(
    &self,
    node: NodeId,
    health: Health,
    component: &str,
  ) -> ClusterResult<()>;
}

/// The remote-callable surface of a node, used by the registry to push changes.
#[async_trait]
pub trait StatusRpc: Send + Sync {
  async fn node_status_changes(&self, batch: StatusBatch) -> ClusterResult<()>;

  /// The registry considers this node failed.
  async fn report_failure(&self, component: &str) -> ClusterResult<()>;
}

/// Observes node health changes. Always invoked from a scheduled task, never from inside the
/// callback that learned of the change.
#[async_trait]
pub trait NodeListener: Send + Sync {
  async fn node_health_change(&self, node: Node);
}

/// Recovers the state a failed node left behind. The listener must call
/// [`RecoveryToken::done`](crate::watchdog::RecoveryToken::done) once it is finished.
#[async_trait]
pub trait RecoveryListener: Send + Sync {
  async fn recover(&self, node: Node, token: crate::watchdog::RecoveryToken);
}
