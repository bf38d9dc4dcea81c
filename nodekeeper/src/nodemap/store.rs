use crate::core::{ClusterResult, Identity, NodeId};
use async_trait::async_trait;

/// The durable identity to node mapping. Every identity maps to at most one node.
#[async_trait]
pub trait MappingStore: Send + Sync {
  /// Marks whether `service` is using `identity`. Once no service uses an identity, its mapping
  /// may be dropped.
  async fn set_status(&self, service: &str, identity: &Identity, active: bool)
    -> ClusterResult<()>;

  async fn node_of(&self, identity: &Identity) -> ClusterResult<Option<NodeId>>;

  /// Maps `identity` to `node` on behalf of `service`, which is marked as using it.
  async fn assign_node(&self, service: &str, identity: &Identity, node: NodeId)
    -> ClusterResult<()>;

  /// Remaps an identity. Returns the node it was on.
  async fn move_identity(&self, identity: &Identity, target: NodeId)
    -> ClusterResult<Option<NodeId>>;

  /// The identities mapped to `node`, in identity order.
  async fn identities_on(&self, node: NodeId) -> ClusterResult<Vec<Identity>>;
}
