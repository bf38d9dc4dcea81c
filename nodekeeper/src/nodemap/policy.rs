use crate::core::{ClusterError, ClusterResult, Health, Identity, NodeId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use tracing::{debug, trace};

/// Recommends which node should host an identity. A policy never touches the identity mapping
/// itself.
pub trait NodeAssignPolicy: Send + Sync {
  /// Fails with [`ClusterError::NoNodesAvailable`] if there is no candidate.
  fn choose_node(&self, requesting: Option<NodeId>) -> ClusterResult<NodeId>;

  fn choose_node_for(
    &self,
    requesting: Option<NodeId>,
    _identity: &Identity,
  ) -> ClusterResult<NodeId> {
    self.choose_node(requesting)
  }

  /// A node is alive with the given health. Ignored for nodes that were made unavailable.
  fn node_update(&self, node: NodeId, health: Health);

  /// Removes the node for good.
  fn node_unavailable(&self, node: NodeId);

  fn is_node_available(&self, node: NodeId) -> bool;

  fn nodes_available(&self) -> bool;

  /// Forgets every node, unavailable ones included.
  fn reset(&self);
}

#[derive(Default)]
struct RoundRobinState {
  health: BTreeMap<NodeId, Health>,
  retired: HashSet<NodeId>,
  cursor: Option<NodeId>,
}
impl RoundRobinState {
  fn eligible(&self, threshold: Health) -> impl Iterator<Item = NodeId> + '_ {
    self
      .health
      .iter()
      .filter(move |(_, h)| !h.worse_than(threshold))
      .map(|(id, _)| *id)
  }
}

/// Hands out eligible nodes in id order, wrapping around. A node is eligible if its last reported
/// health is no worse than the threshold.
pub struct RoundRobinPolicy {
  threshold: Health,
  state: Mutex<RoundRobinState>,
}
impl RoundRobinPolicy {
  pub fn new(threshold: Health) -> RoundRobinPolicy {
    RoundRobinPolicy {
      threshold: threshold,
      state: Mutex::new(RoundRobinState::default()),
    }
  }

  pub fn threshold(&self) -> Health {
    self.threshold
  }
}
impl Default for RoundRobinPolicy {
  fn default() -> Self {
    RoundRobinPolicy::new(Health::Yellow)
  }
}
impl NodeAssignPolicy for RoundRobinPolicy {
  fn choose_node(&self, requesting: Option<NodeId>) -> ClusterResult<NodeId> {
    let mut state = self.state.lock();
    let after = match state.cursor {
      Some(c) => state
        .health
        .range((Excluded(c), Unbounded))
        .find(|(_, h)| !h.worse_than(self.threshold))
        .map(|(id, _)| *id),
      None => None,
    };
    let chosen = after
      .or_else(|| state.eligible(self.threshold).next())
      .ok_or(ClusterError::NoNodesAvailable)?;
    state.cursor = Some(chosen);
    trace!(node = %chosen, ?requesting, "chose node");
    Ok(chosen)
  }

  fn node_update(&self, node: NodeId, health: Health) {
    let mut state = self.state.lock();
    if state.retired.contains(&node) {
      debug!(node = %node, "ignoring health of an unavailable node");
      return;
    }
    if health.is_alive() {
      state.health.insert(node, health);
    } else {
      state.health.remove(&node);
      state.retired.insert(node);
    }
  }

  fn node_unavailable(&self, node: NodeId) {
    let mut state = self.state.lock();
    state.health.remove(&node);
    state.retired.insert(node);
  }

  fn is_node_available(&self, node: NodeId) -> bool {
    let state = self.state.lock();
    state.health.get(&node).map_or(false, |h| !h.worse_than(self.threshold))
  }

  fn nodes_available(&self) -> bool {
    self.state.lock().eligible(self.threshold).next().is_some()
  }

  fn reset(&self) {
    *self.state.lock() = RoundRobinState::default();
  }
}

#[test]
fn round_robin_wraps() {
  let p = RoundRobinPolicy::default();
  assert_eq!(p.choose_node(None), Err(ClusterError::NoNodesAvailable));
  p.node_update(NodeId(3), Health::Green);
  p.node_update(NodeId(1), Health::Green);
  p.node_update(NodeId(2), Health::Red);
  let picks = (0..4).map(|_| p.choose_node(None).unwrap()).collect::<Vec<_>>();
  assert_eq!(picks, vec![NodeId(1), NodeId(3), NodeId(1), NodeId(3)]);
  assert!(!p.is_node_available(NodeId(2)));
}

#[test]
fn unavailable_nodes_stay_gone() {
  let p = RoundRobinPolicy::default();
  p.node_update(NodeId(1), Health::Green);
  p.node_unavailable(NodeId(1));
  p.node_update(NodeId(1), Health::Green);
  assert!(!p.is_node_available(NodeId(1)));
  assert!(!p.nodes_available());
  p.reset();
  p.node_update(NodeId(1), Health::Green);
  assert!(p.is_node_available(NodeId(1)));
}

#[test]
fn identity_does_not_change_the_pick() {
  let p = RoundRobinPolicy::default();
  p.node_update(NodeId(1), Health::Green);
  p.node_update(NodeId(2), Health::Green);
  let id = Identity::new("u");
  assert_eq!(p.choose_node_for(None, &id), Ok(NodeId(1)));
  assert_eq!(p.choose_node(None), Ok(NodeId(2)));
  assert_eq!(p.choose_node_for(None, &id), Ok(NodeId(1)));
}
