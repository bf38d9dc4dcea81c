use crate::core::{ClusterResult, Identity, NodeId};
use async_trait::async_trait;
use itertools::Itertools;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;

/// A member of an [`AffinityGroup`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Member {
  /// How strongly the identity belongs to the group. Heavier members pull the target harder.
  pub weight: u64,
  /// Where the identity was last seen. `None` until located.
  pub node: Option<NodeId>,
}

/// Identities believed to talk to each other a lot, and the node they should all live on.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AffinityGroup {
  id: u64,
  generation: u64,
  members: BTreeMap<Identity, Member>,
  target: Option<NodeId>,
}
impl AffinityGroup {
  pub fn new(id: u64, generation: u64, weights: BTreeMap<Identity, u64>) -> AffinityGroup {
    AffinityGroup {
      id: id,
      generation: generation,
      members: weights
        .into_iter()
        .map(|(identity, weight)| (identity, Member { weight: weight, node: None }))
        .collect(),
      target: None,
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn target(&self) -> Option<NodeId> {
    self.target
  }

  pub fn set_target(&mut self, node: NodeId) {
    self.target = Some(node);
  }

  pub fn members(&self) -> &BTreeMap<Identity, Member> {
    &self.members
  }

  pub fn contains(&self, identity: &Identity) -> bool {
    self.members.contains_key(identity)
  }

  pub fn len(&self) -> usize {
    self.members.len()
  }

  pub fn is_empty(&self) -> bool {
    self.members.is_empty()
  }

  /// Drops `identity` from the group. Returns whether it was a member.
  pub fn remove(&mut self, identity: &Identity) -> bool {
    self.members.remove(identity).is_some()
  }

  /// Records where `identity` currently lives. Unknown identities are ignored.
  pub fn locate(&mut self, identity: &Identity, node: Option<NodeId>) {
    if let Some(m) = self.members.get_mut(identity) {
      m.node = node;
    }
  }

  /// Sets the target to the node holding the most member weight. Ties go to the lower node id.
  pub fn find_target(&mut self) -> Option<NodeId> {
    let mut weights: HashMap<NodeId, u64> = HashMap::new();
    for m in self.members.values() {
      if let Some(node) = m.node {
        *weights.entry(node).or_insert(0) += m.weight;
      }
    }
    self.target = weights
      .into_iter()
      .sorted_by_key(|(node, _)| *node)
      .fold(None, |best: Option<(NodeId, u64)>, (node, w)| match best {
        Some((_, bw)) if bw >= w => best,
        _ => Some((node, w)),
      })
      .map(|(node, _)| node);
    self.target
  }

  /// Members not on the target node, paired with where they are now. Every member is a straggler
  /// of an untargeted group.
  pub fn stragglers(&self) -> Vec<(Identity, Option<NodeId>)> {
    self
      .members
      .iter()
      .filter(|(_, m)| self.target.is_none() || m.node != self.target)
      .map(|(identity, m)| (identity.clone(), m.node))
      .collect()
  }
}
impl fmt::Display for AffinityGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "AffinityGroup[{}, gen {}, {} members", self.id, self.generation, self.len())?;
    match self.target {
      Some(t) => write!(f, ", target {}]", t),
      None => write!(f, "]"),
    }
  }
}

/// Builds groups on behalf of a [`GroupFinder`].
pub trait GroupFactory: Send + Sync {
  fn new_group(&self, id: u64, generation: u64, weights: BTreeMap<Identity, u64>) -> AffinityGroup;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultGroupFactory;
impl GroupFactory for DefaultGroupFactory {
  fn new_group(&self, id: u64, generation: u64, weights: BTreeMap<Identity, u64>) -> AffinityGroup {
    AffinityGroup::new(id, generation, weights)
  }
}

/// Where a [`GroupFinder`] puts the groups it finds.
#[derive(Debug, Default)]
pub struct GroupCollector {
  groups: Vec<AffinityGroup>,
}
impl GroupCollector {
  pub fn new() -> GroupCollector {
    GroupCollector::default()
  }

  pub fn add(&mut self, group: AffinityGroup) {
    self.groups.push(group);
  }

  pub fn len(&self) -> usize {
    self.groups.len()
  }

  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }

  pub fn into_groups(self) -> Vec<AffinityGroup> {
    self.groups
  }
}

/// Finds affinity groups. How affinity is detected is entirely up to the implementation.
#[async_trait]
pub trait GroupFinder: Send + Sync {
  /// Adds every group found to `out`, all of them from a single generation. Returns how long the
  /// search took.
  async fn find_affinity_groups(
    &self,
    out: &mut GroupCollector,
    factory: &dyn GroupFactory,
  ) -> ClusterResult<Duration>;

  fn enable(&self);

  fn disable(&self);

  fn shutdown(&self);
}

#[cfg(test)]
mod tests {
  use super::*;
  use maplit::btreemap;

  fn ident(s: &str) -> Identity {
    Identity::new(s)
  }

  #[test]
  fn target_follows_weight() {
    let mut g = AffinityGroup::new(
      1,
      0,
      btreemap! { ident("a") => 5, ident("b") => 1, ident("c") => 1, ident("d") => 1 },
    );
    assert_eq!(g.find_target(), None);
    g.locate(&ident("a"), Some(NodeId(2)));
    g.locate(&ident("b"), Some(NodeId(1)));
    g.locate(&ident("c"), Some(NodeId(1)));
    g.locate(&ident("d"), Some(NodeId(1)));
    assert_eq!(g.find_target(), Some(NodeId(2)));
    assert_eq!(
      g.stragglers().into_iter().map(|(i, _)| i).collect_vec(),
      vec![ident("b"), ident("c"), ident("d")]
    );
  }

  #[test]
  fn ties_go_to_lowest_node() {
    let mut g = AffinityGroup::new(7, 3, btreemap! { ident("x") => 2, ident("y") => 2 });
    g.locate(&ident("x"), Some(NodeId(9)));
    g.locate(&ident("y"), Some(NodeId(4)));
    assert_eq!(g.find_target(), Some(NodeId(4)));
    g.set_target(NodeId(9));
    assert_eq!(g.stragglers(), vec![(ident("y"), Some(NodeId(4)))]);
  }
}
