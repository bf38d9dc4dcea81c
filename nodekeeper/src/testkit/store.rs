use crate::core::{ClusterError, ClusterResult, Identity, NodeId};
use crate::nodemap::MappingStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

#[derive(Default)]
struct StoreState {
  mapping: BTreeMap<Identity, NodeId>,
  services: HashMap<Identity, BTreeSet<String>>,
  moves: HashMap<Identity, usize>,
  broken: HashSet<Identity>,
}

/// A [`MappingStore`] in memory, counting every move.
#[derive(Default)]
pub struct MemoryMappingStore {
  state: Mutex<StoreState>,
}
impl MemoryMappingStore {
  pub fn new() -> MemoryMappingStore {
    MemoryMappingStore::default()
  }

  /// Maps an identity directly, without counting a move.
  pub fn insert(&self, identity: Identity, node: NodeId) {
    self.state.lock().mapping.insert(identity, node);
  }

  pub fn get(&self, identity: &Identity) -> Option<NodeId> {
    self.state.lock().mapping.get(identity).copied()
  }

  pub fn moves_of(&self, identity: &Identity) -> usize {
    self.state.lock().moves.get(identity).copied().unwrap_or(0)
  }

  pub fn total_moves(&self) -> usize {
    self.state.lock().moves.values().sum()
  }

  /// Every later move of `identity` fails.
  pub fn break_moves(&self, identity: Identity) {
    self.state.lock().broken.insert(identity);
  }

  pub fn len(&self) -> usize {
    self.state.lock().mapping.len()
  }

  pub fn is_empty(&self) -> bool {
    self.state.lock().mapping.is_empty()
  }
}
#[async_trait]
impl MappingStore for MemoryMappingStore {
  async fn set_status(
    &self,
    service: &str,
    identity: &Identity,
    active: bool,
  ) -> ClusterResult<()> {
    let mut state = self.state.lock();
    let services = state.services.entry(identity.clone()).or_default();
    if active {
      services.insert(service.to_string());
    } else {
      services.remove(service);
      if services.is_empty() {
        state.services.remove(identity);
        state.mapping.remove(identity);
      }
    }
    Ok(())
  }

  async fn node_of(&self, identity: &Identity) -> ClusterResult<Option<NodeId>> {
    Ok(self.get(identity))
  }

  async fn assign_node(
    &self,
    service: &str,
    identity: &Identity,
    node: NodeId,
  ) -> ClusterResult<()> {
    let mut state = self.state.lock();
    state.mapping.insert(identity.clone(), node);
    state
      .services
      .entry(identity.clone())
      .or_default()
      .insert(service.to_string());
    Ok(())
  }

  async fn move_identity(
    &self,
    identity: &Identity,
    target: NodeId,
  ) -> ClusterResult<Option<NodeId>> {
    let mut state = self.state.lock();
    if state.broken.contains(identity) {
      return Err(ClusterError::Unreachable(format!("cannot move {}", identity)));
    }
    *state.moves.entry(identity.clone()).or_insert(0) += 1;
    Ok(state.mapping.insert(identity.clone(), target))
  }

  async fn identities_on(&self, node: NodeId) -> ClusterResult<Vec<Identity>> {
    Ok(
      self
        .state
        .lock()
        .mapping
        .iter()
        .filter(|(_, n)| **n == node)
        .map(|(i, _)| i.clone())
        .collect(),
    )
  }
}
