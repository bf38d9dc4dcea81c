use crate::core::{
  ClusterError, ClusterResult, Identity, Node, NodeId, RecurringHandle, Scheduler,
};
use crate::nodemap::{AffinityGroup, DefaultGroupFactory, GroupCollector, GroupFinder};
use async_trait::async_trait;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use validator::Validate;

/// Configures a [`PlacementCoordinator`].
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct PlacementConfig {
  /// Seconds between affinity group discovery passes. Must be between `5` and `65535`.
  ///
  /// default: `60`
  #[validate(range(min = 5, max = 65535))]
  pub update_secs: u64,
  /// Milliseconds the collocation sweep waits after moving a group before it looks at the next.
  ///
  /// default: `1000`
  pub collocate_delay_ms: u64,
}
impl PlacementConfig {
  pub fn update_period(&self) -> Duration {
    Duration::from_secs(self.update_secs)
  }

  pub fn collocate_delay(&self) -> Duration {
    Duration::from_millis(self.collocate_delay_ms)
  }
}
impl Default for PlacementConfig {
  fn default() -> Self {
    PlacementConfig {
      update_secs: 60,
      collocate_delay_ms: 1000,
    }
  }
}

/// What the coordinator needs from the rest of the placement layer.
#[async_trait]
pub trait PlacementBackend: Send + Sync {
  fn choose_node(&self, requesting: Option<NodeId>) -> ClusterResult<NodeId>;

  fn is_node_available(&self, node: NodeId) -> bool;

  async fn node_of(&self, identity: &Identity) -> ClusterResult<Option<NodeId>>;

  /// Moves `identity` off of `from` to `target`, or to a node of the backend's choosing. Fails
  /// with [`ClusterError::NoNodesAvailable`] if `target` is given but not available. Returns the
  /// node the identity ended up on.
  async fn move_identity(
    &self,
    identity: &Identity,
    from: Option<NodeId>,
    target: Option<NodeId>,
  ) -> ClusterResult<NodeId>;

  async fn identities_on(&self, node: NodeId) -> ClusterResult<Vec<Identity>>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CoordinatorState {
  Disabled,
  Enabled,
  Shutdown,
}

struct Sweep {
  id: u64,
  cursor: Option<u64>,
}

#[derive(Default)]
struct GroupBook {
  groups: BTreeMap<u64, AffinityGroup>,
  generation: Option<u64>,
  node_sets: HashMap<NodeId, BTreeMap<u64, AffinityGroup>>,
  sweep: Option<Sweep>,
  next_sweep: u64,
}
impl GroupBook {
  /// Claims every group targeting `node` out of the global set, the first time it is asked.
  fn node_set(&mut self, node: NodeId) -> &mut BTreeMap<u64, AffinityGroup> {
    if !self.node_sets.contains_key(&node) {
      let claimed = self
        .groups
        .iter()
        .filter(|(_, g)| g.target() == Some(node))
        .map(|(id, _)| *id)
        .collect_vec();
      let mut set = BTreeMap::new();
      for id in claimed {
        if let Some(g) = self.groups.remove(&id) {
          set.insert(id, g);
        }
      }
      if !set.is_empty() {
        if let Some(sweep) = self.sweep.as_mut() {
          sweep.cursor = None;
        }
      }
      self.node_sets.insert(node, set);
    }
    self.node_sets.entry(node).or_default()
  }

  /// Drops `identity` from every unclaimed group so no sweep moves it.
  fn forget(&mut self, identity: &Identity) {
    for group in self.groups.values_mut() {
      group.remove(identity);
    }
  }

  fn members(&self) -> HashSet<Identity> {
    self
      .groups
      .values()
      .chain(self.node_sets.values().flat_map(|s| s.values()))
      .flat_map(|g| g.members().keys().cloned())
      .collect()
  }
}

struct Lifecycle {
  state: CoordinatorState,
  update_task: Option<RecurringHandle>,
}

struct CoordinatorShared {
  config: PlacementConfig,
  backend: Arc<dyn PlacementBackend>,
  finder: Option<Arc<dyn GroupFinder>>,
  scheduler: Arc<dyn Scheduler>,
  owner: Identity,
  lifecycle: Mutex<Lifecycle>,
  book: Mutex<GroupBook>,
}
impl CoordinatorShared {
  fn state(&self) -> CoordinatorState {
    self.lifecycle.lock().state
  }

  fn check_shutdown(&self) -> ClusterResult<()> {
    match self.state() {
      CoordinatorState::Shutdown => {
        Err(ClusterError::IllegalState("placement coordinator is shut down"))
      }
      _ => Ok(()),
    }
  }

  fn stop_sweep(&self) {
    self.book.lock().sweep = None;
  }

  fn schedule_sweep(self: &Arc<Self>, sweep: u64, delay: Duration) {
    let weak = Arc::downgrade(self);
    self.scheduler.schedule_once(
      Box::pin(async move {
        if let Some(shared) = weak.upgrade() {
          shared.sweep_step(sweep);
        }
      }),
      &self.owner,
      delay,
    );
  }

  /// Collocates the next group with stragglers, then reschedules itself. Ends quietly once the
  /// group set is exhausted or a newer sweep has replaced this one.
  fn sweep_step(self: &Arc<Self>, sweep: u64) {
    let mut book = self.book.lock();
    loop {
      let cursor = match &book.sweep {
        Some(s) if s.id == sweep => s.cursor,
        _ => {
          trace!(sweep, "sweep stopped");
          return;
        }
      };
      let next = match cursor {
        Some(c) => book.groups.range(c + 1..).next().map(|(id, _)| *id),
        None => book.groups.keys().next().copied(),
      };
      let gid = match next {
        Some(gid) => gid,
        None => {
          debug!(sweep, "collocation sweep finished");
          book.sweep = None;
          return;
        }
      };
      if let Some(s) = book.sweep.as_mut() {
        s.cursor = Some(gid);
      }
      let moved = match book.groups.get_mut(&gid) {
        Some(group) => self.collocate_group(group),
        None => continue,
      };
      match moved {
        Ok(false) => continue,
        Ok(true) => {
          book.groups.remove(&gid);
          drop(book);
          self.schedule_sweep(sweep, self.config.collocate_delay());
          return;
        }
        Err(e) => {
          warn!(group = gid, "collocation sweep aborted: {}", e);
          book.groups.remove(&gid);
          book.sweep = None;
          return;
        }
      }
    }
  }

  /// Re-targets the group if its target went away, then hands its stragglers to a move task.
  /// Returns whether anything is being moved.
  fn collocate_group(&self, group: &mut AffinityGroup) -> ClusterResult<bool> {
    let target = match group.target() {
      Some(t) if self.backend.is_node_available(t) => t,
      _ => {
        let t = self.backend.choose_node(None)?;
        group.set_target(t);
        t
      }
    };
    let stragglers = group.stragglers();
    if stragglers.is_empty() {
      return Ok(false);
    }
    info!(group = group.id(), target = %target, count = stragglers.len(), "collocating group");
    for (identity, _) in &stragglers {
      group.locate(identity, Some(target));
    }
    let backend = self.backend.clone();
    let gid = group.id();
    self.scheduler.schedule_once(
      Box::pin(async move {
        for (identity, from) in stragglers {
          trace!(group = gid, identity = %identity, "moving identity");
          match backend.move_identity(&identity, from, Some(target)).await {
            Ok(_) => {}
            Err(ClusterError::NoNodesAvailable) => {
              warn!(group = gid, target = %target, "target node no longer available");
              return;
            }
            Err(e) => warn!(group = gid, identity = %identity, "move failed: {}", e),
          }
        }
      }),
      &self.owner,
      Duration::ZERO,
    );
    Ok(true)
  }

  async fn discover(self: &Arc<Self>) -> ClusterResult<usize> {
    if self.state() != CoordinatorState::Enabled {
      return Err(ClusterError::IllegalState("placement coordinator is not enabled"));
    }
    let finder = match &self.finder {
      Some(f) => f.clone(),
      None => return Ok(0),
    };
    self.stop_sweep();
    let mut out = GroupCollector::new();
    let elapsed = finder
      .find_affinity_groups(&mut out, &DefaultGroupFactory)
      .await
      .map_err(|e| {
        error!("affinity group finder failed: {}", e);
        e
      })?;
    let mut groups = out.into_groups();
    let generation = match groups.iter().map(|g| g.generation()).dedup().at_most_one() {
      Ok(gen) => gen,
      Err(_) => {
        error!("affinity group finder returned groups from several generations");
        return Err(ClusterError::GroupFinder("mixed generations".to_string()));
      }
    };
    for group in groups.iter_mut() {
      let members = group.members().keys().cloned().collect_vec();
      for identity in members {
        match self.backend.node_of(&identity).await {
          Ok(node) => group.locate(&identity, node),
          Err(e) => debug!(identity = %identity, "could not locate identity: {}", e),
        }
      }
      group.find_target();
    }
    let count = groups.len();
    let sweep = {
      // held across the install so a disable cannot land between the check and the new sweep
      let lifecycle = self.lifecycle.lock();
      if lifecycle.state != CoordinatorState::Enabled {
        return Err(ClusterError::IllegalState("placement coordinator disabled during discovery"));
      }
      info!(count, ?elapsed, ?generation, "installing affinity groups");
      let mut book = self.book.lock();
      book.groups = groups.into_iter().map(|g| (g.id(), g)).collect();
      book.node_sets.clear();
      book.generation = generation;
      if book.groups.is_empty() {
        book.sweep = None;
        None
      } else {
        book.next_sweep += 1;
        let id = book.next_sweep;
        book.sweep = Some(Sweep { id: id, cursor: None });
        Some(id)
      }
    };
    if let Some(sweep) = sweep {
      self.schedule_sweep(sweep, Duration::ZERO);
    }
    Ok(count)
  }

  async fn offload(self: &Arc<Self>, node: &Node) -> ClusterResult<()> {
    let mut claimed = HashSet::new();
    loop {
      self.check_shutdown()?;
      if self.book.lock().node_set(node.id).is_empty() {
        break;
      }
      let target = self.backend.choose_node(Some(node.id))?;
      if target == node.id {
        debug!(node = %node.id, "no better node to offload to");
        return Ok(());
      }
      let group = {
        let mut book = self.book.lock();
        let first = book.node_set(node.id).pop_first();
        first.map(|(_, g)| g)
      };
      let mut group = match group {
        Some(g) => g,
        None => break,
      };
      info!(node = %node.id, group = group.id(), target = %target, "offloading group");
      claimed.extend(group.members().keys().cloned());
      group.set_target(target);
      self.collocate_group(&mut group)?;
      if node.is_alive() {
        return Ok(());
      }
    }
    self.offload_singles(node, claimed).await
  }

  async fn offload_singles(&self, node: &Node, claimed: HashSet<Identity>) -> ClusterResult<()> {
    let identities = match self.backend.identities_on(node.id).await {
      Ok(ids) => ids,
      Err(e) => {
        warn!(node = %node.id, "could not find identities to offload: {}", e);
        return Ok(());
      }
    };
    // a live node leaves grouped identities to the sweep, a dead one gives up everything
    let grouped = if node.is_alive() {
      self.book.lock().members()
    } else {
      HashSet::new()
    };
    for identity in identities {
      if claimed.contains(&identity) || grouped.contains(&identity) {
        continue;
      }
      self.check_shutdown()?;
      if !node.is_alive() {
        self.book.lock().forget(&identity);
      }
      match self.backend.move_identity(&identity, Some(node.id), None).await {
        Ok(target) => info!(node = %node.id, identity = %identity, target = %target, "offloaded"),
        Err(ClusterError::NoNodesAvailable) => return Err(ClusterError::NoNodesAvailable),
        Err(e) => {
          warn!(node = %node.id, identity = %identity, "offload failed: {}", e);
          break;
        }
      }
      if node.is_alive() {
        break;
      }
    }
    Ok(())
  }
}

/// Balances identities across nodes.
///
/// While enabled, the coordinator asks its [`GroupFinder`] for a fresh set of affinity groups every
/// [`update_secs`](PlacementConfig::update_secs) and throws the previous set away. Each new set
/// starts a collocation sweep that walks the groups in id order and moves the stragglers of one
/// group at a time onto its target node.
///
/// [`offload`](PlacementCoordinator::offload) drains a node. Groups targeting it are claimed out
/// of the shared set first, so a sweep can never move them too. A live node gives up one group,
/// or one identity if it has none. A dead node gives up everything.
#[derive(Clone)]
pub struct PlacementCoordinator {
  shared: Arc<CoordinatorShared>,
}
impl PlacementCoordinator {
  pub fn new(
    config: PlacementConfig,
    backend: Arc<dyn PlacementBackend>,
    finder: Option<Arc<dyn GroupFinder>>,
    scheduler: Arc<dyn Scheduler>,
  ) -> ClusterResult<PlacementCoordinator> {
    config.validate()?;
    Ok(PlacementCoordinator {
      shared: Arc::new(CoordinatorShared {
        config: config,
        backend: backend,
        finder: finder,
        scheduler: scheduler,
        owner: Identity::new("placement-coordinator"),
        lifecycle: Mutex::new(Lifecycle {
          state: CoordinatorState::Disabled,
          update_task: None,
        }),
        book: Mutex::new(GroupBook::default()),
      }),
    })
  }

  pub fn config(&self) -> &PlacementConfig {
    &self.shared.config
  }

  pub fn state(&self) -> CoordinatorState {
    self.shared.state()
  }

  pub fn enable(&self) -> ClusterResult<()> {
    let shared = &self.shared;
    let mut lifecycle = shared.lifecycle.lock();
    match lifecycle.state {
      CoordinatorState::Shutdown => {
        return Err(ClusterError::IllegalState("placement coordinator is shut down"))
      }
      CoordinatorState::Enabled => return Ok(()),
      CoordinatorState::Disabled => {}
    }
    lifecycle.state = CoordinatorState::Enabled;
    if let Some(finder) = &shared.finder {
      finder.enable();
      let weak: Weak<CoordinatorShared> = Arc::downgrade(shared);
      let period = shared.config.update_period();
      lifecycle.update_task = Some(shared.scheduler.schedule_recurring(
        Arc::new(move || {
          let weak = weak.clone();
          Box::pin(async move {
            if let Some(shared) = weak.upgrade() {
              if let Err(e) = shared.discover().await {
                debug!("discovery pass skipped: {}", e);
              }
            }
          })
        }),
        &shared.owner,
        period,
        period,
      ));
    }
    info!("placement coordinator enabled");
    Ok(())
  }

  /// Cancels discovery and stops any sweep in progress.
  pub fn disable(&self) -> ClusterResult<()> {
    let shared = &self.shared;
    let mut lifecycle = shared.lifecycle.lock();
    match lifecycle.state {
      CoordinatorState::Shutdown => {
        return Err(ClusterError::IllegalState("placement coordinator is shut down"))
      }
      CoordinatorState::Disabled => return Ok(()),
      CoordinatorState::Enabled => {}
    }
    lifecycle.state = CoordinatorState::Disabled;
    if let Some(task) = lifecycle.update_task.take() {
      task.cancel();
    }
    shared.stop_sweep();
    if let Some(finder) = &shared.finder {
      finder.disable();
    }
    info!("placement coordinator disabled");
    Ok(())
  }

  pub fn shutdown(&self) -> ClusterResult<()> {
    let shared = &self.shared;
    let mut lifecycle = shared.lifecycle.lock();
    if lifecycle.state == CoordinatorState::Shutdown {
      return Err(ClusterError::IllegalState("placement coordinator is shut down"));
    }
    lifecycle.state = CoordinatorState::Shutdown;
    if let Some(task) = lifecycle.update_task.take() {
      task.cancel();
    }
    shared.stop_sweep();
    if let Some(finder) = &shared.finder {
      finder.shutdown();
    }
    info!("placement coordinator shut down");
    Ok(())
  }

  /// Runs a discovery pass now instead of waiting for the next one. Returns how many groups were
  /// installed.
  pub async fn discover(&self) -> ClusterResult<usize> {
    self.shared.discover().await
  }

  pub async fn offload(&self, node: &Node) -> ClusterResult<()> {
    self.shared.check_shutdown()?;
    self.shared.offload(node).await
  }

  /// Ids of the groups still waiting in the shared set, in sweep order.
  pub fn group_ids(&self) -> Vec<u64> {
    self.shared.book.lock().groups.keys().copied().collect()
  }

  /// Ids of the groups claimed for offloading off of `node`.
  pub fn claimed_group_ids(&self, node: NodeId) -> Vec<u64> {
    self
      .shared
      .book
      .lock()
      .node_sets
      .get(&node)
      .map(|s| s.keys().copied().collect())
      .unwrap_or_default()
  }

  pub fn generation(&self) -> Option<u64> {
    self.shared.book.lock().generation
  }

  pub fn is_sweeping(&self) -> bool {
    self.shared.book.lock().sweep.is_some()
  }
}

#[test]
fn config_bounds() {
  assert!(PlacementConfig::default().validate().is_ok());
  for secs in [3, 70000] {
    let cfg = PlacementConfig {
      update_secs: secs,
      ..Default::default()
    };
    assert!(cfg.validate().is_err());
  }
}
