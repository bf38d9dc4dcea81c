use crate::core::{
  ClusterError, ClusterResult, Health, Host, Identity, Node, NodeId, RecurringHandle, Scheduler,
};
use crate::watchdog::{
  NodeListener, Registration, RegistryConfig, RegistryRpc, StatusBatch, StatusRpc,
};
use async_trait::async_trait;
use im::OrdMap;
use itertools::Itertools;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::seq::IteratorRandom;
use rand::SeedableRng;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

#[derive(Clone)]
struct Entry {
  node: Node,
  last_renewal: Instant,
  client: Arc<dyn StatusRpc>,
}

struct RegistryState {
  next_id: u64,
  nodes: OrdMap<NodeId, Entry>,
  listeners: Vec<Arc<dyn NodeListener>>,
  sweep: Option<RecurringHandle>,
  rng: SmallRng,
  shut_down: bool,
}
impl RegistryState {
  fn check(&self) -> ClusterResult<()> {
    if self.shut_down {
      Err(ClusterError::IllegalState("node registry is shut down"))
    } else {
      Ok(())
    }
  }

  fn choose_backup(&mut self, exclude: NodeId) -> Option<NodeId> {
    let rng = &mut self.rng;
    self
      .nodes
      .values()
      .filter(|e| e.node.id != exclude && e.node.is_alive())
      .map(|e| e.node.id)
      .choose(rng)
  }

  /// Marks `id` failed, gives it a live backup and moves every pending recovery it was backing up
  /// to another live node. Returns every node whose record changed.
  fn fail(&mut self, id: NodeId) -> Vec<Node> {
    let mut changed = Vec::new();
    let current_backup = match self.nodes.get_mut(&id) {
      Some(e) if e.node.is_alive() => {
        e.node.health = Health::Failed;
        e.node.backup
      }
      _ => return changed,
    };
    let keep = current_backup
      .and_then(|b| self.nodes.get(&b))
      .filter(|b| b.node.is_alive())
      .map(|b| b.node.id);
    let backup = keep.or_else(|| self.choose_backup(id));
    if let Some(e) = self.nodes.get_mut(&id) {
      e.node.backup = backup;
      changed.push(e.node.clone());
    }
    let orphans = self
      .nodes
      .values()
      .filter(|e| e.node.id != id && e.node.backup == Some(id))
      .map(|e| e.node.id)
      .collect_vec();
    for orphan in orphans {
      let backup = self.choose_backup(orphan);
      if let Some(e) = self.nodes.get_mut(&orphan) {
        e.node.backup = backup;
        changed.push(e.node.clone());
      }
    }
    changed
  }

  fn live_clients(&self) -> Vec<Arc<dyn StatusRpc>> {
    self
      .nodes
      .values()
      .filter(|e| e.node.is_alive())
      .map(|e| e.client.clone())
      .collect()
  }
}

struct RegistryShared {
  config: RegistryConfig,
  scheduler: Arc<dyn Scheduler>,
  owner: Identity,
  state: Mutex<RegistryState>,
}
impl RegistryShared {
  fn sweep(&self) {
    let (changed, targets, failed, listeners) = {
      let mut state = self.state.lock();
      if state.shut_down {
        return;
      }
      let now = Instant::now();
      let interval = self.config.renew_interval();
      let expired = state
        .nodes
        .values()
        .filter(|e| e.node.is_alive() && now.duration_since(e.last_renewal) > interval)
        .map(|e| e.node.id)
        .collect_vec();
      if expired.is_empty() {
        return;
      }
      let mut changed = Vec::new();
      let mut failed = Vec::new();
      for id in expired {
        warn!(node = %id, "node missed its renewal, declaring it failed");
        changed.extend(state.fail(id));
        if let Some(e) = state.nodes.get(&id) {
          failed.push(e.client.clone());
        }
      }
      (changed, state.live_clients(), failed, state.listeners.clone())
    };
    for client in failed {
      self.spawn(async move {
        if let Err(e) = client.report_failure("node-registry").await {
          trace!("could not tell a failed node it failed: {}", e);
        }
      });
    }
    self.push(&changed, targets, listeners);
  }

  fn spawn<F>(&self, f: F)
  where
    F: std::future::Future<Output = ()> + Send + 'static,
  {
    self.scheduler.schedule_once(Box::pin(f), &self.owner, Duration::ZERO);
  }

  fn push(
    &self,
    changed: &[Node],
    targets: Vec<Arc<dyn StatusRpc>>,
    listeners: Vec<Arc<dyn NodeListener>>,
  ) {
    if changed.is_empty() {
      return;
    }
    let batch = changed.iter().collect::<StatusBatch>();
    for client in targets {
      let batch = batch.clone();
      self.spawn(async move {
        if let Err(e) = client.node_status_changes(batch).await {
          debug!("status push failed: {}", e);
        }
      });
    }
    for listener in listeners {
      for node in changed.iter().cloned() {
        let listener = listener.clone();
        self.spawn(async move { listener.node_health_change(node).await });
      }
    }
  }
}

/// The cluster-wide authority on which nodes exist and which of them are alive.
///
/// Nodes register to get an id and a renew interval, then renew at least that often. A recurring
/// sweep declares every node that missed its renewal failed, makes sure it has a live backup and
/// pushes the change to every live node. A failed node stays in the table until its backup reports
/// it recovered, so its id can never come back.
#[derive(Clone)]
pub struct NodeRegistry {
  shared: Arc<RegistryShared>,
}
impl NodeRegistry {
  pub fn start(config: RegistryConfig, scheduler: Arc<dyn Scheduler>) -> ClusterResult<NodeRegistry> {
    let config = config.checked()?;
    let sweep_interval = config.sweep_interval();
    let shared = Arc::new(RegistryShared {
      config: config,
      scheduler: scheduler,
      owner: Identity::new("node-registry"),
      state: Mutex::new(RegistryState {
        next_id: 1,
        nodes: OrdMap::new(),
        listeners: Vec::new(),
        sweep: None,
        rng: SmallRng::from_entropy(),
        shut_down: false,
      }),
    });
    let weak: Weak<RegistryShared> = Arc::downgrade(&shared);
    let handle = shared.scheduler.schedule_recurring(
      Arc::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
          if let Some(shared) = weak.upgrade() {
            shared.sweep();
          }
        })
      }),
      &shared.owner,
      sweep_interval,
      sweep_interval,
    );
    shared.state.lock().sweep = Some(handle);
    info!(renew_interval = ?shared.config.renew_interval(), "node registry started");
    Ok(NodeRegistry { shared: shared })
  }

  pub fn config(&self) -> &RegistryConfig {
    &self.shared.config
  }

  pub fn add_node_listener(&self, listener: Arc<dyn NodeListener>) -> ClusterResult<()> {
    let mut state = self.shared.state.lock();
    state.check()?;
    state.listeners.push(listener);
    Ok(())
  }

  pub fn register(&self, host: Host, client: Arc<dyn StatusRpc>) -> ClusterResult<Registration> {
    let shared = &self.shared;
    let (node, changed, others, snapshot, listeners) = {
      let mut state = shared.state.lock();
      state.check()?;
      let id = NodeId(state.next_id);
      state.next_id += 1;
      let backup = state.choose_backup(id);
      let node = Node::new(id, host, Health::Green, backup);
      let mut changed = vec![node.clone()];
      let orphans = state
        .nodes
        .values()
        .filter(|e| match e.node.backup {
          Some(b) => !state.nodes.get(&b).map_or(false, |b| b.node.is_alive()),
          None => true,
        })
        .map(|e| e.node.id)
        .collect_vec();
      for orphan in orphans {
        if let Some(e) = state.nodes.get_mut(&orphan) {
          e.node.backup = Some(id);
          changed.push(e.node.clone());
        }
      }
      let others = state.live_clients();
      state.nodes.insert(
        id,
        Entry {
          node: node.clone(),
          last_renewal: Instant::now(),
          client: client.clone(),
        },
      );
      let snapshot = state.nodes.values().map(|e| e.node.clone()).collect_vec();
      (node, changed, others, snapshot, state.listeners.clone())
    };
    info!(node = %node.id, host = %node.host, "node registered");
    shared.push(&changed, others, listeners);
    shared.push(&snapshot, vec![client], Vec::new());
    Ok(Registration {
      node_id: node.id,
      renew_interval: shared.config.renew_interval(),
    })
  }

  pub fn renew(&self, id: NodeId) -> ClusterResult<bool> {
    let mut state = self.shared.state.lock();
    state.check()?;
    match state.nodes.get_mut(&id) {
      Some(e) if e.node.is_alive() => {
        e.last_renewal = Instant::now();
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  /// Forgets `failed`. Only its current backup may do this, and only once the node has failed.
  pub fn recovered(&self, failed: NodeId, backup: NodeId) -> ClusterResult<()> {
    let mut state = self.shared.state.lock();
    state.check()?;
    let current = match state.nodes.get(&failed) {
      None => {
        debug!(node = %failed, "recovered node already removed");
        return Ok(());
      }
      Some(e) if e.node.is_alive() => {
        return Err(ClusterError::ProtocolViolation(format!(
          "node {} reported recovered while alive",
          failed
        )))
      }
      Some(e) => e.node.backup,
    };
    if current != Some(backup) {
      debug!(node = %failed, %backup, "ignoring recovery by a node that is no longer the backup");
      return Ok(());
    }
    state.nodes.remove(&failed);
    info!(node = %failed, %backup, "node recovered");
    Ok(())
  }

  /// Sets the health of a live node. A failed node stays failed.
  pub fn set_health(&self, id: NodeId, health: Health, component: &str) -> ClusterResult<()> {
    let shared = &self.shared;
    let (changed, targets, listeners) = {
      let mut state = shared.state.lock();
      state.check()?;
      let entry = state.nodes.get_mut(&id).ok_or(ClusterError::UnknownNode(id))?;
      if !entry.node.is_alive() || entry.node.health == health {
        return Ok(());
      }
      let changed = if health.is_alive() {
        entry.node.health = health;
        vec![entry.node.clone()]
      } else {
        warn!(node = %id, %component, "node reported failed");
        state.fail(id)
      };
      (changed, state.live_clients(), state.listeners.clone())
    };
    debug!(node = %id, %health, %component, "node health set");
    shared.push(&changed, targets, listeners);
    Ok(())
  }

  pub fn report_failure(&self, id: NodeId, component: &str) -> ClusterResult<()> {
    self.set_health(id, Health::Failed, component)
  }

  pub fn node(&self, id: NodeId) -> Option<Node> {
    self.shared.state.lock().nodes.get(&id).map(|e| e.node.clone())
  }

  /// Every node still in the table, failed ones awaiting recovery included.
  pub fn nodes(&self) -> OrdMap<NodeId, Node> {
    self
      .shared
      .state
      .lock()
      .nodes
      .iter()
      .map(|(id, e)| (*id, e.node.clone()))
      .collect()
  }

  /// Stops the sweep. Every later call fails with [`ClusterError::IllegalState`].
  pub fn shutdown(&self) -> ClusterResult<()> {
    let mut state = self.shared.state.lock();
    state.check()?;
    state.shut_down = true;
    if let Some(sweep) = state.sweep.take() {
      sweep.cancel();
    }
    info!("node registry shut down");
    Ok(())
  }
}
#[async_trait]
impl RegistryRpc for NodeRegistry {
  async fn register_node(
    &self,
    host: Host,
    client: Arc<dyn StatusRpc>,
  ) -> ClusterResult<Registration> {
    self.register(host, client)
  }

  async fn renew_node(&self, node: NodeId) -> ClusterResult<bool> {
    self.renew(node)
  }

  async fn recovered_node(&self, failed: NodeId, backup: NodeId) -> ClusterResult<()> {
    self.recovered(failed, backup)
  }

  async fn set_node_health(
    &self,
    node: NodeId,
    health: Health,
    component: &str,
  ) -> ClusterResult<()> {
    self.set_health(node, health, component)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testkit::ManualScheduler;

  struct Silent;
  #[async_trait]
  impl StatusRpc for Silent {
    async fn node_status_changes(&self, _: StatusBatch) -> ClusterResult<()> {
      Ok(())
    }

    async fn report_failure(&self, _: &str) -> ClusterResult<()> {
      Ok(())
    }
  }

  fn registry(sched: &ManualScheduler) -> NodeRegistry {
    NodeRegistry::start(RegistryConfig::default(), Arc::new(sched.clone())).unwrap()
  }

  #[tokio::test(start_paused = true)]
  async fn ids_start_at_one_and_first_gets_backup_later() {
    let sched = ManualScheduler::new();
    let reg = registry(&sched);
    let a = reg.register(Host::from("a"), Arc::new(Silent)).unwrap();
    assert_eq!(a.node_id, NodeId(1));
    assert_eq!(a.renew_interval, Duration::from_millis(1000));
    assert_eq!(reg.node(NodeId(1)).unwrap().backup, None);
    let b = reg.register(Host::from("b"), Arc::new(Silent)).unwrap();
    assert_eq!(b.node_id, NodeId(2));
    assert_eq!(reg.node(NodeId(1)).unwrap().backup, Some(NodeId(2)));
    assert_eq!(reg.node(NodeId(2)).unwrap().backup, Some(NodeId(1)));
  }

  #[tokio::test(start_paused = true)]
  async fn sweep_fails_silent_nodes_only() {
    let sched = ManualScheduler::new();
    let reg = registry(&sched);
    reg.register(Host::from("a"), Arc::new(Silent)).unwrap();
    reg.register(Host::from("b"), Arc::new(Silent)).unwrap();
    for _ in 0..6 {
      sched.advance(Duration::from_millis(300)).await;
      assert!(reg.renew(NodeId(2)).unwrap());
    }
    let a = reg.node(NodeId(1)).unwrap();
    assert_eq!(a.health, Health::Failed);
    assert_eq!(a.backup, Some(NodeId(2)));
    assert!(reg.node(NodeId(2)).unwrap().is_alive());
    assert!(!reg.renew(NodeId(1)).unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn recovered_requires_current_backup() {
    let sched = ManualScheduler::new();
    let reg = registry(&sched);
    reg.register(Host::from("a"), Arc::new(Silent)).unwrap();
    reg.register(Host::from("b"), Arc::new(Silent)).unwrap();
    assert!(matches!(
      reg.recovered(NodeId(1), NodeId(2)),
      Err(ClusterError::ProtocolViolation(_))
    ));
    reg.report_failure(NodeId(1), "test").unwrap();
    reg.recovered(NodeId(1), NodeId(7)).unwrap();
    assert!(reg.node(NodeId(1)).is_some());
    reg.recovered(NodeId(1), NodeId(2)).unwrap();
    assert!(reg.node(NodeId(1)).is_none());
    assert!(!reg.renew(NodeId(1)).unwrap());
  }

  #[tokio::test(start_paused = true)]
  async fn failed_backup_is_replaced() {
    let sched = ManualScheduler::new();
    let reg = registry(&sched);
    for host in ["a", "b", "c"] {
      reg.register(Host::from(host), Arc::new(Silent)).unwrap();
    }
    reg.report_failure(NodeId(1), "test").unwrap();
    let backup = reg.node(NodeId(1)).unwrap().backup.unwrap();
    reg.report_failure(backup, "test").unwrap();
    let survivor = reg.nodes().values().find(|n| n.is_alive()).unwrap().id;
    assert_eq!(reg.node(NodeId(1)).unwrap().backup, Some(survivor));
  }

  #[tokio::test(start_paused = true)]
  async fn health_never_resurrects() {
    let sched = ManualScheduler::new();
    let reg = registry(&sched);
    reg.register(Host::from("a"), Arc::new(Silent)).unwrap();
    reg.set_health(NodeId(1), Health::Red, "load").unwrap();
    assert_eq!(reg.node(NodeId(1)).unwrap().health, Health::Red);
    reg.report_failure(NodeId(1), "load").unwrap();
    reg.set_health(NodeId(1), Health::Green, "load").unwrap();
    assert_eq!(reg.node(NodeId(1)).unwrap().health, Health::Failed);
    assert_eq!(
      reg.set_health(NodeId(9), Health::Green, "load"),
      Err(ClusterError::UnknownNode(NodeId(9)))
    );
  }

  #[tokio::test(start_paused = true)]
  async fn calls_after_shutdown_are_illegal() {
    let sched = ManualScheduler::new();
    let reg = registry(&sched);
    reg.register(Host::from("a"), Arc::new(Silent)).unwrap();
    reg.shutdown().unwrap();
    assert!(matches!(reg.renew(NodeId(1)), Err(ClusterError::IllegalState(_))));
    assert!(matches!(
      reg.register(Host::from("b"), Arc::new(Silent)),
      Err(ClusterError::IllegalState(_))
    ));
    assert!(reg.shutdown().is_err());
  }
}
