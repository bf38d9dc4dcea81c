use crate::core::{ClusterError, ClusterResult, Health, Host, Identity, Node, NodeId, Scheduler};
use crate::watchdog::{
  HeartbeatClient, Liveness, LivenessState, NodeListener, RecoveryCoordinator, RecoveryListener,
  Registration, RegistryRpc, StatusBatch, StatusRpc, WatchdogConfig,
};
use async_trait::async_trait;
use im::OrdMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

struct ClientState {
  view: OrdMap<NodeId, Node>,
  listeners: Vec<Arc<dyn NodeListener>>,
  reports: BTreeMap<String, Health>,
  health: Health,
}

struct WatchdogShared {
  host: Host,
  config: WatchdogConfig,
  registry: Arc<dyn RegistryRpc>,
  scheduler: Arc<dyn Scheduler>,
  owner: Identity,
  liveness: Liveness,
  recovery: RecoveryCoordinator,
  id_tx: watch::Sender<Option<NodeId>>,
  heartbeat: Mutex<Option<Arc<HeartbeatClient>>>,
  state: Mutex<ClientState>,
}

/// The per-node half of the liveness protocol.
///
/// [`start`](LocalWatchdog::start) registers with the registry and begins renewing. From then on
/// the watchdog keeps a view of every node it has heard about, tells its [`NodeListener`]s about
/// changes, and drives recovery of any failed node it backs up.
#[derive(Clone)]
pub struct LocalWatchdog {
  shared: Arc<WatchdogShared>,
}
impl LocalWatchdog {
  pub fn new(
    host: Host,
    registry: Arc<dyn RegistryRpc>,
    scheduler: Arc<dyn Scheduler>,
    config: WatchdogConfig,
  ) -> ClusterResult<LocalWatchdog> {
    let config = config.checked()?;
    let liveness = Liveness::new();
    let recovery = RecoveryCoordinator::new(
      registry.clone(),
      scheduler.clone(),
      liveness.clone(),
      config.recovery_timeout(),
    );
    let (id_tx, _) = watch::channel(None);
    Ok(LocalWatchdog {
      shared: Arc::new(WatchdogShared {
        owner: Identity::new(format!("watchdog@{}", host)),
        host: host,
        config: config,
        registry: registry,
        scheduler: scheduler,
        liveness: liveness,
        recovery: recovery,
        id_tx: id_tx,
        heartbeat: Mutex::new(None),
        state: Mutex::new(ClientState {
          view: OrdMap::new(),
          listeners: Vec::new(),
          reports: BTreeMap::new(),
          health: Health::Green,
        }),
      }),
    })
  }

  pub async fn start(&self) -> ClusterResult<Registration> {
    let shared = &self.shared;
    if shared.liveness.state() != LivenessState::Registering || shared.id_tx.borrow().is_some() {
      return Err(ClusterError::IllegalState("watchdog already started or stopped"));
    }
    let client: Arc<dyn StatusRpc> = Arc::new(self.clone());
    let registration = shared.registry.register_node(shared.host.clone(), client).await?;
    if !shared.liveness.set_alive() {
      return Err(ClusterError::IllegalState("watchdog stopped while registering"));
    }
    shared.id_tx.send_replace(Some(registration.node_id));
    info!(node = %registration.node_id, host = %shared.host, "registered with the node registry");
    let weak = Arc::downgrade(shared);
    let hb = HeartbeatClient::start(
      shared.registry.clone(),
      registration,
      shared.liveness.clone(),
      shared.config.min_retry_delay(),
      Arc::new(move |reason| {
        if let Some(shared) = weak.upgrade() {
          LocalWatchdog { shared: shared }.notify_local_failure(reason);
        }
      }),
    );
    *shared.heartbeat.lock() = Some(Arc::new(hb));
    Ok(registration)
  }

  pub fn add_node_listener(&self, listener: Arc<dyn NodeListener>) {
    self.shared.state.lock().listeners.push(listener);
  }

  pub fn add_recovery_listener(&self, listener: Arc<dyn RecoveryListener>) {
    self.shared.recovery.add_listener(listener);
  }

  pub fn recovery(&self) -> &RecoveryCoordinator {
    &self.shared.recovery
  }

  pub fn local_node_id(&self) -> Option<NodeId> {
    *self.shared.id_tx.borrow()
  }

  pub fn is_local_node_alive(&self) -> bool {
    self.shared.liveness.is_alive()
  }

  pub fn local_health(&self) -> Health {
    if self.shared.liveness.is_alive() {
      self.shared.state.lock().health
    } else {
      Health::Failed
    }
  }

  pub fn node(&self, id: NodeId) -> Option<Node> {
    self.shared.state.lock().view.get(&id).cloned()
  }

  pub fn nodes(&self) -> OrdMap<NodeId, Node> {
    self.shared.state.lock().view.clone()
  }

  pub fn backup(&self, id: NodeId) -> Option<NodeId> {
    self.node(id).and_then(|n| n.backup)
  }

  fn check(&self) -> ClusterResult<()> {
    if self.shared.liveness.is_shutting_down() {
      Err(ClusterError::IllegalState("watchdog is shut down"))
    } else {
      Ok(())
    }
  }

  /// Reports `health` for `node` on behalf of `component`. For the local node, every component's
  /// latest report is kept and the worst one is sent to the registry. A `Green` report withdraws
  /// the component's earlier reports.
  pub async fn report_health(
    &self,
    node: NodeId,
    health: Health,
    component: &str,
  ) -> ClusterResult<()> {
    self.check()?;
    let local = self.local_node_id();
    if local != Some(node) {
      return self.send_health(node, health, component).await;
    }
    let aggregate = {
      let mut state = self.shared.state.lock();
      if health == Health::Green {
        state.reports.remove(component);
      } else {
        state.reports.insert(component.to_string(), health);
      }
      let worst = state.reports.values().copied().max().unwrap_or(Health::Green);
      if worst == state.health {
        return Ok(());
      }
      state.health = worst;
      worst
    };
    if !aggregate.is_alive() {
      self.fail_local(component);
      return Ok(());
    }
    if let Err(e) = self.send_health(node, aggregate, component).await {
      error!(node = %node, "could not report health, failing: {}", e);
      self.fail_local(component);
    }
    Ok(())
  }

  pub async fn report_failure(&self, node: NodeId, component: &str) -> ClusterResult<()> {
    self.report_health(node, Health::Failed, component).await
  }

  async fn send_health(&self, node: NodeId, health: Health, component: &str) -> ClusterResult<()> {
    let mut last = ClusterError::Unreachable("no attempt made".to_string());
    for attempt in 1..=self.shared.config.io_retries {
      match self.shared.registry.set_node_health(node, health, component).await {
        Ok(()) => return Ok(()),
        Err(e) if e.is_transient() => {
          debug!(node = %node, attempt, "health report failed: {}", e);
          last = e;
        }
        Err(e) => return Err(e),
      }
    }
    Err(last)
  }

  /// Fails the local node and tells the registry, without waiting on it.
  fn fail_local(&self, reason: &str) {
    if !self.shared.liveness.set_failed() {
      return;
    }
    self.notify_local_failure(reason);
    if let Some(local) = self.local_node_id() {
      let registry = self.shared.registry.clone();
      let reason = reason.to_string();
      self.shared.scheduler.schedule_once(
        Box::pin(async move {
          if let Err(e) = registry.set_node_health(local, Health::Failed, &reason).await {
            debug!(node = %local, "could not report local failure: {}", e);
          }
        }),
        &self.shared.owner,
        Duration::ZERO,
      );
    }
  }

  /// Runs once per node lifetime, after the liveness flag flipped to failed.
  fn notify_local_failure(&self, reason: &str) {
    let shared = &self.shared;
    warn!(host = %shared.host, %reason, "local node failed");
    let local = match self.local_node_id() {
      Some(id) => id,
      None => return,
    };
    let (node, listeners) = {
      let mut state = shared.state.lock();
      state.health = Health::Failed;
      let node = match state.view.get(&local) {
        Some(n) => Node::new(local, n.host.clone(), Health::Failed, n.backup),
        None => Node::new(local, shared.host.clone(), Health::Failed, None),
      };
      state.view.insert(local, node.clone());
      (node, state.listeners.clone())
    };
    for listener in listeners {
      let node = node.clone();
      shared.scheduler.schedule_once(
        Box::pin(async move { listener.node_health_change(node).await }),
        &shared.owner,
        Duration::ZERO,
      );
    }
  }

  /// Stops renewing and abandons recoveries in progress. Later calls fail with
  /// [`ClusterError::IllegalState`].
  pub async fn shutdown(&self) -> ClusterResult<()> {
    if !self.shared.liveness.begin_shutdown() {
      return Err(ClusterError::IllegalState("watchdog is shut down"));
    }
    let hb = self.shared.heartbeat.lock().take();
    if let Some(hb) = hb {
      hb.shutdown().await;
    }
    self.shared.recovery.shutdown();
    info!(host = %self.shared.host, "watchdog shut down");
    Ok(())
  }
}
#[async_trait]
impl StatusRpc for LocalWatchdog {
  async fn node_status_changes(&self, batch: StatusBatch) -> ClusterResult<()> {
    let nodes = match batch.nodes() {
      Ok(nodes) => nodes,
      Err(e) => {
        error!("rejecting status batch: {}", e);
        return Err(e);
      }
    };
    self.check()?;
    let local = {
      let mut rx = self.shared.id_tx.subscribe();
      let id = *rx
        .wait_for(|id| id.is_some())
        .await
        .map_err(|_| ClusterError::IllegalState("watchdog dropped"))?;
      id.ok_or(ClusterError::IllegalState("watchdog not registered"))?
    };
    for node in nodes {
      if node.id == local {
        if node.is_alive() {
          let mut state = self.shared.state.lock();
          if state.view.get(&local).map_or(true, |n| n.is_alive()) {
            state.view.insert(local, node);
          }
        } else {
          self.fail_local("node registry");
        }
        continue;
      }
      let listeners = {
        let mut state = self.shared.state.lock();
        state.view.insert(node.id, node.clone());
        state.listeners.clone()
      };
      for listener in listeners {
        let node = node.clone();
        let liveness = self.shared.liveness.clone();
        self.shared.scheduler.schedule_once(
          Box::pin(async move {
            if liveness.is_alive() {
              listener.node_health_change(node).await;
            }
          }),
          &self.shared.owner,
          Duration::ZERO,
        );
      }
      if !node.is_alive() && node.backup == Some(local) {
        if self.shared.liveness.is_alive() {
          self.shared.recovery.start(node, local);
        } else {
          debug!(node = %node.id, "not alive, skipping recovery");
        }
      }
    }
    Ok(())
  }

  async fn report_failure(&self, component: &str) -> ClusterResult<()> {
    self.fail_local(component);
    Ok(())
  }
}
