use async_trait::async_trait;
use nodekeeper::core::{
  ClusterResult, Health, Host, Identity, NodeId, Scheduler, TokioScheduler,
};
use nodekeeper::nodemap::{
  NodeAssignPolicy, NodeMapServer, PlacementConfig, PlacementCoordinator, PlacementListener,
  RoundRobinPolicy,
};
use nodekeeper::testkit::{
  logging, FailureConfig, FailureConfigMap, LogLevel, MemoryMappingStore, RecordingNodeListener,
  RecordingRecoveryListener, UnreliableRegistry,
};
use nodekeeper::watchdog::{
  LocalWatchdog, NodeRegistry, Registration, RegistryConfig, RegistryRpc, StatusRpc,
  WatchdogConfig,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const RENEW_MS: u64 = 1000;

struct CountingRegistry {
  inner: NodeRegistry,
  recovered: Mutex<Vec<(NodeId, NodeId)>>,
}
#[async_trait]
impl RegistryRpc for CountingRegistry {
  async fn register_node(
    &self,
    host: Host,
    client: Arc<dyn StatusRpc>,
  ) -> ClusterResult<Registration> {
    self.inner.register_node(host, client).await
  }

  async fn renew_node(&self, node: NodeId) -> ClusterResult<bool> {
    self.inner.renew_node(node).await
  }

  async fn recovered_node(&self, failed: NodeId, backup: NodeId) -> ClusterResult<()> {
    self.recovered.lock().push((failed, backup));
    self.inner.recovered_node(failed, backup).await
  }

  async fn set_node_health(
    &self,
    node: NodeId,
    health: Health,
    component: &str,
  ) -> ClusterResult<()> {
    self.inner.set_node_health(node, health, component).await
  }
}

struct Cluster {
  registry: NodeRegistry,
  rpc: Arc<CountingRegistry>,
  scheduler: Arc<dyn Scheduler>,
  policy: Arc<dyn NodeAssignPolicy>,
  store: Arc<MemoryMappingStore>,
  server: Arc<NodeMapServer>,
  coordinator: PlacementCoordinator,
}
impl Cluster {
  fn new() -> Cluster {
    logging::init(LogLevel::Warn);
    let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());
    let registry = NodeRegistry::start(
      RegistryConfig {
        renew_interval_ms: RENEW_MS,
        sweep_interval_ms: None,
      },
      scheduler.clone(),
    )
    .unwrap();
    let policy: Arc<dyn NodeAssignPolicy> = Arc::new(RoundRobinPolicy::default());
    let store = Arc::new(MemoryMappingStore::new());
    let server = Arc::new(NodeMapServer::new(policy.clone(), store.clone()));
    let coordinator =
      PlacementCoordinator::new(PlacementConfig::default(), server.clone(), None, scheduler.clone())
        .unwrap();
    coordinator.enable().unwrap();
    registry
      .add_node_listener(Arc::new(PlacementListener::new(policy.clone(), coordinator.clone())))
      .unwrap();
    Cluster {
      rpc: Arc::new(CountingRegistry {
        inner: registry.clone(),
        recovered: Mutex::new(Vec::new()),
      }),
      registry: registry,
      scheduler: scheduler,
      policy: policy,
      store: store,
      server: server,
      coordinator: coordinator,
    }
  }

  fn watchdog(&self, host: &str, registry: Arc<dyn RegistryRpc>) -> LocalWatchdog {
    LocalWatchdog::new(
      Host::from(host),
      registry,
      self.scheduler.clone(),
      WatchdogConfig::default(),
    )
    .unwrap()
  }
}

#[tokio::test(start_paused = true)]
async fn failed_node_is_recovered_by_its_backup() {
  let cluster = Cluster::new();
  let a = cluster.watchdog("node-a", cluster.rpc.clone());
  let b = cluster.watchdog("node-b", cluster.rpc.clone());
  let c = cluster.watchdog("node-c", cluster.rpc.clone());
  let (recovery, recovered_rx) = RecordingRecoveryListener::new(false);
  b.add_recovery_listener(Arc::new(recovery));
  for wd in [&a, &b, &c] {
    wd.start().await.unwrap();
  }
  sleep(Duration::from_millis(100)).await;
  assert_eq!(a.local_node_id(), Some(NodeId(1)));
  assert_eq!(cluster.registry.node(NodeId(1)).unwrap().backup, Some(NodeId(2)));
  assert_eq!(b.backup(NodeId(1)), Some(NodeId(2)));
  assert_eq!(a.backup(NodeId(1)), Some(NodeId(2)));
  assert_eq!(a.node(NodeId(1)).map(|n| n.health), Some(Health::Green));
  assert_eq!(c.node(NodeId(3)).map(|n| n.id), Some(NodeId(3)));

  let x = Identity::new("x");
  assert_eq!(cluster.server.assign_node("svc", &x, None).await, Ok(NodeId(1)));

  a.shutdown().await.unwrap();
  sleep(Duration::from_millis(3 * RENEW_MS)).await;
  assert_eq!(cluster.registry.node(NodeId(1)).unwrap().health, Health::Failed);
  assert!(b.recovery().is_recovering(NodeId(1)));
  assert!(cluster.rpc.recovered.lock().is_empty());

  let (node, token) = recovered_rx.try_recv().unwrap();
  assert_eq!(node.id, NodeId(1));
  assert!(recovered_rx.try_recv().is_err());
  token.done();
  sleep(Duration::from_millis(100)).await;
  assert_eq!(*cluster.rpc.recovered.lock(), vec![(NodeId(1), NodeId(2))]);
  assert_eq!(cluster.registry.node(NodeId(1)), None);

  sleep(Duration::from_millis(3 * RENEW_MS)).await;
  assert!(recovered_rx.try_recv().is_err());
  assert_eq!(cluster.rpc.recovered.lock().len(), 1);

  let moved_to = cluster.store.get(&x).unwrap();
  assert_ne!(moved_to, NodeId(1));
  assert_eq!(cluster.store.moves_of(&x), 1);
  assert!(!cluster.policy.is_node_available(NodeId(1)));
  for _ in 0..6 {
    assert_ne!(cluster.policy.choose_node(None).unwrap(), NodeId(1));
  }
  assert!(b.is_local_node_alive() && c.is_local_node_alive());
  cluster.coordinator.shutdown().unwrap();
  cluster.registry.shutdown().unwrap();
}

#[tokio::test(start_paused = true)]
async fn liveness_is_monotonic_across_the_cluster() {
  let cluster = Cluster::new();
  let inner: Arc<dyn RegistryRpc> = Arc::new(cluster.registry.clone());
  let unreliable = Arc::new(UnreliableRegistry::new(inner, FailureConfigMap::default()));
  let a = cluster.watchdog("node-a", unreliable.clone());
  let b = cluster.watchdog("node-b", cluster.rpc.clone());
  let (a_listener, a_rx) = RecordingNodeListener::new();
  let (b_listener, b_rx) = RecordingNodeListener::new();
  a.add_node_listener(Arc::new(a_listener));
  b.add_node_listener(Arc::new(b_listener));
  a.start().await.unwrap();
  b.start().await.unwrap();
  sleep(Duration::from_millis(2 * RENEW_MS)).await;
  assert!(a.is_local_node_alive());

  let fail_map = FailureConfigMap::default().with_node(NodeId(1), FailureConfig::dropped());
  unreliable.set_failures(fail_map);
  sleep(Duration::from_millis(3 * RENEW_MS)).await;
  assert!(!a.is_local_node_alive());
  assert_eq!(a.local_health(), Health::Failed);
  // b backs a up and has nothing to recover, so a is gone already
  assert_eq!(*cluster.rpc.recovered.lock(), vec![(NodeId(1), NodeId(2))]);
  assert_eq!(cluster.registry.node(NodeId(1)), None);
  assert_eq!(cluster.registry.renew(NodeId(1)), Ok(false));

  let local_failures = a_rx
    .try_iter()
    .filter(|n| n.id == NodeId(1) && !n.is_alive())
    .count();
  assert_eq!(local_failures, 1);
  let seen_by_b = b_rx.try_iter().filter(|n| n.id == NodeId(1)).collect::<Vec<_>>();
  let first_failure = seen_by_b.iter().position(|n| !n.is_alive()).unwrap();
  assert!(seen_by_b[first_failure..].iter().all(|n| !n.is_alive()));

  // renewals getting through again change nothing
  unreliable.set_failures(FailureConfigMap::default());
  sleep(Duration::from_millis(3 * RENEW_MS)).await;
  assert!(!a.is_local_node_alive());
  assert_eq!(cluster.registry.node(NodeId(1)), None);
  assert!(a_rx.try_iter().all(|n| n.id != NodeId(1) || !n.is_alive()));
  assert!(b.is_local_node_alive());
}

#[tokio::test(start_paused = true)]
async fn component_health_is_aggregated() {
  let cluster = Cluster::new();
  let a = cluster.watchdog("node-a", cluster.rpc.clone());
  let b = cluster.watchdog("node-b", cluster.rpc.clone());
  a.start().await.unwrap();
  b.start().await.unwrap();
  sleep(Duration::from_millis(100)).await;
  assert!(cluster.policy.is_node_available(NodeId(2)));

  b.report_health(NodeId(2), Health::Yellow, "disk").await.unwrap();
  b.report_health(NodeId(2), Health::Red, "network").await.unwrap();
  sleep(Duration::from_millis(100)).await;
  assert_eq!(b.local_health(), Health::Red);
  assert_eq!(cluster.registry.node(NodeId(2)).unwrap().health, Health::Red);
  assert!(!cluster.policy.is_node_available(NodeId(2)));

  b.report_health(NodeId(2), Health::Green, "network").await.unwrap();
  sleep(Duration::from_millis(100)).await;
  assert_eq!(b.local_health(), Health::Yellow);
  assert_eq!(cluster.registry.node(NodeId(2)).unwrap().health, Health::Yellow);
  assert!(cluster.policy.is_node_available(NodeId(2)));

  // reports about another node go straight to the registry
  b.report_failure(NodeId(1), "ping").await.unwrap();
  sleep(Duration::from_millis(RENEW_MS)).await;
  assert_eq!(*cluster.rpc.recovered.lock(), vec![(NodeId(1), NodeId(2))]);
  assert_eq!(cluster.registry.node(NodeId(1)), None);
  assert!(!a.is_local_node_alive());
  assert!(b.is_local_node_alive());
  assert!(!cluster.policy.is_node_available(NodeId(1)));
}
