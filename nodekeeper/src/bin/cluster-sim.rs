use async_trait::async_trait;
use nodekeeper::core::{ClusterResult, Host, Identity, Node, NodeId, Scheduler, TokioScheduler};
use nodekeeper::nodemap::{
  MappingStore, NodeAssignPolicy, NodeMapServer, PlacementConfig, PlacementCoordinator,
  PlacementListener, RoundRobinPolicy,
};
use nodekeeper::testkit::{logging, LogLevel, MemoryMappingStore};
use nodekeeper::watchdog::{
  LocalWatchdog, NodeRegistry, RecoveryListener, RecoveryToken, RegistryConfig, RegistryRpc,
  WatchdogConfig,
};
use std::env::args;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::info;

const IDENTITIES: usize = 12;

struct LoggingRecovery {
  host: &'static str,
}
#[async_trait]
impl RecoveryListener for LoggingRecovery {
  async fn recover(&self, node: Node, token: RecoveryToken) {
    info!(on = self.host, failed = %node.id, "recovering");
    token.done();
  }
}

#[tokio::main]
async fn main() -> ClusterResult<()> {
  logging::init(LogLevel::Info);
  let renew_ms = args()
    .nth(1)
    .and_then(|s| s.parse::<u64>().ok())
    .unwrap_or(200);
  let scheduler: Arc<dyn Scheduler> = Arc::new(TokioScheduler::current());

  let registry = NodeRegistry::start(
    RegistryConfig {
      renew_interval_ms: renew_ms,
      sweep_interval_ms: None,
    },
    scheduler.clone(),
  )?;
  let policy: Arc<dyn NodeAssignPolicy> = Arc::new(RoundRobinPolicy::default());
  let store = Arc::new(MemoryMappingStore::new());
  let server = Arc::new(NodeMapServer::new(policy.clone(), store.clone()));
  let coordinator =
    PlacementCoordinator::new(PlacementConfig::default(), server.clone(), None, scheduler.clone())?;
  coordinator.enable()?;
  registry.add_node_listener(Arc::new(PlacementListener::new(policy.clone(), coordinator.clone())))?;

  let rpc: Arc<dyn RegistryRpc> = Arc::new(registry.clone());
  let mut watchdogs = Vec::new();
  for host in ["node-a", "node-b", "node-c"] {
    let wd = LocalWatchdog::new(
      Host::from(host),
      rpc.clone(),
      scheduler.clone(),
      WatchdogConfig::default(),
    )?;
    wd.add_recovery_listener(Arc::new(LoggingRecovery { host: host }));
    wd.start().await?;
    watchdogs.push(wd);
  }
  sleep(Duration::from_millis(renew_ms)).await;

  for i in 0..IDENTITIES {
    let identity = Identity::new(format!("user-{}", i));
    server.assign_node("sim", &identity, None).await?;
  }
  let on_a = store.identities_on(NodeId(1)).await?;
  info!(count = on_a.len(), "identities on node-a before it stops");

  watchdogs[0].shutdown().await?;
  sleep(Duration::from_millis(renew_ms * 4)).await;

  for (id, node) in registry.nodes() {
    info!(node = %id, health = %node.health, backup = ?node.backup, "registry entry");
  }
  for identity in on_a {
    info!(identity = %identity, node = ?store.get(&identity), "moved");
  }
  for wd in &watchdogs[1..] {
    wd.shutdown().await?;
  }
  coordinator.shutdown()?;
  registry.shutdown()?;
  Ok(())
}
