use crate::core::{ClusterError, ClusterResult, Health, Host, NodeId};
use crate::watchdog::{Registration, RegistryRpc, StatusRpc};
use async_trait::async_trait;
use im::HashMap;
use parking_lot::RwLock;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

/// The registry calls a node makes after it registered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum RegistryCall {
  Renew,
  Recovered,
  Health,
}

/// How a call gets disturbed. `delay` is a uniform range the call sleeps for before it is either
/// dropped, with probability `drop_prob`, or passed on.
#[derive(Default, Serialize, Deserialize, Clone, Copy, Debug)]
pub struct FailureConfig {
  pub drop_prob: f64,
  pub delay: Option<(Duration, Duration)>,
}
impl FailureConfig {
  pub fn dropped() -> FailureConfig {
    FailureConfig {
      drop_prob: 1.0,
      delay: None,
    }
  }
}

/// Failure settings, from most to least specific: one kind of call from one node, every call from
/// one node, everything else.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct FailureConfigMap {
  pub cluster_wide: FailureConfig,
  pub node_wide: HashMap<NodeId, FailureConfig>,
  pub per_call: HashMap<NodeId, HashMap<RegistryCall, FailureConfig>>,
}
impl FailureConfigMap {
  pub fn get(&self, node: NodeId, call: RegistryCall) -> &FailureConfig {
    self
      .per_call
      .get(&node)
      .and_then(|calls| calls.get(&call))
      .or_else(|| self.node_wide.get(&node))
      .unwrap_or(&self.cluster_wide)
  }

  pub fn with_node(mut self, node: NodeId, cfg: FailureConfig) -> Self {
    self.node_wide.insert(node, cfg);
    self
  }

  pub fn with_call(mut self, node: NodeId, call: RegistryCall, cfg: FailureConfig) -> Self {
    self.per_call.entry(node).or_default().insert(call, cfg);
    self
  }
}

/// Wraps a registry so that calls made on behalf of a node are delayed or lost, as configured for
/// that node and call. Registration always goes through.
pub struct UnreliableRegistry {
  inner: Arc<dyn RegistryRpc>,
  fail_map: RwLock<FailureConfigMap>,
}
impl UnreliableRegistry {
  pub fn new(inner: Arc<dyn RegistryRpc>, fail_map: FailureConfigMap) -> UnreliableRegistry {
    UnreliableRegistry {
      inner: inner,
      fail_map: RwLock::new(fail_map),
    }
  }

  pub fn set_failures(&self, fail_map: FailureConfigMap) {
    *self.fail_map.write() = fail_map;
  }

  async fn disturb(&self, node: NodeId, call: RegistryCall) -> ClusterResult<()> {
    let fail_cfg = *self.fail_map.read().get(node, call);
    let dur = fail_cfg.delay.map(|(min, max)| {
      let range = min.as_millis()..=max.as_millis();
      Duration::from_millis(SmallRng::from_entropy().gen_range(range) as u64)
    });
    if let Some(dur) = dur {
      sleep(dur).await;
    }
    if rand::random::<f64>() < fail_cfg.drop_prob {
      Err(ClusterError::Unreachable(format!("{:?} call for node {} dropped", call, node)))
    } else {
      Ok(())
    }
  }
}
#[async_trait]
impl RegistryRpc for UnreliableRegistry {
  async fn register_node(
    &self,
    host: Host,
    client: Arc<dyn StatusRpc>,
  ) -> ClusterResult<Registration> {
    self.inner.register_node(host, client).await
  }

  async fn renew_node(&self, node: NodeId) -> ClusterResult<bool> {
    self.disturb(node, RegistryCall::Renew).await?;
    self.inner.renew_node(node).await
  }

  async fn recovered_node(&self, failed: NodeId, backup: NodeId) -> ClusterResult<()> {
    self.disturb(backup, RegistryCall::Recovered).await?;
    self.inner.recovered_node(failed, backup).await
  }

  async fn set_node_health(
    &self,
    node: NodeId,
    health: Health,
    component: &str,
  ) -> ClusterResult<()> {
    self.disturb(node, RegistryCall::Health).await?;
    self.inner.set_node_health(node, health, component).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::time::Instant;

  #[derive(Default)]
  struct CountingRegistry {
    calls: AtomicUsize,
  }
  #[async_trait]
  impl RegistryRpc for CountingRegistry {
    async fn register_node(&self, _: Host, _: Arc<dyn StatusRpc>) -> ClusterResult<Registration> {
      Err(ClusterError::IllegalState("unused"))
    }

    async fn renew_node(&self, _: NodeId) -> ClusterResult<bool> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(true)
    }

    async fn recovered_node(&self, _: NodeId, _: NodeId) -> ClusterResult<()> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }

    async fn set_node_health(&self, _: NodeId, _: Health, _: &str) -> ClusterResult<()> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(())
    }
  }

  #[test]
  fn most_specific_setting_wins() {
    let slow = FailureConfig {
      drop_prob: 0.0,
      delay: Some((Duration::from_millis(5), Duration::from_millis(5))),
    };
    let map = FailureConfigMap::default()
      .with_node(NodeId(1), slow)
      .with_call(NodeId(1), RegistryCall::Health, FailureConfig::dropped());
    assert_eq!(map.get(NodeId(1), RegistryCall::Health).drop_prob, 1.0);
    assert!(map.get(NodeId(1), RegistryCall::Renew).delay.is_some());
    assert!(map.get(NodeId(2), RegistryCall::Health).delay.is_none());
    assert_eq!(map.get(NodeId(2), RegistryCall::Health).drop_prob, 0.0);
  }

  #[tokio::test(start_paused = true)]
  async fn calls_are_disturbed_per_node_and_kind() {
    let inner = Arc::new(CountingRegistry::default());
    let registry = UnreliableRegistry::new(
      inner.clone(),
      FailureConfigMap::default()
        .with_call(NodeId(1), RegistryCall::Health, FailureConfig::dropped())
        .with_call(
          NodeId(1),
          RegistryCall::Renew,
          FailureConfig {
            drop_prob: 0.0,
            delay: Some((Duration::from_millis(200), Duration::from_millis(200))),
          },
        ),
    );
    let res = registry.set_node_health(NodeId(1), Health::Red, "disk").await;
    assert!(matches!(res, Err(ClusterError::Unreachable(_))));
    assert_eq!(inner.calls.load(Ordering::SeqCst), 0);

    let start = Instant::now();
    assert_eq!(registry.renew_node(NodeId(1)).await, Ok(true));
    assert!(start.elapsed() >= Duration::from_millis(200));
    registry.recovered_node(NodeId(2), NodeId(1)).await.unwrap();
    registry.set_node_health(NodeId(2), Health::Red, "disk").await.unwrap();
    assert_eq!(inner.calls.load(Ordering::SeqCst), 3);

    registry.set_failures(FailureConfigMap::default());
    registry.set_node_health(NodeId(1), Health::Green, "disk").await.unwrap();
    assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
  }
}
