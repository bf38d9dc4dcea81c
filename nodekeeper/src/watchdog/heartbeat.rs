use crate::core::{ClusterError, NodeId};
use crate::watchdog::{Registration, RegistryRpc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, trace, warn};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LivenessState {
  Registering,
  Alive,
  Failed,
  ShuttingDown,
}

/// The local node's view of its own liveness, shared between the heartbeat loop, the recovery
/// coordinator and the watchdog. Once failed, always failed.
#[derive(Clone)]
pub struct Liveness {
  state: Arc<Mutex<LivenessState>>,
}
impl Liveness {
  pub fn new() -> Liveness {
    Liveness {
      state: Arc::new(Mutex::new(LivenessState::Registering)),
    }
  }

  pub fn state(&self) -> LivenessState {
    *self.state.lock()
  }

  pub fn is_alive(&self) -> bool {
    self.state() == LivenessState::Alive
  }

  pub fn is_shutting_down(&self) -> bool {
    self.state() == LivenessState::ShuttingDown
  }

  /// Returns `false` if the node already failed or is shutting down.
  pub fn set_alive(&self) -> bool {
    let mut state = self.state.lock();
    match *state {
      LivenessState::Registering | LivenessState::Alive => {
        *state = LivenessState::Alive;
        true
      }
      _ => false,
    }
  }

  /// Returns `true` only for the call that performed the transition, so whoever gets `true` is
  /// the one to notify.
  pub fn set_failed(&self) -> bool {
    let mut state = self.state.lock();
    match *state {
      LivenessState::Registering | LivenessState::Alive => {
        *state = LivenessState::Failed;
        true
      }
      _ => false,
    }
  }

  /// Returns `false` if shutdown had already begun.
  pub fn begin_shutdown(&self) -> bool {
    let mut state = self.state.lock();
    if *state == LivenessState::ShuttingDown {
      false
    } else {
      *state = LivenessState::ShuttingDown;
      true
    }
  }
}
impl Default for Liveness {
  fn default() -> Self {
    Liveness::new()
  }
}

/// Invoked by the heartbeat loop when it decides the local node is dead. The argument is a short
/// reason for the logs.
pub type OnFailure = Arc<dyn Fn(&'static str) + Send + Sync>;

/// Keeps the local node's registration alive. Renewal happens every half interval. While the
/// registry is unreachable, the retry delay halves after every attempt, down to a floor. The node
/// fails itself when the registry no longer knows it, or when a full interval passes without a
/// successful renewal. A call that hangs past that point counts as failed.
pub struct HeartbeatClient {
  node: NodeId,
  stop: watch::Sender<bool>,
  join: Mutex<Option<JoinHandle<()>>>,
}
impl HeartbeatClient {
  pub fn start(
    registry: Arc<dyn RegistryRpc>,
    registration: Registration,
    liveness: Liveness,
    min_retry_delay: Duration,
    on_failure: OnFailure,
  ) -> HeartbeatClient {
    let (tx, rx) = watch::channel(false);
    let join = tokio::spawn(renew_loop(
      registry,
      registration,
      liveness,
      min_retry_delay,
      on_failure,
      rx,
    ));
    HeartbeatClient {
      node: registration.node_id,
      stop: tx,
      join: Mutex::new(Some(join)),
    }
  }

  pub fn node(&self) -> NodeId {
    self.node
  }

  /// Stops the loop and waits for it to exit. No final renewal is sent.
  pub async fn shutdown(&self) {
    self.stop.send_replace(true);
    let join = self.join.lock().take();
    if let Some(join) = join {
      if let Err(e) = join.await {
        debug!(node = %self.node, "heartbeat loop ended abnormally: {}", e);
      }
    }
  }
}

async fn renew_loop(
  registry: Arc<dyn RegistryRpc>,
  registration: Registration,
  liveness: Liveness,
  min_retry_delay: Duration,
  on_failure: OnFailure,
  mut stop: watch::Receiver<bool>,
) {
  let node = registration.node_id;
  let interval = registration.renew_interval;
  let mut delay = interval / 2;
  let mut last_renewal = Instant::now();
  loop {
    tokio::select! {
      _ = sleep(delay) => {}
      _ = stop.changed() => break,
    }
    if *stop.borrow() || !liveness.is_alive() {
      break;
    }
    let budget = interval.saturating_sub(last_renewal.elapsed());
    let res = tokio::select! {
      res = timeout(budget, registry.renew_node(node)) => res
        .unwrap_or_else(|_| Err(ClusterError::Unreachable("renewal timed out".to_string()))),
      _ = stop.changed() => break,
    };
    let last_error = match res {
      Ok(true) => {
        trace!(node = %node, "renewed");
        last_renewal = Instant::now();
        delay = interval / 2;
        None
      }
      Ok(false) => {
        warn!(node = %node, "registry no longer knows this node");
        if liveness.set_failed() {
          on_failure("registration lost");
        }
        break;
      }
      Err(e) => {
        delay = (delay / 2).max(min_retry_delay);
        debug!(node = %node, ?delay, "renewal failed: {}", e);
        Some(e)
      }
    };
    if last_renewal.elapsed() >= interval {
      warn!(node = %node, "no renewal within {:?}, last error: {:?}", interval, last_error);
      if liveness.set_failed() {
        on_failure("renewal overdue");
      }
      break;
    }
  }
  trace!(node = %node, "heartbeat loop exiting");
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::core::{ClusterResult, Health, Host};
  use crate::watchdog::StatusRpc;
  use async_trait::async_trait;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

  struct CountingRegistry {
    renewals: AtomicUsize,
    reachable: AtomicBool,
    known: AtomicBool,
    hang: AtomicBool,
  }
  impl CountingRegistry {
    fn new() -> Arc<CountingRegistry> {
      Arc::new(CountingRegistry {
        renewals: AtomicUsize::new(0),
        reachable: AtomicBool::new(true),
        known: AtomicBool::new(true),
        hang: AtomicBool::new(false),
      })
    }
  }
  #[async_trait]
  impl RegistryRpc for CountingRegistry {
    async fn register_node(
      &self,
      _: Host,
      _: Arc<dyn StatusRpc>,
    ) -> ClusterResult<Registration> {
      Err(ClusterError::IllegalState("unused"))
    }

    async fn renew_node(&self, _: NodeId) -> ClusterResult<bool> {
      self.renewals.fetch_add(1, Ordering::SeqCst);
      if self.hang.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
      }
      if !self.reachable.load(Ordering::SeqCst) {
        return Err(ClusterError::Unreachable("down".to_string()));
      }
      Ok(self.known.load(Ordering::SeqCst))
    }

    async fn recovered_node(&self, _: NodeId, _: NodeId) -> ClusterResult<()> {
      Ok(())
    }

    async fn set_node_health(&self, _: NodeId, _: Health, _: &str) -> ClusterResult<()> {
      Ok(())
    }
  }

  fn client(
    registry: Arc<CountingRegistry>,
    liveness: Liveness,
    failures: Arc<AtomicUsize>,
  ) -> HeartbeatClient {
    liveness.set_alive();
    HeartbeatClient::start(
      registry,
      Registration {
        node_id: NodeId(1),
        renew_interval: Duration::from_millis(1000),
      },
      liveness,
      Duration::from_millis(25),
      Arc::new(move |_| {
        failures.fetch_add(1, Ordering::SeqCst);
      }),
    )
  }

  #[tokio::test(start_paused = true)]
  async fn renews_every_half_interval() {
    let registry = CountingRegistry::new();
    let liveness = Liveness::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let hb = client(registry.clone(), liveness.clone(), failures.clone());
    sleep(Duration::from_millis(2100)).await;
    assert_eq!(registry.renewals.load(Ordering::SeqCst), 4);
    hb.shutdown().await;
    sleep(Duration::from_millis(2000)).await;
    assert_eq!(registry.renewals.load(Ordering::SeqCst), 4);
    assert!(liveness.is_alive());
    assert_eq!(failures.load(Ordering::SeqCst), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn unknown_node_fails_once() {
    let registry = CountingRegistry::new();
    registry.known.store(false, Ordering::SeqCst);
    let liveness = Liveness::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let hb = client(registry.clone(), liveness.clone(), failures.clone());
    sleep(Duration::from_millis(3000)).await;
    assert!(!liveness.is_alive());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(registry.renewals.load(Ordering::SeqCst), 1);
    hb.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn unreachable_registry_backs_off_then_fails() {
    let registry = CountingRegistry::new();
    registry.reachable.store(false, Ordering::SeqCst);
    let liveness = Liveness::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let hb = client(registry.clone(), liveness.clone(), failures.clone());
    sleep(Duration::from_millis(900)).await;
    // 500, 750, 875 have been tried; still within the interval
    assert!(liveness.is_alive());
    assert_eq!(registry.renewals.load(Ordering::SeqCst), 3);
    sleep(Duration::from_millis(1000)).await;
    assert!(!liveness.is_alive());
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    hb.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn hanging_registry_fails_within_an_interval() {
    let registry = CountingRegistry::new();
    let liveness = Liveness::new();
    let failures = Arc::new(AtomicUsize::new(0));
    let hb = client(registry.clone(), liveness.clone(), failures.clone());
    sleep(Duration::from_millis(600)).await;
    registry.hang.store(true, Ordering::SeqCst);
    // the call at 1000 never answers and is given up at 1500
    sleep(Duration::from_millis(850)).await;
    assert!(liveness.is_alive());
    sleep(Duration::from_millis(100)).await;
    assert!(!liveness.is_alive());
    sleep(Duration::from_millis(30_000)).await;
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(registry.renewals.load(Ordering::SeqCst), 2);
    hb.shutdown().await;
  }

  #[test]
  fn liveness_is_monotonic() {
    let l = Liveness::new();
    assert!(!l.is_alive());
    assert!(l.set_alive());
    assert!(l.set_failed());
    assert!(!l.set_failed());
    assert!(!l.set_alive());
    assert!(l.begin_shutdown());
    assert!(!l.begin_shutdown());
    assert!(l.is_shutting_down());
  }
}
