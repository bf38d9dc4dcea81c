use crate::core::{Identity, Node, NodeId, Scheduler};
use crate::watchdog::{Liveness, RecoveryListener, RegistryRpc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

struct Pending {
  epoch: u64,
  backup: NodeId,
  outstanding: HashSet<usize>,
}

struct RecoveryState {
  listeners: Vec<Arc<dyn RecoveryListener>>,
  pending: HashMap<NodeId, Pending>,
  next_epoch: u64,
}

struct RecoveryShared {
  registry: Arc<dyn RegistryRpc>,
  scheduler: Arc<dyn Scheduler>,
  owner: Identity,
  liveness: Liveness,
  timeout: Option<Duration>,
  state: Mutex<RecoveryState>,
}
impl RecoveryShared {
  fn retire(&self, failed: NodeId, epoch: u64, seq: usize) {
    let backup = {
      let mut state = self.state.lock();
      let emptied = match state.pending.get_mut(&failed) {
        Some(p) if p.epoch == epoch => {
          p.outstanding.remove(&seq);
          trace!(node = %failed, remaining = p.outstanding.len(), "recovery token retired");
          p.outstanding.is_empty()
        }
        _ => false,
      };
      if emptied {
        state.pending.remove(&failed).map(|p| p.backup)
      } else {
        None
      }
    };
    if let Some(backup) = backup {
      self.send_recovered(failed, backup);
    }
  }

  fn expire(&self, failed: NodeId, epoch: u64) {
    let backup = {
      let mut state = self.state.lock();
      match state.pending.get(&failed) {
        Some(p) if p.epoch == epoch => {
          warn!(
            node = %failed,
            outstanding = p.outstanding.len(),
            "recovery timed out, abandoning outstanding listeners"
          );
          state.pending.remove(&failed).map(|p| p.backup)
        }
        _ => None,
      }
    };
    if let Some(backup) = backup {
      self.send_recovered(failed, backup);
    }
  }

  fn send_recovered(&self, failed: NodeId, backup: NodeId) {
    info!(node = %failed, backup = %backup, "recovery complete");
    let registry = self.registry.clone();
    self.scheduler.schedule_once(
      Box::pin(async move {
        if let Err(e) = registry.recovered_node(failed, backup).await {
          warn!(node = %failed, "could not report recovery to the registry: {}", e);
        }
      }),
      &self.owner,
      Duration::ZERO,
    );
  }
}

/// One recovery listener's obligation to finish recovering a failed node. Retire it with
/// [`done`](RecoveryToken::done); extra calls, including calls on clones, are ignored.
#[derive(Clone)]
pub struct RecoveryToken {
  node: NodeId,
  epoch: u64,
  seq: usize,
  retired: Arc<AtomicBool>,
  shared: Weak<RecoveryShared>,
}
impl RecoveryToken {
  pub fn node(&self) -> NodeId {
    self.node
  }

  pub fn is_done(&self) -> bool {
    self.retired.load(Ordering::SeqCst)
  }

  pub fn done(&self) {
    if self.retired.swap(true, Ordering::SeqCst) {
      debug!(node = %self.node, "recovery token already retired");
      return;
    }
    if let Some(shared) = self.shared.upgrade() {
      shared.retire(self.node, self.epoch, self.seq);
    }
  }
}
impl fmt::Debug for RecoveryToken {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RecoveryToken")
      .field("node", &self.node)
      .field("seq", &self.seq)
      .field("done", &self.is_done())
      .finish()
  }
}

/// Drives recovery of the nodes this node backs up. Each recovery hands every registered
/// [`RecoveryListener`] its own token; the registry is told the failed node is recovered once, when
/// the last token retires.
#[derive(Clone)]
pub struct RecoveryCoordinator {
  shared: Arc<RecoveryShared>,
}
impl RecoveryCoordinator {
  pub fn new(
    registry: Arc<dyn RegistryRpc>,
    scheduler: Arc<dyn Scheduler>,
    liveness: Liveness,
    timeout: Option<Duration>,
  ) -> RecoveryCoordinator {
    RecoveryCoordinator {
      shared: Arc::new(RecoveryShared {
        registry: registry,
        scheduler: scheduler,
        owner: Identity::new("recovery-coordinator"),
        liveness: liveness,
        timeout: timeout,
        state: Mutex::new(RecoveryState {
          listeners: Vec::new(),
          pending: HashMap::new(),
          next_epoch: 0,
        }),
      }),
    }
  }

  /// Only recoveries started afterwards see the new listener.
  pub fn add_listener(&self, listener: Arc<dyn RecoveryListener>) {
    self.shared.state.lock().listeners.push(listener);
  }

  pub fn is_recovering(&self, node: NodeId) -> bool {
    self.shared.state.lock().pending.contains_key(&node)
  }

  pub fn pending(&self) -> Vec<NodeId> {
    let mut ids = self.shared.state.lock().pending.keys().copied().collect::<Vec<_>>();
    ids.sort();
    ids
  }

  /// Starts recovering `failed` on behalf of `backup`, the local node. Returns `false` if a
  /// recovery of that node is already in progress.
  pub fn start(&self, failed: Node, backup: NodeId) -> bool {
    let shared = &self.shared;
    let (epoch, listeners) = {
      let mut state = shared.state.lock();
      if state.pending.contains_key(&failed.id) {
        debug!(node = %failed.id, "recovery already in progress");
        return false;
      }
      let epoch = state.next_epoch;
      state.next_epoch += 1;
      let listeners = state.listeners.clone();
      if !listeners.is_empty() {
        state.pending.insert(
          failed.id,
          Pending {
            epoch: epoch,
            backup: backup,
            outstanding: (0..listeners.len()).collect(),
          },
        );
      }
      (epoch, listeners)
    };
    info!(node = %failed.id, listeners = listeners.len(), "starting recovery");
    if listeners.is_empty() {
      shared.send_recovered(failed.id, backup);
      return true;
    }
    if let Some(timeout) = shared.timeout {
      let weak = Arc::downgrade(shared);
      let id = failed.id;
      shared.scheduler.schedule_once(
        Box::pin(async move {
          if let Some(shared) = weak.upgrade() {
            shared.expire(id, epoch);
          }
        }),
        &shared.owner,
        timeout,
      );
    }
    for (seq, listener) in listeners.into_iter().enumerate() {
      let token = RecoveryToken {
        node: failed.id,
        epoch: epoch,
        seq: seq,
        retired: Arc::new(AtomicBool::new(false)),
        shared: Arc::downgrade(shared),
      };
      let node = failed.clone();
      let liveness = shared.liveness.clone();
      shared.scheduler.schedule_once(
        Box::pin(async move {
          if !liveness.is_alive() {
            debug!(node = %node.id, "local node not alive, skipping recovery listener");
            return;
          }
          listener.recover(node, token).await;
        }),
        &shared.owner,
        Duration::ZERO,
      );
    }
    true
  }

  /// Forgets every recovery in progress. Tokens retired afterwards do nothing.
  pub fn shutdown(&self) {
    self.shared.state.lock().pending.clear();
  }
}
