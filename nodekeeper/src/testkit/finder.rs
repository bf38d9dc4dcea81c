use crate::core::{ClusterError, ClusterResult, Identity};
use crate::nodemap::{GroupCollector, GroupFactory, GroupFinder};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub type GroupScript = Vec<(u64, u64, BTreeMap<Identity, u64>)>;

/// A [`GroupFinder`] returning canned answers, one per discovery pass, in the order they were
/// scripted. Each answer is a list of `(group id, generation, member weights)`. Once the script runs
/// out, passes find nothing.
#[derive(Default)]
pub struct ScriptedGroupFinder {
  script: Mutex<VecDeque<ClusterResult<GroupScript>>>,
  enabled: AtomicBool,
  shut_down: AtomicBool,
  passes: AtomicUsize,
}
impl ScriptedGroupFinder {
  pub fn new() -> ScriptedGroupFinder {
    ScriptedGroupFinder::default()
  }

  pub fn script(&self, groups: GroupScript) {
    self.script.lock().push_back(Ok(groups));
  }

  pub fn script_failure(&self, reason: &str) {
    self
      .script
      .lock()
      .push_back(Err(ClusterError::GroupFinder(reason.to_string())));
  }

  pub fn is_enabled(&self) -> bool {
    self.enabled.load(Ordering::SeqCst)
  }

  pub fn is_shut_down(&self) -> bool {
    self.shut_down.load(Ordering::SeqCst)
  }

  pub fn passes(&self) -> usize {
    self.passes.load(Ordering::SeqCst)
  }
}
#[async_trait]
impl GroupFinder for ScriptedGroupFinder {
  async fn find_affinity_groups(
    &self,
    out: &mut GroupCollector,
    factory: &dyn GroupFactory,
  ) -> ClusterResult<Duration> {
    self.passes.fetch_add(1, Ordering::SeqCst);
    let next = self.script.lock().pop_front();
    for (id, generation, weights) in next.unwrap_or_else(|| Ok(Vec::new()))? {
      out.add(factory.new_group(id, generation, weights));
    }
    Ok(Duration::from_millis(1))
  }

  fn enable(&self) {
    self.enabled.store(true, Ordering::SeqCst);
  }

  fn disable(&self) {
    self.enabled.store(false, Ordering::SeqCst);
  }

  fn shutdown(&self) {
    self.enabled.store(false, Ordering::SeqCst);
    self.shut_down.store(true, Ordering::SeqCst);
  }
}
