use crate::core::{Identity, RecurringHandle, RecurringTask, Scheduler, Task};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

enum Job {
  Once(Task),
  Recurring {
    task: RecurringTask,
    period: Duration,
    handle: RecurringHandle,
  },
}

#[derive(Default)]
struct ManualState {
  queue: BTreeMap<(Instant, u64), (Identity, Job)>,
  seq: u64,
}
impl ManualState {
  fn push(&mut self, due: Instant, owner: Identity, job: Job) {
    self.seq += 1;
    self.queue.insert((due, self.seq), (owner, job));
  }
}

/// A [`Scheduler`] that runs nothing until told to. Tasks run one at a time, in due order, on the
/// task calling [`advance`](ManualScheduler::advance) or
/// [`run_pending`](ManualScheduler::run_pending).
///
/// Time is tokio's, so tests must run with a paused clock (`#[tokio::test(start_paused = true)]`).
/// Advancing moves the tokio clock along with it.
#[derive(Clone, Default)]
pub struct ManualScheduler {
  state: Arc<Mutex<ManualState>>,
}
impl ManualScheduler {
  pub fn new() -> ManualScheduler {
    ManualScheduler::default()
  }

  /// The number of tasks waiting, due or not.
  pub fn pending(&self) -> usize {
    self.state.lock().queue.len()
  }

  /// The owners of every waiting task, in due order.
  pub fn owners(&self) -> Vec<Identity> {
    self.state.lock().queue.values().map(|(o, _)| o.clone()).collect()
  }

  fn pop_due(&self, by: Instant) -> Option<(Instant, Identity, Job)> {
    let mut state = self.state.lock();
    let key = *state.queue.keys().next()?;
    if key.0 > by {
      return None;
    }
    state.queue.remove(&key).map(|(owner, job)| (key.0, owner, job))
  }

  async fn run(&self, due: Instant, owner: Identity, job: Job) {
    match job {
      Job::Once(task) => task.await,
      Job::Recurring {
        task,
        period,
        handle,
      } => {
        if handle.is_cancelled() {
          return;
        }
        task().await;
        if !handle.is_cancelled() {
          self.state.lock().push(
            due + period,
            owner,
            Job::Recurring {
              task: task,
              period: period,
              handle: handle,
            },
          );
        }
      }
    }
  }

  /// Runs every task that is due, including tasks they schedule without delay. Returns how many
  /// ran.
  pub async fn run_pending(&self) -> usize {
    let mut ran = 0;
    while let Some((due, owner, job)) = self.pop_due(Instant::now()) {
      self.run(due, owner, job).await;
      ran += 1;
    }
    ran
  }

  /// Moves the clock forward by `by`, running each task as its due time is reached.
  pub async fn advance(&self, by: Duration) -> usize {
    let target = Instant::now() + by;
    let mut ran = 0;
    while let Some((due, owner, job)) = self.pop_due(target) {
      let now = Instant::now();
      if due > now {
        tokio::time::advance(due - now).await;
      }
      self.run(due, owner, job).await;
      ran += 1;
    }
    let now = Instant::now();
    if target > now {
      tokio::time::advance(target - now).await;
    }
    ran + self.run_pending().await
  }
}
impl Scheduler for ManualScheduler {
  fn schedule_once(&self, task: Task, owner: &Identity, delay: Duration) {
    self
      .state
      .lock()
      .push(Instant::now() + delay, owner.clone(), Job::Once(task));
  }

  fn schedule_recurring(
    &self,
    task: RecurringTask,
    owner: &Identity,
    first: Duration,
    period: Duration,
  ) -> RecurringHandle {
    let handle = RecurringHandle::new();
    self.state.lock().push(
      Instant::now() + first,
      owner.clone(),
      Job::Recurring {
        task: task,
        period: period,
        handle: handle.clone(),
      },
    );
    handle
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test(start_paused = true)]
  async fn runs_in_due_order() {
    let sched = ManualScheduler::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    for (i, ms) in [(1, 300u64), (2, 100), (3, 200)] {
      let order = order.clone();
      sched.schedule_once(
        Box::pin(async move { order.lock().push(i) }),
        &Identity::new("t"),
        Duration::from_millis(ms),
      );
    }
    assert_eq!(sched.run_pending().await, 0);
    assert_eq!(sched.advance(Duration::from_millis(250)).await, 2);
    assert_eq!(*order.lock(), vec![2, 3]);
    assert_eq!(sched.pending(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn recurring_stops_when_cancelled() {
    let sched = ManualScheduler::new();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handle = sched.schedule_recurring(
      Arc::new(move || {
        let c = c.clone();
        Box::pin(async move {
          c.fetch_add(1, Ordering::SeqCst);
        })
      }),
      &Identity::new("t"),
      Duration::from_secs(1),
      Duration::from_secs(1),
    );
    sched.advance(Duration::from_millis(3500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    handle.cancel();
    sched.advance(Duration::from_secs(5)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert_eq!(sched.pending(), 0);
  }
}
