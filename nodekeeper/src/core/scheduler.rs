use crate::core::Identity;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

/// A unit of background work.
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Produces a fresh [`Task`] for every run of a recurring schedule.
pub type RecurringTask = Arc<dyn Fn() -> Task + Send + Sync>;

/// Runs callbacks at a later time on behalf of an owner. The owner is only used for attribution.
pub trait Scheduler: Send + Sync {
  /// Runs `task` once, `delay` from now.
  fn schedule_once(&self, task: Task, owner: &Identity, delay: Duration);

  /// Runs a task produced by `task` after `first`, then every `period` until the returned handle
  /// is cancelled.
  fn schedule_recurring(
    &self,
    task: RecurringTask,
    owner: &Identity,
    first: Duration,
    period: Duration,
  ) -> RecurringHandle;
}

/// Cancels a recurring schedule. Dropping the handle does not cancel it.
#[derive(Clone, Debug)]
pub struct RecurringHandle {
  cancelled: Arc<AtomicBool>,
  abort: Option<AbortHandle>,
}
impl RecurringHandle {
  /// A handle not backed by a runtime task; the scheduler polls
  /// [`is_cancelled`](RecurringHandle::is_cancelled) before each run.
  pub fn new() -> RecurringHandle {
    RecurringHandle {
      cancelled: Arc::new(AtomicBool::new(false)),
      abort: None,
    }
  }

  fn with_abort(abort: AbortHandle, cancelled: Arc<AtomicBool>) -> RecurringHandle {
    RecurringHandle {
      cancelled: cancelled,
      abort: Some(abort),
    }
  }

  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
    if let Some(abort) = &self.abort {
      abort.abort();
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}
impl Default for RecurringHandle {
  fn default() -> Self {
    RecurringHandle::new()
  }
}

/// A [`Scheduler`] spawning onto a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
  rt: Handle,
}
impl TokioScheduler {
  pub fn new(rt: Handle) -> TokioScheduler {
    TokioScheduler { rt: rt }
  }

  /// Uses the runtime this is called from. Panics outside of a runtime, like
  /// [`Handle::current`].
  pub fn current() -> TokioScheduler {
    TokioScheduler::new(Handle::current())
  }
}
impl Scheduler for TokioScheduler {
  fn schedule_once(&self, task: Task, owner: &Identity, delay: Duration) {
    trace!(owner = %owner, ?delay, "scheduling task");
    if delay.is_zero() {
      self.rt.spawn(task);
    } else {
      self.rt.spawn(async move {
        sleep(delay).await;
        task.await;
      });
    }
  }

  fn schedule_recurring(
    &self,
    task: RecurringTask,
    owner: &Identity,
    first: Duration,
    period: Duration,
  ) -> RecurringHandle {
    trace!(owner = %owner, ?first, ?period, "scheduling recurring task");
    let cancelled = Arc::new(AtomicBool::new(false));
    let flag = cancelled.clone();
    let join = self.rt.spawn(async move {
      let mut ticks = interval_at(Instant::now() + first, period);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        ticks.tick().await;
        if flag.load(Ordering::SeqCst) {
          break;
        }
        task().await;
      }
    });
    RecurringHandle::with_abort(join.abort_handle(), cancelled)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[tokio::test(start_paused = true)]
  async fn recurring_runs_until_cancelled() {
    let sched = TokioScheduler::current();
    let count = Arc::new(AtomicUsize::new(0));
    let c = count.clone();
    let handle = sched.schedule_recurring(
      Arc::new(move || {
        let c = c.clone();
        Box::pin(async move {
          c.fetch_add(1, Ordering::SeqCst);
        })
      }),
      &Identity::new("test"),
      Duration::from_millis(100),
      Duration::from_millis(100),
    );
    sleep(Duration::from_millis(350)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    handle.cancel();
    sleep(Duration::from_millis(500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(handle.is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn once_runs_after_delay() {
    let sched = TokioScheduler::current();
    let (tx, rx) = tokio::sync::oneshot::channel();
    sched.schedule_once(
      Box::pin(async move {
        let _ = tx.send(Instant::now());
      }),
      &Identity::new("test"),
      Duration::from_secs(2),
    );
    let start = Instant::now();
    let ran = rx.await.unwrap();
    assert!(ran - start >= Duration::from_secs(2));
  }
}
