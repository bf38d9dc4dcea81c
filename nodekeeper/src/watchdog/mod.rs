//! Tracks which nodes are alive, and recovers the ones that are not.
//!
//! A single [`NodeRegistry`] is the authority on cluster membership. Every node runs a
//! [`LocalWatchdog`], which registers with the registry and is handed an id and a renew interval.
//! The registry never asks nodes whether they are alive; nodes prove it by renewing.
//!
//! ### Renewal
//! The [`HeartbeatClient`] renews every half interval. If the registry cannot be reached, it tries
//! again sooner and sooner, halving the delay every time down to
//! [`min_retry_delay_ms`](WatchdogConfig::min_retry_delay_ms). A node that goes a full interval
//! without a successful renewal, or that the registry no longer recognizes, considers itself
//! failed. The registry runs a sweep of its own and declares failed every node that missed its
//! renewal. Neither side ever brings a failed node back: a restarted process registers again and
//! gets a new id.
//!
//! ### Backups
//! Every node has a backup, another live node picked by the registry. When a node fails the
//! registry keeps its entry, and every live node is sent a [`StatusBatch`] saying so. The backup
//! reacts by running recovery. If the backup dies before recovery finishes, the registry picks a
//! new one and sends the news again.
//!
//! ### Recovery
//! The [`RecoveryCoordinator`] on the backup hands a [`RecoveryToken`] to each registered
//! [`RecoveryListener`]. Listeners may finish in any order, and calling
//! [`done`](RecoveryToken::done) twice is harmless. When the last token is retired, the registry is
//! told exactly once, and it forgets the failed node. By default recovery waits for listeners as
//! long as it takes; set [`recovery_timeout_ms`](WatchdogConfig::recovery_timeout_ms) to abandon
//! stuck recoveries instead.
//!
//! ### Listeners
//! [`NodeListener`]s are told about every change the watchdog learns of, always from a task handed
//! to the [`Scheduler`](crate::core::Scheduler) rather than from inside the push that delivered
//! it. Listeners stop hearing about other nodes once the local node is dead. The local node is
//! never announced alive, but listeners do hear about its failure.

mod client;
mod heartbeat;
mod protocol;
mod recovery;
mod registry;
mod utils;

#[rustfmt::skip]
pub use {
  client::LocalWatchdog,
  heartbeat::HeartbeatClient,
  heartbeat::Liveness,
  heartbeat::LivenessState,
  heartbeat::OnFailure,
  protocol::NodeListener,
  protocol::RecoveryListener,
  protocol::Registration,
  protocol::RegistryRpc,
  protocol::StatusBatch,
  protocol::StatusRpc,
  recovery::RecoveryCoordinator,
  recovery::RecoveryToken,
  registry::NodeRegistry,
  utils::RegistryConfig,
  utils::WatchdogConfig,
};
