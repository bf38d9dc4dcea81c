//! The vocabulary shared by every other module: nodes, identities, the scheduler contract and the
//! error taxonomy.
//!
//! ### Nodes
//! A [`Node`] is a machine in the cluster. Its [`NodeId`] is handed out by the
//! [`NodeRegistry`](crate::watchdog::NodeRegistry) at registration and never reused. A node's
//! [`Health`] is richer than a boolean: [`Green`](Health::Green), [`Yellow`](Health::Yellow) and
//! [`Red`](Health::Red) nodes are alive, a [`Failed`](Health::Failed) node is gone for good.
//!
//! ### Identities
//! An [`Identity`] is an opaque principal that owns work. At any instant it is mapped to exactly
//! one node. Moving it is the business of the [`nodemap`](crate::nodemap) module.
//!
//! ### Scheduling
//! Nothing in this crate invokes a listener or a remote call from inside the callback that noticed
//! the need for it. Work is handed to a [`Scheduler`] as a boxed future, either once after a delay
//! or on a fixed period. [`TokioScheduler`] runs those futures on a tokio runtime;
//! [`ManualScheduler`](crate::testkit::ManualScheduler) runs them on a virtual clock for tests.

mod error;
mod identity;
mod node;
mod scheduler;

#[rustfmt::skip]
pub use {
  error::ClusterError,
  error::ClusterResult,
  identity::Identity,
  node::Health,
  node::Host,
  node::Node,
  node::NodeId,
  scheduler::RecurringHandle,
  scheduler::RecurringTask,
  scheduler::Scheduler,
  scheduler::Task,
  scheduler::TokioScheduler,
};
