//! Cluster membership for a multi-node application server. Nodes prove they are alive by renewing
//! with a central registry, failed nodes are recovered by a backup, and the identities that own the
//! cluster's work are kept balanced and close to the identities they talk to.
//!
//! See [`watchdog`] for liveness and recovery, and [`nodemap`] for placement.

pub mod core;
pub mod nodemap;
pub mod testkit;
pub mod watchdog;
