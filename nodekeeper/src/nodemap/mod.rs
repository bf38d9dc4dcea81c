//! Decides which node each identity lives on, and moves identities around to keep the cluster
//! balanced.
//!
//! The [`NodeMapServer`] owns the identity mapping, stored through a [`MappingStore`]. Which node
//! gets an identity is up to a [`NodeAssignPolicy`]; the policy only recommends, and never writes
//! the mapping itself. [`RoundRobinPolicy`] is the simplest useful one.
//!
//! ### Affinity groups
//! Identities that talk to each other should live on the same node. A pluggable [`GroupFinder`]
//! periodically reports which identities belong together as [`AffinityGroup`]s. Each group targets
//! the node already holding most of its weight; members elsewhere are stragglers. Every discovery
//! pass replaces the previous set of groups entirely, groups from different passes are never
//! mixed.
//!
//! ### Moving identities
//! The [`PlacementCoordinator`] moves identities in two ways. A collocation sweep follows every
//! discovery pass and moves the stragglers of one group at a time onto the group's target, pausing
//! between groups. Offloading drains a single node, usually because it is failing or overloaded;
//! the [`PlacementListener`] triggers it from registry events. A group is taken out of the shared
//! set before it is moved, so no group is ever moved twice in one generation.

mod coordinator;
mod group;
mod policy;
mod server;
mod store;

#[rustfmt::skip]
pub use {
  coordinator::CoordinatorState,
  coordinator::PlacementBackend,
  coordinator::PlacementConfig,
  coordinator::PlacementCoordinator,
  group::AffinityGroup,
  group::DefaultGroupFactory,
  group::GroupCollector,
  group::GroupFactory,
  group::GroupFinder,
  group::Member,
  policy::NodeAssignPolicy,
  policy::RoundRobinPolicy,
  server::NodeMapServer,
  server::PlacementListener,
  store::MappingStore,
};
