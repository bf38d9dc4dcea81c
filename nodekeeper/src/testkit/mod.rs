//! In-process stand-ins for everything outside this crate, for tests and simulations.

mod finder;
mod listeners;
pub mod logging;
mod scheduler;
mod store;
mod unreliable_registry;

#[rustfmt::skip]
pub use {
  finder::GroupScript,
  finder::ScriptedGroupFinder,
  listeners::RecordingNodeListener,
  listeners::RecordingRecoveryListener,
  logging::LogLevel,
  scheduler::ManualScheduler,
  store::MemoryMappingStore,
  unreliable_registry::FailureConfig,
  unreliable_registry::FailureConfigMap,
  unreliable_registry::RegistryCall,
  unreliable_registry::UnreliableRegistry,
};
