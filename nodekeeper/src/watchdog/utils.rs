use crate::core::ClusterResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::Validate;

/// Configures a [`NodeRegistry`](crate::watchdog::NodeRegistry).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct RegistryConfig {
  /// How often, in milliseconds, every node must renew its registration. Handed to nodes when they
  /// register; nodes cannot configure it themselves. Must be between `25` and `600000`.
  ///
  /// default: `1000`
  #[validate(range(min = 25, max = 600000))]
  pub renew_interval_ms: u64,
  /// How often, in milliseconds, the registry checks for nodes that missed their renewal.
  ///
  /// default: half the renew interval
  #[validate(range(min = 1))]
  pub sweep_interval_ms: Option<u64>,
}
impl RegistryConfig {
  pub fn checked(self) -> ClusterResult<Self> {
    self.validate()?;
    Ok(self)
  }

  pub fn renew_interval(&self) -> Duration {
    Duration::from_millis(self.renew_interval_ms)
  }

  pub fn sweep_interval(&self) -> Duration {
    self
      .sweep_interval_ms
      .map(Duration::from_millis)
      .unwrap_or_else(|| self.renew_interval() / 2)
  }
}
impl Default for RegistryConfig {
  fn default() -> Self {
    RegistryConfig {
      renew_interval_ms: 1000,
      sweep_interval_ms: None,
    }
  }
}

/// Configures the per-node [`LocalWatchdog`](crate::watchdog::LocalWatchdog).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct WatchdogConfig {
  /// The floor, in milliseconds, for the renewal retry delay while the registry is unreachable.
  /// The delay halves after every failed attempt until it reaches this value.
  ///
  /// default: `25`
  #[validate(range(min = 1))]
  pub min_retry_delay_ms: u64,
  /// The number of attempts made to report this node's health to the registry before the node
  /// gives up and fails itself.
  ///
  /// default: `5`
  #[validate(range(min = 1))]
  pub io_retries: u32,
  /// If set, a recovery still waiting on recovery listeners after this many milliseconds is
  /// abandoned and reported complete. Unset means recovery waits for every listener, however long
  /// that takes.
  ///
  /// default: `None`
  #[validate(range(min = 1))]
  pub recovery_timeout_ms: Option<u64>,
}
impl WatchdogConfig {
  pub fn checked(self) -> ClusterResult<Self> {
    self.validate()?;
    Ok(self)
  }

  pub fn min_retry_delay(&self) -> Duration {
    Duration::from_millis(self.min_retry_delay_ms)
  }

  pub fn recovery_timeout(&self) -> Option<Duration> {
    self.recovery_timeout_ms.map(Duration::from_millis)
  }
}
impl Default for WatchdogConfig {
  fn default() -> Self {
    WatchdogConfig {
      min_retry_delay_ms: 25,
      io_retries: 5,
      recovery_timeout_ms: None,
    }
  }
}

#[test]
fn registry_config_bounds() {
  assert!(RegistryConfig::default().checked().is_ok());
  let low = RegistryConfig {
    renew_interval_ms: 10,
    ..Default::default()
  };
  assert!(low.checked().is_err());
  let cfg = RegistryConfig {
    renew_interval_ms: 400,
    sweep_interval_ms: None,
  };
  assert_eq!(cfg.sweep_interval(), Duration::from_millis(200));
}
