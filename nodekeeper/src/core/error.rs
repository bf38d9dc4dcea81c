use crate::core::NodeId;
use thiserror::Error;

/// Every failure this crate reports.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ClusterError {
  /// No live node is eligible to receive work. This is an expected outcome of placement, not an
  /// infrastructure bug; the operation that hit it simply aborts.
  #[error("no nodes available")]
  NoNodesAvailable,
  /// The component was shut down, or is not yet in a state that permits the call.
  #[error("illegal state: {0}")]
  IllegalState(&'static str),
  /// A remote peer sent something the protocol does not allow.
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),
  /// A remote call could not be completed. Retried on the next natural cycle.
  #[error("unreachable: {0}")]
  Unreachable(String),
  #[error("unknown node {0}")]
  UnknownNode(NodeId),
  #[error("invalid configuration: {0}")]
  InvalidConfig(String),
  #[error("affinity group finder failed: {0}")]
  GroupFinder(String),
}
impl ClusterError {
  /// Whether retrying the same call later may succeed.
  pub fn is_transient(&self) -> bool {
    matches!(self, ClusterError::Unreachable(_))
  }
}
impl From<validator::ValidationErrors> for ClusterError {
  fn from(e: validator::ValidationErrors) -> Self {
    ClusterError::InvalidConfig(e.to_string())
  }
}

pub type ClusterResult<T> = Result<T, ClusterError>;

#[test]
fn transient_errors() {
  assert!(ClusterError::Unreachable("down".to_string()).is_transient());
  assert!(!ClusterError::NoNodesAvailable.is_transient());
  assert!(!ClusterError::IllegalState("shut down").is_transient());
}
