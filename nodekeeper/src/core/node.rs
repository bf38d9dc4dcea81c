use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// The identifier the [`NodeRegistry`](crate::watchdog::NodeRegistry) hands out at registration.
/// Identifiers start at 1 and are never reused.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct NodeId(pub u64);
impl fmt::Display for NodeId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// The DNS name or IP address of the machine hosting a [`Node`].
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize)]
pub enum Host {
  DNS(String),
  IP(IpAddr),
}
impl From<String> for Host {
  fn from(s: String) -> Self {
    match IpAddr::from_str(s.as_str()) {
      Ok(ip) => Host::IP(ip),
      Err(_) => Host::DNS(s),
    }
  }
}
impl From<&str> for Host {
  fn from(s: &str) -> Self {
    Host::from(s.to_string())
  }
}
impl fmt::Display for Host {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Host::DNS(s) => write!(f, "{}", s),
      Host::IP(ip) => write!(f, "{}", ip),
    }
  }
}
impl Default for Host {
  fn default() -> Self {
    Host::IP(IpAddr::V4(Ipv4Addr::LOCALHOST))
  }
}

/// How well a node is doing. Ordered from best to worst, so `a < b` means `a` is healthier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub enum Health {
  /// Fully operational.
  Green,
  /// Degraded, but still a reasonable target for new work.
  Yellow,
  /// Alive but overloaded or failing; work should be drained off of it.
  Red,
  /// Declared dead. Terminal.
  Failed,
}
impl Health {
  pub fn is_alive(&self) -> bool {
    *self != Health::Failed
  }

  pub fn worse_than(&self, other: Health) -> bool {
    *self > other
  }
}
impl Default for Health {
  fn default() -> Self {
    Health::Green
  }
}
impl fmt::Display for Health {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Health::Green => "GREEN",
      Health::Yellow => "YELLOW",
      Health::Red => "RED",
      Health::Failed => "FAILED",
    };
    f.write_str(s)
  }
}

/// A member of the cluster, as known at some instant.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Node {
  /// Assigned at registration, never changes.
  pub id: NodeId,
  /// Where the node runs.
  pub host: Host,
  pub health: Health,
  /// The node that recovers this one should it fail. `None` while no other live node exists.
  pub backup: Option<NodeId>,
}
impl Node {
  pub fn new(id: NodeId, host: Host, health: Health, backup: Option<NodeId>) -> Node {
    Node {
      id: id,
      host: host,
      health: health,
      backup: backup,
    }
  }

  pub fn is_alive(&self) -> bool {
    self.health.is_alive()
  }
}
impl fmt::Display for Node {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Node[{}@{}, {}", self.id, self.host, self.health)?;
    match self.backup {
      Some(b) => write!(f, ", backup: {}]", b),
      None => write!(f, "]"),
    }
  }
}

#[test]
fn health_ordering() {
  assert!(Health::Failed.worse_than(Health::Red));
  assert!(Health::Red.worse_than(Health::Yellow));
  assert!(!Health::Green.worse_than(Health::Yellow));
  assert!(Health::Red.is_alive());
  assert!(!Health::Failed.is_alive());
}

#[test]
fn host_parsing() {
  assert_eq!(Host::from("10.0.0.7"), Host::IP("10.0.0.7".parse().unwrap()));
  assert_eq!(Host::from("node-a.local"), Host::DNS("node-a.local".to_string()));
}
