use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An opaque principal that owns units of work. Cheap to clone.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Identity(Arc<str>);
impl Identity {
  pub fn new<S: AsRef<str>>(name: S) -> Identity {
    Identity(Arc::from(name.as_ref()))
  }

  pub fn name(&self) -> &str {
    &self.0
  }
}
impl fmt::Display for Identity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
impl From<&str> for Identity {
  fn from(s: &str) -> Self {
    Identity::new(s)
  }
}
