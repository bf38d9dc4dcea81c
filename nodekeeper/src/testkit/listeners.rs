use crate::core::Node;
use crate::watchdog::{NodeListener, RecoveryListener, RecoveryToken};
use async_trait::async_trait;
use crossbeam::channel::{unbounded, Receiver, Sender};

/// Forwards every change it hears about to a channel.
pub struct RecordingNodeListener {
  tx: Sender<Node>,
}
impl RecordingNodeListener {
  pub fn new() -> (RecordingNodeListener, Receiver<Node>) {
    let (tx, rx) = unbounded();
    (RecordingNodeListener { tx: tx }, rx)
  }
}
#[async_trait]
impl NodeListener for RecordingNodeListener {
  async fn node_health_change(&self, node: Node) {
    let _ = self.tx.send(node);
  }
}

/// Forwards every recovery request to a channel. With `auto_done`, the token is retired on the
/// spot; otherwise the receiver of the channel is responsible for it.
pub struct RecordingRecoveryListener {
  tx: Sender<(Node, RecoveryToken)>,
  auto_done: bool,
}
impl RecordingRecoveryListener {
  pub fn new(auto_done: bool) -> (RecordingRecoveryListener, Receiver<(Node, RecoveryToken)>) {
    let (tx, rx) = unbounded();
    (
      RecordingRecoveryListener {
        tx: tx,
        auto_done: auto_done,
      },
      rx,
    )
  }
}
#[async_trait]
impl RecoveryListener for RecordingRecoveryListener {
  async fn recover(&self, node: Node, token: RecoveryToken) {
    if self.auto_done {
      token.done();
    }
    let _ = self.tx.send((node, token));
  }
}
