pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use thiserror::Error;
use tokio::{sync::mpsc, time::Instant};

/// Well-known subjects on the cluster bus
pub mod subject {
  pub const NODE_STATUS: &str = "hive.node.status";
  pub const NODE_VMS: &str = "hive.node.vms";

  pub const EC2_ALL: &str = "ec2.>";

  pub const SHUTDOWN_PROGRESS: &str = "hive.cluster.shutdown.progress";

  pub const VPC_CREATE: &str = "vpc.create";
  pub const VPC_DELETE: &str = "vpc.delete";
  pub const VPC_CREATE_SUBNET: &str = "vpc.create-subnet";
  pub const VPC_DELETE_SUBNET: &str = "vpc.delete-subnet";
  pub const VPC_CREATE_PORT: &str = "vpc.create-port";
  pub const VPC_DELETE_PORT: &str = "vpc.delete-port";

  /// Request/reply subject for one EC2 API action
  pub fn ec2(action: &str) -> String {
    format!("ec2.{action}")
  }

  /// Fan-out subject for one shutdown phase
  pub fn shutdown_phase(phase: &str) -> String {
    format!("hive.cluster.shutdown.{phase}")
  }
}

#[derive(Debug, Error)]
pub enum BusError {
  #[error("bus request timed out after {0:?}")]
  Timeout(Duration),

  #[error("bus connection closed")]
  Closed,

  #[error("bus backend error: {0}")]
  Backend(String),
}

/// A message delivered to a subscriber
#[derive(Clone, Debug)]
pub struct BusMessage {
  pub subject: String,
  pub reply: Option<String>,
  pub payload: Vec<u8>,
}

pub struct Subscription {
  rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
  pub(crate) fn new(rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
    Self { rx }
  }

  /// Next message, or `None` once the bus side is gone
  pub async fn next(&mut self) -> Option<BusMessage> {
    self.rx.recv().await
  }
}

/// The pub-sub substrate every inter-node channel runs over
///
/// Ordering is per-publisher per-subject only; there is no total order
/// across the cluster and delivery of plain publishes is best-effort.
#[async_trait]
pub trait Bus: Send + Sync {
  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError>;

  async fn publish_with_reply(
    &self,
    subject: &str,
    reply: &str,
    payload: Vec<u8>,
  ) -> Result<(), BusError>;

  /// Subscribe to a subject; `*` matches one token, `>` the remaining tail
  async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError>;

  async fn flush(&self) -> Result<(), BusError>;
}

/// A fresh reply inbox subject
pub fn new_inbox() -> String {
  format!("_INBOX.{:016x}", rand::thread_rng().gen::<u64>())
}

/// Request/reply: exactly one responder is expected within the deadline
pub async fn request(
  bus: &dyn Bus,
  subject: &str,
  payload: Vec<u8>,
  timeout: Duration,
) -> Result<BusMessage, BusError> {
  let inbox = new_inbox();
  let mut sub = bus.subscribe(&inbox).await?;
  bus.publish_with_reply(subject, &inbox, payload).await?;

  match tokio::time::timeout(timeout, sub.next()).await {
    Ok(Some(msg)) => Ok(msg),
    Ok(None) => Err(BusError::Closed),
    Err(_) => Err(BusError::Timeout(timeout)),
  }
}

/// Fan-out collect: publish once, then drain replies until the deadline
///
/// `expected` bounds the collection so callers that know the cluster size
/// stop as soon as every node has answered. Replies arriving after the
/// deadline are discarded with the subscription.
pub async fn request_many(
  bus: &dyn Bus,
  subject: &str,
  payload: Vec<u8>,
  timeout: Duration,
  expected: Option<usize>,
) -> Result<Vec<BusMessage>, BusError> {
  let inbox = new_inbox();
  let mut sub = bus.subscribe(&inbox).await?;
  bus.publish_with_reply(subject, &inbox, payload).await?;

  let deadline = Instant::now() + timeout;
  let mut replies = Vec::new();

  loop {
    if let Some(n) = expected {
      if replies.len() >= n {
        break;
      }
    }

    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
      break;
    }

    match tokio::time::timeout(remaining, sub.next()).await {
      Ok(Some(msg)) => replies.push(msg),
      Ok(None) => break,
      Err(_) => break,
    }
  }

  Ok(replies)
}
