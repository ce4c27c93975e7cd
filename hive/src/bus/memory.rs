use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Bus, BusError, BusMessage, Subscription};

/// In-process reference implementation of the cluster bus
///
/// Every node in a test cluster shares one `MemoryBus`; production nodes
/// talk to the external substrate through the same `Bus` trait.
#[derive(Default)]
pub struct MemoryBus {
  subs: Mutex<Vec<SubEntry>>,
}

struct SubEntry {
  pattern: Vec<String>,
  tx: mpsc::UnboundedSender<BusMessage>,
}

impl MemoryBus {
  pub fn new() -> Self {
    Self::default()
  }

  fn deliver(&self, msg: BusMessage) {
    let mut subs = self.subs.lock().expect("bus subscriber list poisoned");
    subs.retain(|sub| !sub.tx.is_closed());

    for sub in subs.iter() {
      if subject_matches(&sub.pattern, &msg.subject) {
        // Receiver may have just dropped; delivery is best-effort
        let _ = sub.tx.send(msg.clone());
      }
    }
  }
}

#[async_trait]
impl Bus for MemoryBus {
  async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), BusError> {
    self.deliver(BusMessage {
      subject: subject.to_owned(),
      reply: None,
      payload,
    });
    Ok(())
  }

  async fn publish_with_reply(
    &self,
    subject: &str,
    reply: &str,
    payload: Vec<u8>,
  ) -> Result<(), BusError> {
    self.deliver(BusMessage {
      subject: subject.to_owned(),
      reply: Some(reply.to_owned()),
      payload,
    });
    Ok(())
  }

  async fn subscribe(&self, subject: &str) -> Result<Subscription, BusError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut subs = self.subs.lock().expect("bus subscriber list poisoned");
    subs.push(SubEntry {
      pattern: subject.split('.').map(str::to_owned).collect(),
      tx,
    });

    Ok(Subscription::new(rx))
  }

  async fn flush(&self) -> Result<(), BusError> {
    Ok(())
  }
}

fn subject_matches(pattern: &[String], subject: &str) -> bool {
  let tokens: Vec<&str> = subject.split('.').collect();

  let mut i = 0;
  for part in pattern {
    if part == ">" {
      return i < tokens.len();
    }
    match tokens.get(i) {
      Some(token) if part == "*" || part == token => i += 1,
      _ => return false,
    }
  }

  i == tokens.len()
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::bus::{request, request_many};

  #[test]
  fn it_matches_subjects() {
    let pattern = |s: &str| -> Vec<String> { s.split('.').map(str::to_owned).collect() };

    assert!(subject_matches(&pattern("ec2.CreateVpc"), "ec2.CreateVpc"));
    assert!(subject_matches(&pattern("ec2.*"), "ec2.CreateVpc"));
    assert!(subject_matches(&pattern("ec2.>"), "ec2.CreateVpc"));
    assert!(subject_matches(&pattern("hive.node.*"), "hive.node.status"));

    assert!(!subject_matches(&pattern("ec2.CreateVpc"), "ec2.DeleteVpc"));
    assert!(!subject_matches(&pattern("ec2.*"), "ec2"));
    assert!(!subject_matches(&pattern("ec2.>"), "ec2"));
    assert!(!subject_matches(&pattern("ec2.*"), "ec2.a.b"));
  }

  #[tokio::test]
  async fn it_round_trips_request_reply() {
    let bus = MemoryBus::new();
    let mut sub = bus.subscribe("ec2.CreateVpc").await.unwrap();

    let responder = async {
      let msg = sub.next().await.unwrap();
      let reply = msg.reply.unwrap();
      bus.publish(&reply, b"ok".to_vec()).await.unwrap();
    };

    let (reply, _) = tokio::join!(
      request(&bus, "ec2.CreateVpc", b"req".to_vec(), Duration::from_secs(1)),
      responder,
    );

    assert_eq!(reply.unwrap().payload, b"ok");
  }

  #[tokio::test]
  async fn it_collects_fanout_replies_up_to_expected() {
    let bus = MemoryBus::new();
    let mut a = bus.subscribe("hive.node.status").await.unwrap();
    let mut b = bus.subscribe("hive.node.status").await.unwrap();

    let collector = request_many(
      &bus,
      "hive.node.status",
      Vec::new(),
      Duration::from_secs(1),
      Some(2),
    );

    let responders = async {
      let msg = a.next().await.unwrap();
      bus.publish(&msg.reply.unwrap(), b"node1".to_vec()).await.unwrap();
      let msg = b.next().await.unwrap();
      bus.publish(&msg.reply.unwrap(), b"node2".to_vec()).await.unwrap();
    };

    let (replies, _) = tokio::join!(collector, responders);
    let replies = replies.unwrap();

    assert_eq!(replies.len(), 2);
  }

  #[tokio::test]
  async fn it_times_out_when_responders_are_missing() {
    let bus = MemoryBus::new();
    let replies = request_many(
      &bus,
      "hive.node.status",
      Vec::new(),
      Duration::from_millis(20),
      Some(3),
    )
    .await
    .unwrap();

    assert!(replies.is_empty());
  }
}
