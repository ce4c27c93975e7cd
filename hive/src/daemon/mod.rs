pub mod dispatch;
pub mod runtime;
pub mod status;
pub mod vm;

use std::sync::{
  atomic::{AtomicBool, Ordering},
  Arc,
};

use anyhow::Result;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
  bus::{subject, Bus, BusMessage},
  config::ConfigSettings,
  objectstore::ObjectStore,
  shutdown::{Phase, ShutdownAck, ShutdownProgress},
  store::{ApiError, ResourceStore},
};
use dispatch::ErrorEnvelope;
use runtime::NodeRuntime;
use status::NodeVMsResponse;
use vm::VmRegistry;

/// The per-node daemon: one subscription loop per subject, all cross-node
/// coordination through the KV-backed resource store
pub struct Daemon {
  settings: ConfigSettings,
  bus: Arc<dyn Bus>,
  store: Arc<ResourceStore>,
  objects: Arc<dyn ObjectStore>,
  vms: Arc<VmRegistry>,
  runtime: Arc<dyn NodeRuntime>,
  gated: AtomicBool,
  started: Instant,
}

impl Daemon {
  pub fn new(
    settings: ConfigSettings,
    bus: Arc<dyn Bus>,
    store: Arc<ResourceStore>,
    objects: Arc<dyn ObjectStore>,
    runtime: Arc<dyn NodeRuntime>,
  ) -> Arc<Self> {
    Arc::new(Self {
      settings,
      bus,
      store,
      objects,
      vms: Arc::new(VmRegistry::new()),
      runtime,
      gated: AtomicBool::new(false),
      started: Instant::now(),
    })
  }

  pub fn vms(&self) -> &Arc<VmRegistry> {
    &self.vms
  }

  /// The object-store capability handed to the gateway handlers
  pub fn objects(&self) -> &Arc<dyn ObjectStore> {
    &self.objects
  }

  /// Subscribe every topic and spawn the handler loops
  ///
  /// The loops hold their own handles; the daemon lives as long as any of
  /// them does.
  pub async fn start(self: Arc<Self>) -> Result<()> {
    let mut status_sub = self.bus.subscribe(subject::NODE_STATUS).await?;
    let daemon = self.clone();
    tokio::spawn(async move {
      while let Some(msg) = status_sub.next().await {
        daemon.handle_status(msg).await;
      }
    });

    let mut vms_sub = self.bus.subscribe(subject::NODE_VMS).await?;
    let daemon = self.clone();
    tokio::spawn(async move {
      while let Some(msg) = vms_sub.next().await {
        daemon.handle_vms(msg).await;
      }
    });

    let mut api_sub = self.bus.subscribe(subject::EC2_ALL).await?;
    let daemon = self.clone();
    tokio::spawn(async move {
      while let Some(msg) = api_sub.next().await {
        daemon.handle_api(msg).await;
      }
    });

    for phase in Phase::ALL {
      let mut phase_sub = self.bus.subscribe(&phase.subject()).await?;
      let daemon = self.clone();
      tokio::spawn(async move {
        while let Some(msg) = phase_sub.next().await {
          daemon.handle_shutdown_phase(phase, msg).await;
        }
      });
    }

    info!("daemon {} listening on the cluster bus", self.settings.node);
    Ok(())
  }

  async fn handle_status(&self, msg: BusMessage) {
    let Some(reply) = msg.reply else { return };
    let response = status::build_status(&self.settings, &self.vms, self.started.elapsed());
    self.reply_json(&reply, &response).await;
  }

  async fn handle_vms(&self, msg: BusMessage) {
    let Some(reply) = msg.reply else { return };
    let response = NodeVMsResponse {
      node: self.settings.node.clone(),
      host: self.settings.bind_ip.to_string(),
      vms: self.vms.list(),
    };
    self.reply_json(&reply, &response).await;
  }

  async fn handle_api(&self, msg: BusMessage) {
    let Some(reply) = msg.reply else { return };
    let action = msg.subject.strip_prefix("ec2.").unwrap_or(&msg.subject);

    if self.gated.load(Ordering::SeqCst) {
      let err = ApiError::Unavailable("node is gated for cluster shutdown".to_owned());
      self.reply_json(&reply, &ErrorEnvelope::from(&err)).await;
      return;
    }

    debug!("dispatching {action}");
    match dispatch::execute(&self.store, action, &msg.payload).await {
      Ok(value) => self.reply_json(&reply, &value).await,
      Err(err) => self.reply_json(&reply, &ErrorEnvelope::from(&err)).await,
    }
  }

  async fn handle_shutdown_phase(&self, phase: Phase, msg: BusMessage) {
    info!("cluster shutdown phase {} received", phase.name());

    let ack = match phase {
      Phase::Gate => {
        self.gated.store(true, Ordering::SeqCst);
        self.ack(vec!["awsgw".to_owned(), "ui".to_owned()], String::new())
      }
      Phase::Drain => self.drain().await,
      Phase::Storage => self.run_stop(self.runtime.stop_block_storage().await),
      Phase::Persist => self.run_stop(self.runtime.stop_object_store().await),
      Phase::Infra => {
        // The bus goes down with this phase; nobody is listening for an ACK
        if let Err(err) = self.runtime.stop_message_bus().await {
          warn!("failed to stop message bus: {err}");
        }
        return;
      }
    };

    if let Some(reply) = msg.reply {
      self.reply_json(&reply, &ack).await;
    }
  }

  /// Stop hosted VMs one by one, streaming progress for the initiator
  async fn drain(&self) -> ShutdownAck {
    let ids = self.vms.instance_ids();
    let total = ids.len();
    let mut errors = Vec::new();

    for (idx, instance_id) in ids.iter().enumerate() {
      match self.runtime.stop_vm(instance_id).await {
        Ok(()) => {
          self.vms.remove(instance_id);
        }
        Err(err) => errors.push(format!("{instance_id}: {err}")),
      }

      let progress = ShutdownProgress {
        node: self.settings.node.clone(),
        remaining: total - idx - 1,
        total,
      };
      match serde_json::to_vec(&progress) {
        Ok(payload) => {
          if let Err(err) = self.bus.publish(subject::SHUTDOWN_PROGRESS, payload).await {
            warn!("failed to publish drain progress: {err}");
          }
        }
        Err(err) => warn!("failed to encode drain progress: {err}"),
      }
    }

    self.ack(vec!["vms".to_owned()], errors.join("; "))
  }

  fn run_stop(&self, result: Result<Vec<String>>) -> ShutdownAck {
    match result {
      Ok(stopped) => self.ack(stopped, String::new()),
      Err(err) => self.ack(Vec::new(), err.to_string()),
    }
  }

  fn ack(&self, stopped: Vec<String>, error: String) -> ShutdownAck {
    ShutdownAck {
      node: self.settings.node.clone(),
      stopped,
      error,
    }
  }

  async fn reply_json<T: Serialize>(&self, reply: &str, response: &T) {
    let payload = match serde_json::to_vec(response) {
      Ok(payload) => payload,
      Err(err) => {
        warn!("failed to encode reply on {reply}: {err}");
        return;
      }
    };

    if let Err(err) = self.bus.publish(reply, payload).await {
      warn!("failed to reply on {reply}: {err}");
    }
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::*;
  use crate::{
    bus::{self, memory::MemoryBus},
    config::ConfigSettings,
    daemon::{runtime::LoggingRuntime, status::NodeStatusResponse, vm::tests::vm},
    kv::memory::MemoryKv,
    objectstore::MemoryObjectStore,
  };

  fn settings(node: &str) -> ConfigSettings {
    ConfigSettings {
      access_key: "AKIA0000000000000000".to_owned(),
      secret_key: "secret".to_owned(),
      account_id: "000000000000".to_owned(),
      region: "ap-southeast-2".to_owned(),
      nats_token: "token".to_owned(),
      data_dir: "/etc/hive".into(),
      node: node.to_owned(),
      az: "ap-southeast-2a".to_owned(),
      port: 4432,
      bind_ip: "10.0.0.1".parse().unwrap(),
      cluster_bind_ip: "10.0.0.1".parse().unwrap(),
      cluster_routes: vec!["10.0.0.1:4248".to_owned()],
      cluster_name: "hive".to_owned(),
      predastore_node_id: 1,
      services: Vec::new(),
      remote_nodes: Vec::new(),
    }
  }

  async fn daemon(node: &str) -> (Arc<Daemon>, Arc<MemoryBus>) {
    let kv = MemoryKv::new();
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(
      ResourceStore::open(&kv, bus.clone(), "ap-southeast-2a").await.unwrap(),
    );

    let daemon = Daemon::new(
      settings(node),
      bus.clone(),
      store,
      Arc::new(MemoryObjectStore::new()),
      Arc::new(LoggingRuntime),
    );
    daemon.clone().start().await.unwrap();

    (daemon, bus)
  }

  #[tokio::test]
  async fn it_answers_status_fanouts() {
    let (_daemon, bus) = daemon("node1").await;

    let replies = bus::request_many(
      bus.as_ref(),
      subject::NODE_STATUS,
      Vec::new(),
      Duration::from_secs(1),
      Some(1),
    )
    .await
    .unwrap();
    assert_eq!(replies.len(), 1);

    let status: NodeStatusResponse = serde_json::from_slice(&replies[0].payload).unwrap();
    assert_eq!(status.node, "node1");
    assert_eq!(status.status, "Ready");
    assert_eq!(status.host, "10.0.0.1");
    assert!(status.total_vcpu > 0);
    assert!(!status.instance_types.is_empty());
  }

  #[tokio::test]
  async fn it_reports_hosted_vms() {
    let (daemon, bus) = daemon("node1").await;
    daemon.vms().register(vm("i-0000000000000000a", 2, 4));

    let reply = bus::request(
      bus.as_ref(),
      subject::NODE_VMS,
      Vec::new(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();

    let response: NodeVMsResponse = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(response.node, "node1");
    assert_eq!(response.vms.len(), 1);
    assert_eq!(response.vms[0].instance_id, "i-0000000000000000a");
  }

  #[tokio::test]
  async fn it_dispatches_api_actions_over_the_bus() {
    let (_daemon, bus) = daemon("node1").await;

    let reply = bus::request(
      bus.as_ref(),
      &subject::ec2("CreateVpc"),
      br#"{"cidrBlock":"10.0.0.0/16"}"#.to_vec(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(value["vpc"]["vni"], 100);
    assert_eq!(value["vpc"]["cidrBlock"], "10.0.0.0/16");

    let reply = bus::request(
      bus.as_ref(),
      &subject::ec2("CreateVpc"),
      br#"{"cidrBlock":"oops"}"#.to_vec(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();
    let envelope: ErrorEnvelope = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(envelope.error.code, "InvalidVpcRange");

    let reply = bus::request(
      bus.as_ref(),
      &subject::ec2("LaunchRocket"),
      Vec::new(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();
    let envelope: ErrorEnvelope = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(envelope.error.code, "InvalidAction");
  }

  #[tokio::test]
  async fn it_gates_api_work_during_shutdown() {
    let (_daemon, bus) = daemon("node1").await;

    let ack = bus::request(
      bus.as_ref(),
      &Phase::Gate.subject(),
      Vec::new(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();
    let ack: ShutdownAck = serde_json::from_slice(&ack.payload).unwrap();
    assert_eq!(ack.node, "node1");
    assert!(ack.error.is_empty());

    let reply = bus::request(
      bus.as_ref(),
      &subject::ec2("CreateVpc"),
      br#"{"cidrBlock":"10.0.0.0/16"}"#.to_vec(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();
    let envelope: ErrorEnvelope = serde_json::from_slice(&reply.payload).unwrap();
    assert_eq!(envelope.error.code, "ServiceUnavailable");
  }

  #[tokio::test]
  async fn it_drains_vms_with_progress() {
    let (daemon, bus) = daemon("node1").await;
    daemon.vms().register(vm("i-0000000000000000a", 2, 4));
    daemon.vms().register(vm("i-0000000000000000b", 2, 4));

    let mut progress_sub = bus.subscribe(subject::SHUTDOWN_PROGRESS).await.unwrap();

    let ack = bus::request(
      bus.as_ref(),
      &Phase::Drain.subject(),
      Vec::new(),
      Duration::from_secs(1),
    )
    .await
    .unwrap();
    let ack: ShutdownAck = serde_json::from_slice(&ack.payload).unwrap();
    assert!(ack.error.is_empty());
    assert_eq!(ack.stopped, vec!["vms".to_string()]);

    let first: ShutdownProgress =
      serde_json::from_slice(&progress_sub.next().await.unwrap().payload).unwrap();
    let second: ShutdownProgress =
      serde_json::from_slice(&progress_sub.next().await.unwrap().payload).unwrap();
    assert_eq!(first.total, 2);
    assert_eq!(first.remaining, 1);
    assert_eq!(second.remaining, 0);

    assert_eq!(daemon.vms().count(), 0);
  }
}
