use std::{
  collections::BTreeMap,
  sync::Arc,
  time::Duration,
};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::{
  bus::{self, Bus},
  kv::KvBucket,
};

pub const SHUTDOWN_STATE_KEY: &str = "shutdown";

/// How long the initiator lets the terminal publish propagate before exiting
pub const INFRA_PROPAGATION: Duration = Duration::from_secs(2);

/// Shutdown phases in execution order
///
/// `infra` stops the bus itself, so it is fire-and-forget: no node can ACK
/// over a substrate it has just torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  Gate,
  Drain,
  Storage,
  Persist,
  Infra,
}

impl Phase {
  pub const ALL: [Phase; 5] = [
    Phase::Gate,
    Phase::Drain,
    Phase::Storage,
    Phase::Persist,
    Phase::Infra,
  ];

  pub fn name(&self) -> &'static str {
    match self {
      Phase::Gate => "gate",
      Phase::Drain => "drain",
      Phase::Storage => "storage",
      Phase::Persist => "persist",
      Phase::Infra => "infra",
    }
  }

  pub fn subject(&self) -> String {
    bus::subject::shutdown_phase(self.name())
  }

  pub fn is_terminal(&self) -> bool {
    matches!(self, Phase::Infra)
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownAck {
  pub node: String,
  #[serde(default)]
  pub stopped: Vec<String>,
  #[serde(default)]
  pub error: String,
}

/// Streamed by nodes while VMs drain
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownProgress {
  pub node: String,
  pub remaining: usize,
  pub total: usize,
}

/// The marker persisted in the cluster-state bucket
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterShutdownState {
  pub initiator: String,
  pub phase: String,
  pub started: DateTime<Utc>,
  pub timeout: String,
  pub force: bool,
  pub nodes_total: usize,
  #[serde(default)]
  pub nodes_acked: BTreeMap<String, String>,
}

/// The result of one collected phase
#[derive(Clone, Debug)]
pub struct PhaseOutcome {
  pub phase: Phase,
  pub acks: Vec<ShutdownAck>,
  pub missing: Vec<String>,
}

impl PhaseOutcome {
  pub fn failed_acks(&self) -> Vec<&ShutdownAck> {
    self.acks.iter().filter(|ack| !ack.error.is_empty()).collect()
  }

  pub fn is_clean(&self) -> bool {
    self.missing.is_empty() && self.failed_acks().is_empty()
  }
}

/// Initiator side of the five-phase barrier protocol
pub struct ShutdownCoordinator {
  bus: Arc<dyn Bus>,
  /// Marker writes are best-effort; a missing bucket never blocks shutdown
  state_bucket: Option<Arc<dyn KvBucket>>,
  initiator: String,
  nodes: Vec<String>,
  timeout: Duration,
  force: bool,
}

impl ShutdownCoordinator {
  pub fn new(
    bus: Arc<dyn Bus>,
    state_bucket: Option<Arc<dyn KvBucket>>,
    initiator: &str,
    nodes: Vec<String>,
    timeout: Duration,
    force: bool,
  ) -> Self {
    Self {
      bus,
      state_bucket,
      initiator: initiator.to_owned(),
      nodes,
      timeout,
      force,
    }
  }

  /// Walk the phases in order, collecting ACKs for every non-terminal one
  ///
  /// A phase with missing or failed ACKs aborts unless `force` is set. The
  /// terminal phase is published, flushed, and given a short propagation
  /// window; nothing is collected for it.
  pub async fn run(&self) -> Result<Vec<PhaseOutcome>> {
    let started = Utc::now();
    let mut acked: BTreeMap<String, String> = BTreeMap::new();
    self.write_marker("starting", started, &acked).await;

    let mut outcomes = Vec::new();

    for phase in Phase::ALL {
      if phase.is_terminal() {
        info!("publishing terminal phase {}", phase.name());
        if let Err(err) = self.bus.publish(&phase.subject(), Vec::new()).await {
          warn!("failed to publish {}: {err}", phase.subject());
        }
        if let Err(err) = self.bus.flush().await {
          warn!("failed to flush bus before exit: {err}");
        }
        tokio::time::sleep(INFRA_PROPAGATION).await;

        self.write_marker(phase.name(), started, &acked).await;
        break;
      }

      let outcome = self.collect_phase(phase).await?;
      for ack in &outcome.acks {
        acked.insert(ack.node.clone(), phase.name().to_owned());
      }
      self.write_marker(phase.name(), started, &acked).await;

      if !outcome.is_clean() {
        for ack in outcome.failed_acks() {
          warn!("node {} failed phase {}: {}", ack.node, phase.name(), ack.error);
        }
        for node in &outcome.missing {
          warn!("node {node} did not ACK phase {} in time", phase.name());
        }

        if !self.force {
          let summary = phase_failure_summary(&outcome);
          outcomes.push(outcome);
          bail!("shutdown aborted at phase {}: {summary}", phase.name());
        }
        info!("continuing past phase {} under --force", phase.name());
      }

      outcomes.push(outcome);
    }

    Ok(outcomes)
  }

  async fn collect_phase(&self, phase: Phase) -> Result<PhaseOutcome> {
    info!(
      "phase {}: waiting up to {:?} for {} nodes",
      phase.name(),
      self.timeout,
      self.nodes.len()
    );

    let inbox = bus::new_inbox();
    let mut sub = self.bus.subscribe(&inbox).await.map_err(anyhow::Error::from)?;
    self
      .bus
      .publish_with_reply(&phase.subject(), &inbox, Vec::new())
      .await
      .map_err(anyhow::Error::from)?;

    let deadline = Instant::now() + self.timeout;
    let mut acks: BTreeMap<String, ShutdownAck> = BTreeMap::new();

    while acks.len() < self.nodes.len() {
      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() {
        break;
      }

      match tokio::time::timeout(remaining, sub.next()).await {
        Ok(Some(msg)) => match serde_json::from_slice::<ShutdownAck>(&msg.payload) {
          Ok(ack) => {
            acks.insert(ack.node.clone(), ack);
          }
          Err(err) => warn!("discarding malformed ACK on {}: {err}", phase.subject()),
        },
        Ok(None) => break,
        Err(_) => break,
      }
    }

    let missing = self
      .nodes
      .iter()
      .filter(|node| !acks.contains_key(*node))
      .cloned()
      .collect();

    Ok(PhaseOutcome {
      phase,
      acks: acks.into_values().collect(),
      missing,
    })
  }

  async fn write_marker(
    &self,
    phase: &str,
    started: DateTime<Utc>,
    acked: &BTreeMap<String, String>,
  ) {
    let Some(bucket) = &self.state_bucket else {
      return;
    };

    let state = ClusterShutdownState {
      initiator: self.initiator.clone(),
      phase: phase.to_owned(),
      started,
      timeout: format!("{}s", self.timeout.as_secs()),
      force: self.force,
      nodes_total: self.nodes.len(),
      nodes_acked: acked.clone(),
    };

    let payload = match serde_json::to_vec(&state) {
      Ok(payload) => payload,
      Err(err) => {
        warn!("failed to encode shutdown marker: {err}");
        return;
      }
    };

    if let Err(err) = bucket.put(SHUTDOWN_STATE_KEY, payload).await {
      warn!("failed to persist shutdown marker: {err}");
    }
  }
}

fn phase_failure_summary(outcome: &PhaseOutcome) -> String {
  let mut parts = Vec::new();
  if !outcome.missing.is_empty() {
    parts.push(format!("no ACK from {}", outcome.missing.join(", ")));
  }
  for ack in outcome.failed_acks() {
    parts.push(format!("{}: {}", ack.node, ack.error));
  }
  parts.join("; ")
}
