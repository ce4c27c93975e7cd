use std::{path::Path, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing::warn;

use super::cluster_wiring;
use crate::{
  bus::subject,
  config::ClusterConfig,
  shutdown::{Phase, ShutdownCoordinator, ShutdownProgress},
  store::CLUSTER_STATE_BUCKET,
};

#[derive(Args, Debug)]
pub struct Cluster {
  #[command(subcommand)]
  pub command: ClusterCommands,
}

#[derive(Debug, Subcommand)]
pub enum ClusterCommands {
  /// Shut the whole cluster down in coordinated phases
  Shutdown(ShutdownArgs),
}

#[derive(Args, Debug)]
pub struct ShutdownArgs {
  /// Seconds to wait for each phase's ACKs
  #[arg(long, default_value = "30")]
  pub timeout: u64,

  /// Continue past failed or missing ACKs
  #[arg(long)]
  pub force: bool,

  /// Print the plan without publishing any shutdown messages
  #[arg(long)]
  pub dry_run: bool,
}

impl Cluster {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    match &self.command {
      ClusterCommands::Shutdown(args) => args.run(config_dir).await,
    }
  }
}

impl ShutdownArgs {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    let config = ClusterConfig::read(config_dir)?;
    let timeout = Duration::from_secs(self.timeout);

    if self.dry_run {
      print!("{}", render_plan(&config, timeout, self.force));
      return Ok(());
    }

    let settings = config.settings(config_dir)?;
    let (bus, kv) = cluster_wiring(&settings);
    let state_bucket = match kv.bucket(&CLUSTER_STATE_BUCKET).await {
      Ok(bucket) => Some(bucket),
      Err(err) => {
        warn!("cluster-state bucket unavailable, continuing without marker: {err}");
        None
      }
    };

    // Stream drain progress while the coordinator walks the phases
    let mut progress_sub = bus.subscribe(subject::SHUTDOWN_PROGRESS).await?;
    tokio::spawn(async move {
      while let Some(msg) = progress_sub.next().await {
        if let Ok(progress) = serde_json::from_slice::<ShutdownProgress>(&msg.payload) {
          println!(
            "  {}: {}/{} VMs remaining",
            progress.node, progress.remaining, progress.total
          );
        }
      }
    });

    let coordinator = ShutdownCoordinator::new(
      bus,
      state_bucket,
      &config.local_node,
      config.expected_nodes(),
      timeout,
      self.force,
    );

    let outcomes = coordinator.run().await?;
    for outcome in &outcomes {
      println!(
        "phase {}: {} ACKs, {} missing",
        outcome.phase.name(),
        outcome.acks.len(),
        outcome.missing.len()
      );
    }
    println!("cluster shutdown complete");

    Ok(())
  }
}

fn render_plan(config: &ClusterConfig, timeout: Duration, force: bool) -> String {
  let mut plan = String::new();

  plan.push_str(&format!(
    "cluster {} shutdown plan (dry run)\n",
    config.cluster_name
  ));
  plan.push_str(&format!("  initiator: {}\n", config.local_node));
  plan.push_str(&format!("  nodes ({}):\n", config.nodes.len()));
  for (name, node) in &config.nodes {
    plan.push_str(&format!("    {name} ({})\n", node.bind_ip));
  }

  let phases: Vec<&str> = Phase::ALL.iter().map(Phase::name).collect();
  plan.push_str(&format!("  phases: {}\n", phases.join(" -> ")));
  plan.push_str(&format!(
    "  per-phase timeout: {}s, force: {force}\n",
    timeout.as_secs()
  ));
  plan.push_str("no shutdown messages published\n");

  plan
}
