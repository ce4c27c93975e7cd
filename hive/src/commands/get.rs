use std::{collections::BTreeMap, path::Path, time::Duration};

use anyhow::Result;
use clap::{Args, Subcommand};
use tracing::warn;

use super::{cluster_wiring, format_uptime};
use crate::{
  bus::{self, subject, Bus},
  config::ClusterConfig,
  daemon::status::{NodeStatusResponse, NodeVMsResponse},
};

#[derive(Args, Debug)]
pub struct Get {
  #[command(subcommand)]
  pub command: GetCommands,
}

#[derive(Debug, Subcommand)]
pub enum GetCommands {
  /// Status of every node in the cluster
  Nodes(FanoutArgs),

  /// VM inventory of every node in the cluster
  Vms(FanoutArgs),
}

#[derive(Args, Debug)]
pub struct FanoutArgs {
  /// Seconds to wait for node replies
  #[arg(long, default_value = "3")]
  pub timeout: u64,
}

impl Get {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    let config = ClusterConfig::read(config_dir)?;
    let settings = config.settings(config_dir)?;
    let (bus, _kv) = cluster_wiring(&settings);

    match &self.command {
      GetCommands::Nodes(args) => {
        let statuses = collect_statuses(
          bus.as_ref(),
          &config.expected_nodes(),
          Duration::from_secs(args.timeout),
        )
        .await?;
        print_nodes(&statuses);
      }
      GetCommands::Vms(args) => {
        let responses = collect_vms(
          bus.as_ref(),
          &config.expected_nodes(),
          Duration::from_secs(args.timeout),
        )
        .await?;
        print_vms(&responses);
      }
    }

    Ok(())
  }
}

/// Fan out a status request and fill in `NotReady` rows for silent nodes
pub(crate) async fn collect_statuses(
  bus: &dyn Bus,
  expected: &[String],
  timeout: Duration,
) -> Result<Vec<NodeStatusResponse>> {
  let replies = bus::request_many(
    bus,
    subject::NODE_STATUS,
    Vec::new(),
    timeout,
    Some(expected.len()),
  )
  .await?;

  let mut by_node: BTreeMap<String, NodeStatusResponse> = BTreeMap::new();
  for reply in replies {
    match serde_json::from_slice::<NodeStatusResponse>(&reply.payload) {
      Ok(status) => {
        by_node.insert(status.node.clone(), status);
      }
      Err(err) => warn!("discarding malformed status reply: {err}"),
    }
  }

  for name in expected {
    by_node
      .entry(name.clone())
      .or_insert_with(|| NodeStatusResponse::not_ready(name));
  }

  Ok(by_node.into_values().collect())
}

pub(crate) async fn collect_vms(
  bus: &dyn Bus,
  expected: &[String],
  timeout: Duration,
) -> Result<Vec<NodeVMsResponse>> {
  let replies = bus::request_many(
    bus,
    subject::NODE_VMS,
    Vec::new(),
    timeout,
    Some(expected.len()),
  )
  .await?;

  let mut by_node: BTreeMap<String, NodeVMsResponse> = BTreeMap::new();
  for reply in replies {
    match serde_json::from_slice::<NodeVMsResponse>(&reply.payload) {
      Ok(response) => {
        by_node.insert(response.node.clone(), response);
      }
      Err(err) => warn!("discarding malformed VM reply: {err}"),
    }
  }

  Ok(by_node.into_values().collect())
}

fn print_nodes(statuses: &[NodeStatusResponse]) {
  println!(
    "{:<12} {:<10} {:<16} {:<18} {:>4} {:>11} {:>13} {:>8}",
    "NODE", "STATUS", "HOST", "AZ", "VMS", "VCPU", "MEM(GB)", "UPTIME"
  );

  for status in statuses {
    println!(
      "{:<12} {:<10} {:<16} {:<18} {:>4} {:>5}/{:<5} {:>6}/{:<6} {:>8}",
      status.node,
      status.status,
      status.host,
      status.az,
      status.vm_count,
      status.alloc_vcpu,
      status.total_vcpu,
      status.alloc_mem_gb,
      status.total_mem_gb,
      format_uptime(status.uptime_sec)
    );
  }
}

fn print_vms(responses: &[NodeVMsResponse]) {
  println!(
    "{:<12} {:<20} {:<10} {:<12} {:>4} {:>7} {:<25}",
    "NODE", "INSTANCE", "STATUS", "TYPE", "VCPU", "MEM(GB)", "LAUNCHED"
  );

  for response in responses {
    for vm in &response.vms {
      println!(
        "{:<12} {:<20} {:<10} {:<12} {:>4} {:>7} {:<25}",
        response.node,
        vm.instance_id,
        vm.status,
        vm.instance_type,
        vm.vcpu,
        vm.memory_gb,
        vm.launch_time.to_rfc3339()
      );
    }
  }
}
