use std::{path::Path, time::Duration};

use anyhow::Result;
use clap::{Args, Subcommand};

use super::get::{collect_statuses, FanoutArgs};
use crate::{config::ClusterConfig, daemon::status::NodeStatusResponse};

#[derive(Args, Debug)]
pub struct Top {
  #[command(subcommand)]
  pub command: TopCommands,
}

#[derive(Debug, Subcommand)]
pub enum TopCommands {
  /// Utilization of every node in the cluster
  Nodes(FanoutArgs),
}

impl Top {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    let config = ClusterConfig::read(config_dir)?;
    let settings = config.settings(config_dir)?;
    let (bus, _kv) = super::cluster_wiring(&settings);

    match &self.command {
      TopCommands::Nodes(args) => {
        let statuses = collect_statuses(
          bus.as_ref(),
          &config.expected_nodes(),
          Duration::from_secs(args.timeout),
        )
        .await?;
        print_utilization(&statuses);
      }
    }

    Ok(())
  }
}

fn print_utilization(statuses: &[NodeStatusResponse]) {
  println!(
    "{:<12} {:<10} {:>4} {:>6} {:>6} {:<40}",
    "NODE", "STATUS", "VMS", "CPU%", "MEM%", "AVAILABLE"
  );

  for status in statuses {
    let available: Vec<String> = status
      .instance_types
      .iter()
      .filter(|capacity| capacity.available > 0)
      .map(|capacity| format!("{}x{}", capacity.available, capacity.name))
      .collect();

    println!(
      "{:<12} {:<10} {:>4} {:>5}% {:>5}% {:<40}",
      status.node,
      status.status,
      status.vm_count,
      percentage(status.alloc_vcpu, status.total_vcpu),
      percentage(status.alloc_mem_gb, status.total_mem_gb),
      available.join(" ")
    );
  }
}

fn percentage(alloc: u32, total: u32) -> u32 {
  if total == 0 {
    return 0;
  }
  alloc * 100 / total
}
