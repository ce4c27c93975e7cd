use std::{path::Path, sync::Arc};

use anyhow::Result;
use clap::Args;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use super::cluster_wiring;
use crate::{
  config::ClusterConfig,
  daemon::{runtime::LoggingRuntime, Daemon},
  objectstore::MemoryObjectStore,
  store::ResourceStore,
};

#[derive(Args, Debug)]
pub struct DaemonCommand {}

impl DaemonCommand {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    let config = ClusterConfig::read(config_dir)?;
    let settings = config.settings(config_dir)?;
    info!(
      "starting daemon {} for cluster {}",
      settings.node, settings.cluster_name
    );

    let (bus, kv) = cluster_wiring(&settings);
    let store = Arc::new(ResourceStore::open(kv.as_ref(), bus.clone(), &settings.az).await?);

    let daemon = Daemon::new(
      settings,
      bus,
      store.clone(),
      Arc::new(MemoryObjectStore::new()),
      Arc::new(LoggingRuntime),
    );
    daemon.start().await?;

    if let Err(err) = store.ensure_default_vpc().await {
      warn!("default VPC provisioning failed: {err}");
    }

    shutdown_signal().await;
    info!("daemon exiting");
    Ok(())
  }
}

async fn shutdown_signal() {
  let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {},
    _ = sigterm.recv() => {},
  }
}
