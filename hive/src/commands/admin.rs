use std::{
  net::{IpAddr, SocketAddr},
  path::Path,
  time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};
use tracing::{info, warn};

use crate::{
  config::{validate_port, write_trust_material, ClusterConfig, ServiceTag},
  formation::{
    client::FormationClient,
    materialize_config,
    server::{self, Formation, DRAIN_GRACE},
    NodeInfo, SharedCredentials,
  },
  trust::{CertificateAuthority, TrustMaterial, CA_KEY_BITS, LEAF_KEY_BITS},
};

#[derive(Args, Debug)]
pub struct Admin {
  #[command(subcommand)]
  pub command: AdminCommands,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommands {
  /// Bootstrap a new cluster on this host
  Init(InitArgs),

  /// Join this host to a cluster being formed
  Join(JoinArgs),
}

impl Admin {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    match &self.command {
      AdminCommands::Init(init) => init.run(config_dir).await,
      AdminCommands::Join(join) => join.run(config_dir).await,
    }
  }
}

#[derive(Args, Debug)]
pub struct InitArgs {
  /// Node name
  #[arg(long)]
  pub node: String,

  /// IP address the node's services bind to
  #[arg(long)]
  pub bind: IpAddr,

  /// Formation and API port
  #[arg(long, default_value = "4432")]
  pub port: u16,

  #[arg(long)]
  pub region: String,

  #[arg(long)]
  pub az: String,

  /// Number of nodes expected to form the cluster
  #[arg(long, default_value = "1")]
  pub nodes: usize,

  /// IP address for cluster-internal traffic (defaults to --bind)
  #[arg(long)]
  pub cluster_bind: Option<IpAddr>,

  /// Explicit bus routes; derived from the final roster when omitted
  #[arg(long, value_delimiter = ',')]
  pub cluster_routes: Vec<String>,

  /// Declared predastore ring membership; requires at least 3 IPs
  #[arg(long, value_delimiter = ',')]
  pub predastore_nodes: Vec<IpAddr>,

  /// Services this node hosts; empty means all of them
  #[arg(long, value_delimiter = ',')]
  pub services: Vec<ServiceTag>,

  /// Seconds to wait for all expected nodes to join
  #[arg(long, default_value = "300")]
  pub formation_timeout: u64,

  #[arg(long, default_value = "hive")]
  pub cluster_name: String,

  /// Overwrite an existing configuration
  #[arg(long)]
  pub force: bool,
}

impl InitArgs {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    self.run_with_key_bits(config_dir, CA_KEY_BITS).await
  }

  pub(crate) async fn run_with_key_bits(&self, config_dir: &Path, ca_bits: usize) -> Result<()> {
    self.validate(config_dir)?;

    let credentials = SharedCredentials::generate(&self.cluster_name, &self.region);
    info!("generating cluster certificate authority");
    let ca = CertificateAuthority::generate(&self.cluster_name, ca_bits)?;

    let local = NodeInfo {
      name: self.node.clone(),
      bind_ip: self.bind,
      cluster_ip: self.cluster_bind.unwrap_or(self.bind),
      region: self.region.clone(),
      az: self.az.clone(),
      port: self.port,
      services: self.services.clone(),
    };

    let (roster, server_task) = if self.nodes == 1 {
      (vec![local], None)
    } else {
      let (roster, task) = self.form_cluster(local, &credentials, &ca).await?;
      (roster, Some(task))
    };

    let config = persist_membership(
      &roster,
      &credentials,
      &ca,
      &self.node,
      self.bind,
      config_dir,
      &self.cluster_routes,
    )?;

    // Keep answering status polls until the grace period elapses
    if let Some(task) = server_task {
      info!("configuration written, draining laggard status polls");
      match task.await {
        Ok(result) => result?,
        Err(err) => warn!("formation server task failed: {err}"),
      }
    }

    println!(
      "cluster {} formed with {} node(s); configuration written to {}",
      config.cluster_name,
      config.nodes.len(),
      config_dir.display()
    );
    Ok(())
  }

  fn validate(&self, config_dir: &Path) -> Result<()> {
    if self.nodes == 0 {
      bail!("--nodes must be at least 1");
    }
    validate_port(self.port)?;

    if ClusterConfig::exists(config_dir) && !self.force {
      bail!(
        "configuration already exists at {}; re-run with --force to overwrite",
        config_dir.display()
      );
    }

    if !self.predastore_nodes.is_empty() {
      if self.predastore_nodes.len() < 3 {
        bail!(
          "--predastore-nodes requires at least 3 IPs, got {}",
          self.predastore_nodes.len()
        );
      }
      if !self.predastore_nodes.contains(&self.bind) {
        bail!(
          "bind IP {} is not in the declared predastore ring",
          self.bind
        );
      }
    }

    Ok(())
  }

  /// Serve the formation endpoint until every expected node has joined
  ///
  /// Returns the final roster and the still-draining server task; the
  /// endpoint keeps answering status polls while the caller persists its
  /// own configuration.
  async fn form_cluster(
    &self,
    local: NodeInfo,
    credentials: &SharedCredentials,
    ca: &CertificateAuthority,
  ) -> Result<(Vec<NodeInfo>, tokio::task::JoinHandle<Result<()>>)> {
    let formation = Formation::new(
      local,
      self.nodes,
      credentials.clone(),
      ca.cert_pem(),
      ca.key_pem(),
      self.predastore_nodes.clone(),
    );

    let addr = SocketAddr::new(self.bind, self.port);
    let listener = server::bind(addr)
      .await
      .with_context(|| format!("binding formation endpoint on {addr}"))?;
    info!("formation endpoint listening on {addr}, expecting {} nodes", self.nodes);

    let server_task = tokio::spawn(server::serve(listener, formation.clone(), DRAIN_GRACE));

    let mut complete_rx = formation.subscribe_complete();
    let wait = async {
      while !*complete_rx.borrow() {
        if complete_rx.changed().await.is_err() {
          break;
        }
      }
    };

    let timeout = Duration::from_secs(self.formation_timeout);
    if tokio::time::timeout(timeout, wait).await.is_err() {
      server_task.abort();
      bail!(
        "formation timed out after {}s with {}/{} nodes joined",
        self.formation_timeout,
        formation.roster().len(),
        self.nodes
      );
    }

    Ok((formation.roster(), server_task))
  }
}

#[derive(Args, Debug)]
pub struct JoinArgs {
  /// Node name
  #[arg(long)]
  pub node: String,

  /// Formation leader address as host:port
  #[arg(long)]
  pub host: String,

  /// IP address the node's services bind to
  #[arg(long)]
  pub bind: IpAddr,

  /// Formation and API port
  #[arg(long, default_value = "4432")]
  pub port: u16,

  #[arg(long)]
  pub region: String,

  #[arg(long)]
  pub az: String,

  /// IP address for cluster-internal traffic (defaults to --bind)
  #[arg(long)]
  pub cluster_bind: Option<IpAddr>,

  /// Services this node hosts; empty means all of them
  #[arg(long, value_delimiter = ',')]
  pub services: Vec<ServiceTag>,

  /// Seconds to wait for formation to complete
  #[arg(long, default_value = "300")]
  pub formation_timeout: u64,
}

impl JoinArgs {
  pub async fn run(&self, config_dir: &Path) -> Result<()> {
    validate_port(self.port)?;

    let info = NodeInfo {
      name: self.node.clone(),
      bind_ip: self.bind,
      cluster_ip: self.cluster_bind.unwrap_or(self.bind),
      region: self.region.clone(),
      az: self.az.clone(),
      port: self.port,
      services: self.services.clone(),
    };

    let deadline = Duration::from_secs(self.formation_timeout);
    let client = FormationClient::new(&self.host)?;
    client.join(&info, deadline).await?;
    let status = client.wait_complete(deadline).await?;

    let credentials = status
      .credentials
      .context("formation completed without credentials")?;
    if status.ca_cert.is_empty() || status.ca_key.is_empty() {
      bail!("formation completed without CA material");
    }
    let ca = CertificateAuthority::from_pem(&status.ca_cert, &status.ca_key)?;

    if ClusterConfig::exists(config_dir) {
      warn!(
        "overwriting existing configuration at {}",
        config_dir.display()
      );
    }

    let config = persist_membership(
      &status.nodes,
      &credentials,
      &ca,
      &self.node,
      self.bind,
      config_dir,
      &[],
    )?;

    println!(
      "joined cluster {} as {}; configuration written to {}",
      config.cluster_name,
      self.node,
      config_dir.display()
    );
    Ok(())
  }
}

/// Materialize the shared topology, sign this node's leaf, and persist both
pub(crate) fn persist_membership(
  roster: &[NodeInfo],
  credentials: &SharedCredentials,
  ca: &CertificateAuthority,
  local_node: &str,
  bind_ip: IpAddr,
  config_dir: &Path,
  cluster_routes_override: &[String],
) -> Result<ClusterConfig> {
  let mut config = materialize_config(roster, credentials, local_node, config_dir)?;
  if !cluster_routes_override.is_empty() {
    config.cluster_routes = cluster_routes_override.to_vec();
  }

  let leaf = ca.issue_server_cert(local_node, &[bind_ip.to_string()], LEAF_KEY_BITS)?;
  let trust = TrustMaterial {
    ca_cert_pem: ca.cert_pem(),
    ca_key_pem: ca.key_pem(),
    server_cert_pem: leaf.cert_pem,
    server_key_pem: leaf.key_pem,
  };

  config.write(config_dir)?;
  write_trust_material(config_dir, &trust)?;

  Ok(config)
}

#[cfg(test)]
mod tests {
  use tempfile::tempdir;

  use super::*;
  use crate::config::{CA_CERT_FILE, SERVER_CERT_FILE};

  const TEST_BITS: usize = 2048;

  fn init_args(dir_force: bool) -> InitArgs {
    InitArgs {
      node: "node1".to_owned(),
      bind: "10.0.0.1".parse().unwrap(),
      port: 4432,
      region: "ap-southeast-2".to_owned(),
      az: "ap-southeast-2a".to_owned(),
      nodes: 1,
      cluster_bind: None,
      cluster_routes: Vec::new(),
      predastore_nodes: Vec::new(),
      services: Vec::new(),
      formation_timeout: 300,
      cluster_name: "hive".to_owned(),
      force: dir_force,
    }
  }

  #[tokio::test]
  async fn it_initializes_a_single_node_cluster() {
    let dir = tempdir().unwrap();
    let args = init_args(false);

    args.run_with_key_bits(dir.path(), TEST_BITS).await.unwrap();

    let config = ClusterConfig::read(dir.path()).unwrap();
    assert_eq!(config.epoch, 1);
    assert_eq!(config.local_node, "node1");
    assert_eq!(config.nodes.len(), 1);
    assert_eq!(config.nodes["node1"].predastore_node_id, 1);
    assert_eq!(config.predastore_nodes.len(), 1);
    assert_eq!(config.cluster_routes, vec!["10.0.0.1:4248".to_string()]);

    assert!(dir.path().join(CA_CERT_FILE).is_file());
    assert!(dir.path().join(SERVER_CERT_FILE).is_file());
  }

  #[tokio::test]
  async fn it_refuses_to_overwrite_without_force() {
    let dir = tempdir().unwrap();
    let args = init_args(false);
    args.run_with_key_bits(dir.path(), TEST_BITS).await.unwrap();

    let err = args.run_with_key_bits(dir.path(), TEST_BITS).await.unwrap_err();
    assert!(err.to_string().contains("--force"));

    let forced = init_args(true);
    forced.run_with_key_bits(dir.path(), TEST_BITS).await.unwrap();
  }

  #[test]
  fn it_validates_the_predastore_ring_flags() {
    let dir = tempdir().unwrap();

    let mut args = init_args(false);
    args.predastore_nodes = vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()];
    let err = args.validate(dir.path()).unwrap_err();
    assert!(err.to_string().contains("at least 3"));

    args.predastore_nodes = vec![
      "10.0.0.2".parse().unwrap(),
      "10.0.0.3".parse().unwrap(),
      "10.0.0.4".parse().unwrap(),
    ];
    let err = args.validate(dir.path()).unwrap_err();
    assert!(err.to_string().contains("not in the declared predastore ring"));

    args.predastore_nodes = vec![
      "10.0.0.1".parse().unwrap(),
      "10.0.0.2".parse().unwrap(),
      "10.0.0.3".parse().unwrap(),
    ];
    args.validate(dir.path()).unwrap();
  }

  #[test]
  fn it_overrides_cluster_routes_when_given() {
    let dir = tempdir().unwrap();
    let roster = vec![crate::formation::tests::node("node1", "10.0.0.1", Vec::new())];
    let credentials = SharedCredentials::generate("hive", "ap-southeast-2");
    let ca = CertificateAuthority::generate("hive", TEST_BITS).unwrap();

    let config = persist_membership(
      &roster,
      &credentials,
      &ca,
      "node1",
      "10.0.0.1".parse().unwrap(),
      dir.path(),
      &["10.9.9.9:4248".to_owned()],
    )
    .unwrap();

    assert_eq!(config.cluster_routes, vec!["10.9.9.9:4248".to_string()]);
    assert!(ClusterConfig::exists(dir.path()));
  }
}
