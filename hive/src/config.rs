use std::{
  collections::BTreeMap,
  fs,
  net::IpAddr,
  os::unix::fs::PermissionsExt,
  path::{Path, PathBuf},
};

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::trust::TrustMaterial;

pub const CONFIG_FILE: &str = "hive.toml";
pub const CA_CERT_FILE: &str = "ca.pem";
pub const CA_KEY_FILE: &str = "ca.key";
pub const SERVER_CERT_FILE: &str = "server.pem";
pub const SERVER_KEY_FILE: &str = "server.key";

/// The fixed platform account; customer accounts are out of scope
pub const PLATFORM_ACCOUNT_ID: &str = "000000000000";

/// Port the bus listens on for cluster routes
pub const CLUSTER_ROUTE_PORT: u16 = 4248;

/// Services a node can host; an empty set on a node means "runs everything"
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTag {
  Nats,
  Predastore,
  Viperblock,
  Daemon,
  Awsgw,
  Ui,
}

/// S3-compatible persistence tier settings for one node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PredastoreConfig {
  pub host: String,
  pub bucket: String,
  pub region: String,
  pub access_key: String,
  pub secret_key: String,
  pub base_dir: PathBuf,
}

/// EC2 gateway TLS material locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AwsGatewayConfig {
  pub tls_cert: PathBuf,
  pub tls_key: PathBuf,
}

/// Block-storage daemon settings for one node
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ViperblockConfig {
  pub base_dir: PathBuf,
  pub cache_size_mb: u64,
}

/// One node's entry in the cluster topology
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeSpec {
  pub name: String,
  pub bind_ip: IpAddr,
  pub cluster_bind_ip: IpAddr,
  pub region: String,
  pub az: String,
  pub port: u16,
  #[serde(default)]
  pub services: Vec<ServiceTag>,
  pub access_key: String,
  pub secret_key: String,
  pub nats_token: String,
  /// Position in the predastore ring, 0 when this node is not a member
  pub predastore_node_id: u32,
  pub predastore: PredastoreConfig,
  pub awsgw: AwsGatewayConfig,
  pub viperblock: ViperblockConfig,
}

impl NodeSpec {
  pub fn runs(&self, tag: ServiceTag) -> bool {
    self.services.is_empty() || self.services.contains(&tag)
  }
}

/// A member of the predastore ring, in registration order
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredastoreNode {
  pub id: u32,
  pub host: IpAddr,
}

/// The durable source of truth for cluster membership
///
/// Persisted identically on every node once formation completes; `nodes`
/// is authoritative for expected membership and is immutable afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
  pub epoch: u64,
  pub version: String,
  pub cluster_name: String,
  pub region: String,
  pub local_node: String,
  pub cluster_routes: Vec<String>,
  pub predastore_nodes: Vec<PredastoreNode>,
  pub nodes: BTreeMap<String, NodeSpec>,
}

impl ClusterConfig {
  pub fn local(&self) -> Result<&NodeSpec> {
    self
      .nodes
      .get(&self.local_node)
      .with_context(|| format!("local node {} missing from topology", self.local_node))
  }

  /// Node names the fan-out collectors expect a reply from
  pub fn expected_nodes(&self) -> Vec<String> {
    self.nodes.keys().cloned().collect()
  }

  pub fn exists<P: AsRef<Path>>(dir: P) -> bool {
    dir.as_ref().join(CONFIG_FILE).is_file()
  }

  pub fn read<P: AsRef<Path>>(dir: P) -> Result<Self> {
    let path = dir.as_ref().join(CONFIG_FILE);
    let contents =
      fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
  }

  pub fn write<P: AsRef<Path>>(&self, dir: P) -> Result<()> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join(CONFIG_FILE);
    let contents = toml::to_string_pretty(self)?;
    fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))
  }

  /// The typed settings handed to the local daemon (§ dynamic config)
  pub fn settings<P: AsRef<Path>>(&self, data_dir: P) -> Result<ConfigSettings> {
    let local = self.local()?;

    let remote_nodes = self
      .nodes
      .values()
      .filter(|node| node.name != self.local_node)
      .map(|node| RemoteNode {
        name: node.name.clone(),
        host: node.bind_ip,
        region: node.region.clone(),
        az: node.az.clone(),
        services: node.services.clone(),
      })
      .collect();

    Ok(ConfigSettings {
      access_key: local.access_key.clone(),
      secret_key: local.secret_key.clone(),
      account_id: PLATFORM_ACCOUNT_ID.to_owned(),
      region: self.region.clone(),
      nats_token: local.nats_token.clone(),
      data_dir: data_dir.as_ref().to_path_buf(),
      node: local.name.clone(),
      az: local.az.clone(),
      port: local.port,
      bind_ip: local.bind_ip,
      cluster_bind_ip: local.cluster_bind_ip,
      cluster_routes: self.cluster_routes.clone(),
      cluster_name: self.cluster_name.clone(),
      predastore_node_id: local.predastore_node_id,
      services: local.services.clone(),
      remote_nodes,
    })
  }
}

/// A peer as seen from the local node's settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteNode {
  pub name: String,
  pub host: IpAddr,
  pub region: String,
  pub az: String,
  pub services: Vec<ServiceTag>,
}

/// The enumerated runtime settings; there is no open-ended passthrough
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConfigSettings {
  pub access_key: String,
  pub secret_key: String,
  pub account_id: String,
  pub region: String,
  pub nats_token: String,
  pub data_dir: PathBuf,
  pub node: String,
  pub az: String,
  pub port: u16,
  pub bind_ip: IpAddr,
  pub cluster_bind_ip: IpAddr,
  pub cluster_routes: Vec<String>,
  pub cluster_name: String,
  pub predastore_node_id: u32,
  pub services: Vec<ServiceTag>,
  pub remote_nodes: Vec<RemoteNode>,
}

/// Persist the CA pair and the node's leaf next to hive.toml
///
/// Key files are tightened to owner-only before the secret bytes land.
pub fn write_trust_material<P: AsRef<Path>>(dir: P, trust: &TrustMaterial) -> Result<()> {
  let dir = dir.as_ref();
  fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

  write_pem(dir.join(CA_CERT_FILE), &trust.ca_cert_pem, 0o644)?;
  write_pem(dir.join(CA_KEY_FILE), &trust.ca_key_pem, 0o600)?;
  write_pem(dir.join(SERVER_CERT_FILE), &trust.server_cert_pem, 0o644)?;
  write_pem(dir.join(SERVER_KEY_FILE), &trust.server_key_pem, 0o600)?;

  Ok(())
}

fn write_pem(path: PathBuf, pem: &str, mode: u32) -> Result<()> {
  fs::write(&path, pem).with_context(|| format!("writing {}", path.display()))?;
  fs::set_permissions(&path, fs::Permissions::from_mode(mode))
    .with_context(|| format!("setting mode on {}", path.display()))
}

pub fn validate_port(port: u16) -> Result<()> {
  if port == 0 {
    bail!("port must be non-zero");
  }
  Ok(())
}

#[cfg(test)]
pub(crate) mod tests_support {
  use super::*;

  pub(crate) fn sample_node(name: &str, ip: &str, id: u32) -> NodeSpec {
    NodeSpec {
      name: name.to_owned(),
      bind_ip: ip.parse().unwrap(),
      cluster_bind_ip: ip.parse().unwrap(),
      region: "ap-southeast-2".to_owned(),
      az: "ap-southeast-2a".to_owned(),
      port: 4432,
      services: Vec::new(),
      access_key: "AKIA0000000000000000".to_owned(),
      secret_key: "secret".to_owned(),
      nats_token: "token".to_owned(),
      predastore_node_id: id,
      predastore: PredastoreConfig {
        host: format!("{ip}:8443"),
        bucket: "predastore".to_owned(),
        region: "ap-southeast-2".to_owned(),
        access_key: "AKIA0000000000000000".to_owned(),
        secret_key: "secret".to_owned(),
        base_dir: PathBuf::from("/var/lib/hive/predastore"),
      },
      awsgw: AwsGatewayConfig {
        tls_cert: PathBuf::from("/etc/hive/server.pem"),
        tls_key: PathBuf::from("/etc/hive/server.key"),
      },
      viperblock: ViperblockConfig {
        base_dir: PathBuf::from("/var/lib/hive/viperblock"),
        cache_size_mb: 1024,
      },
    }
  }

  pub(crate) fn sample_config() -> ClusterConfig {
    let mut nodes = BTreeMap::new();
    nodes.insert("node1".to_owned(), sample_node("node1", "10.0.0.1", 1));
    nodes.insert("node2".to_owned(), sample_node("node2", "10.0.0.2", 2));

    ClusterConfig {
      epoch: 1,
      version: env!("CARGO_PKG_VERSION").to_owned(),
      cluster_name: "hive".to_owned(),
      region: "ap-southeast-2".to_owned(),
      local_node: "node1".to_owned(),
      cluster_routes: vec!["10.0.0.1:4248".to_owned(), "10.0.0.2:4248".to_owned()],
      predastore_nodes: vec![
        PredastoreNode {
          id: 1,
          host: "10.0.0.1".parse().unwrap(),
        },
        PredastoreNode {
          id: 2,
          host: "10.0.0.2".parse().unwrap(),
        },
      ],
      nodes,
    }
  }
}
