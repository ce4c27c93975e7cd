pub mod client;
pub mod server;

use std::{net::IpAddr, path::Path};

use anyhow::{bail, Result};
use rand::{distributions::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};

use crate::config::{
  AwsGatewayConfig, ClusterConfig, NodeSpec, PredastoreConfig, PredastoreNode, ServiceTag,
  ViperblockConfig, CLUSTER_ROUTE_PORT, PLATFORM_ACCOUNT_ID, SERVER_CERT_FILE, SERVER_KEY_FILE,
};

/// Port the S3-compatible persistence tier serves on
const PREDASTORE_PORT: u16 = 8443;
const PREDASTORE_BUCKET: &str = "predastore";

/// Credentials shared across the cluster, generated once by the initiator
/// and distributed through the formation status response
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedCredentials {
  pub access_key: String,
  pub secret_key: String,
  pub account_id: String,
  pub nats_token: String,
  pub cluster_name: String,
  pub region: String,
}

impl SharedCredentials {
  pub fn generate(cluster_name: &str, region: &str) -> Self {
    let mut rng = rand::thread_rng();

    let access_suffix: String = (0..16)
      .map(|_| char::from(rng.sample(Alphanumeric)).to_ascii_uppercase())
      .collect();
    let secret_key: String = (0..40).map(|_| char::from(rng.sample(Alphanumeric))).collect();
    let nats_token: String = (0..32)
      .map(|_| char::from_digit(rng.gen_range(0..16), 16).unwrap())
      .collect();

    Self {
      access_key: format!("AKIA{access_suffix}"),
      secret_key,
      account_id: PLATFORM_ACCOUNT_ID.to_owned(),
      nats_token,
      cluster_name: cluster_name.to_owned(),
      region: region.to_owned(),
    }
  }
}

/// What a node declares about itself when registering
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
  pub name: String,
  pub bind_ip: IpAddr,
  pub cluster_ip: IpAddr,
  pub region: String,
  pub az: String,
  pub port: u16,
  #[serde(default)]
  pub services: Vec<ServiceTag>,
}

impl NodeInfo {
  pub fn runs(&self, tag: ServiceTag) -> bool {
    self.services.is_empty() || self.services.contains(&tag)
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
  pub node_info: NodeInfo,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
  pub success: bool,
  pub joined: usize,
  pub expected: usize,
  #[serde(default)]
  pub message: String,
}

/// Formation status; the roster preserves registration order because the
/// predastore ring is numbered by it. Credentials and CA material are only
/// populated once `complete` is true.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
  pub complete: bool,
  pub joined: usize,
  pub expected: usize,
  pub nodes: Vec<NodeInfo>,
  pub credentials: Option<SharedCredentials>,
  #[serde(default)]
  pub ca_cert: String,
  #[serde(default)]
  pub ca_key: String,
}

/// Bus routes, one per bus-hosting node, sorted by node name
pub fn cluster_routes(roster: &[NodeInfo]) -> Vec<String> {
  let mut hosts: Vec<&NodeInfo> = roster
    .iter()
    .filter(|node| node.runs(ServiceTag::Nats))
    .collect();
  hosts.sort_by(|a, b| a.name.cmp(&b.name));

  hosts
    .iter()
    .map(|node| format!("{}:{}", node.bind_ip, CLUSTER_ROUTE_PORT))
    .collect()
}

/// The predastore ring in registration order, numbered from 1
pub fn predastore_ring(roster: &[NodeInfo]) -> Vec<PredastoreNode> {
  roster
    .iter()
    .filter(|node| node.runs(ServiceTag::Predastore))
    .enumerate()
    .map(|(idx, node)| PredastoreNode {
      id: idx as u32 + 1,
      host: node.bind_ip,
    })
    .collect()
}

/// Build the final cluster configuration every node persists
///
/// The result is identical on all nodes apart from `local_node`; membership
/// in the predastore ring was declared once at init time and a multi-node
/// ring smaller than three members is a fatal layout error.
pub fn materialize_config(
  roster: &[NodeInfo],
  credentials: &SharedCredentials,
  local_node: &str,
  config_dir: &Path,
) -> Result<ClusterConfig> {
  let ring = predastore_ring(roster);
  if ring.len() > 1 && ring.len() < 3 {
    bail!(
      "a multi-node predastore layout requires at least 3 nodes, found {}",
      ring.len()
    );
  }
  if !roster.iter().any(|node| node.name == local_node) {
    bail!("local node {local_node} missing from the formation roster");
  }

  let nodes = roster
    .iter()
    .map(|node| {
      let predastore_node_id = ring
        .iter()
        .find(|member| member.host == node.bind_ip)
        .map(|member| member.id)
        .unwrap_or(0);

      let spec = NodeSpec {
        name: node.name.clone(),
        bind_ip: node.bind_ip,
        cluster_bind_ip: node.cluster_ip,
        region: node.region.clone(),
        az: node.az.clone(),
        port: node.port,
        services: node.services.clone(),
        access_key: credentials.access_key.clone(),
        secret_key: credentials.secret_key.clone(),
        nats_token: credentials.nats_token.clone(),
        predastore_node_id,
        predastore: PredastoreConfig {
          host: format!("{}:{PREDASTORE_PORT}", node.bind_ip),
          bucket: PREDASTORE_BUCKET.to_owned(),
          region: credentials.region.clone(),
          access_key: credentials.access_key.clone(),
          secret_key: credentials.secret_key.clone(),
          base_dir: "/var/lib/hive/predastore".into(),
        },
        awsgw: AwsGatewayConfig {
          tls_cert: config_dir.join(SERVER_CERT_FILE),
          tls_key: config_dir.join(SERVER_KEY_FILE),
        },
        viperblock: ViperblockConfig {
          base_dir: "/var/lib/hive/viperblock".into(),
          cache_size_mb: 1024,
        },
      };

      (node.name.clone(), spec)
    })
    .collect();

  Ok(ClusterConfig {
    epoch: 1,
    version: env!("CARGO_PKG_VERSION").to_owned(),
    cluster_name: credentials.cluster_name.clone(),
    region: credentials.region.clone(),
    local_node: local_node.to_owned(),
    cluster_routes: cluster_routes(roster),
    predastore_nodes: ring,
    nodes,
  })
}
