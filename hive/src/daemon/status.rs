use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::vm::{VmInfo, VmRegistry, INSTANCE_TYPES};
use crate::config::{ConfigSettings, ServiceTag};

pub const NODE_READY: &str = "Ready";
pub const NODE_NOT_READY: &str = "NotReady";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceTypeCapacity {
  pub name: String,
  pub vcpu: u32,
  #[serde(rename = "memoryGB")]
  pub memory_gb: u32,
  /// How many more of this type the node could host right now
  pub available: u32,
}

/// One node's answer to a `hive.node.status` fan-out
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatusResponse {
  pub node: String,
  pub status: String,
  pub host: String,
  pub region: String,
  pub az: String,
  pub uptime_sec: u64,
  pub vm_count: usize,
  #[serde(default)]
  pub services: Vec<ServiceTag>,
  #[serde(rename = "allocVCPU")]
  pub alloc_vcpu: u32,
  #[serde(rename = "totalVCPU")]
  pub total_vcpu: u32,
  #[serde(rename = "allocMemGB")]
  pub alloc_mem_gb: u32,
  #[serde(rename = "totalMemGB")]
  pub total_mem_gb: u32,
  #[serde(default)]
  pub instance_types: Vec<InstanceTypeCapacity>,
}

impl NodeStatusResponse {
  /// Placeholder for a node that did not reply before the deadline
  pub fn not_ready(node: &str) -> Self {
    Self {
      node: node.to_owned(),
      status: NODE_NOT_READY.to_owned(),
      host: String::new(),
      region: String::new(),
      az: String::new(),
      uptime_sec: 0,
      vm_count: 0,
      services: Vec::new(),
      alloc_vcpu: 0,
      total_vcpu: 0,
      alloc_mem_gb: 0,
      total_mem_gb: 0,
      instance_types: Vec::new(),
    }
  }
}

/// One node's answer to a `hive.node.vms` fan-out
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeVMsResponse {
  pub node: String,
  pub host: String,
  #[serde(default)]
  pub vms: Vec<VmInfo>,
}

pub(crate) fn build_status(
  settings: &ConfigSettings,
  vms: &VmRegistry,
  uptime: Duration,
) -> NodeStatusResponse {
  let (alloc_vcpu, alloc_mem_gb) = vms.allocated();
  let total_vcpu = num_cpus::get() as u32;
  let total_mem_gb = total_memory_gb();

  let free_vcpu = total_vcpu.saturating_sub(alloc_vcpu);
  let free_mem_gb = total_mem_gb.saturating_sub(alloc_mem_gb);

  let instance_types = INSTANCE_TYPES
    .iter()
    .map(|spec| InstanceTypeCapacity {
      name: spec.name.to_owned(),
      vcpu: spec.vcpu,
      memory_gb: spec.memory_gb,
      available: (free_vcpu / spec.vcpu).min(free_mem_gb / spec.memory_gb),
    })
    .collect();

  NodeStatusResponse {
    node: settings.node.clone(),
    status: NODE_READY.to_owned(),
    host: settings.bind_ip.to_string(),
    region: settings.region.clone(),
    az: settings.az.clone(),
    uptime_sec: uptime.as_secs(),
    vm_count: vms.count(),
    services: settings.services.clone(),
    alloc_vcpu,
    total_vcpu,
    alloc_mem_gb,
    total_mem_gb,
    instance_types,
  }
}

/// MemTotal from /proc/meminfo, in whole GiB
fn total_memory_gb() -> u32 {
  let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
    return 0;
  };

  for line in contents.lines() {
    if let Some(rest) = line.strip_prefix("MemTotal:") {
      let kb: u64 = rest
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .unwrap_or(0);
      return (kb / 1024 / 1024) as u32;
    }
  }

  0
}
