use std::{collections::BTreeMap, sync::RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One VM hosted by this node
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInfo {
  #[serde(rename = "instanceID")]
  pub instance_id: String,
  pub status: String,
  pub instance_type: String,
  #[serde(rename = "vCPU")]
  pub vcpu: u32,
  #[serde(rename = "memoryGB")]
  pub memory_gb: u32,
  pub launch_time: DateTime<Utc>,
}

pub struct InstanceTypeSpec {
  pub name: &'static str,
  pub vcpu: u32,
  pub memory_gb: u32,
}

/// Instance types every node offers; availability is derived from the
/// node's remaining capacity at query time
pub const INSTANCE_TYPES: &[InstanceTypeSpec] = &[
  InstanceTypeSpec { name: "t3.small", vcpu: 2, memory_gb: 2 },
  InstanceTypeSpec { name: "t3.medium", vcpu: 2, memory_gb: 4 },
  InstanceTypeSpec { name: "t3.large", vcpu: 2, memory_gb: 8 },
  InstanceTypeSpec { name: "m5.large", vcpu: 2, memory_gb: 8 },
  InstanceTypeSpec { name: "m5.xlarge", vcpu: 4, memory_gb: 16 },
  InstanceTypeSpec { name: "m5.2xlarge", vcpu: 8, memory_gb: 32 },
  InstanceTypeSpec { name: "c5.large", vcpu: 2, memory_gb: 4 },
  InstanceTypeSpec { name: "c5.xlarge", vcpu: 4, memory_gb: 8 },
];

/// The VMs this node currently hosts
///
/// The hypervisor integration registers and deregisters entries; the daemon
/// reads them for fan-out responses and the drain phase.
#[derive(Default)]
pub struct VmRegistry {
  vms: RwLock<BTreeMap<String, VmInfo>>,
}

impl VmRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&self, vm: VmInfo) {
    let mut vms = self.vms.write().expect("vm registry poisoned");
    vms.insert(vm.instance_id.clone(), vm);
  }

  pub fn remove(&self, instance_id: &str) -> Option<VmInfo> {
    let mut vms = self.vms.write().expect("vm registry poisoned");
    vms.remove(instance_id)
  }

  pub fn list(&self) -> Vec<VmInfo> {
    let vms = self.vms.read().expect("vm registry poisoned");
    vms.values().cloned().collect()
  }

  pub fn instance_ids(&self) -> Vec<String> {
    let vms = self.vms.read().expect("vm registry poisoned");
    vms.keys().cloned().collect()
  }

  pub fn count(&self) -> usize {
    self.vms.read().expect("vm registry poisoned").len()
  }

  /// Total (vCPU, memory GiB) committed to hosted VMs
  pub fn allocated(&self) -> (u32, u32) {
    let vms = self.vms.read().expect("vm registry poisoned");
    vms
      .values()
      .fold((0, 0), |(vcpu, mem), vm| (vcpu + vm.vcpu, mem + vm.memory_gb))
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;

  pub(crate) fn vm(instance_id: &str, vcpu: u32, memory_gb: u32) -> VmInfo {
    VmInfo {
      instance_id: instance_id.to_owned(),
      status: "running".to_owned(),
      instance_type: "t3.medium".to_owned(),
      vcpu,
      memory_gb,
      launch_time: Utc::now(),
    }
  }

  #[test]
  fn it_tracks_registered_vms() {
    let registry = VmRegistry::new();
    registry.register(vm("i-0000000000000000a", 2, 4));
    registry.register(vm("i-0000000000000000b", 4, 16));

    assert_eq!(registry.count(), 2);
    assert_eq!(registry.allocated(), (6, 20));

    registry.remove("i-0000000000000000a");
    assert_eq!(registry.count(), 1);
    assert_eq!(registry.allocated(), (4, 16));
  }

  #[test]
  fn it_replaces_entries_by_instance_id() {
    let registry = VmRegistry::new();
    registry.register(vm("i-0000000000000000a", 2, 4));
    registry.register(vm("i-0000000000000000a", 4, 8));

    assert_eq!(registry.count(), 1);
    assert_eq!(registry.allocated(), (4, 8));
  }
}
