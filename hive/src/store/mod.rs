mod eni;
mod error;
pub mod events;
mod ipam;
mod subnet;
mod vpc;

use std::sync::Arc;

use rand::Rng;

pub use eni::{AttachNetworkInterfaceRequest, CreateNetworkInterfaceRequest, EniRecord, EniStatus};
pub use error::ApiError;
pub use ipam::{usable_addresses, IpamRecord};
pub use subnet::{CreateSubnetRequest, SubnetRecord};
pub use vpc::{CreateVpcRequest, TagSpecification, VpcRecord};

use crate::{
  bus::Bus,
  kv::{BucketConfig, KvBucket, KvStore},
};

pub const VPC_BUCKET: BucketConfig = BucketConfig {
  name: "hive-vpc-vpcs",
  history: 10,
};
pub const SUBNET_BUCKET: BucketConfig = BucketConfig {
  name: "hive-vpc-subnets",
  history: 10,
};
pub const ENI_BUCKET: BucketConfig = BucketConfig {
  name: "hive-vpc-enis",
  history: 10,
};
pub const IPAM_BUCKET: BucketConfig = BucketConfig {
  name: "hive-vpc-ipam",
  history: 5,
};
pub const VNI_BUCKET: BucketConfig = BucketConfig {
  name: "hive-vpc-vni-counter",
  history: 1,
};
pub const CLUSTER_STATE_BUCKET: BucketConfig = BucketConfig {
  name: "hive-cluster-state",
  history: 1,
};

/// Writers re-read and retry this many times before giving up with a
/// transient error
pub(crate) const MAX_CAS_RETRIES: usize = 5;

/// Replicated VPC/subnet/ENI state, keyed by resource ID
///
/// All writes go through revision-based compare-and-swap on the cluster KV,
/// so any node may run any operation concurrently with its peers. Lifecycle
/// events are published only after the authoritative KV write succeeds.
pub struct ResourceStore {
  pub(crate) vpcs: Arc<dyn KvBucket>,
  pub(crate) subnets: Arc<dyn KvBucket>,
  pub(crate) enis: Arc<dyn KvBucket>,
  pub(crate) ipam: Arc<dyn KvBucket>,
  pub(crate) vni: Arc<dyn KvBucket>,
  pub(crate) bus: Arc<dyn Bus>,
  pub(crate) az: String,
}

impl ResourceStore {
  /// Open the named buckets, creating them lazily on first use
  pub async fn open(kv: &dyn KvStore, bus: Arc<dyn Bus>, az: &str) -> Result<Self, ApiError> {
    Ok(Self {
      vpcs: kv.bucket(&VPC_BUCKET).await?,
      subnets: kv.bucket(&SUBNET_BUCKET).await?,
      enis: kv.bucket(&ENI_BUCKET).await?,
      ipam: kv.bucket(&IPAM_BUCKET).await?,
      vni: kv.bucket(&VNI_BUCKET).await?,
      bus,
      az: az.to_owned(),
    })
  }
}

/// EC2-style resource ID: prefix plus 17 lowercase hex characters
pub(crate) fn generate_id(prefix: &str) -> String {
  let value: u128 = rand::thread_rng().gen();
  format!("{prefix}{:017x}", value & 0xf_ffff_ffff_ffff_ffff)
}
