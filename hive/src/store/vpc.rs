use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::{events, generate_id, ApiError, ResourceStore, MAX_CAS_RETRIES};
use crate::{
  bus::subject,
  kv::{get_json, to_bytes},
};

/// Overlay network identifiers are assigned from this floor upward
pub const VNI_INITIAL: i64 = 100;
const VNI_KEY: &str = "counter";

pub const DEFAULT_VPC_CIDR: &str = "172.31.0.0/16";
pub const DEFAULT_SUBNET_CIDR: &str = "172.31.0.0/20";

const MIN_PREFIX_LEN: u8 = 16;
const MAX_PREFIX_LEN: u8 = 28;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcRecord {
  pub vpc_id: String,
  /// Normalized to the network address at create time
  pub cidr_block: String,
  pub state: String,
  pub is_default: bool,
  pub vni: i64,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

/// Tags scoped to one resource type; specs for other types are ignored
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagSpecification {
  pub resource_type: String,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateVpcRequest {
  #[serde(default)]
  pub cidr_block: String,
  #[serde(default)]
  pub tag_specifications: Vec<TagSpecification>,
}

pub(crate) fn extract_tags(
  specs: &[TagSpecification],
  resource_type: &str,
) -> BTreeMap<String, String> {
  specs
    .iter()
    .filter(|spec| spec.resource_type == resource_type)
    .flat_map(|spec| spec.tags.clone())
    .collect()
}

pub(crate) fn parse_prefixed_net(cidr: &str) -> Option<Ipv4Net> {
  let net: Ipv4Net = cidr.parse().ok()?;
  if !(MIN_PREFIX_LEN..=MAX_PREFIX_LEN).contains(&net.prefix_len()) {
    return None;
  }
  Some(net.trunc())
}

impl ResourceStore {
  pub async fn create_vpc(&self, request: &CreateVpcRequest) -> Result<VpcRecord, ApiError> {
    let tags = extract_tags(&request.tag_specifications, "vpc");
    self.create_vpc_record(&request.cidr_block, false, tags).await
  }

  pub(crate) async fn create_vpc_record(
    &self,
    cidr_block: &str,
    is_default: bool,
    tags: BTreeMap<String, String>,
  ) -> Result<VpcRecord, ApiError> {
    if cidr_block.is_empty() {
      return Err(ApiError::MissingParameter("CidrBlock"));
    }
    let net = parse_prefixed_net(cidr_block)
      .ok_or_else(|| ApiError::InvalidVpcRange(cidr_block.to_owned()))?;

    let vni = self.next_vni().await?;
    let record = VpcRecord {
      vpc_id: generate_id("vpc-"),
      cidr_block: net.to_string(),
      state: "available".to_owned(),
      is_default,
      vni,
      tags,
      created_at: Utc::now(),
    };

    let bytes = to_bytes(&record.vpc_id, &record)?;
    self.vpcs.create(&record.vpc_id, bytes).await?;

    events::publish(
      self.bus.as_ref(),
      subject::VPC_CREATE,
      &events::VpcCreated {
        vpc_id: record.vpc_id.clone(),
        cidr_block: record.cidr_block.clone(),
        vni: record.vni,
      },
    )
    .await;

    Ok(record)
  }

  pub async fn delete_vpc(&self, vpc_id: &str) -> Result<(), ApiError> {
    if vpc_id.is_empty() {
      return Err(ApiError::MissingParameter("VpcId"));
    }
    if get_json::<VpcRecord>(self.vpcs.as_ref(), vpc_id).await?.is_none() {
      return Err(ApiError::VpcNotFound(vpc_id.to_owned()));
    }

    let children: Vec<String> = self
      .list_subnets()
      .await?
      .into_iter()
      .filter(|subnet| subnet.vpc_id == vpc_id)
      .map(|subnet| subnet.subnet_id)
      .collect();
    if !children.is_empty() {
      return Err(ApiError::DependencyViolation {
        resource: vpc_id.to_owned(),
        detail: format!("subnets still exist: {}", children.join(", ")),
      });
    }

    self.vpcs.delete(vpc_id).await?;

    events::publish(
      self.bus.as_ref(),
      subject::VPC_DELETE,
      &events::VpcDeleted {
        vpc_id: vpc_id.to_owned(),
      },
    )
    .await;

    Ok(())
  }

  pub async fn get_vpc(&self, vpc_id: &str) -> Result<VpcRecord, ApiError> {
    get_json::<VpcRecord>(self.vpcs.as_ref(), vpc_id)
      .await?
      .map(|(record, _)| record)
      .ok_or_else(|| ApiError::VpcNotFound(vpc_id.to_owned()))
  }

  pub async fn list_vpcs(&self) -> Result<Vec<VpcRecord>, ApiError> {
    let mut vpcs = Vec::new();
    for key in self.vpcs.keys().await? {
      if let Some((record, _)) = get_json::<VpcRecord>(self.vpcs.as_ref(), &key).await? {
        vpcs.push(record);
      }
    }
    Ok(vpcs)
  }

  /// Provision the default VPC and subnet once; safe to call repeatedly
  pub async fn ensure_default_vpc(&self) -> Result<(), ApiError> {
    if self.list_vpcs().await?.iter().any(|vpc| vpc.is_default) {
      return Ok(());
    }

    let vpc = self
      .create_vpc_record(DEFAULT_VPC_CIDR, true, BTreeMap::new())
      .await?;
    self
      .create_subnet_record(&vpc, DEFAULT_SUBNET_CIDR, None, true, BTreeMap::new())
      .await?;

    Ok(())
  }

  /// Atomically take the next overlay network identifier
  async fn next_vni(&self) -> Result<i64, ApiError> {
    for _ in 0..MAX_CAS_RETRIES {
      match get_json::<i64>(self.vni.as_ref(), VNI_KEY).await? {
        None => {
          let bytes = to_bytes(VNI_KEY, &VNI_INITIAL)?;
          match self.vni.create(VNI_KEY, bytes).await {
            Ok(_) => return Ok(VNI_INITIAL),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
          }
        }
        Some((value, revision)) => {
          let next = value + 1;
          let bytes = to_bytes(VNI_KEY, &next)?;
          match self.vni.update(VNI_KEY, bytes, revision).await {
            Ok(_) => return Ok(next),
            Err(err) if err.is_conflict() => continue,
            Err(err) => return Err(err.into()),
          }
        }
      }
    }

    Err(ApiError::Transient(format!(
      "vni allocation lost {MAX_CAS_RETRIES} races"
    )))
  }
}
