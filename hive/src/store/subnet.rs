use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
  events, generate_id,
  ipam::usable_addresses,
  vpc::{extract_tags, parse_prefixed_net, VpcRecord},
  ApiError, ResourceStore, TagSpecification,
};
use crate::{
  bus::subject,
  kv::{get_json, to_bytes},
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetRecord {
  pub subnet_id: String,
  pub vpc_id: String,
  /// Normalized to the network address at create time
  pub cidr_block: String,
  pub availability_zone: String,
  pub state: String,
  pub is_default: bool,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

impl SubnetRecord {
  /// Host addresses this subnet can still hand out when empty
  pub fn available_ip_address_count(&self) -> i64 {
    self
      .cidr_block
      .parse::<ipnet::Ipv4Net>()
      .map(|net| usable_addresses(net.prefix_len()))
      .unwrap_or(0)
  }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubnetRequest {
  #[serde(default)]
  pub vpc_id: String,
  #[serde(default)]
  pub cidr_block: String,
  #[serde(default)]
  pub availability_zone: Option<String>,
  #[serde(default)]
  pub tag_specifications: Vec<TagSpecification>,
}

impl ResourceStore {
  pub async fn create_subnet(&self, request: &CreateSubnetRequest) -> Result<SubnetRecord, ApiError> {
    if request.vpc_id.is_empty() {
      return Err(ApiError::MissingParameter("VpcId"));
    }
    if request.cidr_block.is_empty() {
      return Err(ApiError::MissingParameter("CidrBlock"));
    }

    let vpc = get_json::<VpcRecord>(self.vpcs.as_ref(), &request.vpc_id)
      .await?
      .map(|(record, _)| record)
      .ok_or_else(|| ApiError::VpcNotFound(request.vpc_id.clone()))?;

    let tags = extract_tags(&request.tag_specifications, "subnet");
    self
      .create_subnet_record(
        &vpc,
        &request.cidr_block,
        request.availability_zone.clone(),
        false,
        tags,
      )
      .await
  }

  pub(crate) async fn create_subnet_record(
    &self,
    vpc: &VpcRecord,
    cidr_block: &str,
    availability_zone: Option<String>,
    is_default: bool,
    tags: BTreeMap<String, String>,
  ) -> Result<SubnetRecord, ApiError> {
    let net = parse_prefixed_net(cidr_block)
      .ok_or_else(|| ApiError::InvalidSubnetRange(cidr_block.to_owned()))?;

    let vpc_net = parse_prefixed_net(&vpc.cidr_block)
      .ok_or_else(|| ApiError::Internal(format!("vpc {} has a bad CIDR", vpc.vpc_id)))?;
    if !vpc_net.contains(&net.network()) {
      return Err(ApiError::InvalidSubnetRange(format!(
        "{} is outside the VPC range {}",
        net, vpc.cidr_block
      )));
    }

    for existing in self.list_subnets().await? {
      if existing.vpc_id != vpc.vpc_id {
        continue;
      }
      let Some(existing_net) = parse_prefixed_net(&existing.cidr_block) else {
        continue;
      };
      if net.contains(&existing_net.network()) || existing_net.contains(&net.network()) {
        return Err(ApiError::SubnetConflict(format!(
          "{} overlaps {} ({})",
          net, existing.cidr_block, existing.subnet_id
        )));
      }
    }

    let record = SubnetRecord {
      subnet_id: generate_id("subnet-"),
      vpc_id: vpc.vpc_id.clone(),
      cidr_block: net.to_string(),
      availability_zone: availability_zone.unwrap_or_else(|| self.az.clone()),
      state: "available".to_owned(),
      is_default,
      tags,
      created_at: Utc::now(),
    };

    let bytes = to_bytes(&record.subnet_id, &record)?;
    self.subnets.create(&record.subnet_id, bytes).await?;

    events::publish(
      self.bus.as_ref(),
      subject::VPC_CREATE_SUBNET,
      &events::SubnetCreated {
        subnet_id: record.subnet_id.clone(),
        vpc_id: record.vpc_id.clone(),
        cidr_block: record.cidr_block.clone(),
        availability_zone: record.availability_zone.clone(),
      },
    )
    .await;

    Ok(record)
  }

  /// ENI cleanup is the caller's responsibility; only existence is checked
  pub async fn delete_subnet(&self, subnet_id: &str) -> Result<(), ApiError> {
    if subnet_id.is_empty() {
      return Err(ApiError::MissingParameter("SubnetId"));
    }

    let subnet = self.get_subnet(subnet_id).await?;
    self.subnets.delete(subnet_id).await?;

    events::publish(
      self.bus.as_ref(),
      subject::VPC_DELETE_SUBNET,
      &events::SubnetDeleted {
        subnet_id: subnet.subnet_id,
        vpc_id: subnet.vpc_id,
      },
    )
    .await;

    Ok(())
  }

  pub async fn get_subnet(&self, subnet_id: &str) -> Result<SubnetRecord, ApiError> {
    get_json::<SubnetRecord>(self.subnets.as_ref(), subnet_id)
      .await?
      .map(|(record, _)| record)
      .ok_or_else(|| ApiError::SubnetNotFound(subnet_id.to_owned()))
  }

  pub async fn list_subnets(&self) -> Result<Vec<SubnetRecord>, ApiError> {
    let mut subnets = Vec::new();
    for key in self.subnets.keys().await? {
      if let Some((record, _)) = get_json::<SubnetRecord>(self.subnets.as_ref(), &key).await? {
        subnets.push(record);
      }
    }
    Ok(subnets)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::Bus;
  use crate::store::{testing::store, CreateVpcRequest};

  async fn vpc(store: &ResourceStore, cidr: &str) -> VpcRecord {
    store
      .create_vpc(&CreateVpcRequest {
        cidr_block: cidr.to_owned(),
        tag_specifications: Vec::new(),
      })
      .await
      .unwrap()
  }

  fn request(vpc_id: &str, cidr: &str) -> CreateSubnetRequest {
    CreateSubnetRequest {
      vpc_id: vpc_id.to_owned(),
      cidr_block: cidr.to_owned(),
      availability_zone: None,
      tag_specifications: Vec::new(),
    }
  }

  #[tokio::test]
  async fn it_creates_a_subnet_inside_the_vpc() {
    let (store, _bus) = store().await;
    let vpc = vpc(&store, "10.0.0.0/16").await;

    let subnet = store.create_subnet(&request(&vpc.vpc_id, "10.0.1.0/24")).await.unwrap();

    assert!(subnet.subnet_id.starts_with("subnet-"));
    assert_eq!(subnet.cidr_block, "10.0.1.0/24");
    assert_eq!(subnet.availability_zone, "ap-southeast-2a");
    assert_eq!(subnet.available_ip_address_count(), 251);
  }

  #[tokio::test]
  async fn it_rejects_subnets_outside_the_vpc_range() {
    let (store, _bus) = store().await;
    let vpc = vpc(&store, "10.0.0.0/16").await;

    let err = store
      .create_subnet(&request(&vpc.vpc_id, "192.168.0.0/24"))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidSubnet.Range");

    let err = store
      .create_subnet(&request(&vpc.vpc_id, "10.0.0.0/30"))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidSubnet.Range");
  }

  #[tokio::test]
  async fn it_rejects_overlapping_subnets_in_the_same_vpc() {
    let (store, _bus) = store().await;
    let vpc = vpc(&store, "10.0.0.0/16").await;

    store.create_subnet(&request(&vpc.vpc_id, "10.0.1.0/24")).await.unwrap();

    let err = store
      .create_subnet(&request(&vpc.vpc_id, "10.0.1.0/25"))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidSubnet.Conflict");

    let err = store
      .create_subnet(&request(&vpc.vpc_id, "10.0.0.0/20"))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidSubnet.Conflict");
  }

  #[tokio::test]
  async fn it_allows_the_same_range_in_another_vpc() {
    let (store, _bus) = store().await;
    let first = vpc(&store, "10.0.0.0/16").await;
    let second = vpc(&store, "10.0.0.0/16").await;

    store.create_subnet(&request(&first.vpc_id, "10.0.1.0/24")).await.unwrap();
    store.create_subnet(&request(&second.vpc_id, "10.0.1.0/24")).await.unwrap();
  }

  #[tokio::test]
  async fn it_rejects_unknown_vpcs_and_missing_parameters() {
    let (store, _bus) = store().await;

    let err = store
      .create_subnet(&request("vpc-00000000000000000", "10.0.1.0/24"))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidVpcID.NotFound");

    let err = store.create_subnet(&request("", "10.0.1.0/24")).await.unwrap_err();
    assert_eq!(err.code(), "MissingParameter");

    let err = store.create_subnet(&request("vpc-1", "")).await.unwrap_err();
    assert_eq!(err.code(), "MissingParameter");
  }

  #[tokio::test]
  async fn it_blocks_vpc_deletion_until_subnets_are_gone() {
    let (store, _bus) = store().await;
    let vpc = vpc(&store, "10.0.0.0/16").await;
    let subnet = store.create_subnet(&request(&vpc.vpc_id, "10.0.1.0/24")).await.unwrap();

    let err = store.delete_vpc(&vpc.vpc_id).await.unwrap_err();
    assert_eq!(err.code(), "DependencyViolation");

    store.delete_subnet(&subnet.subnet_id).await.unwrap();
    store.delete_vpc(&vpc.vpc_id).await.unwrap();
  }

  #[tokio::test]
  async fn it_publishes_subnet_lifecycle_events() {
    let (store, bus) = store().await;
    let mut created = bus.subscribe(crate::bus::subject::VPC_CREATE_SUBNET).await.unwrap();
    let mut deleted = bus.subscribe(crate::bus::subject::VPC_DELETE_SUBNET).await.unwrap();

    let vpc = vpc(&store, "10.0.0.0/16").await;
    let subnet = store.create_subnet(&request(&vpc.vpc_id, "10.0.1.0/24")).await.unwrap();

    let event: events::SubnetCreated =
      serde_json::from_slice(&created.next().await.unwrap().payload).unwrap();
    assert_eq!(event.subnet_id, subnet.subnet_id);
    assert_eq!(event.vpc_id, vpc.vpc_id);

    store.delete_subnet(&subnet.subnet_id).await.unwrap();
    let event: events::SubnetDeleted =
      serde_json::from_slice(&deleted.next().await.unwrap().payload).unwrap();
    assert_eq!(event.subnet_id, subnet.subnet_id);
  }

  #[tokio::test]
  async fn it_honors_an_explicit_availability_zone() {
    let (store, _bus) = store().await;
    let vpc = vpc(&store, "10.0.0.0/16").await;

    let mut request = request(&vpc.vpc_id, "10.0.1.0/24");
    request.availability_zone = Some("ap-southeast-2c".to_owned());

    let subnet = store.create_subnet(&request).await.unwrap();
    assert_eq!(subnet.availability_zone, "ap-southeast-2c");
  }
}
