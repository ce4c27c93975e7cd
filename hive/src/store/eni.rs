use std::{collections::BTreeMap, net::Ipv4Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{
  events, generate_id,
  vpc::{extract_tags, parse_prefixed_net},
  ApiError, ResourceStore, TagSpecification, MAX_CAS_RETRIES,
};
use crate::{
  bus::subject,
  kv::{get_json, to_bytes},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EniStatus {
  Available,
  InUse,
  Attaching,
  Detaching,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EniRecord {
  pub eni_id: String,
  pub subnet_id: String,
  pub vpc_id: String,
  pub availability_zone: String,
  pub private_ip_address: String,
  pub mac_address: String,
  #[serde(default)]
  pub description: String,
  pub status: EniStatus,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub attachment_id: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub instance_id: String,
  #[serde(default)]
  pub device_index: i32,
  #[serde(default)]
  pub tags: BTreeMap<String, String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNetworkInterfaceRequest {
  #[serde(default)]
  pub subnet_id: String,
  #[serde(default)]
  pub description: String,
  #[serde(default)]
  pub private_ip_address: Option<String>,
  #[serde(default)]
  pub tag_specifications: Vec<TagSpecification>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachNetworkInterfaceRequest {
  #[serde(default)]
  pub network_interface_id: String,
  #[serde(default)]
  pub instance_id: String,
  #[serde(default)]
  pub device_index: i32,
}

/// Locally-administered unicast MAC, derived deterministically from the
/// interface ID so a rebuilt record always carries the same address
pub fn derive_mac(eni_id: &str) -> String {
  let mut hash: u32 = 0;
  for byte in eni_id.bytes() {
    hash = hash.wrapping_mul(31).wrapping_add(u32::from(byte));
  }

  format!(
    "02:00:00:{:02x}:{:02x}:{:02x}",
    (hash >> 16) as u8,
    (hash >> 8) as u8,
    hash as u8
  )
}

impl ResourceStore {
  pub async fn create_network_interface(
    &self,
    request: &CreateNetworkInterfaceRequest,
  ) -> Result<EniRecord, ApiError> {
    if request.subnet_id.is_empty() {
      return Err(ApiError::MissingParameter("SubnetId"));
    }

    let subnet = self.get_subnet(&request.subnet_id).await?;

    let private_ip = match &request.private_ip_address {
      Some(supplied) => {
        let ip: Ipv4Addr = supplied
          .parse()
          .map_err(|_| ApiError::InvalidParameterValue(format!("bad address {supplied}")))?;
        let net = parse_prefixed_net(&subnet.cidr_block)
          .ok_or_else(|| ApiError::Internal(format!("subnet {} has a bad CIDR", subnet.subnet_id)))?;
        if !net.contains(&ip) {
          return Err(ApiError::InvalidParameterValue(format!(
            "{ip} is outside subnet range {}",
            subnet.cidr_block
          )));
        }
        self.reserve_ip(&subnet.subnet_id, &subnet.cidr_block, &ip).await?;
        ip
      }
      None => self.allocate_ip(&subnet.subnet_id, &subnet.cidr_block).await?,
    };

    let eni_id = generate_id("eni-");
    let record = EniRecord {
      mac_address: derive_mac(&eni_id),
      eni_id,
      subnet_id: subnet.subnet_id.clone(),
      vpc_id: subnet.vpc_id.clone(),
      availability_zone: subnet.availability_zone.clone(),
      private_ip_address: private_ip.to_string(),
      description: request.description.clone(),
      status: EniStatus::Available,
      attachment_id: String::new(),
      instance_id: String::new(),
      device_index: 0,
      tags: extract_tags(&request.tag_specifications, "network-interface"),
      created_at: Utc::now(),
    };

    let bytes = to_bytes(&record.eni_id, &record)?;
    self.enis.create(&record.eni_id, bytes).await?;

    events::publish(
      self.bus.as_ref(),
      subject::VPC_CREATE_PORT,
      &events::PortCreated {
        eni_id: record.eni_id.clone(),
        subnet_id: record.subnet_id.clone(),
        vpc_id: record.vpc_id.clone(),
        private_ip_address: record.private_ip_address.clone(),
        mac_address: record.mac_address.clone(),
      },
    )
    .await;

    Ok(record)
  }

  pub async fn delete_network_interface(&self, eni_id: &str) -> Result<(), ApiError> {
    if eni_id.is_empty() {
      return Err(ApiError::MissingParameter("NetworkInterfaceId"));
    }

    let eni = self.get_network_interface(eni_id).await?;
    if eni.status == EniStatus::InUse {
      return Err(ApiError::EniInUse(eni_id.to_owned()));
    }

    // Deletion must not block on IPAM bookkeeping
    if let Err(err) = self.release_ip(&eni.subnet_id, &eni.private_ip_address).await {
      warn!(
        "failed to release {} in {} while deleting {eni_id}: {err}",
        eni.private_ip_address, eni.subnet_id
      );
    }

    self.enis.delete(eni_id).await?;

    events::publish(
      self.bus.as_ref(),
      subject::VPC_DELETE_PORT,
      &events::PortDeleted {
        eni_id: eni.eni_id,
        subnet_id: eni.subnet_id,
      },
    )
    .await;

    Ok(())
  }

  /// Returns the attachment ID
  pub async fn attach_network_interface(
    &self,
    request: &AttachNetworkInterfaceRequest,
  ) -> Result<String, ApiError> {
    if request.network_interface_id.is_empty() {
      return Err(ApiError::MissingParameter("NetworkInterfaceId"));
    }
    if request.instance_id.is_empty() {
      return Err(ApiError::MissingParameter("InstanceId"));
    }

    for _ in 0..MAX_CAS_RETRIES {
      let Some((mut eni, revision)) =
        get_json::<EniRecord>(self.enis.as_ref(), &request.network_interface_id).await?
      else {
        return Err(ApiError::EniNotFound(request.network_interface_id.clone()));
      };

      if eni.status == EniStatus::InUse {
        return Err(ApiError::EniInUse(eni.eni_id));
      }

      eni.status = EniStatus::InUse;
      eni.attachment_id = generate_id("eni-attach-");
      eni.instance_id = request.instance_id.clone();
      eni.device_index = request.device_index;

      let attachment_id = eni.attachment_id.clone();
      let bytes = to_bytes(&eni.eni_id, &eni)?;
      match self.enis.update(&eni.eni_id, bytes, revision).await {
        Ok(_) => return Ok(attachment_id),
        Err(err) if err.is_conflict() => continue,
        Err(err) => return Err(err.into()),
      }
    }

    Err(ApiError::Transient(format!(
      "attach of {} lost {MAX_CAS_RETRIES} races",
      request.network_interface_id
    )))
  }

  pub async fn detach_network_interface(&self, eni_id: &str) -> Result<(), ApiError> {
    if eni_id.is_empty() {
      return Err(ApiError::MissingParameter("NetworkInterfaceId"));
    }

    for _ in 0..MAX_CAS_RETRIES {
      let Some((mut eni, revision)) = get_json::<EniRecord>(self.enis.as_ref(), eni_id).await?
      else {
        return Err(ApiError::EniNotFound(eni_id.to_owned()));
      };

      if eni.status != EniStatus::InUse {
        return Err(ApiError::InvalidParameterValue(format!(
          "network interface {eni_id} is not attached"
        )));
      }

      eni.status = EniStatus::Available;
      eni.attachment_id = String::new();
      eni.instance_id = String::new();
      eni.device_index = 0;

      let bytes = to_bytes(&eni.eni_id, &eni)?;
      match self.enis.update(&eni.eni_id, bytes, revision).await {
        Ok(_) => return Ok(()),
        Err(err) if err.is_conflict() => continue,
        Err(err) => return Err(err.into()),
      }
    }

    Err(ApiError::Transient(format!(
      "detach of {eni_id} lost {MAX_CAS_RETRIES} races"
    )))
  }

  pub async fn get_network_interface(&self, eni_id: &str) -> Result<EniRecord, ApiError> {
    get_json::<EniRecord>(self.enis.as_ref(), eni_id)
      .await?
      .map(|(record, _)| record)
      .ok_or_else(|| ApiError::EniNotFound(eni_id.to_owned()))
  }

  pub async fn list_network_interfaces(&self) -> Result<Vec<EniRecord>, ApiError> {
    let mut enis = Vec::new();
    for key in self.enis.keys().await? {
      if let Some((record, _)) = get_json::<EniRecord>(self.enis.as_ref(), &key).await? {
        enis.push(record);
      }
    }
    Ok(enis)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bus::Bus;
  use crate::store::{testing::store, CreateSubnetRequest, CreateVpcRequest};

  async fn subnet(store: &ResourceStore) -> String {
    let vpc = store
      .create_vpc(&CreateVpcRequest {
        cidr_block: "10.0.0.0/16".to_owned(),
        tag_specifications: Vec::new(),
      })
      .await
      .unwrap();

    store
      .create_subnet(&CreateSubnetRequest {
        vpc_id: vpc.vpc_id,
        cidr_block: "10.0.1.0/24".to_owned(),
        availability_zone: None,
        tag_specifications: Vec::new(),
      })
      .await
      .unwrap()
      .subnet_id
  }

  fn request(subnet_id: &str) -> CreateNetworkInterfaceRequest {
    CreateNetworkInterfaceRequest {
      subnet_id: subnet_id.to_owned(),
      ..CreateNetworkInterfaceRequest::default()
    }
  }

  #[test]
  fn it_derives_stable_local_macs() {
    let mac = derive_mac("eni-0123456789abcdef0");

    assert_eq!(mac, derive_mac("eni-0123456789abcdef0"));
    assert!(mac.starts_with("02:00:00:"));
    assert_ne!(mac, derive_mac("eni-0123456789abcdef1"));
  }

  #[tokio::test]
  async fn it_creates_an_interface_with_an_ipam_address() {
    let (store, bus) = store().await;
    let mut created = bus.subscribe(subject::VPC_CREATE_PORT).await.unwrap();
    let subnet_id = subnet(&store).await;

    let eni = store.create_network_interface(&request(&subnet_id)).await.unwrap();

    assert!(eni.eni_id.starts_with("eni-"));
    assert_eq!(eni.private_ip_address, "10.0.1.4");
    assert_eq!(eni.mac_address, derive_mac(&eni.eni_id));
    assert_eq!(eni.status, EniStatus::Available);

    let event: events::PortCreated =
      serde_json::from_slice(&created.next().await.unwrap().payload).unwrap();
    assert_eq!(event.eni_id, eni.eni_id);
    assert_eq!(event.private_ip_address, "10.0.1.4");

    assert_eq!(
      store.allocated_ips(&subnet_id).await.unwrap(),
      vec!["10.0.1.4".to_string()]
    );
  }

  #[tokio::test]
  async fn it_validates_caller_supplied_addresses() {
    let (store, _bus) = store().await;
    let subnet_id = subnet(&store).await;

    let mut with_ip = request(&subnet_id);
    with_ip.private_ip_address = Some("10.0.1.25".to_owned());
    let eni = store.create_network_interface(&with_ip).await.unwrap();
    assert_eq!(eni.private_ip_address, "10.0.1.25");

    let mut duplicate = request(&subnet_id);
    duplicate.private_ip_address = Some("10.0.1.25".to_owned());
    let err = store.create_network_interface(&duplicate).await.unwrap_err();
    assert_eq!(err.code(), "InvalidIPAddress.InUse");

    let mut outside = request(&subnet_id);
    outside.private_ip_address = Some("10.0.2.25".to_owned());
    let err = store.create_network_interface(&outside).await.unwrap_err();
    assert_eq!(err.code(), "InvalidParameterValue");
  }

  #[tokio::test]
  async fn it_rejects_unknown_subnets() {
    let (store, _bus) = store().await;

    let err = store
      .create_network_interface(&request("subnet-00000000000000000"))
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidSubnetID.NotFound");

    let err = store.create_network_interface(&request("")).await.unwrap_err();
    assert_eq!(err.code(), "MissingParameter");
  }

  #[tokio::test]
  async fn it_releases_the_address_on_delete() {
    let (store, bus) = store().await;
    let mut deleted = bus.subscribe(subject::VPC_DELETE_PORT).await.unwrap();
    let subnet_id = subnet(&store).await;

    let first = store.create_network_interface(&request(&subnet_id)).await.unwrap();
    assert_eq!(first.private_ip_address, "10.0.1.4");

    store.delete_network_interface(&first.eni_id).await.unwrap();
    let event: events::PortDeleted =
      serde_json::from_slice(&deleted.next().await.unwrap().payload).unwrap();
    assert_eq!(event.eni_id, first.eni_id);

    // The released address is handed out again
    let second = store.create_network_interface(&request(&subnet_id)).await.unwrap();
    assert_eq!(second.private_ip_address, "10.0.1.4");
  }

  #[tokio::test]
  async fn it_refuses_to_delete_attached_interfaces() {
    let (store, _bus) = store().await;
    let subnet_id = subnet(&store).await;
    let eni = store.create_network_interface(&request(&subnet_id)).await.unwrap();

    store
      .attach_network_interface(&AttachNetworkInterfaceRequest {
        network_interface_id: eni.eni_id.clone(),
        instance_id: "i-0123456789abcdef0".to_owned(),
        device_index: 0,
      })
      .await
      .unwrap();

    let err = store.delete_network_interface(&eni.eni_id).await.unwrap_err();
    assert_eq!(err.code(), "InvalidNetworkInterface.InUse");
  }

  #[tokio::test]
  async fn it_attaches_and_detaches() {
    let (store, _bus) = store().await;
    let subnet_id = subnet(&store).await;
    let eni = store.create_network_interface(&request(&subnet_id)).await.unwrap();

    let attachment_id = store
      .attach_network_interface(&AttachNetworkInterfaceRequest {
        network_interface_id: eni.eni_id.clone(),
        instance_id: "i-0123456789abcdef0".to_owned(),
        device_index: 1,
      })
      .await
      .unwrap();
    assert!(attachment_id.starts_with("eni-attach-"));

    let attached = store.get_network_interface(&eni.eni_id).await.unwrap();
    assert_eq!(attached.status, EniStatus::InUse);
    assert_eq!(attached.instance_id, "i-0123456789abcdef0");
    assert_eq!(attached.device_index, 1);
    assert_eq!(attached.attachment_id, attachment_id);

    // A second attach must lose
    let err = store
      .attach_network_interface(&AttachNetworkInterfaceRequest {
        network_interface_id: eni.eni_id.clone(),
        instance_id: "i-0fedcba9876543210".to_owned(),
        device_index: 0,
      })
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidNetworkInterface.InUse");

    store.detach_network_interface(&eni.eni_id).await.unwrap();
    let detached = store.get_network_interface(&eni.eni_id).await.unwrap();
    assert_eq!(detached.status, EniStatus::Available);
    assert!(detached.attachment_id.is_empty());
    assert!(detached.instance_id.is_empty());
  }

  #[tokio::test]
  async fn it_surfaces_not_found_for_unknown_interfaces() {
    let (store, _bus) = store().await;

    let err = store
      .attach_network_interface(&AttachNetworkInterfaceRequest {
        network_interface_id: "eni-00000000000000000".to_owned(),
        instance_id: "i-0123456789abcdef0".to_owned(),
        device_index: 0,
      })
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidNetworkInterfaceID.NotFound");

    let err = store
      .detach_network_interface("eni-00000000000000000")
      .await
      .unwrap_err();
    assert_eq!(err.code(), "InvalidNetworkInterfaceID.NotFound");
  }
}
