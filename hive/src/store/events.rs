//! Lifecycle events broadcast after a successful KV write
//!
//! Delivery is best-effort and subscribers must be idempotent; a failed
//! publish is logged and never fails the operation that produced it.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::bus::Bus;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcCreated {
  pub vpc_id: String,
  pub cidr_block: String,
  pub vni: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VpcDeleted {
  pub vpc_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetCreated {
  pub subnet_id: String,
  pub vpc_id: String,
  pub cidr_block: String,
  pub availability_zone: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetDeleted {
  pub subnet_id: String,
  pub vpc_id: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortCreated {
  pub eni_id: String,
  pub subnet_id: String,
  pub vpc_id: String,
  pub private_ip_address: String,
  pub mac_address: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDeleted {
  pub eni_id: String,
  pub subnet_id: String,
}

pub(crate) async fn publish<T: Serialize>(bus: &dyn Bus, subject: &str, event: &T) {
  let payload = match serde_json::to_vec(event) {
    Ok(payload) => payload,
    Err(err) => {
      warn!("failed to encode {subject} event: {err}");
      return;
    }
  };

  if let Err(err) = bus.publish(subject, payload).await {
    warn!("failed to publish {subject} event: {err}");
  }
}
