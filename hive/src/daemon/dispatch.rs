use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use crate::store::{
  ApiError, AttachNetworkInterfaceRequest, CreateNetworkInterfaceRequest, CreateSubnetRequest,
  CreateVpcRequest, ResourceStore,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorBody {
  pub code: String,
  pub message: String,
}

/// Error reply on an `ec2.<Action>` request
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
  pub error: ApiErrorBody,
}

impl ErrorEnvelope {
  pub fn new(code: &str, message: String) -> Self {
    Self {
      error: ApiErrorBody {
        code: code.to_owned(),
        message,
      },
    }
  }
}

impl From<&ApiError> for ErrorEnvelope {
  fn from(err: &ApiError) -> Self {
    Self::new(err.code(), err.to_string())
  }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteVpcRequest {
  #[serde(default)]
  vpc_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteSubnetRequest {
  #[serde(default)]
  subnet_id: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkInterfaceIdRequest {
  #[serde(default)]
  network_interface_id: String,
}

fn parse<T: DeserializeOwned + Default>(payload: &[u8]) -> Result<T, ApiError> {
  if payload.is_empty() {
    return Ok(T::default());
  }
  serde_json::from_slice(payload)
    .map_err(|err| ApiError::InvalidParameterValue(format!("malformed request: {err}")))
}

/// Run one API action against the resource store
///
/// This is the dispatch contract of the gateway translation layer: the
/// action name comes from the `ec2.<Action>` subject and both payloads are
/// JSON records.
pub async fn execute(store: &ResourceStore, action: &str, payload: &[u8]) -> Result<Value, ApiError> {
  match action {
    "CreateVpc" => {
      let request: CreateVpcRequest = parse(payload)?;
      let vpc = store.create_vpc(&request).await?;
      Ok(json!({ "vpc": vpc }))
    }
    "DeleteVpc" => {
      let request: DeleteVpcRequest = parse(payload)?;
      store.delete_vpc(&request.vpc_id).await?;
      Ok(json!({ "return": true }))
    }
    "DescribeVpcs" => Ok(json!({ "vpcs": store.list_vpcs().await? })),
    "CreateSubnet" => {
      let request: CreateSubnetRequest = parse(payload)?;
      let subnet = store.create_subnet(&request).await?;
      let available = subnet.available_ip_address_count();
      Ok(json!({ "subnet": subnet, "availableIpAddressCount": available }))
    }
    "DeleteSubnet" => {
      let request: DeleteSubnetRequest = parse(payload)?;
      store.delete_subnet(&request.subnet_id).await?;
      Ok(json!({ "return": true }))
    }
    "DescribeSubnets" => Ok(json!({ "subnets": store.list_subnets().await? })),
    "CreateNetworkInterface" => {
      let request: CreateNetworkInterfaceRequest = parse(payload)?;
      let eni = store.create_network_interface(&request).await?;
      Ok(json!({ "networkInterface": eni }))
    }
    "DeleteNetworkInterface" => {
      let request: NetworkInterfaceIdRequest = parse(payload)?;
      store.delete_network_interface(&request.network_interface_id).await?;
      Ok(json!({ "return": true }))
    }
    "AttachNetworkInterface" => {
      let request: AttachNetworkInterfaceRequest = parse(payload)?;
      let attachment_id = store.attach_network_interface(&request).await?;
      Ok(json!({ "attachmentId": attachment_id }))
    }
    "DetachNetworkInterface" => {
      let request: NetworkInterfaceIdRequest = parse(payload)?;
      store.detach_network_interface(&request.network_interface_id).await?;
      Ok(json!({ "return": true }))
    }
    "DescribeNetworkInterfaces" => {
      Ok(json!({ "networkInterfaces": store.list_network_interfaces().await? }))
    }
    _ => Err(ApiError::InvalidAction(action.to_owned())),
  }
}
