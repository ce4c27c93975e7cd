use thiserror::Error;

use crate::kv::KvError;

/// Errors surfaced to API callers, each carrying its EC2 wire code
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("missing required parameter: {0}")]
  MissingParameter(&'static str),

  #[error("invalid VPC range: {0}")]
  InvalidVpcRange(String),

  #[error("VPC not found: {0}")]
  VpcNotFound(String),

  #[error("invalid subnet range: {0}")]
  InvalidSubnetRange(String),

  #[error("subnet CIDR conflicts with an existing subnet: {0}")]
  SubnetConflict(String),

  #[error("subnet not found: {0}")]
  SubnetNotFound(String),

  #[error("network interface not found: {0}")]
  EniNotFound(String),

  #[error("network interface {0} is in use")]
  EniInUse(String),

  #[error("{resource} has dependent resources: {detail}")]
  DependencyViolation { resource: String, detail: String },

  #[error("no free addresses left in subnet {0}")]
  AddressesExhausted(String),

  #[error("address {ip} is not allocated in subnet {subnet_id}")]
  NotAllocated { subnet_id: String, ip: String },

  #[error("address {ip} is already in use in subnet {subnet_id}")]
  AddressInUse { subnet_id: String, ip: String },

  #[error("invalid parameter value: {0}")]
  InvalidParameterValue(String),

  #[error("unsupported action: {0}")]
  InvalidAction(String),

  #[error("temporarily unavailable: {0}")]
  Unavailable(String),

  #[error("transient error: {0}")]
  Transient(String),

  #[error("internal error: {0}")]
  Internal(String),
}

impl ApiError {
  /// EC2 wire code for this error
  pub fn code(&self) -> &'static str {
    match self {
      ApiError::MissingParameter(_) => "MissingParameter",
      ApiError::InvalidVpcRange(_) => "InvalidVpcRange",
      ApiError::VpcNotFound(_) => "InvalidVpcID.NotFound",
      ApiError::InvalidSubnetRange(_) => "InvalidSubnet.Range",
      ApiError::SubnetConflict(_) => "InvalidSubnet.Conflict",
      ApiError::SubnetNotFound(_) => "InvalidSubnetID.NotFound",
      ApiError::EniNotFound(_) => "InvalidNetworkInterfaceID.NotFound",
      ApiError::EniInUse(_) => "InvalidNetworkInterface.InUse",
      ApiError::DependencyViolation { .. } => "DependencyViolation",
      ApiError::AddressesExhausted(_) => "InsufficientFreeAddressesInSubnet",
      ApiError::NotAllocated { .. } => "InvalidParameterValue",
      ApiError::AddressInUse { .. } => "InvalidIPAddress.InUse",
      ApiError::InvalidParameterValue(_) => "InvalidParameterValue",
      ApiError::InvalidAction(_) => "InvalidAction",
      ApiError::Unavailable(_) => "ServiceUnavailable",
      ApiError::Transient(_) => "ServiceUnavailable",
      ApiError::Internal(_) => "ServerInternal",
    }
  }

  /// Whether the caller may simply retry the same call
  pub fn is_retryable(&self) -> bool {
    matches!(self, ApiError::Transient(_) | ApiError::Unavailable(_))
  }
}

impl From<KvError> for ApiError {
  fn from(err: KvError) -> Self {
    if err.is_conflict() {
      // A lost CAS race that leaked past its retry loop
      ApiError::Transient(err.to_string())
    } else {
      ApiError::Internal(err.to_string())
    }
  }
}
