use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use super::{ApiError, ResourceStore, MAX_CAS_RETRIES};
use crate::kv::{get_json, to_bytes, KvError};

/// Offsets reserved at the bottom of every subnet: network address,
/// gateway, DNS, and one held for future use. The top address is the
/// broadcast address.
const RESERVED_HEAD_OFFSETS: u32 = 4;

/// Per-subnet allocation ledger, keyed by subnet ID in the IPAM bucket
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamRecord {
  pub subnet_id: String,
  pub cidr_block: String,
  /// Kept in allocation order; ordering carries no semantics
  pub allocated: Vec<String>,
}

/// Host addresses a subnet of the given prefix length can hand out
pub fn usable_addresses(prefix_len: u8) -> i64 {
  ((1i64 << (32 - i64::from(prefix_len))) - 5).max(0)
}

impl ResourceStore {
  /// Allocate the lowest free address in the subnet
  pub async fn allocate_ip(&self, subnet_id: &str, cidr_block: &str) -> Result<Ipv4Addr, ApiError> {
    let net: Ipv4Net = cidr_block
      .parse()
      .map_err(|_| ApiError::InvalidSubnetRange(cidr_block.to_owned()))?;

    for _ in 0..MAX_CAS_RETRIES {
      let (mut record, revision) = self.read_ipam(subnet_id, cidr_block).await?;
      let ip = next_free(&net, &record.allocated)
        .ok_or_else(|| ApiError::AddressesExhausted(subnet_id.to_owned()))?;

      record.allocated.push(ip.to_string());
      match self.write_ipam(&record, revision).await {
        Ok(()) => return Ok(ip),
        Err(err) if err.is_conflict() => continue,
        Err(err) => return Err(err.into()),
      }
    }

    Err(ApiError::Transient(format!(
      "ipam allocation for {subnet_id} lost {MAX_CAS_RETRIES} races"
    )))
  }

  /// Record a caller-chosen address; the caller has already checked
  /// subnet containment
  pub async fn reserve_ip(
    &self,
    subnet_id: &str,
    cidr_block: &str,
    ip: &Ipv4Addr,
  ) -> Result<(), ApiError> {
    for _ in 0..MAX_CAS_RETRIES {
      let (mut record, revision) = self.read_ipam(subnet_id, cidr_block).await?;
      if record.allocated.iter().any(|a| a == &ip.to_string()) {
        return Err(ApiError::AddressInUse {
          subnet_id: subnet_id.to_owned(),
          ip: ip.to_string(),
        });
      }

      record.allocated.push(ip.to_string());
      match self.write_ipam(&record, revision).await {
        Ok(()) => return Ok(()),
        Err(err) if err.is_conflict() => continue,
        Err(err) => return Err(err.into()),
      }
    }

    Err(ApiError::Transient(format!(
      "ipam reservation for {subnet_id} lost {MAX_CAS_RETRIES} races"
    )))
  }

  /// Return an address to the pool
  pub async fn release_ip(&self, subnet_id: &str, ip: &str) -> Result<(), ApiError> {
    for _ in 0..MAX_CAS_RETRIES {
      let Some((mut record, revision)) =
        get_json::<IpamRecord>(self.ipam.as_ref(), subnet_id).await?
      else {
        return Err(ApiError::NotAllocated {
          subnet_id: subnet_id.to_owned(),
          ip: ip.to_owned(),
        });
      };

      let Some(idx) = record.allocated.iter().position(|a| a == ip) else {
        return Err(ApiError::NotAllocated {
          subnet_id: subnet_id.to_owned(),
          ip: ip.to_owned(),
        });
      };

      record.allocated.remove(idx);
      match self.write_ipam(&record, revision).await {
        Ok(()) => return Ok(()),
        Err(err) if err.is_conflict() => continue,
        Err(err) => return Err(err.into()),
      }
    }

    Err(ApiError::Transient(format!(
      "ipam release for {subnet_id} lost {MAX_CAS_RETRIES} races"
    )))
  }

  /// Addresses currently allocated in the subnet, in allocation order
  pub async fn allocated_ips(&self, subnet_id: &str) -> Result<Vec<String>, ApiError> {
    Ok(
      get_json::<IpamRecord>(self.ipam.as_ref(), subnet_id)
        .await?
        .map(|(record, _)| record.allocated)
        .unwrap_or_default(),
    )
  }

  async fn read_ipam(&self, subnet_id: &str, cidr_block: &str) -> Result<(IpamRecord, u64), ApiError> {
    match get_json::<IpamRecord>(self.ipam.as_ref(), subnet_id).await? {
      Some(found) => Ok(found),
      None => Ok((
        IpamRecord {
          subnet_id: subnet_id.to_owned(),
          cidr_block: cidr_block.to_owned(),
          allocated: Vec::new(),
        },
        0,
      )),
    }
  }

  async fn write_ipam(&self, record: &IpamRecord, revision: u64) -> Result<(), KvError> {
    let bytes = to_bytes(&record.subnet_id, record)?;
    if revision == 0 {
      self.ipam.create(&record.subnet_id, bytes).await?;
    } else {
      self.ipam.update(&record.subnet_id, bytes, revision).await?;
    }
    Ok(())
  }
}

fn next_free(net: &Ipv4Net, allocated: &[String]) -> Option<Ipv4Addr> {
  let base = u32::from(net.network());
  let hosts = 1u32 << (32 - u32::from(net.prefix_len()));

  // First candidate sits above the reserved head; the top address is the
  // broadcast address and is never handed out
  for offset in RESERVED_HEAD_OFFSETS..=hosts.saturating_sub(2) {
    let ip = Ipv4Addr::from(base + offset);
    if !allocated.iter().any(|a| a == &ip.to_string()) {
      return Some(ip);
    }
  }

  None
}

#[cfg(test)]
mod tests {
  use rstest::rstest;

  use super::*;
  use crate::store::testing::{store, store_pair};

  #[rstest]
  #[case(28, 11)]
  #[case(24, 251)]
  #[case(20, 4091)]
  #[case(16, 65_531)]
  fn it_counts_usable_addresses(#[case] prefix: u8, #[case] expected: i64) {
    assert_eq!(usable_addresses(prefix), expected);
  }

  #[tokio::test]
  async fn it_allocates_sequential_addresses_from_four() {
    let (store, _bus) = store().await;

    let first = store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();
    let second = store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();
    let third = store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();

    assert_eq!(first, "10.0.1.4".parse::<Ipv4Addr>().unwrap());
    assert_eq!(second, "10.0.1.5".parse::<Ipv4Addr>().unwrap());
    assert_eq!(third, "10.0.1.6".parse::<Ipv4Addr>().unwrap());
  }

  #[tokio::test]
  async fn it_exhausts_a_slash_28_after_eleven_allocations() {
    let (store, _bus) = store().await;

    for _ in 0..11 {
      store.allocate_ip("subnet-1", "10.0.1.0/28").await.unwrap();
    }

    let err = store.allocate_ip("subnet-1", "10.0.1.0/28").await.unwrap_err();
    assert_eq!(err.code(), "InsufficientFreeAddressesInSubnet");
  }

  #[tokio::test]
  async fn it_reuses_released_addresses() {
    let (store, _bus) = store().await;

    let first = store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();
    store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();

    store.release_ip("subnet-1", &first.to_string()).await.unwrap();
    let reused = store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();

    assert_eq!(reused, first);
  }

  #[tokio::test]
  async fn it_rejects_release_of_unallocated_addresses() {
    let (store, _bus) = store().await;

    let err = store.release_ip("subnet-1", "10.0.1.4").await.unwrap_err();
    assert!(matches!(err, ApiError::NotAllocated { .. }));

    store.allocate_ip("subnet-1", "10.0.1.0/24").await.unwrap();
    let err = store.release_ip("subnet-1", "10.0.1.200").await.unwrap_err();
    assert!(matches!(err, ApiError::NotAllocated { .. }));
  }

  #[tokio::test]
  async fn it_rejects_duplicate_reservations() {
    let (store, _bus) = store().await;
    let ip: Ipv4Addr = "10.0.1.10".parse().unwrap();

    store.reserve_ip("subnet-1", "10.0.1.0/24", &ip).await.unwrap();
    let err = store
      .reserve_ip("subnet-1", "10.0.1.0/24", &ip)
      .await
      .unwrap_err();

    assert_eq!(err.code(), "InvalidIPAddress.InUse");
  }

  #[tokio::test]
  async fn it_keeps_concurrent_allocations_distinct() {
    let (a, b) = store_pair().await;

    let (first, second) = tokio::join!(
      a.allocate_ip("subnet-1", "10.0.1.0/24"),
      b.allocate_ip("subnet-1", "10.0.1.0/24"),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first, second);

    let allocated = a.allocated_ips("subnet-1").await.unwrap();
    assert_eq!(allocated.len(), 2);
    assert!(allocated.contains(&"10.0.1.4".to_string()));
    assert!(allocated.contains(&"10.0.1.5".to_string()));
  }
}
