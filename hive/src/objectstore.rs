use std::{
  collections::{BTreeMap, BTreeSet},
  sync::Mutex,
};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("NoSuchKey: {key}")]
  NoSuchKey { key: String },

  #[error("object store backend error: {0}")]
  Backend(String),
}

impl StoreError {
  /// AWS-compatible error code string
  pub fn code(&self) -> &'static str {
    match self {
      StoreError::NoSuchKey { .. } => "NoSuchKey",
      StoreError::Backend(_) => "InternalError",
    }
  }
}

/// One page of a bucket listing
#[derive(Clone, Debug, Default)]
pub struct ListObjectsOutput {
  pub keys: Vec<String>,
  pub common_prefixes: Vec<String>,
}

/// The object-store capability the API handlers consume
///
/// Backed by the S3-compatible persistence tier in production and by
/// `MemoryObjectStore` in tests.
#[async_trait]
pub trait ObjectStore: Send + Sync {
  async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError>;

  async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), StoreError>;

  /// Deleting an absent object is a no-op, matching S3 semantics
  async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError>;

  async fn list_objects(
    &self,
    bucket: &str,
    prefix: &str,
    delimiter: &str,
  ) -> Result<ListObjectsOutput, StoreError>;
}

/// In-memory object store keyed by `bucket/key`
#[derive(Default)]
pub struct MemoryObjectStore {
  objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn object_key(bucket: &str, key: &str) -> String {
    format!("{bucket}/{key}")
  }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
  async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StoreError> {
    let objects = self.objects.lock().expect("object map poisoned");
    objects
      .get(&Self::object_key(bucket, key))
      .cloned()
      .ok_or_else(|| StoreError::NoSuchKey { key: key.to_owned() })
  }

  async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
    let mut objects = self.objects.lock().expect("object map poisoned");
    objects.insert(Self::object_key(bucket, key), data);
    Ok(())
  }

  async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), StoreError> {
    let mut objects = self.objects.lock().expect("object map poisoned");
    objects.remove(&Self::object_key(bucket, key));
    Ok(())
  }

  async fn list_objects(
    &self,
    bucket: &str,
    prefix: &str,
    delimiter: &str,
  ) -> Result<ListObjectsOutput, StoreError> {
    let objects = self.objects.lock().expect("object map poisoned");
    let bucket_prefix = format!("{bucket}/");

    let mut keys = Vec::new();
    let mut common_prefixes = BTreeSet::new();

    for full_key in objects.keys() {
      let Some(key) = full_key.strip_prefix(&bucket_prefix) else {
        continue;
      };
      let Some(rest) = key.strip_prefix(prefix) else {
        continue;
      };

      if !delimiter.is_empty() {
        if let Some(idx) = rest.find(delimiter) {
          common_prefixes.insert(format!("{prefix}{}", &rest[..idx + delimiter.len()]));
          continue;
        }
      }

      keys.push(key.to_owned());
    }

    Ok(ListObjectsOutput {
      keys,
      common_prefixes: common_prefixes.into_iter().collect(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn seeded() -> MemoryObjectStore {
    let store = MemoryObjectStore::new();
    for key in [
      "images/debian/disk.raw",
      "images/debian/manifest.json",
      "images/ubuntu/disk.raw",
      "state/cluster.json",
    ] {
      store.put_object("hive", key, b"data".to_vec()).await.unwrap();
    }
    store
  }

  #[tokio::test]
  async fn it_round_trips_objects() {
    let store = MemoryObjectStore::new();
    store.put_object("hive", "a/b", b"payload".to_vec()).await.unwrap();

    assert_eq!(store.get_object("hive", "a/b").await.unwrap(), b"payload");
  }

  #[tokio::test]
  async fn it_returns_no_such_key_with_the_missing_key() {
    let store = MemoryObjectStore::new();
    let err = store.get_object("hive", "absent").await.unwrap_err();

    assert_eq!(err.code(), "NoSuchKey");
    assert!(matches!(err, StoreError::NoSuchKey { key } if key == "absent"));
  }

  #[tokio::test]
  async fn it_ignores_delete_of_missing_object() {
    let store = MemoryObjectStore::new();
    store.delete_object("hive", "absent").await.unwrap();
  }

  #[tokio::test]
  async fn it_lists_with_common_prefixes() {
    let store = seeded().await;
    let listing = store.list_objects("hive", "images/", "/").await.unwrap();

    assert!(listing.keys.is_empty());
    assert_eq!(
      listing.common_prefixes,
      vec!["images/debian/".to_string(), "images/ubuntu/".to_string()]
    );
  }

  #[tokio::test]
  async fn it_lists_keys_without_delimiter() {
    let store = seeded().await;
    let listing = store.list_objects("hive", "images/debian/", "").await.unwrap();

    assert_eq!(
      listing.keys,
      vec![
        "images/debian/disk.raw".to_string(),
        "images/debian/manifest.json".to_string()
      ]
    );
    assert!(listing.common_prefixes.is_empty());
  }

  #[tokio::test]
  async fn it_scopes_listings_to_the_bucket() {
    let store = seeded().await;
    store.put_object("other", "images/x", b"x".to_vec()).await.unwrap();

    let listing = store.list_objects("other", "", "").await.unwrap();
    assert_eq!(listing.keys, vec!["images/x".to_string()]);
  }
}
