pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
  #[error("key already exists: {0}")]
  AlreadyExists(String),

  #[error("revision mismatch on {key}: expected {expected}, found {found}")]
  Conflict { key: String, expected: u64, found: u64 },

  #[error("value under {key} is not valid JSON: {source}")]
  Codec {
    key: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("kv backend error: {0}")]
  Backend(String),
}

impl KvError {
  /// True when a writer lost a compare-and-swap race and should re-read
  pub fn is_conflict(&self) -> bool {
    matches!(self, KvError::Conflict { .. } | KvError::AlreadyExists(_))
  }
}

/// A value read from a bucket together with the revision that produced it
#[derive(Clone, Debug)]
pub struct Entry {
  pub value: Vec<u8>,
  pub revision: u64,
}

/// Bucket declaration, applied lazily on first use
#[derive(Clone, Copy, Debug)]
pub struct BucketConfig {
  pub name: &'static str,
  pub history: usize,
}

#[async_trait]
pub trait KvStore: Send + Sync {
  /// Open a bucket, creating it with `config` when absent
  async fn bucket(&self, config: &BucketConfig) -> Result<Arc<dyn KvBucket>, KvError>;
}

/// A named key-value bucket with per-key revisions
///
/// `create`/`update` are the only write primitives the control plane uses on
/// shared state: every cross-node mutation is a read-modify-CAS loop, and a
/// lost race surfaces as a conflict the caller retries from the read step.
#[async_trait]
pub trait KvBucket: Send + Sync {
  async fn get(&self, key: &str) -> Result<Option<Entry>, KvError>;

  /// Create the key; fails with `AlreadyExists` when a writer raced us
  async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

  /// Compare-and-swap against the revision returned by the preceding read
  async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<u64, KvError>;

  /// Unconditional write, used only for single-writer keys
  async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

  /// Removing an absent key is a no-op
  async fn delete(&self, key: &str) -> Result<(), KvError>;

  async fn keys(&self) -> Result<Vec<String>, KvError>;
}

/// Read and decode a JSON record together with its revision
pub async fn get_json<T: DeserializeOwned>(
  bucket: &dyn KvBucket,
  key: &str,
) -> Result<Option<(T, u64)>, KvError> {
  match bucket.get(key).await? {
    Some(entry) => {
      let value = serde_json::from_slice(&entry.value).map_err(|source| KvError::Codec {
        key: key.to_owned(),
        source,
      })?;
      Ok(Some((value, entry.revision)))
    }
    None => Ok(None),
  }
}

pub fn to_bytes<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, KvError> {
  serde_json::to_vec(value).map_err(|source| KvError::Codec {
    key: key.to_owned(),
    source,
  })
}
