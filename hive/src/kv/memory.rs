use std::{
  collections::HashMap,
  sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{BucketConfig, Entry, KvBucket, KvError, KvStore};

/// In-memory reference implementation of the replicated KV
///
/// Revisions are a per-bucket monotonic sequence, so two writers racing on
/// the same key observe exactly one winner and the loser's `update` fails
/// with a conflict carrying the revision that beat it.
#[derive(Default)]
pub struct MemoryKv {
  buckets: Mutex<HashMap<String, Arc<MemoryBucket>>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl KvStore for MemoryKv {
  async fn bucket(&self, config: &BucketConfig) -> Result<Arc<dyn KvBucket>, KvError> {
    let mut buckets = self.buckets.lock().expect("kv bucket map poisoned");
    let bucket = buckets
      .entry(config.name.to_owned())
      .or_insert_with(|| Arc::new(MemoryBucket::default()))
      .clone();

    Ok(bucket)
  }
}

#[derive(Default)]
struct MemoryBucket {
  state: Mutex<BucketState>,
}

#[derive(Default)]
struct BucketState {
  seq: u64,
  entries: HashMap<String, (Vec<u8>, u64)>,
}

impl BucketState {
  fn next_revision(&mut self) -> u64 {
    self.seq += 1;
    self.seq
  }
}

#[async_trait]
impl KvBucket for MemoryBucket {
  async fn get(&self, key: &str) -> Result<Option<Entry>, KvError> {
    let state = self.state.lock().expect("kv bucket poisoned");
    Ok(state.entries.get(key).map(|(value, revision)| Entry {
      value: value.clone(),
      revision: *revision,
    }))
  }

  async fn create(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
    let mut state = self.state.lock().expect("kv bucket poisoned");
    if state.entries.contains_key(key) {
      return Err(KvError::AlreadyExists(key.to_owned()));
    }

    let revision = state.next_revision();
    state.entries.insert(key.to_owned(), (value, revision));
    Ok(revision)
  }

  async fn update(&self, key: &str, value: Vec<u8>, revision: u64) -> Result<u64, KvError> {
    let mut state = self.state.lock().expect("kv bucket poisoned");
    let found = state.entries.get(key).map(|(_, rev)| *rev).unwrap_or(0);
    if found != revision {
      return Err(KvError::Conflict {
        key: key.to_owned(),
        expected: revision,
        found,
      });
    }

    let next = state.next_revision();
    state.entries.insert(key.to_owned(), (value, next));
    Ok(next)
  }

  async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
    let mut state = self.state.lock().expect("kv bucket poisoned");
    let next = state.next_revision();
    state.entries.insert(key.to_owned(), (value, next));
    Ok(next)
  }

  async fn delete(&self, key: &str) -> Result<(), KvError> {
    let mut state = self.state.lock().expect("kv bucket poisoned");
    state.entries.remove(key);
    Ok(())
  }

  async fn keys(&self) -> Result<Vec<String>, KvError> {
    let state = self.state.lock().expect("kv bucket poisoned");
    let mut keys: Vec<String> = state.entries.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }
}
