use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

/// Seam to the external collaborators the shutdown phases drive: the
/// hypervisor, the block-storage daemon, the object store, and the bus
/// process itself. Each stop hook returns the service names it stopped.
#[async_trait]
pub trait NodeRuntime: Send + Sync {
  async fn stop_vm(&self, instance_id: &str) -> Result<()>;

  async fn stop_block_storage(&self) -> Result<Vec<String>>;

  async fn stop_object_store(&self) -> Result<Vec<String>>;

  async fn stop_message_bus(&self) -> Result<Vec<String>>;
}

/// Used on nodes where the collaborators are managed out-of-process; every
/// stop is a logged no-op that reports success
pub struct LoggingRuntime;

#[async_trait]
impl NodeRuntime for LoggingRuntime {
  async fn stop_vm(&self, instance_id: &str) -> Result<()> {
    info!("stopping VM {instance_id}");
    Ok(())
  }

  async fn stop_block_storage(&self) -> Result<Vec<String>> {
    info!("stopping block storage");
    Ok(vec!["viperblock".to_owned()])
  }

  async fn stop_object_store(&self) -> Result<Vec<String>> {
    info!("stopping object store");
    Ok(vec!["predastore".to_owned()])
  }

  async fn stop_message_bus(&self) -> Result<Vec<String>> {
    info!("stopping message bus");
    Ok(vec!["nats".to_owned()])
  }
}
