pub mod admin;
pub mod cluster;
pub mod daemon;
pub mod get;
pub mod top;

use std::sync::Arc;

use crate::{
  bus::{memory::MemoryBus, Bus},
  config::ConfigSettings,
  kv::{memory::MemoryKv, KvStore},
};

/// Attach to the cluster bus and KV declared in the node's settings
///
/// The pub-sub substrate and its KV are external collaborators; the
/// in-process backends stand in for them here and in the test suite. A
/// deployment swaps this wiring for a client of the real substrate, keyed
/// by `settings.cluster_routes` and `settings.nats_token`.
pub(crate) fn cluster_wiring(_settings: &ConfigSettings) -> (Arc<dyn Bus>, Arc<dyn KvStore>) {
  (Arc::new(MemoryBus::new()), Arc::new(MemoryKv::new()))
}

/// Render whole seconds as a compact uptime
pub(crate) fn format_uptime(total_secs: u64) -> String {
  let days = total_secs / 86_400;
  let hours = (total_secs % 86_400) / 3_600;
  let minutes = (total_secs % 3_600) / 60;
  let seconds = total_secs % 60;

  if days > 0 {
    format!("{days}d{hours}h")
  } else if hours > 0 {
    format!("{hours}h{minutes}m")
  } else if minutes > 0 {
    format!("{minutes}m{seconds}s")
  } else {
    format!("{seconds}s")
  }
}

#[cfg(test)]
mod tests {
  use rstest::rstest;

  use super::*;

  #[rstest]
  #[case(42, "42s")]
  #[case(90, "1m30s")]
  #[case(3_720, "1h2m")]
  #[case(200_000, "2d7h")]
  fn it_formats_uptime(#[case] secs: u64, #[case] expected: &str) {
    assert_eq!(format_uptime(secs), expected);
  }
}
