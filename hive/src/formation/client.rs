use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::time::Instant;
use tracing::{debug, info};

use super::{JoinRequest, JoinResponse, NodeInfo, StatusResponse};

const JOIN_RETRY_INTERVAL: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Joiner side of the formation exchange
pub struct FormationClient {
  base_url: String,
  http: reqwest::Client,
}

impl FormationClient {
  /// `leader` is the initiator's `host:port`
  pub fn new(leader: &str) -> Result<Self> {
    let http = reqwest::Client::builder()
      .timeout(Duration::from_secs(10))
      .build()
      .context("building formation http client")?;

    Ok(Self {
      base_url: format!("http://{leader}"),
      http,
    })
  }

  /// Register with the leader, retrying while it is not yet reachable
  pub async fn join(&self, info: &NodeInfo, deadline: Duration) -> Result<JoinResponse> {
    let started = Instant::now();
    let request = JoinRequest {
      node_info: info.clone(),
    };

    loop {
      let result = self
        .http
        .post(format!("{}/formation/join", self.base_url))
        .json(&request)
        .send()
        .await;

      match result {
        Ok(response) => {
          let join: JoinResponse = response
            .json()
            .await
            .with_context(|| format!("decoding join response from {}", self.base_url))?;
          if !join.success {
            bail!("join rejected by {}: {}", self.base_url, join.message);
          }

          info!(
            "registered with {} ({}/{} nodes joined)",
            self.base_url, join.joined, join.expected
          );
          return Ok(join);
        }
        Err(err) if started.elapsed() + JOIN_RETRY_INTERVAL < deadline => {
          debug!("formation leader not reachable yet: {err}");
          tokio::time::sleep(JOIN_RETRY_INTERVAL).await;
        }
        Err(err) => {
          bail!("unable to reach formation leader at {}: {err}", self.base_url);
        }
      }
    }
  }

  pub async fn status(&self) -> Result<StatusResponse> {
    let response = self
      .http
      .get(format!("{}/formation/status", self.base_url))
      .send()
      .await
      .with_context(|| format!("polling {}/formation/status", self.base_url))?;

    response
      .json()
      .await
      .with_context(|| format!("decoding status response from {}", self.base_url))
  }

  /// Poll until the leader reports completion
  pub async fn wait_complete(&self, deadline: Duration) -> Result<StatusResponse> {
    let started = Instant::now();

    loop {
      let status = self.status().await?;
      if status.complete {
        return Ok(status);
      }

      debug!("formation at {}/{} nodes", status.joined, status.expected);
      if started.elapsed() + POLL_INTERVAL >= deadline {
        bail!(
          "formation did not complete within {deadline:?} ({}/{} nodes joined)",
          status.joined,
          status.expected
        );
      }
      tokio::time::sleep(POLL_INTERVAL).await;
    }
  }
}
