use std::{
  net::{IpAddr, SocketAddr},
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::Result;
use axum::{
  extract::State,
  routing::{get, post},
  Json, Router,
};
use tokio::{net::TcpListener, sync::watch};
use tracing::{info, warn};

use super::{JoinRequest, JoinResponse, NodeInfo, SharedCredentials, StatusResponse};
use crate::config::ServiceTag;

/// How long the leader keeps answering status polls after completion
pub const DRAIN_GRACE: Duration = Duration::from_secs(15);

struct FormationState {
  expected: usize,
  nodes: Vec<NodeInfo>,
  complete: bool,
}

/// Shared state behind the bootstrap-only formation endpoint
pub struct Formation {
  state: Mutex<FormationState>,
  credentials: SharedCredentials,
  ca_cert_pem: String,
  ca_key_pem: String,
  /// Declared predastore ring membership; empty means unconstrained
  predastore_allowed: Vec<IpAddr>,
  complete_tx: watch::Sender<bool>,
}

impl Formation {
  /// The initiator registers itself as node 1
  pub fn new(
    initiator: NodeInfo,
    expected: usize,
    credentials: SharedCredentials,
    ca_cert_pem: String,
    ca_key_pem: String,
    predastore_allowed: Vec<IpAddr>,
  ) -> Arc<Self> {
    let (complete_tx, _) = watch::channel(expected <= 1);

    Arc::new(Self {
      state: Mutex::new(FormationState {
        expected,
        nodes: vec![initiator],
        complete: expected <= 1,
      }),
      credentials,
      ca_cert_pem,
      ca_key_pem,
      predastore_allowed,
      complete_tx,
    })
  }

  pub fn subscribe_complete(&self) -> watch::Receiver<bool> {
    self.complete_tx.subscribe()
  }

  /// The roster in registration order
  pub fn roster(&self) -> Vec<NodeInfo> {
    self.state.lock().expect("formation state poisoned").nodes.clone()
  }

  pub fn is_complete(&self) -> bool {
    self.state.lock().expect("formation state poisoned").complete
  }

  fn join(&self, info: NodeInfo) -> JoinResponse {
    let mut state = self.state.lock().expect("formation state poisoned");

    if state.complete {
      return JoinResponse {
        success: false,
        joined: state.nodes.len(),
        expected: state.expected,
        message: "formation already complete".to_owned(),
      };
    }

    if state.nodes.iter().any(|node| node.name == info.name) {
      return JoinResponse {
        success: false,
        joined: state.nodes.len(),
        expected: state.expected,
        message: format!("node name {} already registered", info.name),
      };
    }

    if !self.predastore_allowed.is_empty()
      && info.runs(ServiceTag::Predastore)
      && !self.predastore_allowed.contains(&info.bind_ip)
    {
      return JoinResponse {
        success: false,
        joined: state.nodes.len(),
        expected: state.expected,
        message: format!(
          "bind IP {} is not in the declared predastore ring",
          info.bind_ip
        ),
      };
    }

    info!("node {} joined from {}", info.name, info.bind_ip);
    state.nodes.push(info);

    if state.nodes.len() == state.expected {
      state.complete = true;
      // Receivers may already be gone when expected == 1
      let _ = self.complete_tx.send(true);
      info!("formation complete with {} nodes", state.nodes.len());
    }

    JoinResponse {
      success: true,
      joined: state.nodes.len(),
      expected: state.expected,
      message: String::new(),
    }
  }

  fn status(&self) -> StatusResponse {
    let state = self.state.lock().expect("formation state poisoned");

    let (credentials, ca_cert, ca_key) = if state.complete {
      (
        Some(self.credentials.clone()),
        self.ca_cert_pem.clone(),
        self.ca_key_pem.clone(),
      )
    } else {
      (None, String::new(), String::new())
    };

    StatusResponse {
      complete: state.complete,
      joined: state.nodes.len(),
      expected: state.expected,
      nodes: state.nodes.clone(),
      credentials,
      ca_cert,
      ca_key,
    }
  }
}

async fn handle_join(
  State(formation): State<Arc<Formation>>,
  Json(request): Json<JoinRequest>,
) -> Json<JoinResponse> {
  let response = formation.join(request.node_info);
  if !response.success {
    warn!("rejected join: {}", response.message);
  }
  Json(response)
}

async fn handle_status(State(formation): State<Arc<Formation>>) -> Json<StatusResponse> {
  Json(formation.status())
}

pub fn router(formation: Arc<Formation>) -> Router {
  Router::new()
    .route("/formation/join", post(handle_join))
    .route("/formation/status", get(handle_status))
    .with_state(formation)
}

/// Serve until formation completes, then drain laggard polls briefly
///
/// Transport is plain HTTP: the TLS material is exactly what is being
/// distributed here.
pub async fn serve(listener: TcpListener, formation: Arc<Formation>, grace: Duration) -> Result<()> {
  let mut complete_rx = formation.subscribe_complete();
  let app = router(formation);

  let shutdown = async move {
    while !*complete_rx.borrow() {
      if complete_rx.changed().await.is_err() {
        break;
      }
    }
    tokio::time::sleep(grace).await;
  };

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown)
    .await?;

  Ok(())
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
  Ok(TcpListener::bind(addr).await?)
}
