use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use parking_lot::Mutex;
use rail_analysis::SessionScore;
use rail_link_tcp::FrameStream;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{session::evaluate_connection, EvaluatorSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Active,
    Complete,
    Incomplete,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub conn: u64,
    pub peer: SocketAddr,
    pub session_id: Option<Uuid>,
    pub samples: u64,
    pub state: ConnectionState,
}

/// Bookkeeping only: each connection's scoring state lives in its own task.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    next: u64,
    conns: BTreeMap<u64, ConnectionStatus>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, peer: SocketAddr) -> u64 {
        let mut inner = self.inner.lock();
        inner.next += 1;
        let conn = inner.next;
        inner.conns.insert(conn, ConnectionStatus { conn, peer, session_id: None, samples: 0, state: ConnectionState::Active });
        conn
    }

    pub fn bind_session(&self, conn: u64, session_id: Uuid) {
        if let Some(c) = self.inner.lock().conns.get_mut(&conn) {
            c.session_id = Some(session_id);
        }
    }

    pub fn progress(&self, conn: u64, samples: u64) {
        if let Some(c) = self.inner.lock().conns.get_mut(&conn) {
            c.samples = samples;
        }
    }

    pub fn close(&self, conn: u64, score: &SessionScore) {
        if let Some(c) = self.inner.lock().conns.get_mut(&conn) {
            c.samples = score.samples_scored;
            c.state = if score.complete { ConnectionState::Complete } else { ConnectionState::Incomplete };
        }
    }

    pub fn snapshot(&self) -> Vec<ConnectionStatus> {
        self.inner.lock().conns.values().cloned().collect()
    }
}

pub struct EvaluatorServer {
    listener: TcpListener,
    settings: Arc<EvaluatorSettings>,
    registry: Arc<SessionRegistry>,
}

impl EvaluatorServer {
    pub async fn bind(addr: &str, settings: EvaluatorSettings) -> anyhow::Result<Self> {
        let listener = rail_link_tcp::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "evaluator listening");
        Ok(Self { listener, settings: Arc::new(settings), registry: Arc::new(SessionRegistry::new()) })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    async fn accept(&self) -> anyhow::Result<FrameStream> {
        let (sock, _) = self.listener.accept().await.context("accept")?;
        Ok(FrameStream::new(sock)?)
    }

    /// Scores exactly one connection and returns its final score.
    pub async fn serve_one(&self) -> anyhow::Result<SessionScore> {
        let stream = self.accept().await?;
        Ok(evaluate_connection(stream, &self.settings, &self.registry).await)
    }

    /// Accepts forever; every connection gets its own task and engine.
    pub async fn serve(self) -> anyhow::Result<()> {
        loop {
            let stream = match self.accept().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            let settings = self.settings.clone();
            let registry = self.registry.clone();
            tokio::spawn(async move {
                evaluate_connection(stream, &settings, &registry).await;
            });
        }
    }
}
