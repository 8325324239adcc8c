//! Persistent connection from the agent to the control plane.
//!
//! Task events queued while the socket is down are kept in order and flushed after the next
//! successful `Connect`. RPC responses are not buffered: the caller on the other side has
//! either timed out or will never see a reply for a dead connection.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use strata_core::ids::AgentKey;
use strata_core::rpc::{AgentMessage, ServerMessage};

use crate::config::ReconnectSettings;
use crate::handlers::AgentHandlers;

/// Events kept while offline. Past this, the oldest progress lines are shed; completions never are.
pub const BACKLOG_LIMIT: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("connection closed by server")]
    Closed,
}

pub struct AgentConnection {
    url: String,
    agent_key: AgentKey,
    handlers: Arc<AgentHandlers>,
    outbound_tx: mpsc::Sender<AgentMessage>,
    outbound_rx: mpsc::Receiver<AgentMessage>,
    backlog: VecDeque<AgentMessage>,
    backlog_limit: usize,
    reconnect: ReconnectSettings,
}

impl AgentConnection {
    /// `outbound_tx`/`outbound_rx` are the two ends of the channel the runner emits events on.
    pub fn new(
        url: impl Into<String>,
        agent_key: AgentKey,
        handlers: Arc<AgentHandlers>,
        outbound_tx: mpsc::Sender<AgentMessage>,
        outbound_rx: mpsc::Receiver<AgentMessage>,
        reconnect: ReconnectSettings,
    ) -> Self {
        Self {
            url: url.into(),
            agent_key,
            handlers,
            outbound_tx,
            outbound_rx,
            backlog: VecDeque::new(),
            backlog_limit: BACKLOG_LIMIT,
            reconnect,
        }
    }

    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit;
        self
    }

    /// Connect, serve, and reconnect until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut delay = self.reconnect.initial_delay();
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match tokio_tungstenite::connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    info!(url = %self.url, agent_key = %self.agent_key, "connected to control plane");
                    delay = self.reconnect.initial_delay();
                    match self.serve(socket, &shutdown).await {
                        Ok(()) => break,
                        Err(ConnectionError::Rejected(reason)) => {
                            error!(agent_key = %self.agent_key, reason = %reason, "control plane rejected this agent");
                        }
                        Err(e) => warn!(error = %e, "connection lost"),
                    }
                }
                Err(e) => warn!(url = %self.url, error = %e, "connect failed"),
            }

            if !self.wait_before_retry(delay, &shutdown).await {
                break;
            }
            delay = (delay * 2).min(self.reconnect.max_delay());
        }
        info!(buffered = self.backlog.len(), "agent connection stopped");
    }

    /// Sleep for `delay` while still collecting task events. Returns false on shutdown.
    async fn wait_before_retry(&mut self, delay: Duration, shutdown: &CancellationToken) -> bool {
        debug!(delay = ?delay, "reconnecting after delay");
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = shutdown.cancelled() => return false,
                msg = self.outbound_rx.recv() => match msg {
                    Some(msg) => self.buffer(msg),
                    None => return false,
                },
            }
        }
    }

    fn buffer(&mut self, msg: AgentMessage) {
        match msg {
            AgentMessage::TaskProgress(_) | AgentMessage::TaskComplete(_) => {
                if self.backlog.len() >= self.backlog_limit && !self.shed_progress(&msg) {
                    return;
                }
                self.backlog.push_back(msg)
            }
            other => debug!(kind = other.message_type(), "dropping message while disconnected"),
        }
    }

    /// Make room for `incoming` by dropping the oldest buffered progress line.
    /// Returns false when `incoming` is itself the progress line to drop.
    fn shed_progress(&mut self, incoming: &AgentMessage) -> bool {
        let oldest = self
            .backlog
            .iter()
            .position(|m| matches!(m, AgentMessage::TaskProgress(_)));
        match oldest {
            Some(index) => {
                let _ = self.backlog.remove(index);
                warn!(limit = self.backlog_limit, "event backlog full, dropped oldest progress");
                true
            }
            None if matches!(incoming, AgentMessage::TaskProgress(_)) => {
                warn!(limit = self.backlog_limit, "event backlog full, dropped progress");
                false
            }
            None => true,
        }
    }

    async fn serve<S>(
        &mut self,
        socket: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &CancellationToken,
    ) -> Result<(), ConnectionError>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut ws_tx, mut ws_rx) = socket.split();

        let connect = AgentMessage::Connect {
            agent_key: self.agent_key.clone(),
        };
        ws_tx.send(Message::Text(encode(&connect).into())).await?;

        while let Some(msg) = self.backlog.pop_front() {
            if let Err(e) = ws_tx.send(Message::Text(encode(&msg).into())).await {
                self.backlog.push_front(msg);
                return Err(e.into());
            }
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                msg = self.outbound_rx.recv() => {
                    let Some(msg) = msg else {
                        return Ok(());
                    };
                    if let Err(e) = ws_tx.send(Message::Text(encode(&msg).into())).await {
                        self.buffer(msg);
                        return Err(e.into());
                    }
                }
                frame = ws_rx.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_server_message(text.as_str())?,
                    Some(Ok(Message::Close(_))) | None => return Err(ConnectionError::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }

    fn on_server_message(&self, text: &str) -> Result<(), ConnectionError> {
        let message: ServerMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "ignoring malformed server message");
                return Ok(());
            }
        };
        match message {
            ServerMessage::Request(request) => {
                // Requests may wait on the dispatch gate; never block the socket on them.
                let handlers = Arc::clone(&self.handlers);
                let tx = self.outbound_tx.clone();
                tokio::spawn(async move {
                    let result = handlers.handle(&request).await;
                    let _ = tx.send(AgentMessage::Response(result)).await;
                });
                Ok(())
            }
            ServerMessage::Rejected { reason } => Err(ConnectionError::Rejected(reason)),
        }
    }
}

fn encode(msg: &AgentMessage) -> String {
    serde_json::to_string(msg).unwrap_or_default()
}
