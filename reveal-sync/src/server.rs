//! WebSocket front end of the coordinator.
//!
//! Architecture:
//! ```text
//!              ┌── read loop ── ClientMessage ──► Coordinator ──┐
//! TcpStream ───┤        ▲                                       │ ConnectionHandle
//!  (accept)    │        └─ heartbeat deadline                   ▼
//!              └── writer task ◄── mpsc<Frame> ◄── fan-out / point-to-point
//! ```
//!
//! Each connection gets one read loop and one writer task. The read loop is
//! the only place that decodes client frames, so per-identity ordering
//! follows from there being a single loop per connection. The writer task
//! owns the sink; everything else enqueues onto its bounded queue.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::{ConnectionHandle, Frame};
use crate::content::{ContentProbe, FileContent, StaticContent};
use crate::coordinator::{Coordinator, CoordinatorConfig};
use crate::heartbeat::{sleep_until_opt, Heartbeat, HeartbeatConfig};
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};

/// How long a closing connection waits for its writer to flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub coordinator: CoordinatorConfig,
    pub heartbeat: HeartbeatConfig,
    /// Bounded outbound queue per connection
    pub outbound_capacity: usize,
    /// File whose presence is reported as `hasImage` (None = never)
    pub content_path: Option<PathBuf>,
    /// How often the content is checked for a new upload
    pub content_poll_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            coordinator: CoordinatorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            outbound_capacity: 64,
            content_path: Some(PathBuf::from("uploads/current_image.png")),
            content_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub protocol_violations: u64,
    pub heartbeat_timeouts: u64,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// The reveal server.
pub struct RevealServer {
    config: ServerConfig,
    coordinator: Coordinator,
    stats: Arc<RwLock<ServerStats>>,
}

impl RevealServer {
    /// Create a server whose content probe follows `config.content_path`.
    pub fn new(config: ServerConfig) -> Self {
        let content: Arc<dyn ContentProbe> = match &config.content_path {
            Some(path) => Arc::new(FileContent::new(path)),
            None => Arc::new(StaticContent::new(false)),
        };
        Self::with_content(config, content)
    }

    pub fn with_content(config: ServerConfig, content: Arc<dyn ContentProbe>) -> Self {
        let coordinator = Coordinator::new(config.coordinator.clone(), content);
        Self {
            config,
            coordinator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the task is dropped.
    ///
    /// Failing to bind is the only error that ends the server.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Reveal server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept connections from an already bound listener.
    ///
    /// The content watcher runs for as long as this future does.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let _watcher = AbortOnDrop(
            self.coordinator
                .watch_content(self.config.content_poll_interval),
        );
        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let coordinator = self.coordinator.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, coordinator, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        coordinator: Coordinator,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (connection, outbound) = ConnectionHandle::new(config.outbound_capacity);
        let mut writer = tokio::spawn(write_frames(ws_sender, outbound, addr));
        let mut heartbeat = Heartbeat::start(config.heartbeat, Instant::now());

        // Identity bound by the first `register`
        let mut bound: Option<String> = None;

        loop {
            tokio::select! {
                msg = tokio::time::timeout_at(heartbeat.deadline(), ws_receiver.next()) => {
                    match msg {
                        Err(_) => {
                            log::warn!("Heartbeat timeout from {addr} after {} pongs", heartbeat.pongs());
                            stats.write().await.heartbeat_timeouts += 1;
                            break;
                        }

                        Ok(Some(Ok(Message::Text(text)))) => {
                            stats.write().await.total_messages += 1;
                            if let Err(e) = dispatch(&coordinator, &connection, &mut bound, text.as_str()).await {
                                log::warn!("Protocol violation from {addr}: {e}");
                                stats.write().await.protocol_violations += 1;
                                let _ = connection.send(&ServerMessage::Error { error: e.to_string() });
                                break;
                            }
                        }

                        Ok(Some(Ok(Message::Pong(_)))) => {
                            heartbeat.on_pong(Instant::now());
                            if let Some(client_id) = &bound {
                                coordinator.touch(client_id, connection.id()).await;
                            }
                        }

                        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Ok(Some(Ok(Message::Binary(_)))) => {
                            log::debug!("Ignoring binary frame from {addr}");
                        }

                        Ok(Some(Ok(_))) => {}

                        Ok(Some(Err(e))) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                    }
                }

                _ = sleep_until_opt(heartbeat.next_ping()) => {
                    if let Err(e) = connection.ping() {
                        log::warn!("Failed to ping {addr}: {e}");
                    }
                    heartbeat.ping_sent();
                }
            }
        }

        if let Some(client_id) = &bound {
            coordinator.disconnect(client_id, connection.id()).await;
        }

        let _ = connection.close();
        drop(connection);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
            log::debug!("Writer for {addr} did not drain, aborting");
            writer.abort();
        }

        stats.write().await.active_connections -= 1;
        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Route one text frame from a connection.
///
/// An `Err` is a protocol violation: the caller reports it and closes.
async fn dispatch(
    coordinator: &Coordinator,
    connection: &ConnectionHandle,
    bound: &mut Option<String>,
    text: &str,
) -> Result<(), ProtocolError> {
    let message = match ClientMessage::decode(text) {
        Ok(message) => message,
        Err(ProtocolError::UnknownType(kind)) if bound.is_some() => {
            log::info!("Ignoring message of unknown type '{kind}'");
            return Ok(());
        }
        Err(ProtocolError::UnknownType(kind)) => return Err(ProtocolError::ExpectedRegister(kind)),
        Err(e) => return Err(e),
    };

    match (message, bound.as_deref()) {
        (ClientMessage::Register { client_id, is_ready }, None) => {
            coordinator.register(&client_id, is_ready, connection.clone()).await;
            *bound = Some(client_id);
        }
        (ClientMessage::Register { client_id, is_ready }, Some(current)) => {
            if client_id != current {
                return Err(ProtocolError::Rebind {
                    bound: current.to_string(),
                    requested: client_id,
                });
            }
            coordinator.register(&client_id, is_ready, connection.clone()).await;
        }
        (ClientMessage::Ready { .. }, None) => {
            return Err(ProtocolError::ExpectedRegister("ready".to_string()));
        }
        (ClientMessage::Ready { client_id, is_ready }, Some(current)) => {
            if let Some(claimed) = client_id.as_deref().filter(|claimed| *claimed != current) {
                log::warn!("Ready from '{current}' claims clientID '{claimed}', using '{current}'");
            }
            coordinator.ready(current, is_ready).await;
        }
    }
    Ok(())
}

/// Drain a connection's outbound queue into its socket.
async fn write_frames(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<Frame>,
    addr: SocketAddr,
) {
    while let Some(frame) = outbound.recv().await {
        let (message, last) = match frame {
            Frame::Text(text) => (Message::text(text.to_string()), false),
            Frame::Ping => (Message::Ping(Vec::new().into()), false),
            Frame::Close => (Message::Close(None), true),
        };
        if let Err(e) = sink.send(message).await {
            log::debug!("Write to {addr} failed: {e}");
            break;
        }
        if last {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::OverallState;

    fn coordinator(expected_users: usize) -> Coordinator {
        Coordinator::new(
            CoordinatorConfig {
                expected_users,
                ..Default::default()
            },
            Arc::new(StaticContent::new(false)),
        )
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.outbound_capacity, 64);
        assert_eq!(config.coordinator.expected_users, 10);
        assert_eq!(config.heartbeat.ping_interval, Duration::from_millis(500));
        assert_eq!(config.content_poll_interval, Duration::from_secs(1));
        assert_eq!(
            config.content_path.as_deref(),
            Some(std::path::Path::new("uploads/current_image.png"))
        );
    }

    #[test]
    fn test_server_creation() {
        let server = RevealServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8080");
        assert_eq!(server.coordinator().config().expected_users, 10);
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = RevealServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.protocol_violations, 0);
        assert_eq!(stats.heartbeat_timeouts, 0);
    }

    #[tokio::test]
    async fn test_dispatch_register_binds_identity() {
        let coord = coordinator(2);
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut bound = None;

        dispatch(&coord, &conn, &mut bound, r#"{"type":"register","clientId":"a","isReady":false}"#)
            .await
            .unwrap();
        assert_eq!(bound.as_deref(), Some("a"));
        assert!(coord.has_session("a").await);
    }

    #[tokio::test]
    async fn test_dispatch_first_message_must_register() {
        let coord = coordinator(2);
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut bound = None;

        let err = dispatch(&coord, &conn, &mut bound, r#"{"type":"ready","isReady":true}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ExpectedRegister(kind) if kind == "ready"));

        let err = dispatch(&coord, &conn, &mut bound, r#"{"type":"hello"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ExpectedRegister(kind) if kind == "hello"));

        assert!(bound.is_none());
        assert_eq!(coord.ready_data().await.total_count, 0);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type_after_register_is_ignored() {
        let coord = coordinator(2);
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut bound = None;

        dispatch(&coord, &conn, &mut bound, r#"{"type":"register","clientId":"a"}"#)
            .await
            .unwrap();
        dispatch(&coord, &conn, &mut bound, r#"{"type":"wave"}"#)
            .await
            .unwrap();
        assert_eq!(coord.ready_data().await.total_count, 1);
    }

    #[tokio::test]
    async fn test_dispatch_ready_uses_bound_identity() {
        let coord = coordinator(2);
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut bound = None;

        dispatch(&coord, &conn, &mut bound, r#"{"type":"register","clientId":"a"}"#)
            .await
            .unwrap();
        dispatch(&coord, &conn, &mut bound, r#"{"type":"ready","clientId":"mallory","isReady":true}"#)
            .await
            .unwrap();

        assert_eq!(coord.is_ready("a").await, Some(true));
        assert!(!coord.has_session("mallory").await);
    }

    #[tokio::test]
    async fn test_dispatch_rebind_is_rejected() {
        let coord = coordinator(2);
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut bound = None;

        dispatch(&coord, &conn, &mut bound, r#"{"type":"register","clientId":"a"}"#)
            .await
            .unwrap();
        let err = dispatch(&coord, &conn, &mut bound, r#"{"type":"register","clientId":"b"}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Rebind { .. }));
        assert!(!coord.has_session("b").await);
    }

    #[tokio::test]
    async fn test_dispatch_malformed() {
        let coord = coordinator(2);
        let (conn, _rx) = ConnectionHandle::new(8);
        let mut bound = None;

        let err = dispatch(&coord, &conn, &mut bound, "{nope").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(coord.overall_state().await, OverallState::WaitingForUsers);
    }
}
