//! WebSocket client for the reveal server.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect)
//! - Registration and readiness votes
//! - A locally derived view of the room, including the `Displaying` phase
//!   that starts once the shared reveal instant has passed

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{parse_timestamp, ClientMessage, ProtocolError, ServerMessage, StateSnapshot};
use crate::state::OverallState;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Phase as seen by a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalPhase {
    WaitingForUsers,
    WaitingForReady,
    /// Triggered, reveal instant still ahead
    Triggered,
    /// Triggered and the reveal instant has passed
    Displaying,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// Connection established and `register` sent
    Connected,
    FullState(StateSnapshot),
    PartialState {
        client_id: String,
        is_ready: bool,
        ready_count: usize,
        total_count: usize,
    },
    /// The barrier was satisfied; reveal at `target`
    Start {
        target: DateTime<Utc>,
        ready_count: usize,
        total_count: usize,
    },
    ImageUpdated,
    /// The server rejected something we sent and is closing
    ServerError(String),
    Disconnected,
}

/// Local mirror of the room, folded from server messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientView {
    pub ready_count: usize,
    pub total_count: usize,
    pub overall_state: OverallState,
    pub has_image: bool,
    pub target: Option<DateTime<Utc>>,
}

impl Default for ClientView {
    fn default() -> Self {
        Self {
            ready_count: 0,
            total_count: 0,
            overall_state: OverallState::WaitingForUsers,
            has_image: false,
            target: None,
        }
    }
}

impl ClientView {
    /// Fold one event into the view.
    pub fn apply(&mut self, event: &ClientEvent) {
        match event {
            ClientEvent::FullState(state) => {
                self.ready_count = state.ready_count;
                self.total_count = state.total_count;
                self.overall_state = state.overall_state;
                self.has_image = state.has_image;
                self.target = if state.target_time_utc.is_empty() {
                    None
                } else {
                    parse_timestamp(&state.target_time_utc).ok()
                };
            }
            ClientEvent::PartialState {
                ready_count,
                total_count,
                ..
            } => {
                self.ready_count = *ready_count;
                self.total_count = *total_count;
            }
            ClientEvent::Start {
                target,
                ready_count,
                total_count,
            } => {
                self.ready_count = *ready_count;
                self.total_count = *total_count;
                self.overall_state = OverallState::Triggered;
                self.target = Some(*target);
            }
            ClientEvent::ImageUpdated => self.has_image = true,
            ClientEvent::Connected | ClientEvent::ServerError(_) | ClientEvent::Disconnected => {}
        }
    }

    pub fn phase(&self, now: DateTime<Utc>) -> LocalPhase {
        match (self.overall_state, self.target) {
            (OverallState::WaitingForUsers, _) => LocalPhase::WaitingForUsers,
            (OverallState::WaitingForReady, _) => LocalPhase::WaitingForReady,
            (OverallState::Triggered, Some(target)) if now >= target => LocalPhase::Displaying,
            (OverallState::Triggered, _) => LocalPhase::Triggered,
        }
    }
}

/// Translate a server message into an event. `None` for messages we drop.
fn to_event(message: ServerMessage) -> Option<ClientEvent> {
    match message {
        ServerMessage::FullState { state } => Some(ClientEvent::FullState(state)),
        ServerMessage::PartialState {
            client_id,
            is_ready,
            ready_count,
            total_count,
        } => Some(ClientEvent::PartialState {
            client_id,
            is_ready,
            ready_count,
            total_count,
        }),
        ServerMessage::Start {
            target_timestamp_utc,
            ready_count,
            total_count,
        } => match parse_timestamp(&target_timestamp_utc) {
            Ok(target) => Some(ClientEvent::Start {
                target,
                ready_count,
                total_count,
            }),
            Err(e) => {
                log::warn!("Dropping start message: {e}");
                None
            }
        },
        ServerMessage::ImageUpdated => Some(ClientEvent::ImageUpdated),
        ServerMessage::Error { error } => Some(ClientEvent::ServerError(error)),
    }
}

/// The reveal client.
pub struct RevealClient {
    client_id: String,

    /// Server URL
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Room as last reported by the server
    view: Arc<RwLock<ClientView>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ClientEvent>>,

    /// Event sender (held by reader task)
    event_tx: mpsc::Sender<ClientEvent>,
}

impl RevealClient {
    pub fn new(server_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            client_id: client_id.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            view: Arc::new(RwLock::new(ClientView::default())),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect and register with the given readiness.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self, is_ready: bool) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionFailed(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_writer.send(message).await.is_err() || closing {
                    break;
                }
            }
        });

        let register = ClientMessage::register(self.client_id.clone(), is_ready).encode()?;
        out_tx
            .send(Message::text(register))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx);

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let view = self.view.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        let event = match ServerMessage::decode(text.as_str()) {
                            Ok(message) => to_event(message),
                            Err(e) => {
                                log::warn!("Failed to decode server message: {e}");
                                None
                            }
                        };
                        if let Some(event) = event {
                            view.write().await.apply(&event);
                            let _ = event_tx.send(event).await;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Cast a barrier vote.
    pub async fn set_ready(&self, is_ready: bool) -> Result<(), ProtocolError> {
        let encoded = ClientMessage::ready(self.client_id.clone(), is_ready).encode()?;
        self.send_raw(encoded).await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(Message::text(text.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }

    /// Send a close frame and stop writing.
    pub async fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None)).await;
        }
        *self.state.write().await = ConnectionState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn view(&self) -> ClientView {
        self.view.read().await.clone()
    }

    pub async fn phase(&self) -> LocalPhase {
        self.view.read().await.phase(Utc::now())
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
