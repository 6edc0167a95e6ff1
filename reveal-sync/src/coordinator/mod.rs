//! Locked entry points into the coordination state.
//!
//! ```text
//!  read loops ──register/ready──┐
//!  grace timers ──evict─────────┼──► Mutex<CoordinationState> ──► decisions
//!  reset task ──soft reset──────┘                                    │
//!                                                   (lock released)  ▼
//!                                                          Broadcaster::fan_out
//! ```
//!
//! Each entry point takes the lock once, does pointer and counter
//! bookkeeping, copies out what it needs, releases, and only then talks to
//! the network. Because the barrier is evaluated inside that one critical
//! section, two concurrent `ready` messages cannot both win the trigger.
//!
//! - [`grace`]: disconnect handling and deferred eviction
//! - [`reset`]: the deferred end-of-round soft reset
//! - [`watch`]: polls the content probe and announces new uploads

mod grace;
mod reset;
mod watch;

pub use grace::DisconnectOutcome;

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::broadcast::{BroadcastStats, Broadcaster};
use crate::connection::{ConnectionHandle, ConnectionId};
use crate::content::ContentProbe;
use crate::protocol::{format_timestamp, ServerMessage, StateSnapshot};
use crate::session::{ReadyData, ReconnectReadiness, Registration};
use crate::state::{CoordinationState, OverallState};

/// Tunables of the barrier protocol.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Room size at which readiness starts to matter.
    pub expected_users: usize,
    /// Barrier satisfied → reveal instant.
    pub lead_time: Duration,
    /// Reveal instant → soft reset.
    pub reset_delay: Duration,
    /// Disconnect → eviction, unless the identity registers again.
    pub grace_period: Duration,
    pub reconnect_readiness: ReconnectReadiness,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            expected_users: 10,
            lead_time: Duration::from_secs(3),
            reset_delay: Duration::from_secs(2),
            grace_period: Duration::from_secs(5),
            reconnect_readiness: ReconnectReadiness::FromMessage,
        }
    }
}

/// Result of a `ready` message from a registered identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyOutcome {
    pub ready: ReadyData,
    /// Wire-form reveal instant, present when this message won the trigger.
    pub triggered: Option<String>,
}

struct Inner {
    config: CoordinatorConfig,
    state: Mutex<CoordinationState>,
    content: Arc<dyn ContentProbe>,
    broadcaster: Broadcaster,
    next_timer_token: AtomicU64,
}

/// Owner of the single room. Cheap to clone; clones share the room.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, content: Arc<dyn ContentProbe>) -> Self {
        let state = CoordinationState::new(config.expected_users);
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(state),
                content,
                broadcaster: Broadcaster::new(),
                next_timer_token: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Bind `client_id` to `connection`, creating the session if needed.
    ///
    /// Sends `full_state` to the registering connection and broadcasts
    /// `partial_state` to everyone.
    pub async fn register(
        &self,
        client_id: &str,
        is_ready: bool,
        connection: ConnectionHandle,
    ) -> Registration {
        let (registration, view, connections) = {
            let mut state = self.inner.state.lock().await;
            let registration = state.sessions.register_or_update(
                client_id,
                is_ready,
                connection.clone(),
                self.inner.config.reconnect_readiness,
            );
            if registration.is_new && state.admit_if_full() {
                log::info!(
                    "Room reached {} users, waiting for ready",
                    registration.ready.total_count
                );
            }
            (registration, state.view(), state.sessions.connections())
        };

        if registration.is_new {
            log::info!("Registering clientID: {client_id}");
        } else if registration.cancelled_removal {
            log::info!("Reconnecting clientID: {client_id}, pending removal cancelled");
        } else {
            log::info!("Reconnecting clientID: {client_id}");
        }

        let full_state = ServerMessage::FullState {
            state: view.into_snapshot(self.inner.content.has_content().await),
        };
        if let Err(e) = connection.send(&full_state) {
            log::warn!("Failed to send full state to {client_id}: {e}");
        }

        self.deliver(
            &connections,
            &partial_state(client_id, registration.is_ready, registration.ready),
        );
        registration
    }

    /// Record a barrier vote and evaluate the trigger.
    ///
    /// Returns `None` for an identity with no session.
    pub async fn ready(&self, client_id: &str, is_ready: bool) -> Option<ReadyOutcome> {
        let (ready, target, connections) = {
            let mut state = self.inner.state.lock().await;
            if state.sessions.set_ready(client_id, is_ready).is_none() {
                drop(state);
                log::info!("Received 'ready' from unknown clientID: {client_id}");
                return None;
            }
            let ready = state.ready_data();
            let target = state.try_trigger(Utc::now(), self.inner.config.lead_time);
            (ready, target, state.sessions.connections())
        };

        let triggered = match target {
            Some(target) => {
                let target_utc = format_timestamp(target);
                log::info!(
                    "All {} clients ready, revealing at {target_utc}",
                    ready.total_count
                );
                self.deliver(
                    &connections,
                    &ServerMessage::Start {
                        target_timestamp_utc: target_utc.clone(),
                        ready_count: ready.ready_count,
                        total_count: ready.total_count,
                    },
                );
                self.schedule_reset(&target_utc);
                Some(target_utc)
            }
            None => {
                self.deliver(&connections, &partial_state(client_id, is_ready, ready));
                None
            }
        };

        Some(ReadyOutcome { ready, triggered })
    }

    /// Current room snapshot. The content probe runs after the lock is released.
    pub async fn snapshot(&self) -> StateSnapshot {
        let view = self.inner.state.lock().await.view();
        view.into_snapshot(self.inner.content.has_content().await)
    }

    pub async fn full_state(&self) -> ServerMessage {
        ServerMessage::FullState {
            state: self.snapshot().await,
        }
    }

    pub async fn overall_state(&self) -> OverallState {
        self.inner.state.lock().await.overall_state()
    }

    pub async fn ready_data(&self) -> ReadyData {
        self.inner.state.lock().await.ready_data()
    }

    /// Readiness of one identity, `None` if it has no session.
    pub async fn is_ready(&self, client_id: &str) -> Option<bool> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(client_id)
            .map(|s| s.is_ready)
    }

    pub async fn has_session(&self, client_id: &str) -> bool {
        self.inner.state.lock().await.sessions.contains(client_id)
    }

    /// Last liveness evidence recorded for `client_id`.
    pub async fn last_seen(&self, client_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(client_id)
            .map(|s| s.last_seen)
    }

    /// Record liveness of `client_id` seen on `connection_id`.
    ///
    /// Ignored if the identity has since moved to another connection.
    pub async fn touch(&self, client_id: &str, connection_id: ConnectionId) -> bool {
        let mut state = self.inner.state.lock().await;
        match state.sessions.get_mut(client_id) {
            Some(session) if session.connection.id() == connection_id => {
                session.touch();
                true
            }
            _ => false,
        }
    }

    pub async fn has_pending_removal(&self, client_id: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .sessions
            .get(client_id)
            .is_some_and(|s| s.has_pending_removal())
    }

    /// Tell every client the shared content changed.
    pub async fn announce_image_updated(&self) -> usize {
        log::info!("Shared content updated");
        self.broadcast(&ServerMessage::ImageUpdated).await
    }

    /// Snapshot live connections under the lock, release, then fan out.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let connections = self.inner.state.lock().await.sessions.connections();
        self.deliver(&connections, message)
    }

    pub fn broadcast_stats(&self) -> BroadcastStats {
        self.inner.broadcaster.stats()
    }

    /// Enqueue on a snapshot taken under the lock. Never called with it held.
    fn deliver(&self, connections: &[ConnectionHandle], message: &ServerMessage) -> usize {
        match self.inner.broadcaster.fan_out(connections, message) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to encode {} for broadcast: {e}", message.kind());
                0
            }
        }
    }

    fn next_timer_token(&self) -> u64 {
        self.inner.next_timer_token.fetch_add(1, Ordering::Relaxed)
    }
}

fn partial_state(client_id: &str, is_ready: bool, ready: ReadyData) -> ServerMessage {
    ServerMessage::PartialState {
        client_id: client_id.to_string(),
        is_ready,
        ready_count: ready.ready_count,
        total_count: ready.total_count,
    }
}
