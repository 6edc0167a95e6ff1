//! Disconnect grace period.
//!
//! A dropped connection does not remove its session right away. The session
//! is marked not ready and an eviction is scheduled; registering the same
//! identity before it fires cancels it.

use std::time::Duration;

use super::{partial_state, Coordinator};
use crate::connection::ConnectionId;
use crate::protocol::format_timestamp;
use crate::session::RemovalTimer;

/// What [`Coordinator::disconnect`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// No session exists for the identity.
    Unknown,
    /// The identity is already bound to a newer connection.
    Stale,
    /// Eviction scheduled after the grace period.
    Scheduled,
}

impl Coordinator {
    /// Handle the end of `connection_id`, the connection `client_id` was bound to.
    pub async fn disconnect(&self, client_id: &str, connection_id: ConnectionId) -> DisconnectOutcome {
        let grace = self.inner.config.grace_period;
        let (ready, last_seen, connections) = {
            let mut state = self.inner.state.lock().await;
            let Some(session) = state.sessions.get_mut(client_id) else {
                log::error!("Disconnect for unknown clientID: {client_id}");
                return DisconnectOutcome::Unknown;
            };
            if session.connection.id() != connection_id {
                log::debug!("Ignoring disconnect of replaced connection for clientID: {client_id}");
                return DisconnectOutcome::Stale;
            }

            session.is_ready = false;
            let last_seen = session.last_seen;
            let token = self.next_timer_token();
            let timer = RemovalTimer::new(token, self.spawn_eviction(client_id, token, grace));
            if let Some(previous) = session.replace_removal_timer(timer) {
                log::error!("clientID {client_id} disconnected twice, replacing its removal timer");
                previous.cancel();
            }

            state.shrink_if_short();
            (state.ready_data(), last_seen, state.sessions.connections())
        };

        log::info!(
            "Client disconnected: {client_id} (last seen {}), removal in {grace:?}",
            format_timestamp(last_seen)
        );
        self.deliver(&connections, &partial_state(client_id, false, ready));
        DisconnectOutcome::Scheduled
    }

    /// Remove `client_id` if its pending eviction is still the one tagged `token`.
    ///
    /// Returns whether the session was removed.
    pub(crate) async fn evict(&self, client_id: &str, token: u64) -> bool {
        let (ready, connections) = {
            let mut state = self.inner.state.lock().await;
            let current = state.sessions.get(client_id).and_then(|s| s.removal_token());
            if current != Some(token) {
                drop(state);
                log::debug!("Eviction of clientID {client_id} superseded");
                return false;
            }
            // Dropping the session drops its timer without aborting it; this
            // task is that timer.
            state.sessions.remove(client_id);
            state.shrink_if_short();
            (state.ready_data(), state.sessions.connections())
        };

        log::info!(
            "Removed clientID: {client_id} after grace period ({}/{} ready)",
            ready.ready_count,
            ready.total_count
        );
        self.deliver(&connections, &partial_state(client_id, false, ready));
        true
    }

    fn spawn_eviction(&self, client_id: &str, token: u64, grace: Duration) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        let client_id = client_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            coordinator.evict(&client_id, token).await;
        })
    }
}
