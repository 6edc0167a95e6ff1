//! Session registry: identity → session record.
//!
//! The registry is plain data. It is only ever reached through the
//! coordinator's lock, so none of these methods synchronize on their own.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::task::JoinHandle;

use crate::connection::ConnectionHandle;

/// What happens to a session's readiness when its identity registers again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectReadiness {
    /// Take readiness from the incoming register message.
    #[default]
    FromMessage,
    /// Keep the value the session had before the reconnect.
    Preserve,
    /// Always start the reconnected session as not ready.
    Clear,
}

impl ReconnectReadiness {
    fn resolve(self, previous: bool, incoming: bool) -> bool {
        match self {
            Self::FromMessage => incoming,
            Self::Preserve => previous,
            Self::Clear => false,
        }
    }
}

impl FromStr for ReconnectReadiness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "from-message" => Ok(Self::FromMessage),
            "preserve" => Ok(Self::Preserve),
            "clear" => Ok(Self::Clear),
            other => Err(format!(
                "unknown reconnect readiness '{other}' (expected from-message, preserve or clear)"
            )),
        }
    }
}

impl fmt::Display for ReconnectReadiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FromMessage => "from-message",
            Self::Preserve => "preserve",
            Self::Clear => "clear",
        })
    }
}

/// Pending deferred eviction for one session.
///
/// The token identifies this particular timer; an eviction only applies if
/// the session still holds the same token when it runs.
#[derive(Debug)]
pub struct RemovalTimer {
    token: u64,
    task: JoinHandle<()>,
}

impl RemovalTimer {
    pub fn new(token: u64, task: JoinHandle<()>) -> Self {
        Self { token, task }
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Stop the timer. A no-op if it already fired.
    pub fn cancel(self) {
        self.task.abort();
    }
}

/// One registered identity.
#[derive(Debug)]
pub struct ClientSession {
    pub id: String,
    pub connection: ConnectionHandle,
    pub is_ready: bool,
    /// Last liveness evidence: register, ready or a heartbeat pong.
    pub last_seen: DateTime<Utc>,
    removal_timer: Option<RemovalTimer>,
}

impl ClientSession {
    pub fn new(id: impl Into<String>, is_ready: bool, connection: ConnectionHandle) -> Self {
        Self {
            id: id.into(),
            connection,
            is_ready,
            last_seen: Utc::now(),
            removal_timer: None,
        }
    }

    pub fn has_pending_removal(&self) -> bool {
        self.removal_timer.is_some()
    }

    pub fn removal_token(&self) -> Option<u64> {
        self.removal_timer.as_ref().map(RemovalTimer::token)
    }

    /// Install a timer, handing back any timer that was already pending.
    pub fn replace_removal_timer(&mut self, timer: RemovalTimer) -> Option<RemovalTimer> {
        self.removal_timer.replace(timer)
    }

    pub fn take_removal_timer(&mut self) -> Option<RemovalTimer> {
        self.removal_timer.take()
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}

/// Barrier counts, always derived from the sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadyData {
    pub ready_count: usize,
    pub total_count: usize,
}

impl ReadyData {
    /// Barrier condition: a non-empty room where every session is ready.
    pub fn all_ready(&self) -> bool {
        self.total_count >= 1 && self.ready_count >= self.total_count
    }
}

/// Result of [`SessionRegistry::register_or_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub is_new: bool,
    /// Readiness the session ended up with after the policy was applied.
    pub is_ready: bool,
    /// Whether a pending eviction was cancelled by this registration.
    pub cancelled_removal: bool,
    pub ready: ReadyData,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, ClientSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session, or rebind an existing identity to a new connection.
    ///
    /// Rebinding cancels any pending eviction in the same call, so a timer
    /// can never remove a session that was just reused.
    pub fn register_or_update(
        &mut self,
        id: &str,
        is_ready: bool,
        connection: ConnectionHandle,
        policy: ReconnectReadiness,
    ) -> Registration {
        let (is_new, effective, cancelled_removal) = match self.sessions.get_mut(id) {
            Some(session) => {
                let cancelled = match session.take_removal_timer() {
                    Some(timer) => {
                        timer.cancel();
                        true
                    }
                    None => false,
                };
                session.connection = connection;
                session.is_ready = policy.resolve(session.is_ready, is_ready);
                session.touch();
                (false, session.is_ready, cancelled)
            }
            None => {
                self.sessions
                    .insert(id.to_string(), ClientSession::new(id, is_ready, connection));
                (true, is_ready, false)
            }
        };

        Registration {
            is_new,
            is_ready: effective,
            cancelled_removal,
            ready: self.ready_data(),
        }
    }

    /// Update a session's vote, returning the previous value.
    pub fn set_ready(&mut self, id: &str, is_ready: bool) -> Option<bool> {
        let session = self.sessions.get_mut(id)?;
        let previous = session.is_ready;
        session.is_ready = is_ready;
        session.touch();
        Some(previous)
    }

    /// Delete a session. A missing identity means an eviction lost a race.
    pub fn remove(&mut self, id: &str) -> bool {
        if self.sessions.remove(id).is_some() {
            true
        } else {
            log::error!("Removing non-existing client '{id}'");
            false
        }
    }

    /// Linear count of ready sessions.
    pub fn ready_data(&self) -> ReadyData {
        ReadyData {
            ready_count: self.sessions.values().filter(|s| s.is_ready).count(),
            total_count: self.sessions.len(),
        }
    }

    pub fn clear_readiness(&mut self) {
        for session in self.sessions.values_mut() {
            session.is_ready = false;
        }
    }

    /// Copy of every live connection handle.
    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.sessions
            .values()
            .filter(|s| !s.connection.is_closed())
            .map(|s| s.connection.clone())
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&ClientSession> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut ClientSession> {
        self.sessions.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
