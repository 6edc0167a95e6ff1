//! Coordination state machine.
//!
//! ```text
//!                 total ≥ expected                all ready
//! WaitingForUsers ───────────────► WaitingForReady ─────────► Triggered
//!        ▲                          │        ▲                    │
//!        └──────────────────────────┘        └────────────────────┘
//!              total < expected                 reset timer fired
//! ```
//!
//! Every method here is synchronous and expects the caller to hold the
//! coordinator lock. No other edge than the four drawn above is taken.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::protocol::{format_timestamp, StateSnapshot};
use crate::session::{ReadyData, SessionRegistry};

/// Server-side phase of the room.
///
/// `Displaying` exists only on clients, once the reveal instant has passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverallState {
    WaitingForUsers,
    WaitingForReady,
    Triggered,
}

impl fmt::Display for OverallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::WaitingForUsers => "WaitingForUsers",
            Self::WaitingForReady => "WaitingForReady",
            Self::Triggered => "Triggered",
        })
    }
}

/// The single room: sessions plus the barrier phase.
#[derive(Debug)]
pub struct CoordinationState {
    pub(crate) sessions: SessionRegistry,
    expected_users: usize,
    overall_state: OverallState,
    /// Set iff `overall_state == Triggered`.
    target_show_time: Option<DateTime<Utc>>,
}

/// Lock-free copy of the fields a `full_state` needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateView {
    pub ready: ReadyData,
    pub overall_state: OverallState,
    pub target_show_time: Option<DateTime<Utc>>,
}

impl StateView {
    pub fn into_snapshot(self, has_image: bool) -> StateSnapshot {
        StateSnapshot {
            ready_count: self.ready.ready_count,
            total_count: self.ready.total_count,
            overall_state: self.overall_state,
            has_image,
            target_time_utc: self
                .target_show_time
                .map(format_timestamp)
                .unwrap_or_default(),
        }
    }
}

impl CoordinationState {
    pub fn new(expected_users: usize) -> Self {
        Self {
            sessions: SessionRegistry::new(),
            expected_users: expected_users.max(1),
            overall_state: OverallState::WaitingForUsers,
            target_show_time: None,
        }
    }

    pub fn overall_state(&self) -> OverallState {
        self.overall_state
    }

    pub fn target_show_time(&self) -> Option<DateTime<Utc>> {
        self.target_show_time
    }

    pub fn expected_users(&self) -> usize {
        self.expected_users
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionRegistry {
        &mut self.sessions
    }

    pub fn ready_data(&self) -> ReadyData {
        self.sessions.ready_data()
    }

    pub fn view(&self) -> StateView {
        StateView {
            ready: self.ready_data(),
            overall_state: self.overall_state,
            target_show_time: self.target_show_time,
        }
    }

    /// `WaitingForUsers → WaitingForReady` once the room is full.
    pub fn admit_if_full(&mut self) -> bool {
        if self.overall_state == OverallState::WaitingForUsers
            && self.sessions.len() >= self.expected_users
        {
            self.overall_state = OverallState::WaitingForReady;
            true
        } else {
            false
        }
    }

    /// `WaitingForReady → WaitingForUsers` once the room drops below size.
    pub fn shrink_if_short(&mut self) -> bool {
        if self.overall_state == OverallState::WaitingForReady
            && self.sessions.len() < self.expected_users
        {
            self.overall_state = OverallState::WaitingForUsers;
            true
        } else {
            false
        }
    }

    /// `WaitingForReady → Triggered` when every current member is ready.
    ///
    /// Compares against the current room size, not `expected_users`.
    /// Returns the reveal instant when this call won the trigger. A lead time
    /// that overflows the calendar leaves the room in `WaitingForReady`.
    pub fn try_trigger(&mut self, now: DateTime<Utc>, lead_time: Duration) -> Option<DateTime<Utc>> {
        if self.overall_state != OverallState::WaitingForReady || !self.ready_data().all_ready() {
            return None;
        }
        let Some(target) = TimeDelta::from_std(lead_time)
            .ok()
            .and_then(|lead| now.checked_add_signed(lead))
        else {
            log::error!("Lead time {lead_time:?} puts the reveal out of range, not triggering");
            return None;
        };
        self.overall_state = OverallState::Triggered;
        self.target_show_time = Some(target);
        Some(target)
    }

    /// `Triggered → WaitingForReady`: clear the target and every vote.
    ///
    /// Unconditional on which trigger scheduled it; only one trigger can be
    /// outstanding. Returns whether the state actually left `Triggered`.
    pub fn soft_reset(&mut self) -> bool {
        self.target_show_time = None;
        self.sessions.clear_readiness();
        if self.overall_state == OverallState::Triggered {
            self.overall_state = OverallState::WaitingForReady;
            true
        } else {
            log::warn!(
                "Soft reset ran while in {}, expected Triggered",
                self.overall_state
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionHandle;
    use crate::session::ReconnectReadiness;

    fn join(state: &mut CoordinationState, id: &str, ready: bool) {
        let (conn, _rx) = ConnectionHandle::new(4);
        state
            .sessions_mut()
            .register_or_update(id, ready, conn, ReconnectReadiness::default());
        state.admit_if_full();
    }

    fn assert_target_invariant(state: &CoordinationState) {
        assert_eq!(
            state.target_show_time().is_some(),
            state.overall_state() == OverallState::Triggered
        );
    }

    #[test]
    fn test_initial_state() {
        let state = CoordinationState::new(2);
        assert_eq!(state.overall_state(), OverallState::WaitingForUsers);
        assert_eq!(state.expected_users(), 2);
        assert!(state.target_show_time().is_none());
    }

    #[test]
    fn test_expected_users_at_least_one() {
        assert_eq!(CoordinationState::new(0).expected_users(), 1);
    }

    #[test]
    fn test_admit_when_full() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", false);
        assert_eq!(state.overall_state(), OverallState::WaitingForUsers);

        join(&mut state, "b", false);
        assert_eq!(state.overall_state(), OverallState::WaitingForReady);
        assert_eq!(state.ready_data(), ReadyData { ready_count: 0, total_count: 2 });
    }

    #[test]
    fn test_no_trigger_while_waiting_for_users() {
        let mut state = CoordinationState::new(3);
        join(&mut state, "a", true);
        join(&mut state, "b", true);
        assert!(state.try_trigger(Utc::now(), Duration::from_secs(3)).is_none());
        assert_eq!(state.overall_state(), OverallState::WaitingForUsers);
    }

    #[test]
    fn test_trigger_sets_target() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", true);
        join(&mut state, "b", false);
        let now = Utc::now();
        assert!(state.try_trigger(now, Duration::from_secs(3)).is_none());

        state.sessions_mut().set_ready("b", true);
        let target = state.try_trigger(now, Duration::from_secs(3)).unwrap();
        assert_eq!(target, now + TimeDelta::seconds(3));
        assert_eq!(state.overall_state(), OverallState::Triggered);
        assert_target_invariant(&state);
    }

    #[test]
    fn test_out_of_range_lead_time_does_not_trigger() {
        let mut state = CoordinationState::new(1);
        join(&mut state, "a", true);

        let lead_time = Duration::from_millis(10_000_000_000_000_000);
        assert!(state.try_trigger(Utc::now(), lead_time).is_none());
        assert!(state.try_trigger(Utc::now(), Duration::MAX).is_none());
        assert_eq!(state.overall_state(), OverallState::WaitingForReady);
        assert_target_invariant(&state);

        assert!(state.try_trigger(Utc::now(), Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_trigger_only_once() {
        let mut state = CoordinationState::new(1);
        join(&mut state, "a", true);
        assert!(state.try_trigger(Utc::now(), Duration::from_secs(1)).is_some());
        assert!(state.try_trigger(Utc::now(), Duration::from_secs(1)).is_none());
    }

    #[test]
    fn test_shrink_below_expected() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", false);
        join(&mut state, "b", false);

        state.sessions_mut().remove("a");
        assert!(state.shrink_if_short());
        assert_eq!(state.overall_state(), OverallState::WaitingForUsers);
    }

    #[test]
    fn test_shrink_does_not_leave_triggered() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", true);
        join(&mut state, "b", true);
        state.try_trigger(Utc::now(), Duration::from_secs(1)).unwrap();

        state.sessions_mut().remove("a");
        assert!(!state.shrink_if_short());
        assert_eq!(state.overall_state(), OverallState::Triggered);
        assert_target_invariant(&state);
    }

    #[test]
    fn test_shrunk_room_triggers_on_remaining_members() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", true);
        join(&mut state, "b", false);
        join(&mut state, "c", false);

        state.sessions_mut().remove("c");
        assert!(!state.shrink_if_short());
        state.sessions_mut().set_ready("b", true);
        assert!(state.try_trigger(Utc::now(), Duration::from_secs(1)).is_some());
    }

    #[test]
    fn test_soft_reset_clears_round() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", true);
        join(&mut state, "b", true);
        state.try_trigger(Utc::now(), Duration::from_secs(1)).unwrap();

        assert!(state.soft_reset());
        assert_eq!(state.overall_state(), OverallState::WaitingForReady);
        assert_eq!(state.ready_data(), ReadyData { ready_count: 0, total_count: 2 });
        assert_target_invariant(&state);
    }

    #[test]
    fn test_soft_reset_outside_triggered_keeps_phase() {
        let mut state = CoordinationState::new(2);
        join(&mut state, "a", true);
        assert!(!state.soft_reset());
        assert_eq!(state.overall_state(), OverallState::WaitingForUsers);
        assert_eq!(state.ready_data().ready_count, 0);
    }

    #[test]
    fn test_view_snapshot() {
        let mut state = CoordinationState::new(1);
        join(&mut state, "a", true);
        let snapshot = state.view().into_snapshot(false);
        assert_eq!(snapshot.overall_state, OverallState::WaitingForReady);
        assert_eq!(snapshot.target_time_utc, "");

        state.try_trigger(Utc::now(), Duration::from_secs(1)).unwrap();
        let snapshot = state.view().into_snapshot(true);
        assert!(snapshot.has_image);
        assert!(snapshot.target_time_utc.ends_with('Z'));
    }
}
