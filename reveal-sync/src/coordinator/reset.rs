//! End-of-round reset.
//!
//! Once triggered, the room stays `Triggered` until `reset_delay` after the
//! reveal instant, then returns to `WaitingForReady` with every vote cleared
//! so the next round can begin.

use chrono::Utc;
use tokio::task::JoinHandle;

use super::Coordinator;
use crate::protocol::{parse_timestamp, ServerMessage};

impl Coordinator {
    /// Schedule the soft reset for the round revealing at `target_utc`.
    ///
    /// An unparseable instant is logged and no reset is scheduled.
    pub(crate) fn schedule_reset(&self, target_utc: &str) -> Option<JoinHandle<()>> {
        let target = match parse_timestamp(target_utc) {
            Ok(target) => target,
            Err(e) => {
                log::error!("Not scheduling reset: {e}");
                return None;
            }
        };

        let until_reveal = (target - Utc::now()).to_std().unwrap_or_default();
        let delay = until_reveal.saturating_add(self.inner.config.reset_delay);
        log::debug!("Soft reset scheduled in {delay:?}");

        let coordinator = self.clone();
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            coordinator.soft_reset().await;
        }))
    }

    /// Leave `Triggered`, clear every vote and push a fresh `full_state`.
    pub async fn soft_reset(&self) {
        let (view, connections) = {
            let mut state = self.inner.state.lock().await;
            state.soft_reset();
            state.shrink_if_short();
            (state.view(), state.sessions.connections())
        };

        log::info!("Round over, state reset to {}", view.overall_state);
        let full_state = ServerMessage::FullState {
            state: view.into_snapshot(self.inner.content.has_content().await),
        };
        self.deliver(&connections, &full_state);
    }
}
