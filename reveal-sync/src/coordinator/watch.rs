//! Upload detection.
//!
//! The content probe is polled on an interval; a revision that differs from
//! the last one seen is announced to every client as `image_updated`.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::Coordinator;
use crate::content::ContentRevision;

impl Coordinator {
    /// Poll the content probe every `poll_interval` until the task is aborted.
    pub fn watch_content(&self, poll_interval: Duration) -> JoinHandle<()> {
        let coordinator = self.clone();
        let poll_interval = poll_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut seen = coordinator.inner.content.revision().await;
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                coordinator.check_content(&mut seen).await;
            }
        })
    }

    /// Announce the content if it changed since `seen`.
    ///
    /// Returns whether `image_updated` went out. Removal is logged only.
    pub(crate) async fn check_content(&self, seen: &mut Option<ContentRevision>) -> bool {
        let current = self.inner.content.revision().await;
        if current == *seen {
            return false;
        }
        *seen = current;
        if current.is_some() {
            self.announce_image_updated().await;
            true
        } else {
            log::info!("Shared content removed");
            false
        }
    }
}
