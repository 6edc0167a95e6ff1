//! Fan-out of one message to every live connection.
//!
//! The caller snapshots connection handles under the coordinator lock,
//! releases it, then hands the snapshot to [`Broadcaster::fan_out`]. The
//! message is encoded once and the same `Arc<str>` is enqueued on every
//! connection; the socket writes then proceed independently in each
//! connection's writer task.
//!
//! A failed delivery is logged and counted, nothing more. The affected peer
//! finds out through its own heartbeat and takes the disconnect path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::connection::ConnectionHandle;
use crate::protocol::{ProtocolError, ServerMessage};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub deliveries: u64,
    pub deliveries_failed: u64,
}

/// Atomic broadcast stats, lock-free on the hot path.
#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    deliveries: AtomicU64,
    deliveries_failed: AtomicU64,
}

/// Shared fan-out primitive used by every broadcast call site.
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    stats: Arc<AtomicBroadcastStats>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `message` to each connection independently.
    ///
    /// Must be called without the coordinator lock held. Returns the number
    /// of connections the message was enqueued on.
    pub fn fan_out(
        &self,
        connections: &[ConnectionHandle],
        message: &ServerMessage,
    ) -> Result<usize, ProtocolError> {
        let encoded: Arc<str> = message.encode()?.into();
        Ok(self.fan_out_raw(connections, encoded, message.kind()))
    }

    /// Fan out pre-encoded text (zero-copy fast path).
    pub fn fan_out_raw(&self, connections: &[ConnectionHandle], encoded: Arc<str>, kind: &str) -> usize {
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        for connection in connections {
            self.stats.deliveries.fetch_add(1, Ordering::Relaxed);
            match connection.send_text(encoded.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    self.stats.deliveries_failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!("Error broadcasting {kind} to connection {}: {e}", connection.id());
                }
            }
        }

        log::trace!("Broadcast {kind} to {delivered}/{} connections", connections.len());
        delivered
    }

    /// Lock-free snapshot of the counters.
    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            deliveries_failed: self.stats.deliveries_failed.load(Ordering::Relaxed),
        }
    }
}
