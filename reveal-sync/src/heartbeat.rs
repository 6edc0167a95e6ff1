//! Per-connection liveness schedule, independent of the JSON protocol.
//!
//! ```text
//! connect ──(interval)──► ping ──► pong ──(interval)──► ping ──► …
//!    └──────── deadline = last pong + interval + tolerance ────────┘
//! ```
//!
//! The read loop races the socket against [`Heartbeat::deadline`]; missing
//! it is a read failure and takes the ordinary disconnect path. This catches
//! peers that vanish without ever sending a close frame.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Delay between a pong (or connect) and the next ping.
    pub ping_interval: Duration,
    /// Extra time a peer gets to answer a ping.
    pub pong_tolerance: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_millis(500),
            pong_tolerance: Duration::from_millis(500),
        }
    }
}

impl HeartbeatConfig {
    /// Longest silence tolerated after the last pong.
    pub fn window(&self) -> Duration {
        self.ping_interval + self.pong_tolerance
    }
}

#[derive(Debug, Clone)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    /// `None` while a ping is outstanding.
    next_ping: Option<Instant>,
    deadline: Instant,
    pongs: u64,
}

impl Heartbeat {
    pub fn start(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            next_ping: Some(now + config.ping_interval),
            deadline: now + config.window(),
            pongs: 0,
        }
    }

    /// A pong arrived: push the deadline out and schedule the next probe.
    pub fn on_pong(&mut self, now: Instant) {
        self.pongs += 1;
        self.deadline = now + self.config.window();
        self.next_ping = Some(now + self.config.ping_interval);
    }

    /// The scheduled ping went out; no further ping until the next pong.
    pub fn ping_sent(&mut self) {
        self.next_ping = None;
    }

    pub fn next_ping(&self) -> Option<Instant> {
        self.next_ping
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn pongs(&self) -> u64 {
        self.pongs
    }
}

/// Sleep until `at`, or forever when nothing is scheduled.
pub async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
