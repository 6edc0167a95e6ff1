//! Reveal server: synchronized reveal coordinator over WebSocket.
//!
//! Every flag can also be set through its `REVEAL_*` environment variable.
//! Log verbosity follows `RUST_LOG` and defaults to `info`.

use clap::Parser;
use log::{error, info};
use std::path::PathBuf;
use std::time::Duration;

use reveal_sync::coordinator::CoordinatorConfig;
use reveal_sync::heartbeat::HeartbeatConfig;
use reveal_sync::server::{RevealServer, ServerConfig};
use reveal_sync::session::ReconnectReadiness;

/// Upper bound for every delay flag: one day.
const MAX_DELAY_MS: u64 = 86_400_000;

/// Reveal - everyone sees it at the same instant
#[derive(Parser, Debug)]
#[command(name = "reveal-server", version, about = "Synchronized reveal coordinator")]
struct Args {
    /// Address to listen on
    #[arg(long, env = "REVEAL_BIND", default_value = "127.0.0.1:8080")]
    bind: String,

    /// Participants required before readiness counts
    #[arg(long, env = "REVEAL_EXPECTED_USERS", default_value_t = 10)]
    expected_users: usize,

    /// Delay between the last ready vote and the reveal, in milliseconds
    #[arg(long, env = "REVEAL_LEAD_TIME_MS", default_value_t = 3000,
          value_parser = clap::value_parser!(u64).range(..=MAX_DELAY_MS))]
    lead_time_ms: u64,

    /// Delay between the reveal and the next round, in milliseconds
    #[arg(long, env = "REVEAL_RESET_DELAY_MS", default_value_t = 2000,
          value_parser = clap::value_parser!(u64).range(..=MAX_DELAY_MS))]
    reset_delay_ms: u64,

    /// How long a dropped participant keeps its slot, in milliseconds
    #[arg(long, env = "REVEAL_GRACE_PERIOD_MS", default_value_t = 5000,
          value_parser = clap::value_parser!(u64).range(..=MAX_DELAY_MS))]
    grace_period_ms: u64,

    /// Heartbeat ping interval, in milliseconds
    #[arg(long, env = "REVEAL_PING_INTERVAL_MS", default_value_t = 500)]
    ping_interval_ms: u64,

    /// Extra time allowed for a pong, in milliseconds
    #[arg(long, env = "REVEAL_PONG_TOLERANCE_MS", default_value_t = 500)]
    pong_tolerance_ms: u64,

    /// Outbound queue size per connection
    #[arg(long, env = "REVEAL_OUTBOUND_CAPACITY", default_value_t = 64)]
    outbound_capacity: usize,

    /// File whose presence is reported as hasImage
    #[arg(long, env = "REVEAL_CONTENT_PATH", default_value = "uploads/current_image.png")]
    content_path: PathBuf,

    /// How often the content file is checked for a new upload, in milliseconds
    #[arg(long, env = "REVEAL_CONTENT_POLL_MS", default_value_t = 1000,
          value_parser = clap::value_parser!(u64).range(1..=MAX_DELAY_MS))]
    content_poll_ms: u64,

    /// Readiness of a reconnecting participant: from-message, preserve or clear
    #[arg(long, env = "REVEAL_RECONNECT_READINESS", default_value_t = ReconnectReadiness::FromMessage)]
    reconnect_readiness: ReconnectReadiness,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind,
            coordinator: CoordinatorConfig {
                expected_users: self.expected_users,
                lead_time: Duration::from_millis(self.lead_time_ms),
                reset_delay: Duration::from_millis(self.reset_delay_ms),
                grace_period: Duration::from_millis(self.grace_period_ms),
                reconnect_readiness: self.reconnect_readiness,
            },
            heartbeat: HeartbeatConfig {
                ping_interval: Duration::from_millis(self.ping_interval_ms),
                pong_tolerance: Duration::from_millis(self.pong_tolerance_ms),
            },
            outbound_capacity: self.outbound_capacity,
            content_path: Some(self.content_path),
            content_poll_interval: Duration::from_millis(self.content_poll_ms),
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    info!(
        "Starting reveal server: {} expected users, lead time {:?}, grace period {:?}",
        config.coordinator.expected_users, config.coordinator.lead_time, config.coordinator.grace_period
    );

    let server = RevealServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server failed: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }
}
