//! # reveal-sync: synchronized reveal coordination
//!
//! Keeps a room of participants in lock-step: once everyone present has
//! voted ready, every client is told the same future instant at which to
//! reveal the shared content.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ RevealClient │ ◄────────────────► │ RevealServer │
//! │ (per user)   │     JSON text      │ (central)    │
//! └──────┬───────┘                    └──────┬───────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌──────────────┐
//! │ ClientView   │                    │ Coordinator  │
//! │ (local)      │                    │ (authority)  │
//! └──────────────┘                    └──────┬───────┘
//!                                            │
//!                                    ┌───────┴───────┐
//!                                    │ Broadcaster   │
//!                                    │ (fan-out)     │
//!                                    └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages and timestamp format
//! - [`connection`]: per-connection outbound queue handle
//! - [`session`]: identity → session registry and readiness counts
//! - [`state`]: the WaitingForUsers / WaitingForReady / Triggered machine
//! - [`coordinator`]: locked entry points, grace period, reset scheduling
//! - [`broadcast`]: fan-out to every live connection
//! - [`heartbeat`]: ping schedule and liveness deadline
//! - [`content`]: "is there anything to reveal" probe and its revision
//! - [`server`]: WebSocket server
//! - [`client`]: WebSocket client with a local view of the room

pub mod protocol;
pub mod connection;
pub mod session;
pub mod state;
pub mod coordinator;
pub mod broadcast;
pub mod heartbeat;
pub mod content;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{ClientMessage, ProtocolError, ServerMessage, StateSnapshot};
pub use connection::{ConnectionHandle, ConnectionId, DeliveryError, Frame};
pub use session::{ReadyData, ReconnectReadiness, Registration};
pub use state::OverallState;
pub use coordinator::{Coordinator, CoordinatorConfig, DisconnectOutcome, ReadyOutcome};
pub use broadcast::{BroadcastStats, Broadcaster};
pub use heartbeat::HeartbeatConfig;
pub use content::{ContentProbe, ContentRevision, FileContent, StaticContent};
pub use server::{RevealServer, ServerConfig, ServerError, ServerStats};
pub use client::{ClientEvent, ClientView, ConnectionState, LocalPhase, RevealClient};
