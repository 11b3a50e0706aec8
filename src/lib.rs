//! Fleet Gateway - device registry, access gate and command bus
//!
//! This library tracks the client devices of a fleet and lets an
//! administrator control them through a shared, replicated key-value store:
//! - Device session registry (who has been seen, and when)
//! - Access-control gate (block-list enforced per request)
//! - Command bus (targeted and broadcast commands, at-least-once)
//! - Connection monitor (resync after reconnect)
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   HTTP API (axum)                   │
//! │      device gate  │  admin  │  health / status      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │                   Control plane                      │
//! │   Registry  │  Gate  │  Command bus  │  Monitor      │
//! └────────────────────┬────────────────────────────────┘
//!                      │
//! ┌────────────────────▼────────────────────────────────┐
//! │          Shared store (paths + subscriptions)        │
//! │   connected_devices/  │  devices/  │  commands/      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod agent;
pub mod api;
pub mod commands;
pub mod config;
pub mod control;
pub mod daemon;
pub mod db;
pub mod devices;
pub mod error;
pub mod gate;
pub mod identity;
pub mod monitor;
pub mod store;
pub mod telemetry;

pub use agent::{DeviceAgent, LoggingHandler};
pub use commands::{CommandBus, CommandHandler, CommandKind, IssuedCommand, Target, Watermark};
pub use config::Config;
pub use control::{ControlPlane, StoreMode};
pub use daemon::Daemon;
pub use db::{DbConn, DbPool};
pub use devices::{DeviceRegistry, DeviceSession, DeviceStatus};
pub use error::{Error, Result};
pub use gate::{AccessControlGate, Decision, RequestInfo};
pub use monitor::{ConnectionMonitor, ReconnectAction};
pub use store::{MemoryStore, SharedStore, Snapshot, Subscription};
pub use telemetry::Telemetry;
