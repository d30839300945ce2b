//! Actor-based gateway runtime
//!
//! Every long-running concern of the gateway is an actor: an independent
//! async task owning its own state and reachable only through a cloneable
//! handle wrapping a Tokio mpsc sender.
//!
//! ## Architecture Overview
//!
//! ```text
//!   producers ──HTTP──▶ Collector ──enqueue──▶ ┌──────────────┐
//!                                              │ BufferStore  │
//!        RetentionActor ──purge / requeue────▶ │ (SQLite)     │
//!                                              └──────┬───────┘
//!                                                     │ drain / mark
//!                                              ┌──────▼───────┐   HTTP
//!                                              │ForwarderActor├────────▶ central
//!                                              └──────▲───────┘
//!                                                     │ flush
//!   central ◀──WebSocket──▶ ControlChannelActor ──────┘ (via CommandDispatcher)
//! ```
//!
//! ## Actor Types
//!
//! - **ForwarderActor**: Drains the buffer in batches and delivers them upstream
//! - **RetentionActor**: Purges expired and confirmed records, requeues stale leases
//! - **ControlChannelActor**: Keeps the control socket open, sends heartbeats, runs commands
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: Each actor has an mpsc command channel for control messages
//! 2. **Request/Response**: oneshot channels for queries and acknowledged commands
//! 3. **Fire-and-forget**: `try_send` for requests that must never block the caller

use std::time::Duration;

pub mod control;
pub mod forwarder;
pub mod messages;
pub mod retention;

/// How long a handle waits for its actor to confirm shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
