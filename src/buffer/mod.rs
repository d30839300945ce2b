//! Durable record buffer
//!
//! Records accepted from agents are written here before the gateway replies,
//! and stay until the uplink has confirmed them or retention removes them.
//!
//! ## Design
//!
//! - **Trait-based**: `BufferStore` lets the gateway swap backends
//! - **Async**: All operations are async for use from Tokio actors
//! - **Atomic transitions**: Every state change is a single compare-and-set step
//!
//! ## Backends
//!
//! - **SQLite** (default): Embedded database file, survives restarts
//! - **In-Memory**: No persistence, for tests
//!
//! ## Usage
//!
//! ```no_run
//! use edge_gateway::buffer::{BufferStore, SqliteBuffer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let buffer = SqliteBuffer::new("./gateway-buffer.db").await?;
//!     println!("{} records waiting", buffer.depth().await?);
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{BufferStore, HealthStatus};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBuffer;
pub use schema::{
    BufferStats, DeliveryState, EnqueueOutcome, IngestRecord, NewRecord, PurgeOutcome,
    ValidationError,
};
#[cfg(feature = "storage-sqlite")]
pub use sqlite::SqliteBuffer;
