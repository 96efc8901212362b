//! # backhaul
//!
//! Offline backlog and replay engine for analytics clients.
//!
//! This library provides:
//! - An encrypted, persistent backlog of analytics calls that failed to send
//! - Offline session tracking with negative placeholder IDs
//! - Ordered replay once connectivity returns, one call in flight at a time
//! - Reconciliation of placeholder session IDs against server-assigned ones
//!
//! ## Architecture
//!
//! All backlog state is owned by a single service task:
//! - **Store:** encrypted session/request documents in SQLite (or any
//!   [`PersistentStore`])
//! - **Service:** command loop that queues, ticks, flushes, and replays
//! - **Handle:** cloneable client that the embedding app talks through
//!
//! ## Example
//!
//! ```rust,no_run
//! use backhaul::{BacklogService, Codec, Config, HttpTransport, SqliteStore};
//!
//! # async fn run() -> backhaul::Result<()> {
//! let config = Config::load()?;
//! let store = SqliteStore::open(&Config::store_path())?;
//! let transport = HttpTransport::new(config.backlog.task_timeout())?;
//!
//! let (service, handle, mut events) = BacklogService::new(
//!     store,
//!     Codec::legacy(),
//!     transport,
//!     config.client.clone(),
//!     &config.backlog,
//! );
//! tokio::spawn(service.run());
//!
//! // network came back: replay everything pending
//! handle.replay()?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use backlog::{BacklogStore, LiveSession, PendingRequest};
pub use codec::{Cipher, Codec, FixedKeyCipher};
pub use config::{ApiConfig, BacklogConfig, ClientInfo, Config};
pub use error::{Error, Result};
pub use queue::{ReplayTask, TaskKind, TaskOutcome, TaskQueue};
pub use service::{BacklogHandle, BacklogService, Command};
pub use store::{MemoryStore, PersistentStore, SqliteStore, REQUESTS_KEY, SESSIONS_KEY};
pub use transport::{HttpTransport, Transport, TransportRequest};
pub use types::*;

// Public modules
pub mod backlog;
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod store;
pub mod transport;
pub mod types;
