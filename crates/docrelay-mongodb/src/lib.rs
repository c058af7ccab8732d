//! Reconnecting MongoDB access layer.
//!
//! A [`Supervisor`] keeps one live connection per process and retries for
//! as long as the process runs. [`Commands`] exposes the fixed set of data
//! operations on top of it, failing fast with `NotReady` whenever no
//! connection is published.
//!
//! ```ignore
//! let supervisor = Arc::new(Supervisor::mongo(ConnectionConfig::from_env()));
//! supervisor.spawn();
//! let commands = Commands::new(supervisor.clone());
//! let seq = commands.next("counters", doc! { "_id": "orders" }, "seq").await?;
//! ```

pub mod commands;
pub mod config;
pub mod connection;
pub mod memory;
pub mod store;
pub mod supervisor;
pub mod validation;

pub use commands::{Commands, Page, DEFAULT_PAGE_SIZE, TTL_FIELD};
pub use config::{ConnectionConfig, ConnectionConfigBuilder, TransportOptions};
pub use connection::{Connector, MongoConnector, MongoStore};
pub use memory::{MemoryConnector, MemoryStore};
pub use store::{DocumentStore, FindOptions, IndexOptions, StoreHandle, UpdateOutcome};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorState};
pub use validation::{CollectionName, FieldPath};

// Re-export shared types
pub use docrelay_common::{DocRelayError, Result};

// Re-export BSON so callers build filters with the same version
pub use bson;
