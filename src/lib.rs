//! Offline-first synchronization core for an education app.
//!
//! [`store::Store`] is the durable single source of truth for users,
//! lessons, and progress. [`repository::Repository`] is the sole write
//! entry point for application logic. [`engine::SyncEngine`] drains the
//! outbound journal, reconciles conflicts, and pulls remote state through
//! [`resolver`]'s Last-Write-Wins policy, talking to the outside world
//! through the [`gateway::RemoteGateway`] seam.

pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod model;
pub mod repository;
pub mod resolver;
pub mod store;

pub use config::SyncConfig;
pub use engine::{EngineStatus, SyncEngine};
pub use error::{GatewayError, RepositoryError, StorageError};
pub use gateway::{ProgressDoc, RemoteGateway, RemoteProgressDoc};
pub use model::{JournalEntry, JournalOp, Lesson, Progress, SyncStatus, User};
pub use repository::Repository;
pub use store::Store;
