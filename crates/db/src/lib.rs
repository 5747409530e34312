//! `db` crate: pure persistence layer.
//!
//! Provides a key-value store abstraction with in-memory and SQLite
//! backends, plus the run-history and binding-config stores built on it.
//! No business logic lives here; documents are stored as opaque JSON.

pub mod error;
pub mod kv;
pub mod models;
pub mod pool;
pub mod repository;

pub use error::DbError;
pub use kv::{KeyValueStore, MemoryStore, SqliteStore};
pub use pool::DbPool;
