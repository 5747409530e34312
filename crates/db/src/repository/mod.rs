//! Repositories: one per stored document family.
//!
//! Each wraps a shared [`crate::KeyValueStore`] and returns
//! `Result<T, DbError>`. No business logic, no domain types.

pub mod bindings;
pub mod history;
