//! Durable store for orca: tasks, invocations, and budget events in a
//! single SQLite file.
//!
//! All components read and write through this crate; it is the only
//! authority for persistent state. Transient runtime tables (handles,
//! expected changes, cooldowns) live in `orca-core` instead.

pub mod models;
pub mod pool;
pub mod queries;

pub use sqlx::SqlitePool;
