//! `SQLite` storage for the rendq daemon.
//!
//! Provides the durable key-value store backing the queue and the render
//! history table.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::{HistoryRecord, HistoryStatus};
