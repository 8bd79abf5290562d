//! rendq Core Library
//!
//! Shared functionality for rendq components:
//! - Render command assembly and splitting
//! - Progress parsing for render engine console output
//! - Configuration resolution and hierarchy
//! - `SQLite` helpers and common error types

pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod progress;
pub mod tracing_init;

pub use command::{FrameRange, RenderParameters};
pub use config::{Config, QueueSettings, SettingsUpdate};
pub use error::{Error, Result};
