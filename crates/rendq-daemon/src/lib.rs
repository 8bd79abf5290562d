//! rendq Daemon Library
//!
//! Core functionality for the rendq render queue daemon:
//! - Render process supervision with process-tree termination
//! - Render sessions pairing each process with a progress parser
//! - Queue scheduling with priorities, dependencies and schedule times
//! - `SQLite` storage for queue state and render history

pub mod queue;
pub mod session;
pub mod storage;
pub mod supervisor;
