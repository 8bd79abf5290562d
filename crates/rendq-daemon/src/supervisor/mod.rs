//! Render engine process supervision.
//!
//! One OS process per render attempt, with line-streamed output and
//! process-tree termination.

mod lines;
mod manager;
mod terminate;

pub use lines::LineBuffer;
pub use manager::{
    ProcessEvent, ProcessHandle, ProcessSupervisor, SupervisorConfig, SupervisorError,
};
pub use terminate::{PlatformTerminator, Termination, Terminator};
