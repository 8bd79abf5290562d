//! Progress extraction from render engine console output.
//!
//! The engine reports progress as free-form text. This module turns a stream
//! of lines into [`ProgressEvent`]s and a running [`ProgressSnapshot`].

mod parser;
mod types;

pub use parser::{
    CRITICAL_PHRASES, LineFacts, ProgressParser, frame_percentage, is_critical,
};
pub use types::{OutputStream, ProgressEvent, ProgressSnapshot, ProgressUpdate};
