//! Progress types extracted from render engine output.

use serde::{Deserialize, Serialize};

use crate::command::FrameRange;

/// Which pipe a line of engine output arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Live render state of one job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub current_frame: i64,
    pub start_frame: i64,
    pub end_frame: i64,
    pub current_sample: u32,
    pub total_samples: u32,
    /// Megabytes.
    pub current_memory: f64,
    /// Megabytes.
    pub peak_memory: f64,
    pub compositing: bool,
    pub compositing_operation: Option<String>,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub last_output: Option<String>,
}

impl ProgressSnapshot {
    /// Fresh snapshot for a render over `range`.
    pub const fn for_range(range: FrameRange) -> Self {
        Self {
            current_frame: range.start,
            start_frame: range.start,
            end_frame: range.end,
            current_sample: 0,
            total_samples: 0,
            current_memory: 0.0,
            peak_memory: 0.0,
            compositing: false,
            compositing_operation: None,
            progress: 0.0,
            last_output: None,
        }
    }

    /// Total number of frames in the declared range.
    pub const fn total_frames(&self) -> i64 {
        FrameRange::new(self.start_frame, self.end_frame).frame_count()
    }

    /// Merge a partial update into this snapshot.
    pub fn apply(&mut self, update: &ProgressUpdate) {
        if let Some(frame) = update.current_frame {
            self.current_frame = frame;
        }
        if let Some(progress) = update.progress {
            self.progress = progress;
        }
        if let Some(sample) = update.current_sample {
            self.current_sample = sample;
        }
        if let Some(total) = update.total_samples {
            self.total_samples = total;
        }
        if let Some(mem) = update.current_memory {
            self.current_memory = mem;
        }
        if let Some(peak) = update.peak_memory {
            self.peak_memory = peak;
        }
        if let Some(compositing) = update.compositing {
            self.compositing = compositing;
            if !compositing {
                self.compositing_operation = None;
            }
        }
        if let Some(op) = &update.compositing_operation {
            self.compositing_operation = Some(op.clone());
        }
        if let Some(path) = &update.last_output {
            self.last_output = Some(path.clone());
        }
    }
}

/// Fields of a [`ProgressSnapshot`] changed by one line. `None` = unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub current_frame: Option<i64>,
    pub progress: Option<f64>,
    pub current_sample: Option<u32>,
    pub total_samples: Option<u32>,
    pub current_memory: Option<f64>,
    pub peak_memory: Option<f64>,
    pub compositing: Option<bool>,
    pub compositing_operation: Option<String>,
    pub last_output: Option<String>,
}

impl ProgressUpdate {
    pub const fn is_empty(&self) -> bool {
        self.current_frame.is_none()
            && self.progress.is_none()
            && self.current_sample.is_none()
            && self.total_samples.is_none()
            && self.current_memory.is_none()
            && self.peak_memory.is_none()
            && self.compositing.is_none()
            && self.compositing_operation.is_none()
            && self.last_output.is_none()
    }
}

/// Structured event extracted from one line of engine output.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Some snapshot fields changed.
    Progress(ProgressUpdate),
    /// The line matched a fatal phrase. The job's status still waits for exit.
    Critical(String),
    /// Unrecognised stderr text, for display only.
    Noise(String),
    /// The engine printed its quit marker. Advisory; exit is authoritative.
    EngineQuit,
}
