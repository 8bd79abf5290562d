//! Incremental parser for render engine console output.
//!
//! Parsing happens in two steps. [`LineFacts::parse`] recognises the engine's
//! text patterns in a single line and knows nothing about the session.
//! [`ProgressParser::advance`] folds those facts into the session context and
//! yields the resulting events. Only the first step depends on the engine's
//! output format.

use std::sync::LazyLock;

use regex::Regex;

use super::types::{OutputStream, ProgressEvent, ProgressSnapshot, ProgressUpdate};
use crate::command::FrameRange;

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bFra:\s*(-?\d+)").expect("static regex is valid"));

static MEMORY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bMem:\s*(\d+(?:\.\d+)?)([MG])\b[^|]*?\bPeak:?\s*(\d+(?:\.\d+)?)([MG])\b")
        .expect("static regex is valid")
});

static SAMPLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bSample\s+(\d+)\s*/\s*(\d+)").expect("static regex is valid")
});

static COMPOSITING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bCompositing\b(?:\s*\|)?([^|]*)").expect("static regex is valid")
});

static SAVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bSaved:\s*['"]([^'"]+)['"]"#).expect("static regex is valid")
});

/// Marker the engine prints right before exiting.
const QUIT_MARKER: &str = "Blender quit";

/// Phrases that mark a line as a critical error (matched lowercase).
pub const CRITICAL_PHRASES: &[&str] = &[
    "no camera",
    "segmentation fault",
    "access violation",
    "fatal error",
    "exception",
    "terminated unexpectedly",
    "possible crash",
    "failed to start",
    "invalid command",
];

/// Whether `line` contains one of the [`CRITICAL_PHRASES`].
pub fn is_critical(line: &str) -> bool {
    let lower = line.to_lowercase();
    CRITICAL_PHRASES.iter().any(|p| lower.contains(p))
}

/// Everything recognised in one line of output, independent of session state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LineFacts {
    pub frame: Option<i64>,
    /// `(current, peak)` in megabytes.
    pub memory: Option<(f64, f64)>,
    /// `(current, total)`.
    pub samples: Option<(u32, u32)>,
    /// `Some(op)` when the compositing marker is present; `op` may be absent.
    pub compositing: Option<Option<String>>,
    pub saved: Option<String>,
    pub critical: bool,
    pub engine_quit: bool,
}

impl LineFacts {
    /// Recognise engine output patterns in `line`.
    pub fn parse(line: &str) -> Self {
        let frame = FRAME_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let memory = MEMORY_RE.captures(line).and_then(|c| {
            let current = to_megabytes(c.get(1)?.as_str(), c.get(2)?.as_str())?;
            let peak = to_megabytes(c.get(3)?.as_str(), c.get(4)?.as_str())?;
            Some((current, peak))
        });

        let samples = SAMPLE_RE.captures(line).and_then(|c| {
            let current = c.get(1)?.as_str().parse().ok()?;
            let total = c.get(2)?.as_str().parse().ok()?;
            Some((current, total))
        });

        let compositing = COMPOSITING_RE.captures(line).map(|c| {
            c.get(1)
                .map(|m| m.as_str().trim())
                .filter(|op| !op.is_empty())
                .map(str::to_string)
        });

        let saved = SAVED_RE
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        Self {
            frame,
            memory,
            samples,
            compositing,
            saved,
            critical: is_critical(line),
            engine_quit: line.contains(QUIT_MARKER),
        }
    }

    const fn is_progress(&self) -> bool {
        self.frame.is_some()
            || self.memory.is_some()
            || self.samples.is_some()
            || self.compositing.is_some()
            || self.saved.is_some()
    }
}

fn to_megabytes(value: &str, unit: &str) -> Option<f64> {
    let value: f64 = value.parse().ok()?;
    match unit {
        "G" => Some(value * 1024.0),
        "M" => Some(value),
        _ => None,
    }
}

/// Percentage of `range` covered when the engine reports `frame`.
///
/// Computed in `f64` so frames anywhere in the `i64` range cannot overflow.
#[allow(clippy::cast_precision_loss)]
pub fn frame_percentage(frame: i64, range: FrameRange) -> f64 {
    let start = range.start as f64;
    let span = (range.end as f64 - start).max(1.0);
    ((frame as f64 - start) / span * 100.0).clamp(0.0, 100.0)
}

/// Per-session parser state.
///
/// Owned by exactly one render session and never shared.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressParser {
    range: FrameRange,
    snapshot: ProgressSnapshot,
    engine_quit: bool,
}

impl ProgressParser {
    /// Start a parser for a render over `range`.
    pub const fn new(range: FrameRange) -> Self {
        Self {
            range,
            snapshot: ProgressSnapshot::for_range(range),
            engine_quit: false,
        }
    }

    /// Current accumulated snapshot.
    pub const fn snapshot(&self) -> &ProgressSnapshot {
        &self.snapshot
    }

    /// Whether the engine's quit marker has been seen.
    pub const fn engine_quit_seen(&self) -> bool {
        self.engine_quit
    }

    /// Pure transition: consume `line` and return the next context plus the
    /// events the line produced.
    #[must_use]
    pub fn advance(mut self, line: &str, stream: OutputStream) -> (Self, Vec<ProgressEvent>) {
        let events = self.feed(line, stream);
        (self, events)
    }

    /// In-place form of [`advance`](Self::advance).
    pub fn feed(&mut self, line: &str, stream: OutputStream) -> Vec<ProgressEvent> {
        let facts = LineFacts::parse(line);
        let mut events = Vec::new();

        let update = self.update_from(&facts);
        if !update.is_empty() {
            self.snapshot.apply(&update);
            events.push(ProgressEvent::Progress(update));
        }

        if facts.critical {
            events.push(ProgressEvent::Critical(line.trim().to_string()));
        } else if stream == OutputStream::Stderr && !facts.is_progress() && !line.trim().is_empty()
        {
            events.push(ProgressEvent::Noise(line.to_string()));
        }

        if facts.engine_quit && !self.engine_quit {
            self.engine_quit = true;
            events.push(ProgressEvent::EngineQuit);
        }

        events
    }

    fn update_from(&self, facts: &LineFacts) -> ProgressUpdate {
        let mut update = ProgressUpdate::default();

        if let Some(frame) = facts.frame {
            update.current_frame = Some(frame);
            update.progress = Some(frame_percentage(frame, self.range));
            // A frame line without the marker means compositing has finished.
            update.compositing = Some(facts.compositing.is_some());
        }
        if let Some((current, peak)) = facts.memory {
            update.current_memory = Some(current);
            update.peak_memory = Some(peak.max(self.snapshot.peak_memory));
        }
        if let Some((current, total)) = facts.samples {
            update.current_sample = Some(current);
            update.total_samples = Some(total);
        }
        if let Some(op) = &facts.compositing {
            update.compositing = Some(true);
            update.compositing_operation.clone_from(op);
        }
        if let Some(path) = &facts.saved {
            update.last_output = Some(path.clone());
        }

        update
    }
}
