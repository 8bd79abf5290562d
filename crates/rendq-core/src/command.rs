//! Render command assembly and splitting.
//!
//! A render job is stored as one invocation string so the UI can show and
//! edit it verbatim. [`RenderParameters::assemble`] builds that string from a
//! flat parameter set, [`split_command`] turns it back into a program and its
//! arguments for spawning, and [`FrameRange::from_args`] recovers the frame
//! range the progress parser needs.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Inclusive frame range of a render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: i64,
    pub end: i64,
}

impl Default for FrameRange {
    fn default() -> Self {
        Self { start: 1, end: 1 }
    }
}

impl FrameRange {
    pub const fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    /// Number of frames in the range (at least one).
    pub const fn frame_count(&self) -> i64 {
        let count = self.end.saturating_sub(self.start).saturating_add(1);
        if count < 1 { 1 } else { count }
    }

    /// Recover the frame range from engine arguments.
    ///
    /// Understands `-s/--frame-start`, `-e/--frame-end` and
    /// `-f/--render-frame` (single frame, `a..b` range, or comma list).
    /// Returns `None` when no frame flag is present.
    pub fn from_args(args: &[String]) -> Option<Self> {
        let mut start = None;
        let mut end = None;
        let mut iter = args.iter();

        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "-s" | "--frame-start" => start = iter.next().and_then(|v| v.parse().ok()),
                "-e" | "--frame-end" => end = iter.next().and_then(|v| v.parse().ok()),
                "-f" | "--render-frame" => {
                    if let Some(range) = iter.next().and_then(|v| parse_frame_list(v)) {
                        start = Some(range.start);
                        end = Some(range.end);
                    }
                }
                _ => {}
            }
        }

        match (start, end) {
            (None, None) => None,
            (Some(s), None) => Some(Self::new(s, s)),
            (None, Some(e)) => Some(Self::new(1, e)),
            (Some(s), Some(e)) => Some(Self::new(s, e.max(s))),
        }
    }

    /// Recover the frame range from a full command string.
    pub fn from_command(command: &str) -> Option<Self> {
        split_command(command)
            .ok()
            .and_then(|argv| Self::from_args(&argv))
    }
}

fn parse_frame_list(value: &str) -> Option<FrameRange> {
    let mut frames = value
        .split(',')
        .flat_map(|part| part.split(".."))
        .filter_map(|n| n.trim().trim_start_matches('+').parse::<i64>().ok());
    let first = frames.next()?;
    let last = frames.last().unwrap_or(first);
    Some(FrameRange::new(first.min(last), first.max(last)))
}

/// Flat parameter set for one render, as edited in the UI.
///
/// Kept on the job as its parameter snapshot so history records can show
/// exactly what was rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderParameters {
    pub blend_file: String,
    #[serde(default)]
    pub output_path: Option<String>,
    #[serde(default)]
    pub scene: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    pub frame_start: i64,
    pub frame_end: i64,
    #[serde(default)]
    pub threads: Option<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl RenderParameters {
    /// Frame range declared by these parameters.
    pub fn frame_range(&self) -> FrameRange {
        FrameRange::new(self.frame_start, self.frame_end.max(self.frame_start))
    }

    /// Build the invocation string for `blender_bin`.
    ///
    /// Output and format flags precede the frame flags because the engine
    /// processes arguments in order and renders at `-f`/`-a`.
    pub fn assemble(&self, blender_bin: &str, default_output_path: Option<&str>) -> String {
        let mut argv: Vec<String> = vec![blender_bin.to_string(), "-b".into(), self.blend_file.clone()];

        if let Some(scene) = &self.scene {
            argv.extend(["-S".into(), scene.clone()]);
        }
        if let Some(engine) = &self.engine {
            argv.extend(["-E".into(), engine.clone()]);
        }
        if let Some(output) = self.output_path.as_deref().or(default_output_path) {
            argv.extend(["-o".into(), output.to_string()]);
        }
        if let Some(format) = &self.format {
            argv.extend(["-F".into(), format.clone()]);
        }
        if let Some(threads) = self.threads {
            argv.extend(["-t".into(), threads.to_string()]);
        }
        argv.extend(self.extra_args.iter().cloned());

        let range = self.frame_range();
        if range.start == range.end {
            argv.extend(["-f".into(), range.start.to_string()]);
        } else {
            argv.extend([
                "-s".into(),
                range.start.to_string(),
                "-e".into(),
                range.end.to_string(),
                "-a".into(),
            ]);
        }

        join_command(&argv)
    }
}

/// Quote a single argument so that [`split_command`] returns it unchanged.
pub fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\'));
    if !needs_quotes {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if matches!(c, '"' | '\\') {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Join arguments into a command string.
pub fn join_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| quote_arg(a))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a command string into program and arguments.
///
/// Whitespace separates arguments. Double quotes group and honour `\"` and
/// `\\`. Single quotes group literally. Outside quotes a backslash only
/// escapes whitespace, quotes and itself, so Windows paths survive unquoted.
pub fn split_command(command: &str) -> Result<Vec<String>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mode {
        Plain,
        Double,
        Single,
    }

    let mut argv = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut mode = Mode::Plain;
    let mut chars = command.chars().peekable();

    while let Some(c) = chars.next() {
        match mode {
            Mode::Plain => match c {
                c if c.is_whitespace() => {
                    if in_arg {
                        argv.push(std::mem::take(&mut current));
                        in_arg = false;
                    }
                }
                '"' => {
                    mode = Mode::Double;
                    in_arg = true;
                }
                '\'' => {
                    mode = Mode::Single;
                    in_arg = true;
                }
                '\\' => {
                    in_arg = true;
                    match chars.peek() {
                        Some(&next) if next.is_whitespace() || matches!(next, '"' | '\'' | '\\') => {
                            current.push(next);
                            chars.next();
                        }
                        _ => current.push('\\'),
                    }
                }
                c => {
                    in_arg = true;
                    current.push(c);
                }
            },
            Mode::Double => match c {
                '"' => mode = Mode::Plain,
                '\\' => match chars.peek() {
                    Some(&next) if matches!(next, '"' | '\\') => {
                        current.push(next);
                        chars.next();
                    }
                    _ => current.push('\\'),
                },
                c => current.push(c),
            },
            Mode::Single => match c {
                '\'' => mode = Mode::Plain,
                c => current.push(c),
            },
        }
    }

    if mode != Mode::Plain {
        return Err(Error::Command("unterminated quote".to_string()));
    }
    if in_arg {
        argv.push(current);
    }
    if argv.is_empty() {
        return Err(Error::Command("command is empty".to_string()));
    }
    Ok(argv)
}
