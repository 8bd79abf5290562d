//! Line reassembly for chunked process output.

/// Splits a byte stream into lines, carrying a partial trailing fragment
/// over to the next chunk.
///
/// Lines are split on `\n`; a trailing `\r` is dropped. Bytes are decoded
/// lossily only once a line is complete, so multi-byte characters cut by a
/// chunk boundary survive.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub const fn new() -> Self {
        Self {
            pending: Vec::new(),
        }
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(decode_line(&self.pending));
            self.pending.clear();
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);

        lines
    }

    /// Return the unterminated remainder, if any, at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = decode_line(&self.pending);
        self.pending.clear();
        Some(line)
    }

    /// Whether a partial line is buffered.
    pub const fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
