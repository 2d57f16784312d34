//! Line framing for the relay's event-stream body.
//!
//! Chunk boundaries are arbitrary: a multibyte character or a line may be split
//! across reads, so both are carried over until complete.

const DATA_PREFIX: &str = "data: ";
const ERROR_EVENT_PREFIX: &str = "event: error";

/// Turns body chunks into complete text lines (without the line terminator).
#[derive(Debug, Default)]
pub struct LineDecoder {
    bytes: Vec<u8>,
    pending: String,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.bytes.extend_from_slice(chunk);
        self.decode();
        self.take_lines()
    }

    /// Flush whatever is left once the body has ended.
    pub fn finish(&mut self) -> Vec<String> {
        if !self.bytes.is_empty() {
            self.pending.push_str(&String::from_utf8_lossy(&self.bytes));
            self.bytes.clear();
        }
        let mut lines = self.take_lines();
        if !self.pending.is_empty() {
            let mut last = std::mem::take(&mut self.pending);
            if last.ends_with('\r') {
                last.pop();
            }
            lines.push(last);
        }
        lines
    }

    fn decode(&mut self) {
        loop {
            match std::str::from_utf8(&self.bytes) {
                Ok(s) => {
                    self.pending.push_str(s);
                    self.bytes.clear();
                    return;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    self.pending
                        .push_str(std::str::from_utf8(&self.bytes[..valid_up_to]).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            self.pending.push(char::REPLACEMENT_CHARACTER);
                            self.bytes.drain(..valid_up_to + len);
                        }
                        // Incomplete sequence at the end: wait for the next chunk.
                        None => {
                            self.bytes.drain(..valid_up_to);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn take_lines(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(end) = self.pending.find('\n') {
            let mut line: String = self.pending.drain(..=end).collect();
            line.pop();
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }
}

/// Accumulated assistant reply. The buffer, not the displayed message, is the
/// source of truth: every change is published as the full text.
#[derive(Debug, Default)]
pub struct ReplyBuffer {
    text: String,
}

impl ReplyBuffer {
    /// Apply one line; returns whether the buffer changed.
    pub fn apply(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }

        if line.starts_with(ERROR_EVENT_PREFIX) {
            tracing::warn!("Worker sent an error event, skipping its marker line");
            return false;
        }

        match line.strip_prefix(DATA_PREFIX) {
            // An empty data line is how the worker encodes a newline.
            Some(fragment) if fragment.trim().is_empty() => {
                self.text.push('\n');
                true
            }
            Some(fragment) => {
                self.text.push_str(fragment);
                true
            }
            None => false,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}
