//! Incremental splitting of a byte stream into UTF-8 lines.
//!
//! The reader accepts byte chunks of any size and emits every fully
//! terminated line, keeping exactly one partial line (and up to three
//! bytes of an unfinished UTF-8 sequence) between calls. Memory stays
//! bounded no matter what the input does: a partial line that outgrows
//! the configured buffer is truncated on the right with a warning, and
//! invalid UTF-8 degrades to replacement characters instead of failing
//! the stream.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Default cap on the carried partial line.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Serializable reader state; checkpointed and restored verbatim.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineReaderState {
    pub bytes_processed: u64,
    pub lines_emitted: u64,
    pub partial_line: String,
    /// Tail bytes of an unfinished UTF-8 sequence at a chunk boundary.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub utf8_carry: Vec<u8>,
}

pub struct StreamingLineReader {
    max_buffer_size: usize,
    state: LineReaderState,
}

impl StreamingLineReader {
    pub fn new(max_buffer_size: usize) -> Self {
        Self {
            max_buffer_size,
            state: LineReaderState::default(),
        }
    }

    /// Resumes from a checkpointed state.
    pub fn restore(max_buffer_size: usize, state: LineReaderState) -> Self {
        Self {
            max_buffer_size,
            state,
        }
    }

    pub fn snapshot(&self) -> LineReaderState {
        self.state.clone()
    }

    pub fn bytes_processed(&self) -> u64 {
        self.state.bytes_processed
    }

    pub fn lines_emitted(&self) -> u64 {
        self.state.lines_emitted
    }

    /// Feeds one chunk of bytes, returning every line it completed.
    /// Lines are trimmed; empty lines are skipped.
    pub fn process_chunk(&mut self, chunk: &[u8]) -> Vec<String> {
        self.state.bytes_processed += chunk.len() as u64;

        let mut pending = std::mem::take(&mut self.state.utf8_carry);
        pending.extend_from_slice(chunk);
        let decoded = self.decode_prefix(pending);

        let mut text = std::mem::take(&mut self.state.partial_line);
        text.push_str(&decoded);

        let mut lines = Vec::new();
        let mut rest = text.as_str();
        while let Some(at) = rest.find('\n') {
            let line = rest[..at].trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            rest = &rest[at + 1..];
        }
        self.state.partial_line = rest.to_string();
        self.cap_partial_line();

        self.state.lines_emitted += lines.len() as u64;
        lines
    }

    /// Returns the trailing partial line, if any. Call once at end of
    /// stream.
    pub fn flush(&mut self) -> Option<String> {
        // Whatever UTF-8 tail is still pending can't be completed
        // anymore; decode it with replacement.
        let carry = std::mem::take(&mut self.state.utf8_carry);
        self.state
            .partial_line
            .push_str(&String::from_utf8_lossy(&carry));

        let line = std::mem::take(&mut self.state.partial_line);
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        self.state.lines_emitted += 1;
        Some(line.to_string())
    }

    /// Decodes the longest valid prefix of `bytes`, retaining an
    /// incomplete trailing sequence and replacing invalid ones.
    fn decode_prefix(&mut self, bytes: Vec<u8>) -> String {
        match std::str::from_utf8(&bytes) {
            Ok(s) => s.to_string(),
            Err(_) => {
                let mut out = String::new();
                let mut rest = &bytes[..];
                loop {
                    match std::str::from_utf8(rest) {
                        Ok(s) => {
                            out.push_str(s);
                            break;
                        }
                        Err(e) => {
                            out.push_str(
                                std::str::from_utf8(&rest[..e.valid_up_to()])
                                    .expect("valid prefix"),
                            );
                            match e.error_len() {
                                // Cut off mid-sequence: keep the tail for
                                // the next chunk.
                                None => {
                                    self.state.utf8_carry = rest[e.valid_up_to()..].to_vec();
                                    break;
                                }
                                Some(n) => {
                                    warn!("invalid UTF-8 sequence in input, replacing");
                                    out.push('\u{FFFD}');
                                    rest = &rest[e.valid_up_to() + n..];
                                }
                            }
                        }
                    }
                }
                out
            }
        }
    }

    fn cap_partial_line(&mut self) {
        if self.state.partial_line.len() <= self.max_buffer_size {
            return;
        }
        let mut cut = self.max_buffer_size;
        while !self.state.partial_line.is_char_boundary(cut) {
            cut -= 1;
        }
        warn!(
            dropped = self.state.partial_line.len() - cut,
            max_buffer_size = self.max_buffer_size,
            "partial line exceeds buffer, truncating"
        );
        self.state.partial_line.truncate(cut);
    }
}

impl Default for StreamingLineReader {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    /// Runs the full input through a reader in chunks of `chunk_size`,
    /// collecting everything it emits.
    fn run_chunked(input: &[u8], chunk_size: usize) -> Vec<String> {
        let mut reader = StreamingLineReader::default();
        let mut lines = Vec::new();
        for chunk in input.chunks(chunk_size) {
            lines.extend(reader.process_chunk(chunk));
        }
        lines.extend(reader.flush());
        lines
    }

    #[rstest]
    #[case::byte_at_a_time(1)]
    #[case::tiny(3)]
    #[case::medium(7)]
    #[case::bigger_than_input(4096)]
    fn chunking_does_not_change_output(#[case] chunk_size: usize) {
        let input = "first\nsecond line\n\n  trimmed  \nlast without newline";
        let expected = vec!["first", "second line", "trimmed", "last without newline"];
        assert_eq!(expected, run_chunked(input.as_bytes(), chunk_size));
    }

    #[rstest]
    #[case::split_everywhere(1)]
    #[case::split_mid_sequence(2)]
    fn multibyte_sequences_survive_chunk_boundaries(#[case] chunk_size: usize) {
        let input = "grüße\n日本語のテキスト\nfin";
        let expected = vec!["grüße", "日本語のテキスト", "fin"];
        assert_eq!(expected, run_chunked(input.as_bytes(), chunk_size));
    }

    #[test]
    fn crlf_is_trimmed() {
        assert_eq!(vec!["a", "b"], run_chunked(b"a\r\nb\r\n", 4096));
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut reader = StreamingLineReader::default();
        let lines = reader.process_chunk(b"ok\nbad\xff\xfeline\n");
        assert_eq!(2, lines.len());
        assert_eq!("ok", lines[0]);
        assert!(lines[1].contains('\u{FFFD}'));
    }

    #[test]
    fn flush_is_idempotent() {
        let mut reader = StreamingLineReader::default();
        reader.process_chunk(b"tail");
        assert_eq!(Some("tail".to_string()), reader.flush());
        assert_eq!(None, reader.flush());
    }

    #[test]
    fn oversized_partial_line_is_truncated() {
        let mut reader = StreamingLineReader::new(16);
        reader.process_chunk(&[b'x'; 100]);
        assert_eq!(16, reader.snapshot().partial_line.len());

        // The newline still terminates the (truncated) line.
        let lines = reader.process_chunk(b"\nnext\n");
        assert_eq!(vec!["x".repeat(16), "next".to_string()], lines);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let mut reader = StreamingLineReader::new(5);
        // Four 3-byte characters; the cap lands mid-character.
        reader.process_chunk("四文字語".as_bytes());
        let partial = reader.snapshot().partial_line;
        assert!(partial.len() <= 5);
        assert_eq!("四", partial);
    }

    #[test]
    fn snapshot_restore_resumes_exactly() {
        let input = b"one\ntwo\nthree\nfour";
        let mut reference = StreamingLineReader::default();
        let mut all_at_once = reference.process_chunk(input);
        all_at_once.extend(reference.flush());

        let mut first = StreamingLineReader::default();
        let mut resumed_lines = first.process_chunk(&input[..9]);

        // The state survives a JSON roundtrip, as it does inside a
        // checkpoint.
        let state: LineReaderState = serde_json::from_value(
            serde_json::to_value(first.snapshot()).unwrap(),
        )
        .unwrap();
        let mut second = StreamingLineReader::restore(DEFAULT_MAX_BUFFER_SIZE, state);
        resumed_lines.extend(second.process_chunk(&input[9..]));
        resumed_lines.extend(second.flush());

        assert_eq!(all_at_once, resumed_lines);
        // The restored reader continues the byte count where it left off.
        assert_eq!(input.len() as u64, second.bytes_processed());
    }

    #[test]
    fn counters_track_lines_and_bytes() {
        let mut reader = StreamingLineReader::default();
        reader.process_chunk(b"a\nb\n\nc");
        assert_eq!(6, reader.bytes_processed());
        assert_eq!(2, reader.lines_emitted());
        reader.flush();
        assert_eq!(3, reader.lines_emitted());
    }
}
