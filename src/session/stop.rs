//! Detection of stop-token sequences in the decoded stream.

/// Matches multi-token stop sequences against the rolling tail of emitted
/// token ids. A sequence of length one is the common single-stop-token case.
#[derive(Debug, Clone)]
pub struct StopTokenDetector {
    stop_sequences: Vec<Vec<i32>>,
    /// Last `max_len` tokens seen, oldest first.
    tail: Vec<i32>,
    max_len: usize,
    done: bool,
}

impl StopTokenDetector {
    pub fn new(stop_sequences: &[Vec<i32>]) -> Self {
        let stop_sequences: Vec<Vec<i32>> = stop_sequences
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect();
        let max_len = stop_sequences.iter().map(Vec::len).max().unwrap_or(0);
        StopTokenDetector {
            stop_sequences,
            tail: Vec::with_capacity(max_len),
            max_len,
            done: false,
        }
    }

    /// Feed one decoded token. Returns true once any stop sequence has fully
    /// appeared at the end of the stream (and keeps returning true).
    pub fn process_token(&mut self, token_id: i32) -> bool {
        if self.done || self.max_len == 0 {
            return self.done;
        }
        if self.tail.len() == self.max_len {
            self.tail.remove(0);
        }
        self.tail.push(token_id);
        if self
            .stop_sequences
            .iter()
            .any(|seq| self.tail.ends_with(seq))
        {
            self.done = true;
        }
        self.done
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Clear match state for a new decode turn.
    pub fn reset(&mut self) {
        self.tail.clear();
        self.done = false;
    }
}
