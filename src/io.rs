//! Response containers and the benchmark recorder.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{EdgeLmError, Result};

/// A container for the model's generated responses.
///
/// Holds one text per output candidate and, once requested, a parallel score
/// vector. Scores are allocated lazily on first mutable access and start at
/// negative infinity.
#[derive(Debug, Clone)]
pub struct Responses {
    num_output_candidates: usize,
    response_texts: Vec<String>,
    scores: Vec<f32>,
}

impl Responses {
    pub fn new(num_output_candidates: usize) -> Self {
        Responses {
            num_output_candidates,
            response_texts: vec![String::new(); num_output_candidates],
            scores: Vec::new(),
        }
    }

    pub fn num_output_candidates(&self) -> usize {
        self.num_output_candidates
    }

    pub fn response_text_at(&self, index: usize) -> Result<&str> {
        if index >= self.num_output_candidates {
            return Err(EdgeLmError::InvalidArgument(format!(
                "index {index} is out of range [0, {})",
                self.num_output_candidates
            )));
        }
        Ok(&self.response_texts[index])
    }

    pub fn score_at(&self, index: usize) -> Result<f32> {
        if self.scores.is_empty() {
            return Err(EdgeLmError::InvalidArgument("scores are not set".into()));
        }
        if index >= self.scores.len() {
            return Err(EdgeLmError::InvalidArgument(format!(
                "index {index} is out of range [0, {})",
                self.scores.len()
            )));
        }
        Ok(self.scores[index])
    }

    pub fn response_texts_mut(&mut self) -> &mut [String] {
        &mut self.response_texts
    }

    /// Mutable scores, allocated on first access with `-inf` fill.
    pub fn scores_mut(&mut self) -> &mut [f32] {
        if self.scores.is_empty() {
            self.scores = vec![f32::NEG_INFINITY; self.num_output_candidates];
        }
        &mut self.scores
    }
}

impl std::fmt::Display for Responses {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.num_output_candidates == 0 {
            return writeln!(f, " No responses.");
        }
        writeln!(f, "Total candidates: {}:", self.num_output_candidates)?;
        for i in 0..self.num_output_candidates {
            match self.score_at(i) {
                Ok(score) => writeln!(f, "  Candidate {i} (score: {score}):")?,
                Err(_) => writeln!(f, "  Candidate {i} (score: N/A):")?,
            }
            writeln!(f, "    Text: \"{}\"", self.response_texts[i])?;
        }
        Ok(())
    }
}

/// What a benchmark run should measure. A stand-in for the external
/// benchmark configuration schema.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BenchmarkParams {
    /// When non-zero, prefill exactly this many tokens regardless of prompt.
    #[serde(default)]
    pub num_prefill_tokens: usize,

    /// When non-zero, decode exactly this many steps, ignoring stop tokens.
    #[serde(default)]
    pub num_decode_tokens: usize,
}

/// One timed turn: how many tokens were processed and how long it took.
#[derive(Debug, Clone, Copy)]
pub struct BenchmarkTurnData {
    pub num_tokens: u64,
    pub duration: Duration,
}

impl std::fmt::Display for BenchmarkTurnData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Processed {} tokens in {:?} duration.",
            self.num_tokens, self.duration
        )
    }
}

/// Records named initialization phases and per-turn prefill/decode timings.
#[derive(Debug, Clone)]
pub struct BenchmarkInfo {
    params: BenchmarkParams,
    start_times: BTreeMap<String, Instant>,
    init_phases: BTreeMap<String, Duration>,
    mark_times: BTreeMap<String, Instant>,
    mark_durations: BTreeMap<String, Duration>,
    prefill_turns: Vec<BenchmarkTurnData>,
    decode_turns: Vec<BenchmarkTurnData>,
    prefill_turn_index: usize,
    decode_turn_index: usize,
}

impl BenchmarkInfo {
    pub fn new(params: BenchmarkParams) -> Self {
        BenchmarkInfo {
            params,
            start_times: BTreeMap::new(),
            init_phases: BTreeMap::new(),
            mark_times: BTreeMap::new(),
            mark_durations: BTreeMap::new(),
            prefill_turns: Vec::new(),
            decode_turns: Vec::new(),
            prefill_turn_index: 0,
            decode_turn_index: 0,
        }
    }

    pub fn params(&self) -> &BenchmarkParams {
        &self.params
    }

    /// Begin timing a named initialization phase. Starting a phase twice
    /// without ending it is an error.
    pub fn time_init_phase_start(&mut self, phase_name: &str) -> Result<()> {
        if self.start_times.contains_key(phase_name) {
            return Err(EdgeLmError::Internal(format!(
                "phase {phase_name} already started"
            )));
        }
        self.start_times.insert(phase_name.to_string(), Instant::now());
        Ok(())
    }

    /// End timing a named initialization phase.
    pub fn time_init_phase_end(&mut self, phase_name: &str) -> Result<()> {
        let Some(start) = self.start_times.get(phase_name) else {
            return Err(EdgeLmError::Internal(format!(
                "phase {phase_name} not started"
            )));
        };
        self.init_phases
            .insert(phase_name.to_string(), start.elapsed());
        Ok(())
    }

    /// Record the delta between consecutive calls with the same mark name.
    /// The first call only arms the mark; each later call records the time
    /// since the previous one.
    pub fn time_mark_delta(&mut self, mark_name: &str) {
        let now = Instant::now();
        if let Some(previous) = self.mark_times.get(mark_name) {
            self.mark_durations
                .insert(mark_name.to_string(), now.duration_since(*previous));
        }
        self.mark_times.insert(mark_name.to_string(), now);
    }

    pub fn mark_durations(&self) -> &BTreeMap<String, Duration> {
        &self.mark_durations
    }

    pub fn init_phases(&self) -> &BTreeMap<String, Duration> {
        &self.init_phases
    }

    pub fn time_prefill_turn_start(&mut self) -> Result<()> {
        let phase_name = format!("prefill:{}", self.prefill_turn_index);
        if self.start_times.contains_key(&phase_name) {
            return Err(EdgeLmError::Internal(format!(
                "prefill turn {phase_name} already started"
            )));
        }
        self.start_times.insert(phase_name, Instant::now());
        Ok(())
    }

    pub fn time_prefill_turn_end(&mut self, num_prefill_tokens: u64) -> Result<()> {
        let phase_name = format!("prefill:{}", self.prefill_turn_index);
        let Some(start) = self.start_times.get(&phase_name) else {
            return Err(EdgeLmError::Internal(format!(
                "prefill turn {phase_name} not started"
            )));
        };
        self.prefill_turns.push(BenchmarkTurnData {
            num_tokens: num_prefill_tokens,
            duration: start.elapsed(),
        });
        self.prefill_turn_index += 1;
        Ok(())
    }

    pub fn time_decode_turn_start(&mut self) -> Result<()> {
        let phase_name = format!("decode:{}", self.decode_turn_index);
        if self.start_times.contains_key(&phase_name) {
            return Err(EdgeLmError::Internal(format!(
                "decode turn {phase_name} already started"
            )));
        }
        self.start_times.insert(phase_name, Instant::now());
        Ok(())
    }

    pub fn time_decode_turn_end(&mut self, num_decode_tokens: u64) -> Result<()> {
        let phase_name = format!("decode:{}", self.decode_turn_index);
        let Some(start) = self.start_times.get(&phase_name) else {
            return Err(EdgeLmError::Internal(format!(
                "decode turn {phase_name} not started"
            )));
        };
        self.decode_turns.push(BenchmarkTurnData {
            num_tokens: num_decode_tokens,
            duration: start.elapsed(),
        });
        self.decode_turn_index += 1;
        Ok(())
    }

    pub fn prefill_turn(&self, turn_index: usize) -> Option<&BenchmarkTurnData> {
        self.prefill_turns.get(turn_index)
    }

    pub fn decode_turn(&self, turn_index: usize) -> Option<&BenchmarkTurnData> {
        self.decode_turns.get(turn_index)
    }

    pub fn total_prefill_turns(&self) -> usize {
        self.prefill_turns.len()
    }

    pub fn total_decode_turns(&self) -> usize {
        self.decode_turns.len()
    }

    /// Prefill throughput of one turn, in tokens per second. Returns 0.0 for
    /// an unknown turn or a zero-length duration.
    pub fn prefill_tokens_per_sec(&self, turn_index: usize) -> f64 {
        turn_tokens_per_sec(self.prefill_turns.get(turn_index))
    }

    /// Decode throughput of one turn, in tokens per second. Per-turn, not an
    /// average across turns.
    pub fn decode_tokens_per_sec(&self, turn_index: usize) -> f64 {
        turn_tokens_per_sec(self.decode_turns.get(turn_index))
    }
}

fn turn_tokens_per_sec(turn: Option<&BenchmarkTurnData>) -> f64 {
    let Some(turn) = turn else { return 0.0 };
    let seconds = turn.duration.as_secs_f64();
    if seconds <= 0.0 {
        return 0.0;
    }
    turn.num_tokens as f64 / seconds
}
