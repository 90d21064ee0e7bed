//! High-level inference sessions.
//!
//! A [`Session`] ties an executor and a tokenizer together and sequences the
//! generation flow: tokenize the prompt, prefill, then decode one token at a
//! time until a stop sequence appears or the KV cache runs out, streaming
//! decoded text to an observer as it becomes printable.
//!
//! # Streaming and incomplete byte sequences
//!
//! BPE vocabularies may split one codepoint across tokens, so the text for a
//! freshly decoded token is not always printable on its own. The session
//! accumulates token ids since the last emitted chunk and asks the tokenizer
//! to decode them; an [`IncompleteBpe`](crate::EdgeLmError::IncompleteBpe)
//! result means "hold the tail and retry after the next token", which is
//! exactly what the loop does.

mod actor;
mod stop;

pub use actor::{SessionActor, SessionCommand, SessionEvent};
pub use stop::StopTokenDetector;

use serde::Deserialize;
use uuid::Uuid;

use crate::buffer::{ElementType, TensorBuffer, TensorType};
use crate::error::{EdgeLmError, Result};
use crate::executor::{ExecutorInputs, LlmExecutor};
use crate::io::{BenchmarkInfo, BenchmarkParams, Responses};
use crate::tokenizer::Tokenizer;

/// The piece separator some vocabularies use in place of a space.
const PIECE_SEPARATOR: char = '\u{2581}';

/// Batch size of the output; candidates beyond one are future work.
const OUTPUT_BATCH_SIZE: usize = 1;

/// Sampling strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum SamplerType {
    #[default]
    Greedy,
    TopK,
    TopP,
}

/// Sampling hyperparameters.
///
/// Carried through the session as configuration; the compiled-model executor
/// samples greedily on its own, so these take effect only with executors
/// that expose logits for external sampling.
#[derive(Debug, Clone, Deserialize)]
pub struct SamplerParams {
    #[serde(default)]
    pub sampler_type: SamplerType,

    /// Top-K cutoff; 0 disables.
    #[serde(default)]
    pub k: usize,

    /// Top-P (nucleus) cutoff; 1.0 disables.
    #[serde(default = "default_top_p")]
    pub p: f32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default)]
    pub seed: u64,
}

fn default_top_p() -> f32 {
    1.0
}
fn default_temperature() -> f32 {
    1.0
}

impl Default for SamplerParams {
    fn default() -> Self {
        SamplerParams {
            sampler_type: SamplerType::default(),
            k: 0,
            p: default_top_p(),
            temperature: default_temperature(),
            seed: 0,
        }
    }
}

/// Configuration for creating a session.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    /// Token sequences that end generation when they appear in the output.
    pub stop_token_sequences: Vec<Vec<i32>>,

    /// BOS token prepended to each prompt. Falls back to the tokenizer's
    /// BOS id; no insertion when neither is available.
    pub bos_token_id: Option<i32>,

    /// Sampling hyperparameters (see [`SamplerParams`]).
    pub sampler: SamplerParams,

    /// When set, prefill/decode turn timings are recorded and token counts
    /// may be overridden for measurement runs.
    pub benchmark: Option<BenchmarkParams>,
}

/// Streaming signals a generation run emits.
///
/// Any type with these three callbacks can observe a run; all methods
/// default to no-ops so implementations can be selective.
pub trait InferenceObserver {
    /// A new chunk of decoded text is available.
    fn on_next(&mut self, _responses: &Responses) {}

    /// Generation finished normally.
    fn on_done(&mut self) {}

    /// Generation failed; no further signals follow.
    fn on_error(&mut self, _error: &EdgeLmError) {}
}

/// An inference session: one conversation's worth of executor state.
pub struct Session {
    id: Uuid,
    executor: Box<dyn LlmExecutor>,
    tokenizer: Box<dyn Tokenizer>,
    config: SessionConfig,
    stop_detector: StopTokenDetector,
    benchmark_info: Option<BenchmarkInfo>,
    last_prefill_token_id: i32,
}

impl Session {
    /// Create a session over an executor and tokenizer.
    pub fn create(
        executor: Box<dyn LlmExecutor>,
        tokenizer: Box<dyn Tokenizer>,
        config: SessionConfig,
    ) -> Result<Self> {
        let benchmark_info = config.benchmark.clone().map(BenchmarkInfo::new);
        if benchmark_info.is_some() {
            tracing::info!("benchmark is enabled");
        }
        let stop_detector = StopTokenDetector::new(&config.stop_token_sequences);
        Ok(Session {
            id: Uuid::new_v4(),
            executor,
            tokenizer,
            config,
            stop_detector,
            benchmark_info,
            last_prefill_token_id: crate::tokenizer::NO_TOKEN_ID,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Tokenize `input` and absorb it into the executor's KV cache.
    pub fn run_prefill(&mut self, input: &str) -> Result<()> {
        tracing::debug!(session = %self.id, len = input.len(), "run_prefill");
        if let Some(info) = &mut self.benchmark_info {
            info.time_prefill_turn_start()?;
        }

        let mut ids = self.tokenizer.text_to_token_ids(input)?;
        let benchmark_prefill_tokens = self
            .benchmark_info
            .as_ref()
            .map_or(0, |info| info.params().num_prefill_tokens);
        if benchmark_prefill_tokens > 0 {
            // Measurement runs pin the prefill length regardless of prompt.
            ids.resize(benchmark_prefill_tokens, 0);
        } else if let Some(bos) = self.bos_token_id() {
            ids.insert(0, bos);
        }

        let max_num_tokens = self.executor.settings().max_num_tokens;
        if ids.len() >= max_num_tokens {
            return Err(EdgeLmError::InvalidArgument(format!(
                "input token ids are too long, exceeding the maximum number of tokens allowed: {} >= {max_num_tokens}",
                ids.len()
            )));
        }
        if ids.is_empty() {
            return Err(EdgeLmError::Internal("input token ids are empty".into()));
        }
        self.last_prefill_token_id = ids[ids.len() - 1];

        let inputs = ExecutorInputs::from_token_ids(&ids)?;
        self.executor.prefill(&inputs)?;

        if let Some(info) = &mut self.benchmark_info {
            info.time_prefill_turn_end(ids.len() as u64)?;
        }
        tracing::debug!(session = %self.id, num_tokens = ids.len(), "prefill done");
        Ok(())
    }

    /// Decode until a stop sequence or the token limit, collecting the full
    /// response.
    pub fn run_decode(&mut self) -> Result<Responses> {
        self.decode_loop(None)
    }

    /// Decode as [`run_decode`](Session::run_decode), streaming each
    /// printable chunk to `observer` as it is produced.
    pub fn run_decode_stream(&mut self, observer: &mut dyn InferenceObserver) -> Result<()> {
        self.decode_loop(Some(observer)).map(|_| ())
    }

    /// Recorded benchmark timings, when benchmarking was enabled.
    pub fn benchmark_info(&self) -> Result<&BenchmarkInfo> {
        self.benchmark_info.as_ref().ok_or_else(|| {
            EdgeLmError::Internal(
                "benchmark is not enabled; set BenchmarkParams in the session config".into(),
            )
        })
    }

    /// Last token of the most recent prefill, for executors that take the
    /// seed token explicitly when sampling externally.
    pub fn last_prefill_token_id(&self) -> i32 {
        self.last_prefill_token_id
    }

    fn bos_token_id(&self) -> Option<i32> {
        self.config
            .bos_token_id
            .or_else(|| self.tokenizer.bos_id().ok())
    }

    fn decode_loop(
        &mut self,
        mut observer: Option<&mut dyn InferenceObserver>,
    ) -> Result<Responses> {
        tracing::debug!(session = %self.id, "run_decode");
        let benchmark_decode_tokens = self
            .benchmark_info
            .as_ref()
            .map_or(0, |info| info.params().num_decode_tokens);
        if let Some(info) = &mut self.benchmark_info {
            info.time_decode_turn_start()?;
        }
        self.stop_detector.reset();

        let output_tokens =
            TensorBuffer::new(TensorType::new(ElementType::Int32, &[OUTPUT_BATCH_SIZE, 1]));
        let max_num_tokens = self.executor.settings().max_num_tokens;

        let mut responses = Responses::new(OUTPUT_BATCH_SIZE);
        // Token ids accumulated since the last emitted chunk; non-empty only
        // while the tail is not yet decodable on its own.
        let mut pending_ids: Vec<i32> = Vec::new();
        let mut num_decoded_steps = 0usize;

        loop {
            if let Err(e) = self.executor.decode(&output_tokens) {
                if let Some(obs) = observer.as_deref_mut() {
                    obs.on_error(&e);
                }
                return Err(e);
            }
            let token = {
                let guard = output_tokens.lock()?;
                guard.as_slice::<i32>()?[0]
            };
            num_decoded_steps += 1;
            pending_ids.push(token);
            let hit_stop_tokens = self.stop_detector.process_token(token);

            match self.tokenizer.token_ids_to_text(&pending_ids) {
                Ok(text) => {
                    let chunk = text.replace(PIECE_SEPARATOR, " ");
                    responses.response_texts_mut()[0].push_str(&chunk);
                    pending_ids.clear();
                    if let Some(obs) = observer.as_deref_mut() {
                        let mut chunk_responses = Responses::new(OUTPUT_BATCH_SIZE);
                        chunk_responses.response_texts_mut()[0] = chunk;
                        obs.on_next(&chunk_responses);
                    }
                }
                Err(e) if e.is_incomplete_bpe() => {
                    // Keep the undecodable tail and retry after the next token.
                }
                Err(e) => {
                    if let Some(obs) = observer.as_deref_mut() {
                        obs.on_error(&e);
                    }
                    return Err(e);
                }
            }

            // Stopping conditions. Benchmark runs decode a fixed number of
            // steps and ignore stop sequences.
            if hit_stop_tokens && benchmark_decode_tokens == 0 {
                break;
            }
            if benchmark_decode_tokens > 0 && num_decoded_steps >= benchmark_decode_tokens {
                break;
            }
            if self.executor.current_step() >= max_num_tokens {
                let error = EdgeLmError::Internal("maximum kv-cache size reached".into());
                if let Some(obs) = observer.as_deref_mut() {
                    obs.on_error(&error);
                }
                break;
            }
        }

        if let Some(info) = &mut self.benchmark_info {
            info.time_decode_turn_end((num_decoded_steps * OUTPUT_BATCH_SIZE) as u64)?;
        }
        if let Some(obs) = observer.as_deref_mut() {
            obs.on_done();
        }
        tracing::debug!(session = %self.id, num_decoded_steps, "decode done");
        Ok(responses)
    }
}
