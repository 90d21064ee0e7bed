//! The executor: owns compiled model handles and the KV-cache buffers, and
//! drives per-step execution across the pipeline's subgraphs.

mod npu;
mod settings;
mod stats;
mod workgroups;

pub use npu::NpuExecutor;
pub use settings::{BackendConfig, CpuConfig, ExecutorSettings, GpuConfig, NpuConfig};
pub use stats::LatencyStats;
pub use workgroups::{optimized_prefill_work_groups, PrefillSignatureMap, PrefillWorkGroup};

use crate::buffer::{ElementType, TensorBuffer, TensorType};
use crate::error::Result;

/// Inputs handed to the executor for one prefill or decode call.
#[derive(Default)]
pub struct ExecutorInputs {
    /// Token ids as a `[1, num_tokens]` int32 tensor. Decode may leave this
    /// unset to consume the executor's carried-over token instead.
    pub text_token_ids: Option<TensorBuffer>,
}

impl ExecutorInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text_tokens(buffer: TensorBuffer) -> Self {
        ExecutorInputs {
            text_token_ids: Some(buffer),
        }
    }

    /// Build inputs from a plain id slice (shape `[1, len]`).
    pub fn from_token_ids(ids: &[i32]) -> Result<Self> {
        let buffer = TensorBuffer::new(TensorType::new(ElementType::Int32, &[1, ids.len()]));
        buffer.write(ids)?;
        Ok(Self::with_text_tokens(buffer))
    }
}

/// The executor contract the session layer drives.
///
/// One implementation exists today ([`NpuExecutor`]); the trait is the seam
/// that lets session code and tests run against lighter stand-ins.
pub trait LlmExecutor: Send {
    /// Absorb a prompt into the KV cache.
    fn prefill(&mut self, inputs: &ExecutorInputs) -> Result<()>;

    /// Greedy-sample one token and write it into `output_tokens` (a `[1, 1]`
    /// int32 buffer).
    fn decode(&mut self, output_tokens: &TensorBuffer) -> Result<()>;

    /// Run one decode step and hand back the raw logits buffer, for callers
    /// that sample externally.
    fn decode_logits(&mut self, inputs: &ExecutorInputs) -> Result<TensorBuffer>;

    /// Number of tokens absorbed into the KV cache so far.
    fn current_step(&self) -> usize;

    /// Size of the output vocabulary.
    fn vocab_size(&self) -> Result<usize>;

    /// The settings this executor was created with.
    fn settings(&self) -> &ExecutorSettings;

    /// Snapshot of the accumulated latency counters.
    fn latency_stats(&self) -> LatencyStats;
}
