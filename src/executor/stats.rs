//! Accumulating latency counters for the executor's pipeline stages.

/// Microsecond counters, accumulated across all prefill chunks and decode
/// steps executed so far. Token counters accumulate alongside so callers can
/// derive per-token figures.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyStats {
    pub prefill_e2e_latency_us: u64,
    pub prefill_prepare_input_latency_us: u64,
    pub prefill_embedder_inference_latency_us: u64,
    pub prefill_rope_inference_latency_us: u64,
    pub prefill_mask_inference_latency_us: u64,
    pub prefill_llm_inference_latency_us: u64,
    pub prefill_cache_update_inference_latency_us: u64,
    pub prefill_num_tokens: u64,

    pub decode_e2e_latency_us: u64,
    pub decode_prepare_input_latency_us: u64,
    pub decode_embedder_inference_latency_us: u64,
    pub decode_rope_inference_latency_us: u64,
    pub decode_mask_inference_latency_us: u64,
    pub decode_llm_inference_latency_us: u64,
    pub decode_cache_update_inference_latency_us: u64,
    pub decode_sampling_latency_us: u64,
    pub decode_num_tokens: u64,
}
