//! The NPU compiled-model executor.
//!
//! Wires five compiled subgraphs (embedder, RoPE, mask, transformer,
//! cache-update) into a prefill pipeline and a decode pipeline that share
//! buffers by aliasing: the embedder's output buffer *is* the transformer's
//! `input_embeds` buffer, the mask outputs *are* the transformer's mask
//! inputs, and the KV-cache tensors are bound to both the transformer and the
//! cache-update graph so the cache is updated in place. No bytes move between
//! stages within a step.
//!
//! The executor is single-threaded cooperative: one prefill chunk or decode
//! step at a time, stages in a fixed order, which is what makes the aliasing
//! safe (no subgraph reads a buffer whose producer has not run this step).

use std::collections::HashMap;
use std::time::Instant;

use crate::asset::{ModelResources, ModelRole};
use crate::buffer::TensorBuffer;
use crate::error::{EdgeLmError, Result};
use crate::graph::{Accelerator, BufferMap, CompiledGraph, Environment, GraphCompiler};
use crate::tokenizer::NO_TOKEN_ID;

use super::settings::ExecutorSettings;
use super::stats::LatencyStats;
use super::workgroups::{optimized_prefill_work_groups, PrefillSignatureMap};
use super::{ExecutorInputs, LlmExecutor};

/// The transformer's prefill signature and the chunk length it implements.
const PREFILL_SIGNATURE: &str = "prefill_128";
const PREFILL_SIZE: usize = 128;
const DECODE_SIGNATURE: &str = "decode";

/// Signature and tensor names for the embedder subgraph. Prefill and decode
/// use identical tensor names.
mod embedder {
    pub const PREFILL: &str = "prefill_embedder_128";
    pub const DECODE: &str = "decode_embedder";
    pub const TOKENS: &str = "tokens";
    pub const EMBEDS: &str = "embeds";
}

/// Signature and tensor names for the mask subgraph.
mod mask {
    pub const PREFILL: &str = "prefill_mask_128";
    pub const DECODE: &str = "decode_mask";
    pub const TIME_STEP: &str = "time_step";
    pub const INPUT_TOKENS: &str = "input_tokens";
    pub const OUTPUTS: [&str; 2] = ["mask_local", "mask_global"];
}

/// Signature and tensor names for the RoPE subgraph.
mod rope {
    pub const PREFILL: &str = "prefill_rope_128";
    pub const DECODE: &str = "decode_rope";
    pub const INPUT_POS: &str = "input_pos";
    pub const OUTPUTS: [&str; 4] = [
        "pos_emb_cos",
        "pos_emb_sin",
        "pos_emb_local_cos",
        "pos_emb_local_sin",
    ];
}

/// Tensor names for the transformer subgraph.
mod llm {
    pub const INPUT_EMBEDS: &str = "input_embeds";
    pub const LOGITS: &str = "logits";
}

/// Signature and tensor names for the cache-update subgraph.
mod cache_update {
    pub const PREFILL: &str = "prefill_cache_update_128";
    pub const DECODE: &str = "decode_cache_update";
    pub const INPUT_POS: &str = "input_pos";
}

const KV_CACHE_K_PREFIX: &str = "kv_cache_k_";
const KV_CACHE_V_PREFIX: &str = "kv_cache_v_";
const KV_SLICE_K_PREFIX: &str = "kv_slice_k_";
const KV_SLICE_V_PREFIX: &str = "kv_slice_v_";

fn is_kv_cache_name(name: &str) -> bool {
    name.starts_with(KV_CACHE_K_PREFIX) || name.starts_with(KV_CACHE_V_PREFIX)
}

fn is_kv_slice_name(name: &str) -> bool {
    name.starts_with(KV_SLICE_K_PREFIX) || name.starts_with(KV_SLICE_V_PREFIX)
}

/// The four buffer maps one pipeline stage is run with.
struct InferenceContext {
    prefill_inputs: BufferMap,
    prefill_outputs: BufferMap,
    decode_inputs: BufferMap,
    decode_outputs: BufferMap,
}

/// The embedder owns its compiled graph alongside its buffer maps; all other
/// auxiliary stages share the single auxiliary graph.
struct EmbedderContext {
    graph: Box<dyn CompiledGraph>,
    context: InferenceContext,
}

/// Duplicate every buffer of a map: same storage, fresh handles.
fn duplicate_all(buffers: &BufferMap) -> BufferMap {
    buffers
        .iter()
        .map(|(name, buffer)| (name.clone(), buffer.duplicate()))
        .collect()
}

/// Fetch a buffer that construction guaranteed to exist.
fn bound_buffer<'a>(buffers: &'a BufferMap, name: &str) -> Result<&'a TensorBuffer> {
    buffers.get(name).ok_or_else(|| {
        EdgeLmError::Internal(format!("buffer {name} is not bound in this context"))
    })
}

/// Run one stage and wrap any failure with the stage name. Returns the
/// elapsed wall time in microseconds for the latency counters.
fn timed_run(
    graph: &dyn CompiledGraph,
    signature: &str,
    inputs: &BufferMap,
    outputs: &BufferMap,
    stage: &str,
) -> Result<u64> {
    let start = Instant::now();
    graph
        .run(signature, inputs, outputs)
        .map_err(|e| EdgeLmError::Internal(format!("failed to run {stage}: {e}")))?;
    Ok(start.elapsed().as_micros() as u64)
}

/// Executor for models whose transformer is ahead-of-time compiled for the
/// NPU, with CPU-compiled embedder and auxiliary (RoPE / mask / cache-update)
/// subgraphs.
pub struct NpuExecutor {
    settings: ExecutorSettings,
    env: Environment,

    llm_graph: Box<dyn CompiledGraph>,
    aux_graph: Box<dyn CompiledGraph>,

    embedder_context: EmbedderContext,
    mask_context: InferenceContext,
    rope_context: InferenceContext,
    llm_context: InferenceContext,
    cache_update_context: InferenceContext,

    prefill_signatures: PrefillSignatureMap,

    /// Count of tokens absorbed into the KV cache.
    current_step: usize,

    /// Token materialized as input but not yet absorbed into the cache; the
    /// first token of the next prefill chunk or the sole token of the next
    /// decode. `NO_TOKEN_ID` when empty.
    next_input_token_id: i32,

    latency_stats: LatencyStats,
}

impl NpuExecutor {
    /// Build an executor from a model bundle.
    ///
    /// Compiles the three sub-models, allocates and cross-aliases every
    /// pipeline buffer, runs one warmup pass over all signatures so lazy
    /// device initialization fails here rather than mid-generation, and
    /// registers the supported prefill chunk lengths.
    pub fn create(
        settings: ExecutorSettings,
        resources: &ModelResources<'_>,
        compiler: &dyn GraphCompiler,
        env: Environment,
    ) -> Result<Self> {
        let llm_graph = compiler.compile(
            &env,
            resources.model_bytes(ModelRole::PrefillDecode)?,
            settings.backend,
        )?;

        // Allocate every transformer buffer first; the auxiliary stages then
        // duplicate these into their own output maps so each stage writes
        // straight into the transformer's inputs.
        let mut llm_prefill_inputs: BufferMap = HashMap::new();
        let mut input_kv_cache: BufferMap = HashMap::new();
        for spec in llm_graph.signature(PREFILL_SIGNATURE)?.inputs().to_vec() {
            let buffer = llm_graph.create_input_buffer(PREFILL_SIGNATURE, &spec.name)?;
            if is_kv_cache_name(&spec.name) {
                input_kv_cache.insert(spec.name, buffer);
            } else {
                llm_prefill_inputs.insert(spec.name, buffer);
            }
        }

        let mut llm_decode_inputs: BufferMap = HashMap::new();
        for spec in llm_graph.signature(DECODE_SIGNATURE)?.inputs().to_vec() {
            if is_kv_cache_name(&spec.name) {
                continue; // shared with the prefill allocation above
            }
            let buffer = llm_graph.create_input_buffer(DECODE_SIGNATURE, &spec.name)?;
            llm_decode_inputs.insert(spec.name, buffer);
        }

        let mut prefill_kv_slices: BufferMap = HashMap::new();
        for spec in llm_graph.signature(PREFILL_SIGNATURE)?.outputs().to_vec() {
            if is_kv_slice_name(&spec.name) {
                let buffer = llm_graph.create_output_buffer(PREFILL_SIGNATURE, &spec.name)?;
                prefill_kv_slices.insert(spec.name, buffer);
            }
        }
        let mut decode_kv_slices: BufferMap = HashMap::new();
        for spec in llm_graph.signature(DECODE_SIGNATURE)?.outputs().to_vec() {
            if is_kv_slice_name(&spec.name) {
                let buffer = llm_graph.create_output_buffer(DECODE_SIGNATURE, &spec.name)?;
                decode_kv_slices.insert(spec.name, buffer);
            }
        }

        let llm_context = Self::create_llm_context(
            llm_graph.as_ref(),
            &settings,
            &input_kv_cache,
            &prefill_kv_slices,
            &decode_kv_slices,
            &llm_prefill_inputs,
            &llm_decode_inputs,
        )?;

        let aux_graph = compiler.compile(
            &env,
            resources.model_bytes(ModelRole::Auxiliary)?,
            Accelerator::Cpu,
        )?;

        let mask_context =
            Self::create_mask_context(aux_graph.as_ref(), &llm_prefill_inputs, &llm_decode_inputs)?;

        // The mask's token buffers double as the embedder's inputs, so both
        // stages see the same ids each step.
        let prefill_input_tokens =
            bound_buffer(&mask_context.prefill_inputs, mask::INPUT_TOKENS)?.duplicate();
        let decode_input_tokens =
            bound_buffer(&mask_context.decode_inputs, mask::INPUT_TOKENS)?.duplicate();

        let embedder_graph = compiler.compile(
            &env,
            resources.model_bytes(ModelRole::Embedder)?,
            Accelerator::Cpu,
        )?;
        let embedder_context = Self::create_embedder_context(
            embedder_graph,
            prefill_input_tokens,
            decode_input_tokens,
            &llm_prefill_inputs,
            &llm_decode_inputs,
        )?;

        let rope_context =
            Self::create_rope_context(aux_graph.as_ref(), &llm_prefill_inputs, &llm_decode_inputs)?;

        // Likewise, RoPE's position buffers feed the cache-update graph.
        let prefill_input_pos =
            bound_buffer(&rope_context.prefill_inputs, rope::INPUT_POS)?.duplicate();
        let decode_input_pos =
            bound_buffer(&rope_context.decode_inputs, rope::INPUT_POS)?.duplicate();

        let cache_update_context = Self::create_cache_update_context(
            &input_kv_cache,
            &prefill_kv_slices,
            &decode_kv_slices,
            prefill_input_pos,
            decode_input_pos,
        );

        let mut prefill_signatures = PrefillSignatureMap::new();
        prefill_signatures.insert(PREFILL_SIZE, PREFILL_SIGNATURE);

        let executor = NpuExecutor {
            settings,
            env,
            llm_graph,
            aux_graph,
            embedder_context,
            mask_context,
            rope_context,
            llm_context,
            cache_update_context,
            prefill_signatures,
            current_step: 0,
            next_input_token_id: NO_TOKEN_ID,
            latency_stats: LatencyStats::default(),
        };
        executor.warmup()?;
        tracing::info!(backend = %executor.settings.backend, "executor created");
        Ok(executor)
    }

    /// Transformer buffer maps: inputs alias the shared allocations, outputs
    /// are the KV slices plus (for decode) a fresh logits buffer.
    fn create_llm_context(
        llm_graph: &dyn CompiledGraph,
        settings: &ExecutorSettings,
        input_kv_cache: &BufferMap,
        prefill_kv_slices: &BufferMap,
        decode_kv_slices: &BufferMap,
        llm_prefill_inputs: &BufferMap,
        llm_decode_inputs: &BufferMap,
    ) -> Result<InferenceContext> {
        let mut prefill_inputs = duplicate_all(llm_prefill_inputs);
        prefill_inputs.extend(duplicate_all(input_kv_cache));

        let prefill_outputs = duplicate_all(prefill_kv_slices);

        let mut decode_inputs = duplicate_all(llm_decode_inputs);
        decode_inputs.extend(duplicate_all(input_kv_cache));

        // Some models declare cache tensors whose element type differs
        // between the prefill and decode signatures. Those cannot be
        // registered as one shared buffer, so the decode side gets fresh,
        // never-aliased allocations. The decode path does not read them;
        // they only satisfy the signature shape.
        let decode_signature = llm_graph.signature(DECODE_SIGNATURE)?;
        for name in &settings.decode_incompatible_cache_tensors {
            if decode_signature.input(name).is_some() {
                decode_inputs.insert(
                    name.clone(),
                    llm_graph.create_input_buffer(DECODE_SIGNATURE, name)?,
                );
            } else {
                tracing::debug!(%name, "dtype-incompatible cache tensor not in decode signature");
            }
        }

        let mut decode_outputs = duplicate_all(decode_kv_slices);
        decode_outputs.insert(
            llm::LOGITS.to_string(),
            llm_graph.create_output_buffer(DECODE_SIGNATURE, llm::LOGITS)?,
        );

        Ok(InferenceContext {
            prefill_inputs,
            prefill_outputs,
            decode_inputs,
            decode_outputs,
        })
    }

    /// Mask buffer maps: fresh time-step and token inputs, outputs aliased
    /// into the transformer's mask inputs.
    fn create_mask_context(
        aux_graph: &dyn CompiledGraph,
        llm_prefill_inputs: &BufferMap,
        llm_decode_inputs: &BufferMap,
    ) -> Result<InferenceContext> {
        let mut prefill_inputs = BufferMap::new();
        prefill_inputs.insert(
            mask::TIME_STEP.to_string(),
            aux_graph.create_input_buffer(mask::PREFILL, mask::TIME_STEP)?,
        );
        prefill_inputs.insert(
            mask::INPUT_TOKENS.to_string(),
            aux_graph.create_input_buffer(mask::PREFILL, mask::INPUT_TOKENS)?,
        );

        let mut prefill_outputs = BufferMap::new();
        for name in mask::OUTPUTS {
            prefill_outputs.insert(
                name.to_string(),
                bound_buffer(llm_prefill_inputs, name)?.duplicate(),
            );
        }

        let mut decode_inputs = BufferMap::new();
        decode_inputs.insert(
            mask::TIME_STEP.to_string(),
            aux_graph.create_input_buffer(mask::DECODE, mask::TIME_STEP)?,
        );
        decode_inputs.insert(
            mask::INPUT_TOKENS.to_string(),
            aux_graph.create_input_buffer(mask::DECODE, mask::INPUT_TOKENS)?,
        );

        let mut decode_outputs = BufferMap::new();
        for name in mask::OUTPUTS {
            decode_outputs.insert(
                name.to_string(),
                bound_buffer(llm_decode_inputs, name)?.duplicate(),
            );
        }

        Ok(InferenceContext {
            prefill_inputs,
            prefill_outputs,
            decode_inputs,
            decode_outputs,
        })
    }

    /// Embedder buffer maps: token inputs shared with the mask stage,
    /// embedding outputs aliased into the transformer's `input_embeds`.
    fn create_embedder_context(
        graph: Box<dyn CompiledGraph>,
        prefill_input_tokens: TensorBuffer,
        decode_input_tokens: TensorBuffer,
        llm_prefill_inputs: &BufferMap,
        llm_decode_inputs: &BufferMap,
    ) -> Result<EmbedderContext> {
        let mut prefill_inputs = BufferMap::new();
        prefill_inputs.insert(embedder::TOKENS.to_string(), prefill_input_tokens);
        let mut prefill_outputs = BufferMap::new();
        prefill_outputs.insert(
            embedder::EMBEDS.to_string(),
            bound_buffer(llm_prefill_inputs, llm::INPUT_EMBEDS)?.duplicate(),
        );

        let mut decode_inputs = BufferMap::new();
        decode_inputs.insert(embedder::TOKENS.to_string(), decode_input_tokens);
        let mut decode_outputs = BufferMap::new();
        decode_outputs.insert(
            embedder::EMBEDS.to_string(),
            bound_buffer(llm_decode_inputs, llm::INPUT_EMBEDS)?.duplicate(),
        );

        Ok(EmbedderContext {
            graph,
            context: InferenceContext {
                prefill_inputs,
                prefill_outputs,
                decode_inputs,
                decode_outputs,
            },
        })
    }

    /// RoPE buffer maps: fresh position inputs, sin/cos outputs aliased into
    /// the transformer's position-embedding inputs.
    fn create_rope_context(
        aux_graph: &dyn CompiledGraph,
        llm_prefill_inputs: &BufferMap,
        llm_decode_inputs: &BufferMap,
    ) -> Result<InferenceContext> {
        let mut prefill_inputs = BufferMap::new();
        prefill_inputs.insert(
            rope::INPUT_POS.to_string(),
            aux_graph.create_input_buffer(rope::PREFILL, rope::INPUT_POS)?,
        );
        let mut prefill_outputs = BufferMap::new();
        for name in rope::OUTPUTS {
            prefill_outputs.insert(
                name.to_string(),
                bound_buffer(llm_prefill_inputs, name)?.duplicate(),
            );
        }

        let mut decode_inputs = BufferMap::new();
        decode_inputs.insert(
            rope::INPUT_POS.to_string(),
            aux_graph.create_input_buffer(rope::DECODE, rope::INPUT_POS)?,
        );
        let mut decode_outputs = BufferMap::new();
        for name in rope::OUTPUTS {
            decode_outputs.insert(
                name.to_string(),
                bound_buffer(llm_decode_inputs, name)?.duplicate(),
            );
        }

        Ok(InferenceContext {
            prefill_inputs,
            prefill_outputs,
            decode_inputs,
            decode_outputs,
        })
    }

    /// Cache-update buffer maps: the KV cache is bound as both input and
    /// output (the update happens in place), the KV slices produced by the
    /// transformer are inputs, and the position buffer is shared with RoPE.
    fn create_cache_update_context(
        input_kv_cache: &BufferMap,
        prefill_kv_slices: &BufferMap,
        decode_kv_slices: &BufferMap,
        prefill_input_pos: TensorBuffer,
        decode_input_pos: TensorBuffer,
    ) -> InferenceContext {
        let mut prefill_inputs = duplicate_all(input_kv_cache);
        prefill_inputs.extend(duplicate_all(prefill_kv_slices));
        prefill_inputs.insert(cache_update::INPUT_POS.to_string(), prefill_input_pos);
        let prefill_outputs = duplicate_all(input_kv_cache);

        let mut decode_inputs = duplicate_all(input_kv_cache);
        decode_inputs.extend(duplicate_all(decode_kv_slices));
        decode_inputs.insert(cache_update::INPUT_POS.to_string(), decode_input_pos);
        let decode_outputs = duplicate_all(input_kv_cache);

        InferenceContext {
            prefill_inputs,
            prefill_outputs,
            decode_inputs,
            decode_outputs,
        }
    }

    /// Invoke every signature once over the freshly-zeroed buffers, forcing
    /// lazy device initialization and surfacing compile-time mistakes now.
    fn warmup(&self) -> Result<()> {
        let pairs: [(&dyn CompiledGraph, &str, &InferenceContext, &str); 5] = [
            (
                self.llm_graph.as_ref(),
                PREFILL_SIGNATURE,
                &self.llm_context,
                "transformer",
            ),
            (
                self.aux_graph.as_ref(),
                rope::PREFILL,
                &self.rope_context,
                "rope",
            ),
            (
                self.aux_graph.as_ref(),
                mask::PREFILL,
                &self.mask_context,
                "mask",
            ),
            (
                self.aux_graph.as_ref(),
                cache_update::PREFILL,
                &self.cache_update_context,
                "cache update",
            ),
            (
                self.embedder_context.graph.as_ref(),
                embedder::PREFILL,
                &self.embedder_context.context,
                "embedder",
            ),
        ];
        let decode_signatures = [
            DECODE_SIGNATURE,
            rope::DECODE,
            mask::DECODE,
            cache_update::DECODE,
            embedder::DECODE,
        ];
        for ((graph, prefill_signature, context, stage), decode_signature) in
            pairs.into_iter().zip(decode_signatures)
        {
            graph
                .run(
                    prefill_signature,
                    &context.prefill_inputs,
                    &context.prefill_outputs,
                )
                .map_err(|e| {
                    EdgeLmError::Internal(format!("warmup run for {stage} (prefill) failed: {e}"))
                })?;
            graph
                .run(
                    decode_signature,
                    &context.decode_inputs,
                    &context.decode_outputs,
                )
                .map_err(|e| {
                    EdgeLmError::Internal(format!("warmup run for {stage} (decode) failed: {e}"))
                })?;
        }
        Ok(())
    }

    /// One prefill dispatch of `ids` through the chunk-sized signature.
    ///
    /// Only the first `len - 1` ids are written into the pipeline; the last
    /// id is stashed in `next_input_token_id` and becomes the first token of
    /// the next prefill chunk or the sole token of the next decode. A
    /// carried-over token from the previous call is consumed first, without
    /// advancing the cursor into `ids`.
    ///
    /// State commits only after every stage succeeds; a mid-chunk failure
    /// leaves `current_step` and `next_input_token_id` as they were before
    /// the chunk.
    fn prefill_internal(&mut self, signature: &str, ids: &[i32]) -> Result<()> {
        let prepare_start = Instant::now();
        let mut step = self.current_step;
        let mut pending = self.next_input_token_id;
        {
            let token_buffer =
                bound_buffer(&self.embedder_context.context.prefill_inputs, embedder::TOKENS)?;
            let pos_buffer = bound_buffer(&self.rope_context.prefill_inputs, rope::INPUT_POS)?;
            let time_step_buffer =
                bound_buffer(&self.mask_context.prefill_inputs, mask::TIME_STEP)?;

            let mut token_guard = token_buffer.lock()?;
            let mut pos_guard = pos_buffer.lock()?;
            let mut time_step_guard = time_step_buffer.lock()?;
            token_guard.fill_zero();
            pos_guard.fill_zero();
            time_step_guard.fill_zero();

            let tokens = token_guard.as_mut_slice::<i32>()?;
            let positions = pos_guard.as_mut_slice::<i32>()?;
            time_step_guard.as_mut_slice::<i32>()?[0] = step as i32;

            let mut i = 0;
            let mut input_idx = 0;
            while i + 1 < ids.len() {
                if pending != NO_TOKEN_ID {
                    // Consume the carried-over token first; the cursor into
                    // `ids` does not advance for it.
                    tokens[input_idx] = pending;
                    pending = NO_TOKEN_ID;
                } else {
                    tokens[input_idx] = ids[i];
                    i += 1;
                }
                positions[input_idx] = step as i32;
                step += 1;
                input_idx += 1;
            }
        }
        self.latency_stats.prefill_prepare_input_latency_us +=
            prepare_start.elapsed().as_micros() as u64;

        self.latency_stats.prefill_embedder_inference_latency_us += timed_run(
            self.embedder_context.graph.as_ref(),
            embedder::PREFILL,
            &self.embedder_context.context.prefill_inputs,
            &self.embedder_context.context.prefill_outputs,
            "embedder (prefill)",
        )?;
        self.latency_stats.prefill_rope_inference_latency_us += timed_run(
            self.aux_graph.as_ref(),
            rope::PREFILL,
            &self.rope_context.prefill_inputs,
            &self.rope_context.prefill_outputs,
            "rope (prefill)",
        )?;
        self.latency_stats.prefill_mask_inference_latency_us += timed_run(
            self.aux_graph.as_ref(),
            mask::PREFILL,
            &self.mask_context.prefill_inputs,
            &self.mask_context.prefill_outputs,
            "mask (prefill)",
        )?;
        self.latency_stats.prefill_llm_inference_latency_us += timed_run(
            self.llm_graph.as_ref(),
            signature,
            &self.llm_context.prefill_inputs,
            &self.llm_context.prefill_outputs,
            "transformer (prefill)",
        )?;
        self.latency_stats.prefill_cache_update_inference_latency_us += timed_run(
            self.aux_graph.as_ref(),
            cache_update::PREFILL,
            &self.cache_update_context.prefill_inputs,
            &self.cache_update_context.prefill_outputs,
            "cache update (prefill)",
        )?;

        self.current_step = step;
        self.next_input_token_id = ids[ids.len() - 1];
        Ok(())
    }

    /// Run the decode pipeline once, leaving the logits in the transformer's
    /// decode output buffer. Consumes the carried-over token unless the
    /// caller supplies one explicitly.
    fn decode_step(&mut self, inputs: &ExecutorInputs) -> Result<()> {
        let prepare_start = Instant::now();
        let mut id = self.next_input_token_id;
        if let Some(tokens) = &inputs.text_token_ids {
            let num_elements = tokens.tensor_type().num_elements();
            if num_elements != 0 {
                // Provided ids win over the carried-over token. Batch size 1,
                // single token only.
                if num_elements != 1 {
                    return Err(EdgeLmError::InvalidArgument(format!(
                        "decode accepts exactly one token id, got {num_elements}"
                    )));
                }
                let guard = tokens.lock()?;
                id = guard.as_slice::<i32>()?[0];
            }
        }
        if id == NO_TOKEN_ID {
            return Err(EdgeLmError::InvalidArgument(
                "no id available to be decoded".into(),
            ));
        }

        // The carried-over token is spent now, whether or not it was used.
        self.next_input_token_id = NO_TOKEN_ID;

        {
            let token_buffer =
                bound_buffer(&self.embedder_context.context.decode_inputs, embedder::TOKENS)?;
            let pos_buffer = bound_buffer(&self.rope_context.decode_inputs, rope::INPUT_POS)?;
            let time_step_buffer =
                bound_buffer(&self.mask_context.decode_inputs, mask::TIME_STEP)?;

            let mut token_guard = token_buffer.lock()?;
            token_guard.as_mut_slice::<i32>()?[0] = id;
            let mut pos_guard = pos_buffer.lock()?;
            pos_guard.as_mut_slice::<i32>()?[0] = self.current_step as i32;
            let mut time_step_guard = time_step_buffer.lock()?;
            time_step_guard.as_mut_slice::<i32>()?[0] = self.current_step as i32;
        }
        self.latency_stats.decode_prepare_input_latency_us +=
            prepare_start.elapsed().as_micros() as u64;

        self.latency_stats.decode_embedder_inference_latency_us += timed_run(
            self.embedder_context.graph.as_ref(),
            embedder::DECODE,
            &self.embedder_context.context.decode_inputs,
            &self.embedder_context.context.decode_outputs,
            "embedder (decode)",
        )?;
        self.latency_stats.decode_rope_inference_latency_us += timed_run(
            self.aux_graph.as_ref(),
            rope::DECODE,
            &self.rope_context.decode_inputs,
            &self.rope_context.decode_outputs,
            "rope (decode)",
        )?;
        self.latency_stats.decode_mask_inference_latency_us += timed_run(
            self.aux_graph.as_ref(),
            mask::DECODE,
            &self.mask_context.decode_inputs,
            &self.mask_context.decode_outputs,
            "mask (decode)",
        )?;
        self.latency_stats.decode_llm_inference_latency_us += timed_run(
            self.llm_graph.as_ref(),
            DECODE_SIGNATURE,
            &self.llm_context.decode_inputs,
            &self.llm_context.decode_outputs,
            "transformer (decode)",
        )?;
        self.latency_stats.decode_cache_update_inference_latency_us += timed_run(
            self.aux_graph.as_ref(),
            cache_update::DECODE,
            &self.cache_update_context.decode_inputs,
            &self.cache_update_context.decode_outputs,
            "cache update (decode)",
        )?;

        self.current_step += 1;
        Ok(())
    }

    /// The token the next prefill or decode will consume first, or
    /// [`NO_TOKEN_ID`].
    pub fn next_input_token_id(&self) -> i32 {
        self.next_input_token_id
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }
}

impl LlmExecutor for NpuExecutor {
    fn prefill(&mut self, inputs: &ExecutorInputs) -> Result<()> {
        let start = Instant::now();
        let tokens = inputs.text_token_ids.as_ref().ok_or_else(|| {
            EdgeLmError::InvalidArgument("prefill requires input token ids".into())
        })?;
        let dims = tokens.tensor_type().dims().to_vec();
        if dims.len() != 2 || dims[0] != 1 {
            return Err(EdgeLmError::InvalidArgument(format!(
                "prefill token ids must have shape [1, n], got {dims:?}"
            )));
        }
        if dims[1] == 0 {
            return Err(EdgeLmError::InvalidArgument(
                "prefill token ids must be non-empty".into(),
            ));
        }
        let ids: Vec<i32> = {
            let guard = tokens.lock()?;
            guard.as_slice::<i32>()?.to_vec()
        };

        let work_groups = optimized_prefill_work_groups(&self.prefill_signatures, ids.len())?;
        let mut consumed = 0;
        for group in &work_groups {
            self.prefill_internal(&group.signature, &ids[consumed..consumed + group.num_tokens])?;
            consumed += group.num_tokens;
            self.latency_stats.prefill_num_tokens += group.num_tokens as u64;
        }
        if consumed != ids.len() {
            return Err(EdgeLmError::Internal(
                "work groups not covering the entire prefill input".into(),
            ));
        }

        self.latency_stats.prefill_e2e_latency_us += start.elapsed().as_micros() as u64;
        Ok(())
    }

    fn decode(&mut self, output_tokens: &TensorBuffer) -> Result<()> {
        let start = Instant::now();
        self.decode_step(&ExecutorInputs::new())?;

        let sample_start = Instant::now();
        let max_index = {
            let logits_buffer = bound_buffer(&self.llm_context.decode_outputs, llm::LOGITS)?;
            let guard = logits_buffer.lock()?;
            let logits = guard.as_slice::<i16>()?;
            if logits.is_empty() {
                return Err(EdgeLmError::Internal("logits buffer is empty".into()));
            }
            let mut max_index = 0usize;
            let mut max_value = logits[0];
            for (i, &value) in logits.iter().enumerate().skip(1) {
                if value > max_value {
                    max_value = value;
                    max_index = i;
                }
            }
            max_index
        };
        self.latency_stats.decode_sampling_latency_us +=
            sample_start.elapsed().as_micros() as u64;

        self.next_input_token_id = max_index as i32;
        output_tokens.write(&[max_index as i32])?;

        self.latency_stats.decode_e2e_latency_us += start.elapsed().as_micros() as u64;
        self.latency_stats.decode_num_tokens += 1;
        Ok(())
    }

    fn decode_logits(&mut self, inputs: &ExecutorInputs) -> Result<TensorBuffer> {
        self.decode_step(inputs)?;
        Ok(bound_buffer(&self.llm_context.decode_outputs, llm::LOGITS)?.duplicate())
    }

    fn current_step(&self) -> usize {
        self.current_step
    }

    fn vocab_size(&self) -> Result<usize> {
        let logits_buffer = bound_buffer(&self.llm_context.decode_outputs, llm::LOGITS)?;
        logits_buffer
            .tensor_type()
            .dims()
            .last()
            .copied()
            .ok_or_else(|| EdgeLmError::Internal("logits buffer has no dimensions".into()))
    }

    fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    fn latency_stats(&self) -> LatencyStats {
        self.latency_stats
    }
}
