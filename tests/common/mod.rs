#![allow(dead_code)] // each test binary uses a different subset of these fixtures

//! Shared test fixtures: a deterministic stub backend that drives the real
//! executor, tokenizer definitions, and bundle builders.
//!
//! The stub transformer implements a tiny, fully predictable model: the
//! embedder copies each token id into the first element of its embedding,
//! the "transformer" emits logits that make greedy decoding produce
//! `token + 1`, and the cache-update stage writes each absorbed token into
//! the KV-cache tensor at its position. Tests can therefore check exactly
//! which tokens reached which cache positions, and that data written by one
//! stage is visible to the next through the aliased buffers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use edgelm::buffer::{ElementType, TensorBuffer, TensorType};
use edgelm::error::{EdgeLmError, Result};
use edgelm::graph::{
    Accelerator, BufferMap, CompiledGraph, Environment, GraphCompiler, Signature, TensorSpec,
};

pub const EMBED_DIM: usize = 4;
pub const MASK_DIM: usize = 2;
pub const ROPE_DIM: usize = 3;
pub const VOCAB_SIZE: usize = 16;
pub const CACHE_LEN: usize = 512;
pub const PREFILL_LEN: usize = 128;
/// Regular transformer layers in the stub model.
pub const LAYERS: [usize; 2] = [0, 1];
/// The layer whose cache tensors have mismatched prefill/decode dtypes.
pub const QUIRK_LAYER: usize = 25;

/// How the stub transformer fills the decode logits.
#[derive(Clone)]
pub enum LogitsMode {
    /// `argmax == (input_token + 1) % VOCAB_SIZE`.
    NextToken,
    /// Every logit equal; greedy must pick index 0.
    AllEqual,
    /// Exactly these logits.
    Fixed(Vec<i16>),
}

/// Observations and knobs shared between the stub graphs and the tests.
pub struct StubState {
    /// Every `run` invocation, in order: signature names.
    pub run_log: Mutex<Vec<String>>,
    /// Every `compile` invocation: (model tag, accelerator).
    pub compile_log: Mutex<Vec<(String, Accelerator)>>,
    /// Buffers the executor asked the graphs to allocate, keyed
    /// `kind/signature/name`. Duplicates, so tests see later writes.
    pub allocated: Mutex<HashMap<String, TensorBuffer>>,
    pub logits_mode: Mutex<LogitsMode>,
    /// First embedding element per position, as seen by the transformer's
    /// prefill run (proves embedder → transformer aliasing).
    pub last_prefill_embeds: Mutex<Vec<f32>>,
    /// The prefill-side `kv_cache_k_25` handle, to check the decode side
    /// never aliases it.
    pub prefill_quirk_cache: Mutex<Option<TensorBuffer>>,
}

impl StubState {
    pub fn new() -> Arc<Self> {
        Arc::new(StubState {
            run_log: Mutex::new(Vec::new()),
            compile_log: Mutex::new(Vec::new()),
            allocated: Mutex::new(HashMap::new()),
            logits_mode: Mutex::new(LogitsMode::NextToken),
            last_prefill_embeds: Mutex::new(Vec::new()),
            prefill_quirk_cache: Mutex::new(None),
        })
    }

    pub fn set_logits_mode(&self, mode: LogitsMode) {
        *self.logits_mode.lock().unwrap() = mode;
    }

    pub fn clear_run_log(&self) {
        self.run_log.lock().unwrap().clear();
    }

    pub fn run_log_snapshot(&self) -> Vec<String> {
        self.run_log.lock().unwrap().clone()
    }

    /// Read an allocated buffer's contents as f32.
    pub fn allocated_f32(&self, key: &str) -> Vec<f32> {
        let allocated = self.allocated.lock().unwrap();
        let buffer = allocated.get(key).unwrap_or_else(|| {
            panic!("no allocated buffer {key}; have: {:?}", allocated.keys())
        });
        let guard = buffer.lock().unwrap();
        guard.as_slice::<f32>().unwrap().to_vec()
    }

    pub fn allocated_buffer(&self, key: &str) -> TensorBuffer {
        self.allocated.lock().unwrap().get(key).unwrap().duplicate()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum GraphKind {
    Llm,
    Aux,
    Embedder,
}

impl GraphKind {
    fn tag(self) -> &'static str {
        match self {
            GraphKind::Llm => "llm",
            GraphKind::Aux => "aux",
            GraphKind::Embedder => "embedder",
        }
    }
}

fn f32_spec(name: &str, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(name, TensorType::new(ElementType::Float32, dims))
}

fn i32_spec(name: &str, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(name, TensorType::new(ElementType::Int32, dims))
}

fn i16_spec(name: &str, dims: &[usize]) -> TensorSpec {
    TensorSpec::new(name, TensorType::new(ElementType::Int16, dims))
}

/// The transformer's non-cache inputs for a given sequence length.
fn llm_data_inputs(seq: usize) -> Vec<TensorSpec> {
    vec![
        f32_spec("input_embeds", &[1, seq, EMBED_DIM]),
        f32_spec("mask_local", &[1, seq, MASK_DIM]),
        f32_spec("mask_global", &[1, seq, MASK_DIM]),
        f32_spec("pos_emb_cos", &[1, seq, ROPE_DIM]),
        f32_spec("pos_emb_sin", &[1, seq, ROPE_DIM]),
        f32_spec("pos_emb_local_cos", &[1, seq, ROPE_DIM]),
        f32_spec("pos_emb_local_sin", &[1, seq, ROPE_DIM]),
    ]
}

fn kv_cache_inputs(quirk_type: ElementType) -> Vec<TensorSpec> {
    let mut specs = Vec::new();
    for layer in LAYERS {
        specs.push(f32_spec(&format!("kv_cache_k_{layer}"), &[1, CACHE_LEN, 1]));
        specs.push(f32_spec(&format!("kv_cache_v_{layer}"), &[1, CACHE_LEN, 1]));
    }
    for name in [
        format!("kv_cache_k_{QUIRK_LAYER}"),
        format!("kv_cache_v_{QUIRK_LAYER}"),
    ] {
        specs.push(TensorSpec::new(
            &name,
            TensorType::new(quirk_type, &[1, CACHE_LEN, 1]),
        ));
    }
    specs
}

fn kv_slice_outputs(seq: usize) -> Vec<TensorSpec> {
    let mut specs = Vec::new();
    for layer in LAYERS {
        specs.push(f32_spec(&format!("kv_slice_k_{layer}"), &[1, seq, 1]));
        specs.push(f32_spec(&format!("kv_slice_v_{layer}"), &[1, seq, 1]));
    }
    specs
}

fn llm_signatures() -> Vec<Signature> {
    let mut prefill_inputs = llm_data_inputs(PREFILL_LEN);
    prefill_inputs.extend(kv_cache_inputs(ElementType::Float32));
    let mut decode_inputs = llm_data_inputs(1);
    decode_inputs.extend(kv_cache_inputs(ElementType::Int16));

    let mut decode_outputs = kv_slice_outputs(1);
    decode_outputs.push(i16_spec("logits", &[1, 1, VOCAB_SIZE]));

    vec![
        Signature::new("prefill_128", prefill_inputs, kv_slice_outputs(PREFILL_LEN)),
        Signature::new("decode", decode_inputs, decode_outputs),
    ]
}

fn aux_signatures() -> Vec<Signature> {
    let rope_outputs = |seq: usize| {
        vec![
            f32_spec("pos_emb_cos", &[1, seq, ROPE_DIM]),
            f32_spec("pos_emb_sin", &[1, seq, ROPE_DIM]),
            f32_spec("pos_emb_local_cos", &[1, seq, ROPE_DIM]),
            f32_spec("pos_emb_local_sin", &[1, seq, ROPE_DIM]),
        ]
    };
    let mask_outputs = |seq: usize| {
        vec![
            f32_spec("mask_local", &[1, seq, MASK_DIM]),
            f32_spec("mask_global", &[1, seq, MASK_DIM]),
        ]
    };
    let cache_update_inputs = |seq: usize| {
        let mut specs = vec![i32_spec("input_pos", &[seq])];
        specs.extend(kv_cache_inputs(ElementType::Float32));
        specs.extend(kv_slice_outputs(seq));
        specs
    };

    vec![
        Signature::new(
            "prefill_rope_128",
            vec![i32_spec("input_pos", &[PREFILL_LEN])],
            rope_outputs(PREFILL_LEN),
        ),
        Signature::new(
            "decode_rope",
            vec![i32_spec("input_pos", &[1])],
            rope_outputs(1),
        ),
        Signature::new(
            "prefill_mask_128",
            vec![
                i32_spec("time_step", &[1]),
                i32_spec("input_tokens", &[1, PREFILL_LEN]),
            ],
            mask_outputs(PREFILL_LEN),
        ),
        Signature::new(
            "decode_mask",
            vec![i32_spec("time_step", &[1]), i32_spec("input_tokens", &[1, 1])],
            mask_outputs(1),
        ),
        Signature::new(
            "prefill_cache_update_128",
            cache_update_inputs(PREFILL_LEN),
            kv_cache_inputs(ElementType::Float32),
        ),
        Signature::new(
            "decode_cache_update",
            cache_update_inputs(1),
            kv_cache_inputs(ElementType::Float32),
        ),
    ]
}

fn embedder_signatures() -> Vec<Signature> {
    vec![
        Signature::new(
            "prefill_embedder_128",
            vec![i32_spec("tokens", &[1, PREFILL_LEN])],
            vec![f32_spec("embeds", &[1, PREFILL_LEN, EMBED_DIM])],
        ),
        Signature::new(
            "decode_embedder",
            vec![i32_spec("tokens", &[1, 1])],
            vec![f32_spec("embeds", &[1, 1, EMBED_DIM])],
        ),
    ]
}

pub struct StubGraph {
    kind: GraphKind,
    signatures: Vec<Signature>,
    state: Arc<StubState>,
}

fn bound<'a>(map: &'a BufferMap, name: &str) -> Result<&'a TensorBuffer> {
    map.get(name)
        .ok_or_else(|| EdgeLmError::Internal(format!("stub: buffer {name} not bound")))
}

fn read_i32(map: &BufferMap, name: &str) -> Result<Vec<i32>> {
    let guard = bound(map, name)?.lock()?;
    Ok(guard.as_slice::<i32>()?.to_vec())
}

fn read_f32(map: &BufferMap, name: &str) -> Result<Vec<f32>> {
    let guard = bound(map, name)?.lock()?;
    Ok(guard.as_slice::<f32>()?.to_vec())
}

/// Positions are zero-filled and then stamped consecutively from the chunk's
/// start step; the valid region is the leading run of consecutive values.
fn valid_prefix_len(positions: &[i32]) -> usize {
    if positions.is_empty() {
        return 0;
    }
    let mut n = 1;
    while n < positions.len() && positions[n] == positions[n - 1] + 1 {
        n += 1;
    }
    n
}

impl StubGraph {
    fn run_embedder(&self, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        let tokens = read_i32(inputs, "tokens")?;
        let mut guard = bound(outputs, "embeds")?.lock()?;
        let embeds = guard.as_mut_slice::<f32>()?;
        for (i, &token) in tokens.iter().enumerate() {
            embeds[i * EMBED_DIM] = token as f32;
        }
        Ok(())
    }

    fn run_rope(&self, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        let positions = read_i32(inputs, "input_pos")?;
        for name in [
            "pos_emb_cos",
            "pos_emb_sin",
            "pos_emb_local_cos",
            "pos_emb_local_sin",
        ] {
            let mut guard = bound(outputs, name)?.lock()?;
            let out = guard.as_mut_slice::<f32>()?;
            for (i, &pos) in positions.iter().enumerate() {
                out[i * ROPE_DIM] = pos as f32;
            }
        }
        Ok(())
    }

    fn run_mask(&self, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        let time_step = read_i32(inputs, "time_step")?[0];
        let _tokens = read_i32(inputs, "input_tokens")?;
        for name in ["mask_local", "mask_global"] {
            let mut guard = bound(outputs, name)?.lock()?;
            guard.as_mut_slice::<f32>()?[0] = time_step as f32;
        }
        Ok(())
    }

    fn run_llm_prefill(&self, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        let embeds = read_f32(inputs, "input_embeds")?;
        let per_position: Vec<f32> = embeds.iter().step_by(EMBED_DIM).copied().collect();
        *self.state.last_prefill_embeds.lock().unwrap() = per_position.clone();

        let quirk_name = format!("kv_cache_k_{QUIRK_LAYER}");
        *self.state.prefill_quirk_cache.lock().unwrap() =
            Some(bound(inputs, &quirk_name)?.duplicate());

        for layer in LAYERS {
            for prefix in ["kv_slice_k_", "kv_slice_v_"] {
                let mut guard = bound(outputs, &format!("{prefix}{layer}"))?.lock()?;
                let slice = guard.as_mut_slice::<f32>()?;
                slice.copy_from_slice(&per_position);
            }
        }
        Ok(())
    }

    fn run_llm_decode(&self, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        // The decode signature declares the quirk cache tensors as int16;
        // the executor must bind fresh buffers, never the prefill (float)
        // ones.
        let quirk_name = format!("kv_cache_k_{QUIRK_LAYER}");
        let quirk = bound(inputs, &quirk_name)?;
        if quirk.tensor_type().element_type() != ElementType::Int16 {
            return Err(EdgeLmError::Internal(format!(
                "stub: {quirk_name} bound with element type {} for decode",
                quirk.tensor_type().element_type()
            )));
        }
        if let Some(prefill_quirk) = self.state.prefill_quirk_cache.lock().unwrap().as_ref() {
            if quirk.shares_storage_with(prefill_quirk) {
                return Err(EdgeLmError::Internal(format!(
                    "stub: {quirk_name} aliases the prefill buffer"
                )));
            }
        }

        let embeds = read_f32(inputs, "input_embeds")?;
        let token = embeds[0] as i32;

        for layer in LAYERS {
            for prefix in ["kv_slice_k_", "kv_slice_v_"] {
                let mut guard = bound(outputs, &format!("{prefix}{layer}"))?.lock()?;
                guard.as_mut_slice::<f32>()?[0] = token as f32;
            }
        }

        let mut guard = bound(outputs, "logits")?.lock()?;
        let logits = guard.as_mut_slice::<i16>()?;
        match &*self.state.logits_mode.lock().unwrap() {
            LogitsMode::NextToken => {
                logits.fill(0);
                let next = (token + 1).rem_euclid(VOCAB_SIZE as i32) as usize;
                logits[next] = 100;
            }
            LogitsMode::AllEqual => logits.fill(42),
            LogitsMode::Fixed(values) => logits.copy_from_slice(values),
        }
        Ok(())
    }

    fn run_cache_update(&self, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        let positions = read_i32(inputs, "input_pos")?;
        let valid = valid_prefix_len(&positions);
        for layer in LAYERS {
            for (slice_prefix, cache_prefix) in
                [("kv_slice_k_", "kv_cache_k_"), ("kv_slice_v_", "kv_cache_v_")]
            {
                let slice = read_f32(inputs, &format!("{slice_prefix}{layer}"))?;
                let mut guard = bound(outputs, &format!("{cache_prefix}{layer}"))?.lock()?;
                let cache = guard.as_mut_slice::<f32>()?;
                for i in 0..valid {
                    cache[positions[i] as usize] = slice[i];
                }
            }
        }
        Ok(())
    }
}

impl CompiledGraph for StubGraph {
    fn signature(&self, name: &str) -> Result<&Signature> {
        self.signatures
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| EdgeLmError::NotFound(format!("unknown signature: {name}")))
    }

    fn run(&self, signature: &str, inputs: &BufferMap, outputs: &BufferMap) -> Result<()> {
        self.state.run_log.lock().unwrap().push(signature.to_string());
        match (self.kind, signature) {
            (GraphKind::Embedder, "prefill_embedder_128" | "decode_embedder") => {
                self.run_embedder(inputs, outputs)
            }
            (GraphKind::Aux, "prefill_rope_128" | "decode_rope") => self.run_rope(inputs, outputs),
            (GraphKind::Aux, "prefill_mask_128" | "decode_mask") => self.run_mask(inputs, outputs),
            (GraphKind::Aux, "prefill_cache_update_128" | "decode_cache_update") => {
                self.run_cache_update(inputs, outputs)
            }
            (GraphKind::Llm, "prefill_128") => self.run_llm_prefill(inputs, outputs),
            (GraphKind::Llm, "decode") => self.run_llm_decode(inputs, outputs),
            _ => Err(EdgeLmError::NotFound(format!(
                "stub: signature {signature} not runnable on this graph"
            ))),
        }
    }

    fn create_input_buffer(&self, signature: &str, input_name: &str) -> Result<TensorBuffer> {
        let spec = self
            .signature(signature)?
            .input(input_name)
            .ok_or_else(|| {
                EdgeLmError::NotFound(format!(
                    "signature {signature} has no input named {input_name}"
                ))
            })?
            .clone();
        let buffer = TensorBuffer::new(spec.tensor_type);
        self.state.allocated.lock().unwrap().insert(
            format!("{}/{signature}/{input_name}", self.kind.tag()),
            buffer.duplicate(),
        );
        Ok(buffer)
    }

    fn create_output_buffer(&self, signature: &str, output_name: &str) -> Result<TensorBuffer> {
        let spec = self
            .signature(signature)?
            .output(output_name)
            .ok_or_else(|| {
                EdgeLmError::NotFound(format!(
                    "signature {signature} has no output named {output_name}"
                ))
            })?
            .clone();
        let buffer = TensorBuffer::new(spec.tensor_type);
        self.state.allocated.lock().unwrap().insert(
            format!("{}/{signature}/{output_name}", self.kind.tag()),
            buffer.duplicate(),
        );
        Ok(buffer)
    }
}

/// Compiler producing stub graphs keyed by the model bytes.
pub struct StubCompiler {
    pub state: Arc<StubState>,
}

impl GraphCompiler for StubCompiler {
    fn compile(
        &self,
        _env: &Environment,
        model_bytes: &[u8],
        accelerator: Accelerator,
    ) -> Result<Box<dyn CompiledGraph>> {
        let (kind, signatures) = match model_bytes {
            b"LLM" => (GraphKind::Llm, llm_signatures()),
            b"AUX" => (GraphKind::Aux, aux_signatures()),
            b"EMB" => (GraphKind::Embedder, embedder_signatures()),
            _ => {
                return Err(EdgeLmError::DataLoss(
                    "stub: unrecognized model bytes".into(),
                ))
            }
        };
        self.state
            .compile_log
            .lock()
            .unwrap()
            .push((kind.tag().to_string(), accelerator));
        Ok(Box::new(StubGraph {
            kind,
            signatures,
            state: Arc::clone(&self.state),
        }))
    }
}

// ── Bundle fixtures ─────────────────────────────────────────────────────

/// Minimal stored-entry zip writer.
pub fn build_stored_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    let mut central: Vec<u8> = Vec::new();
    for (name, body) in entries {
        let local_offset = out.len() as u32;
        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&[20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(body);

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&[20, 0, 20, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        central.extend_from_slice(&0u32.to_le_bytes());
        central.extend_from_slice(&(body.len() as u32).to_le_bytes());
        central.extend_from_slice(&(body.len() as u32).to_le_bytes());
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0u8; 12]);
        central.extend_from_slice(&local_offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }
    let cd_offset = out.len() as u32;
    let cd_size = central.len() as u32;
    out.extend_from_slice(&central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    out.extend_from_slice(&cd_size.to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// Write a complete model bundle (three stub sub-models plus a tokenizer)
/// into `dir` and return its path.
pub fn write_model_bundle(dir: &std::path::Path, tokenizer_json: &str) -> PathBuf {
    let path = dir.join("model.task");
    let bytes = build_stored_zip(&[
        ("prefill_decode.tflite", b"LLM"),
        ("aux.tflite", b"AUX"),
        ("embedder.tflite", b"EMB"),
        ("tokenizer.json", tokenizer_json.as_bytes()),
    ]);
    std::fs::write(&path, bytes).unwrap();
    path
}

// ── Tokenizer fixtures ──────────────────────────────────────────────────

/// Vocabulary of sixteen single letters `a`..`p`, ids 0..15: one token per
/// stub-model vocab entry.
pub fn letters_tokenizer_json() -> String {
    let mut vocab = serde_json::Map::new();
    for (i, c) in ('a'..='p').enumerate() {
        vocab.insert(c.to_string(), serde_json::json!(i));
    }
    serde_json::json!({
        "model": { "vocab": vocab, "merges": [] }
    })
    .to_string()
}

/// Vocabulary for the phrase "How's it going?" plus byte-fallback tokens for
/// the euro sign (three UTF-8 bytes) and BOS/EOS specials.
pub fn phrase_tokenizer_json() -> String {
    serde_json::json!({
        "model": {
            "vocab": {
                "H": 0, "o": 1, "w": 2, "'": 3, "s": 4, " ": 5, "i": 6,
                "t": 7, "g": 8, "n": 9, "?": 10, "How": 11,
                "<0xE2>": 12, "<0x82>": 13, "<0xAC>": 14,
                "<bos>": 15, "<eos>": 16
            },
            "merges": ["H o", "Ho w"]
        }
    })
    .to_string()
}
